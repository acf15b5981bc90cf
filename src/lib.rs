// src/lib.rs

//! Incremental re-crawl pipeline for listing catalogs.
//!
//! A coordinator discovers ids through the source's search surface, a pool
//! of workers fetches details and forwards changes downstream, and a
//! verifier re-checks items that stopped showing up in discovery. All
//! roles share one work queue.

pub mod app;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod queue;
pub mod services;
pub mod utils;
