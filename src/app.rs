// src/app.rs

//! Wiring of concrete collaborators from a `Config`.
//!
//! Entry points (the CLI, tests, embedding services) build one `App` and
//! ask it for the pipeline roles.

use std::sync::Arc;

use crate::error::Result;
use crate::models::{Config, RunConfig};
use crate::pipeline::{
    Coordinator, CoordinatorSettings, LoopSettings, RunMode, Verifier, Worker, WorkerSettings,
};
use crate::queue::{self, WorkQueue};
use crate::services::{HttpSource, ListingNormalizer, Sink, build_sink};
use crate::utils::http::create_async_client;

pub struct App {
    pub config: Config,
    pub queue: Arc<dyn WorkQueue>,
    source: Arc<HttpSource>,
    sink: Arc<dyn Sink>,
}

impl App {
    /// Validate `config`, open the queue and build the HTTP collaborators.
    pub async fn build(config: Config) -> Result<Self> {
        config.validate()?;
        let client = create_async_client(&config.http)?;
        let source = Arc::new(HttpSource::new(config.source.clone(), client.clone())?);
        let sink = build_sink(&config, client)?;
        let queue = queue::open(&config.queue).await?;

        Ok(Self {
            config,
            queue,
            source,
            sink,
        })
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::new(
            self.queue.clone(),
            self.source.clone(),
            CoordinatorSettings::from_config(&self.config),
        )
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            self.queue.clone(),
            self.source.clone(),
            Arc::new(ListingNormalizer::new()),
            self.sink.clone(),
            WorkerSettings::from_config(&self.config),
        )
    }

    pub fn verifier(&self) -> Verifier {
        Verifier::new(
            self.queue.clone(),
            self.source.clone(),
            self.sink.clone(),
            WorkerSettings::from_config(&self.config),
        )
    }

    /// Loop settings for a pool configured by `run`.
    pub fn loop_settings(&self, run: &RunConfig) -> LoopSettings {
        LoopSettings {
            mode: RunMode::from_config(run),
            pop_timeout: self.config.queue.pop_timeout(),
            backoff: self.config.retry.clone(),
            stats_every: run.stats_every,
        }
    }

    /// Flush the queue; call once on exit.
    pub async fn close(&self) -> Result<()> {
        self.queue.close().await
    }
}
