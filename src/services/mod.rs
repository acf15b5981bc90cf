//! Collaborators the pipeline talks to, and their default implementations.
//!
//! - Discovery surface (`SearchSource`)
//! - Detail fetch (`DetailFetcher`)
//! - Authoritative existence check (`ExistenceChecker`)
//! - Payload mapping (`Normalizer`)
//! - Downstream ingestion (`Sink`)
//!
//! `HttpSource` covers the first three for JSON/HTML sources.

#[cfg(test)]
pub(crate) mod fakes;
mod http;
mod normalizer;
mod sink;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{FetchOutcome, ItemId, NormalizedRecord, Partition, RawPayload};

pub use http::{HttpSource, combine_checks};
pub use normalizer::ListingNormalizer;
pub use sink::{HttpSink, LocalSink, build_sink};

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    /// Ids in page order
    pub ids: Vec<ItemId>,
    /// Total advertised by the source; informational only
    pub total: Option<u64>,
}

/// The source's search surface.
#[async_trait]
pub trait SearchSource: Send + Sync {
    /// Fetch page `page` (1-based) of a partition.
    async fn search_page(&self, partition: &Partition, page: u32) -> Result<SearchPage>;
}

/// Fetches the current detail payload of one item.
#[async_trait]
pub trait DetailFetcher: Send + Sync {
    /// `Err` is a transport failure and is treated like `FetchOutcome::Transient`.
    async fn fetch(&self, id: &str) -> Result<FetchOutcome>;
}

/// Direct existence check used by the verifier, bypassing search.
#[async_trait]
pub trait ExistenceChecker: Send + Sync {
    async fn check(&self, id: &str) -> Result<FetchOutcome>;
}

/// Pure mapping from a raw payload to the normalized record.
pub trait Normalizer: Send + Sync {
    fn normalize(&self, id: &str, raw: &RawPayload) -> Result<NormalizedRecord>;
}

/// Downstream system; both calls are idempotent upserts keyed by `(catalog, id)`.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn ingest(
        &self,
        catalog: &str,
        id: &str,
        country: &str,
        record: &NormalizedRecord,
        raw: &RawPayload,
    ) -> Result<()>;

    async fn mark_inactive(&self, catalog: &str, id: &str, country: &str, reason: &str)
    -> Result<()>;
}
