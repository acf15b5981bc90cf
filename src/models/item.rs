//! Item identity, snapshots and fetch outcomes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque item identifier, unique within one catalog.
pub type ItemId = String;

/// A single discovery partition (e.g. one city for one transaction type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    /// City or region slug understood by the source's search surface
    pub city: String,

    /// Transaction type ("sale", "rent", ...)
    pub operation: String,
}

impl Partition {
    pub fn new(city: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.city, self.operation)
    }
}

/// Last successfully processed state of an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// SHA-256 of the raw payload, hex encoded
    pub hash: String,

    /// When the payload was last fetched successfully
    pub fetched_at: DateTime<Utc>,

    /// When the item was last observed (fetch, discovery or verification)
    pub last_seen: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(hash: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            hash: hash.into(),
            fetched_at: at,
            last_seen: at,
        }
    }
}

/// Transient retry bookkeeping for one attempt cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Raw detail payload exactly as returned by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub body: String,
}

impl RawPayload {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }

    /// Content hash used for change detection.
    pub fn content_hash(&self) -> String {
        content_hash(self.body.as_bytes())
    }
}

/// SHA-256 of `bytes`, hex encoded.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Result of asking the source about a single item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The item exists; carries its current payload
    Found(RawPayload),
    /// The source definitively reports the item gone
    NotFound,
    /// Access denied, captcha, soft block: says nothing about existence
    Ambiguous(String),
    /// Network, timeout or parse trouble worth retrying
    Transient(String),
}
