// src/services/sink.rs

//! Downstream sink backends.
//!
//! ## Local Layout
//!
//! ```text
//! {output_dir}/
//! ├── ingested.jsonl    # One ingest call per line
//! └── inactive.jsonl    # One mark-inactive call per line
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::models::{Config, NormalizedRecord, RawPayload, SinkKind};
use crate::services::Sink;

#[derive(Serialize)]
struct IngestBody<'a> {
    catalog: &'a str,
    id: &'a str,
    country: &'a str,
    record: &'a NormalizedRecord,
    /// Raw payload, kept verbatim when it is valid JSON
    raw: Value,
    ingested_at: String,
}

#[derive(Serialize)]
struct InactiveBody<'a> {
    catalog: &'a str,
    id: &'a str,
    country: &'a str,
    reason: &'a str,
    marked_at: String,
}

fn raw_value(raw: &RawPayload) -> Value {
    serde_json::from_str(&raw.body).unwrap_or_else(|_| Value::String(raw.body.clone()))
}

/// Sink that POSTs JSON to an ingestion API.
pub struct HttpSink {
    client: Client,
    ingest_url: String,
    inactive_url: String,
    token: Option<String>,
}

impl HttpSink {
    pub fn new(
        client: Client,
        ingest_url: impl Into<String>,
        inactive_url: Option<String>,
        token: Option<String>,
    ) -> Self {
        let ingest_url = ingest_url.into();
        let inactive_url = inactive_url
            .unwrap_or_else(|| format!("{}/inactive", ingest_url.trim_end_matches('/')));
        Self {
            client,
            ingest_url,
            inactive_url,
            token,
        }
    }

    async fn post<T: Serialize>(&self, url: &str, body: &T) -> Result<()> {
        let bytes = serde_json::to_vec(body)?;
        let mut request = self
            .client
            .post(url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(bytes);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::sink(format!("{url} returned {status}: {text}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn ingest(
        &self,
        catalog: &str,
        id: &str,
        country: &str,
        record: &NormalizedRecord,
        raw: &RawPayload,
    ) -> Result<()> {
        let body = IngestBody {
            catalog,
            id,
            country,
            record,
            raw: raw_value(raw),
            ingested_at: Utc::now().to_rfc3339(),
        };
        self.post(&self.ingest_url, &body).await
    }

    async fn mark_inactive(
        &self,
        catalog: &str,
        id: &str,
        country: &str,
        reason: &str,
    ) -> Result<()> {
        let body = InactiveBody {
            catalog,
            id,
            country,
            reason,
            marked_at: Utc::now().to_rfc3339(),
        };
        self.post(&self.inactive_url, &body).await
    }
}

/// Sink that appends JSON lines under an output directory.
pub struct LocalSink {
    output_dir: PathBuf,
    lock: Mutex<()>,
}

impl LocalSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn ingested_path(&self) -> PathBuf {
        self.output_dir.join("ingested.jsonl")
    }

    pub fn inactive_path(&self) -> PathBuf {
        self.output_dir.join("inactive.jsonl")
    }

    async fn append<T: Serialize>(&self, path: &Path, line: &T) -> Result<()> {
        let mut bytes = serde_json::to_vec(line)?;
        bytes.push(b'\n');

        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| AppError::sink(format!("{}: {e}", self.output_dir.display())))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| AppError::sink(format!("{}: {e}", path.display())))?;
        file.write_all(&bytes)
            .await
            .map_err(|e| AppError::sink(format!("{}: {e}", path.display())))?;
        file.flush()
            .await
            .map_err(|e| AppError::sink(format!("{}: {e}", path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl Sink for LocalSink {
    async fn ingest(
        &self,
        catalog: &str,
        id: &str,
        country: &str,
        record: &NormalizedRecord,
        raw: &RawPayload,
    ) -> Result<()> {
        let line = IngestBody {
            catalog,
            id,
            country,
            record,
            raw: raw_value(raw),
            ingested_at: Utc::now().to_rfc3339(),
        };
        self.append(&self.ingested_path(), &line).await
    }

    async fn mark_inactive(
        &self,
        catalog: &str,
        id: &str,
        country: &str,
        reason: &str,
    ) -> Result<()> {
        let line = InactiveBody {
            catalog,
            id,
            country,
            reason,
            marked_at: Utc::now().to_rfc3339(),
        };
        self.append(&self.inactive_path(), &line).await
    }
}

/// Build the sink described by the `[sink]` config section.
pub fn build_sink(config: &Config, client: Client) -> Result<Arc<dyn Sink>> {
    let sink = &config.sink;
    match sink.kind {
        SinkKind::Local => Ok(Arc::new(LocalSink::new(&sink.output_dir))),
        SinkKind::Http => {
            let ingest_url = sink
                .ingest_url
                .clone()
                .ok_or_else(|| AppError::config("sink.ingest_url is required for http sink"))?;
            Ok(Arc::new(HttpSink::new(
                client,
                ingest_url,
                sink.inactive_url.clone(),
                sink.token.clone(),
            )))
        }
    }
}
