// src/services/http.rs

//! HTTP source adapter.
//!
//! Talks to the source's search surface, detail API and public listing
//! pages. Search pages are either JSON (ids located with JSON pointers) or
//! HTML (ids extracted from result links with a regex).

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Selector};
use serde_json::Value;

use crate::error::{AppError, Result};
use crate::models::{FetchOutcome, ItemId, Partition, RawPayload, SearchFormat, SourceConfig};
use crate::services::{DetailFetcher, ExistenceChecker, SearchPage, SearchSource};
use crate::utils::http::{StatusClass, classify_status};
use crate::utils::{extract_item_id, fill_template, resolve_url};

/// Source adapter over plain HTTP.
pub struct HttpSource {
    source: SourceConfig,
    client: Client,
    id_pattern: Regex,
}

impl HttpSource {
    /// Create a new adapter; selectors and the id pattern are validated up front.
    pub fn new(source: SourceConfig, client: Client) -> Result<Self> {
        let id_pattern = Regex::new(&source.id_pattern)
            .map_err(|e| AppError::config(format!("source.id_pattern: {e}")))?;
        Self::parse_selector(&source.link_selector)?;
        if let Some(removed) = &source.removed_selector {
            Self::parse_selector(removed)?;
        }

        Ok(Self {
            source,
            client,
            id_pattern,
        })
    }

    fn search_url(&self, partition: &Partition, page: u32) -> String {
        fill_template(
            &self.source.search_url,
            &[
                ("country", &self.source.country),
                ("city", &partition.city),
                ("operation", &partition.operation),
                ("page", &page.to_string()),
            ],
        )
    }

    fn item_url(&self, template: &str, id: &str) -> String {
        fill_template(template, &[("id", id), ("country", &self.source.country)])
    }

    /// GET `url` and classify the response. `page_form` enables the
    /// removed-listing check on HTML bodies.
    async fn classify(&self, url: &str, page_form: bool) -> FetchOutcome {
        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return FetchOutcome::Transient(format!("{url}: {e}")),
        };

        let status = response.status();
        match classify_status(status) {
            StatusClass::Gone => FetchOutcome::NotFound,
            StatusClass::Denied => FetchOutcome::Ambiguous(format!("{url}: HTTP {status}")),
            StatusClass::Retryable => FetchOutcome::Transient(format!("{url}: HTTP {status}")),
            StatusClass::Ok => match response.text().await {
                Ok(body) if page_form && self.is_removed_page(&body) => FetchOutcome::NotFound,
                Ok(body) => FetchOutcome::Found(RawPayload::new(body)),
                Err(e) => FetchOutcome::Transient(format!("{url}: {e}")),
            },
        }
    }

    fn is_removed_page(&self, body: &str) -> bool {
        let Some(removed) = &self.source.removed_selector else {
            return false;
        };
        match Self::parse_selector(removed) {
            Ok(selector) => Html::parse_document(body).select(&selector).next().is_some(),
            Err(_) => false,
        }
    }

    /// Parse a JSON search page.
    fn parse_json_page(&self, body: &str) -> Result<SearchPage> {
        let value: Value = serde_json::from_str(body)?;

        // An absent result array is how most sources render an empty page
        let ids = match value.pointer(&self.source.items_pointer) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| json_id(item.get(&self.source.id_field)?))
                .collect(),
            Some(other) => {
                return Err(AppError::validation(format!(
                    "{} is not an array but {}",
                    self.source.items_pointer,
                    json_kind(other)
                )));
            }
        };

        let total = self
            .source
            .total_pointer
            .as_deref()
            .and_then(|p| value.pointer(p))
            .and_then(Value::as_u64);

        Ok(SearchPage { ids, total })
    }

    /// Parse an HTML search page, keeping the first occurrence of each id.
    fn parse_html_page(&self, body: &str, page_url: &str) -> Result<SearchPage> {
        let base_url = url::Url::parse(page_url)?;
        let link_sel = Self::parse_selector(&self.source.link_selector)?;
        let document = Html::parse_document(body);

        let mut ids: Vec<ItemId> = Vec::new();
        for link in document.select(&link_sel) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let absolute = resolve_url(&base_url, href);
            if let Some(id) = extract_item_id(&self.id_pattern, &absolute) {
                if !ids.contains(&id) {
                    ids.push(id);
                }
            }
        }

        Ok(SearchPage { ids, total: None })
    }

    fn parse_selector(s: &str) -> Result<Selector> {
        Selector::parse(s).map_err(|e| AppError::selector(s, format!("{e:?}")))
    }
}

fn json_id(value: &Value) -> Option<ItemId> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Fold the outcomes of several equivalent URL forms into one verdict.
///
/// Any `Found` wins. `NotFound` only when every form said so. Everything
/// else is ambiguous, so a flaky form can never deactivate a live item.
pub fn combine_checks(outcomes: Vec<FetchOutcome>) -> FetchOutcome {
    if outcomes.is_empty() {
        return FetchOutcome::Ambiguous("no URL forms checked".to_string());
    }

    let mut reasons = Vec::new();
    let mut all_gone = true;
    for outcome in outcomes {
        match outcome {
            FetchOutcome::Found(payload) => return FetchOutcome::Found(payload),
            FetchOutcome::NotFound => reasons.push("not found".to_string()),
            FetchOutcome::Ambiguous(reason) | FetchOutcome::Transient(reason) => {
                all_gone = false;
                reasons.push(reason);
            }
        }
    }

    if all_gone {
        FetchOutcome::NotFound
    } else {
        FetchOutcome::Ambiguous(reasons.join("; "))
    }
}

#[async_trait]
impl SearchSource for HttpSource {
    async fn search_page(&self, partition: &Partition, page: u32) -> Result<SearchPage> {
        let url = self.search_url(partition, page);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::fetch(
                format!("search {partition} page {page}"),
                format!("HTTP {status}"),
            ));
        }

        let body = response.text().await?;
        match self.source.search_format {
            SearchFormat::Json => self.parse_json_page(&body),
            SearchFormat::Html => self.parse_html_page(&body, &url),
        }
    }
}

#[async_trait]
impl DetailFetcher for HttpSource {
    async fn fetch(&self, id: &str) -> Result<FetchOutcome> {
        let url = self.item_url(&self.source.detail_url, id);
        Ok(self.classify(&url, false).await)
    }
}

#[async_trait]
impl ExistenceChecker for HttpSource {
    async fn check(&self, id: &str) -> Result<FetchOutcome> {
        let mut outcomes = Vec::new();

        let detail = self.item_url(&self.source.detail_url, id);
        let outcome = self.classify(&detail, false).await;
        if matches!(outcome, FetchOutcome::Found(_)) {
            return Ok(outcome);
        }
        outcomes.push(outcome);

        for template in &self.source.page_urls {
            let url = self.item_url(template, id);
            let outcome = self.classify(&url, true).await;
            if matches!(outcome, FetchOutcome::Found(_)) {
                return Ok(outcome);
            }
            outcomes.push(outcome);
        }

        Ok(combine_checks(outcomes))
    }
}
