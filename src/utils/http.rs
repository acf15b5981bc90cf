// src/utils/http.rs

//! HTTP client utilities.

use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::{AppError, Result};
use crate::models::HttpConfig;

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(config: &HttpConfig) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| AppError::config(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AppError::config(format!("invalid header value for '{name}': {e}")))?;
        headers.insert(name, value);
    }

    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(config.timeout())
        .default_headers(headers)
        .build()?;
    Ok(client)
}

/// What a response status says about the requested item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Ok,
    Gone,
    Denied,
    Retryable,
}

/// Map an HTTP status onto the fetch taxonomy.
pub fn classify_status(status: StatusCode) -> StatusClass {
    match status.as_u16() {
        200..=299 => StatusClass::Ok,
        404 | 410 => StatusClass::Gone,
        401 | 403 => StatusClass::Denied,
        _ => StatusClass::Retryable,
    }
}
