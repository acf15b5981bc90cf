//! Utility functions and helpers.

pub mod http;
pub mod log;

use regex::Regex;
use url::Url;

/// Resolve a potentially relative URL against a base URL.
pub fn resolve_url(base: &Url, href: &str) -> String {
    base.join(href)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| href.to_string())
}

/// Extract an item id from a URL using the first capture group of `pattern`.
pub fn extract_item_id(pattern: &Regex, url: &str) -> Option<String> {
    pattern
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Fill `{key}` placeholders in a URL template.
///
/// Values are percent-encoded so ids and city names cannot break the URL.
pub fn fill_template(template: &str, values: &[(&str, &str)]) -> String {
    values.iter().fold(template.to_string(), |acc, (key, value)| {
        let encoded: String = url::form_urlencoded::byte_serialize(value.as_bytes()).collect();
        acc.replace(&format!("{{{key}}}"), &encoded)
    })
}
