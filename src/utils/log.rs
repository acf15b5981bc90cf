// src/utils/log.rs

//! Log formatting helpers on top of the `log` facade.

use crate::models::PipelineStats;

/// Log a summary section
pub fn summary(title: &str, items: &[(&str, String)]) {
    log::info!("[SUMMARY] {}", title);
    for (key, value) in items {
        log::info!("    {}: {}", key, value);
    }
}

/// Log the pipeline counters under `title`.
pub fn stats(title: &str, stats: &PipelineStats) {
    summary(title, &stats.summary_items());
}
