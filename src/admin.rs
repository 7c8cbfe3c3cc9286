//! Admin cache invalidation: scan-and-delete by key prefix.

use crate::cache::Cache;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Key prefixes covered by a full cache clear.
pub const CLEAR_PREFIXES: [&str; 5] = [
    "portfolio:summary:",
    "collection:",
    "ens:resolve:",
    "ens:lookup:",
    "nft_page:",
];

/// Keys scanned per cursor step.
const SCAN_BATCH: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct PatternCount {
    pub pattern: String,
    pub deleted: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearReport {
    pub patterns: Vec<PatternCount>,
    pub total: u64,
}

/// Clear every known cache namespace. One failing pattern does not stop
/// the others; its partial count is still reported.
pub async fn clear_all_known_caches(cache: &Arc<dyn Cache>) -> ClearReport {
    let mut patterns = Vec::with_capacity(CLEAR_PREFIXES.len());
    let mut total = 0u64;

    for prefix in CLEAR_PREFIXES {
        let deleted = clear_prefix(cache, prefix).await;
        total += deleted;
        patterns.push(PatternCount {
            pattern: format!("{prefix}*"),
            deleted,
        });
    }

    info!(total, "Cache clear finished");
    ClearReport { patterns, total }
}

async fn clear_prefix(cache: &Arc<dyn Cache>, prefix: &str) -> u64 {
    let mut deleted = 0u64;
    let mut cursor = 0u64;
    loop {
        let (next, keys) = match cache.scan_prefix(prefix, cursor, SCAN_BATCH).await {
            Ok(step) => step,
            Err(e) => {
                warn!(prefix, error = %e, "Scan failed, pattern aborted");
                return deleted;
            }
        };
        if !keys.is_empty() {
            match cache.del_many(&keys).await {
                Ok(n) => deleted += n,
                Err(e) => {
                    warn!(prefix, error = %e, "Pipeline delete failed, pattern aborted");
                    return deleted;
                }
            }
        }
        if next == 0 {
            return deleted;
        }
        cursor = next;
    }
}
