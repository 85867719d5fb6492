use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::session::SessionStore;
use crate::store::LocalStore;

/// Compact the local journal whenever appends since the last compaction
/// exceed `threshold`. Checked every `period`.
pub async fn run_compactor(store: Arc<LocalStore>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// One compactor pass. Returns true when the journal was rewritten.
pub async fn compact_if_due(store: &LocalStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends <= threshold {
        debug!(appends, threshold, "journal compaction not due");
        return false;
    }
    match store.compact().await {
        Ok(()) => {
            metrics::counter!(crate::observability::JOURNAL_COMPACTIONS_TOTAL).increment(1);
            info!(appends, "journal compacted");
            true
        }
        Err(e) => {
            warn!(appends, "journal compaction failed: {e}");
            false
        }
    }
}

/// Drop idle sessions every `period`.
pub async fn run_session_sweeper(sessions: Arc<SessionStore>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let swept = sessions.sweep_expired();
        if swept > 0 {
            info!(swept, remaining = sessions.len(), "expired sessions dropped");
        }
    }
}
