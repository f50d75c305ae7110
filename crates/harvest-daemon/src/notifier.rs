//! Operator notices delivered through the log.

use async_trait::async_trait;
use harvest_core::{Notifier, PassNotice};
use tracing::warn;

/// Writes pass notices as warnings.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notice: &PassNotice) {
        match &notice.aborted {
            Some(reason) => warn!("Harvest of {} aborted: {}", notice.endpoint, reason),
            None => warn!(
                "Harvest of {} finished with {} bad record(s)",
                notice.endpoint,
                notice.bad_records.len()
            ),
        }
        for bad in &notice.bad_records {
            warn!(
                "  {}: {}",
                bad.external_id,
                bad.reason.as_deref().unwrap_or("not returned by node")
            );
        }
    }
}
