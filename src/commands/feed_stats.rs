use crate::error::FeedError;
use crate::feed::handle::FeedHandle;
use crate::feed::types::FeedStats;
use crate::state::AppState;

/// Diagnostics for the primary handle. In relayed mode the relay is asked
/// directly so the snapshot is never stale.
pub async fn feed_stats(state: &AppState) -> Result<FeedStats, FeedError> {
    match &state.feed {
        FeedHandle::Direct(client) => Ok(client.stats()),
        FeedHandle::Relayed(_) => state.relay.stats().await,
    }
}
