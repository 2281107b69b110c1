pub mod commands;
pub mod error;
pub mod feed;
pub mod state;

use commands::{feed_stats::feed_stats, health::health};
use error::FeedError;
use feed::topic::SubscriptionParams;
use feed::types::{FeedClientArgs, FeedEvent};
use state::AppState;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub fn run() -> Result<(), FeedError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = FeedClientArgs::from_env()?.normalize()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let state = AppState::new(config);
        let mids = state
            .feed
            .subscribe(SubscriptionParams::all_mids(), |event: &FeedEvent| {
                if let FeedEvent::AllMids(all_mids) = event {
                    info!(coins = all_mids.mids.len(), "mid prices updated");
                }
            });

        let report = health(&state);
        info!(status = report.status, connection = ?report.connection, "market feed started");

        tokio::signal::ctrl_c().await?;
        match feed_stats(&state).await {
            Ok(stats) => info!(
                messages = stats.messages_received,
                subscriptions = stats.active_subscriptions,
                tabs = stats.tabs,
                "shutting down market feed"
            ),
            Err(error) => warn!(%error, "feed stats unavailable during shutdown"),
        }

        mids.call();
        state.shutdown().await;
        Ok::<(), FeedError>(())
    })
}
