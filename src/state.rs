use crate::feed::handle::FeedHandle;
use crate::feed::info::InfoClient;
use crate::feed::relay::RelayEndpoint;
use crate::feed::types::FeedConfig;
use parking_lot::Mutex;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct AppState {
    pub started_at: Instant,
    pub config: FeedConfig,
    pub relay: RelayEndpoint,
    pub feed: FeedHandle,
    pub info: InfoClient,
    cancellation_token: CancellationToken,
    cache_sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Wires the relay, the primary feed handle and the REST client. Must be
    /// called inside a tokio runtime.
    pub fn new(config: FeedConfig) -> Self {
        let cancellation_token = CancellationToken::new();
        let relay = RelayEndpoint::spawn(config.clone());
        let feed = FeedHandle::open(config.clone(), Some(&relay));
        let info = InfoClient::new(&config);
        let cache_sweeper = info.spawn_cache_sweeper(cancellation_token.child_token());

        Self {
            started_at: Instant::now(),
            config,
            relay,
            feed,
            info,
            cancellation_token,
            cache_sweeper: Mutex::new(Some(cache_sweeper)),
        }
    }

    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        self.feed.close().await;
        let sweeper = self.cache_sweeper.lock().take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
    }
}
