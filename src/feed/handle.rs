use crate::feed::client::FeedClient;
use crate::feed::registry::Unsubscribe;
use crate::feed::relay::{RelayEndpoint, RelayTab};
use crate::feed::topic::SubscriptionParams;
use crate::feed::types::{ConnectionState, FeedConfig, FeedEvent, FeedMode, FeedStats};
use tracing::{info, warn};

/// What a consumer holds: either its own socket or a port on the shared
/// relay. Both expose the same subscribe surface.
#[derive(Clone)]
pub enum FeedHandle {
    Direct(FeedClient),
    Relayed(RelayTab),
}

impl FeedHandle {
    /// Attaches to `relay` when one is given and reachable, otherwise opens
    /// a direct connection. Must be called inside a tokio runtime.
    pub fn open(config: FeedConfig, relay: Option<&RelayEndpoint>) -> Self {
        if let Some(endpoint) = relay {
            match RelayTab::attach(endpoint, &config) {
                Ok(tab) => {
                    info!("feed attached to shared relay");
                    return Self::Relayed(tab);
                }
                Err(error) => {
                    warn!(%error, "relay unavailable, falling back to a direct connection");
                }
            }
        }

        let client = FeedClient::new(config);
        client.connect();
        Self::Direct(client)
    }

    pub fn subscribe<F>(&self, params: SubscriptionParams, callback: F) -> Unsubscribe
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        match self {
            Self::Direct(client) => client.subscribe(params, callback),
            Self::Relayed(tab) => tab.subscribe(params, callback),
        }
    }

    pub fn stats(&self) -> FeedStats {
        match self {
            Self::Direct(client) => client.stats(),
            Self::Relayed(tab) => {
                tab.request_stats();
                tab.stats()
            }
        }
    }

    pub fn mode(&self) -> FeedMode {
        match self {
            Self::Direct(_) => FeedMode::Direct,
            Self::Relayed(_) => FeedMode::Relayed,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        match self {
            Self::Direct(client) => client.state(),
            Self::Relayed(tab) => tab.connection_state(),
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Direct(client) => client.shutdown().await,
            Self::Relayed(tab) => tab.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::types::FeedClientArgs;

    fn unreachable_config() -> FeedConfig {
        FeedClientArgs {
            ws_url: Some("ws://127.0.0.1:9".to_string()),
            reconnect_initial_delay_ms: Some(10),
            reconnect_max_delay_ms: Some(20),
            ..FeedClientArgs::default()
        }
        .normalize()
        .expect("test config should be valid")
    }

    #[tokio::test]
    async fn falls_back_to_direct_when_relay_is_gone() {
        let endpoint = RelayEndpoint::disconnected();
        let handle = FeedHandle::open(unreachable_config(), Some(&endpoint));

        assert_eq!(handle.mode(), FeedMode::Direct);
        assert_eq!(handle.stats().tabs, 1);
        handle.close().await;
        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn attaches_to_a_live_relay() {
        let config = unreachable_config();
        let endpoint = RelayEndpoint::spawn(config.clone());
        let handle = FeedHandle::open(config, Some(&endpoint));

        assert_eq!(handle.mode(), FeedMode::Relayed);
        assert_eq!(handle.stats().mode, FeedMode::Relayed);
        handle.close().await;
    }
}
