use crate::error::FeedError;
use crate::feed::client::FeedClient;
use crate::feed::registry::{FeedCallback, SubscriptionRegistry, Unsubscribe, WireOp};
use crate::feed::router::deliver;
use crate::feed::topic::{SubscriptionParams, TopicKey};
use crate::feed::types::{
    ConnectionState, ConnectionStatus, FeedConfig, FeedEvent, FeedMode, FeedStats,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Messages exchanged between a tab and the relay over its port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayMessage {
    Init {
        #[serde(rename = "portId")]
        port_id: u64,
    },
    Connected,
    Disconnected,
    Message {
        channel: TopicKey,
        data: FeedEvent,
    },
    Subscribe {
        channel: TopicKey,
        data: SubscriptionParams,
    },
    Unsubscribe {
        channel: TopicKey,
    },
    /// The shared connection is at its subscription ceiling; the topic is
    /// opened once room frees up.
    Refused {
        channel: TopicKey,
    },
    Ping,
    Pong {
        data: Option<FeedStats>,
    },
    GetStats {
        data: Option<FeedStats>,
    },
}

pub(crate) enum RelayCommand {
    Attach {
        to_tab: mpsc::UnboundedSender<RelayMessage>,
    },
    FromTab {
        port_id: u64,
        message: RelayMessage,
    },
    Detach {
        port_id: u64,
    },
    Stats {
        reply: oneshot::Sender<FeedStats>,
    },
}

pub type UpstreamFactory = Arc<dyn Fn(FeedConfig) -> FeedClient + Send + Sync>;

fn connect_upstream(config: FeedConfig) -> FeedClient {
    let client = FeedClient::new(config);
    client.connect();
    client
}

/// Mailbox of the relay actor. The actor owns the only upstream
/// connection and stops once every endpoint and tab is gone.
#[derive(Clone)]
pub struct RelayEndpoint {
    commands: mpsc::UnboundedSender<RelayCommand>,
}

impl RelayEndpoint {
    pub fn spawn(config: FeedConfig) -> Self {
        Self::spawn_with(config, Arc::new(connect_upstream))
    }

    pub fn spawn_with(config: FeedConfig, factory: UpstreamFactory) -> Self {
        let (commands, mailbox) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let actor = RelayActor {
            config,
            factory,
            ports: HashMap::new(),
            topics: HashMap::new(),
            upstream: None,
            events_tx,
            next_port_id: 1,
        };
        tokio::spawn(actor.run(mailbox, events_rx));
        Self { commands }
    }

    pub fn is_available(&self) -> bool {
        !self.commands.is_closed()
    }

    pub async fn stats(&self) -> Result<FeedStats, FeedError> {
        let (reply, response) = oneshot::channel();
        self.send(RelayCommand::Stats { reply })?;
        response
            .await
            .map_err(|_| FeedError::ChannelClosed("relay stats reply"))
    }

    pub(crate) fn send(&self, command: RelayCommand) -> Result<(), FeedError> {
        self.commands
            .send(command)
            .map_err(|_| FeedError::RelayUnavailable("relay mailbox closed".to_string()))
    }

    #[cfg(test)]
    pub(crate) fn disconnected() -> Self {
        let (commands, _) = mpsc::unbounded_channel();
        Self { commands }
    }
}

struct RelayPort {
    to_tab: mpsc::UnboundedSender<RelayMessage>,
    topics: HashSet<TopicKey>,
    last_seen: Instant,
}

struct RelayTopic {
    params: SubscriptionParams,
    ports: BTreeSet<u64>,
    /// `None` while the upstream client is at its subscription ceiling.
    upstream: Option<Unsubscribe>,
}

struct Upstream {
    client: FeedClient,
    status: watch::Receiver<ConnectionStatus>,
    connected: bool,
}

struct RelayActor {
    config: FeedConfig,
    factory: UpstreamFactory,
    ports: HashMap<u64, RelayPort>,
    topics: HashMap<TopicKey, RelayTopic>,
    upstream: Option<Upstream>,
    events_tx: mpsc::UnboundedSender<(TopicKey, FeedEvent)>,
    next_port_id: u64,
}

async fn next_upstream_status(upstream: &mut Option<Upstream>) -> ConnectionStatus {
    match upstream {
        Some(upstream) => {
            if upstream.status.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
            upstream.status.borrow_and_update().clone()
        }
        None => std::future::pending().await,
    }
}

impl RelayActor {
    async fn run(
        mut self,
        mut mailbox: mpsc::UnboundedReceiver<RelayCommand>,
        mut events_rx: mpsc::UnboundedReceiver<(TopicKey, FeedEvent)>,
    ) {
        let mut sweep = tokio::time::interval(self.config.relay_ping_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = mailbox.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some((key, event)) = events_rx.recv() => self.fan_out(&key, event),
                status = next_upstream_status(&mut self.upstream) => self.broadcast_status(&status),
                _ = sweep.tick() => self.sweep(Instant::now()),
            }
        }

        self.teardown_upstream();
        debug!("relay actor stopped");
    }

    fn handle_command(&mut self, command: RelayCommand) {
        match command {
            RelayCommand::Attach { to_tab } => self.attach(to_tab),
            RelayCommand::FromTab { port_id, message } => self.from_tab(port_id, message),
            RelayCommand::Detach { port_id } => self.release_port(port_id),
            RelayCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn attach(&mut self, to_tab: mpsc::UnboundedSender<RelayMessage>) {
        let port_id = self.next_port_id;
        self.next_port_id += 1;

        let connected = self.ensure_upstream().1;
        let _ = to_tab.send(RelayMessage::Init { port_id });
        let _ = to_tab.send(if connected {
            RelayMessage::Connected
        } else {
            RelayMessage::Disconnected
        });

        self.ports.insert(
            port_id,
            RelayPort {
                to_tab,
                topics: HashSet::new(),
                last_seen: Instant::now(),
            },
        );
        info!(port_id, tabs = self.ports.len(), "relay port attached");
    }

    fn ensure_upstream(&mut self) -> (FeedClient, bool) {
        if let Some(upstream) = &self.upstream {
            return (upstream.client.clone(), upstream.connected);
        }

        info!("starting upstream feed connection for relay");
        let client = (self.factory)(self.config.clone());
        let status = client.status_updates();
        let connected = status.borrow().state == ConnectionState::Connected;
        self.upstream = Some(Upstream {
            client: client.clone(),
            status,
            connected,
        });
        (client, connected)
    }

    fn from_tab(&mut self, port_id: u64, message: RelayMessage) {
        let Some(port) = self.ports.get_mut(&port_id) else {
            debug!(port_id, "message from unknown relay port");
            return;
        };
        port.last_seen = Instant::now();

        match message {
            RelayMessage::Subscribe { data, .. } => self.subscribe_port(port_id, data),
            RelayMessage::Unsubscribe { channel } => self.unsubscribe_port(port_id, &channel),
            RelayMessage::Ping => {
                let stats = self.stats();
                self.send_to_port(port_id, RelayMessage::Pong { data: Some(stats) });
            }
            RelayMessage::GetStats { .. } => {
                let stats = self.stats();
                self.send_to_port(port_id, RelayMessage::GetStats { data: Some(stats) });
            }
            other => debug!(port_id, ?other, "ignoring relay message from tab"),
        }
    }

    fn subscribe_port(&mut self, port_id: u64, params: SubscriptionParams) {
        if let Err(error) = params.validate() {
            warn!(port_id, %error, "tab sent invalid subscription");
            return;
        }
        let key = params.topic_key();
        let Some(port) = self.ports.get_mut(&port_id) else {
            return;
        };
        if !port.topics.insert(key.clone()) {
            return;
        }

        if let Some(topic) = self.topics.get_mut(&key) {
            topic.ports.insert(port_id);
            debug!(%key, tabs = topic.ports.len(), "tab joined relayed topic");
            if topic.upstream.is_none() {
                self.send_to_port(port_id, RelayMessage::Refused { channel: key });
            }
            return;
        }

        self.topics.insert(
            key.clone(),
            RelayTopic {
                params,
                ports: BTreeSet::from([port_id]),
                upstream: None,
            },
        );
        if self.open_upstream(&key) {
            debug!(%key, "opened upstream topic for relay");
        } else {
            warn!(%key, "upstream at subscription capacity, topic waits for room");
            self.send_to_port(port_id, RelayMessage::Refused { channel: key });
        }
    }

    /// Returns false when the upstream client refused the topic.
    fn open_upstream(&mut self, key: &TopicKey) -> bool {
        let params = match self.topics.get(key) {
            Some(topic) if topic.upstream.is_some() => return true,
            Some(topic) => topic.params.clone(),
            None => return false,
        };

        let (client, _) = self.ensure_upstream();
        let events = self.events_tx.clone();
        let event_key = key.clone();
        let upstream = client.subscribe(params, move |event: &FeedEvent| {
            let _ = events.send((event_key.clone(), event.clone()));
        });
        if !upstream.is_active() {
            return false;
        }
        if let Some(topic) = self.topics.get_mut(key) {
            topic.upstream = Some(upstream);
        }
        true
    }

    fn open_waiting_topics(&mut self) {
        let waiting = self
            .topics
            .iter()
            .filter(|(_, topic)| topic.upstream.is_none())
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in waiting {
            if !self.open_upstream(&key) {
                break;
            }
            info!(%key, "waiting topic opened upstream");
        }
    }

    fn unsubscribe_port(&mut self, port_id: u64, key: &TopicKey) {
        let removed = self
            .ports
            .get_mut(&port_id)
            .is_some_and(|port| port.topics.remove(key));
        if removed {
            self.release_topic(port_id, key);
        }
    }

    fn release_topic(&mut self, port_id: u64, key: &TopicKey) {
        let Some(topic) = self.topics.get_mut(key) else {
            return;
        };
        topic.ports.remove(&port_id);
        if !topic.ports.is_empty() {
            return;
        }
        if let Some(topic) = self.topics.remove(key) {
            debug!(%key, "last tab left relayed topic");
            if let Some(upstream) = topic.upstream {
                upstream.call();
                self.open_waiting_topics();
            }
        }
    }

    fn release_port(&mut self, port_id: u64) {
        if let Some(port) = self.ports.remove(&port_id) {
            for key in &port.topics {
                self.release_topic(port_id, key);
            }
            info!(port_id, tabs = self.ports.len(), "relay port detached");
        }
        if self.ports.is_empty() {
            self.teardown_upstream();
        }
    }

    fn teardown_upstream(&mut self) {
        if let Some(upstream) = self.upstream.take() {
            self.topics.clear();
            upstream.client.destroy();
            info!("no tabs left, closed upstream feed connection");
        }
    }

    fn send_to_port(&self, port_id: u64, message: RelayMessage) -> bool {
        self.ports
            .get(&port_id)
            .is_some_and(|port| port.to_tab.send(message).is_ok())
    }

    fn fan_out(&mut self, key: &TopicKey, event: FeedEvent) {
        let Some(topic) = self.topics.get(key) else {
            return;
        };
        let dead = topic
            .ports
            .iter()
            .copied()
            .filter(|port_id| {
                !self.send_to_port(
                    *port_id,
                    RelayMessage::Message {
                        channel: key.clone(),
                        data: event.clone(),
                    },
                )
            })
            .collect::<Vec<_>>();
        for port_id in dead {
            warn!(port_id, "relay port unreachable, dropping it");
            self.release_port(port_id);
        }
    }

    fn broadcast_status(&mut self, status: &ConnectionStatus) {
        let connected = status.state == ConnectionState::Connected;
        let Some(upstream) = self.upstream.as_mut() else {
            return;
        };
        if upstream.connected == connected {
            return;
        }
        upstream.connected = connected;

        let message = if connected {
            RelayMessage::Connected
        } else {
            RelayMessage::Disconnected
        };
        for port in self.ports.values() {
            let _ = port.to_tab.send(message.clone());
        }
    }

    fn sweep(&mut self, now: Instant) {
        let timeout = self.config.relay_liveness_timeout;
        let stale = self
            .ports
            .iter()
            .filter(|(_, port)| {
                port.to_tab.is_closed() || now.saturating_duration_since(port.last_seen) > timeout
            })
            .map(|(port_id, _)| *port_id)
            .collect::<Vec<_>>();
        for port_id in stale {
            warn!(port_id, "relay port went silent, dropping it");
            self.release_port(port_id);
        }
    }

    fn stats(&self) -> FeedStats {
        let mut stats = match &self.upstream {
            Some(upstream) => upstream.client.stats(),
            None => FeedStats {
                mode: FeedMode::Relayed,
                state: ConnectionState::Disconnected,
                tabs: 0,
                messages_received: 0,
                active_subscriptions: 0,
                connected_at_ms: None,
                suspected_key_collisions: 0,
            },
        };
        stats.mode = FeedMode::Relayed;
        stats.tabs = self.ports.len();
        stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TabPhase {
    Uninitialized,
    Initialized,
    Connected,
    Disconnected,
}

impl TabPhase {
    pub fn connection_state(self) -> ConnectionState {
        match self {
            Self::Uninitialized | Self::Initialized => ConnectionState::Connecting,
            Self::Connected => ConnectionState::Connected,
            Self::Disconnected => ConnectionState::Disconnected,
        }
    }
}

struct TabCore {
    phase: TabPhase,
    port_id: Option<u64>,
    outbox: VecDeque<RelayMessage>,
    registry: SubscriptionRegistry,
    last_stats: Option<FeedStats>,
    messages_received: u64,
    refused: HashSet<TopicKey>,
    closed: bool,
}

struct TabShared {
    core: Mutex<TabCore>,
    endpoint: RelayEndpoint,
    cancel: CancellationToken,
}

impl TabShared {
    fn send_to_relay(&self, core: &mut TabCore, message: RelayMessage) {
        let Some(port_id) = core.port_id else {
            core.outbox.push_back(message);
            return;
        };
        if let Err(error) = self
            .endpoint
            .send(RelayCommand::FromTab { port_id, message })
        {
            warn!(%error, "relay unreachable from tab");
            core.phase = TabPhase::Disconnected;
        }
    }

    fn flush_pending(&self, core: &mut TabCore) {
        while let Some(pending) = core.registry.pop_pending() {
            let message = match pending.op {
                WireOp::Subscribe => RelayMessage::Subscribe {
                    channel: pending.key,
                    data: pending.params,
                },
                WireOp::Unsubscribe => RelayMessage::Unsubscribe {
                    channel: pending.key,
                },
            };
            self.send_to_relay(core, message);
        }
    }

    fn release(&self, key: &TopicKey, id: u64) {
        let mut core = self.core.lock();
        if core.registry.unsubscribe(key, id) {
            core.refused.remove(key);
            self.flush_pending(&mut core);
        }
    }

    fn handle_inbound(&self, message: RelayMessage) {
        let mut core = self.core.lock();
        match message {
            RelayMessage::Init { port_id } => {
                core.port_id = Some(port_id);
                core.phase = TabPhase::Initialized;
                let buffered = std::mem::take(&mut core.outbox);
                debug!(port_id, buffered = buffered.len(), "relay port initialised");
                for message in buffered {
                    self.send_to_relay(&mut core, message);
                }
            }
            RelayMessage::Connected => core.phase = TabPhase::Connected,
            RelayMessage::Disconnected => core.phase = TabPhase::Disconnected,
            RelayMessage::Message { channel, data } => {
                core.messages_received = core.messages_received.saturating_add(1);
                core.refused.remove(&channel);
                let callbacks = core.registry.callbacks_for_key(&channel);
                drop(core);
                deliver(&callbacks, &data);
            }
            RelayMessage::Refused { channel } => {
                warn!(%channel, "relay at subscription capacity, topic waiting for room");
                if core.registry.contains(&channel) {
                    core.refused.insert(channel);
                }
            }
            RelayMessage::Pong { data } | RelayMessage::GetStats { data } => {
                if let Some(stats) = data {
                    core.last_stats = Some(stats);
                }
            }
            other => debug!(?other, "ignoring relay message"),
        }
    }

    fn ping(&self) {
        let mut core = self.core.lock();
        if core.port_id.is_some() && !core.closed {
            self.send_to_relay(&mut core, RelayMessage::Ping);
        }
    }
}

/// A consumer's view of the relay: same subscribe surface as
/// `FeedClient`, but its wire is the relay port.
#[derive(Clone)]
pub struct RelayTab {
    shared: Arc<TabShared>,
}

impl RelayTab {
    /// Fails only when the relay mailbox is gone. Anything sent before the
    /// relay answers with `init` is buffered and replayed in order.
    pub fn attach(endpoint: &RelayEndpoint, config: &FeedConfig) -> Result<Self, FeedError> {
        let (to_tab, inbox) = mpsc::unbounded_channel();
        endpoint.send(RelayCommand::Attach { to_tab })?;

        let shared = Arc::new(TabShared {
            core: Mutex::new(TabCore {
                phase: TabPhase::Uninitialized,
                port_id: None,
                outbox: VecDeque::new(),
                registry: SubscriptionRegistry::new(config.max_subscriptions),
                last_stats: None,
                messages_received: 0,
                refused: HashSet::new(),
                closed: false,
            }),
            endpoint: endpoint.clone(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_tab_port(
            Arc::downgrade(&shared),
            inbox,
            config.relay_ping_interval,
            shared.cancel.clone(),
        ));
        Ok(Self { shared })
    }

    pub fn subscribe<F>(&self, params: SubscriptionParams, callback: F) -> Unsubscribe
    where
        F: Fn(&FeedEvent) + Send + Sync + 'static,
    {
        self.subscribe_callback(params, Arc::new(callback))
    }

    pub fn subscribe_callback(
        &self,
        params: SubscriptionParams,
        callback: FeedCallback,
    ) -> Unsubscribe {
        if let Err(error) = params.validate() {
            warn!(%error, "rejecting invalid subscription");
            return Unsubscribe::noop();
        }

        let registered = {
            let mut core = self.shared.core.lock();
            if core.closed {
                return Unsubscribe::noop();
            }
            let registered = core.registry.subscribe(params, callback);
            self.shared.flush_pending(&mut core);
            registered
        };

        let Some((key, id)) = registered else {
            return Unsubscribe::noop();
        };
        let shared: Weak<TabShared> = Arc::downgrade(&self.shared);
        Unsubscribe::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.release(&key, id);
            }
        })
    }

    /// Asks the relay for fresh diagnostics; the answer lands in `stats`.
    pub fn request_stats(&self) {
        let mut core = self.shared.core.lock();
        self.shared
            .send_to_relay(&mut core, RelayMessage::GetStats { data: None });
    }

    pub fn stats(&self) -> FeedStats {
        let core = self.shared.core.lock();
        match &core.last_stats {
            Some(stats) => FeedStats {
                mode: FeedMode::Relayed,
                state: core.phase.connection_state(),
                ..stats.clone()
            },
            None => FeedStats {
                mode: FeedMode::Relayed,
                state: core.phase.connection_state(),
                tabs: 0,
                messages_received: core.messages_received,
                active_subscriptions: core.registry.len(),
                connected_at_ms: None,
                suspected_key_collisions: 0,
            },
        }
    }

    pub fn phase(&self) -> TabPhase {
        self.shared.core.lock().phase
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.phase().connection_state()
    }

    pub fn port_id(&self) -> Option<u64> {
        self.shared.core.lock().port_id
    }

    pub fn buffered_messages(&self) -> usize {
        self.shared.core.lock().outbox.len()
    }

    /// Topics the relay could not open upstream yet.
    pub fn waiting_topics(&self) -> usize {
        self.shared.core.lock().refused.len()
    }

    /// Leaves the relay. The relay releases this tab's topics and closes the
    /// upstream connection if no tab remains.
    pub fn close(&self) {
        let port_id = {
            let mut core = self.shared.core.lock();
            if core.closed {
                return;
            }
            core.closed = true;
            core.phase = TabPhase::Disconnected;
            core.registry = SubscriptionRegistry::new(1);
            core.outbox.clear();
            core.refused.clear();
            core.port_id
        };
        self.shared.cancel.cancel();
        if let Some(port_id) = port_id {
            let _ = self.shared.endpoint.send(RelayCommand::Detach { port_id });
        }
    }
}

async fn run_tab_port(
    shared: Weak<TabShared>,
    mut inbox: mpsc::UnboundedReceiver<RelayMessage>,
    ping_interval: std::time::Duration,
    cancel: CancellationToken,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = inbox.recv() => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                match message {
                    Some(message) => shared.handle_inbound(message),
                    None => {
                        warn!("relay closed the tab port");
                        shared.core.lock().phase = TabPhase::Disconnected;
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.ping();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::types::FeedClientArgs;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const BTC_TRADES: &str =
        r#"{"channel":"trades","data":[{"coin":"BTC","side":"B","px":"65000","sz":"0.1","time":1}]}"#;

    fn relay_config() -> FeedConfig {
        FeedClientArgs {
            relay_ping_interval_ms: Some(50),
            relay_liveness_timeout_ms: Some(150),
            ..FeedClientArgs::default()
        }
        .normalize()
        .expect("relay config should be valid")
    }

    fn recording_factory() -> (UpstreamFactory, Arc<Mutex<Vec<FeedClient>>>) {
        let created = Arc::new(Mutex::new(Vec::new()));
        let sink = created.clone();
        let factory: UpstreamFactory = Arc::new(move |config: FeedConfig| {
            let client = FeedClient::new(config);
            sink.lock().push(client.clone());
            client
        });
        (factory, created)
    }

    fn upstream(created: &Arc<Mutex<Vec<FeedClient>>>) -> FeedClient {
        created
            .lock()
            .last()
            .cloned()
            .expect("relay should have created an upstream client")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn ingest(client: &FeedClient, raw: &str) {
        let mut payload = raw.as_bytes().to_vec();
        client.ingest(&mut payload);
    }

    #[test]
    fn relay_messages_use_the_port_wire_shape() {
        let init = serde_json::to_value(RelayMessage::Init { port_id: 3 })
            .expect("init should serialize");
        assert_eq!(init, json!({"type": "init", "portId": 3}));

        let subscribe = serde_json::to_value(RelayMessage::Subscribe {
            channel: SubscriptionParams::l2_book("BTC").topic_key(),
            data: SubscriptionParams::l2_book("BTC"),
        })
        .expect("subscribe should serialize");
        assert_eq!(
            subscribe,
            json!({"type": "subscribe", "channel": "l2Book:BTC", "data": {"type": "l2Book", "coin": "BTC"}})
        );

        let stats_request: RelayMessage =
            serde_json::from_value(json!({"type": "getStats", "data": null}))
                .expect("getStats should parse");
        assert_eq!(stats_request, RelayMessage::GetStats { data: None });
    }

    #[tokio::test]
    async fn tabs_share_one_upstream_topic() {
        let config = relay_config();
        let (factory, created) = recording_factory();
        let endpoint = RelayEndpoint::spawn_with(config.clone(), factory);

        let first_tab = RelayTab::attach(&endpoint, &config).expect("first tab should attach");
        let second_tab = RelayTab::attach(&endpoint, &config).expect("second tab should attach");
        let hits = Arc::new(AtomicUsize::new(0));
        let first_hits = hits.clone();
        let second_hits = hits.clone();
        let first = first_tab.subscribe(SubscriptionParams::trades("BTC"), move |_event| {
            first_hits.fetch_add(1, Ordering::SeqCst);
        });
        let second = second_tab.subscribe(SubscriptionParams::trades("BTC"), move |_event| {
            second_hits.fetch_add(1, Ordering::SeqCst);
        });

        wait_until(|| {
            let upstreams = created.lock().len();
            upstreams == 1 && upstream(&created).stats().active_subscriptions == 1
        })
        .await;

        ingest(&upstream(&created), BTC_TRADES);
        wait_until(|| hits.load(Ordering::SeqCst) == 2).await;

        first.call();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(upstream(&created).stats().active_subscriptions, 1);

        second.call();
        wait_until(|| upstream(&created).stats().active_subscriptions == 0).await;
        assert_eq!(created.lock().len(), 1);
    }

    #[tokio::test]
    async fn messages_sent_before_init_are_replayed_in_order() {
        let config = relay_config();
        let (factory, created) = recording_factory();
        let endpoint = RelayEndpoint::spawn_with(config.clone(), factory);

        let tab = RelayTab::attach(&endpoint, &config).expect("tab should attach");
        let book = tab.subscribe(SubscriptionParams::l2_book("ETH"), |_event| {});
        book.call();
        let _trades = tab.subscribe(SubscriptionParams::trades("ETH"), |_event| {});
        assert_eq!(tab.phase(), TabPhase::Uninitialized);
        assert_eq!(tab.buffered_messages(), 3);

        wait_until(|| tab.port_id().is_some() && tab.buffered_messages() == 0).await;
        wait_until(|| upstream(&created).stats().active_subscriptions == 1).await;
    }

    #[tokio::test]
    async fn last_tab_leaving_closes_the_upstream() {
        let config = relay_config();
        let (factory, created) = recording_factory();
        let endpoint = RelayEndpoint::spawn_with(config.clone(), factory);

        let first_tab = RelayTab::attach(&endpoint, &config).expect("first tab should attach");
        let second_tab = RelayTab::attach(&endpoint, &config).expect("second tab should attach");
        wait_until(|| first_tab.port_id().is_some() && second_tab.port_id().is_some()).await;

        first_tab.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!upstream(&created).is_destroyed());

        second_tab.close();
        wait_until(|| upstream(&created).is_destroyed()).await;
        let stats = endpoint.stats().await.expect("relay should answer stats");
        assert_eq!(stats.tabs, 0);
        assert_eq!(stats.mode, FeedMode::Relayed);
    }

    #[tokio::test]
    async fn silent_ports_are_swept() {
        let config = relay_config();
        let (factory, _created) = recording_factory();
        let endpoint = RelayEndpoint::spawn_with(config.clone(), factory);

        let (to_tab, _inbox) = mpsc::unbounded_channel();
        endpoint
            .send(RelayCommand::Attach { to_tab })
            .expect("relay should accept a raw port");
        let live_tab = RelayTab::attach(&endpoint, &config).expect("tab should attach");

        let stats = endpoint.stats().await.expect("relay should answer stats");
        assert_eq!(stats.tabs, 2);

        tokio::time::sleep(Duration::from_millis(400)).await;
        let stats = endpoint.stats().await.expect("relay should answer stats");
        assert_eq!(stats.tabs, 1);
        assert_eq!(live_tab.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn tab_stats_report_relayed_mode_and_tab_count() {
        let config = relay_config();
        let (factory, _created) = recording_factory();
        let endpoint = RelayEndpoint::spawn_with(config.clone(), factory);

        let first_tab = RelayTab::attach(&endpoint, &config).expect("first tab should attach");
        let _second_tab = RelayTab::attach(&endpoint, &config).expect("second tab should attach");
        first_tab.request_stats();

        wait_until(|| first_tab.stats().tabs == 2).await;
        assert_eq!(first_tab.stats().mode, FeedMode::Relayed);
    }

    #[tokio::test]
    async fn refused_topic_opens_once_upstream_capacity_frees() {
        const ETH_TRADES: &str =
            r#"{"channel":"trades","data":[{"coin":"ETH","side":"A","px":"3000","sz":"1","time":1}]}"#;
        let config = FeedClientArgs {
            max_subscriptions: Some(1),
            relay_ping_interval_ms: Some(50),
            relay_liveness_timeout_ms: Some(150),
            ..FeedClientArgs::default()
        }
        .normalize()
        .expect("relay config should be valid");
        let (factory, created) = recording_factory();
        let endpoint = RelayEndpoint::spawn_with(config.clone(), factory);

        let btc_tab = RelayTab::attach(&endpoint, &config).expect("btc tab should attach");
        let eth_tab = RelayTab::attach(&endpoint, &config).expect("eth tab should attach");
        wait_until(|| btc_tab.port_id().is_some() && eth_tab.port_id().is_some()).await;

        let btc = btc_tab.subscribe(SubscriptionParams::trades("BTC"), |_event| {});
        wait_until(|| upstream(&created).stats().active_subscriptions == 1).await;

        let eth_hits = Arc::new(AtomicUsize::new(0));
        let sink = eth_hits.clone();
        let eth = eth_tab.subscribe(SubscriptionParams::trades("ETH"), move |_event| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
        assert!(eth.is_active());
        wait_until(|| eth_tab.waiting_topics() == 1).await;
        assert_eq!(upstream(&created).stats().active_subscriptions, 1);

        btc.call();
        wait_until(|| {
            ingest(&upstream(&created), ETH_TRADES);
            eth_hits.load(Ordering::SeqCst) > 0
        })
        .await;
        assert_eq!(upstream(&created).stats().active_subscriptions, 1);
        assert_eq!(eth_tab.waiting_topics(), 0);
    }

    #[test]
    fn attach_fails_when_relay_is_gone() {
        let config = relay_config();
        let endpoint = RelayEndpoint::disconnected();
        assert!(!endpoint.is_available());
        assert!(matches!(
            RelayTab::attach(&endpoint, &config),
            Err(FeedError::RelayUnavailable(_))
        ));
    }
}
