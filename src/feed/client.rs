use crate::feed::connection::{ConnectionAction, ConnectionEvent, ConnectionMachine, ReconnectPolicy};
use crate::feed::exchange::PING_FRAME;
use crate::feed::pipeline::run_feed_connection;
use crate::feed::rate_budget::{RateBudget, ViolationBackoff};
use crate::feed::registry::{FeedCallback, SubscriptionRegistry, Unsubscribe};
use crate::feed::router::{deliver, plan_route, DeliveryReport, RoutePlan, ServerErrorKind};
use crate::feed::topic::{SubscriptionParams, TopicKey};
use crate::feed::types::{
    parse_inbound_frame, ConnectionState, ConnectionStatus, FeedConfig, FeedEvent, FeedMode,
    FeedStats,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::futures::Notified;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type ErrorHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundBatch {
    pub frames: Vec<String>,
    /// Set when frames are still queued behind the message budget.
    pub retry_after: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered(DeliveryReport),
    Heartbeat,
    Ack,
    ServerError(ServerErrorKind),
    Discarded,
}

struct FeedCore {
    config: FeedConfig,
    machine: ConnectionMachine,
    registry: SubscriptionRegistry,
    message_budget: RateBudget,
    replayed: HashSet<TopicKey>,
    connected_at_ms: Option<i64>,
    messages_received: u64,
    suspected_key_collisions: u64,
    error_hook: Option<ErrorHook>,
}

struct FeedShared {
    core: Mutex<FeedCore>,
    outbound_ready: Notify,
    retry_requested: Notify,
    status_tx: watch::Sender<ConnectionStatus>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl FeedShared {
    fn release(&self, key: &TopicKey, id: u64) {
        let released = self.core.lock().registry.unsubscribe(key, id);
        if released {
            self.outbound_ready.notify_one();
        }
    }
}

/// One physical exchange connection shared by every local subscriber.
/// Cloning is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct FeedClient {
    shared: Arc<FeedShared>,
}

impl FeedClient {
    pub fn new(config: FeedConfig) -> Self {
        let now = Instant::now();
        let machine = ConnectionMachine::new(ReconnectPolicy::from_config(&config));
        let message_budget = RateBudget::new(
            "ws_messages",
            config.message_limit,
            config.rate_window,
            ViolationBackoff::new(config.rate_limit_backoff_base, config.rate_limit_backoff_max),
            now,
        );
        let (status_tx, _) = watch::channel(machine.status());

        Self {
            shared: Arc::new(FeedShared {
                core: Mutex::new(FeedCore {
                    registry: SubscriptionRegistry::new(config.max_subscriptions),
                    config,
                    machine,
                    message_budget,
                    replayed: HashSet::new(),
                    connected_at_ms: None,
                    messages_received: 0,
                    suspected_key_collisions: 0,
                    error_hook: None,
                }),
                outbound_ready: Notify::new(),
                retry_requested: Notify::new(),
                status_tx,
                cancel: CancellationToken::new(),
                driver: Mutex::new(None),
            }),
        }
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
            if core.machine.is_destroyed() {
                debug!(key = %params.topic_key(), "subscribe after destroy ignored");
                return Unsubscribe::noop();
            }
            core.registry.subscribe(params, callback)
        };

        let Some((key, id)) = registered else {
            return Unsubscribe::noop();
        };
        self.shared.outbound_ready.notify_one();

        let shared: Weak<FeedShared> = Arc::downgrade(&self.shared);
        Unsubscribe::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.release(&key, id);
            }
        })
    }

    /// Feeds one lifecycle event through the state machine, performs the
    /// bookkeeping side of the resulting actions, and returns them so the
    /// socket owner can perform the I/O side.
    pub fn apply(&self, event: ConnectionEvent) -> Vec<ConnectionAction> {
        let mut reported = Vec::new();
        let (actions, status, hook, replayed) = {
            let mut core = self.shared.core.lock();
            let actions = core.machine.handle(event);
            let mut replayed = 0;

            for action in &actions {
                match action {
                    ConnectionAction::StartHeartbeat => {
                        core.connected_at_ms = Some(now_unix_ms());
                    }
                    ConnectionAction::ReplaySubscriptions => {
                        let keys = core.registry.replay();
                        replayed = keys.len();
                        core.replayed = keys.into_iter().collect();
                    }
                    ConnectionAction::StopHeartbeat | ConnectionAction::CloseSocket => {
                        core.connected_at_ms = None;
                        core.registry.clear_pending();
                        core.replayed.clear();
                    }
                    ConnectionAction::ReportError(reason) => reported.push(reason.clone()),
                    ConnectionAction::OpenSocket
                    | ConnectionAction::ScheduleReconnect(_)
                    | ConnectionAction::GiveUp => {}
                }
            }

            (
                actions,
                core.machine.status(),
                core.error_hook.clone(),
                replayed,
            )
        };

        if replayed > 0 {
            info!(topics = replayed, "replaying active subscriptions");
            self.shared.outbound_ready.notify_one();
        }
        self.shared.status_tx.send_replace(status);

        if let Some(hook) = hook {
            for reason in &reported {
                if catch_unwind(AssertUnwindSafe(|| hook(reason))).is_err() {
                    error!("feed error hook panicked");
                }
            }
        }

        actions
    }

    /// Pops as many queued wire operations as the message budget allows.
    pub fn drain_outbound(&self, now: Instant) -> OutboundBatch {
        let mut core = self.shared.core.lock();
        let mut batch = OutboundBatch::default();
        if core.machine.state() != ConnectionState::Connected {
            return batch;
        }

        while core.registry.peek_pending().is_some() {
            if !core.message_budget.try_consume(1, now) {
                let wait = core.message_budget.time_until_available(1, now);
                debug!(
                    queued = core.registry.pending_len(),
                    wait_ms = wait.as_millis() as u64,
                    "message budget exhausted, holding wire operations"
                );
                batch.retry_after = Some(wait);
                break;
            }
            let Some(pending) = core.registry.pop_pending() else {
                break;
            };
            debug!(key = %pending.key, op = ?pending.op, "sending wire operation");
            batch.frames.push(pending.to_frame().to_string());
        }

        // Sending again after a backoff ends the run of consecutive violations.
        if !batch.frames.is_empty() {
            core.message_budget.clear_violations();
        }
        batch
    }

    /// A ping frame when connected and the budget allows; otherwise the beat
    /// is skipped rather than queued.
    pub fn heartbeat_frame(&self, now: Instant) -> Option<String> {
        let mut core = self.shared.core.lock();
        if core.machine.state() != ConnectionState::Connected {
            return None;
        }
        if core.message_budget.try_consume(1, now) {
            Some(PING_FRAME.to_string())
        } else {
            debug!("message budget exhausted, skipping heartbeat");
            None
        }
    }

    pub fn ingest(&self, payload: &mut [u8]) -> RouteOutcome {
        let frame = match parse_inbound_frame(payload) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%error, "discarding malformed frame");
                return RouteOutcome::Discarded;
            }
        };

        let plan = {
            let mut core = self.shared.core.lock();
            core.messages_received = core.messages_received.saturating_add(1);
            let plan = plan_route(&core.registry, frame);
            if let RoutePlan::ServerError { kind, text } = &plan {
                handle_server_error(&mut core, kind, text);
            }
            plan
        };

        match plan {
            RoutePlan::Heartbeat => RouteOutcome::Heartbeat,
            RoutePlan::Ack(_) => RouteOutcome::Ack,
            RoutePlan::ServerError { kind, .. } => RouteOutcome::ServerError(kind),
            RoutePlan::Dispatch { event, callbacks } => {
                RouteOutcome::Delivered(deliver(&callbacks, &event))
            }
            RoutePlan::Unrouted { channel } => {
                debug!(%channel, "no subscriber for inbound frame");
                RouteOutcome::Discarded
            }
        }
    }

    pub fn on_error<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.shared.core.lock().error_hook = Some(Arc::new(hook));
    }

    pub fn stats(&self) -> FeedStats {
        let core = self.shared.core.lock();
        FeedStats {
            mode: FeedMode::Direct,
            state: core.machine.state(),
            tabs: 1,
            messages_received: core.messages_received,
            active_subscriptions: core.registry.len(),
            connected_at_ms: core.connected_at_ms,
            suspected_key_collisions: core.suspected_key_collisions,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core.lock().machine.state()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status_tx.borrow().clone()
    }

    pub fn status_updates(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn config(&self) -> FeedConfig {
        self.shared.core.lock().config.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.core.lock().machine.is_destroyed()
    }

    /// Starts the connection task. Calling it again while the task runs is a
    /// no-op. Must be called inside a tokio runtime.
    pub fn connect(&self) {
        let mut driver = self.shared.driver.lock();
        if driver.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        if self.is_destroyed() {
            debug!("connect after destroy ignored");
            return;
        }
        *driver = Some(tokio::spawn(run_feed_connection(self.clone())));
    }

    /// Restarts a connection that exhausted its reconnect attempts.
    pub fn retry(&self) {
        let gave_up = self.shared.core.lock().machine.has_given_up();
        if gave_up {
            self.shared.retry_requested.notify_one();
        } else {
            debug!("retry requested while connection is not parked");
        }
    }

    /// Terminal and idempotent: stops the connection and drops every
    /// subscription.
    pub fn destroy(&self) {
        if self.is_destroyed() {
            return;
        }
        self.apply(ConnectionEvent::Destroy);
        {
            let mut core = self.shared.core.lock();
            let max_topics = core.config.max_subscriptions;
            core.registry = SubscriptionRegistry::new(max_topics);
        }
        self.shared.cancel.cancel();
        info!("feed client destroyed");
    }

    /// `destroy` plus waiting for the connection task to finish.
    pub async fn shutdown(&self) {
        self.destroy();
        let handle = self.shared.driver.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub(crate) fn outbound_ready(&self) -> Notified<'_> {
        self.shared.outbound_ready.notified()
    }

    pub(crate) fn retry_requested(&self) -> Notified<'_> {
        self.shared.retry_requested.notified()
    }
}

fn handle_server_error(core: &mut FeedCore, kind: &ServerErrorKind, text: &str) {
    match kind {
        ServerErrorKind::AlreadySubscribed { key: Some(key) } if core.replayed.contains(key) => {
            debug!(%key, "duplicate subscribe during replay");
        }
        ServerErrorKind::AlreadySubscribed { key } => {
            core.suspected_key_collisions = core.suspected_key_collisions.saturating_add(1);
            warn!(
                key = key.as_ref().map(TopicKey::as_str),
                error = text,
                "server reports duplicate subscription outside replay, possible topic key collision"
            );
        }
        ServerErrorKind::RateLimited => {
            core.message_budget.record_violation(Instant::now(), None);
        }
        ServerErrorKind::Other => {
            warn!(error = text, "server error frame");
        }
    }
}

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
