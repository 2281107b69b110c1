use crate::feed::registry::{FeedCallback, SubscriptionRegistry};
use crate::feed::topic::{SubscriptionParams, TopicKey};
use crate::feed::types::{FeedEvent, InboundFrame};
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

const RATE_LIMIT_PHRASES: [&str; 3] = ["rate limit", "too many", "ratelimit"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// Duplicate subscribe. `key` is the topic the server echoed back, when
    /// it could be parsed.
    AlreadySubscribed { key: Option<TopicKey> },
    RateLimited,
    Other,
}

pub fn classify_server_error(text: &str) -> ServerErrorKind {
    let lower = text.to_ascii_lowercase();

    if lower.contains("already subscribed") {
        let key = text
            .find('{')
            .and_then(|start| serde_json::from_str::<SubscriptionParams>(&text[start..]).ok())
            .map(|params| params.topic_key());
        return ServerErrorKind::AlreadySubscribed { key };
    }

    if RATE_LIMIT_PHRASES
        .iter()
        .any(|phrase| lower.contains(phrase))
    {
        return ServerErrorKind::RateLimited;
    }

    ServerErrorKind::Other
}

/// What to do with one decoded frame. Computed under the client lock;
/// callbacks run after the lock is released.
pub enum RoutePlan {
    Heartbeat,
    Ack(Value),
    ServerError { kind: ServerErrorKind, text: String },
    Dispatch { event: FeedEvent, callbacks: Vec<FeedCallback> },
    Unrouted { channel: String },
}

pub fn plan_route(registry: &SubscriptionRegistry, frame: InboundFrame) -> RoutePlan {
    match frame {
        InboundFrame::Pong => RoutePlan::Heartbeat,
        InboundFrame::SubscriptionAck(data) => RoutePlan::Ack(data),
        InboundFrame::Error(text) => RoutePlan::ServerError {
            kind: classify_server_error(&text),
            text,
        },
        InboundFrame::Event(event) => {
            let callbacks = event
                .route()
                .map(|route| registry.callbacks_for_route(&route))
                .unwrap_or_default();
            if callbacks.is_empty() {
                RoutePlan::Unrouted {
                    channel: event.channel().to_string(),
                }
            } else {
                RoutePlan::Dispatch { event, callbacks }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub panicked: usize,
}

/// Invokes each callback in order. A panicking callback is logged and
/// skipped; the rest still run.
pub fn deliver(callbacks: &[FeedCallback], event: &FeedEvent) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    for callback in callbacks {
        match catch_unwind(AssertUnwindSafe(|| callback(event))) {
            Ok(()) => report.delivered += 1,
            Err(_) => {
                report.panicked += 1;
                error!(channel = event.channel(), "subscriber callback panicked");
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::types::{AllMids, Trade, TradeSide};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn trade(coin: &str) -> Trade {
        Trade {
            coin: coin.to_string(),
            side: TradeSide::Buy,
            px: 10.0,
            sz: 1.0,
            time: 1,
            tid: Some(7),
        }
    }

    #[test]
    fn classifies_duplicate_subscription_with_echoed_key() {
        let kind =
            classify_server_error(r#"Already subscribed: {"type":"l2Book","coin":"BTC"}"#);
        assert_eq!(
            kind,
            ServerErrorKind::AlreadySubscribed {
                key: Some(SubscriptionParams::l2_book("BTC").topic_key())
            }
        );
    }

    #[test]
    fn classifies_rate_limit_phrases() {
        assert_eq!(
            classify_server_error("Too many messages"),
            ServerErrorKind::RateLimited
        );
        assert_eq!(
            classify_server_error("Rate limit exceeded"),
            ServerErrorKind::RateLimited
        );
        assert_eq!(
            classify_server_error("Invalid subscription"),
            ServerErrorKind::Other
        );
    }

    #[test]
    fn panicking_callback_does_not_block_siblings() {
        let hits = Arc::new(AtomicUsize::new(0));
        let first = hits.clone();
        let last = hits.clone();
        let callbacks: Vec<FeedCallback> = vec![
            Arc::new(move |_event: &FeedEvent| {
                first.fetch_add(1, Ordering::SeqCst);
            }),
            Arc::new(|_event: &FeedEvent| panic!("subscriber bug")),
            Arc::new(move |_event: &FeedEvent| {
                last.fetch_add(1, Ordering::SeqCst);
            }),
        ];

        let report = deliver(&callbacks, &FeedEvent::Trades(vec![trade("BTC")]));
        assert_eq!(
            report,
            DeliveryReport {
                delivered: 2,
                panicked: 1
            }
        );
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn plans_dispatch_only_for_matching_topics() {
        let mut registry = SubscriptionRegistry::new(10);
        registry
            .subscribe(
                SubscriptionParams::trades("BTC"),
                Arc::new(|_event: &FeedEvent| {}),
            )
            .expect("subscribe should register");

        let matched = plan_route(
            &registry,
            InboundFrame::Event(FeedEvent::Trades(vec![trade("BTC")])),
        );
        assert!(matches!(matched, RoutePlan::Dispatch { ref callbacks, .. } if callbacks.len() == 1));

        let unmatched = plan_route(
            &registry,
            InboundFrame::Event(FeedEvent::AllMids(AllMids {
                mids: BTreeMap::new(),
            })),
        );
        assert!(matches!(unmatched, RoutePlan::Unrouted { .. }));
        assert!(matches!(
            plan_route(&registry, InboundFrame::Pong),
            RoutePlan::Heartbeat
        ));
    }
}
