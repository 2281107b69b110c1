use crate::error::FeedError;
use crate::feed::client::FeedClient;
use crate::feed::connection::{ConnectionAction, ConnectionEvent};
use crate::feed::exchange::{connect_feed_socket, FeedWsStream};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type FeedSink = SplitSink<FeedWsStream, Message>;

enum NextStep {
    Open,
    Wait(Duration),
    Park,
    Stop,
}

fn next_step(actions: &[ConnectionAction]) -> NextStep {
    let mut step = NextStep::Stop;
    for action in actions {
        match action {
            ConnectionAction::OpenSocket => return NextStep::Open,
            ConnectionAction::ScheduleReconnect(delay) => step = NextStep::Wait(*delay),
            ConnectionAction::GiveUp => step = NextStep::Park,
            _ => {}
        }
    }
    step
}

/// Owns the socket for one `FeedClient`: connects, pumps frames both ways,
/// and turns socket lifecycle into state machine events until cancelled.
pub async fn run_feed_connection(client: FeedClient) {
    let cancel_token = client.cancellation_token();
    let mut actions = client.apply(ConnectionEvent::Connect);

    loop {
        if cancel_token.is_cancelled() {
            break;
        }

        actions = match next_step(&actions) {
            NextStep::Open => run_session(&client, &cancel_token).await,
            NextStep::Wait(delay) => {
                debug!(delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => client.apply(ConnectionEvent::ReconnectDue),
                }
            }
            NextStep::Park => {
                warn!("feed connection parked until retry");
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = client.retry_requested() => client.apply(ConnectionEvent::Retry),
                }
            }
            NextStep::Stop => break,
        };
    }

    info!("feed connection task stopped");
}

async fn run_session(client: &FeedClient, cancel_token: &CancellationToken) -> Vec<ConnectionAction> {
    let ws_url = client.config().ws_url;
    let connected = tokio::select! {
        _ = cancel_token.cancelled() => return Vec::new(),
        result = connect_feed_socket(&ws_url) => result,
    };

    let websocket_stream = match connected {
        Ok(stream) => stream,
        Err(error) => return client.apply(ConnectionEvent::HandshakeFailed(error.to_string())),
    };
    client.apply(ConnectionEvent::HandshakeSucceeded);
    info!(url = %ws_url, "feed websocket connected");

    let (mut sink, mut stream) = websocket_stream.split();
    let heartbeat_period = client.config().heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_period, heartbeat_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retry_at: Option<Instant> = None;

    if let Err(error) = flush_outbound(client, &mut sink, &mut retry_at).await {
        return socket_failed(client, error);
    }

    loop {
        let retry_deadline = retry_at;
        let retry_due = async move {
            match retry_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel_token.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return Vec::new();
            }
            _ = client.outbound_ready() => {
                if let Err(error) = flush_outbound(client, &mut sink, &mut retry_at).await {
                    return socket_failed(client, error);
                }
            }
            _ = retry_due => {
                retry_at = None;
                if let Err(error) = flush_outbound(client, &mut sink, &mut retry_at).await {
                    return socket_failed(client, error);
                }
            }
            _ = heartbeat.tick() => {
                if let Some(frame) = client.heartbeat_frame(Instant::now()) {
                    if let Err(error) = sink.send(Message::Text(frame)).await {
                        return socket_failed(client, error.into());
                    }
                }
            }
            next_message = stream.next() => match next_message {
                Some(Ok(message)) => {
                    if handle_message(client, message) {
                        info!("feed websocket closed by server");
                        return client.apply(ConnectionEvent::SocketClosed);
                    }
                }
                Some(Err(error)) => return socket_failed(client, error.into()),
                None => return client.apply(ConnectionEvent::SocketClosed),
            },
        }
    }
}

/// Returns true when the server closed the socket.
fn handle_message(client: &FeedClient, message: Message) -> bool {
    match message {
        Message::Text(text_payload) => {
            let mut owned_payload = text_payload.into_bytes();
            client.ingest(owned_payload.as_mut_slice());
        }
        Message::Binary(mut binary_payload) => {
            client.ingest(binary_payload.as_mut_slice());
        }
        Message::Close(_) => return true,
        _ => {}
    }
    false
}

async fn flush_outbound(
    client: &FeedClient,
    sink: &mut FeedSink,
    retry_at: &mut Option<Instant>,
) -> Result<(), FeedError> {
    let now = Instant::now();
    let batch = client.drain_outbound(now);
    *retry_at = batch.retry_after.map(|wait| now + wait);
    for frame in batch.frames {
        sink.send(Message::Text(frame)).await?;
    }
    Ok(())
}

fn socket_failed(client: &FeedClient, error: FeedError) -> Vec<ConnectionAction> {
    warn!(%error, "feed websocket failed");
    client.apply(ConnectionEvent::SocketError(error.to_string()));
    client.apply(ConnectionEvent::SocketClosed)
}
