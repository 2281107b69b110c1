use crate::error::FeedError;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

pub type FeedWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const PING_FRAME: &str = r#"{"method":"ping"}"#;

pub async fn connect_feed_socket(ws_url: &str) -> Result<FeedWsStream, FeedError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(ws_url, Some(ws_config), true).await?;
    Ok(stream)
}

fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// POSTs one info request. A 429 comes back as `FeedError::RateLimited`
/// carrying the server's `Retry-After`, for the caller to retry.
pub async fn post_info(client: &Client, rest_url: &str, body: &Value) -> Result<Value, FeedError> {
    let response = client.post(rest_url).json(body).send().await?;
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);
        return Err(FeedError::RateLimited { retry_after });
    }

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FeedError::HttpStatus {
            status: status.as_u16(),
            body,
        });
    }

    Ok(response.json::<Value>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retry_after_accepts_delay_seconds_only() {
        assert_eq!(parse_retry_after(" 3 "), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[tokio::test]
    async fn maps_too_many_requests_to_rate_limited() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/info")
            .with_status(429)
            .with_header("retry-after", "3")
            .create_async()
            .await;

        let result = post_info(
            &Client::new(),
            &format!("{}/info", server.url()),
            &json!({"type": "meta"}),
        )
        .await;

        assert!(matches!(
            result,
            Err(FeedError::RateLimited {
                retry_after: Some(delay)
            }) if delay == Duration::from_secs(3)
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn surfaces_other_http_failures_with_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/info")
            .with_status(422)
            .with_body("bad request type")
            .create_async()
            .await;

        let result = post_info(
            &Client::new(),
            &format!("{}/info", server.url()),
            &json!({"type": "nope"}),
        )
        .await;

        assert!(matches!(
            result,
            Err(FeedError::HttpStatus { status: 422, ref body }) if body == "bad request type"
        ));
    }
}
