use serde::ser::Serializer;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("json encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("json decode error: {0}")]
    SimdJson(#[from] simd_json::Error),
    #[error("float parse error: {0}")]
    ParseFloat(#[from] std::num::ParseFloatError),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("rate limited by server")]
    RateLimited { retry_after: Option<Duration> },
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(value))
    }
}

impl serde::Serialize for FeedError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_display_string() {
        let error = FeedError::InvalidArgument("coin must not be empty".to_string());
        let encoded = serde_json::to_string(&error).expect("error should serialize");
        assert_eq!(encoded, "\"invalid argument: coin must not be empty\"");
    }
}
