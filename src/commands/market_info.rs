use crate::error::FeedError;
use crate::feed::client::now_unix_ms;
use crate::feed::info::InfoRequest;
use crate::feed::types::{Candle, CandleWire};
use crate::state::AppState;
use serde::Deserialize;
use serde_json::Value;

pub const CANDLE_INTERVALS: [&str; 14] = [
    "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "8h", "12h", "1d", "3d", "1w", "1M",
];
pub const DEFAULT_CANDLE_LOOKBACK_MS: i64 = 24 * 60 * 60 * 1_000;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CandleSnapshotArgs {
    pub coin: Option<String>,
    pub interval: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandleSnapshotQuery {
    pub coin: String,
    pub interval: String,
    pub start_time: i64,
    pub end_time: i64,
}

impl CandleSnapshotArgs {
    pub fn normalize(self, now_ms: i64) -> Result<CandleSnapshotQuery, FeedError> {
        let coin = self.coin.unwrap_or_default().trim().to_string();
        if coin.is_empty() {
            return Err(FeedError::InvalidArgument(
                "coin must not be empty".to_string(),
            ));
        }

        let interval = self
            .interval
            .unwrap_or_else(|| "1m".to_string())
            .trim()
            .to_string();
        if !CANDLE_INTERVALS.contains(&interval.as_str()) {
            return Err(FeedError::InvalidArgument(format!(
                "interval must be one of {}",
                CANDLE_INTERVALS.join(", ")
            )));
        }

        let end_time = self.end_time.unwrap_or(now_ms);
        let start_time = self
            .start_time
            .unwrap_or(end_time.saturating_sub(DEFAULT_CANDLE_LOOKBACK_MS));
        if start_time < 0 || start_time >= end_time {
            return Err(FeedError::InvalidArgument(
                "startTime must be non-negative and before endTime".to_string(),
            ));
        }

        Ok(CandleSnapshotQuery {
            coin,
            interval,
            start_time,
            end_time,
        })
    }
}

pub async fn market_meta(state: &AppState) -> Result<Value, FeedError> {
    state.info.post(&InfoRequest::meta()).await
}

pub async fn candle_snapshot(
    state: &AppState,
    args: CandleSnapshotArgs,
) -> Result<Vec<Candle>, FeedError> {
    let query = args.normalize(now_unix_ms())?;
    let request = InfoRequest::candle_snapshot(
        &query.coin,
        &query.interval,
        query.start_time,
        query.end_time,
    );
    let raw = state.info.post(&request).await?;
    parse_candles(raw)
}

fn parse_candles(raw: Value) -> Result<Vec<Candle>, FeedError> {
    serde_json::from_value::<Vec<CandleWire>>(raw)?
        .into_iter()
        .map(Candle::try_from)
        .collect()
}
