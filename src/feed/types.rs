use crate::error::FeedError;
use crate::feed::topic::InboundRoute;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_WS_URL: &str = "wss://api.hyperliquid.xyz/ws";
pub const DEFAULT_REST_URL: &str = "https://api.hyperliquid.xyz/info";
pub const DEFAULT_ENVIRONMENT: FeedEnvironment = FeedEnvironment::Production;
pub const DEFAULT_MESSAGE_LIMIT: u32 = 1_800;
pub const DEFAULT_WEIGHT_LIMIT: u32 = 1_200;
pub const DEFAULT_RATE_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_INITIAL_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_DEV_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_PROD_MAX_RECONNECT_ATTEMPTS: u32 = 20;
pub const DEFAULT_MAX_SUBSCRIPTIONS: usize = 1_000;
pub const DEFAULT_RATE_LIMIT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_RATE_LIMIT_BACKOFF_MAX_MS: u64 = 60_000;
pub const DEFAULT_RELAY_PING_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_RELAY_LIVENESS_TIMEOUT_MS: u64 = 35_000;

pub const SERVER_MESSAGE_LIMIT: u32 = 2_000;
pub const SERVER_SUBSCRIPTION_LIMIT: usize = 1_000;
pub const MAX_WEIGHT_LIMIT: u32 = 1_200;
pub const MIN_RATE_WINDOW_MS: u64 = 1_000;
pub const MAX_RATE_WINDOW_MS: u64 = 600_000;
pub const MIN_HEARTBEAT_INTERVAL_MS: u64 = 100;
pub const MAX_HEARTBEAT_INTERVAL_MS: u64 = 55_000;
pub const MIN_RECONNECT_DELAY_MS: u64 = 10;
pub const MAX_RECONNECT_DELAY_MS: u64 = 300_000;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 1_000;
pub const MIN_BACKOFF_MS: u64 = 10;
pub const MAX_BACKOFF_MS: u64 = 600_000;
pub const MIN_RELAY_INTERVAL_MS: u64 = 50;
pub const MAX_RELAY_INTERVAL_MS: u64 = 600_000;

const WS_URL_ENV: &str = "FEED_WS_URL";
const REST_URL_ENV: &str = "FEED_REST_URL";
const ENVIRONMENT_ENV: &str = "FEED_ENV";
const MESSAGE_LIMIT_ENV: &str = "FEED_MESSAGE_LIMIT";
const WEIGHT_LIMIT_ENV: &str = "FEED_WEIGHT_LIMIT";
const MAX_SUBSCRIPTIONS_ENV: &str = "FEED_MAX_SUBSCRIPTIONS";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedEnvironment {
    Development,
    Production,
}

impl FeedEnvironment {
    pub fn parse_str(value: &str) -> Result<Self, FeedError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(FeedError::InvalidArgument(format!(
                "unknown feed environment '{other}'"
            ))),
        }
    }

    pub fn default_max_reconnect_attempts(self) -> u32 {
        match self {
            Self::Development => DEFAULT_DEV_MAX_RECONNECT_ATTEMPTS,
            Self::Production => DEFAULT_PROD_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FeedMode {
    Direct,
    Relayed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub attempt: u32,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FeedStats {
    pub mode: FeedMode,
    pub state: ConnectionState,
    pub tabs: usize,
    pub messages_received: u64,
    pub active_subscriptions: usize,
    pub connected_at_ms: Option<i64>,
    pub suspected_key_collisions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FeedClientArgs {
    pub ws_url: Option<String>,
    pub rest_url: Option<String>,
    pub environment: Option<FeedEnvironment>,
    pub message_limit: Option<u32>,
    pub weight_limit: Option<u32>,
    pub rate_window_ms: Option<u64>,
    pub heartbeat_interval_ms: Option<u64>,
    pub reconnect_initial_delay_ms: Option<u64>,
    pub reconnect_max_delay_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub max_subscriptions: Option<usize>,
    pub rate_limit_backoff_base_ms: Option<u64>,
    pub rate_limit_backoff_max_ms: Option<u64>,
    pub relay_ping_interval_ms: Option<u64>,
    pub relay_liveness_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub ws_url: String,
    pub rest_url: String,
    pub environment: FeedEnvironment,
    pub message_limit: u32,
    pub weight_limit: u32,
    pub rate_window: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub max_subscriptions: usize,
    pub rate_limit_backoff_base: Duration,
    pub rate_limit_backoff_max: Duration,
    pub relay_ping_interval: Duration,
    pub relay_liveness_timeout: Duration,
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn normalize_url(value: Option<String>, default: &str, schemes: &[&str]) -> Result<String, FeedError> {
    let url = value.unwrap_or_else(|| default.to_string()).trim().to_string();
    if !schemes.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(FeedError::InvalidArgument(format!(
            "url '{url}' must start with one of {schemes:?}"
        )));
    }
    Ok(url)
}

fn bounded_ms(
    name: &str,
    value: Option<u64>,
    default: u64,
    min: u64,
    max: u64,
) -> Result<Duration, FeedError> {
    let value = value.unwrap_or(default);
    if !(min..=max).contains(&value) {
        return Err(FeedError::InvalidArgument(format!(
            "{name} must be between {min} and {max}"
        )));
    }
    Ok(Duration::from_millis(value))
}

impl FeedClientArgs {
    pub fn from_env() -> Result<Self, FeedError> {
        let mut args = Self {
            ws_url: env_value(WS_URL_ENV),
            rest_url: env_value(REST_URL_ENV),
            ..Self::default()
        };

        if let Some(raw) = env_value(ENVIRONMENT_ENV) {
            args.environment = Some(FeedEnvironment::parse_str(&raw)?);
        }
        if let Some(raw) = env_value(MESSAGE_LIMIT_ENV) {
            args.message_limit = Some(raw.parse().map_err(|_| {
                FeedError::InvalidArgument(format!("{MESSAGE_LIMIT_ENV} must be a number"))
            })?);
        }
        if let Some(raw) = env_value(WEIGHT_LIMIT_ENV) {
            args.weight_limit = Some(raw.parse().map_err(|_| {
                FeedError::InvalidArgument(format!("{WEIGHT_LIMIT_ENV} must be a number"))
            })?);
        }
        if let Some(raw) = env_value(MAX_SUBSCRIPTIONS_ENV) {
            args.max_subscriptions = Some(raw.parse().map_err(|_| {
                FeedError::InvalidArgument(format!("{MAX_SUBSCRIPTIONS_ENV} must be a number"))
            })?);
        }

        Ok(args)
    }

    pub fn normalize(self) -> Result<FeedConfig, FeedError> {
        let ws_url = normalize_url(self.ws_url, DEFAULT_WS_URL, &["ws://", "wss://"])?;
        let rest_url = normalize_url(self.rest_url, DEFAULT_REST_URL, &["http://", "https://"])?;
        let environment = self.environment.unwrap_or(DEFAULT_ENVIRONMENT);

        let message_limit = self.message_limit.unwrap_or(DEFAULT_MESSAGE_LIMIT);
        if !(1..=SERVER_MESSAGE_LIMIT).contains(&message_limit) {
            return Err(FeedError::InvalidArgument(format!(
                "messageLimit must be between 1 and {SERVER_MESSAGE_LIMIT}"
            )));
        }

        let weight_limit = self.weight_limit.unwrap_or(DEFAULT_WEIGHT_LIMIT);
        if !(1..=MAX_WEIGHT_LIMIT).contains(&weight_limit) {
            return Err(FeedError::InvalidArgument(format!(
                "weightLimit must be between 1 and {MAX_WEIGHT_LIMIT}"
            )));
        }

        let rate_window = bounded_ms(
            "rateWindowMs",
            self.rate_window_ms,
            DEFAULT_RATE_WINDOW_MS,
            MIN_RATE_WINDOW_MS,
            MAX_RATE_WINDOW_MS,
        )?;
        let heartbeat_interval = bounded_ms(
            "heartbeatIntervalMs",
            self.heartbeat_interval_ms,
            DEFAULT_HEARTBEAT_INTERVAL_MS,
            MIN_HEARTBEAT_INTERVAL_MS,
            MAX_HEARTBEAT_INTERVAL_MS,
        )?;
        let reconnect_initial_delay = bounded_ms(
            "reconnectInitialDelayMs",
            self.reconnect_initial_delay_ms,
            DEFAULT_RECONNECT_INITIAL_DELAY_MS,
            MIN_RECONNECT_DELAY_MS,
            MAX_RECONNECT_DELAY_MS,
        )?;
        let reconnect_max_delay = bounded_ms(
            "reconnectMaxDelayMs",
            self.reconnect_max_delay_ms,
            DEFAULT_RECONNECT_MAX_DELAY_MS,
            MIN_RECONNECT_DELAY_MS,
            MAX_RECONNECT_DELAY_MS,
        )?;
        if reconnect_max_delay < reconnect_initial_delay {
            return Err(FeedError::InvalidArgument(
                "reconnectMaxDelayMs must not be below reconnectInitialDelayMs".to_string(),
            ));
        }

        let max_reconnect_attempts = self
            .max_reconnect_attempts
            .unwrap_or_else(|| environment.default_max_reconnect_attempts());
        if !(1..=MAX_RECONNECT_ATTEMPTS).contains(&max_reconnect_attempts) {
            return Err(FeedError::InvalidArgument(format!(
                "maxReconnectAttempts must be between 1 and {MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let max_subscriptions = self.max_subscriptions.unwrap_or(DEFAULT_MAX_SUBSCRIPTIONS);
        if !(1..=SERVER_SUBSCRIPTION_LIMIT).contains(&max_subscriptions) {
            return Err(FeedError::InvalidArgument(format!(
                "maxSubscriptions must be between 1 and {SERVER_SUBSCRIPTION_LIMIT}"
            )));
        }

        let rate_limit_backoff_base = bounded_ms(
            "rateLimitBackoffBaseMs",
            self.rate_limit_backoff_base_ms,
            DEFAULT_RATE_LIMIT_BACKOFF_BASE_MS,
            MIN_BACKOFF_MS,
            MAX_BACKOFF_MS,
        )?;
        let rate_limit_backoff_max = bounded_ms(
            "rateLimitBackoffMaxMs",
            self.rate_limit_backoff_max_ms,
            DEFAULT_RATE_LIMIT_BACKOFF_MAX_MS,
            MIN_BACKOFF_MS,
            MAX_BACKOFF_MS,
        )?;
        if rate_limit_backoff_max < rate_limit_backoff_base {
            return Err(FeedError::InvalidArgument(
                "rateLimitBackoffMaxMs must not be below rateLimitBackoffBaseMs".to_string(),
            ));
        }

        let relay_ping_interval = bounded_ms(
            "relayPingIntervalMs",
            self.relay_ping_interval_ms,
            DEFAULT_RELAY_PING_INTERVAL_MS,
            MIN_RELAY_INTERVAL_MS,
            MAX_RELAY_INTERVAL_MS,
        )?;
        let relay_liveness_timeout = bounded_ms(
            "relayLivenessTimeoutMs",
            self.relay_liveness_timeout_ms,
            DEFAULT_RELAY_LIVENESS_TIMEOUT_MS,
            MIN_RELAY_INTERVAL_MS,
            MAX_RELAY_INTERVAL_MS,
        )?;
        if relay_liveness_timeout <= relay_ping_interval {
            return Err(FeedError::InvalidArgument(
                "relayLivenessTimeoutMs must exceed relayPingIntervalMs".to_string(),
            ));
        }

        Ok(FeedConfig {
            ws_url,
            rest_url,
            environment,
            message_limit,
            weight_limit,
            rate_window,
            heartbeat_interval,
            reconnect_initial_delay,
            reconnect_max_delay,
            max_reconnect_attempts,
            max_subscriptions,
            rate_limit_backoff_base,
            rate_limit_backoff_max,
            relay_ping_interval,
            relay_liveness_timeout,
        })
    }
}

// Inbound wire format.

#[derive(Debug, Deserialize)]
pub struct InboundEnvelopeWire {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AllMidsWire {
    pub mids: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct BookLevelWire {
    pub px: String,
    pub sz: String,
    #[serde(default)]
    pub n: u32,
}

#[derive(Debug, Deserialize)]
pub struct L2BookWire {
    pub coin: String,
    #[serde(default)]
    pub time: i64,
    pub levels: Vec<Vec<BookLevelWire>>,
}

#[derive(Debug, Deserialize)]
pub struct TradeWire {
    pub coin: String,
    pub side: String,
    pub px: String,
    pub sz: String,
    pub time: i64,
    #[serde(default)]
    pub tid: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CandleWire {
    #[serde(rename = "t")]
    pub open_time: i64,
    #[serde(rename = "T")]
    pub close_time: i64,
    #[serde(rename = "s")]
    pub coin: String,
    #[serde(rename = "i")]
    pub interval: String,
    pub o: String,
    pub h: String,
    pub l: String,
    pub c: String,
    pub v: String,
    #[serde(rename = "n", default)]
    pub trades: u64,
}

#[derive(Debug, Deserialize)]
pub struct BboWire {
    pub coin: String,
    #[serde(default)]
    pub time: i64,
    pub bbo: Vec<Option<BookLevelWire>>,
}

#[derive(Debug, Deserialize)]
pub struct FillWire {
    pub coin: String,
    pub px: String,
    pub sz: String,
    pub side: String,
    pub time: i64,
    #[serde(default)]
    pub oid: u64,
}

#[derive(Debug, Deserialize)]
pub struct UserFillsWire {
    pub user: String,
    #[serde(rename = "isSnapshot", default)]
    pub is_snapshot: bool,
    pub fills: Vec<FillWire>,
}

#[derive(Debug, Deserialize)]
pub struct OrderWire {
    pub coin: String,
    pub side: String,
    #[serde(rename = "limitPx")]
    pub limit_px: String,
    pub sz: String,
    pub oid: u64,
    pub timestamp: i64,
}

#[derive(Debug, Deserialize)]
pub struct OrderUpdateWire {
    pub order: OrderWire,
    pub status: String,
    #[serde(rename = "statusTimestamp")]
    pub status_timestamp: i64,
}

// Validated events handed to subscribers.

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn parse_str(value: &str) -> Result<Self, FeedError> {
        match value {
            "B" | "b" | "buy" | "BUY" => Ok(Self::Buy),
            "A" | "a" | "sell" | "SELL" => Ok(Self::Sell),
            other => Err(FeedError::MalformedFrame(format!("unknown side '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AllMids {
    pub mids: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BookLevel {
    pub px: f64,
    pub sz: f64,
    pub n: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct L2Book {
    pub coin: String,
    pub time: i64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub coin: String,
    pub side: TradeSide,
    pub px: f64,
    pub sz: f64,
    pub time: i64,
    pub tid: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub coin: String,
    pub interval: String,
    pub open_time: i64,
    pub close_time: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
    pub trades: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bbo {
    pub coin: String,
    pub time: i64,
    pub bid: Option<BookLevel>,
    pub ask: Option<BookLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub coin: String,
    pub px: f64,
    pub sz: f64,
    pub side: TradeSide,
    pub time: i64,
    pub oid: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserFills {
    pub user: String,
    pub is_snapshot: bool,
    pub fills: Vec<Fill>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    pub coin: String,
    pub side: TradeSide,
    pub limit_px: f64,
    pub sz: f64,
    pub oid: u64,
    pub status: String,
    pub status_timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum FeedEvent {
    AllMids(AllMids),
    L2Book(L2Book),
    Trades(Vec<Trade>),
    Candle(Candle),
    Bbo(Bbo),
    UserFills(UserFills),
    OrderUpdates(Vec<OrderUpdate>),
    Other { channel: String, data: Value },
}

fn parse_decimal(field: &str, raw: &str) -> Result<f64, FeedError> {
    let value = raw.parse::<f64>()?;
    if !value.is_finite() {
        return Err(FeedError::MalformedFrame(format!(
            "{field} must be finite, got '{raw}'"
        )));
    }
    Ok(value)
}

fn parse_size(field: &str, raw: &str) -> Result<f64, FeedError> {
    let value = parse_decimal(field, raw)?;
    if value < 0.0 {
        return Err(FeedError::MalformedFrame(format!(
            "{field} must be non-negative, got '{raw}'"
        )));
    }
    Ok(value)
}

impl TryFrom<BookLevelWire> for BookLevel {
    type Error = FeedError;

    fn try_from(value: BookLevelWire) -> Result<Self, Self::Error> {
        Ok(Self {
            px: parse_decimal("px", &value.px)?,
            sz: parse_size("sz", &value.sz)?,
            n: value.n,
        })
    }
}

impl TryFrom<AllMidsWire> for AllMids {
    type Error = FeedError;

    fn try_from(value: AllMidsWire) -> Result<Self, Self::Error> {
        let mut mids = BTreeMap::new();
        for (coin, raw) in value.mids {
            let mid = parse_decimal("mid", &raw)?;
            mids.insert(coin, mid);
        }
        Ok(Self { mids })
    }
}

impl TryFrom<L2BookWire> for L2Book {
    type Error = FeedError;

    fn try_from(value: L2BookWire) -> Result<Self, Self::Error> {
        if value.levels.len() != 2 {
            return Err(FeedError::MalformedFrame(format!(
                "l2Book expects two sides, got {}",
                value.levels.len()
            )));
        }
        let mut sides = value.levels.into_iter();
        let bids = sides
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(BookLevel::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        let asks = sides
            .next()
            .unwrap_or_default()
            .into_iter()
            .map(BookLevel::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            coin: value.coin,
            time: value.time,
            bids,
            asks,
        })
    }
}

impl TryFrom<TradeWire> for Trade {
    type Error = FeedError;

    fn try_from(value: TradeWire) -> Result<Self, Self::Error> {
        Ok(Self {
            side: TradeSide::parse_str(&value.side)?,
            px: parse_decimal("px", &value.px)?,
            sz: parse_size("sz", &value.sz)?,
            coin: value.coin,
            time: value.time,
            tid: value.tid,
        })
    }
}

impl TryFrom<CandleWire> for Candle {
    type Error = FeedError;

    fn try_from(value: CandleWire) -> Result<Self, Self::Error> {
        Ok(Self {
            o: parse_decimal("o", &value.o)?,
            h: parse_decimal("h", &value.h)?,
            l: parse_decimal("l", &value.l)?,
            c: parse_decimal("c", &value.c)?,
            v: parse_size("v", &value.v)?,
            coin: value.coin,
            interval: value.interval,
            open_time: value.open_time,
            close_time: value.close_time,
            trades: value.trades,
        })
    }
}

impl TryFrom<BboWire> for Bbo {
    type Error = FeedError;

    fn try_from(value: BboWire) -> Result<Self, Self::Error> {
        let mut sides = value.bbo.into_iter();
        let bid = sides.next().flatten().map(BookLevel::try_from).transpose()?;
        let ask = sides.next().flatten().map(BookLevel::try_from).transpose()?;
        Ok(Self {
            coin: value.coin,
            time: value.time,
            bid,
            ask,
        })
    }
}

impl TryFrom<FillWire> for Fill {
    type Error = FeedError;

    fn try_from(value: FillWire) -> Result<Self, Self::Error> {
        Ok(Self {
            px: parse_decimal("px", &value.px)?,
            sz: parse_size("sz", &value.sz)?,
            side: TradeSide::parse_str(&value.side)?,
            coin: value.coin,
            time: value.time,
            oid: value.oid,
        })
    }
}

impl TryFrom<UserFillsWire> for UserFills {
    type Error = FeedError;

    fn try_from(value: UserFillsWire) -> Result<Self, Self::Error> {
        let fills = value
            .fills
            .into_iter()
            .map(Fill::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            user: value.user.trim().to_ascii_lowercase(),
            is_snapshot: value.is_snapshot,
            fills,
        })
    }
}

impl TryFrom<OrderUpdateWire> for OrderUpdate {
    type Error = FeedError;

    fn try_from(value: OrderUpdateWire) -> Result<Self, Self::Error> {
        Ok(Self {
            side: TradeSide::parse_str(&value.order.side)?,
            limit_px: parse_decimal("limitPx", &value.order.limit_px)?,
            sz: parse_size("sz", &value.order.sz)?,
            coin: value.order.coin,
            oid: value.order.oid,
            status: value.status,
            status_timestamp: value.status_timestamp,
        })
    }
}

impl FeedEvent {
    pub fn from_channel(channel: &str, data: Value) -> Result<Self, FeedError> {
        let event = match channel {
            "allMids" => Self::AllMids(serde_json::from_value::<AllMidsWire>(data)?.try_into()?),
            "l2Book" => Self::L2Book(serde_json::from_value::<L2BookWire>(data)?.try_into()?),
            "trades" => Self::Trades(
                serde_json::from_value::<Vec<TradeWire>>(data)?
                    .into_iter()
                    .map(Trade::try_from)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            "candle" => Self::Candle(serde_json::from_value::<CandleWire>(data)?.try_into()?),
            "bbo" => Self::Bbo(serde_json::from_value::<BboWire>(data)?.try_into()?),
            "userFills" => {
                Self::UserFills(serde_json::from_value::<UserFillsWire>(data)?.try_into()?)
            }
            "orderUpdates" => Self::OrderUpdates(
                serde_json::from_value::<Vec<OrderUpdateWire>>(data)?
                    .into_iter()
                    .map(OrderUpdate::try_from)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            other => Self::Other {
                channel: other.to_string(),
                data,
            },
        };
        Ok(event)
    }

    pub fn channel(&self) -> &str {
        match self {
            Self::AllMids(_) => "allMids",
            Self::L2Book(_) => "l2Book",
            Self::Trades(_) => "trades",
            Self::Candle(_) => "candle",
            Self::Bbo(_) => "bbo",
            Self::UserFills(_) => "userFills",
            Self::OrderUpdates(_) => "orderUpdates",
            Self::Other { channel, .. } => channel,
        }
    }

    /// Topic fields carried by the payload itself. `None` means the frame
    /// cannot be attributed to any topic (e.g. an empty trades batch).
    pub fn route(&self) -> Option<InboundRoute> {
        let route = InboundRoute::new(self.channel());
        match self {
            Self::AllMids(_) | Self::OrderUpdates(_) => Some(route),
            Self::L2Book(book) => Some(route.with_coin(&book.coin)),
            Self::Trades(trades) => trades.first().map(|trade| route.with_coin(&trade.coin)),
            Self::Candle(candle) => Some(
                route
                    .with_coin(&candle.coin)
                    .with_interval(&candle.interval),
            ),
            Self::Bbo(bbo) => Some(route.with_coin(&bbo.coin)),
            Self::UserFills(fills) => Some(route.with_user(&fills.user)),
            Self::Other { data, .. } => {
                let mut route = route;
                if let Some(coin) = data.get("coin").and_then(Value::as_str) {
                    route = route.with_coin(coin);
                }
                if let Some(interval) = data.get("interval").and_then(Value::as_str) {
                    route = route.with_interval(interval);
                }
                if let Some(user) = data.get("user").and_then(Value::as_str) {
                    route = route.with_user(user);
                }
                Some(route)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Pong,
    Error(String),
    SubscriptionAck(Value),
    Event(FeedEvent),
}

pub const DEFAULT_CHANNEL: &str = "allMids";

pub fn parse_inbound_frame(payload: &mut [u8]) -> Result<InboundFrame, FeedError> {
    let wire: InboundEnvelopeWire = simd_json::serde::from_slice(payload)?;
    let channel = wire.channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string());

    match channel.as_str() {
        "pong" => Ok(InboundFrame::Pong),
        "error" => {
            let text = wire
                .error
                .or_else(|| match &wire.data {
                    Some(Value::String(text)) => Some(text.clone()),
                    Some(other) => Some(other.to_string()),
                    None => None,
                })
                .unwrap_or_default();
            Ok(InboundFrame::Error(text))
        }
        "subscriptionResponse" => Ok(InboundFrame::SubscriptionAck(
            wire.data.unwrap_or(Value::Null),
        )),
        _ => {
            let data = wire.data.ok_or_else(|| {
                FeedError::MalformedFrame(format!("channel '{channel}' frame without data"))
            })?;
            Ok(InboundFrame::Event(FeedEvent::from_channel(&channel, data)?))
        }
    }
}
