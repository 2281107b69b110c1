use crate::error::FeedError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

const RESERVED_FIELDS: [&str; 6] = ["type", "coin", "interval", "user", "nSigFigs", "mantissa"];

/// Parameters of one logical subscription, exactly as they go on the wire
/// under `subscription`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct SubscriptionParams {
    pub topic_type: String,
    pub coin: Option<String>,
    pub interval: Option<String>,
    pub user: Option<String>,
    pub n_sig_figs: Option<u32>,
    pub mantissa: Option<u32>,
    pub extra: BTreeMap<String, Value>,
}

fn clean(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn clean_user(value: &str) -> Option<String> {
    clean(value).map(|user| user.to_ascii_lowercase())
}

impl SubscriptionParams {
    pub fn new(topic_type: &str) -> Self {
        Self {
            topic_type: topic_type.trim().to_string(),
            coin: None,
            interval: None,
            user: None,
            n_sig_figs: None,
            mantissa: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn all_mids() -> Self {
        Self::new("allMids")
    }

    pub fn l2_book(coin: &str) -> Self {
        Self::new("l2Book").with_coin(coin)
    }

    pub fn trades(coin: &str) -> Self {
        Self::new("trades").with_coin(coin)
    }

    pub fn candle(coin: &str, interval: &str) -> Self {
        Self::new("candle").with_coin(coin).with_interval(interval)
    }

    pub fn bbo(coin: &str) -> Self {
        Self::new("bbo").with_coin(coin)
    }

    pub fn user_fills(user: &str) -> Self {
        Self::new("userFills").with_user(user)
    }

    pub fn order_updates(user: &str) -> Self {
        Self::new("orderUpdates").with_user(user)
    }

    pub fn with_coin(mut self, coin: &str) -> Self {
        self.coin = clean(coin);
        self
    }

    pub fn with_interval(mut self, interval: &str) -> Self {
        self.interval = clean(interval);
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = clean_user(user);
        self
    }

    pub fn with_n_sig_figs(mut self, n_sig_figs: u32) -> Self {
        self.n_sig_figs = Some(n_sig_figs);
        self
    }

    pub fn with_mantissa(mut self, mantissa: u32) -> Self {
        self.mantissa = Some(mantissa);
        self
    }

    pub fn with_extra(mut self, name: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        if !value.is_null() {
            self.extra.insert(name.to_string(), value);
        }
        self
    }

    pub fn validate(&self) -> Result<(), FeedError> {
        if self.topic_type.is_empty() {
            return Err(FeedError::InvalidArgument(
                "subscription type must not be empty".to_string(),
            ));
        }
        for (name, value) in &self.extra {
            if RESERVED_FIELDS.contains(&name.as_str()) {
                return Err(FeedError::InvalidArgument(format!(
                    "'{name}' must be set through its dedicated field"
                )));
            }
            if !(value.is_string() || value.is_number() || value.is_boolean()) {
                return Err(FeedError::InvalidArgument(format!(
                    "subscription field '{name}' must be a scalar"
                )));
            }
        }
        Ok(())
    }

    pub fn topic_key(&self) -> TopicKey {
        let mut key = String::with_capacity(32);
        escape_component(&self.topic_type, &mut key);

        let positional = [&self.coin, &self.interval, &self.user];
        let used = positional
            .iter()
            .rposition(|slot| slot.is_some())
            .map_or(0, |index| index + 1);
        for slot in &positional[..used] {
            key.push(':');
            if let Some(value) = slot {
                escape_component(value, &mut key);
            }
        }

        let mut named: BTreeMap<&str, String> = BTreeMap::new();
        if let Some(n_sig_figs) = self.n_sig_figs {
            named.insert("nSigFigs", n_sig_figs.to_string());
        }
        if let Some(mantissa) = self.mantissa {
            named.insert("mantissa", mantissa.to_string());
        }
        for (name, value) in &self.extra {
            named.insert(name.as_str(), value.to_string());
        }
        for (name, value) in named {
            key.push(';');
            escape_component(name, &mut key);
            key.push('=');
            escape_component(&value, &mut key);
        }

        TopicKey(key)
    }

    pub fn to_wire_value(&self) -> Value {
        Value::from(self.clone())
    }

    /// True when `route` does not contradict this subscription. A field the
    /// payload does not carry never excludes an entry.
    pub fn matches_route(&self, route: &InboundRoute) -> bool {
        fn agrees(ours: &Option<String>, theirs: &Option<String>) -> bool {
            match (ours, theirs) {
                (Some(ours), Some(theirs)) => ours == theirs,
                _ => true,
            }
        }

        self.topic_type == route.topic_type
            && agrees(&self.coin, &route.coin)
            && agrees(&self.interval, &route.interval)
            && agrees(&self.user, &route.user)
    }
}

fn escape_component(raw: &str, out: &mut String) {
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            ';' => out.push_str("%3B"),
            '=' => out.push_str("%3D"),
            _ => out.push(ch),
        }
    }
}

fn string_field(object: &Map<String, Value>, name: &str) -> Result<Option<String>, FeedError> {
    match object.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(clean(value)),
        Some(_) => Err(FeedError::InvalidArgument(format!(
            "subscription field '{name}' must be a string"
        ))),
    }
}

fn u32_field(object: &Map<String, Value>, name: &str) -> Result<Option<u32>, FeedError> {
    match object.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .and_then(|raw| u32::try_from(raw).ok())
            .map(Some)
            .ok_or_else(|| {
                FeedError::InvalidArgument(format!(
                    "subscription field '{name}' must be a small unsigned integer"
                ))
            }),
    }
}

impl TryFrom<Value> for SubscriptionParams {
    type Error = FeedError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(object) = value else {
            return Err(FeedError::InvalidArgument(
                "subscription must be a json object".to_string(),
            ));
        };

        let topic_type = string_field(&object, "type")?.unwrap_or_default();
        let mut params = Self::new(&topic_type);
        params.coin = string_field(&object, "coin")?;
        params.interval = string_field(&object, "interval")?;
        params.user = string_field(&object, "user")?.map(|user| user.to_ascii_lowercase());
        params.n_sig_figs = u32_field(&object, "nSigFigs")?;
        params.mantissa = u32_field(&object, "mantissa")?;

        for (name, value) in object {
            if RESERVED_FIELDS.contains(&name.as_str()) || value.is_null() {
                continue;
            }
            params.extra.insert(name, value);
        }

        params.validate()?;
        Ok(params)
    }
}

impl From<SubscriptionParams> for Value {
    fn from(params: SubscriptionParams) -> Self {
        let mut object = Map::new();
        object.insert("type".to_string(), Value::String(params.topic_type));
        if let Some(coin) = params.coin {
            object.insert("coin".to_string(), Value::String(coin));
        }
        if let Some(interval) = params.interval {
            object.insert("interval".to_string(), Value::String(interval));
        }
        if let Some(user) = params.user {
            object.insert("user".to_string(), Value::String(user));
        }
        if let Some(n_sig_figs) = params.n_sig_figs {
            object.insert("nSigFigs".to_string(), Value::from(n_sig_figs));
        }
        if let Some(mantissa) = params.mantissa {
            object.insert("mantissa".to_string(), Value::from(mantissa));
        }
        object.extend(params.extra);
        Value::Object(object)
    }
}

/// Canonical identity of one wire subscription: `type[:coin][:interval][:user][;name=value...]`
/// with separators inside components percent-escaped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicKey(String);

impl TopicKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The topic fields an inbound payload carries about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRoute {
    pub topic_type: String,
    pub coin: Option<String>,
    pub interval: Option<String>,
    pub user: Option<String>,
}

impl InboundRoute {
    pub fn new(topic_type: &str) -> Self {
        Self {
            topic_type: topic_type.to_string(),
            coin: None,
            interval: None,
            user: None,
        }
    }

    pub fn with_coin(mut self, coin: &str) -> Self {
        self.coin = clean(coin);
        self
    }

    pub fn with_interval(mut self, interval: &str) -> Self {
        self.interval = clean(interval);
        self
    }

    pub fn with_user(mut self, user: &str) -> Self {
        self.user = clean_user(user);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_order_does_not_change_the_key() {
        let first: SubscriptionParams =
            serde_json::from_value(json!({"type": "candle", "coin": "BTC", "interval": "1m"}))
                .expect("params should parse");
        let second: SubscriptionParams =
            serde_json::from_value(json!({"interval": "1m", "coin": "BTC", "type": "candle"}))
                .expect("params should parse");

        assert_eq!(first.topic_key(), second.topic_key());
        assert_eq!(first.topic_key().as_str(), "candle:BTC:1m");
    }

    #[test]
    fn user_addresses_are_case_insensitive() {
        let lower = SubscriptionParams::user_fills("0xabcdef");
        let upper = SubscriptionParams::user_fills("0xABCDEF");
        assert_eq!(lower.topic_key(), upper.topic_key());
        assert_eq!(lower.topic_key().as_str(), "userFills:::0xabcdef");
    }

    #[test]
    fn precision_variants_get_distinct_keys() {
        let plain = SubscriptionParams::l2_book("BTC");
        let coarse = SubscriptionParams::l2_book("BTC")
            .with_n_sig_figs(3)
            .with_mantissa(5);

        assert_ne!(plain.topic_key(), coarse.topic_key());
        assert_eq!(coarse.topic_key().as_str(), "l2Book:BTC;mantissa=5;nSigFigs=3");
    }

    #[test]
    fn separators_inside_coin_names_cannot_collide() {
        let dex_coin = SubscriptionParams::new("candle").with_coin("xyz:TSLA");
        let coin_and_interval = SubscriptionParams::candle("xyz", "TSLA");
        assert_ne!(dex_coin.topic_key(), coin_and_interval.topic_key());
    }

    #[test]
    fn extra_scalars_are_typed_in_the_key() {
        let text = SubscriptionParams::all_mids().with_extra("dex", "1");
        let number = SubscriptionParams::all_mids().with_extra("dex", 1);
        assert_ne!(text.topic_key(), number.topic_key());
    }

    #[test]
    fn rejects_nested_extra_fields() {
        let result: Result<SubscriptionParams, _> =
            serde_json::from_value(json!({"type": "webData2", "filter": {"a": 1}}));
        assert!(result.is_err());
    }

    #[test]
    fn wire_value_round_trips_through_the_key() {
        let params = SubscriptionParams::l2_book("ETH").with_n_sig_figs(4);
        let wire = params.to_wire_value();
        assert_eq!(wire, json!({"type": "l2Book", "coin": "ETH", "nSigFigs": 4}));

        let parsed = SubscriptionParams::try_from(wire).expect("wire value should parse");
        assert_eq!(parsed.topic_key(), params.topic_key());
    }

    #[test]
    fn route_matches_every_precision_variant_of_a_book() {
        let route = InboundRoute::new("l2Book").with_coin("BTC");
        assert!(SubscriptionParams::l2_book("BTC").matches_route(&route));
        assert!(SubscriptionParams::l2_book("BTC")
            .with_n_sig_figs(2)
            .matches_route(&route));
        assert!(!SubscriptionParams::l2_book("ETH").matches_route(&route));
        assert!(!SubscriptionParams::trades("BTC").matches_route(&route));
    }

    #[test]
    fn userless_route_reaches_every_user_entry() {
        let route = InboundRoute::new("orderUpdates");
        assert!(SubscriptionParams::order_updates("0xaaa").matches_route(&route));
        assert!(SubscriptionParams::order_updates("0xbbb").matches_route(&route));
    }
}
