use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

/// String-keyed cache with a TTL per entry. Expired entries are dropped
/// when read and by `sweep`.
#[derive(Debug, Clone)]
pub struct TtlCache<V> {
    entries: HashMap<String, CacheEntry<V>>,
}

impl<V> Default for TtlCache<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, key: &str, now: Instant) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) if entry.is_fresh(now) => Some(entry.value.clone()),
            Some(_) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&mut self, key: String, value: V, ttl: Duration, now: Instant) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: now,
                ttl,
            },
        );
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_fresh_entries_and_evicts_expired_on_read() {
        let now = Instant::now();
        let mut cache = TtlCache::new();
        cache.set("meta".to_string(), 1_u32, Duration::from_secs(10), now);

        assert_eq!(cache.get("meta", now + Duration::from_secs(9)), Some(1));
        assert_eq!(cache.get("meta", now + Duration::from_secs(10)), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let now = Instant::now();
        let mut cache = TtlCache::new();
        cache.set("candles".to_string(), "short", Duration::from_secs(10), now);
        cache.set("meta".to_string(), "long", Duration::from_secs(300), now);

        assert_eq!(cache.sweep(now + Duration::from_secs(60)), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("meta", now + Duration::from_secs(60)), Some("long"));
    }
}
