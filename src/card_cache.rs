use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

const TTL: Duration = Duration::from_secs(30);

/// Payload posted by the local national-ID card reader agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThaiCardData {
    pub citizen_id: String,
    pub first_name: String,
    pub last_name: String,
    pub first_name_en: Option<String>,
    pub last_name_en: Option<String>,
    pub birth_date: Option<String>,
    pub gender: Option<String>,
    pub address: Option<String>,
}

struct CachedCard {
    data: ThaiCardData,
    stored_at: Instant,
}

/// Single-slot in-process cache. The reader agent posts a card, the
/// registration page polls and consumes it exactly once; anything older
/// than 30 seconds is stale.
pub struct CardCache {
    inner: Mutex<Option<CachedCard>>,
}

impl CardCache {
    pub fn new() -> Self {
        CardCache {
            inner: Mutex::new(None),
        }
    }

    pub fn put(&self, data: ThaiCardData) {
        let mut slot = self.inner.lock().unwrap();
        *slot = Some(CachedCard {
            data,
            stored_at: Instant::now(),
        });
    }

    /// Consumes the cached card. Returns None when empty or expired.
    pub fn take(&self) -> Option<ThaiCardData> {
        let mut slot = self.inner.lock().unwrap();
        match slot.take() {
            Some(cached) if cached.stored_at.elapsed() < TTL => Some(cached.data),
            _ => None,
        }
    }
}

impl Default for CardCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(cid: &str) -> ThaiCardData {
        ThaiCardData {
            citizen_id: cid.to_string(),
            first_name: "Somchai".into(),
            last_name: "Jaidee".into(),
            first_name_en: None,
            last_name_en: None,
            birth_date: None,
            gender: None,
            address: None,
        }
    }

    #[test]
    fn take_consumes_once() {
        let cache = CardCache::new();
        cache.put(card("1101700203451"));
        assert!(cache.take().is_some());
        assert!(cache.take().is_none());
    }

    #[test]
    fn newer_card_replaces_older() {
        let cache = CardCache::new();
        cache.put(card("1101700203451"));
        cache.put(card("3509901234567"));
        assert_eq!(cache.take().unwrap().citizen_id, "3509901234567");
    }
}
