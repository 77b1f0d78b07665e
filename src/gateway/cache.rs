// In-memory TTL cache for hot key_id -> (api key, merchant) lookups.
// Constructed once at startup and carried in the shared state; revocation
// invalidates the entry so a revoked key fails on the next request.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

use crate::store::models::{ApiKey, Merchant};

const DEFAULT_TTL: Duration = Duration::from_secs(60);

struct CacheEntry {
    key: ApiKey,
    merchant: Merchant,
    inserted_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() > ttl
    }
}

pub struct KeyCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl KeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            // The resolve path must observe revocations within one minute.
            ttl: ttl.min(DEFAULT_TTL),
        }
    }

    pub async fn get(&self, key_id: &str) -> Option<(ApiKey, Merchant)> {
        let entries = self.entries.read().await;
        let entry = entries.get(key_id)?;
        if entry.is_expired(self.ttl) {
            return None;
        }
        Some((entry.key.clone(), entry.merchant.clone()))
    }

    pub async fn insert(&self, key: ApiKey, merchant: Merchant) {
        let mut entries = self.entries.write().await;
        // Opportunistically drop expired entries so the map does not grow
        // with dead key ids.
        entries.retain(|_, e| !e.is_expired(self.ttl));
        entries.insert(
            key.key_id.clone(),
            CacheEntry { key, merchant, inserted_at: Instant::now() },
        );
    }

    pub async fn invalidate(&self, key_id: &str) {
        let mut entries = self.entries.write().await;
        if entries.remove(key_id).is_some() {
            debug!(key_id, "evicted revoked api key from cache");
        }
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn fixture() -> (ApiKey, Merchant) {
        let key = ApiKey {
            key_id: "pf_key_test".to_string(),
            merchant_id: 1,
            secret_hash: "$2b$04$hash".to_string(),
            label: "Default Key".to_string(),
            active: true,
            created_at: Utc::now(),
            last_used_at: None,
        };
        let merchant = Merchant {
            id: 1,
            user_id: 1,
            business_name: "Acme".to_string(),
            business_email: "ops@acme.test".to_string(),
            website: None,
            webhook_url: None,
            webhook_secret: "ab".repeat(32),
            active: true,
            created_at: Utc::now(),
        };
        (key, merchant)
    }

    #[tokio::test]
    async fn hit_miss_and_invalidate() {
        let cache = KeyCache::default();
        let (key, merchant) = fixture();

        assert!(cache.get("pf_key_test").await.is_none());
        cache.insert(key, merchant).await;
        let (cached, _) = cache.get("pf_key_test").await.unwrap();
        assert_eq!(cached.merchant_id, 1);

        cache.invalidate("pf_key_test").await;
        assert!(cache.get("pf_key_test").await.is_none());
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = KeyCache::new(Duration::from_millis(20));
        let (key, merchant) = fixture();
        cache.insert(key, merchant).await;
        assert!(cache.get("pf_key_test").await.is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("pf_key_test").await.is_none());
    }
}
