//! Merchant API credential store.
//!
//! Issues `pf_key_…` / `pf_sec_…` pairs, resolves Basic-auth credentials to
//! a merchant, and revokes keys. The secret is bcrypt-hashed at rest and
//! returned in plaintext exactly once, at issue time.

use std::sync::LazyLock;

use chrono::Utc;
use tracing::{debug, warn};

use crate::gateway::cache::KeyCache;
use crate::gateway::errors::GatewayError;
use crate::gateway::refs;
use crate::store::models::{ApiKey, Merchant};
use crate::store::{self, tables, Store};

/// Verified against when the key_id is unknown or inactive, so the failure
/// path costs the same as a wrong secret.
static DUMMY_HASH: LazyLock<String> = LazyLock::new(|| {
    bcrypt::hash("payflow.timing.pad", bcrypt::DEFAULT_COST)
        .expect("bcrypt hash of a fixed input")
});

pub struct IssuedKey {
    pub key_id: String,
    /// Plaintext secret; shown once, never persisted.
    pub key_secret: String,
    pub record: ApiKey,
}

pub fn issue_key(
    store: &Store,
    merchant_id: u64,
    label: Option<String>,
) -> Result<IssuedKey, GatewayError> {
    let key_id = refs::key_id();
    let key_secret = refs::key_secret();
    let secret_hash = bcrypt::hash(&key_secret, bcrypt::DEFAULT_COST)
        .map_err(|e| GatewayError::internal(format!("hash key secret: {e}")))?;

    let record = ApiKey {
        key_id: key_id.clone(),
        merchant_id,
        secret_hash,
        label: label.unwrap_or_else(|| "Default Key".to_string()),
        active: true,
        created_at: Utc::now(),
        last_used_at: None,
    };

    let wtx = store.begin_write()?;
    {
        let mut keys = wtx.open_table(tables::API_KEYS)?;
        store::put_doc(&mut keys, key_id.as_str(), &record)?;
        let mut by_merchant = wtx.open_multimap_table(tables::API_KEYS_BY_MERCHANT)?;
        by_merchant.insert(merchant_id, key_id.as_str())?;
    }
    wtx.commit().map_err(store::StoreError::from)?;

    debug!(key_id = %key_id, merchant_id, "issued api key");
    Ok(IssuedKey { key_id, key_secret, record })
}

/// Resolve Basic-auth credentials to the owning merchant.
///
/// Unknown key_id, revoked key, inactive merchant and wrong secret all
/// collapse into the same generic error, and every path performs exactly
/// one bcrypt verification.
pub async fn resolve_key(
    store: &Store,
    cache: &KeyCache,
    key_id: &str,
    key_secret: &str,
) -> Result<Merchant, GatewayError> {
    let looked_up = match cache.get(key_id).await {
        Some(hit) => Some(hit),
        None => load_key(store, key_id)?,
    };

    let (key, merchant) = match looked_up {
        Some(pair) => pair,
        None => {
            // Equalize timing with the found-key path.
            let _ = bcrypt::verify(key_secret, &DUMMY_HASH);
            return Err(GatewayError::Unauthenticated);
        }
    };

    let verified = bcrypt::verify(key_secret, &key.secret_hash).unwrap_or(false);
    if !verified || !key.active || !merchant.active {
        return Err(GatewayError::Unauthenticated);
    }

    cache.insert(key.clone(), merchant.clone()).await;
    touch_last_used(store, &key);
    Ok(merchant)
}

fn load_key(store: &Store, key_id: &str) -> Result<Option<(ApiKey, Merchant)>, GatewayError> {
    let rtx = store.begin_read()?;
    let keys = rtx.open_table(tables::API_KEYS).map_err(store::StoreError::from)?;
    let Some(key) = store::get_doc::<&str, ApiKey>(&keys, key_id)? else {
        return Ok(None);
    };
    let merchants = rtx.open_table(tables::MERCHANTS).map_err(store::StoreError::from)?;
    let Some(merchant) = store::get_doc::<u64, Merchant>(&merchants, key.merchant_id)? else {
        return Ok(None);
    };
    Ok(Some((key, merchant)))
}

/// Best-effort `last_used_at` bump; never part of the auth decision.
fn touch_last_used(store: &Store, key: &ApiKey) {
    let mut updated = key.clone();
    updated.last_used_at = Some(Utc::now());
    let result = (|| -> Result<(), store::StoreError> {
        let wtx = store.begin_write()?;
        {
            let mut keys = wtx.open_table(tables::API_KEYS)?;
            store::put_doc(&mut keys, key.key_id.as_str(), &updated)?;
        }
        wtx.commit()?;
        Ok(())
    })();
    if let Err(e) = result {
        warn!(key_id = %key.key_id, error = %e, "failed to bump last_used_at");
    }
}

/// Flip `active` off. The next resolve misses the cache and sees the
/// revoked row.
pub async fn revoke_key(
    store: &Store,
    cache: &KeyCache,
    merchant_id: u64,
    key_id: &str,
) -> Result<(), GatewayError> {
    let wtx = store.begin_write()?;
    {
        let mut keys = wtx.open_table(tables::API_KEYS)?;
        let Some(mut key) = store::get_doc::<&str, ApiKey>(&keys, key_id)? else {
            return Err(GatewayError::NotFound("api key"));
        };
        if key.merchant_id != merchant_id {
            return Err(GatewayError::NotFound("api key"));
        }
        key.active = false;
        store::put_doc(&mut keys, key_id, &key)?;
    }
    wtx.commit().map_err(store::StoreError::from)?;
    cache.invalidate(key_id).await;
    Ok(())
}

pub fn list_keys(store: &Store, merchant_id: u64) -> Result<Vec<ApiKey>, GatewayError> {
    let rtx = store.begin_read()?;
    let by_merchant = rtx
        .open_multimap_table(tables::API_KEYS_BY_MERCHANT)
        .map_err(store::StoreError::from)?;
    let keys = rtx.open_table(tables::API_KEYS).map_err(store::StoreError::from)?;
    let mut out = Vec::new();
    for key_id in store::str_refs(&by_merchant, merchant_id)? {
        if let Some(key) = store::get_doc::<&str, ApiKey>(&keys, key_id.as_str())? {
            out.push(key);
        }
    }
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::Merchant;

    fn seed_merchant(store: &Store, id: u64) {
        let merchant = Merchant {
            id,
            user_id: id,
            business_name: "Acme".to_string(),
            business_email: format!("ops{id}@acme.test"),
            website: None,
            webhook_url: None,
            webhook_secret: refs::webhook_secret(),
            active: true,
            created_at: Utc::now(),
        };
        let wtx = store.begin_write().unwrap();
        {
            let mut merchants = wtx.open_table(tables::MERCHANTS).unwrap();
            store::put_doc_id(&mut merchants, id, &merchant).unwrap();
        }
        wtx.commit().unwrap();
    }

    #[tokio::test]
    async fn issue_resolve_revoke() {
        let store = Store::in_memory().unwrap();
        let cache = KeyCache::default();
        seed_merchant(&store, 1);

        let issued = issue_key(&store, 1, Some("CI key".to_string())).unwrap();
        assert!(issued.key_id.starts_with("pf_key_"));
        assert!(issued.key_secret.starts_with("pf_sec_"));
        // The stored row carries only the hash.
        assert_ne!(issued.record.secret_hash, issued.key_secret);

        let merchant = resolve_key(&store, &cache, &issued.key_id, &issued.key_secret)
            .await
            .unwrap();
        assert_eq!(merchant.id, 1);

        // Wrong secret and unknown key id fail identically.
        let err = resolve_key(&store, &cache, &issued.key_id, "pf_sec_wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
        let err = resolve_key(&store, &cache, "pf_key_missing", &issued.key_secret)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));

        revoke_key(&store, &cache, 1, &issued.key_id).await.unwrap();
        let err = resolve_key(&store, &cache, &issued.key_id, &issued.key_secret)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn revoke_requires_ownership() {
        let store = Store::in_memory().unwrap();
        let cache = KeyCache::default();
        seed_merchant(&store, 1);
        let issued = issue_key(&store, 1, None).unwrap();

        let err = revoke_key(&store, &cache, 2, &issued.key_id).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));

        // Still resolvable by its owner.
        assert!(resolve_key(&store, &cache, &issued.key_id, &issued.key_secret)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn listing_excludes_nothing_but_sorts_newest_first() {
        let store = Store::in_memory().unwrap();
        seed_merchant(&store, 1);
        let first = issue_key(&store, 1, Some("first".to_string())).unwrap();
        let second = issue_key(&store, 1, Some("second".to_string())).unwrap();

        let listed = list_keys(&store, 1).unwrap();
        assert_eq!(listed.len(), 2);
        let ids: Vec<_> = listed.iter().map(|k| k.key_id.as_str()).collect();
        assert!(ids.contains(&first.key_id.as_str()));
        assert!(ids.contains(&second.key_id.as_str()));
    }
}
