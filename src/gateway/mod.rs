//! Gateway domain: references, credentials, fraud rules, state machines.

pub mod authorizer;
pub mod cache;
pub mod errors;
pub mod fraud;
pub mod keys;
pub mod lifecycle;
pub mod queries;
pub mod refs;

use std::sync::Arc;

use tokio::sync::Notify;

use crate::gateway::authorizer::Authorizer;
use crate::gateway::cache::KeyCache;
use crate::gateway::errors::GatewayError;
use crate::settings::Config;
use crate::store::Store;

/// Shared application state, constructed once at startup and passed through
/// the request context. Holds the store, the process-wide HTTP client, the
/// authorization backend and the hot-key cache.
pub struct Gateway {
    pub settings: Config,
    pub store: Store,
    pub http: reqwest::Client,
    pub authorizer: Arc<dyn Authorizer>,
    pub key_cache: KeyCache,
    /// Wakes the webhook workers when handlers enqueue outbox rows.
    pub outbox_wake: Notify,
}

impl Gateway {
    pub fn new(
        settings: Config,
        store: Store,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Arc<Self>, GatewayError> {
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(settings.webhook_timeout)
            .build()
            .map_err(|e| GatewayError::internal(format!("build http client: {e}")))?;
        Ok(Arc::new(Self {
            key_cache: KeyCache::new(settings.key_cache_ttl),
            outbox_wake: Notify::new(),
            settings,
            store,
            http,
            authorizer,
        }))
    }

    /// In-memory gateway with a fixed-outcome authorizer.
    #[cfg(test)]
    pub fn for_tests(authorizer: Arc<dyn Authorizer>) -> Arc<Self> {
        let mut settings = Config::default();
        settings.secret_key = "payflow-test-secret-key-0123456789abcdef".to_string();
        let store = Store::in_memory().expect("in-memory store");
        Self::new(settings, store, authorizer).expect("test gateway")
    }
}
