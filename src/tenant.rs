//! Tenant context resolution shared by the HTTP middleware and the
//! websocket handshake.

use std::{
    collections::HashMap,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use regex::Regex;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::store::ConversationStore;
use crate::types::TenantContext;

struct CachedTenant {
    tenant: TenantContext,
    expires_at: Instant,
}

pub struct TenantResolver {
    store: Arc<dyn ConversationStore>,
    ttl: Duration,
    cache: Mutex<HashMap<String, CachedTenant>>,
}

fn slug_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,62}$").ok())
        .as_ref()
}

fn is_valid_slug(slug: &str) -> bool {
    slug_regex().is_some_and(|re| re.is_match(slug))
}

impl TenantResolver {
    pub fn new(store: Arc<dyn ConversationStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Cache-first lookup. Inactive tenants are cached like any other record
    /// but never returned as a usable context.
    pub async fn resolve(&self, slug: &str) -> Result<TenantContext> {
        if !is_valid_slug(slug) {
            return Err(GatewayError::TenantNotFound(slug.to_string()));
        }

        let cached = {
            let cache = self.cache.lock().await;
            cache
                .get(slug)
                .filter(|entry| entry.expires_at > Instant::now())
                .map(|entry| entry.tenant.clone())
        };

        let tenant = match cached {
            Some(tenant) => tenant,
            None => {
                debug!(slug, "tenant cache miss");
                let tenant = self
                    .store
                    .find_tenant_by_slug(slug)
                    .await?
                    .ok_or_else(|| GatewayError::TenantNotFound(slug.to_string()))?;
                let mut cache = self.cache.lock().await;
                cache.insert(
                    slug.to_string(),
                    CachedTenant {
                        tenant: tenant.clone(),
                        expires_at: Instant::now() + self.ttl,
                    },
                );
                tenant
            }
        };

        if !tenant.is_active {
            return Err(GatewayError::TenantInactive(slug.to_string()));
        }
        Ok(tenant)
    }

    /// Drops the cached record so the next `resolve` reads fresh state.
    /// Call after any tenant update.
    pub async fn invalidate(&self, slug: &str) {
        self.cache.lock().await.remove(slug);
    }
}
