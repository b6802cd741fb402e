//! Custom storefront domain discovery.
//!
//! Origins are usually reachable under a platform-assigned domain that redirects to the
//! merchant's own domain. Pages rendered under the custom domain reference it in absolute
//! URLs, so the interceptor needs to know it. The domain is discovered by following the
//! origin's redirects once and remembered per tenant and origin for an hour.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Tenant id and lowercased origin domain.
type DomainKey = (String, String);

#[derive(Clone)]
struct ResolvedDomain {
    custom_domain: Option<String>,
    resolved_at: Instant,
}

pub struct DomainResolver {
    client: reqwest::Client,
    entries: DashMap<DomainKey, ResolvedDomain>,
    ttl: Duration,
    enabled: bool,
}

impl DomainResolver {
    pub fn new(lookup_timeout: Duration, ttl: Duration, enabled: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(lookup_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to build domain lookup client, using defaults");
                reqwest::Client::new()
            });
        Self {
            client,
            entries: DashMap::new(),
            ttl,
            enabled,
        }
    }

    /// The custom domain `origin_domain` redirects to, if any.
    ///
    /// A tenant can preview several origins (primary store, dev store), so results are kept
    /// per origin. Lookup failures resolve to `None` and are remembered like any other result.
    pub async fn resolve(&self, tenant_id: &str, origin_domain: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let key = domain_key(tenant_id, origin_domain);
        if let Some(entry) = self.entries.get(&key)
            && entry.resolved_at.elapsed() <= self.ttl
        {
            return entry.custom_domain.clone();
        }

        let custom_domain = self.discover(origin_domain).await;
        self.entries.insert(
            key,
            ResolvedDomain {
                custom_domain: custom_domain.clone(),
                resolved_at: Instant::now(),
            },
        );
        custom_domain
    }

    async fn discover(&self, origin_domain: &str) -> Option<String> {
        let url = format!("https://{origin_domain}/");
        match self.client.head(&url).send().await {
            Ok(response) => {
                let final_host = response.url().host_str()?.to_ascii_lowercase();
                if final_host != origin_domain.to_ascii_lowercase() {
                    tracing::debug!(
                        origin = %origin_domain,
                        custom_domain = %final_host,
                        "resolved custom storefront domain"
                    );
                    Some(final_host)
                } else {
                    None
                }
            }
            Err(e) => {
                tracing::debug!(origin = %origin_domain, error = %e, "custom domain lookup failed");
                None
            }
        }
    }

    /// Forget every resolution for a tenant so its next request looks the domain up again.
    pub fn forget(&self, tenant_id: &str) {
        self.entries.retain(|(tenant, _), _| tenant != tenant_id);
    }

    /// Seed a resolution without a network lookup.
    pub fn insert(&self, tenant_id: &str, origin_domain: &str, custom_domain: Option<String>) {
        self.entries.insert(
            domain_key(tenant_id, origin_domain),
            ResolvedDomain {
                custom_domain,
                resolved_at: Instant::now(),
            },
        );
    }

    /// Invalidation listener that drops the tenant's resolutions.
    pub fn invalidation_hook(self: &Arc<Self>) -> super::store::InvalidationHook {
        let resolver = Arc::clone(self);
        Arc::new(move |tenant_id: &str| resolver.forget(tenant_id))
    }
}

fn domain_key(tenant_id: &str, origin_domain: &str) -> DomainKey {
    (tenant_id.to_string(), origin_domain.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> Arc<DomainResolver> {
        Arc::new(DomainResolver::new(
            Duration::from_millis(50),
            Duration::from_secs(3600),
            true,
        ))
    }

    #[tokio::test]
    async fn disabled_resolver_never_looks_up() {
        let resolver = DomainResolver::new(Duration::from_millis(50), Duration::from_secs(60), false);
        resolver.insert("t1", "shop.example.com", Some("shop.example.org".into()));
        assert_eq!(resolver.resolve("t1", "shop.example.com").await, None);
    }

    #[tokio::test]
    async fn cached_resolution_is_reused_until_forgotten() {
        let resolver = resolver();
        resolver.insert("t1", "shop.invalid", Some("shop.example.org".into()));
        assert_eq!(
            resolver.resolve("t1", "SHOP.invalid").await.as_deref(),
            Some("shop.example.org")
        );

        let hook = resolver.invalidation_hook();
        hook("t1");
        // `.invalid` never resolves, so the fresh lookup fails and is cached as none
        assert_eq!(resolver.resolve("t1", "shop.invalid").await, None);
    }

    #[tokio::test]
    async fn resolution_is_kept_per_origin() {
        let resolver = resolver();
        resolver.insert("t1", "live.invalid", Some("shop.example.org".into()));
        resolver.insert("t1", "dev.invalid", None);
        resolver.insert("t2", "live.invalid", Some("other.example.org".into()));

        assert_eq!(
            resolver.resolve("t1", "live.invalid").await.as_deref(),
            Some("shop.example.org")
        );
        assert_eq!(resolver.resolve("t1", "dev.invalid").await, None);
        assert_eq!(
            resolver.resolve("t2", "live.invalid").await.as_deref(),
            Some("other.example.org")
        );

        resolver.forget("t1");
        assert_eq!(resolver.entries.len(), 1);
        assert_eq!(
            resolver.resolve("t2", "live.invalid").await.as_deref(),
            Some("other.example.org")
        );
    }
}
