//! Preview session resolution.
//!
//! A [`PreviewSession`] is built per request from the tenant's stored connections and
//! describes where the upstream request goes and which credential it carries. It is never
//! persisted.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use url::Url;

use crate::error::{PreviewError, ResolveError, Result};
use crate::registry::{CliPortRegistry, ConnectionLookup};

/// Backing mode requested by the caller through the `mode` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PreviewMode {
    #[default]
    Default,
    Cli,
    DevStore,
}

impl PreviewMode {
    /// Parse the `mode` query value. Unknown or missing values select the default relay mode.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("cli") => Self::Cli,
            Some("devstore") | Some("dev-store") | Some("dev_store") => Self::DevStore,
            _ => Self::Default,
        }
    }

    /// Value to carry on rewritten gateway URLs; `None` for the default mode.
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            Self::Default => None,
            Self::Cli => Some("cli"),
            Self::DevStore => Some("devstore"),
        }
    }

    fn is_explicit(self) -> bool {
        !matches!(self, Self::Default)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    CookieToken,
    BearerToken,
    TrustDelegation,
}

/// Stored credential material for a connection.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", content = "secret", rename_all = "kebab-case")]
pub enum Credential {
    CookieToken(String),
    BearerToken(String),
    TrustDelegation(String),
}

impl Credential {
    pub fn auth_mode(&self) -> AuthMode {
        match self {
            Self::CookieToken(_) => AuthMode::CookieToken,
            Self::BearerToken(_) => AuthMode::BearerToken,
            Self::TrustDelegation(_) => AuthMode::TrustDelegation,
        }
    }

    pub fn secret(&self) -> &str {
        match self {
            Self::CookieToken(s) | Self::BearerToken(s) | Self::TrustDelegation(s) => s,
        }
    }

    pub fn is_trust_delegation(&self) -> bool {
        matches!(self, Self::TrustDelegation(_))
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(<redacted>)", self.auth_mode())
    }
}

/// A stored storefront connection, as read from the external connection store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Connection {
    pub origin_domain: String,
    #[serde(default)]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub variant_id: Option<String>,
}

impl Connection {
    pub fn new(origin_domain: impl Into<String>) -> Self {
        Self {
            origin_domain: origin_domain.into(),
            credential: None,
            variant_id: None,
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    pub fn with_variant(mut self, variant_id: impl Into<String>) -> Self {
        self.variant_id = Some(variant_id.into());
        self
    }
}

/// Which backing a resolved session uses. Reported in the `X-Gateway-Session` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Cli,
    TrustDelegation,
    DevStore,
    /// An explicitly requested mode fell back to fetching the origin directly.
    Direct,
}

impl SessionKind {
    pub fn header_value(self) -> &'static str {
        match self {
            Self::Cli => "cli",
            Self::TrustDelegation => "trust-delegation",
            Self::DevStore => "devstore",
            Self::Direct => "none",
        }
    }
}

/// Where upstream requests for a session are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamTarget {
    /// The platform's trust-delegation relay; the origin is named in a request header.
    Relay,
    /// A base URL fetched directly (the origin itself, or a local dev-server).
    Base(Url),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewSession {
    pub kind: SessionKind,
    pub origin_domain: String,
    /// The origin that relative page URLs resolve against, used for `<base href>`.
    pub origin: Url,
    pub upstream: UpstreamTarget,
    pub credential: Option<Credential>,
    pub variant_id: Option<String>,
}

impl PreviewSession {
    pub fn is_trust_delegation(&self) -> bool {
        matches!(self.upstream, UpstreamTarget::Relay)
    }

    pub fn auth_mode(&self) -> Option<AuthMode> {
        self.credential.as_ref().map(Credential::auth_mode)
    }

    /// Cache key suffix distinguishing sessions that render different content.
    pub fn mode_suffix(&self) -> String {
        match &self.variant_id {
            Some(variant) => format!("{}:{}", self.kind.header_value(), variant),
            None => self.kind.header_value().to_string(),
        }
    }
}

/// Result of session resolution. Terminal placeholder states are not errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Ready(PreviewSession),
    Disconnected,
    NoCredential,
}

impl SessionOutcome {
    pub fn header_value(&self) -> &'static str {
        match self {
            Self::Ready(session) => session.kind.header_value(),
            Self::Disconnected => "none",
            Self::NoCredential => "invalid",
        }
    }

    /// Convert a terminal outcome into its error kind.
    pub fn into_session(self, tenant_id: &str) -> std::result::Result<PreviewSession, PreviewError> {
        match self {
            Self::Ready(session) => Ok(session),
            Self::Disconnected => Err(PreviewError::NoConnectionConfigured {
                tenant_id: tenant_id.to_string(),
            }),
            Self::NoCredential => Err(PreviewError::NoCredentialConfigured {
                tenant_id: tenant_id.to_string(),
            }),
        }
    }
}

/// Strip any scheme and trailing slash a stored origin domain may carry.
pub fn normalize_origin_domain(domain: &str) -> &str {
    let domain = domain.trim();
    let domain = domain
        .strip_prefix("https://")
        .or_else(|| domain.strip_prefix("http://"))
        .unwrap_or(domain);
    domain.trim_end_matches('/')
}

/// `https://{domain}/` for a stored origin domain.
pub fn origin_base(domain: &str) -> Result<Url> {
    let domain = normalize_origin_domain(domain);
    Url::parse(&format!("https://{domain}/")).map_err(|source| ResolveError::InvalidOrigin {
        domain: domain.to_string(),
        source,
    })
}

/// Resolves the backing session for a tenant and requested mode.
#[derive(Clone)]
pub struct SessionResolver {
    connections: Arc<dyn ConnectionLookup>,
    cli_ports: Arc<dyn CliPortRegistry>,
}

impl SessionResolver {
    pub fn new(connections: Arc<dyn ConnectionLookup>, cli_ports: Arc<dyn CliPortRegistry>) -> Self {
        Self {
            connections,
            cli_ports,
        }
    }

    /// Resolution order:
    /// 1. `cli` with a live dev-server port → local session, no credential.
    /// 2. `devstore` with a secondary connection → that connection's credential.
    /// 3. The primary connection, relay credential required unless a mode was explicit.
    pub async fn resolve(&self, tenant_id: &str, mode: PreviewMode) -> Result<SessionOutcome> {
        let primary = self.connections.primary(tenant_id).await?;

        if mode == PreviewMode::Cli
            && let Some(port) = self.cli_ports.port(tenant_id).await
        {
            let base = Url::parse(&format!("http://127.0.0.1:{port}/")).map_err(|source| {
                ResolveError::InvalidOrigin {
                    domain: format!("127.0.0.1:{port}"),
                    source,
                }
            })?;
            let origin_domain = primary
                .as_ref()
                .map(|c| normalize_origin_domain(&c.origin_domain).to_string())
                .unwrap_or_else(|| format!("127.0.0.1:{port}"));
            tracing::debug!(tenant_id, port, "resolved local dev-server session");
            return Ok(SessionOutcome::Ready(PreviewSession {
                kind: SessionKind::Cli,
                origin_domain,
                origin: base.clone(),
                upstream: UpstreamTarget::Base(base),
                credential: None,
                variant_id: None,
            }));
        }

        if mode == PreviewMode::DevStore {
            if let Some(dev) = self.connections.dev_store(tenant_id).await? {
                return self.dev_store_session(dev).map(SessionOutcome::Ready);
            }
            tracing::debug!(tenant_id, "no dev-store connection, falling back to primary");
        }

        let Some(primary) = primary else {
            return Ok(SessionOutcome::Disconnected);
        };

        let variant_id = self
            .connections
            .tenant_variant(tenant_id)
            .await?
            .or_else(|| primary.variant_id.clone());
        let origin_domain = normalize_origin_domain(&primary.origin_domain).to_string();
        let origin = origin_base(&origin_domain)?;

        match primary.credential {
            Some(credential) if credential.is_trust_delegation() => {
                Ok(SessionOutcome::Ready(PreviewSession {
                    kind: SessionKind::TrustDelegation,
                    origin_domain,
                    origin,
                    upstream: UpstreamTarget::Relay,
                    credential: Some(credential),
                    variant_id,
                }))
            }
            credential if mode.is_explicit() => Ok(SessionOutcome::Ready(PreviewSession {
                kind: SessionKind::Direct,
                upstream: UpstreamTarget::Base(origin.clone()),
                origin,
                origin_domain,
                credential,
                variant_id,
            })),
            _ => Ok(SessionOutcome::NoCredential),
        }
    }

    fn dev_store_session(&self, dev: Connection) -> Result<PreviewSession> {
        let origin_domain = normalize_origin_domain(&dev.origin_domain).to_string();
        let origin = origin_base(&origin_domain)?;
        let session = match dev.credential {
            Some(credential) if credential.is_trust_delegation() => PreviewSession {
                kind: SessionKind::DevStore,
                origin_domain,
                origin,
                upstream: UpstreamTarget::Relay,
                credential: Some(credential),
                variant_id: dev.variant_id,
            },
            Some(credential) => PreviewSession {
                kind: SessionKind::DevStore,
                upstream: UpstreamTarget::Base(origin.clone()),
                origin,
                origin_domain,
                credential: Some(credential),
                variant_id: dev.variant_id,
            },
            None => PreviewSession {
                kind: SessionKind::Direct,
                upstream: UpstreamTarget::Base(origin.clone()),
                origin,
                origin_domain,
                credential: None,
                variant_id: dev.variant_id,
            },
        };
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MemoryCliPortRegistry, MemoryConnectionLookup};

    fn resolver() -> (SessionResolver, Arc<MemoryConnectionLookup>, Arc<MemoryCliPortRegistry>) {
        let connections = Arc::new(MemoryConnectionLookup::new());
        let ports = Arc::new(MemoryCliPortRegistry::new());
        (
            SessionResolver::new(connections.clone(), ports.clone()),
            connections,
            ports,
        )
    }

    fn relay(secret: &str) -> Credential {
        Credential::TrustDelegation(secret.to_string())
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(PreviewMode::parse(Some("cli")), PreviewMode::Cli);
        assert_eq!(PreviewMode::parse(Some("DevStore")), PreviewMode::DevStore);
        assert_eq!(PreviewMode::parse(Some("dev-store")), PreviewMode::DevStore);
        assert_eq!(PreviewMode::parse(Some("default")), PreviewMode::Default);
        assert_eq!(PreviewMode::parse(None), PreviewMode::Default);
    }

    #[test]
    fn credential_debug_is_redacted() {
        let rendered = format!("{:?}", relay("shhh"));
        assert!(!rendered.contains("shhh"));
    }

    #[test]
    fn origin_domain_normalization() {
        assert_eq!(normalize_origin_domain("https://shop.example.com/"), "shop.example.com");
        assert_eq!(normalize_origin_domain("shop.example.com"), "shop.example.com");
        assert_eq!(
            origin_base("http://shop.example.com").unwrap().as_str(),
            "https://shop.example.com/"
        );
    }

    #[tokio::test]
    async fn missing_connection_is_disconnected() {
        let (resolver, _, _) = resolver();
        let outcome = resolver.resolve("t1", PreviewMode::Default).await.unwrap();
        assert_eq!(outcome, SessionOutcome::Disconnected);
        assert_eq!(outcome.header_value(), "none");
    }

    #[tokio::test]
    async fn default_mode_without_relay_credential_is_no_credential() {
        let (resolver, connections, _) = resolver();
        connections.set_primary("t1", Connection::new("shop.example.com"));
        let outcome = resolver.resolve("t1", PreviewMode::Default).await.unwrap();
        assert_eq!(outcome, SessionOutcome::NoCredential);
        assert_eq!(outcome.header_value(), "invalid");

        connections.set_primary(
            "t1",
            Connection::new("shop.example.com")
                .with_credential(Credential::BearerToken("tok".into())),
        );
        let outcome = resolver.resolve("t1", PreviewMode::Default).await.unwrap();
        assert_eq!(outcome, SessionOutcome::NoCredential);
    }

    #[tokio::test]
    async fn tenant_variant_overrides_connection_variant() {
        let (resolver, connections, _) = resolver();
        connections.set_primary(
            "t1",
            Connection::new("https://shop.example.com/")
                .with_credential(relay("pw"))
                .with_variant("100"),
        );
        let SessionOutcome::Ready(session) =
            resolver.resolve("t1", PreviewMode::Default).await.unwrap()
        else {
            panic!("expected session");
        };
        assert_eq!(session.kind, SessionKind::TrustDelegation);
        assert_eq!(session.origin_domain, "shop.example.com");
        assert_eq!(session.variant_id.as_deref(), Some("100"));
        assert!(session.is_trust_delegation());

        connections.set_tenant_variant("t1", "200");
        let SessionOutcome::Ready(session) =
            resolver.resolve("t1", PreviewMode::Default).await.unwrap()
        else {
            panic!("expected session");
        };
        assert_eq!(session.variant_id.as_deref(), Some("200"));
        assert_eq!(session.mode_suffix(), "trust-delegation:200");
    }

    #[tokio::test]
    async fn cli_mode_uses_live_port() {
        let (resolver, connections, ports) = resolver();
        connections.set_primary("t1", Connection::new("shop.example.com"));
        ports.register("t1", 9292);

        let SessionOutcome::Ready(session) = resolver.resolve("t1", PreviewMode::Cli).await.unwrap()
        else {
            panic!("expected session");
        };
        assert_eq!(session.kind, SessionKind::Cli);
        assert!(session.credential.is_none());
        assert_eq!(session.origin.as_str(), "http://127.0.0.1:9292/");
        assert_eq!(session.origin_domain, "shop.example.com");
    }

    #[tokio::test]
    async fn cli_mode_without_port_falls_back_to_direct() {
        let (resolver, connections, _) = resolver();
        connections.set_primary("t1", Connection::new("shop.example.com"));
        let SessionOutcome::Ready(session) = resolver.resolve("t1", PreviewMode::Cli).await.unwrap()
        else {
            panic!("expected session");
        };
        assert_eq!(session.kind, SessionKind::Direct);
        assert_eq!(
            session.upstream,
            UpstreamTarget::Base(Url::parse("https://shop.example.com/").unwrap())
        );
    }

    #[tokio::test]
    async fn dev_store_uses_secondary_connection() {
        let (resolver, connections, _) = resolver();
        connections.set_primary("t1", Connection::new("shop.example.com").with_credential(relay("a")));
        connections.set_dev_store(
            "t1",
            Connection::new("dev.example.com").with_credential(relay("b")),
        );

        let SessionOutcome::Ready(session) =
            resolver.resolve("t1", PreviewMode::DevStore).await.unwrap()
        else {
            panic!("expected session");
        };
        assert_eq!(session.kind, SessionKind::DevStore);
        assert_eq!(session.origin_domain, "dev.example.com");
        assert_eq!(session.credential, Some(relay("b")));
        assert!(session.is_trust_delegation());
    }

    #[tokio::test]
    async fn dev_store_cookie_credential_fetches_origin_directly() {
        let (resolver, connections, _) = resolver();
        connections.set_dev_store(
            "t1",
            Connection::new("dev.example.com")
                .with_credential(Credential::CookieToken("digest".into())),
        );
        let SessionOutcome::Ready(session) =
            resolver.resolve("t1", PreviewMode::DevStore).await.unwrap()
        else {
            panic!("expected session");
        };
        assert_eq!(session.kind, SessionKind::DevStore);
        assert_eq!(session.auth_mode(), Some(AuthMode::CookieToken));
        assert!(!session.is_trust_delegation());
    }

    #[test]
    fn terminal_outcomes_map_to_errors() {
        assert_eq!(
            SessionOutcome::Disconnected.into_session("t1"),
            Err(PreviewError::NoConnectionConfigured {
                tenant_id: "t1".into()
            })
        );
        assert_eq!(
            SessionOutcome::NoCredential.into_session("t1"),
            Err(PreviewError::NoCredentialConfigured {
                tenant_id: "t1".into()
            })
        );
    }
}
