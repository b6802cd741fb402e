use draftframe_core::Connection;
use serde::Deserialize;
use std::{collections::HashMap, net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Caller authentication into the gateway
    #[serde(default)]
    pub auth: AuthSettings,
    /// Upstream origin / relay settings
    #[serde(default)]
    pub upstream: UpstreamSettings,
    /// Response cache configuration
    #[serde(default)]
    pub cache: CacheSettings,
    /// Client-side interceptor configuration
    #[serde(default)]
    pub injection: InjectionSettings,
    /// Seed connections for the in-memory connection lookup, keyed by tenant id
    #[serde(default)]
    pub connections: HashMap<String, TenantConnections>,
    /// Seed dev-server ports for the in-memory port registry, keyed by tenant id
    #[serde(default)]
    pub cli_ports: HashMap<String, u16>,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        // Server validations
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        if let Some(ref base) = self.server.public_url {
            let parsed =
                url::Url::parse(base).map_err(|e| format!("server.public_url is invalid: {e}"))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err("server.public_url must be an http(s) URL".into());
            }
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        // Upstream validations
        if self.upstream.hop_timeout_ms == 0 || self.upstream.domain_lookup_timeout_ms == 0 {
            return Err("upstream timeouts must be > 0".into());
        }
        if self.upstream.max_hops == 0 {
            return Err("upstream.max_hops must be > 0".into());
        }
        if self.upstream.variant_param.trim().is_empty() {
            return Err("upstream.variant_param must not be empty".into());
        }
        if let Some(ref relay) = self.upstream.relay_url {
            let parsed =
                url::Url::parse(relay).map_err(|e| format!("upstream.relay_url is invalid: {e}"))?;
            if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
                return Err("upstream.relay_url must be an absolute http(s) URL".into());
            }
        }
        // Cache validation
        if self.cache.capacity == 0 {
            return Err("cache.capacity must be > 0".into());
        }
        // Auth validation
        if self.auth.enabled && self.auth.tokens.iter().all(|t| t.trim().is_empty()) {
            return Err("auth.enabled=true requires at least one auth.tokens entry".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public origin of the gateway as seen by the embedding browser.
    /// If not set, it is derived from each request's `Host` header.
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    2 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            public_url: None,
            body_limit_bytes: default_body_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}
impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// When disabled every caller is accepted.
    #[serde(default)]
    pub enabled: bool,
    /// Accepted caller tokens (Bearer header or session cookie).
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default = "default_session_cookie")]
    pub cookie_name: String,
}
fn default_session_cookie() -> String {
    "draftframe_session".into()
}
impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            tokens: Vec::new(),
            cookie_name: default_session_cookie(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSettings {
    /// Trust-delegation relay endpoint. Request paths are appended to it.
    #[serde(default)]
    pub relay_url: Option<String>,
    /// Header naming the origin domain on relay requests
    #[serde(default = "default_store_header")]
    pub relay_store_header: String,
    /// Header carrying the relay credential
    #[serde(default = "default_token_header")]
    pub relay_token_header: String,
    /// Query parameter identifying the draft variant
    #[serde(default = "default_variant_param")]
    pub variant_param: String,
    /// Cookie name used for cookie-token credentials
    #[serde(default = "default_cookie_token_name")]
    pub cookie_token_name: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_hop_timeout_ms")]
    pub hop_timeout_ms: u64,
    #[serde(default = "default_max_hops")]
    pub max_hops: usize,
    /// Look up a custom storefront domain for each origin
    #[serde(default = "default_true")]
    pub resolve_custom_domains: bool,
    #[serde(default = "default_domain_lookup_timeout_ms")]
    pub domain_lookup_timeout_ms: u64,
    #[serde(default = "default_domain_cache_ttl_secs")]
    pub domain_cache_ttl_secs: u64,
}
fn default_store_header() -> String {
    "x-relay-store".into()
}
fn default_token_header() -> String {
    "x-relay-access-token".into()
}
fn default_variant_param() -> String {
    "preview_variant_id".into()
}
fn default_cookie_token_name() -> String {
    "storefront_digest".into()
}
fn default_user_agent() -> String {
    concat!("draftframe-preview/", env!("CARGO_PKG_VERSION")).into()
}
fn default_hop_timeout_ms() -> u64 {
    25_000
}
fn default_max_hops() -> usize {
    5
}
fn default_domain_lookup_timeout_ms() -> u64 {
    5_000
}
fn default_domain_cache_ttl_secs() -> u64 {
    3_600
}

impl UpstreamSettings {
    pub fn hop_timeout(&self) -> Duration {
        Duration::from_millis(self.hop_timeout_ms)
    }
    pub fn domain_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.domain_lookup_timeout_ms)
    }
    pub fn domain_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.domain_cache_ttl_secs)
    }
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            relay_url: None,
            relay_store_header: default_store_header(),
            relay_token_header: default_token_header(),
            variant_param: default_variant_param(),
            cookie_token_name: default_cookie_token_name(),
            user_agent: default_user_agent(),
            hop_timeout_ms: default_hop_timeout_ms(),
            max_hops: default_max_hops(),
            resolve_custom_domains: true,
            domain_lookup_timeout_ms: default_domain_lookup_timeout_ms(),
            domain_cache_ttl_secs: default_domain_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}
fn default_cache_capacity() -> usize {
    200
}
impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: default_cache_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InjectionSettings {
    /// URL substrings the interceptor never rewrites (analytics, telemetry, platform CDN).
    #[serde(default = "default_passthrough_patterns")]
    pub passthrough_patterns: Vec<String>,
    /// Host suffixes that belong to the same hosting platform as the origin,
    /// e.g. `.myshop-platform.com`.
    #[serde(default)]
    pub alternate_host_suffixes: Vec<String>,
}
fn default_passthrough_patterns() -> Vec<String> {
    [
        "google-analytics.com",
        "googletagmanager.com",
        "doubleclick.net",
        "connect.facebook.net",
        "facebook.com/tr",
        "sentry.io",
        "hotjar.com",
        "clarity.ms",
        "/monorail/",
        "/web-pixels",
        "/.well-known/",
        "//cdn.",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
impl Default for InjectionSettings {
    fn default() -> Self {
        Self {
            passthrough_patterns: default_passthrough_patterns(),
            alternate_host_suffixes: Vec::new(),
        }
    }
}

/// Connections seeded into the in-memory lookup for one tenant.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct TenantConnections {
    #[serde(default)]
    pub primary: Option<Connection>,
    #[serde(default)]
    pub dev_store: Option<Connection>,
    /// Per-tenant variant override
    #[serde(default)]
    pub variant_id: Option<String>,
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                // Try default root-level file
                let default_path = PathBuf::from("draftframe.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment variable overrides, e.g., DRAFTFRAME__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("DRAFTFRAME")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
