use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use draftframe_core::{
    CliPortRegistry, ConnectionLookup, MemoryCliPortRegistry, MemoryConnectionLookup,
    SessionResolver,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::cache::{CacheStore, DomainResolver, InvalidationHandle};
use crate::config::AppConfig;
use crate::gateway::{CallerAuthenticator, RedirectFetcher, StaticTokenAuthenticator, handler};
use crate::{handlers, middleware as app_middleware};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub resolver: SessionResolver,
    pub cache: Arc<CacheStore>,
    pub domains: Arc<DomainResolver>,
    pub fetcher: Arc<RedirectFetcher>,
    pub authenticator: Arc<dyn CallerAuthenticator>,
}

impl AppState {
    /// State backed by in-memory collaborators seeded from `cfg`.
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        Self::with_collaborators(
            cfg,
            seed_connections(cfg),
            seed_cli_ports(cfg),
            Arc::new(StaticTokenAuthenticator::new(&cfg.auth)),
        )
    }

    pub fn with_collaborators(
        cfg: &AppConfig,
        connections: Arc<dyn ConnectionLookup>,
        cli_ports: Arc<dyn CliPortRegistry>,
        authenticator: Arc<dyn CallerAuthenticator>,
    ) -> anyhow::Result<Self> {
        let fetcher =
            RedirectFetcher::new(&cfg.upstream).context("failed to build upstream HTTP client")?;

        let cache = Arc::new(CacheStore::new(cfg.cache.capacity));
        let domains = Arc::new(DomainResolver::new(
            cfg.upstream.domain_lookup_timeout(),
            cfg.upstream.domain_cache_ttl(),
            cfg.upstream.resolve_custom_domains,
        ));
        cache.register_invalidation_hook(domains.invalidation_hook());

        Ok(Self {
            config: Arc::new(cfg.clone()),
            resolver: SessionResolver::new(connections, cli_ports),
            cache,
            domains,
            fetcher: Arc::new(fetcher),
            authenticator,
        })
    }

    /// Purge signal for the in-process push pipeline.
    pub fn invalidation_handle(&self) -> InvalidationHandle {
        self.cache.invalidation_handle()
    }
}

/// In-memory connection lookup holding the connections listed in the config file.
pub fn seed_connections(cfg: &AppConfig) -> Arc<MemoryConnectionLookup> {
    let lookup = MemoryConnectionLookup::new();
    for (tenant_id, tenant) in &cfg.connections {
        if let Some(primary) = &tenant.primary {
            lookup.set_primary(tenant_id, primary.clone());
        }
        if let Some(dev_store) = &tenant.dev_store {
            lookup.set_dev_store(tenant_id, dev_store.clone());
        }
        if let Some(variant_id) = &tenant.variant_id {
            lookup.set_tenant_variant(tenant_id, variant_id.clone());
        }
    }
    Arc::new(lookup)
}

pub fn seed_cli_ports(cfg: &AppConfig) -> Arc<MemoryCliPortRegistry> {
    let registry = MemoryCliPortRegistry::new();
    for (tenant_id, port) in &cfg.cli_ports {
        registry.register(tenant_id, *port);
    }
    Arc::new(registry)
}

pub fn build_app(cfg: &AppConfig) -> anyhow::Result<Router> {
    Ok(router(AppState::from_config(cfg)?))
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;

    let gateway = Router::new()
        .route(
            "/preview/{tenant_id}",
            get(handler::preview).post(handler::preview),
        )
        .route("/preview/{tenant_id}/invalidate", post(handler::invalidate))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::caller_authentication,
        ));

    Router::new()
        // Health and info endpoints
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::metrics))
        // Public bridge asset loaded by injected pages
        .route("/preview/assets/bridge.js", get(handler::bridge_script))
        .merge(gateway)
        // Middleware stack (order: request id -> trace -> cors -> body limit)
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
        .with_state(state)
}

pub struct PreviewServer {
    addr: SocketAddr,
    app: Router,
    state: AppState,
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    connections: Option<Arc<dyn ConnectionLookup>>,
    cli_ports: Option<Arc<dyn CliPortRegistry>>,
    authenticator: Option<Arc<dyn CallerAuthenticator>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            connections: None,
            cli_ports: None,
            authenticator: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Replace the config-seeded connection lookup with an external store.
    pub fn with_connection_lookup(mut self, connections: Arc<dyn ConnectionLookup>) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn with_cli_ports(mut self, cli_ports: Arc<dyn CliPortRegistry>) -> Self {
        self.cli_ports = Some(cli_ports);
        self
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn CallerAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn build(self) -> anyhow::Result<PreviewServer> {
        if self.config.metrics.enabled {
            crate::metrics::init_metrics();
        }

        let connections = self
            .connections
            .unwrap_or_else(|| seed_connections(&self.config) as Arc<dyn ConnectionLookup>);
        let cli_ports = self
            .cli_ports
            .unwrap_or_else(|| seed_cli_ports(&self.config) as Arc<dyn CliPortRegistry>);
        let authenticator = self
            .authenticator
            .unwrap_or_else(|| {
                Arc::new(StaticTokenAuthenticator::new(&self.config.auth))
                    as Arc<dyn CallerAuthenticator>
            });

        let state =
            AppState::with_collaborators(&self.config, connections, cli_ports, authenticator)?;
        Ok(PreviewServer {
            addr: self.addr,
            app: router(state.clone()),
            state,
        })
    }
}

impl PreviewServer {
    /// Purge signal for an in-process push pipeline.
    pub fn invalidation_handle(&self) -> InvalidationHandle {
        self.state.invalidation_handle()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app(auth_enabled: bool) -> Router {
        let mut cfg = AppConfig::default();
        cfg.auth.enabled = auth_enabled;
        cfg.auth.tokens = vec!["t0ken".into()];
        build_app(&cfg).unwrap()
    }

    #[tokio::test]
    async fn bridge_script_is_public() {
        let response = app(true)
            .oneshot(
                Request::get("/preview/assets/bridge.js")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()["content-type"],
            "application/javascript; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn gateway_routes_require_caller_token() {
        let response = app(true)
            .oneshot(
                Request::post("/preview/t1/invalidate")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app(true)
            .oneshot(
                Request::post("/preview/t1/invalidate")
                    .header("authorization", "Bearer t0ken")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_tenant_renders_placeholder() {
        let response = app(false)
            .oneshot(
                Request::get("/preview/nobody?path=%2F")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-gateway-session"], "none");
        assert_eq!(response.headers()["x-gateway-cache"], "MISS");
    }

    #[tokio::test]
    async fn builder_uses_external_collaborators() {
        let connections = Arc::new(MemoryConnectionLookup::new());
        connections.set_primary("ext", draftframe_core::Connection::new("shop.example.com"));
        let authenticator = Arc::new(StaticTokenAuthenticator::new(&crate::config::AuthSettings {
            enabled: true,
            tokens: vec!["external".into()],
            cookie_name: "draftframe_session".into(),
        }));

        let server = ServerBuilder::new()
            .with_addr(SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_connection_lookup(connections)
            .with_cli_ports(Arc::new(MemoryCliPortRegistry::new()))
            .with_authenticator(authenticator)
            .build()
            .unwrap();
        assert_eq!(server.addr.port(), 0);

        let response = server
            .app
            .clone()
            .oneshot(
                Request::get("/preview/ext?path=%2F")
                    .header("authorization", "Bearer external")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-gateway-session"], "invalid");

        let response = server
            .app
            .oneshot(
                Request::get("/preview/ext?path=%2F")
                    .header("authorization", "Bearer t0ken")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn invalidation_handle_reaches_the_cache() {
        let state = AppState::from_config(&AppConfig::default()).unwrap();
        let handle = state.invalidation_handle();
        assert_eq!(handle.invalidate("t1"), 0);
    }
}
