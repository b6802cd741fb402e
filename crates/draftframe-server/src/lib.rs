pub mod cache;
pub mod config;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;

pub use cache::{CacheEntry, CacheKey, CacheStore, DomainResolver, InvalidationHandle};
pub use config::{AppConfig, AuthSettings, CacheSettings, InjectionSettings, ServerConfig, UpstreamSettings};
pub use gateway::{CallerAuthenticator, GatewayError, RedirectFetcher, StaticTokenAuthenticator};
pub use observability::init_tracing;
pub use server::{AppState, PreviewServer, ServerBuilder, build_app, router};
