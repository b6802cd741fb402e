//! Draft preview gateway.
//!
//! A request for `/preview/{tenantId}` resolves the tenant's preview session, serves from the
//! response cache when it can and otherwise fetches the upstream page with redirects followed
//! by hand. Responses are rewritten for the embedding frame and full pages get the request
//! interceptor and the host bridge injected. Upstream failures become in-frame placeholders.

pub mod auth;
pub mod error;
pub mod fetch;
pub mod handler;
pub mod inject;
pub mod placeholder;
pub mod transform;

pub use auth::{CallerAuthenticator, StaticTokenAuthenticator};
pub use error::GatewayError;
pub use fetch::{FetchError, FetchRequest, RedirectFetcher, UpstreamResponse};
pub use handler::{PreviewParams, X_GATEWAY_CACHE, X_GATEWAY_DIAG, X_GATEWAY_SESSION};
pub use inject::InterceptorConfig;
pub use placeholder::Placeholder;
pub use transform::PageKind;
