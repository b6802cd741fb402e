pub mod content;
pub mod diagnostics;
pub mod error;
pub mod registry;
pub mod session;

pub use content::{ContentClass, DYNAMIC_CACHE_CONTROL, STATIC_CACHE_CONTROL};
pub use diagnostics::{Diagnosis, DiagnosticCategory, classify};
pub use error::{PreviewError, ResolveError, Result};
pub use registry::{CliPortRegistry, ConnectionLookup, MemoryCliPortRegistry, MemoryConnectionLookup};
pub use session::{
    AuthMode, Connection, Credential, PreviewMode, PreviewSession, SessionKind, SessionOutcome,
    SessionResolver, UpstreamTarget, normalize_origin_domain, origin_base,
};
