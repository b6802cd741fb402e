//! Operator-facing classification of failed upstream responses.
//!
//! Classification never changes what is returned to the frame; it only feeds the
//! `X-Gateway-Diag` header and a log line when diagnostics are requested.

use crate::content::ContentClass;

/// Path prefixes served by third-party storefront extensions rather than the theme.
const APP_ENDPOINT_PREFIXES: &[&str] = &["/apps/", "/a/", "/tools/", "/community/"];

const ASSET_SEGMENTS: &[&str] = &["/assets/", "/cdn/"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticCategory {
    AuthCookie,
    MissingLocalFile,
    AppEndpoint,
    ProxyRewrite,
    UpstreamOther,
}

impl DiagnosticCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthCookie => "auth-cookie",
            Self::MissingLocalFile => "missing-local-file",
            Self::AppEndpoint => "app-endpoint",
            Self::ProxyRewrite => "proxy-rewrite",
            Self::UpstreamOther => "upstream-other",
        }
    }
}

impl std::fmt::Display for DiagnosticCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnosis {
    pub category: DiagnosticCategory,
    pub reason: String,
}

/// Classify a failed upstream status for the requested path.
pub fn classify(status: u16, path: &str) -> Diagnosis {
    let path_only = path.split(['?', '#']).next().unwrap_or_default();

    let (category, reason) = if status == 401 || status == 403 {
        (
            DiagnosticCategory::AuthCookie,
            format!("upstream returned {status}; the preview credential or session cookie was rejected"),
        )
    } else if status == 404 && is_asset_path(path_only) {
        (
            DiagnosticCategory::MissingLocalFile,
            format!("asset {path_only} was not found upstream; it may not have been pushed yet"),
        )
    } else if is_app_endpoint(path_only) {
        (
            DiagnosticCategory::AppEndpoint,
            format!("{path_only} is served by a storefront extension (status {status})"),
        )
    } else if status == 404 {
        (
            DiagnosticCategory::ProxyRewrite,
            format!("{path_only} was not found upstream; the link may have escaped proxy rewriting"),
        )
    } else {
        (
            DiagnosticCategory::UpstreamOther,
            format!("upstream returned {status} for {path_only}"),
        )
    };

    Diagnosis { category, reason }
}

fn is_asset_path(path: &str) -> bool {
    ContentClass::from_path(path).is_some_and(|class| class != ContentClass::Html)
        || ASSET_SEGMENTS.iter().any(|segment| path.contains(segment))
}

fn is_app_endpoint(path: &str) -> bool {
    APP_ENDPOINT_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}
