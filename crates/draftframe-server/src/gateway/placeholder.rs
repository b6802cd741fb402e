//! In-frame placeholder pages.
//!
//! Upstream-related failures render one of these with status 200 so the host frame never
//! shows a bare browser error page.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use draftframe_core::PreviewError;

use super::inject::{escape_html, escape_script_json};

/// Automatic reloads attempted by the not-ready page before showing a Retry button.
pub const NOT_READY_MAX_RETRIES: u32 = 3;
/// Delay of the first automatic reload; later attempts wait a multiple of it.
pub const NOT_READY_BASE_DELAY_MS: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
    Disconnected,
    NoCredential,
    Unauthorized,
    NotReady,
    Timeout,
    UpstreamError { status: Option<u16> },
}

impl Placeholder {
    /// Placeholder for an upstream-side failure. `None` for errors that must surface as HTTP
    /// errors instead.
    pub fn for_error(err: &PreviewError) -> Option<Self> {
        let placeholder = match err {
            PreviewError::NoConnectionConfigured { .. } => Self::Disconnected,
            PreviewError::NoCredentialConfigured { .. } => Self::NoCredential,
            PreviewError::UpstreamUnauthorized { .. } => Self::Unauthorized,
            PreviewError::UpstreamNotReady => Self::NotReady,
            PreviewError::UpstreamTimeout { .. } => Self::Timeout,
            PreviewError::UpstreamOtherError { status, .. } => Self::UpstreamError { status: *status },
            PreviewError::CallerUnauthenticated => return None,
        };
        Some(placeholder)
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Disconnected => "Storefront not connected",
            Self::NoCredential => "Preview access not set up",
            Self::Unauthorized => "Preview access was rejected",
            Self::NotReady => "Preparing preview",
            Self::Timeout => "The storefront took too long to respond",
            Self::UpstreamError { .. } => "The storefront returned an error",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Disconnected => {
                "Connect a storefront to this project to see a live preview here.".to_string()
            }
            Self::NoCredential => {
                "Add the storefront preview credential in the connection settings to render unpublished changes.".to_string()
            }
            Self::Unauthorized => {
                "The stored preview credential is no longer accepted. Reconnect the storefront and reload.".to_string()
            }
            Self::NotReady => {
                "The storefront is still building this version. The preview reloads automatically.".to_string()
            }
            Self::Timeout => "No response arrived in time. Try again in a moment.".to_string(),
            Self::UpstreamError { status: Some(status) } => {
                format!("The storefront responded with status {status}.")
            }
            Self::UpstreamError { status: None } => {
                "The storefront could not be reached.".to_string()
            }
        }
    }

    fn retryable(&self) -> bool {
        matches!(
            self,
            Self::NotReady | Self::Timeout | Self::UpstreamError { .. }
        )
    }

    /// Render the page. `retry_key` scopes the not-ready retry counter, usually tenant plus
    /// upstream path.
    pub fn render(&self, retry_key: &str) -> String {
        let retry_button = if self.retryable() {
            r#"<button type="button" id="draftframe-retry" onclick="location.reload()">Retry</button>"#
        } else {
            ""
        };
        let hidden = if matches!(self, Self::NotReady) {
            " hidden"
        } else {
            ""
        };
        let script = if matches!(self, Self::NotReady) {
            not_ready_script(retry_key)
        } else {
            String::new()
        };

        format!(
            r#"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>{title}</title>
<style>
body{{margin:0;min-height:100vh;display:flex;align-items:center;justify-content:center;font-family:system-ui,-apple-system,sans-serif;background:#f6f6f7;color:#202223}}
main{{max-width:28rem;padding:2rem;text-align:center}}
h1{{font-size:1.125rem;margin:0 0 .5rem}}
p{{margin:0 0 1rem;color:#6d7175;line-height:1.5}}
button{{font:inherit;padding:.5rem 1rem;border:1px solid #8c9196;border-radius:.375rem;background:#fff;cursor:pointer}}
</style>
</head>
<body data-placeholder="{kind}">
<main>
<h1>{title}</h1>
<p>{message}</p>
<div id="draftframe-retry-wrap"{hidden}>{retry_button}</div>
</main>
{script}</body>
</html>
"#,
            title = escape_html(self.title()),
            kind = self.kind(),
            message = escape_html(&self.message()),
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::NoCredential => "no-credential",
            Self::Unauthorized => "unauthorized",
            Self::NotReady => "not-ready",
            Self::Timeout => "timeout",
            Self::UpstreamError { .. } => "upstream-error",
        }
    }

    /// Status 200 HTML response that is never cached.
    pub fn into_response(self, retry_key: &str) -> Response {
        let mut response = (StatusCode::OK, self.render(retry_key)).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        response
    }
}

fn not_ready_script(retry_key: &str) -> String {
    let key = serde_json::to_string(&format!("draftframe:retry:{retry_key}"))
        .unwrap_or_else(|_| "\"draftframe:retry\"".to_string());
    format!(
        r#"<script>
(function () {{
  var key = {key};
  var max = {max};
  var base = {base};
  var state = {{ attempts: 0, at: 0 }};
  try {{ state = JSON.parse(sessionStorage.getItem(key)) || state; }} catch (e) {{}}
  if (Date.now() - state.at > 60000) state.attempts = 0;
  if (state.attempts >= max) {{
    document.getElementById('draftframe-retry-wrap').hidden = false;
    try {{ sessionStorage.removeItem(key); }} catch (e) {{}}
    return;
  }}
  state.attempts += 1;
  state.at = Date.now();
  try {{ sessionStorage.setItem(key, JSON.stringify(state)); }} catch (e) {{}}
  setTimeout(function () {{ location.reload(); }}, base * state.attempts);
}})();
</script>
"#,
        key = escape_script_json(&key),
        max = NOT_READY_MAX_RETRIES,
        base = NOT_READY_BASE_DELAY_MS,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_upstream_errors() {
        assert_eq!(
            Placeholder::for_error(&PreviewError::UpstreamNotReady),
            Some(Placeholder::NotReady)
        );
        assert_eq!(
            Placeholder::for_error(&PreviewError::upstream_status(502)),
            Some(Placeholder::UpstreamError { status: Some(502) })
        );
        assert_eq!(
            Placeholder::for_error(&PreviewError::CallerUnauthenticated),
            None
        );
    }

    #[test]
    fn not_ready_page_retries_with_growing_delay() {
        let html = Placeholder::NotReady.render("t1:/products/foo");
        assert!(html.contains("data-placeholder=\"not-ready\""));
        assert!(html.contains("sessionStorage"));
        assert!(html.contains("var max = 3;"));
        assert!(html.contains("base * state.attempts"));
        assert!(html.contains("id=\"draftframe-retry-wrap\" hidden"));
    }

    #[test]
    fn reconnect_page_has_no_retry() {
        let html = Placeholder::Unauthorized.render("t1:/");
        assert!(html.contains("Reconnect"));
        assert!(!html.contains("draftframe-retry\""));
    }

    #[test]
    fn retry_key_is_escaped() {
        let html = Placeholder::NotReady.render("t1:/x</script><script>alert(1)");
        assert_eq!(html.matches("</script>").count(), 1);
    }

    #[test]
    fn response_is_200_no_store() {
        let response = Placeholder::Timeout.into_response("t1:/");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    }
}
