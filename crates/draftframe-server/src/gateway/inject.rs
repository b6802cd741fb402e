//! Interceptor injection into full-page HTML.
//!
//! Three payloads go in right after the opening `<head>` tag: a `<base>` pointing at the
//! upstream origin, the request-rewriting interceptor and the host bridge. Without a head tag
//! they are prepended to the document.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Path of the public bridge script relative to the gateway origin.
pub const BRIDGE_SCRIPT_PATH: &str = "/preview/assets/bridge.js";

const INTERCEPTOR_TEMPLATE: &str = include_str!("../../assets/interceptor.js");
const CONFIG_PLACEHOLDER: &str = "__DRAFTFRAME_CONFIG__";

/// Bridge script body served from [`BRIDGE_SCRIPT_PATH`].
pub const BRIDGE_SCRIPT: &str = include_str!("../../assets/bridge.js");

static CSP_META: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<meta\b[^>]*http-equiv\s*=\s*["']?content-security-policy["']?[^>]*>"#)
        .expect("valid csp meta regex")
});

static SCRIPT_NONCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<script\b[^>]*\snonce\s*=\s*["']?([A-Za-z0-9+/=_-]+)"#)
        .expect("valid nonce regex")
});

static HEAD_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<head(?:\s[^>]*)?>").expect("valid head regex"));

/// Per-response parameters of the interceptor. Built fresh for every full-page response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptorConfig {
    /// Origin the embedding browser uses to reach the gateway, e.g. `https://gw.example.com`.
    pub gateway_origin: String,
    /// Proxy path for this tenant, e.g. `/preview/t1`.
    pub gateway_path_prefix: String,
    /// Upstream origin the page really belongs to, e.g. `https://shop.example.com`.
    pub upstream_origin: String,
    /// Upstream path and query of the page being rendered.
    pub upstream_path: String,
    /// `mode` query value to carry on rewritten URLs.
    pub mode: Option<&'static str>,
    /// Hosts, or `.suffix` patterns, treated as the same storefront.
    pub alternate_hosts: Vec<String>,
    /// URL substrings never rewritten.
    pub passthrough_patterns: Vec<String>,
    pub tenant_id: String,
}

/// Inject the base tag, interceptor and bridge into a full HTML document.
pub fn inject(html: &str, config: &InterceptorConfig) -> String {
    let html = strip_csp_meta(html);
    let nonce = extract_nonce(&html);
    let payload = render_payload(config, nonce.as_deref());

    match HEAD_OPEN.find(&html) {
        Some(head) => {
            let mut out = String::with_capacity(html.len() + payload.len());
            out.push_str(&html[..head.end()]);
            out.push_str(&payload);
            out.push_str(&html[head.end()..]);
            out
        }
        None => {
            tracing::debug!("no <head> tag found, prepending interceptor");
            let mut out = payload;
            out.push_str(&html);
            out
        }
    }
}

/// Remove inline `<meta http-equiv="Content-Security-Policy">` tags.
pub fn strip_csp_meta(html: &str) -> Cow<'_, str> {
    CSP_META.replace_all(html, "")
}

/// Nonce of the first script carrying one.
pub fn extract_nonce(html: &str) -> Option<String> {
    SCRIPT_NONCE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn render_payload(config: &InterceptorConfig, nonce: Option<&str>) -> String {
    let nonce_attr = nonce
        .map(|n| format!(" nonce=\"{}\"", escape_html(n)))
        .unwrap_or_default();

    let base = format!(
        "<base href=\"{}/\">",
        escape_html(config.upstream_origin.trim_end_matches('/'))
    );
    let interceptor = format!(
        "<script{nonce_attr}>{}</script>",
        render_interceptor(config)
    );
    let bridge = format!(
        "<script src=\"{}{}\" data-tenant=\"{}\" data-upstream-path=\"{}\" data-gateway-prefix=\"{}\" data-mode=\"{}\"{nonce_attr}></script>",
        escape_html(&config.gateway_origin),
        BRIDGE_SCRIPT_PATH,
        escape_html(&config.tenant_id),
        escape_html(&config.upstream_path),
        escape_html(&config.gateway_path_prefix),
        config.mode.unwrap_or_default(),
    );

    format!("{base}{interceptor}{bridge}")
}

fn render_interceptor(config: &InterceptorConfig) -> String {
    let json = match serde_json::to_string(config) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize interceptor config");
            "{}".to_string()
        }
    };
    INTERCEPTOR_TEMPLATE.replace(CONFIG_PLACEHOLDER, &escape_script_json(&json))
}

/// Make JSON text safe to embed inside a `<script>` element.
///
/// `<`, `>` and `&` become unicode escapes so `</script>` and `<!--` cannot appear, and the
/// JavaScript line terminators U+2028/U+2029 are escaped for older engines.
pub fn escape_script_json(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        match c {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

/// Escape text for HTML content and double- or single-quoted attribute values.
pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
