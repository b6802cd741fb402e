//! Response header rewriting and content classification.

use std::sync::LazyLock;

use axum::http::{HeaderMap, HeaderValue, header};
use cookie::{Cookie, SameSite};
use draftframe_core::ContentClass;
use regex::bytes::Regex;

/// Upstream headers copied to the client. Everything else is dropped.
const FORWARDED_HEADERS: &[&str] = &["content-language", "vary", "etag"];

static FULL_PAGE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<!doctype\s+html|<html[\s>]|<head[\s>]").expect("valid full page regex")
});

/// How a response body is treated after fetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    /// A complete HTML document; receives interceptor injection.
    FullPage,
    /// Partial HTML used by the origin's own scripts for re-rendering; body left untouched.
    Fragment,
    /// Anything that is not HTML.
    Asset,
}

impl PageKind {
    pub fn classify(class: ContentClass, body: &[u8]) -> Self {
        if !class.is_html() {
            Self::Asset
        } else if is_full_page(body) {
            Self::FullPage
        } else {
            Self::Fragment
        }
    }
}

/// True when the body carries a doctype, `<html>` or `<head>` opening tag, in any case.
pub fn is_full_page(body: &[u8]) -> bool {
    FULL_PAGE_MARKER.is_match(body)
}

/// Build the client-facing header set for an upstream response.
///
/// Only the allowlisted upstream headers survive. `Content-Type` is kept, `Cache-Control`
/// is synthesized from the content class and every `Set-Cookie` is rescoped to the gateway.
pub fn response_headers(upstream: &HeaderMap, class: ContentClass) -> HeaderMap {
    let mut headers = HeaderMap::new();

    if let Some(content_type) = upstream.get(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, content_type.clone());
    }
    for name in FORWARDED_HEADERS {
        for value in upstream.get_all(*name) {
            headers.append(*name, value.clone());
        }
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(class.cache_control()),
    );

    for cookie in upstream.get_all(header::SET_COOKIE) {
        let Ok(raw) = cookie.to_str() else {
            tracing::debug!("dropping non-ascii set-cookie header");
            continue;
        };
        let Some(rescoped) = rescope_cookie(raw) else {
            continue;
        };
        match HeaderValue::from_str(&rescoped) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(e) => tracing::debug!(error = %e, "dropping unrepresentable set-cookie header"),
        }
    }

    headers
}

/// Headers worth keeping in the response cache. Cookies are session specific and never
/// replayed from cache.
pub fn cacheable_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(content_type) = upstream.get(header::CONTENT_TYPE) {
        headers.insert(header::CONTENT_TYPE, content_type.clone());
    }
    for name in FORWARDED_HEADERS {
        for value in upstream.get_all(*name) {
            headers.append(*name, value.clone());
        }
    }
    headers
}

/// Rescope an upstream `Set-Cookie` value to the gateway origin.
///
/// `Domain` and `Secure` are removed and `SameSite` is forced to `Lax`. Values that do not
/// parse as a cookie are dropped.
pub fn rescope_cookie(raw: &str) -> Option<String> {
    let mut cookie = match Cookie::parse(raw) {
        Ok(cookie) => cookie,
        Err(e) => {
            tracing::debug!(error = %e, "dropping malformed set-cookie header");
            return None;
        }
    };
    cookie.unset_domain();
    cookie.set_secure(None);
    cookie.set_same_site(SameSite::Lax);
    Some(cookie.to_string())
}
