//! `/preview/{tenantId}` request handling.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use cookie::Cookie;
use draftframe_core::{
    ContentClass, Credential, Diagnosis, PreviewError, PreviewMode, PreviewSession,
    SessionOutcome, UpstreamTarget, classify,
};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::auth::strip_cookie;
use super::error::GatewayError;
use super::fetch::{FetchError, FetchRequest, UpstreamResponse};
use super::inject::{self, BRIDGE_SCRIPT, InterceptorConfig};
use super::placeholder::Placeholder;
use super::transform::{self, PageKind};
use crate::cache::{CacheEntry, CacheKey};
use crate::server::AppState;

pub const X_GATEWAY_SESSION: &str = "x-gateway-session";
pub const X_GATEWAY_CACHE: &str = "x-gateway-cache";
pub const X_GATEWAY_DIAG: &str = "x-gateway-diag";

/// Client request headers passed on to the upstream. `cookie` is handled separately.
const FORWARDED_REQUEST_HEADERS: &[&str] = &[
    "accept",
    "accept-language",
    "content-type",
    "user-agent",
    "x-requested-with",
];

/// Parsed gateway query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewParams {
    /// Upstream path and query, always starting with `/`.
    pub path: String,
    pub mode: PreviewMode,
    pub diag: bool,
}

impl PreviewParams {
    /// `path`, `mode` and `diag` are consumed here; any other key is folded into the
    /// upstream query, which is how GET forms submitted through the interceptor arrive.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self, GatewayError> {
        let mut path = None;
        let mut mode = None;
        let mut diag = false;
        let mut extra = url::form_urlencoded::Serializer::new(String::new());
        let mut has_extra = false;

        for (key, value) in pairs {
            match key.as_str() {
                "path" => path = Some(value.as_str()),
                "mode" => mode = Some(value.as_str()),
                "diag" => diag = matches!(value.as_str(), "1" | "true"),
                _ => {
                    extra.append_pair(key, value);
                    has_extra = true;
                }
            }
        }

        let raw = path.map(str::trim).filter(|p| !p.is_empty()).unwrap_or("/");
        let raw = raw.split('#').next().unwrap_or("/");
        if !raw.starts_with('/') || raw.starts_with("//") || raw.contains('\\') {
            return Err(GatewayError::BadRequest(format!(
                "path must be an origin-relative path, got '{raw}'"
            )));
        }

        let path = if has_extra {
            let separator = if raw.contains('?') { '&' } else { '?' };
            format!("{raw}{separator}{}", extra.finish())
        } else {
            raw.to_string()
        };

        Ok(Self {
            path,
            mode: PreviewMode::parse(mode),
            diag,
        })
    }
}

/// `GET|POST /preview/{tenantId}`
#[instrument(skip_all, fields(tenant_id = %tenant_id, method = %method))]
pub async fn preview(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, GatewayError> {
    let params = PreviewParams::from_pairs(&pairs)?;

    let outcome = state
        .resolver
        .resolve(&tenant_id, params.mode)
        .await
        .map_err(|e| GatewayError::Internal(e.to_string()))?;
    let session_label = outcome.header_value();

    let session = match outcome {
        SessionOutcome::Ready(session) => session,
        other => {
            let err = match other.into_session(&tenant_id) {
                Err(err) => err,
                Ok(_) => PreviewError::upstream_other("unexpected session state"),
            };
            info!(reason = err.kind(), "rendering placeholder without upstream fetch");
            return Ok(placeholder_response(&err, &tenant_id, &params, session_label, None));
        }
    };

    let request = PreviewContext {
        state: &state,
        tenant_id: &tenant_id,
        params: &params,
        session: &session,
        session_label,
        headers: &headers,
    };

    let cache_key = CacheKey::new(&tenant_id, &params.path, &session.mode_suffix());
    let cacheable = method == Method::GET && state.config.cache.enabled;

    if cacheable && let Some(entry) = state.cache.get(&cache_key) {
        debug!(key = %cache_key, "serving from cache");
        return Ok(request.respond_cached(entry).await);
    }

    let upstream = match request.fetch(method, body).await? {
        Ok(upstream) => upstream,
        Err(err) => {
            return Ok(placeholder_response(
                &err,
                &tenant_id,
                &params,
                session_label,
                None,
            ));
        }
    };

    let diagnosis = (params.diag && upstream.status.as_u16() >= 400)
        .then(|| classify(upstream.status.as_u16(), &params.path));
    if let Some(diagnosis) = &diagnosis {
        info!(
            status = upstream.status.as_u16(),
            category = diagnosis.category.as_str(),
            reason = %diagnosis.reason,
            "upstream diagnostics"
        );
    }

    if let Some(err) = upstream_failure(&upstream) {
        warn!(
            status = upstream.status.as_u16(),
            reason = err.kind(),
            "upstream request failed"
        );
        return Ok(placeholder_response(
            &err,
            &tenant_id,
            &params,
            session_label,
            diagnosis.as_ref(),
        ));
    }

    let class = ContentClass::classify(upstream.content_type(), &params.path);
    let kind = PageKind::classify(class, &upstream.body);

    if cacheable && upstream.status.is_success() {
        state.cache.set(
            &cache_key,
            CacheEntry::new(
                upstream.status,
                transform::cacheable_headers(&upstream.headers),
                upstream.body.clone(),
                class,
                kind == PageKind::FullPage,
            ),
        );
    }

    Ok(request.respond_fresh(upstream, class, kind, diagnosis.as_ref()).await)
}

/// `POST /preview/{tenantId}/invalidate`
pub async fn invalidate(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> impl IntoResponse {
    let removed = state.cache.invalidate_prefix(&tenant_id);
    (
        StatusCode::OK,
        Json(json!({ "tenantId": tenant_id, "removed": removed })),
    )
}

/// `GET /preview/assets/bridge.js`
pub async fn bridge_script() -> impl IntoResponse {
    (
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/javascript; charset=utf-8"),
            ),
            (
                header::CACHE_CONTROL,
                HeaderValue::from_static(draftframe_core::STATIC_CACHE_CONTROL),
            ),
        ],
        BRIDGE_SCRIPT,
    )
}

struct PreviewContext<'a> {
    state: &'a AppState,
    tenant_id: &'a str,
    params: &'a PreviewParams,
    session: &'a PreviewSession,
    session_label: &'static str,
    headers: &'a HeaderMap,
}

impl PreviewContext<'_> {
    /// Outer error: gateway misconfiguration. Inner error: upstream failure for a placeholder.
    async fn fetch(
        &self,
        method: Method,
        body: Bytes,
    ) -> Result<Result<UpstreamResponse, PreviewError>, GatewayError> {
        let url = self.upstream_url()?;
        let headers = self.upstream_headers()?;
        let body = (method != Method::GET && method != Method::HEAD).then_some(body);

        let request = FetchRequest {
            method,
            url,
            headers,
            body,
            variant_id: self.session.variant_id.clone(),
            trust_delegation: self.session.is_trust_delegation(),
        };

        match self.state.fetcher.fetch(request).await {
            Ok(response) => Ok(Ok(response)),
            Err(FetchError::Timeout { timeout, .. }) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "upstream timed out");
                Ok(Err(PreviewError::UpstreamTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                }))
            }
            Err(e) => {
                warn!(error = %e, "upstream fetch failed");
                Ok(Err(PreviewError::upstream_other(e.to_string())))
            }
        }
    }

    fn upstream_url(&self) -> Result<Url, GatewayError> {
        let base = match &self.session.upstream {
            UpstreamTarget::Relay => self
                .state
                .config
                .upstream
                .relay_url
                .clone()
                .ok_or_else(|| GatewayError::Internal("upstream.relay_url is not configured".into()))?,
            UpstreamTarget::Base(base) => base.to_string(),
        };
        let joined = format!("{}{}", base.trim_end_matches('/'), self.params.path);
        Url::parse(&joined)
            .map_err(|e| GatewayError::BadRequest(format!("invalid upstream url '{joined}': {e}")))
    }

    fn upstream_headers(&self) -> Result<HeaderMap, GatewayError> {
        let settings = &self.state.config.upstream;
        let mut headers = HeaderMap::new();
        for name in FORWARDED_REQUEST_HEADERS {
            if let Some(value) = self.headers.get(*name) {
                headers.insert(*name, value.clone());
            }
        }

        let gateway_cookie = self
            .state
            .authenticator
            .session_cookie_name()
            .unwrap_or_default();
        let mut cookie = strip_cookie(self.headers, gateway_cookie)
            .and_then(|v| v.to_str().ok().map(str::to_string));

        match &self.session.credential {
            Some(Credential::TrustDelegation(secret)) => {
                headers.insert(
                    header_name(&settings.relay_store_header)?,
                    header_value(&self.session.origin_domain, false)?,
                );
                headers.insert(
                    header_name(&settings.relay_token_header)?,
                    header_value(secret, true)?,
                );
            }
            Some(Credential::CookieToken(secret)) => {
                let token =
                    Cookie::new(settings.cookie_token_name.as_str(), secret.as_str()).to_string();
                cookie = Some(match cookie {
                    Some(existing) => format!("{existing}; {token}"),
                    None => token,
                });
            }
            Some(Credential::BearerToken(secret)) => {
                headers.insert(
                    header::AUTHORIZATION,
                    header_value(&format!("Bearer {secret}"), true)?,
                );
            }
            None => {}
        }

        if let Some(cookie) = cookie {
            let sensitive = matches!(self.session.credential, Some(Credential::CookieToken(_)));
            headers.insert(header::COOKIE, header_value(&cookie, sensitive)?);
        }
        Ok(headers)
    }

    async fn respond_cached(&self, entry: CacheEntry) -> Response {
        if let Some(etag) = &entry.etag
            && if_none_match(self.headers, etag)
        {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(etag) {
                headers.insert(header::ETAG, value);
            }
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static(entry.class.cache_control()),
            );
            crate::metrics::record_preview_request(self.session_label, "not_modified");
            return self.decorate(response, "HIT", None);
        }

        let headers = transform::response_headers(&entry.headers, entry.class);
        let body = if entry.is_full_page {
            self.inject(&entry.body).await
        } else {
            entry.body
        };
        crate::metrics::record_preview_request(self.session_label, "hit");
        self.decorate((entry.status, headers, body).into_response(), "HIT", None)
    }

    async fn respond_fresh(
        &self,
        upstream: UpstreamResponse,
        class: ContentClass,
        kind: PageKind,
        diagnosis: Option<&Diagnosis>,
    ) -> Response {
        let mut headers = transform::response_headers(&upstream.headers, class);
        if upstream.status.is_redirection()
            && let Some(location) = self.rewrite_location(&upstream)
        {
            headers.insert(header::LOCATION, location);
        }

        let body = if kind == PageKind::FullPage {
            self.inject(&upstream.body).await
        } else {
            upstream.body
        };
        crate::metrics::record_preview_request(self.session_label, "miss");
        self.decorate(
            (upstream.status, headers, body).into_response(),
            "MISS",
            diagnosis,
        )
    }

    async fn inject(&self, body: &Bytes) -> Bytes {
        let Ok(html) = std::str::from_utf8(body) else {
            warn!("full page is not valid UTF-8, skipping injection");
            return body.clone();
        };
        let config = self.interceptor_config().await;
        Bytes::from(inject::inject(html, &config))
    }

    async fn interceptor_config(&self) -> InterceptorConfig {
        let settings = &self.state.config.injection;
        let upstream_origin = self.session.origin.origin().ascii_serialization();

        let mut alternate_hosts = Vec::new();
        if let Some(host) = self.session.origin.host_str()
            && host != self.session.origin_domain
        {
            alternate_hosts.push(self.session.origin_domain.clone());
        }
        if let Some(custom) = self
            .state
            .domains
            .resolve(self.tenant_id, &self.session.origin_domain)
            .await
        {
            alternate_hosts.push(custom);
        }
        alternate_hosts.extend(settings.alternate_host_suffixes.iter().cloned());

        InterceptorConfig {
            gateway_origin: gateway_origin(self.state, self.headers),
            gateway_path_prefix: format!("/preview/{}", self.tenant_id),
            upstream_origin,
            upstream_path: self.params.path.clone(),
            mode: self.params.mode.query_value(),
            alternate_hosts,
            passthrough_patterns: settings.passthrough_patterns.clone(),
            tenant_id: self.tenant_id.to_string(),
        }
    }

    /// Point an unresolved redirect back at the gateway when it targets the storefront.
    fn rewrite_location(&self, upstream: &UpstreamResponse) -> Option<HeaderValue> {
        let raw = upstream
            .headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())?;
        let target = upstream.final_url.join(raw).ok()?;
        let storefront_hosts = [
            upstream.final_url.host_str(),
            self.session.origin.host_str(),
            Some(self.session.origin_domain.as_str()),
        ];
        if !storefront_hosts.contains(&target.host_str()) {
            return HeaderValue::from_str(target.as_str()).ok();
        }

        let mut path = target.path().to_string();
        if let Some(query) = target.query() {
            path.push('?');
            path.push_str(query);
        }
        let proxied = gateway_url(
            &gateway_origin(self.state, self.headers),
            self.tenant_id,
            &path,
            self.params.mode,
        );
        HeaderValue::from_str(&proxied).ok()
    }

    fn decorate(
        &self,
        response: Response,
        cache: &'static str,
        diagnosis: Option<&Diagnosis>,
    ) -> Response {
        with_gateway_headers(response, self.session_label, cache, diagnosis)
    }
}

/// Map a completed upstream exchange to the failure it represents, if any.
fn upstream_failure(upstream: &UpstreamResponse) -> Option<PreviewError> {
    let status = upstream.status.as_u16();
    match upstream.status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            if let Some(rejected) = &upstream.rejected_redirect {
                info!(redirect = %rejected, "relay rejected the preview credential");
            }
            Some(PreviewError::UpstreamUnauthorized { status })
        }
        StatusCode::UNPROCESSABLE_ENTITY => Some(PreviewError::UpstreamNotReady),
        s if s.is_server_error() => Some(PreviewError::upstream_status(status)),
        _ => None,
    }
}

fn placeholder_response(
    err: &PreviewError,
    tenant_id: &str,
    params: &PreviewParams,
    session_label: &'static str,
    diagnosis: Option<&Diagnosis>,
) -> Response {
    crate::metrics::record_preview_request(session_label, err.kind());
    let placeholder = Placeholder::for_error(err).unwrap_or(Placeholder::UpstreamError { status: None });
    let retry_key = format!("{tenant_id}:{}", params.path);
    with_gateway_headers(
        placeholder.into_response(&retry_key),
        session_label,
        "MISS",
        diagnosis,
    )
}

fn with_gateway_headers(
    mut response: Response,
    session_label: &'static str,
    cache: &'static str,
    diagnosis: Option<&Diagnosis>,
) -> Response {
    let headers = response.headers_mut();
    headers.insert(X_GATEWAY_SESSION, HeaderValue::from_static(session_label));
    headers.insert(X_GATEWAY_CACHE, HeaderValue::from_static(cache));
    if let Some(diagnosis) = diagnosis {
        headers.insert(
            X_GATEWAY_DIAG,
            HeaderValue::from_static(diagnosis.category.as_str()),
        );
    }
    response
}

/// True when `If-None-Match` lists `etag` (weak comparison) or `*`.
fn if_none_match(headers: &HeaderMap, etag: &str) -> bool {
    let strip_weak = |tag: &str| tag.trim().trim_start_matches("W/").to_string();
    let etag = strip_weak(etag);
    headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|candidate| candidate.trim() == "*" || strip_weak(candidate) == etag)
}

/// Origin the browser uses for the gateway: configured public URL, else forwarded or `Host`.
pub fn gateway_origin(state: &AppState, headers: &HeaderMap) -> String {
    if let Some(public) = &state.config.server.public_url {
        return public.trim_end_matches('/').to_string();
    }
    let host = headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    format!("{proto}://{host}")
}

/// Gateway URL rendering `path` for a tenant.
pub fn gateway_url(origin: &str, tenant_id: &str, path: &str, mode: PreviewMode) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("path", path);
    if let Some(mode) = mode.query_value() {
        query.append_pair("mode", mode);
    }
    format!("{origin}/preview/{tenant_id}?{}", query.finish())
}

fn header_name(name: &str) -> Result<HeaderName, GatewayError> {
    HeaderName::try_from(name)
        .map_err(|e| GatewayError::Internal(format!("invalid header name '{name}': {e}")))
}

fn header_value(value: &str, sensitive: bool) -> Result<HeaderValue, GatewayError> {
    let mut value = HeaderValue::from_str(value)
        .map_err(|e| GatewayError::Internal(format!("invalid header value: {e}")))?;
    value.set_sensitive(sensitive);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn params_default_to_root() {
        let params = PreviewParams::from_pairs(&[]).unwrap();
        assert_eq!(params.path, "/");
        assert_eq!(params.mode, PreviewMode::Default);
        assert!(!params.diag);
    }

    #[test]
    fn extra_params_are_folded_into_path() {
        let params = PreviewParams::from_pairs(&pairs(&[
            ("path", "/search?type=product"),
            ("q", "red shoes"),
            ("mode", "cli"),
            ("diag", "1"),
        ]))
        .unwrap();
        assert_eq!(params.path, "/search?type=product&q=red+shoes");
        assert_eq!(params.mode, PreviewMode::Cli);
        assert!(params.diag);

        let params =
            PreviewParams::from_pairs(&pairs(&[("path", "/search"), ("q", "x")])).unwrap();
        assert_eq!(params.path, "/search?q=x");
    }

    #[test]
    fn absolute_paths_are_rejected() {
        for bad in ["https://evil.example.com/", "//evil.example.com/x", "products", "/\\evil"] {
            assert!(
                PreviewParams::from_pairs(&pairs(&[("path", bad)])).is_err(),
                "{bad} accepted"
            );
        }
    }

    #[test]
    fn etag_matching() {
        let mut headers = HeaderMap::new();
        headers.insert(header::IF_NONE_MATCH, "W/\"a\", \"b\"".parse().unwrap());
        assert!(if_none_match(&headers, "\"a\""));
        assert!(if_none_match(&headers, "\"b\""));
        assert!(!if_none_match(&headers, "\"c\""));
        assert!(!if_none_match(&HeaderMap::new(), "\"a\""));
    }

    #[test]
    fn gateway_url_encodes_path() {
        assert_eq!(
            gateway_url("https://gw.example.com", "t1", "/cart?x=1", PreviewMode::DevStore),
            "https://gw.example.com/preview/t1?path=%2Fcart%3Fx%3D1&mode=devstore"
        );
    }

    #[test]
    fn status_mapping() {
        let response = |status: u16| UpstreamResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            final_url: Url::parse("https://relay.example.com/").unwrap(),
            redirect_chain: Vec::new(),
            rejected_redirect: None,
        };
        assert_eq!(
            upstream_failure(&response(401)),
            Some(PreviewError::UpstreamUnauthorized { status: 401 })
        );
        assert_eq!(
            upstream_failure(&response(422)),
            Some(PreviewError::UpstreamNotReady)
        );
        assert!(matches!(
            upstream_failure(&response(503)),
            Some(PreviewError::UpstreamOtherError { status: Some(503), .. })
        ));
        assert_eq!(upstream_failure(&response(404)), None);
        assert_eq!(upstream_failure(&response(200)), None);
    }
}
