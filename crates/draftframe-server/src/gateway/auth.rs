//! Caller authentication at the gateway boundary.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, header};
use cookie::Cookie;
use draftframe_core::PreviewError;
use subtle::{Choice, ConstantTimeEq};

use crate::config::AuthSettings;

/// Decides whether the calling user may use the gateway.
#[async_trait]
pub trait CallerAuthenticator: Send + Sync {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<(), PreviewError>;

    /// Cookie carrying the caller's gateway session, removed before forwarding upstream.
    fn session_cookie_name(&self) -> Option<&str> {
        None
    }
}

/// Accepts a fixed set of tokens, from `Authorization: Bearer` or the session cookie.
pub struct StaticTokenAuthenticator {
    enabled: bool,
    tokens: Vec<String>,
    cookie_name: String,
}

impl StaticTokenAuthenticator {
    pub fn new(settings: &AuthSettings) -> Self {
        Self {
            enabled: settings.enabled,
            tokens: settings
                .tokens
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            cookie_name: settings.cookie_name.clone(),
        }
    }

    /// Every configured token is compared so timing does not reveal which one matched.
    fn accepts(&self, candidate: &str) -> bool {
        self.tokens
            .iter()
            .fold(Choice::from(0), |matched, token| {
                matched | token.as_bytes().ct_eq(candidate.as_bytes())
            })
            .into()
    }
}

#[async_trait]
impl CallerAuthenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<(), PreviewError> {
        if !self.enabled {
            return Ok(());
        }

        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        if let Some(token) = bearer
            && self.accepts(token)
        {
            return Ok(());
        }

        if let Some(token) = cookie_value(headers, &self.cookie_name)
            && self.accepts(&token)
        {
            return Ok(());
        }

        tracing::debug!("caller presented no valid gateway token");
        Err(PreviewError::CallerUnauthenticated)
    }

    fn session_cookie_name(&self) -> Option<&str> {
        Some(&self.cookie_name)
    }
}

/// Cookies sent on the request, across all `Cookie` headers. Unparseable pairs are skipped.
fn request_cookies(headers: &HeaderMap) -> impl Iterator<Item = Cookie<'_>> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(Cookie::split_parse)
        .filter_map(Result::ok)
}

/// Value of the first cookie named `name`.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    request_cookies(headers)
        .find(|c| c.name() == name)
        .map(|c| c.value().to_string())
}

/// Merge the request's `Cookie` headers into one, dropping the named cookie.
pub fn strip_cookie(headers: &HeaderMap, name: &str) -> Option<HeaderValue> {
    let kept: Vec<String> = request_cookies(headers)
        .filter(|c| c.name() != name)
        .map(|c| c.stripped().to_string())
        .collect();
    if kept.is_empty() {
        return None;
    }
    HeaderValue::from_str(&kept.join("; ")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(enabled: bool) -> AuthSettings {
        AuthSettings {
            enabled,
            tokens: vec!["secret-1".into()],
            cookie_name: "draftframe_session".into(),
        }
    }

    #[tokio::test]
    async fn disabled_accepts_everyone() {
        let auth = StaticTokenAuthenticator::new(&settings(false));
        assert!(auth.authenticate(&HeaderMap::new()).await.is_ok());
    }

    #[tokio::test]
    async fn accepts_bearer_or_cookie() {
        let auth = StaticTokenAuthenticator::new(&settings(true));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer secret-1".parse().unwrap());
        assert!(auth.authenticate(&headers).await.is_ok());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            "cart=1; draftframe_session=secret-1".parse().unwrap(),
        );
        assert!(auth.authenticate(&headers).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_missing_or_wrong_token() {
        let auth = StaticTokenAuthenticator::new(&settings(true));
        assert_eq!(
            auth.authenticate(&HeaderMap::new()).await,
            Err(PreviewError::CallerUnauthenticated)
        );

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer secret-2".parse().unwrap());
        assert!(auth.authenticate(&headers).await.is_err());

        for candidate in ["secret", "secret-10", "SECRET-1", ""] {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::AUTHORIZATION,
                format!("Bearer {candidate}").parse().unwrap(),
            );
            assert!(auth.authenticate(&headers).await.is_err(), "{candidate} accepted");
        }
    }

    #[tokio::test]
    async fn any_configured_token_is_accepted() {
        let auth = StaticTokenAuthenticator::new(&AuthSettings {
            enabled: true,
            tokens: vec!["first".into(), " second ".into(), "".into()],
            cookie_name: "draftframe_session".into(),
        });
        for candidate in ["first", "second"] {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::AUTHORIZATION,
                format!("Bearer {candidate}").parse().unwrap(),
            );
            assert!(auth.authenticate(&headers).await.is_ok(), "{candidate} rejected");
        }
        assert!(!auth.accepts(""));
    }

    #[test]
    fn cookie_lookup_tolerates_spacing_and_junk() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, "junk; cart = 1 ;".parse().unwrap());
        headers.append(
            header::COOKIE,
            "draftframe_session=tok%3D1; draftframe_session=later".parse().unwrap(),
        );
        assert_eq!(cookie_value(&headers, "cart").as_deref(), Some("1"));
        assert_eq!(
            cookie_value(&headers, "draftframe_session").as_deref(),
            Some("tok%3D1")
        );
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn strips_gateway_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, "cart=1; draftframe_session=x".parse().unwrap());
        headers.append(header::COOKIE, "theme=dark".parse().unwrap());
        let merged = strip_cookie(&headers, "draftframe_session").unwrap();
        assert_eq!(merged, "cart=1; theme=dark");

        let mut only_gateway = HeaderMap::new();
        only_gateway.insert(header::COOKIE, "draftframe_session=x".parse().unwrap());
        assert!(strip_cookie(&only_gateway, "draftframe_session").is_none());
    }
}
