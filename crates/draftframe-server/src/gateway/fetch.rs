//! Redirect-preserving upstream fetcher.
//!
//! Redirects are followed by hand so that every hop keeps the credential headers and the
//! variant query parameter. A library client following redirects itself drops custom
//! headers on cross-origin hops and keeps whatever query the upstream chose.
//!
//! For trust-delegation sessions the relay answers a rejected credential with a redirect
//! to the origin's public storefront. Such a redirect ends the fetch with a synthesized
//! `401` instead of rendering public content that merely looks like a successful preview.

use std::time::{Duration, Instant};

use axum::http::{HeaderMap, Method, StatusCode, header};
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::config::UpstreamSettings;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream request to {url} timed out after {timeout:?}")]
    Timeout { url: Url, timeout: Duration },

    #[error("upstream request to {url} failed: {source}")]
    Transport {
        url: Url,
        #[source]
        source: reqwest::Error,
    },

    #[error("redirect loop detected at {url}")]
    RedirectLoop { url: Url },

    #[error("invalid redirect location '{location}'")]
    InvalidLocation { location: String },
}

/// One upstream fetch, possibly spanning several redirect hops.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub variant_id: Option<String>,
    /// Redirects must stay on the initial URL's host (the relay).
    pub trust_delegation: bool,
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub final_url: Url,
    /// URLs requested by the manual redirect loop, in order.
    pub redirect_chain: Vec<Url>,
    /// Set when a trust-delegation redirect left the relay and the fetch was stopped.
    pub rejected_redirect: Option<Url>,
}

impl UpstreamResponse {
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

pub struct RedirectFetcher {
    manual: reqwest::Client,
    fallback: reqwest::Client,
    variant_param: String,
    hop_timeout: Duration,
    max_hops: usize,
}

impl RedirectFetcher {
    pub fn new(settings: &UpstreamSettings) -> Result<Self, reqwest::Error> {
        let manual = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(settings.user_agent.clone())
            .build()?;
        let fallback = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()?;

        Ok(Self {
            manual,
            fallback,
            variant_param: settings.variant_param.clone(),
            hop_timeout: settings.hop_timeout(),
            max_hops: settings.max_hops,
        })
    }

    /// Fetch `request.url`, following up to `max_hops` redirects manually, then one
    /// final request with library redirect handling.
    #[instrument(skip(self, request), fields(url = %request.url, method = %request.method))]
    pub async fn fetch(&self, request: FetchRequest) -> Result<UpstreamResponse, FetchError> {
        let relay_authority = request.trust_delegation.then(|| authority(&request.url));
        let mut url = self.with_variant(request.url, request.variant_id.as_deref());
        let mut method = request.method;
        let mut body = request.body;
        let mut chain: Vec<Url> = Vec::with_capacity(self.max_hops);

        for _ in 0..self.max_hops {
            if chain.contains(&url) {
                warn!(url = %url, "redirect loop detected");
                return Err(FetchError::RedirectLoop { url });
            }
            chain.push(url.clone());

            let hop = self
                .send(&self.manual, &method, &url, &request.headers, body.clone())
                .await?;

            if !is_redirect(hop.status) {
                return Ok(hop.into_response(chain));
            }
            let Some(location) = hop
                .headers
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                return Ok(hop.into_response(chain));
            };

            let next = url
                .join(location)
                .map_err(|_| FetchError::InvalidLocation {
                    location: location.to_string(),
                })?;

            if let Some(relay) = &relay_authority
                && authority(&next) != *relay
            {
                warn!(
                    from = %url,
                    to = %next,
                    "relay redirected away from itself; credential rejected"
                );
                return Ok(UpstreamResponse {
                    status: StatusCode::UNAUTHORIZED,
                    headers: HeaderMap::new(),
                    body: Bytes::new(),
                    final_url: url,
                    redirect_chain: chain,
                    rejected_redirect: Some(next),
                });
            }

            debug!(status = %hop.status, to = %next, "following redirect");
            if hop.status == StatusCode::SEE_OTHER
                || (matches!(hop.status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
                    && method != Method::GET
                    && method != Method::HEAD)
            {
                method = Method::GET;
                body = None;
            }
            url = self.with_variant(next, request.variant_id.as_deref());
        }

        warn!(
            hops = self.max_hops,
            url = %url,
            "redirect limit reached, retrying with library redirect handling"
        );
        let hop = self
            .send(&self.fallback, &method, &url, &request.headers, body)
            .await?;
        Ok(hop.into_response(chain))
    }

    /// Ensure the variant-identifying query parameter is present.
    fn with_variant(&self, mut url: Url, variant_id: Option<&str>) -> Url {
        let Some(variant_id) = variant_id else {
            return url;
        };
        let present = url.query_pairs().any(|(k, _)| k == self.variant_param.as_str());
        if !present {
            url.query_pairs_mut()
                .append_pair(&self.variant_param, variant_id);
        }
        url
    }

    async fn send(
        &self,
        client: &reqwest::Client,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<Hop, FetchError> {
        let started = Instant::now();
        let mut builder = client
            .request(method.clone(), url.clone())
            .headers(headers.clone())
            .header(header::ACCEPT_ENCODING, "identity");
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let final_url = response.url().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(Hop {
                status,
                headers,
                body,
                final_url,
            })
        };

        let hop = match tokio::time::timeout(self.hop_timeout, exchange).await {
            Err(_) => {
                return Err(FetchError::Timeout {
                    url: url.clone(),
                    timeout: self.hop_timeout,
                });
            }
            Ok(Err(e)) if e.is_timeout() => {
                return Err(FetchError::Timeout {
                    url: url.clone(),
                    timeout: self.hop_timeout,
                });
            }
            Ok(Err(source)) => {
                return Err(FetchError::Transport {
                    url: url.clone(),
                    source,
                });
            }
            Ok(Ok(hop)) => hop,
        };

        crate::metrics::record_upstream_request(hop.status.as_u16(), started.elapsed());
        debug!(url = %url, status = %hop.status, "upstream hop completed");
        Ok(hop)
    }
}

struct Hop {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    final_url: Url,
}

impl Hop {
    fn into_response(self, chain: Vec<Url>) -> UpstreamResponse {
        UpstreamResponse {
            status: self.status,
            headers: self.headers,
            body: self.body,
            final_url: self.final_url,
            redirect_chain: chain,
            rejected_redirect: None,
        }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Host and effective port; redirects to another port are a different authority.
fn authority(url: &Url) -> (Option<String>, Option<u16>) {
    (
        url.host_str().map(|h| h.to_ascii_lowercase()),
        url.port_or_known_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(max_hops: usize, hop_timeout_ms: u64) -> RedirectFetcher {
        let settings = UpstreamSettings {
            max_hops,
            hop_timeout_ms,
            ..UpstreamSettings::default()
        };
        RedirectFetcher::new(&settings).unwrap()
    }

    fn request(url: &str, variant: Option<&str>, trust_delegation: bool) -> FetchRequest {
        FetchRequest {
            method: Method::GET,
            url: Url::parse(url).unwrap(),
            headers: HeaderMap::new(),
            body: None,
            variant_id: variant.map(String::from),
            trust_delegation,
        }
    }

    fn redirect_to(location: &str) -> ResponseTemplate {
        ResponseTemplate::new(302).insert_header("location", location)
    }

    #[test]
    fn variant_added_only_when_missing() {
        let f = fetcher(5, 1000);
        let url = f.with_variant(Url::parse("https://x.test/a?b=1").unwrap(), Some("9"));
        assert_eq!(url.as_str(), "https://x.test/a?b=1&preview_variant_id=9");
        let url = f.with_variant(
            Url::parse("https://x.test/a?preview_variant_id=3").unwrap(),
            Some("9"),
        );
        assert_eq!(url.as_str(), "https://x.test/a?preview_variant_id=3");
        let url = f.with_variant(Url::parse("https://x.test/a").unwrap(), None);
        assert_eq!(url.as_str(), "https://x.test/a");
    }

    #[tokio::test]
    async fn every_hop_carries_variant_param() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/start"))
            .and(query_param("preview_variant_id", "42"))
            .respond_with(redirect_to("/second"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/second"))
            .and(query_param("preview_variant_id", "42"))
            .respond_with(redirect_to(&format!("{}/third?x=1", server.uri())))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/third"))
            .and(query_param("preview_variant_id", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_string("done"))
            .expect(1)
            .mount(&server)
            .await;

        let response = fetcher(5, 2_000)
            .fetch(request(&format!("{}/start", server.uri()), Some("42"), true))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"done"));
        assert_eq!(response.redirect_chain.len(), 3);
        for url in &response.redirect_chain {
            assert!(
                url.query_pairs()
                    .any(|(k, v)| k == "preview_variant_id" && v == "42"),
                "{url} lacks variant"
            );
        }
        assert!(response.rejected_redirect.is_none());
    }

    #[tokio::test]
    async fn relay_redirect_to_other_host_is_unauthorized() {
        let relay = MockServer::start().await;
        let origin = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/products/foo"))
            .respond_with(redirect_to(&format!("{}/password", origin.uri())))
            .expect(1)
            .mount(&relay)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("public"))
            .expect(0)
            .mount(&origin)
            .await;

        let response = fetcher(5, 2_000)
            .fetch(request(
                &format!("{}/products/foo", relay.uri()),
                Some("1"),
                true,
            ))
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(response.redirect_chain.len(), 1);
        assert!(response.rejected_redirect.is_some());
    }

    #[tokio::test]
    async fn cross_host_redirect_followed_without_trust_delegation() {
        let first = MockServer::start().await;
        let second = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(redirect_to(&format!("{}/landing", second.uri())))
            .mount(&first)
            .await;
        Mock::given(method("GET"))
            .and(path("/landing"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&second)
            .await;

        let response = fetcher(5, 2_000)
            .fetch(request(&first.uri(), None, false))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.redirect_chain.len(), 2);
    }

    #[tokio::test]
    async fn slow_hop_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let err = fetcher(5, 50)
            .fetch(request(&server.uri(), None, false))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn redirect_loop_is_detected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(redirect_to("/b"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(redirect_to("/a"))
            .mount(&server)
            .await;

        let err = fetcher(5, 2_000)
            .fetch(request(&format!("{}/a", server.uri()), None, false))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RedirectLoop { .. }), "{err}");
    }

    #[tokio::test]
    async fn hop_limit_falls_back_to_library_redirects() {
        let server = MockServer::start().await;
        for (from, to) in [("/r1", "/r2"), ("/r2", "/r3"), ("/r3", "/r4")] {
            Mock::given(method("GET"))
                .and(path(from))
                .respond_with(redirect_to(to))
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/r4"))
            .respond_with(ResponseTemplate::new(200).set_body_string("final"))
            .mount(&server)
            .await;

        let response = fetcher(2, 2_000)
            .fetch(request(&format!("{}/r1", server.uri()), None, false))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"final"));
        assert_eq!(response.redirect_chain.len(), 2);
        assert_eq!(response.final_url.path(), "/r4");
    }

    #[tokio::test]
    async fn see_other_switches_post_to_get() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cart/add"))
            .respond_with(ResponseTemplate::new(303).insert_header("location", "/cart"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cart"))
            .respond_with(ResponseTemplate::new(200).set_body_string("cart"))
            .expect(1)
            .mount(&server)
            .await;

        let mut req = request(&format!("{}/cart/add", server.uri()), None, false);
        req.method = Method::POST;
        req.body = Some(Bytes::from_static(b"id=1"));
        let response = fetcher(5, 2_000).fetch(req).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"cart"));
    }
}
