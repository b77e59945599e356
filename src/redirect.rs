//! Bounded redirect following with a per-pipeline endpoint cache

use crate::transport::{HttpResponse, HttpSender, OutboundRequest, TransportError, is_redirect};
use reqwest::Url;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Hops followed for one logical send before the last response is returned as-is
pub const MAX_REDIRECTS: u32 = 10;

/// Response at the end of a redirect chain
#[derive(Clone, Debug)]
pub struct RedirectOutcome {
    pub response: HttpResponse,
    /// Number of redirects that were followed to get here
    pub redirects: u32,
}

/// Follows 3xx responses and remembers where the endpoint moved to.
///
/// The cached URL is replaced whole under a write lock. Concurrent sends may
/// still start from a stale URL while a new redirect is being discovered.
#[derive(Debug)]
pub struct RedirectPolicy {
    cached: RwLock<Option<Url>>,
    max_redirects: u32,
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RedirectPolicy {
    pub fn new() -> Self {
        Self {
            cached: RwLock::new(None),
            max_redirects: MAX_REDIRECTS,
        }
    }

    /// Endpoint learned from the most recent redirect, if any
    pub async fn cached_url(&self) -> Option<Url> {
        self.cached.read().await.clone()
    }

    async fn remember(&self, url: Url) {
        let mut cached = self.cached.write().await;
        if cached.as_ref() != Some(&url) {
            info!("Ingestion endpoint redirected to {}", url);
        }
        *cached = Some(url);
    }

    /// Send `request`, following redirects up to [`MAX_REDIRECTS`] hops
    pub async fn execute(
        &self,
        sender: &dyn HttpSender,
        request: OutboundRequest,
    ) -> Result<RedirectOutcome, TransportError> {
        let mut request = match self.cached_url().await {
            Some(url) => request.with_url(url),
            None => request,
        };

        let mut response = sender.execute(request.clone()).await?;
        let mut redirects = 0;

        while is_redirect(response.status) {
            let Some(location) = response.location.as_deref() else {
                warn!("Redirect {} without a Location header", response.status);
                break;
            };

            if redirects >= self.max_redirects {
                warn!(
                    "Giving up after {} redirects, last status {}",
                    redirects, response.status
                );
                break;
            }

            let next = match request.url.join(location) {
                Ok(url) => url,
                Err(e) => {
                    warn!("Unusable redirect location {:?}: {}", location, e);
                    break;
                }
            };

            redirects += 1;
            debug!("Following redirect {} to {}", redirects, next);

            self.remember(next.clone()).await;
            request = request.with_url(next);
            response = sender.execute(request.clone()).await?;
        }

        Ok(RedirectOutcome {
            response,
            redirects,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and records every request it receives
    #[derive(Default)]
    pub(crate) struct ScriptedSender {
        responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        fallback: Option<u16>,
        pub(crate) requests: Mutex<Vec<OutboundRequest>>,
    }

    impl ScriptedSender {
        pub(crate) fn new(responses: Vec<Result<HttpResponse, TransportError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                fallback: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Answer with `status` once the script runs out
        pub(crate) fn always(status: u16) -> Self {
            Self {
                fallback: Some(status),
                ..Self::default()
            }
        }

        pub(crate) fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub(crate) fn urls(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.url.to_string())
                .collect()
        }
    }

    #[async_trait]
    impl HttpSender for ScriptedSender {
        async fn execute(&self, request: OutboundRequest) -> Result<HttpResponse, TransportError> {
            self.requests.lock().unwrap().push(request);
            let next = self.responses.lock().unwrap().pop_front();
            match (next, self.fallback) {
                (Some(response), _) => response,
                (None, Some(status)) => Ok(HttpResponse::new(status)),
                (None, None) => Err(TransportError::Connect("script exhausted".to_string())),
            }
        }
    }

    fn request() -> OutboundRequest {
        OutboundRequest::new(
            Url::parse("http://origin.example/v2/track").unwrap(),
            b"{}".to_vec(),
        )
    }

    fn redirect_to(url: &str) -> Result<HttpResponse, TransportError> {
        Ok(HttpResponse::new(307).with_location(url))
    }

    #[tokio::test]
    async fn test_direct_success() {
        let sender = ScriptedSender::new(vec![Ok(HttpResponse::new(200))]);
        let policy = RedirectPolicy::new();

        let outcome = policy.execute(&sender, request()).await.unwrap();
        assert_eq!(outcome.response.status, 200);
        assert_eq!(outcome.redirects, 0);
        assert!(policy.cached_url().await.is_none());
    }

    #[tokio::test]
    async fn test_ten_redirects_then_success() {
        let mut script: Vec<_> = (1..=10)
            .map(|i| redirect_to(&format!("http://hop{}.example/track", i)))
            .collect();
        script.push(Ok(HttpResponse::new(200)));
        let sender = ScriptedSender::new(script);
        let policy = RedirectPolicy::new();

        let outcome = policy.execute(&sender, request()).await.unwrap();
        assert_eq!(outcome.response.status, 200);
        assert_eq!(outcome.redirects, 10);
        assert_eq!(sender.request_count(), 11);
        assert_eq!(
            policy.cached_url().await.unwrap().as_str(),
            "http://hop10.example/track"
        );
    }

    #[tokio::test]
    async fn test_eleventh_redirect_is_returned_unfollowed() {
        let script: Vec<_> = (1..=12)
            .map(|i| redirect_to(&format!("http://hop{}.example/track", i)))
            .collect();
        let sender = ScriptedSender::new(script);
        let policy = RedirectPolicy::new();

        let outcome = policy.execute(&sender, request()).await.unwrap();
        assert_eq!(outcome.response.status, 307);
        assert_eq!(
            outcome.response.location.as_deref(),
            Some("http://hop11.example/track")
        );
        assert_eq!(outcome.redirects, 10);
        assert_eq!(sender.request_count(), 11);
    }

    #[tokio::test]
    async fn test_cached_url_used_for_next_send() {
        let sender = ScriptedSender::new(vec![
            redirect_to("http://moved.example/track"),
            Ok(HttpResponse::new(200)),
            Ok(HttpResponse::new(200)),
        ]);
        let policy = RedirectPolicy::new();

        policy.execute(&sender, request()).await.unwrap();
        let outcome = policy.execute(&sender, request()).await.unwrap();

        assert_eq!(outcome.redirects, 0);
        assert_eq!(
            sender.urls(),
            vec![
                "http://origin.example/v2/track",
                "http://moved.example/track",
                "http://moved.example/track",
            ]
        );
    }

    #[tokio::test]
    async fn test_relative_location_resolves_against_current_url() {
        let sender = ScriptedSender::new(vec![
            redirect_to("/v3/track"),
            Ok(HttpResponse::new(204)),
        ]);
        let policy = RedirectPolicy::new();

        policy.execute(&sender, request()).await.unwrap();
        assert_eq!(sender.urls()[1], "http://origin.example/v3/track");
    }

    #[tokio::test]
    async fn test_redirect_without_location_stops() {
        let sender = ScriptedSender::new(vec![Ok(HttpResponse::new(302))]);
        let policy = RedirectPolicy::new();

        let outcome = policy.execute(&sender, request()).await.unwrap();
        assert_eq!(outcome.response.status, 302);
        assert_eq!(outcome.redirects, 0);
        assert_eq!(sender.request_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_mid_chain_propagates() {
        let sender = ScriptedSender::new(vec![
            redirect_to("http://moved.example/track"),
            Err(TransportError::Timeout),
        ]);
        let policy = RedirectPolicy::new();

        let result = policy.execute(&sender, request()).await;
        assert_eq!(result.unwrap_err(), TransportError::Timeout);
    }
}
