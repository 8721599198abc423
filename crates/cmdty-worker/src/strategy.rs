//! Caching strategies.
//!
//! Planning is pure: given the strategy and the cached copy, decide whether
//! to serve from cache, revalidate in the background, or wait for the
//! network. Network plans resolve through the fallback chain
//! network -> cached copy -> offline stub, so every request gets a response.

use crate::classify::{RequestClass, Route, Strategy};
use crate::error::FetchError;
use crate::http::Response;
use cmdty_core::BoxFuture;
use futures_util::future::Shared;
use serde::Serialize;
use tracing::debug;

/// A network fetch that several requests can await at once.
pub type SharedFetch = Shared<BoxFuture<'static, Result<Response, FetchError>>>;

/// Where a served response came from. Reported as `x-cache-source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseSource {
    Cache,
    Network,
    Offline,
}

impl ResponseSource {
    pub const HEADER: &'static str = "x-cache-source";

    pub fn header_value(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Network => "network",
            Self::Offline => "offline",
        }
    }
}

/// Response plus routing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterOutcome {
    pub response: Response,
    pub source: ResponseSource,
    pub class: RequestClass,
    /// `None` for requests that bypassed the strategies.
    pub strategy: Option<Strategy>,
}

impl RouterOutcome {
    pub fn routed(response: Response, source: ResponseSource, route: Route) -> Self {
        Self {
            response,
            source,
            class: route.class,
            strategy: Some(route.strategy),
        }
    }

    pub fn bypassed(response: Response, source: ResponseSource, class: RequestClass) -> Self {
        Self {
            response,
            source,
            class,
            strategy: None,
        }
    }

    /// Value of the `x-cache-source` header for this outcome.
    pub fn cache_source(&self) -> &'static str {
        self.source.header_value()
    }
}

/// What to do with a GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Serve the cached copy without touching the network.
    Serve(Response),
    /// Serve the cached copy and refresh it in the background.
    ServeAndRevalidate(Response),
    /// Wait for the network. `cached` is the fallback if it fails.
    Network { cached: Option<Response> },
}

pub fn plan(strategy: Strategy, cached: Option<Response>) -> Plan {
    match (strategy, cached) {
        (Strategy::CacheFirst, Some(response)) => Plan::Serve(response),
        (Strategy::StaleWhileRevalidate, Some(response)) => Plan::ServeAndRevalidate(response),
        (Strategy::NetworkFirst, cached) => Plan::Network { cached },
        (_, None) => Plan::Network { cached: None },
    }
}

/// Await `fetch`, falling back to `cached` and then `offline`.
pub async fn resolve_network(
    fetch: SharedFetch,
    cached: Option<Response>,
    offline: Response,
) -> (Response, ResponseSource) {
    match fetch.await {
        Ok(response) => (response, ResponseSource::Network),
        Err(e) => {
            debug!(error = %e, has_cached = cached.is_some(), "Network failed, falling back");
            match cached {
                Some(response) => (response, ResponseSource::Cache),
                None => (offline, ResponseSource::Offline),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    fn shared(result: Result<Response, FetchError>) -> SharedFetch {
        let fut: BoxFuture<'static, Result<Response, FetchError>> = Box::pin(async move { result });
        fut.shared()
    }

    #[test]
    fn test_plan_table() {
        let cached = Response::new(200, "c");
        assert_eq!(
            plan(Strategy::CacheFirst, Some(cached.clone())),
            Plan::Serve(cached.clone())
        );
        assert_eq!(plan(Strategy::CacheFirst, None), Plan::Network { cached: None });
        assert_eq!(
            plan(Strategy::NetworkFirst, Some(cached.clone())),
            Plan::Network {
                cached: Some(cached.clone())
            }
        );
        assert_eq!(
            plan(Strategy::StaleWhileRevalidate, Some(cached.clone())),
            Plan::ServeAndRevalidate(cached)
        );
        assert_eq!(
            plan(Strategy::StaleWhileRevalidate, None),
            Plan::Network { cached: None }
        );
    }

    #[tokio::test]
    async fn test_fallback_chain() {
        let offline = Response::new(503, "offline");
        let cached = Response::new(200, "cached");
        let fresh = Response::new(200, "fresh");

        let (resp, source) =
            resolve_network(shared(Ok(fresh.clone())), Some(cached.clone()), offline.clone()).await;
        assert_eq!((resp, source), (fresh, ResponseSource::Network));

        let down = || shared(Err(FetchError::Network("down".into())));
        let (resp, source) = resolve_network(down(), Some(cached.clone()), offline.clone()).await;
        assert_eq!((resp, source), (cached, ResponseSource::Cache));

        let (resp, source) = resolve_network(down(), None, offline.clone()).await;
        assert_eq!((resp, source), (offline, ResponseSource::Offline));
    }
}
