//! Request classification and strategy routing.

use crate::asset_cache::PartitionKind;
use crate::http::Request;
use serde::Serialize;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg", "ico", "avif"];
const STATIC_EXTENSIONS: &[&str] = &["js", "mjs", "css", "woff", "woff2", "ttf", "otf", "webmanifest"];
const STATIC_PREFIXES: &[&str] = &["/static/", "/_next/static/"];

/// Request category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    StaticAsset,
    Api,
    Image,
    Other,
}

impl RequestClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaticAsset => "static_asset",
            Self::Api => "api",
            Self::Image => "image",
            Self::Other => "other",
        }
    }
}

/// Caching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    CacheFirst,
    NetworkFirst,
    StaleWhileRevalidate,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheFirst => "cache-first",
            Self::NetworkFirst => "network-first",
            Self::StaleWhileRevalidate => "stale-while-revalidate",
        }
    }
}

/// Where a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub class: RequestClass,
    pub strategy: Strategy,
    pub partition: PartitionKind,
}

/// Path, extension and host based classifier.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    api_hosts: Vec<String>,
    swr_prefixes: Vec<String>,
}

impl Classifier {
    pub fn new(api_hosts: Vec<String>, swr_prefixes: Vec<String>) -> Self {
        Self {
            api_hosts,
            swr_prefixes,
        }
    }

    pub fn classify(&self, request: &Request) -> RequestClass {
        let path = request.url.path();
        let host = request.url.host_str().unwrap_or_default();

        if path.starts_with("/api/") || self.api_hosts.iter().any(|h| h == host) {
            return RequestClass::Api;
        }

        let ext = extension(path);
        let ext_in = |list: &[&str]| match ext.as_deref() {
            Some(e) => list.iter().any(|candidate| *candidate == e),
            None => false,
        };

        let accepts_image = request
            .header("accept")
            .is_some_and(|a| a.starts_with("image/"));
        if ext_in(IMAGE_EXTENSIONS) || accepts_image {
            return RequestClass::Image;
        }

        if STATIC_PREFIXES.iter().any(|p| path.starts_with(p)) || ext_in(STATIC_EXTENSIONS) {
            return RequestClass::StaticAsset;
        }

        RequestClass::Other
    }

    pub fn route(&self, request: &Request) -> Route {
        let class = self.classify(request);
        let (strategy, partition) = match class {
            RequestClass::StaticAsset => (Strategy::CacheFirst, PartitionKind::Static),
            RequestClass::Image => (Strategy::CacheFirst, PartitionKind::Dynamic),
            RequestClass::Api => {
                let path = request.url.path();
                if self.swr_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
                    (Strategy::StaleWhileRevalidate, PartitionKind::Api)
                } else {
                    (Strategy::NetworkFirst, PartitionKind::Api)
                }
            }
            RequestClass::Other => (Strategy::StaleWhileRevalidate, PartitionKind::Dynamic),
        };
        Route {
            class,
            strategy,
            partition,
        }
    }
}

/// Lower-cased extension of the last path segment.
fn extension(path: &str) -> Option<String> {
    let segment = path.rsplit('/').next()?;
    let (_, ext) = segment.rsplit_once('.')?;
    (!ext.is_empty()).then(|| ext.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::new(
            vec!["prices.example.net".to_string()],
            vec!["/api/news".to_string()],
        )
    }

    fn req(url: &str) -> Request {
        Request::get(url).unwrap()
    }

    #[test]
    fn test_classify() {
        let c = classifier();
        assert_eq!(c.classify(&req("https://app.test/api/commodities")), RequestClass::Api);
        assert_eq!(c.classify(&req("https://prices.example.net/v1/gold")), RequestClass::Api);
        assert_eq!(c.classify(&req("https://app.test/img/logo.PNG")), RequestClass::Image);
        assert_eq!(c.classify(&req("https://app.test/static/chart.svg")), RequestClass::Image);
        assert_eq!(
            c.classify(&req("https://app.test/avatar").with_header("Accept", "image/webp")),
            RequestClass::Image
        );
        assert_eq!(c.classify(&req("https://app.test/_next/static/chunk")), RequestClass::StaticAsset);
        assert_eq!(c.classify(&req("https://app.test/fonts/inter.woff2")), RequestClass::StaticAsset);
        assert_eq!(c.classify(&req("https://app.test/dashboard")), RequestClass::Other);
        assert_eq!(c.classify(&req("https://app.test/")), RequestClass::Other);
    }

    #[test]
    fn test_route_table() {
        let c = classifier();
        let route = c.route(&req("https://app.test/api/commodities"));
        assert_eq!((route.strategy, route.partition), (Strategy::NetworkFirst, PartitionKind::Api));

        let route = c.route(&req("https://app.test/api/news?symbol=GC"));
        assert_eq!(
            (route.strategy, route.partition),
            (Strategy::StaleWhileRevalidate, PartitionKind::Api)
        );

        let route = c.route(&req("https://app.test/app.css"));
        assert_eq!((route.strategy, route.partition), (Strategy::CacheFirst, PartitionKind::Static));

        let route = c.route(&req("https://app.test/a.jpg"));
        assert_eq!((route.strategy, route.partition), (Strategy::CacheFirst, PartitionKind::Dynamic));

        let route = c.route(&req("https://app.test/portfolio"));
        assert_eq!(
            (route.strategy, route.partition),
            (Strategy::StaleWhileRevalidate, PartitionKind::Dynamic)
        );
    }
}
