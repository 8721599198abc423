//! Owned HTTP request/response values passed through the worker.

use crate::error::FetchError;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outgoing request as seen by the cache worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    /// Lower-cased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn get(url: &str) -> Result<Self, FetchError> {
        let url = Url::parse(url).map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::new(Method::GET, url))
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }

    /// Cache key: the URL without its fragment.
    pub fn cache_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.to_string()
    }

    /// Whether the request is a document navigation.
    pub fn is_navigation(&self) -> bool {
        self.header("accept")
            .is_some_and(|accept| accept.contains("text/html"))
    }
}

/// Buffered response. Serializable so cache partitions can be snapshotted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    /// Lower-cased header names.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Stored as a base64 string in snapshots.
    #[serde(default, with = "body_base64")]
    pub body: Vec<u8>,
}

mod body_base64 {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded.as_bytes()).map_err(de::Error::custom)
    }
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// Approximate stored size: body plus header text.
    pub fn size(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_body_serializes_as_base64() {
        let response = Response::new(200, vec![0u8, 255, 10, 32]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["body"], "AP8KIA==");

        let back: Response = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }

    #[test]
    fn test_cache_key_drops_fragment() {
        let req = Request::get("https://app.example.com/static/app.js?v=3#main").unwrap();
        assert_eq!(req.cache_key(), "https://app.example.com/static/app.js?v=3");
    }

    #[test]
    fn test_headers_case_insensitive() {
        let req = Request::get("https://app.example.com/")
            .unwrap()
            .with_header("Accept", "text/html,application/xhtml+xml");
        assert_eq!(req.header("ACCEPT"), req.header("accept"));
        assert!(req.is_navigation());
    }

    #[test]
    fn test_invalid_url() {
        assert!(matches!(
            Request::get("not a url"),
            Err(FetchError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_response_size() {
        let resp = Response::new(200, "hello").with_header("content-type", "text/plain");
        assert_eq!(resp.size(), 5 + "content-type".len() + "text/plain".len());
    }
}
