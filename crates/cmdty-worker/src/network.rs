//! Network access used by the worker.

use crate::error::FetchError;
use crate::http::{Request, Response};
use cmdty_core::BoxFuture;
use std::time::Duration;
use tracing::debug;

/// Performs a real network round trip.
pub trait Network: Send + Sync {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, FetchError>>;
}

/// reqwest-backed network.
#[derive(Clone)]
pub struct ReqwestNetwork {
    client: reqwest::Client,
}

impl ReqwestNetwork {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Network(e.to_string())
    }
}

impl Network for ReqwestNetwork {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, FetchError>> {
        Box::pin(async move {
            let mut builder = self.client.request(request.method.clone(), request.url.clone());
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let resp = builder.send().await.map_err(map_reqwest_error)?;
            let status = resp.status().as_u16();
            let headers = resp
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();
            let body = resp.bytes().await.map_err(map_reqwest_error)?.to_vec();

            debug!(url = %request.url, status, bytes = body.len(), "Network fetch complete");
            Ok(Response {
                status,
                headers,
                body,
            })
        })
    }
}
