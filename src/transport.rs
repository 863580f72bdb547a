//! HTTP transport seam.
//!
//! Everything network-shaped goes through [`HttpTransport`], so tests can
//! substitute a scripted transport and the rest of the crate never touches
//! `reqwest` directly. The transport delivers responses as a status, a
//! header map, and a lazy byte-chunk stream; dropping the stream aborts
//! the request.

use crate::config::ClientConfig;
use crate::error::{CouchError, Result};
use crate::json::source::ChunkStream;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use std::collections::BTreeMap;

/// A fully assembled request, ready for one execution.
#[derive(Debug)]
pub struct PreparedRequest {
    pub method: String,
    pub url: url::Url,
    /// Extra headers beyond auth/content-type (correlation id, etc.).
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub content_type: Option<String>,
    pub basic_auth: Option<(String, String)>,
    /// Disable the per-request timeout for long-lived streams.
    pub streaming: bool,
}

/// A response whose body has not been read yet.
pub struct HttpResponse {
    pub status: u16,
    /// Header names lowercased.
    pub headers: BTreeMap<String, String>,
    pub body: ChunkStream,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &"ChunkStream")
            .finish()
    }
}

impl HttpResponse {
    /// Drain the body into one buffer. Only used for small, non-streamed
    /// payloads (status documents, error bodies).
    pub async fn collect_body(self) -> Result<Bytes> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        let total: usize = chunks.iter().map(Bytes::len).sum();
        let mut out = bytes::BytesMut::with_capacity(total);
        for chunk in &chunks {
            out.extend_from_slice(chunk);
        }
        Ok(out.freeze())
    }
}

/// The HTTP seam between the client and the network.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: PreparedRequest) -> Result<HttpResponse>;
}

/// Production transport backed by a pooled `reqwest` client.
pub struct ReqwestTransport {
    client: reqwest::Client,
    request_timeout: std::time::Duration,
}

impl ReqwestTransport {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| CouchError::Config(e.to_string()))?;
        Ok(ReqwestTransport {
            client,
            request_timeout: config.request_timeout,
        })
    }

    /// Wrap an existing `reqwest` client.
    pub fn with_client(client: reqwest::Client, request_timeout: std::time::Duration) -> Self {
        ReqwestTransport {
            client,
            request_timeout,
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: PreparedRequest) -> Result<HttpResponse> {
        let method = match request.method.to_uppercase().as_str() {
            "POST" => reqwest::Method::POST,
            "PUT" => reqwest::Method::PUT,
            "DELETE" => reqwest::Method::DELETE,
            "HEAD" => reqwest::Method::HEAD,
            _ => reqwest::Method::GET,
        };

        let mut builder = self.client.request(method, request.url.clone());

        // Long-lived feeds stay open indefinitely; everything else is bounded.
        if !request.streaming {
            builder = builder.timeout(self.request_timeout);
        }
        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        if let Some(content_type) = &request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;

        let status = response.status().as_u16();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                headers.insert(name.as_str().to_lowercase(), text.to_string());
            }
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(CouchError::from))
            .boxed();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn test_collect_body_concatenates_chunks() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"{\"ok\":")),
            Ok(Bytes::from_static(b"true}")),
        ];
        let response = HttpResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: stream::iter(chunks).boxed(),
        };
        let body = response.collect_body().await.unwrap();
        assert_eq!(&body[..], b"{\"ok\":true}");
    }

    #[tokio::test]
    async fn test_collect_body_propagates_stream_error() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(CouchError::Transport("reset".into())),
        ];
        let response = HttpResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: stream::iter(chunks).boxed(),
        };
        assert!(response.collect_body().await.is_err());
    }
}
