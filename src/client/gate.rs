//! Response gate.
//!
//! Every response passes through [`triage`] before its body is read:
//! well-known statuses become typed errors, 404 optionally becomes an
//! absent sentinel, and registered response-header handlers fire. The
//! error path reads the full (server-bounded) body so diagnostics carry
//! the server's reason.

use crate::error::{CouchError, Result};
use crate::transport::HttpResponse;
use std::sync::Arc;

/// How a 404 should surface for the operation at hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    /// Fail with [`CouchError::NotFound`].
    Error,
    /// Return an absent sentinel (single-doc GET, existence probes).
    Absent,
}

/// Callback invoked with `(header_name, header_value)`.
pub type HeaderHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Dispatches response headers to handlers registered by name prefix.
///
/// Prefixes are matched case-insensitively against the lowercased header
/// names the transport hands back.
#[derive(Clone, Default)]
pub struct HeaderRegistry {
    handlers: Vec<(String, HeaderHandler)>,
}

impl HeaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, prefix: impl Into<String>, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.handlers
            .push((prefix.into().to_lowercase(), Arc::new(handler)));
    }

    pub fn dispatch(&self, headers: &std::collections::BTreeMap<String, String>) {
        for (prefix, handler) in &self.handlers {
            for (name, value) in headers {
                if name.starts_with(prefix.as_str()) {
                    handler(name, value);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HeaderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderRegistry")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Inspect the status and either release the response for body reading or
/// fail with a typed error. `None` is the absent sentinel for 404 under
/// [`Missing::Absent`].
pub async fn triage(
    response: HttpResponse,
    missing: Missing,
    registry: &HeaderRegistry,
) -> Result<Option<HttpResponse>> {
    registry.dispatch(&response.headers);

    match response.status {
        200..=299 => Ok(Some(response)),
        401 => Err(CouchError::Unauthorized),
        404 if missing == Missing::Absent => Ok(None),
        404 => Err(CouchError::NotFound),
        409 => Err(CouchError::Conflict),
        status => {
            let body = match response.collect_body().await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(_) => String::new(),
            };
            tracing::debug!(status, "request failed");
            Err(CouchError::Http { status, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{stream, StreamExt};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn response(status: u16, body: &'static [u8]) -> HttpResponse {
        HttpResponse {
            status,
            headers: BTreeMap::new(),
            body: stream::iter(vec![Ok(Bytes::from_static(body))]).boxed(),
        }
    }

    #[tokio::test]
    async fn test_2xx_passes_through() {
        let out = triage(response(200, b"{}"), Missing::Error, &HeaderRegistry::new())
            .await
            .unwrap();
        assert!(out.is_some());
    }

    #[tokio::test]
    async fn test_401_unauthorized() {
        let err = triage(response(401, b""), Missing::Error, &HeaderRegistry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CouchError::Unauthorized));
    }

    #[tokio::test]
    async fn test_404_modes() {
        let absent = triage(response(404, b""), Missing::Absent, &HeaderRegistry::new())
            .await
            .unwrap();
        assert!(absent.is_none());

        let err = triage(response(404, b""), Missing::Error, &HeaderRegistry::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CouchError::NotFound));
    }

    #[tokio::test]
    async fn test_409_conflict() {
        let err = triage(response(409, b""), Missing::Error, &HeaderRegistry::new())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_other_status_carries_body() {
        let err = triage(
            response(500, b"{\"error\":\"internal_server_error\"}"),
            Missing::Error,
            &HeaderRegistry::new(),
        )
        .await
        .unwrap_err();
        match err {
            CouchError::Http { status, body } => {
                assert_eq!(status, 500);
                assert!(body.contains("internal_server_error"));
            }
            other => panic!("expected Http, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_header_registry_prefix_dispatch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let mut registry = HeaderRegistry::new();
        registry.register("x-couch-", move |_, _| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        let mut headers = BTreeMap::new();
        headers.insert("x-couch-request-id".to_string(), "abc".to_string());
        headers.insert("x-couch-body-time".to_string(), "5".to_string());
        headers.insert("content-type".to_string(), "application/json".to_string());
        let resp = HttpResponse {
            status: 200,
            headers,
            body: stream::iter(Vec::<crate::error::Result<Bytes>>::new()).boxed(),
        };

        triage(resp, Missing::Error, &registry).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
