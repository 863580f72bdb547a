//! Request construction.
//!
//! [`RequestBuilder`] assembles the URI, query string, method, headers, and
//! optional body for one logical operation. Basic auth is applied whenever
//! credentials are configured; bodied methods default to
//! `Content-Type: application/json` unless the caller overrides it
//! (attachment uploads do). No retry logic lives here.

use crate::config::{ClientConfig, REQUEST_ID_HEADER};
use crate::error::{CouchError, Result};
use crate::transport::PreparedRequest;
use bytes::Bytes;
use serde::Serialize;

/// Builder for one request. Transient: consumed by a single execution.
#[derive(Debug)]
pub struct RequestBuilder {
    base: url::Url,
    segments: Vec<String>,
    query: Vec<(String, String)>,
    method: String,
    body: Option<Bytes>,
    content_type: Option<String>,
    request_id: Option<String>,
    basic_auth: Option<(String, String)>,
    streaming: bool,
}

impl RequestBuilder {
    /// Start a builder from the configured base URL and credentials.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let base = url::Url::parse(&config.base_url)
            .map_err(|e| CouchError::Config(format!("invalid base URL: {e}")))?;
        let basic_auth = match (&config.username, &config.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };
        let request_id = if config.correlate_requests {
            Some(uuid::Uuid::new_v4().to_string())
        } else {
            None
        };
        Ok(RequestBuilder {
            base,
            segments: Vec::new(),
            query: Vec::new(),
            method: "GET".to_string(),
            body: None,
            content_type: None,
            request_id,
            basic_auth,
            streaming: false,
        })
    }

    /// Append a path segment. Embedded `/` splits into further segments and
    /// adjacent separators collapse, so `"_design/Code"` and
    /// `"/_design//Code/"` produce the same path.
    #[must_use]
    pub fn segment(mut self, segment: impl AsRef<str>) -> Self {
        for part in segment.as_ref().split('/').filter(|p| !p.is_empty()) {
            self.segments.push(part.to_string());
        }
        self
    }

    #[must_use]
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Add a query parameter; values are URL-encoded at build time.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    /// Add a query parameter whose value is JSON-serialized first (view
    /// keys, for example, go on the wire as JSON).
    pub fn query_json<T: Serialize>(self, name: impl Into<String>, value: &T) -> Result<Self> {
        let text = serde_json::to_string(value)?;
        Ok(self.query(name, text))
    }

    /// Attach a JSON body; sets the JSON content type unless one was set.
    pub fn body_json<T: Serialize>(mut self, value: &T) -> Result<Self> {
        self.body = Some(Bytes::from(serde_json::to_vec(value)?));
        Ok(self)
    }

    /// Attach raw bytes with an explicit content type (attachments).
    #[must_use]
    pub fn body_bytes(mut self, body: Bytes, content_type: impl Into<String>) -> Self {
        self.body = Some(body);
        self.content_type = Some(content_type.into());
        self
    }

    /// Supply a caller-chosen correlation id, overriding any generated one.
    #[must_use]
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Mark the response as long-lived (change feed); the transport skips
    /// the per-request timeout.
    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn build(self) -> Result<PreparedRequest> {
        let mut url = self.base;
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| CouchError::Config("base URL cannot be a base".into()))?;
            // Collapse any trailing empty segment of the base itself.
            path.pop_if_empty();
            for segment in &self.segments {
                path.push(segment);
            }
        }
        if !self.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &self.query {
                pairs.append_pair(name, value);
            }
        }

        let mut headers = Vec::new();
        if let Some(id) = self.request_id {
            headers.push((REQUEST_ID_HEADER.to_string(), id));
        }

        let has_body = self.body.is_some();
        let content_type = match self.content_type {
            Some(explicit) => Some(explicit),
            None if has_body => Some("application/json".to_string()),
            None => None,
        };

        Ok(PreparedRequest {
            method: self.method,
            url,
            headers,
            body: self.body,
            content_type,
            basic_auth: self.basic_auth,
            streaming: self.streaming,
        })
    }
}
