//! Continuous change feed.
//!
//! [`subscriber`] maintains the long-lived `_changes` connection and its
//! reconnect state machine; this module holds the envelope and typed
//! change shapes plus the subscription options.
//!
//! Delivery is at-least-once per sequence: when the client reconnects
//! right after the server acknowledged a sequence, that change can arrive
//! twice. Consumers must be idempotent on `(id, rev)`.

pub mod subscriber;

pub use subscriber::{ChangeFeed, TypedChangeFeed};

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

/// Opaque change-sequence identifier.
///
/// Old servers emit numeric sequences, clustered ones strings like
/// `"42-g1AAAA"`; both resume correctly when echoed back in `since=`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Seq(pub String);

impl Seq {
    pub fn now() -> Self {
        Seq("now".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&Value> for Seq {
    fn from(value: &Value) -> Self {
        match value {
            Value::String(s) => Seq(s.clone()),
            Value::Number(n) => Seq(n.to_string()),
            other => Seq(other.to_string()),
        }
    }
}

impl std::fmt::Display for Seq {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One revision reference inside a change line.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RevRef {
    pub rev: String,
}

/// One decoded line of the continuous feed, before type routing.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEnvelope {
    #[serde(default)]
    pub seq: Value,
    pub id: String,
    #[serde(default)]
    pub changes: Vec<RevRef>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub doc: Option<Value>,
}

impl ChangeEnvelope {
    pub fn seq(&self) -> Seq {
        Seq::from(&self.seq)
    }

    /// Winning revision of this change, when the server sent one.
    pub fn rev(&self) -> Option<&str> {
        self.changes.first().map(|r| r.rev.as_str())
    }
}

/// A change routed to a concrete application type.
#[derive(Debug, Clone, PartialEq)]
pub struct Change<T> {
    pub seq: Seq,
    pub id: String,
    pub rev: Option<String>,
    pub deleted: bool,
    pub doc: Option<T>,
}

/// Decides whether a discriminator tag maps to the subscriber's type.
pub type TagResolver = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Options for a change-feed subscription.
#[derive(Clone)]
pub struct ChangesOptions {
    /// Sequence to resume from; defaults to `"now"`.
    pub since: Seq,
    /// Server-side filter function, `"<design>/<name>"`.
    pub filter: Option<String>,
    pub include_docs: bool,
}

impl Default for ChangesOptions {
    fn default() -> Self {
        ChangesOptions {
            since: Seq::now(),
            filter: None,
            include_docs: true,
        }
    }
}

impl ChangesOptions {
    #[must_use]
    pub fn since(mut self, seq: Seq) -> Self {
        self.since = seq;
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn include_docs(mut self, include: bool) -> Self {
        self.include_docs = include;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seq_from_number_and_string() {
        assert_eq!(Seq::from(&json!(7)), Seq("7".into()));
        assert_eq!(Seq::from(&json!("12-abc")), Seq("12-abc".into()));
    }

    #[test]
    fn test_envelope_decoding() {
        let envelope: ChangeEnvelope = serde_json::from_value(json!({
            "seq": "3-g1AA",
            "id": "order:1",
            "changes": [{"rev": "2-bcd"}],
            "doc": {"_id": "order:1", "type": "order"}
        }))
        .unwrap();
        assert_eq!(envelope.seq(), Seq("3-g1AA".into()));
        assert_eq!(envelope.rev(), Some("2-bcd"));
        assert!(!envelope.deleted);
    }

    #[test]
    fn test_deleted_envelope() {
        let envelope: ChangeEnvelope = serde_json::from_value(json!({
            "seq": 9,
            "id": "gone",
            "changes": [{"rev": "3-x"}],
            "deleted": true
        }))
        .unwrap();
        assert!(envelope.deleted);
        assert!(envelope.doc.is_none());
    }
}
