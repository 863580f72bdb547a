//! Document model shared across the client surface.
//!
//! Application data classes implement [`CouchDocument`] so the client can
//! read identity and thread server-assigned revisions back after writes.
//! A document with no `rev` has never been persisted; every successful
//! create/update yields a new `rev` distinct from all prior revisions of
//! the same id.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Implemented by application document types.
///
/// The usual shape maps `_id`/`_rev` onto the implementing struct:
///
/// ```
/// use couchflow::CouchDocument;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Order {
///     #[serde(rename = "_id")]
///     id: String,
///     #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
///     rev: Option<String>,
///     total: u64,
/// }
///
/// impl CouchDocument for Order {
///     fn id(&self) -> &str { &self.id }
///     fn rev(&self) -> Option<&str> { self.rev.as_deref() }
///     fn set_rev(&mut self, rev: String) { self.rev = Some(rev); }
/// }
/// ```
pub trait CouchDocument: Serialize + DeserializeOwned {
    /// Document identity, unique within the database.
    fn id(&self) -> &str;

    /// Current revision token, if the document has been persisted.
    fn rev(&self) -> Option<&str>;

    /// Store a server-assigned revision after a successful write.
    fn set_rev(&mut self, rev: String);
}

/// Attachment metadata as carried on a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attachment {
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revpos: Option<u64>,
    #[serde(default)]
    pub stub: bool,
}

/// One entry of a document's revision history (`revs_info=true`).
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RevInfo {
    pub rev: String,
    /// `available`, `missing`, or `deleted`.
    pub status: String,
}

/// Envelope for a document fetched together with its revision history.
#[derive(Debug, Deserialize)]
pub struct RevsInfoEnvelope {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev")]
    pub rev: String,
    #[serde(rename = "_revs_info", default)]
    pub revs_info: Vec<RevInfo>,
}

/// Database information from `GET /<db>`.
#[derive(Debug, Clone, Deserialize)]
pub struct DbInfo {
    pub db_name: String,
    #[serde(default)]
    pub doc_count: u64,
    #[serde(default)]
    pub doc_del_count: u64,
    /// Opaque cluster sequence; numeric on old servers, string on new ones.
    #[serde(default)]
    pub update_seq: serde_json::Value,
}

/// `_security` document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SecurityDocument {
    #[serde(default)]
    pub admins: SecurityGroup,
    #[serde(default)]
    pub members: SecurityGroup,
}

/// One half of a [`SecurityDocument`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SecurityGroup {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Acknowledgement payload for single-document writes.
#[derive(Debug, Clone, Deserialize)]
pub struct WriteOk {
    #[serde(default)]
    pub ok: bool,
    pub id: String,
    pub rev: String,
}

/// Generic JSON document used where no application type applies
/// (design documents are handled separately).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(rename = "_deleted", default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(rename = "_attachments", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attachments: BTreeMap<String, Attachment>,
    #[serde(flatten)]
    pub body: serde_json::Map<String, serde_json::Value>,
}

impl RawDocument {
    pub fn new(id: impl Into<String>) -> Self {
        RawDocument {
            id: id.into(),
            rev: None,
            deleted: false,
            attachments: BTreeMap::new(),
            body: serde_json::Map::new(),
        }
    }
}

impl CouchDocument for RawDocument {
    fn id(&self) -> &str {
        &self.id
    }

    fn rev(&self) -> Option<&str> {
        self.rev.as_deref()
    }

    fn set_rev(&mut self, rev: String) {
        self.rev = Some(rev);
    }
}
