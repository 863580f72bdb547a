//! View queries and their typed event streams.
//!
//! A [`ViewQuery`] names either a design-document view or the `_all_docs`
//! pseudo-view and carries the usual range/key/paging switches. Executing
//! one yields a stream of [`ViewEvent`]s decoded incrementally off the
//! wire — see [`decoder`] for the state machine and [`batch`] for the
//! id-batching wrapper.

pub mod batch;
pub mod decoder;

pub use decoder::ViewDecoder;

use serde::Serialize;
use serde_json::Value;

/// Staleness policy for a view read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stale {
    /// Serve from the current index without updating it.
    Ok,
    /// Serve from the current index, then refresh it.
    UpdateAfter,
}

impl Stale {
    pub(crate) fn as_param(self) -> &'static str {
        match self {
            Stale::Ok => "ok",
            Stale::UpdateAfter => "update_after",
        }
    }
}

/// Value object describing one view read.
#[derive(Debug, Clone)]
pub struct ViewQuery {
    /// Design document name (without the `_design/` prefix); `None` targets
    /// `_all_docs`.
    pub design_doc: Option<String>,
    pub view_name: String,
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    pub inclusive_end: bool,
    pub key: Option<Value>,
    pub keys: Vec<Value>,
    pub limit: Option<u64>,
    pub skip: Option<u64>,
    pub descending: bool,
    pub include_docs: bool,
    pub reduce: Option<bool>,
    pub group_level: Option<u32>,
    pub stale: Option<Stale>,
    /// Suppress rows carrying a `not_found` error instead of failing the
    /// stream (`_all_docs` lookups for ids that were deleted or never
    /// existed).
    pub ignore_not_found: bool,
    /// Ask the server to report its update sequence with the result.
    pub update_seq: bool,
}

impl ViewQuery {
    /// Query a view in a design document.
    pub fn new(design_doc: impl Into<String>, view_name: impl Into<String>) -> Self {
        ViewQuery {
            design_doc: Some(design_doc.into()),
            view_name: view_name.into(),
            ..Self::all_docs()
        }
    }

    /// Query the `_all_docs` pseudo-view.
    pub fn all_docs() -> Self {
        ViewQuery {
            design_doc: None,
            view_name: "_all_docs".to_string(),
            start_key: None,
            end_key: None,
            inclusive_end: true,
            key: None,
            keys: Vec::new(),
            limit: None,
            skip: None,
            descending: false,
            include_docs: false,
            reduce: None,
            group_level: None,
            stale: None,
            ignore_not_found: false,
            update_seq: false,
        }
    }

    #[must_use]
    pub fn start_key<T: Serialize>(mut self, key: &T) -> Self {
        self.start_key = serde_json::to_value(key).ok();
        self
    }

    #[must_use]
    pub fn end_key<T: Serialize>(mut self, key: &T) -> Self {
        self.end_key = serde_json::to_value(key).ok();
        self
    }

    #[must_use]
    pub fn inclusive_end(mut self, inclusive: bool) -> Self {
        self.inclusive_end = inclusive;
        self
    }

    #[must_use]
    pub fn key<T: Serialize>(mut self, key: &T) -> Self {
        self.key = serde_json::to_value(key).ok();
        self
    }

    /// Query several keys at once. More than one key switches the request
    /// to a POST with a `{"keys": [...]}` body.
    #[must_use]
    pub fn keys<T: Serialize>(mut self, keys: impl IntoIterator<Item = T>) -> Self {
        self.keys = keys
            .into_iter()
            .filter_map(|k| serde_json::to_value(k).ok())
            .collect();
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = Some(skip);
        self
    }

    #[must_use]
    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    #[must_use]
    pub fn include_docs(mut self, include: bool) -> Self {
        self.include_docs = include;
        self
    }

    #[must_use]
    pub fn reduce(mut self, reduce: bool) -> Self {
        self.reduce = Some(reduce);
        self
    }

    #[must_use]
    pub fn group_level(mut self, level: u32) -> Self {
        self.group_level = Some(level);
        self
    }

    #[must_use]
    pub fn stale(mut self, stale: Stale) -> Self {
        self.stale = Some(stale);
        self
    }

    #[must_use]
    pub fn ignore_not_found(mut self, ignore: bool) -> Self {
        self.ignore_not_found = ignore;
        self
    }

    #[must_use]
    pub fn update_seq(mut self, update_seq: bool) -> Self {
        self.update_seq = update_seq;
        self
    }

    /// True when the request must go out as a POST with a keys body.
    pub(crate) fn is_multi_key(&self) -> bool {
        self.keys.len() > 1
    }

    /// Path under the database: `_all_docs` or
    /// `_design/<name>/_view/<view>`.
    pub(crate) fn path(&self) -> String {
        match &self.design_doc {
            Some(design) => format!("_design/{design}/_view/{}", self.view_name),
            None => self.view_name.clone(),
        }
    }
}

/// One row of a view result.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRow<K, V, T> {
    /// Document id; empty for reduce rows, which have none.
    pub id: String,
    pub key: K,
    pub value: V,
    pub doc: DocSlot<T>,
}

/// The document slot of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum DocSlot<T> {
    /// `include_docs=true` and the server sent the document.
    Loaded(T),
    /// `include_docs=true` but the doc field was null or absent (deleted
    /// or not present).
    Missing,
    /// `include_docs=false`; no document was requested.
    NotRequested,
}

impl<T> DocSlot<T> {
    pub fn loaded(self) -> Option<T> {
        match self {
            DocSlot::Loaded(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, DocSlot::Missing)
    }
}

/// One event of a view result stream, in on-wire order; the decoder never
/// reorders.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent<K, V, T> {
    Row(ViewRow<K, V, T>),
    TotalCount(u64),
    /// Result offset. When the response omits `offset` (as `_all_docs`
    /// keyed reads do) a single `Offset(-1)` is synthesized at the end of
    /// the stream; consumers cannot distinguish it from a literal server
    /// offset of -1.
    Offset(i64),
    UpdateSequence(u64),
}

/// Untyped convenience alias: keys, values, and docs as raw JSON.
pub type RawViewEvent = ViewEvent<Value, Value, Value>;
