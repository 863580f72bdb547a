//! Mango (selector) queries.
//!
//! A [`MangoQuery`] pairs a combinator [`Selector`] with projection and
//! paging switches and goes out as a POST to `/_find`. The response is
//! stream-decoded: one [`MangoQueryResult`] per `docs` element, followed
//! by exactly one bookmark-only result when the server returned a
//! bookmark. A server-reported `error` fails the stream with
//! [`CouchError::MangoResult`].

use crate::error::{CouchError, Result};
use crate::json::{JsonToken, TokenSource};
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::Value;

/// One field predicate inside a selector.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: Operator,
}

impl Condition {
    pub fn new(field: impl Into<String>, op: Operator) -> Self {
        Condition {
            field: field.into(),
            op,
        }
    }
}

/// Comparison applied to a field.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Eq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Exists(bool),
    ElemMatch(Value),
}

impl Operator {
    fn tag(&self) -> &'static str {
        match self {
            Operator::Eq(_) => "$eq",
            Operator::Gt(_) => "$gt",
            Operator::Gte(_) => "$gte",
            Operator::Lt(_) => "$lt",
            Operator::Lte(_) => "$lte",
            Operator::Exists(_) => "$exists",
            Operator::ElemMatch(_) => "$elemMatch",
        }
    }

    fn value(&self) -> Value {
        match self {
            Operator::Eq(v)
            | Operator::Gt(v)
            | Operator::Gte(v)
            | Operator::Lt(v)
            | Operator::Lte(v)
            | Operator::ElemMatch(v) => v.clone(),
            Operator::Exists(b) => Value::Bool(*b),
        }
    }
}

impl Serialize for Condition {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut outer = serializer.serialize_map(Some(1))?;
        let mut inner = serde_json::Map::new();
        inner.insert(self.op.tag().to_string(), self.op.value());
        outer.serialize_entry(&self.field, &Value::Object(inner))?;
        outer.end()
    }
}

/// Tagged combinator over field predicates.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Selector {
    /// Shorthand for a single-predicate `$and`.
    pub fn field(field: impl Into<String>, op: Operator) -> Self {
        Selector::And(vec![Condition::new(field, op)])
    }
}

impl Serialize for Selector {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let (tag, conditions) = match self {
            Selector::And(c) => ("$and", c),
            Selector::Or(c) => ("$or", c),
        };
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(tag, conditions)?;
        map.end()
    }
}

/// A `/_find` request.
#[derive(Debug, Clone, Serialize)]
pub struct MangoQuery {
    pub selector: Selector,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_index: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bookmark: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<Vec<Value>>,
}

impl MangoQuery {
    pub fn new(selector: Selector) -> Self {
        MangoQuery {
            selector,
            fields: Vec::new(),
            limit: None,
            skip: None,
            use_index: None,
            bookmark: None,
            sort: None,
        }
    }

    #[must_use]
    pub fn fields(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.fields = fields.into_iter().map(Into::into).collect();
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

    /// Name the index to use, e.g. `"Order_mango"` or a `[ddoc, name]`
    /// pair.
    #[must_use]
    pub fn use_index(mut self, index: impl Into<Value>) -> Self {
        self.use_index = Some(index.into());
        self
    }

    /// Resume from a bookmark returned by a previous page.
    #[must_use]
    pub fn bookmark(mut self, bookmark: impl Into<String>) -> Self {
        self.bookmark = Some(bookmark.into());
        self
    }

    #[must_use]
    pub fn sort(mut self, sort: Vec<Value>) -> Self {
        self.sort = Some(sort);
        self
    }
}

/// One element of a Mango result stream: either a document or, as the
/// final element, the page bookmark.
#[derive(Debug, Clone, PartialEq)]
pub struct MangoQueryResult<T> {
    pub doc: Option<T>,
    pub bookmark: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FindState {
    ExpectTopObject,
    InTopObject,
    InDocsArray,
    /// Body consumed; the bookmark element (if any) is still owed.
    Flush,
    Done,
}

/// Streaming decoder for one `/_find` response.
pub struct MangoDecoder<T> {
    source: TokenSource,
    state: FindState,
    bookmark: Option<String>,
    error: Option<String>,
    reason: Option<String>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> MangoDecoder<T> {
    pub fn new(source: TokenSource) -> Self {
        MangoDecoder {
            source,
            state: FindState::ExpectTopObject,
            bookmark: None,
            error: None,
            reason: None,
            _marker: std::marker::PhantomData,
        }
    }

    /// Next result, or `None` once the response is fully decoded.
    ///
    /// A returned error ends the stream; later calls return `None`.
    pub async fn next_result(&mut self) -> Result<Option<MangoQueryResult<T>>> {
        if self.state == FindState::Done {
            return Ok(None);
        }
        match self.next_result_inner().await {
            Err(e) => {
                self.state = FindState::Done;
                Err(e)
            }
            ok => ok,
        }
    }

    async fn next_result_inner(&mut self) -> Result<Option<MangoQueryResult<T>>> {
        loop {
            match self.state {
                FindState::ExpectTopObject => match self.source.require_token().await? {
                    JsonToken::StartObject => self.state = FindState::InTopObject,
                    other => {
                        self.state = FindState::Done;
                        return Err(CouchError::Decode(format!(
                            "expected find result object, found {other:?}"
                        )));
                    }
                },
                FindState::InTopObject => match self.source.require_token().await? {
                    JsonToken::FieldName(name) => match name.as_str() {
                        "docs" => match self.source.require_token().await? {
                            JsonToken::StartArray => self.state = FindState::InDocsArray,
                            other => {
                                self.state = FindState::Done;
                                return Err(CouchError::Decode(format!(
                                    "expected docs array, found {other:?}"
                                )));
                            }
                        },
                        "bookmark" => {
                            if let Value::String(s) = self.source.collect_value().await? {
                                self.bookmark = Some(s);
                            }
                        }
                        "error" => {
                            if let Value::String(s) = self.source.collect_value().await? {
                                self.error = Some(s);
                            }
                        }
                        "reason" => {
                            if let Value::String(s) = self.source.collect_value().await? {
                                self.reason = Some(s);
                            }
                        }
                        _ => self.source.skip_value().await?,
                    },
                    JsonToken::EndObject => self.state = FindState::Flush,
                    other => {
                        self.state = FindState::Done;
                        return Err(CouchError::Decode(format!(
                            "unexpected token in find result: {other:?}"
                        )));
                    }
                },
                FindState::InDocsArray => match self.source.require_token().await? {
                    token @ JsonToken::StartObject => {
                        let doc = self.source.collect_value_from(token).await?;
                        let doc: T = serde_json::from_value(doc)?;
                        return Ok(Some(MangoQueryResult {
                            doc: Some(doc),
                            bookmark: None,
                        }));
                    }
                    JsonToken::EndArray => self.state = FindState::InTopObject,
                    other => {
                        self.state = FindState::Done;
                        return Err(CouchError::Decode(format!(
                            "expected document, found {other:?}"
                        )));
                    }
                },
                FindState::Flush => {
                    self.state = FindState::Done;
                    if let Some(error) = self.error.take() {
                        return Err(CouchError::MangoResult {
                            error,
                            reason: self.reason.take().unwrap_or_default(),
                        });
                    }
                    if let Some(bookmark) = self.bookmark.take() {
                        return Ok(Some(MangoQueryResult {
                            doc: None,
                            bookmark: Some(bookmark),
                        }));
                    }
                }
                FindState::Done => return Ok(None),
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<MangoQueryResult<T>>> + Send
    where
        T: Send + 'static,
    {
        futures::stream::unfold(Some(self), |decoder| async move {
            let mut decoder = decoder?;
            match decoder.next_result().await {
                Ok(Some(result)) => Some((Ok(result), Some(decoder))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
