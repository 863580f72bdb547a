//! Pull-based token source over an async byte stream.
//!
//! [`TokenSource`] owns the response byte stream and a [`Tokenizer`]; a new
//! chunk is pulled only when the consumer asks for a token the buffer
//! cannot yet produce. Dropping the source drops the byte stream, which
//! cancels the underlying HTTP response.

use crate::error::{CouchError, Result};
use crate::json::tokenizer::{JsonToken, Tokenizer};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{Map, Value};

/// Byte-chunk stream as handed out by the transport.
pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

/// Lazily tokenizes a chunk stream.
pub struct TokenSource {
    chunks: ChunkStream,
    tokenizer: Tokenizer,
}

impl TokenSource {
    pub fn new(chunks: ChunkStream) -> Self {
        TokenSource {
            chunks,
            tokenizer: Tokenizer::new(),
        }
    }

    /// Next token, pulling chunks as needed. `None` means the stream ended
    /// cleanly after a complete document.
    pub async fn next_token(&mut self) -> Result<Option<JsonToken>> {
        loop {
            if let Some(token) = self.tokenizer.next_token()? {
                return Ok(Some(token));
            }
            if self.tokenizer.is_exhausted() {
                return Ok(None);
            }
            match self.chunks.next().await {
                Some(Ok(chunk)) => self.tokenizer.push(&chunk),
                Some(Err(e)) => return Err(e),
                None => self.tokenizer.finish(),
            }
        }
    }

    /// Next token, failing on a clean end of stream.
    pub async fn require_token(&mut self) -> Result<JsonToken> {
        self.next_token()
            .await?
            .ok_or_else(|| CouchError::Decode("unexpected end of JSON stream".into()))
    }

    /// Collect one complete value whose first token is `first`.
    ///
    /// Arbitrary nesting is handled with an explicit builder stack, so a
    /// deeply nested `key`/`value`/`doc` subtree costs no recursion.
    pub async fn collect_value_from(&mut self, first: JsonToken) -> Result<Value> {
        enum Frame {
            Object(Map<String, Value>, Option<String>),
            Array(Vec<Value>),
        }

        let mut stack: Vec<Frame> = Vec::new();

        let mut pending: Option<Value> = match first {
            JsonToken::String(s) => Some(Value::String(s)),
            JsonToken::Number(n) => Some(Value::Number(n)),
            JsonToken::Bool(b) => Some(Value::Bool(b)),
            JsonToken::Null => Some(Value::Null),
            JsonToken::StartObject => {
                stack.push(Frame::Object(Map::new(), None));
                None
            }
            JsonToken::StartArray => {
                stack.push(Frame::Array(Vec::new()));
                None
            }
            JsonToken::FieldName(name) => {
                return Err(CouchError::Decode(format!(
                    "expected a value, found field name `{name}`"
                )))
            }
            JsonToken::EndObject | JsonToken::EndArray => {
                return Err(CouchError::Decode(
                    "expected a value, found a container close".into(),
                ))
            }
        };

        loop {
            if let Some(value) = pending.take() {
                match stack.last_mut() {
                    None => return Ok(value),
                    Some(Frame::Object(map, key)) => {
                        let key = key.take().ok_or_else(|| {
                            CouchError::Decode("object value without a field name".into())
                        })?;
                        map.insert(key, value);
                    }
                    Some(Frame::Array(items)) => items.push(value),
                }
            }

            match self.require_token().await? {
                JsonToken::FieldName(name) => match stack.last_mut() {
                    Some(Frame::Object(_, key)) => *key = Some(name),
                    _ => {
                        return Err(CouchError::Decode(
                            "field name outside of an object".into(),
                        ))
                    }
                },
                JsonToken::String(s) => pending = Some(Value::String(s)),
                JsonToken::Number(n) => pending = Some(Value::Number(n)),
                JsonToken::Bool(b) => pending = Some(Value::Bool(b)),
                JsonToken::Null => pending = Some(Value::Null),
                JsonToken::StartObject => stack.push(Frame::Object(Map::new(), None)),
                JsonToken::StartArray => stack.push(Frame::Array(Vec::new())),
                JsonToken::EndObject => match stack.pop() {
                    Some(Frame::Object(map, _)) => pending = Some(Value::Object(map)),
                    _ => return Err(CouchError::Decode("unbalanced '}'".into())),
                },
                JsonToken::EndArray => match stack.pop() {
                    Some(Frame::Array(items)) => pending = Some(Value::Array(items)),
                    _ => return Err(CouchError::Decode("unbalanced ']'".into())),
                },
            }
        }
    }

    /// Collect the next complete value.
    pub async fn collect_value(&mut self) -> Result<Value> {
        let first = self.require_token().await?;
        self.collect_value_from(first).await
    }

    /// Discard one complete value whose first token is `first`.
    pub async fn skip_value_from(&mut self, first: JsonToken) -> Result<()> {
        let mut depth = match first {
            JsonToken::StartObject | JsonToken::StartArray => 1usize,
            JsonToken::FieldName(name) => {
                return Err(CouchError::Decode(format!(
                    "expected a value, found field name `{name}`"
                )))
            }
            _ => return Ok(()),
        };
        while depth > 0 {
            match self.require_token().await? {
                JsonToken::StartObject | JsonToken::StartArray => depth += 1,
                JsonToken::EndObject | JsonToken::EndArray => depth -= 1,
                _ => {}
            }
        }
        Ok(())
    }

    /// Discard the next complete value.
    pub async fn skip_value(&mut self) -> Result<()> {
        let first = self.require_token().await?;
        self.skip_value_from(first).await
    }
}
