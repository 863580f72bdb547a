//! Incremental JSON lexer.
//!
//! State-machine tokenizer for streaming JSON where the complete document
//! may not arrive at once. Bytes are pushed in as they come off the wire;
//! [`Tokenizer::next_token`] yields a token as soon as one is complete and
//! `None` while more input is needed.
//!
//! # Tokenizing Flow
//!
//! 1. Push a chunk with [`Tokenizer::push`]
//! 2. Drain tokens with [`Tokenizer::next_token`] until it returns `None`
//! 3. Repeat; call [`Tokenizer::finish`] when the byte stream ends
//!
//! A string token (or field name) is only emitted once its closing quote
//! has arrived; a number only once a delimiter or end-of-input proves it
//! complete. Field names are distinguished from string values by a
//! container-context stack, so callers never see a bare `:`.
//!
//! # Examples
//!
//! ```
//! use couchflow::json::{JsonToken, Tokenizer};
//!
//! let mut tok = Tokenizer::new();
//! tok.push(b"{\"total_");
//! assert!(matches!(tok.next_token().unwrap(), Some(JsonToken::StartObject)));
//! // Field name split across chunks: not ready yet.
//! assert!(tok.next_token().unwrap().is_none());
//! tok.push(b"rows\": 42}");
//! assert_eq!(
//!     tok.next_token().unwrap(),
//!     Some(JsonToken::FieldName("total_rows".into()))
//! );
//! ```

use crate::error::{CouchError, Result};
use bytes::{Buf, BytesMut};

/// One lexical element of a JSON document.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonToken {
    StartObject,
    EndObject,
    StartArray,
    EndArray,
    /// An object key. Emitted instead of [`JsonToken::String`] in name
    /// position; the following `:` is consumed silently.
    FieldName(String),
    String(String),
    Number(serde_json::Number),
    Bool(bool),
    Null,
}

impl JsonToken {
    /// True for tokens that begin or complete a value (everything except
    /// field names).
    pub fn is_value_start(&self) -> bool {
        !matches!(self, JsonToken::FieldName(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Container {
    Object,
    Array,
}

/// Feed-based JSON tokenizer.
///
/// Incrementally lexes JSON from a byte stream. Designed for responses
/// that arrive in arbitrary fragments: a token split across chunk
/// boundaries is held back until its final byte arrives.
#[derive(Debug)]
pub struct Tokenizer {
    /// Input buffer accumulating bytes from the stream.
    buffer: BytesMut,
    /// Open containers, innermost last.
    stack: Vec<Container>,
    /// Inside an object and positioned before a key.
    expect_name: bool,
    /// The byte stream has ended; incomplete trailing input is an error.
    eof: bool,
}

impl Tokenizer {
    pub fn new() -> Self {
        Tokenizer {
            buffer: BytesMut::with_capacity(8 * 1024),
            stack: Vec::new(),
            expect_name: false,
            eof: false,
        }
    }

    /// Append a chunk of input.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Mark the end of input. After this, `next_token` returning `None`
    /// means the document is exhausted rather than "need more bytes".
    pub fn finish(&mut self) {
        self.eof = true;
    }

    /// True once the stream has ended and every buffered byte was consumed.
    pub fn is_exhausted(&self) -> bool {
        self.eof && self.remaining_is_blank()
    }

    fn remaining_is_blank(&self) -> bool {
        self.buffer
            .iter()
            .all(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n'))
    }

    /// Produce the next token, or `None` when more input is needed (or the
    /// stream is exhausted, once [`finish`](Self::finish) was called).
    pub fn next_token(&mut self) -> Result<Option<JsonToken>> {
        loop {
            let Some(&byte) = self.buffer.first() else {
                return self.need_more();
            };

            match byte {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.buffer.advance(1);
                }
                b',' => {
                    self.buffer.advance(1);
                    if self.stack.last() == Some(&Container::Object) {
                        self.expect_name = true;
                    }
                }
                b':' => {
                    self.buffer.advance(1);
                    self.expect_name = false;
                }
                b'{' => {
                    self.buffer.advance(1);
                    self.stack.push(Container::Object);
                    self.expect_name = true;
                    return Ok(Some(JsonToken::StartObject));
                }
                b'}' => {
                    self.buffer.advance(1);
                    if self.stack.pop() != Some(Container::Object) {
                        return Err(CouchError::Decode("unbalanced '}'".into()));
                    }
                    self.expect_name = false;
                    return Ok(Some(JsonToken::EndObject));
                }
                b'[' => {
                    self.buffer.advance(1);
                    self.stack.push(Container::Array);
                    self.expect_name = false;
                    return Ok(Some(JsonToken::StartArray));
                }
                b']' => {
                    self.buffer.advance(1);
                    if self.stack.pop() != Some(Container::Array) {
                        return Err(CouchError::Decode("unbalanced ']'".into()));
                    }
                    self.expect_name = false;
                    return Ok(Some(JsonToken::EndArray));
                }
                b'"' => {
                    return match self.scan_string()? {
                        Some(text) => {
                            if self.stack.last() == Some(&Container::Object) && self.expect_name {
                                self.expect_name = false;
                                Ok(Some(JsonToken::FieldName(text)))
                            } else {
                                Ok(Some(JsonToken::String(text)))
                            }
                        }
                        None => self.need_more(),
                    };
                }
                b't' => return self.scan_literal(b"true", JsonToken::Bool(true)),
                b'f' => return self.scan_literal(b"false", JsonToken::Bool(false)),
                b'n' => return self.scan_literal(b"null", JsonToken::Null),
                b'-' | b'0'..=b'9' => {
                    return match self.scan_number()? {
                        Some(number) => Ok(Some(JsonToken::Number(number))),
                        None => self.need_more(),
                    };
                }
                other => {
                    return Err(CouchError::Decode(format!(
                        "unexpected byte 0x{other:02x} in JSON input"
                    )));
                }
            }
        }
    }

    fn need_more(&self) -> Result<Option<JsonToken>> {
        if self.eof && !self.remaining_is_blank() {
            return Err(CouchError::Decode("unexpected end of JSON input".into()));
        }
        Ok(None)
    }

    /// Scan a complete string starting at the opening quote. Returns `None`
    /// without consuming anything when the closing quote has not arrived.
    fn scan_string(&mut self) -> Result<Option<String>> {
        debug_assert_eq!(self.buffer[0], b'"');
        let mut out: Vec<u8> = Vec::new();
        let mut i = 1usize;

        loop {
            let Some(&byte) = self.buffer.get(i) else {
                return Ok(None);
            };
            match byte {
                b'"' => {
                    self.buffer.advance(i + 1);
                    let text = String::from_utf8(out)
                        .map_err(|e| CouchError::Decode(format!("invalid UTF-8 in string: {e}")))?;
                    return Ok(Some(text));
                }
                b'\\' => {
                    let Some(&esc) = self.buffer.get(i + 1) else {
                        return Ok(None);
                    };
                    match esc {
                        b'"' => out.push(b'"'),
                        b'\\' => out.push(b'\\'),
                        b'/' => out.push(b'/'),
                        b'b' => out.push(0x08),
                        b'f' => out.push(0x0c),
                        b'n' => out.push(b'\n'),
                        b'r' => out.push(b'\r'),
                        b't' => out.push(b'\t'),
                        b'u' => {
                            let Some(first) = self.hex_escape(i + 2) else {
                                return Ok(None);
                            };
                            let first = first?;
                            if (0xd800..0xdc00).contains(&first) {
                                // High surrogate; the low half must follow as \uXXXX.
                                let tail = i + 6;
                                match (self.buffer.get(tail), self.buffer.get(tail + 1)) {
                                    (Some(&b'\\'), Some(&b'u')) => {}
                                    (None, _) | (Some(&b'\\'), None) => return Ok(None),
                                    _ => {
                                        return Err(CouchError::Decode(
                                            "unpaired surrogate in string escape".into(),
                                        ))
                                    }
                                }
                                let Some(second) = self.hex_escape(tail + 2) else {
                                    return Ok(None);
                                };
                                let second = second?;
                                if !(0xdc00..0xe000).contains(&second) {
                                    return Err(CouchError::Decode(
                                        "unpaired surrogate in string escape".into(),
                                    ));
                                }
                                let code =
                                    0x10000 + ((first - 0xd800) << 10) + (second - 0xdc00);
                                let ch = char::from_u32(code).ok_or_else(|| {
                                    CouchError::Decode("invalid surrogate pair".into())
                                })?;
                                let mut utf8 = [0u8; 4];
                                out.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
                                i += 12;
                                continue;
                            }
                            let ch = char::from_u32(first).ok_or_else(|| {
                                CouchError::Decode("invalid \\u escape".into())
                            })?;
                            let mut utf8 = [0u8; 4];
                            out.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
                            i += 6;
                            continue;
                        }
                        other => {
                            return Err(CouchError::Decode(format!(
                                "invalid escape \\{}",
                                other as char
                            )));
                        }
                    }
                    i += 2;
                }
                _ => {
                    out.push(byte);
                    i += 1;
                }
            }
        }
    }

    /// Parse four hex digits at `at`. Outer `None` means the digits have
    /// not all arrived yet.
    fn hex_escape(&self, at: usize) -> Option<Result<u32>> {
        if self.buffer.len() < at + 4 {
            return None;
        }
        let mut value = 0u32;
        for &b in &self.buffer[at..at + 4] {
            let digit = match b {
                b'0'..=b'9' => (b - b'0') as u32,
                b'a'..=b'f' => (b - b'a' + 10) as u32,
                b'A'..=b'F' => (b - b'A' + 10) as u32,
                _ => {
                    return Some(Err(CouchError::Decode(
                        "invalid hex digit in \\u escape".into(),
                    )))
                }
            };
            value = value * 16 + digit;
        }
        Some(Ok(value))
    }

    fn scan_literal(&mut self, word: &'static [u8], token: JsonToken) -> Result<Option<JsonToken>> {
        if self.buffer.len() < word.len() {
            return self.need_more();
        }
        if &self.buffer[..word.len()] == word {
            self.buffer.advance(word.len());
            Ok(Some(token))
        } else {
            Err(CouchError::Decode(format!(
                "invalid literal, expected `{}`",
                String::from_utf8_lossy(word)
            )))
        }
    }

    /// Scan a number. A number is only complete once a delimiter follows it
    /// or the stream has ended; `None` means wait for more bytes.
    fn scan_number(&mut self) -> Result<Option<serde_json::Number>> {
        let mut end = 0usize;
        while let Some(&b) = self.buffer.get(end) {
            match b {
                b'0'..=b'9' | b'-' | b'+' | b'.' | b'e' | b'E' => end += 1,
                _ => break,
            }
        }
        if end == self.buffer.len() && !self.eof {
            return Ok(None);
        }
        let text = std::str::from_utf8(&self.buffer[..end])
            .map_err(|_| CouchError::Decode("invalid number bytes".into()))?;
        let number: serde_json::Number = text
            .parse()
            .map_err(|_| CouchError::Decode(format!("invalid JSON number `{text}`")))?;
        self.buffer.advance(end);
        Ok(Some(number))
    }
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}
