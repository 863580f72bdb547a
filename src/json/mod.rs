//! Incremental JSON decoding.
//!
//! The streaming decoders in this crate never hold a whole response body in
//! memory. [`Tokenizer`] is a feed-based lexer that turns byte chunks into
//! [`JsonToken`]s as they become available; [`TokenSource`] drives it from
//! an async chunk stream, pulling a new chunk only when the consumer asks
//! for the next token.

pub mod source;
pub mod tokenizer;

pub use source::TokenSource;
pub use tokenizer::{JsonToken, Tokenizer};
