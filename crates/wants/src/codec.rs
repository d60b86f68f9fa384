//! Want list wire format
//!
//! A want message is one JSON object mapping blob reference strings to
//! signed integers:
//! ```text
//! {"<hex>.sha256": -1, "<hex>.sha256": 1024}
//! ```
//! Negative values are requests (hop count = magnitude), non-negative
//! values advertise a blob of that size.
//!
//! Decoding is strict: the object must be the whole input, every key must
//! parse as a blob reference and every value must be a number.

use std::collections::btree_map::{self, BTreeMap};

use blobs_core::{BlobRef, RefError};
use serde::ser::{Serialize, SerializeMap, Serializer};
use thiserror::Error;

/// Errors from [`WantList::decode`]
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("expected {expected} but got {found}")]
    Unexpected {
        expected: &'static str,
        found: &'static str,
    },

    #[error("unexpected end of input, expected {expected}")]
    Eof { expected: &'static str },

    #[error("expected end of input but read more data")]
    TrailingData,

    #[error("invalid blob reference: {0}")]
    Reference(#[from] RefError),

    #[error("malformed token at offset {offset}: {reason}")]
    Syntax { offset: usize, reason: String },
}

/// One want: a reference and its signed distance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantEntry {
    pub blob: BlobRef,
    /// `< 0`: request at hop count `-distance`; `>= 0`: advertised size
    pub distance: i64,
}

impl WantEntry {
    pub fn new(blob: BlobRef, distance: i64) -> Self {
        Self { blob, distance }
    }

    pub fn is_request(&self) -> bool {
        self.distance < 0
    }
}

/// Mapping of blob reference to distance; the last entry for a reference wins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WantList {
    entries: BTreeMap<BlobRef, i64>,
}

impl WantList {
    pub fn new() -> Self {
        Self::default()
    }

    /// A list holding exactly one entry
    pub fn single(blob: BlobRef, distance: i64) -> Self {
        let mut list = Self::new();
        list.insert(blob, distance);
        list
    }

    pub fn insert(&mut self, blob: BlobRef, distance: i64) -> Option<i64> {
        self.entries.insert(blob, distance)
    }

    pub fn remove(&mut self, blob: &BlobRef) -> Option<i64> {
        self.entries.remove(blob)
    }

    pub fn get(&self, blob: &BlobRef) -> Option<i64> {
        self.entries.get(blob).copied()
    }

    pub fn contains(&self, blob: &BlobRef) -> bool {
        self.entries.contains_key(blob)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in reference order
    pub fn iter(&self) -> impl Iterator<Item = (&BlobRef, i64)> + '_ {
        self.entries.iter().map(|(blob, dist)| (blob, *dist))
    }

    pub fn entries(&self) -> impl Iterator<Item = WantEntry> + '_ {
        self.iter().map(|(blob, dist)| WantEntry::new(blob.clone(), dist))
    }

    /// Canonical JSON encoding, keys in reference order
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Strictly decode one want message
    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        Decoder::new(input).run()
    }
}

impl FromIterator<(BlobRef, i64)> for WantList {
    fn from_iter<I: IntoIterator<Item = (BlobRef, i64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for WantList {
    type Item = (BlobRef, i64);
    type IntoIter = btree_map::IntoIter<BlobRef, i64>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Serialize for WantList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (blob, dist) in &self.entries {
            map.serialize_entry(blob, dist)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    BeginObject,
    EndObject,
    BeginArray,
    EndArray,
    Colon,
    Comma,
    Str(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl Token {
    fn kind(&self) -> &'static str {
        match self {
            Token::BeginObject => "'{'",
            Token::EndObject => "'}'",
            Token::BeginArray => "'['",
            Token::EndArray => "']'",
            Token::Colon => "':'",
            Token::Comma => "','",
            Token::Str(_) => "string",
            Token::Number(_) => "number",
            Token::Bool(_) => "boolean",
            Token::Null => "null",
        }
    }
}

/// JSON tokenizer; string and number literals are decoded by serde_json
struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    fn skip_whitespace(&mut self) {
        while let Some(b' ' | b'\t' | b'\n' | b'\r') = self.src.get(self.pos) {
            self.pos += 1;
        }
    }

    /// True when only whitespace is left
    fn at_end(&mut self) -> bool {
        self.skip_whitespace();
        self.pos >= self.src.len()
    }

    fn next(&mut self) -> Result<Option<Token>, DecodeError> {
        self.skip_whitespace();
        let Some(&b) = self.src.get(self.pos) else {
            return Ok(None);
        };

        let punct = match b {
            b'{' => Some(Token::BeginObject),
            b'}' => Some(Token::EndObject),
            b'[' => Some(Token::BeginArray),
            b']' => Some(Token::EndArray),
            b':' => Some(Token::Colon),
            b',' => Some(Token::Comma),
            _ => None,
        };
        if let Some(tok) = punct {
            self.pos += 1;
            return Ok(Some(tok));
        }

        match b {
            b'"' => self.string().map(Some),
            b'-' | b'0'..=b'9' => self.number().map(Some),
            _ => self.literal().map(Some),
        }
    }

    fn string(&mut self) -> Result<Token, DecodeError> {
        let start = self.pos;
        let mut i = start + 1;
        loop {
            match self.src.get(i) {
                None => return Err(self.syntax(start, "unterminated string")),
                Some(b'\\') => i += 2,
                Some(b'"') => break,
                Some(_) => i += 1,
            }
        }
        self.pos = i + 1;
        serde_json::from_slice::<String>(&self.src[start..self.pos])
            .map(Token::Str)
            .map_err(|e| self.syntax(start, e.to_string()))
    }

    fn number(&mut self) -> Result<Token, DecodeError> {
        let start = self.pos;
        while let Some(b'-' | b'+' | b'.' | b'e' | b'E' | b'0'..=b'9') = self.src.get(self.pos) {
            self.pos += 1;
        }
        serde_json::from_slice::<f64>(&self.src[start..self.pos])
            .map(Token::Number)
            .map_err(|e| self.syntax(start, e.to_string()))
    }

    fn literal(&mut self) -> Result<Token, DecodeError> {
        let rest = &self.src[self.pos..];
        let (tok, len) = if rest.starts_with(b"true") {
            (Token::Bool(true), 4)
        } else if rest.starts_with(b"false") {
            (Token::Bool(false), 5)
        } else if rest.starts_with(b"null") {
            (Token::Null, 4)
        } else {
            let c = String::from_utf8_lossy(&rest[..1]).into_owned();
            return Err(self.syntax(self.pos, format!("unexpected character {c:?}")));
        };
        self.pos += len;
        Ok(tok)
    }

    fn syntax(&self, offset: usize, reason: impl Into<String>) -> DecodeError {
        DecodeError::Syntax {
            offset,
            reason: reason.into(),
        }
    }
}

enum State {
    Begin,
    /// `first` allows the empty object `{}`
    ExpectKey { first: bool },
    ExpectValue(BlobRef),
    ExpectMoreOrEnd,
    ExpectEof,
}

impl State {
    fn expected(&self) -> &'static str {
        match self {
            State::Begin => "'{'",
            State::ExpectKey { first: true } => "blob reference or '}'",
            State::ExpectKey { first: false } => "blob reference",
            State::ExpectValue(_) => "number",
            State::ExpectMoreOrEnd => "',' or '}'",
            State::ExpectEof => "end of input",
        }
    }
}

struct Decoder<'a> {
    lexer: Lexer<'a>,
    out: WantList,
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            lexer: Lexer::new(input),
            out: WantList::new(),
        }
    }

    fn run(mut self) -> Result<WantList, DecodeError> {
        let mut state = State::Begin;
        loop {
            if let State::ExpectEof = state {
                return if self.lexer.at_end() {
                    Ok(self.out)
                } else {
                    Err(DecodeError::TrailingData)
                };
            }

            let expected = state.expected();
            let tok = self.lexer.next()?.ok_or(DecodeError::Eof { expected })?;
            state = self.step(state, tok)?;
        }
    }

    fn step(&mut self, state: State, tok: Token) -> Result<State, DecodeError> {
        let expected = state.expected();
        let unexpected = |tok: &Token| DecodeError::Unexpected {
            expected,
            found: tok.kind(),
        };

        match (state, tok) {
            (State::Begin, Token::BeginObject) => Ok(State::ExpectKey { first: true }),

            (State::ExpectKey { first: true }, Token::EndObject) => Ok(State::ExpectEof),
            (State::ExpectKey { .. }, Token::Str(key)) => {
                let blob: BlobRef = key.parse()?;
                match self.lexer.next()? {
                    Some(Token::Colon) => Ok(State::ExpectValue(blob)),
                    Some(other) => Err(DecodeError::Unexpected {
                        expected: "':'",
                        found: other.kind(),
                    }),
                    None => Err(DecodeError::Eof { expected: "':'" }),
                }
            }

            (State::ExpectValue(blob), Token::Number(n)) => {
                // fractional distances truncate toward zero
                self.out.insert(blob, n as i64);
                Ok(State::ExpectMoreOrEnd)
            }

            (State::ExpectMoreOrEnd, Token::Comma) => Ok(State::ExpectKey { first: false }),
            (State::ExpectMoreOrEnd, Token::EndObject) => Ok(State::ExpectEof),

            (_, tok) => Err(unexpected(&tok)),
        }
    }
}
