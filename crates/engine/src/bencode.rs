//! Bencode decoding and encoding for metafiles
//!
//! Bencode format:
//! - Integers: i<number>e (e.g., i42e)
//! - Strings: <length>:<string> (e.g., 4:spam)
//! - Lists: l<items>e (e.g., l4:spami42ee)
//! - Dictionaries: d<key><value>...e (keys must be strings, sorted)
//!
//! Decoding is strict: no leading zeros, no `-0`, no trailing data after
//! the root value.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum BencodeValue {
    Integer(i64),
    String(Vec<u8>),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

#[derive(Debug, Error, PartialEq)]
pub enum BencodeError {
    #[error("Unexpected end of input at byte {0}")]
    UnexpectedEof(usize),
    #[error("Invalid integer at byte {0}")]
    InvalidInteger(usize),
    #[error("Invalid string length at byte {0}")]
    InvalidStringLength(usize),
    #[error("Unexpected byte {byte:#04x} at position {pos}")]
    InvalidPrefix { byte: u8, pos: usize },
    #[error("Dictionary key at byte {0} is not a string")]
    ExpectedStringKey(usize),
    #[error("Trailing data after root value at byte {0}")]
    TrailingData(usize),
    #[error("Nesting too deep at byte {0}")]
    TooDeep(usize),
}

const MAX_DEPTH: usize = 64;

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof(self.pos))
    }

    fn value(&mut self, depth: usize) -> Result<BencodeValue, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep(self.pos));
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.string().map(BencodeValue::String),
            byte => Err(BencodeError::InvalidPrefix { byte, pos: self.pos }),
        }
    }

    fn integer(&mut self) -> Result<BencodeValue, BencodeError> {
        let start = self.pos;
        self.pos += 1; // 'i'
        let rest = &self.data[self.pos..];
        let len = rest
            .iter()
            .position(|&b| b == b'e')
            .ok_or(BencodeError::UnexpectedEof(self.data.len()))?;
        let digits = &rest[..len];

        let unsigned = digits.strip_prefix(b"-").unwrap_or(digits);
        let malformed = unsigned.is_empty()
            || !unsigned.iter().all(u8::is_ascii_digit)
            || (unsigned.len() > 1 && unsigned[0] == b'0')
            || digits == b"-0";
        if malformed {
            return Err(BencodeError::InvalidInteger(start));
        }

        let num: i64 = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidInteger(start))?;

        self.pos += len + 1;
        Ok(BencodeValue::Integer(num))
    }

    fn string(&mut self) -> Result<Vec<u8>, BencodeError> {
        let start = self.pos;
        let rest = &self.data[self.pos..];
        let colon = rest
            .iter()
            .position(|&b| b == b':')
            .ok_or(BencodeError::InvalidStringLength(start))?;
        let digits = &rest[..colon];
        if !digits.iter().all(u8::is_ascii_digit) || (digits.len() > 1 && digits[0] == b'0') {
            return Err(BencodeError::InvalidStringLength(start));
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidStringLength(start))?;

        let body = self.pos + colon + 1;
        let end = body
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof(self.data.len()))?;

        self.pos = end;
        Ok(self.data[body..end].to_vec())
    }

    fn list(&mut self, depth: usize) -> Result<BencodeValue, BencodeError> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(BencodeValue::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<BencodeValue, BencodeError> {
        self.pos += 1; // 'd'
        let mut dict = BTreeMap::new();
        while self.peek()? != b'e' {
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::ExpectedStringKey(self.pos));
            }
            let key = self.string()?;
            let value = self.value(depth + 1)?;
            dict.insert(key, value);
        }
        self.pos += 1;
        Ok(BencodeValue::Dict(dict))
    }
}

impl BencodeValue {
    /// Parse one value from the front of `data`, returning it with the number
    /// of bytes consumed
    pub fn parse(data: &[u8]) -> Result<(Self, usize), BencodeError> {
        let mut decoder = Decoder { data, pos: 0 };
        let value = decoder.value(0)?;
        Ok((value, decoder.pos))
    }

    /// Decode a complete document; anything after the root value is an error
    pub fn decode(data: &[u8]) -> Result<Self, BencodeError> {
        let (value, consumed) = Self::parse(data)?;
        if consumed != data.len() {
            return Err(BencodeError::TrailingData(consumed));
        }
        Ok(value)
    }

    /// Encode to bencode bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            BencodeValue::Integer(n) => {
                out.extend_from_slice(format!("i{}e", n).as_bytes());
            }
            BencodeValue::String(s) => {
                out.extend_from_slice(format!("{}:", s.len()).as_bytes());
                out.extend_from_slice(s);
            }
            BencodeValue::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            BencodeValue::Dict(dict) => {
                out.push(b'd');
                for (key, value) in dict {
                    out.extend_from_slice(format!("{}:", key.len()).as_bytes());
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn string(s: impl Into<Vec<u8>>) -> Self {
        BencodeValue::String(s.into())
    }

    // Helper methods for accessing values
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|s| std::str::from_utf8(s).ok())
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }
}
