//! Bencode encoding/decoding (BEP-3).
//!
//! The extension protocol (BEP-10) and metadata exchange (BEP-9) carry
//! bencoded dictionaries inside peer messages, so the core needs its own
//! codec. Dictionaries keep their keys as raw byte strings sorted in a
//! `BTreeMap`, which makes re-encoding canonical by construction.

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

/// Errors produced while decoding bencode.
#[derive(Debug, Error)]
pub enum BencodeError {
    /// Input ended in the middle of a value.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A byte that cannot start or continue a value at this position.
    #[error("unexpected byte {0:#04x} at offset {1}")]
    UnexpectedByte(u8, usize),

    /// Malformed integer (empty, leading zeros, bare minus).
    #[error("invalid integer at offset {0}")]
    InvalidInteger(usize),

    /// Malformed string length prefix.
    #[error("invalid string length at offset {0}")]
    InvalidLength(usize),

    /// Dictionary keys must be strictly ascending byte strings.
    #[error("misordered or duplicate dictionary key at offset {0}")]
    BadDictKey(usize),

    /// Input continued past the end of the outermost value.
    #[error("trailing data after value")]
    TrailingData,
}

/// A bencode value: integer, byte string, list, or dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    /// Creates a byte-string value from a UTF-8 string.
    pub fn string(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Looks up a key if this value is a dictionary.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

/// Decodes a single value; the entire input must be consumed.
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    let (value, used) = decode_prefix(data)?;
    if used != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Decodes a single value from the front of `data`, returning it together
/// with the number of bytes consumed. BEP-9 data messages append the raw
/// metadata piece directly after the bencoded header, so callers need the
/// split point.
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), BencodeError> {
    let mut parser = Parser { data, pos: 0 };
    let value = parser.parse_value()?;
    Ok((value, parser.pos))
}

/// Encodes a value into its canonical bencode form.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            out.push(b'd');
            for (key, val) in dict {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}

struct Parser<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn parse_value(&mut self) -> Result<Value, BencodeError> {
        match self.peek()? {
            b'i' => self.parse_integer(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => Ok(Value::Bytes(self.parse_string()?)),
            other => Err(BencodeError::UnexpectedByte(other, self.pos)),
        }
    }

    fn parse_integer(&mut self) -> Result<Value, BencodeError> {
        let start = self.pos;
        self.pos += 1; // 'i'
        let end = self.find(b'e')?;
        let digits = &self.data[self.pos..end];
        let negative = digits.first() == Some(&b'-');
        let magnitude = if negative { &digits[1..] } else { digits };
        if magnitude.is_empty()
            || (magnitude.len() > 1 && magnitude[0] == b'0')
            || (negative && magnitude == b"0")
        {
            return Err(BencodeError::InvalidInteger(start));
        }
        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger(start))?;
        let value: i64 = text
            .parse()
            .map_err(|_| BencodeError::InvalidInteger(start))?;
        self.pos = end + 1;
        Ok(Value::Integer(value))
    }

    fn parse_string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        let colon = self.find(b':')?;
        let len_digits = &self.data[self.pos..colon];
        if len_digits.is_empty() || (len_digits.len() > 1 && len_digits[0] == b'0') {
            return Err(BencodeError::InvalidLength(start));
        }
        let len: usize = std::str::from_utf8(len_digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidLength(start))?;
        let data_start = colon + 1;
        let data_end = data_start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(BencodeError::UnexpectedEof)?;
        self.pos = data_end;
        Ok(Bytes::copy_from_slice(&self.data[data_start..data_end]))
    }

    fn parse_list(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.pos += 1; // 'e'
        Ok(Value::List(items))
    }

    fn parse_dict(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1; // 'd'
        let mut dict = BTreeMap::new();
        let mut last_key: Option<Bytes> = None;
        while self.peek()? != b'e' {
            let key_pos = self.pos;
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::UnexpectedByte(self.peek()?, key_pos));
            }
            let key = self.parse_string()?;
            if let Some(prev) = &last_key {
                if *prev >= key {
                    return Err(BencodeError::BadDictKey(key_pos));
                }
            }
            let value = self.parse_value()?;
            last_key = Some(key.clone());
            dict.insert(key, value);
        }
        self.pos += 1; // 'e'
        Ok(Value::Dict(dict))
    }

    fn find(&self, needle: u8) -> Result<usize, BencodeError> {
        self.data[self.pos..]
            .iter()
            .position(|&b| b == needle)
            .map(|off| self.pos + off)
            .ok_or(BencodeError::UnexpectedEof)
    }
}
