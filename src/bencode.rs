//! # Bencode Codec
//!
//! This module implements the Bencode serialization format used throughout
//! the BitTorrent protocol: torrent metainfo files, tracker responses and
//! extension-protocol messages are all Bencode values.
//!
//! ## Encoding Format
//!
//! Bencode has four types, each with a textual framing:
//!
//! | Type | Framing | Example |
//! |------|---------|---------|
//! | Byte string | `<len>:<bytes>` | `5:hello` |
//! | Integer | `i<signed-decimal>e` | `i52e`, `i-52e` |
//! | List | `l<items>e` | `l5:helloi52ee` |
//! | Dictionary | `d(<key><value>)*e` | `d3:foo3:bare` |
//!
//! Dictionary keys are byte strings and are emitted in ascending
//! lexicographic byte order. Strings are arbitrary bytes, not text.
//!
//! ## Raw-Byte Preservation
//!
//! The decoder works over a cursor and leaves it one position past the
//! decoded value. This lets callers recover the original byte span of any
//! sub-value, which is how the info-hash is computed over the torrent's
//! original `info` bytes (re-encoding could reorder or reformat them) and
//! how the header/payload boundary of `ut_metadata` messages is found.

use anyhow::{anyhow, Result};

use std::collections::BTreeMap;

/// A decoded Bencode value.
///
/// Dictionaries use a `BTreeMap` keyed by raw bytes, so re-encoding a
/// decoded value always emits keys in canonical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    /// Arbitrary byte string
    Bytes(Vec<u8>),
    /// 64-bit signed integer
    Int(i64),
    /// Ordered list of values
    List(Vec<Bencode>),
    /// Dictionary with byte-string keys
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl Bencode {
    /// Get the value as a byte string.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Bencode::Bytes(bytes) => Ok(bytes),
            _ => Err(anyhow!("bencode value is not a byte string")),
        }
    }

    /// Get the value as an integer.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Bencode::Int(n) => Ok(*n),
            _ => Err(anyhow!("bencode value is not an integer")),
        }
    }

    /// Get the value as a list.
    pub fn as_list(&self) -> Result<&[Bencode]> {
        match self {
            Bencode::List(items) => Ok(items),
            _ => Err(anyhow!("bencode value is not a list")),
        }
    }

    /// Get the value as a dictionary.
    pub fn as_dict(&self) -> Result<&BTreeMap<Vec<u8>, Bencode>> {
        match self {
            Bencode::Dict(entries) => Ok(entries),
            _ => Err(anyhow!("bencode value is not a dictionary")),
        }
    }

    /// Look up a dictionary entry by key.
    pub fn get(&self, key: &[u8]) -> Result<&Bencode> {
        self.as_dict()?
            .get(key)
            .ok_or_else(|| anyhow!("missing key {:?} in bencode dictionary", lossy(key)))
    }

    /// Render the value as JSON.
    ///
    /// Byte strings are decoded lossily as UTF-8; this matches how the
    /// `decode` command prints torrent data for humans.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Bencode::Bytes(bytes) => serde_json::Value::String(lossy(bytes)),
            Bencode::Int(n) => serde_json::Value::from(*n),
            Bencode::List(items) => {
                serde_json::Value::Array(items.iter().map(Bencode::to_json).collect())
            }
            Bencode::Dict(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(key, value)| (lossy(key), value.to_json()))
                    .collect(),
            ),
        }
    }
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Decode a complete Bencode value.
///
/// # Arguments
///
/// * `buf` - The encoded input; trailing bytes after the value are an error.
///
pub fn decode(buf: &[u8]) -> Result<Bencode> {
    let mut pos = 0;
    let value = decode_at(buf, &mut pos)?;

    // Reject trailing garbage
    if pos != buf.len() {
        return Err(anyhow!("trailing data after bencode value"));
    }

    Ok(value)
}

/// Decode one Bencode value starting at `pos`.
///
/// On success `pos` is advanced one past the value, so the caller can keep
/// decoding adjacent values or slice out the raw bytes `buf[start..pos]`.
pub fn decode_at(buf: &[u8], pos: &mut usize) -> Result<Bencode> {
    match buf.get(*pos) {
        Some(b'0'..=b'9') => decode_bytes(buf, pos),
        Some(b'i') => decode_int(buf, pos),
        Some(b'l') => {
            *pos += 1;

            let mut items: Vec<Bencode> = vec![];
            loop {
                match buf.get(*pos) {
                    Some(b'e') => break,
                    Some(_) => items.push(decode_at(buf, pos)?),
                    None => return Err(anyhow!("unterminated bencode list")),
                }
            }
            *pos += 1;

            Ok(Bencode::List(items))
        }
        Some(b'd') => {
            *pos += 1;

            let mut entries: BTreeMap<Vec<u8>, Bencode> = BTreeMap::new();
            loop {
                match buf.get(*pos) {
                    Some(b'e') => break,
                    Some(_) => {
                        // Keys must be byte strings
                        let key = match decode_at(buf, pos)? {
                            Bencode::Bytes(key) => key,
                            _ => return Err(anyhow!("bencode dictionary key is not a string")),
                        };
                        let value = decode_at(buf, pos)?;
                        entries.insert(key, value);
                    }
                    None => return Err(anyhow!("unterminated bencode dictionary")),
                }
            }
            *pos += 1;

            Ok(Bencode::Dict(entries))
        }
        Some(byte) => Err(anyhow!("invalid bencode type marker {:#04x}", byte)),
        None => Err(anyhow!("unexpected end of bencode input")),
    }
}

/// Decode a `<len>:<bytes>` string.
fn decode_bytes(buf: &[u8], pos: &mut usize) -> Result<Bencode> {
    let start = *pos;

    // Scan the decimal length up to the colon separator
    let mut cursor = start;
    while cursor < buf.len() && buf[cursor].is_ascii_digit() {
        cursor += 1;
    }
    if buf.get(cursor) != Some(&b':') {
        return Err(anyhow!("bencode string length without colon"));
    }

    let length: usize = std::str::from_utf8(&buf[start..cursor])
        .map_err(|_| anyhow!("invalid bencode string length"))?
        .parse()
        .map_err(|_| anyhow!("invalid bencode string length"))?;

    let begin = cursor + 1;
    let end = begin
        .checked_add(length)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| anyhow!("bencode string runs past end of input"))?;

    *pos = end;

    Ok(Bencode::Bytes(buf[begin..end].to_vec()))
}

/// Decode an `i<signed-decimal>e` integer.
fn decode_int(buf: &[u8], pos: &mut usize) -> Result<Bencode> {
    let start = *pos + 1;

    let mut cursor = start;
    while cursor < buf.len() && buf[cursor] != b'e' {
        cursor += 1;
    }
    if cursor == buf.len() {
        return Err(anyhow!("bencode integer without terminator"));
    }

    let number: i64 = std::str::from_utf8(&buf[start..cursor])
        .map_err(|_| anyhow!("invalid bencode integer"))?
        .parse()
        .map_err(|_| anyhow!("invalid bencode integer"))?;

    *pos = cursor + 1;

    Ok(Bencode::Int(number))
}

/// Encode a Bencode value.
///
/// Dictionary keys come out in ascending lexicographic byte order, so
/// `encode(decode(b)) == b` holds for canonical inputs.
pub fn encode(value: &Bencode) -> Vec<u8> {
    let mut out: Vec<u8> = vec![];
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Bencode, out: &mut Vec<u8>) {
    match value {
        Bencode::Bytes(bytes) => {
            out.extend_from_slice(bytes.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(bytes);
        }
        Bencode::Int(n) => {
            out.push(b'i');
            out.extend_from_slice(n.to_string().as_bytes());
            out.push(b'e');
        }
        Bencode::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Bencode::Dict(entries) => {
            out.push(b'd');
            for (key, entry) in entries {
                encode_into(&Bencode::Bytes(key.clone()), out);
                encode_into(entry, out);
            }
            out.push(b'e');
        }
    }
}

/// Locate the raw byte span of a value inside a top-level dictionary.
///
/// Walks the dictionary with the decode cursor and returns the original
/// slice of the value stored under `wanted`, untouched by any re-encoding.
/// Used to hash the torrent's `info` dictionary exactly as published.
pub fn raw_dict_value<'a>(buf: &'a [u8], wanted: &[u8]) -> Result<Option<&'a [u8]>> {
    let mut pos = 0;

    if buf.first() != Some(&b'd') {
        return Err(anyhow!("bencode value is not a dictionary"));
    }
    pos += 1;

    loop {
        match buf.get(pos) {
            Some(b'e') => return Ok(None),
            Some(_) => {
                let key = match decode_at(buf, &mut pos)? {
                    Bencode::Bytes(key) => key,
                    _ => return Err(anyhow!("bencode dictionary key is not a string")),
                };

                let start = pos;
                decode_at(buf, &mut pos)?;

                if key == wanted {
                    return Ok(Some(&buf[start..pos]));
                }
            }
            None => return Err(anyhow!("unterminated bencode dictionary")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_string() {
        assert_eq!(decode(b"5:hello").unwrap(), Bencode::Bytes(b"hello".to_vec()));
        assert_eq!(decode(b"0:").unwrap(), Bencode::Bytes(vec![]));
    }

    #[test]
    fn test_decode_integer() {
        assert_eq!(decode(b"i52e").unwrap(), Bencode::Int(52));
        assert_eq!(decode(b"i-52e").unwrap(), Bencode::Int(-52));
        assert_eq!(decode(b"i0e").unwrap(), Bencode::Int(0));
    }

    #[test]
    fn test_decode_list_to_json() {
        let value = decode(b"l5:helloi52ee").unwrap();
        assert_eq!(value.to_json().to_string(), r#"["hello",52]"#);
    }

    #[test]
    fn test_decode_dict_to_json() {
        let value = decode(b"d3:foo3:bar5:helloi52ee").unwrap();
        assert_eq!(value.to_json().to_string(), r#"{"foo":"bar","hello":52}"#);
    }

    #[test]
    fn test_decode_nested() {
        let value = decode(b"d4:spaml1:a1:bee").unwrap();
        let list = value.get(b"spam").unwrap().as_list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].as_bytes().unwrap(), b"a");
    }

    #[test]
    fn test_decode_malformed() {
        // Length prefix without its colon
        assert!(decode(b"5hello").is_err());
        // Integer without terminator
        assert!(decode(b"i52").is_err());
        // Input ends before closing 'e'
        assert!(decode(b"l5:hello").is_err());
        assert!(decode(b"d3:foo").is_err());
        // Dictionary key is not a string
        assert!(decode(b"di1e3:fooe").is_err());
        // String runs past end of input
        assert!(decode(b"10:abc").is_err());
        // Trailing garbage
        assert!(decode(b"i52egarbage").is_err());
        assert!(decode(b"").is_err());
    }

    #[test]
    fn test_roundtrip() {
        let inputs: [&[u8]; 4] = [
            b"l5:helloi52ee",
            b"d3:foo3:bar5:helloi52ee",
            b"d4:spaml1:a1:bee",
            b"i-1e",
        ];
        for input in inputs {
            let value = decode(input).unwrap();
            assert_eq!(encode(&value), input);
            assert_eq!(decode(&encode(&value)).unwrap(), value);
        }
    }

    #[test]
    fn test_encode_orders_keys() {
        let mut entries = BTreeMap::new();
        entries.insert(b"zz".to_vec(), Bencode::Int(1));
        entries.insert(b"aa".to_vec(), Bencode::Int(2));
        assert_eq!(encode(&Bencode::Dict(entries)), b"d2:aai2e2:zzi1ee");
    }

    #[test]
    fn test_raw_dict_value() {
        let buf = b"d8:announce3:url4:infod6:lengthi4eee";
        let raw = raw_dict_value(buf, b"info").unwrap().unwrap();
        assert_eq!(raw, b"d6:lengthi4ee");
        assert!(raw_dict_value(buf, b"missing").unwrap().is_none());
        assert!(raw_dict_value(b"i1e", b"info").is_err());
    }

    #[test]
    fn test_cursor_position_after_value() {
        let buf = b"d8:msg_typei1e5:piecei0ee<raw metadata>";
        let mut pos = 0;
        let header = decode_at(buf, &mut pos).unwrap();
        assert_eq!(header.get(b"msg_type").unwrap().as_int().unwrap(), 1);
        assert_eq!(&buf[pos..], b"<raw metadata>");
    }
}
