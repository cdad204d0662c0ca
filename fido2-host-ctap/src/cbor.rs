//! CBOR encoding and decoding for CTAP messages using cbor4ii
//!
//! CTAP2 requires canonical CBOR: map keys sorted by their encoded form,
//! definite lengths only, and absent optional fields omitted rather than
//! written as `null`. [`MapBuilder`] takes care of the first and last
//! rule for the integer-keyed maps every command uses.

use crate::error::{CodecError, Result};

use std::collections::BTreeMap;

use cbor4ii::core::dec::{Decode, IgnoredAny, Read};
use cbor4ii::core::utils::SliceReader;
use serde::{Deserialize, Serialize};

pub type Value = cbor4ii::core::Value;

/// Encode a serde value to CBOR bytes
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    cbor4ii::serde::to_writer(&mut buf, value).map_err(|_| CodecError::InvalidCbor)?;
    Ok(buf)
}

/// Decode CBOR bytes into a serde value
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    cbor4ii::serde::from_slice(data).map_err(|_| CodecError::InvalidCbor)
}

/// Convert a dynamic [`Value`] into a typed value
pub fn from_value<T: for<'de> Deserialize<'de>>(value: &Value) -> Result<T> {
    decode(&encode(value)?)
}

/// Integer map key ordered the way canonical CBOR sorts it
///
/// Encoded unsigned integers (major type 0) precede negative ones
/// (major type 1), and within negatives -1 sorts before -2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CanonicalKey(i32);

impl PartialOrd for CanonicalKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CanonicalKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.0 >= 0, other.0 >= 0) {
            (true, true) => self.0.cmp(&other.0),
            (false, false) => other.0.cmp(&self.0),
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
        }
    }
}

/// Write a CBOR head for `major` with argument `arg`
fn write_head(out: &mut Vec<u8>, major: u8, arg: u64) {
    let major = major << 5;
    match arg {
        0..=23 => out.push(major | arg as u8),
        24..=0xFF => out.extend_from_slice(&[major | 24, arg as u8]),
        0x100..=0xFFFF => {
            out.push(major | 25);
            out.extend_from_slice(&(arg as u16).to_be_bytes());
        }
        0x1_0000..=0xFFFF_FFFF => {
            out.push(major | 26);
            out.extend_from_slice(&(arg as u32).to_be_bytes());
        }
        _ => {
            out.push(major | 27);
            out.extend_from_slice(&arg.to_be_bytes());
        }
    }
}

fn write_int_key(out: &mut Vec<u8>, key: i32) {
    if key >= 0 {
        write_head(out, 0, key as u64);
    } else {
        write_head(out, 1, (-(key as i64) - 1) as u64);
    }
}

/// Builds an integer-keyed CBOR map in canonical key order
///
/// Values are encoded on insert; `build` only sorts and concatenates.
#[derive(Debug, Default)]
pub struct MapBuilder {
    entries: BTreeMap<CanonicalKey, Vec<u8>>,
}

impl MapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a serde value under `key`
    pub fn insert<T: Serialize>(mut self, key: i32, value: T) -> Result<Self> {
        self.entries.insert(CanonicalKey(key), encode(&value)?);
        Ok(self)
    }

    /// Insert only if `value` is `Some`; `None` leaves the key out entirely
    pub fn insert_opt<T: Serialize>(self, key: i32, value: Option<T>) -> Result<Self> {
        match value {
            Some(v) => self.insert(key, v),
            None => Ok(self),
        }
    }

    /// Insert a CBOR byte string
    pub fn insert_bytes(self, key: i32, bytes: &[u8]) -> Result<Self> {
        self.insert(key, serde_bytes::Bytes::new(bytes))
    }

    /// Insert a value that is already CBOR encoded (a nested map, say)
    pub fn insert_encoded(mut self, key: i32, encoded: Vec<u8>) -> Self {
        self.entries.insert(CanonicalKey(key), encoded);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Encode the map
    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            1 + self.entries.values().map(|v| v.len() + 2).sum::<usize>(),
        );
        write_head(&mut out, 5, self.entries.len() as u64);
        for (key, value) in self.entries {
            write_int_key(&mut out, key.0);
            out.extend_from_slice(&value);
        }
        out
    }
}

/// Reads fields out of an integer-keyed CBOR map
#[derive(Debug, Clone)]
pub struct MapParser {
    map: BTreeMap<i32, Value>,
}

impl MapParser {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let value: Value = decode(data)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Map(entries) = value else {
            return Err(CodecError::UnexpectedType("map"));
        };

        let mut map = BTreeMap::new();
        for (k, v) in entries {
            // Text keys appear only in maps we never read through this parser
            if let Value::Integer(k) = k
                && let Ok(k) = i32::try_from(k)
            {
                map.insert(k, v);
            }
        }
        Ok(Self { map })
    }

    /// Required field
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: i32) -> Result<T> {
        let value = self.map.get(&key).ok_or(CodecError::MissingField(key))?;
        from_value(value)
    }

    /// Optional field
    pub fn get_opt<T: for<'de> Deserialize<'de>>(&self, key: i32) -> Result<Option<T>> {
        self.map.get(&key).map(from_value).transpose()
    }

    /// Required byte string
    pub fn get_bytes(&self, key: i32) -> Result<Vec<u8>> {
        match self.map.get(&key) {
            Some(Value::Bytes(bytes)) => Ok(bytes.clone()),
            Some(_) => Err(CodecError::UnexpectedType("byte string")),
            None => Err(CodecError::MissingField(key)),
        }
    }

    /// Optional byte string
    pub fn get_bytes_opt(&self, key: i32) -> Result<Option<Vec<u8>>> {
        if self.contains_key(key) {
            self.get_bytes(key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Raw value, for fields kept as opaque CBOR
    pub fn get_raw(&self, key: i32) -> Option<&Value> {
        self.map.get(&key)
    }

    pub fn contains_key(&self, key: i32) -> bool {
        self.map.contains_key(&key)
    }
}

/// Look up a text key in a decoded CBOR map
pub fn text_entry<'a>(map: &'a Value, key: &str) -> Option<&'a Value> {
    let Value::Map(entries) = map else {
        return None;
    };
    entries.iter().find_map(|(k, v)| match k {
        Value::Text(text) if text == key => Some(v),
        _ => None,
    })
}

/// Look up an integer key in a decoded CBOR map
pub fn int_entry(map: &Value, key: i32) -> Option<&Value> {
    let Value::Map(entries) = map else {
        return None;
    };
    entries.iter().find_map(|(k, v)| match k {
        Value::Integer(i) if *i == i128::from(key) => Some(v),
        _ => None,
    })
}

/// Length in bytes of the first CBOR data item in `data`
///
/// Authenticator data embeds a COSE key followed directly by the
/// extensions map, with no length prefix for either; this finds the seam.
pub fn item_len(data: &[u8]) -> Result<usize> {
    split_first_item(data).map(|(item, _)| item.len())
}

/// Split `data` into its first CBOR item and whatever follows
///
/// The item is skipped by cbor4ii's decoder, so nesting deeper than its
/// limit is rejected.
pub fn split_first_item(data: &[u8]) -> Result<(&[u8], &[u8])> {
    let mut reader = SliceReader::new(data);
    IgnoredAny::decode(&mut reader).map_err(|_| CodecError::InvalidCbor)?;
    let remaining = reader
        .fill(usize::MAX)
        .map_err(|_| CodecError::InvalidCbor)?
        .as_ref()
        .len();
    Ok(data.split_at(data.len() - remaining))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_builder_and_parser() {
        let cbor = MapBuilder::new()
            .insert(1, "test")
            .unwrap()
            .insert(2, 42i32)
            .unwrap()
            .insert_bytes(3, &[1, 2, 3])
            .unwrap()
            .build();

        let parser = MapParser::from_bytes(&cbor).unwrap();
        assert_eq!(parser.get::<String>(1).unwrap(), "test");
        assert_eq!(parser.get::<i32>(2).unwrap(), 42);
        assert_eq!(parser.get_bytes(3).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_absent_optional_is_omitted() {
        let cbor = MapBuilder::new()
            .insert(1, "required")
            .unwrap()
            .insert_opt::<i32>(3, None)
            .unwrap()
            .build();

        // One entry, and no CBOR null (0xF6) anywhere
        assert_eq!(cbor[0], 0xA1);
        assert!(!cbor.contains(&0xF6));
    }

    #[test]
    fn test_missing_and_mistyped_fields() {
        let cbor = MapBuilder::new().insert(1, "text").unwrap().build();
        let parser = MapParser::from_bytes(&cbor).unwrap();

        assert_eq!(
            parser.get::<String>(99).unwrap_err(),
            CodecError::MissingField(99)
        );
        assert_eq!(parser.get_opt::<String>(99).unwrap(), None);
        assert_eq!(
            parser.get_bytes(1).unwrap_err(),
            CodecError::UnexpectedType("byte string")
        );
    }

    #[test]
    fn test_parser_rejects_non_map() {
        let cbor = encode(&"not a map").unwrap();
        assert!(matches!(
            MapParser::from_bytes(&cbor),
            Err(CodecError::UnexpectedType(_))
        ));
        assert_eq!(
            decode::<String>(&[0xFF, 0xFF]).unwrap_err(),
            CodecError::InvalidCbor
        );
    }

    #[test]
    fn test_canonical_ordering() {
        // Inserted out of order on purpose
        let cbor = MapBuilder::new()
            .insert(-2, 0u8)
            .unwrap()
            .insert(3, 0u8)
            .unwrap()
            .insert(-1, 0u8)
            .unwrap()
            .insert(1, 0u8)
            .unwrap()
            .insert(-3, 0u8)
            .unwrap()
            .build();

        assert_eq!(
            cbor,
            vec![0xA5, 0x01, 0x00, 0x03, 0x00, 0x20, 0x00, 0x21, 0x00, 0x22, 0x00]
        );
    }

    #[test]
    fn test_large_keys() {
        let cbor = MapBuilder::new()
            .insert(300, true)
            .unwrap()
            .insert(24, true)
            .unwrap()
            .build();
        assert_eq!(cbor, vec![0xA2, 0x18, 24, 0xF5, 0x19, 0x01, 0x2C, 0xF5]);
    }

    #[test]
    fn test_nested_encoded_value() {
        let inner = MapBuilder::new().insert(1, 2).unwrap().build();
        let cbor = MapBuilder::new().insert_encoded(6, inner).build();

        let parser = MapParser::from_bytes(&cbor).unwrap();
        let nested = parser.get_raw(6).unwrap();
        assert_eq!(int_entry(nested, 1), Some(&Value::Integer(2)));
    }

    #[test]
    fn test_text_entry_lookup() {
        let value: Value = decode(&encode(&BTreeMap::from([("fmt", "packed")])).unwrap()).unwrap();
        assert_eq!(text_entry(&value, "fmt"), Some(&Value::Text("packed".into())));
        assert_eq!(text_entry(&value, "alg"), None);
    }

    #[test]
    fn test_split_first_item() {
        let cose = MapBuilder::new()
            .insert(1, 2)
            .unwrap()
            .insert(3, -7)
            .unwrap()
            .insert_bytes(-2, &[0xAB; 32])
            .unwrap()
            .build();
        let extensions = encode(&BTreeMap::from([("hmac-secret", true)])).unwrap();

        let mut data = cose.clone();
        data.extend_from_slice(&extensions);

        let (first, rest) = split_first_item(&data).unwrap();
        assert_eq!(first, &cose[..]);
        assert_eq!(rest, &extensions[..]);
    }

    #[test]
    fn test_item_len_truncated() {
        // Byte string claiming 32 bytes but carrying 2
        assert_eq!(item_len(&[0x58, 0x20, 1, 2]), Err(CodecError::InvalidCbor));
        assert_eq!(item_len(&[]), Err(CodecError::InvalidCbor));
        // Map claiming two entries but carrying one
        assert_eq!(item_len(&[0xA2, 0x01, 0x02]), Err(CodecError::InvalidCbor));
    }

    #[test]
    fn test_item_len_nesting_limit() {
        let nested = |depth: usize| {
            let mut data = vec![0x81; depth];
            data.push(0x00);
            data
        };
        assert_eq!(item_len(&nested(10)), Ok(11));

        // Deeper than the decoder allows; must fail, not exhaust the stack
        assert_eq!(item_len(&nested(300)), Err(CodecError::InvalidCbor));
        assert_eq!(item_len(&nested(7600)), Err(CodecError::InvalidCbor));
    }
}
