//! Byte conversion for keys and values crossing the store boundary.
//!
//! Only the store sees bytes. The screen and cache work on the typed key and
//! value, so a converter runs exactly once per eviction and once per store
//! lookup. Conversions must be lossless for the types a map is used with:
//! `decode(encode(x)) == x`.

pub mod bincode;

use crate::error::{Error, Result};

/// Bidirectional mapping between a typed value and a byte sequence.
pub trait Converter<T>: Send + Sync {
    /// Encode the value to bytes
    fn encode(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode bytes back to the original value
    fn decode(&self, bytes: &[u8]) -> Result<T>;
}

/// Converts any serde type with bincode.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bincode;

impl<T> Converter<T> for Bincode
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>> {
        self::bincode::serialize(value)
    }

    fn decode(&self, bytes: &[u8]) -> Result<T> {
        self::bincode::deserialize(bytes)
    }
}

/// Passes byte vectors through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Raw;

impl Converter<Vec<u8>> for Raw {
    fn encode(&self, value: &Vec<u8>) -> Result<Vec<u8>> {
        Ok(value.clone())
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

/// Stores strings as their UTF-8 bytes, without a length prefix.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8;

impl Converter<String> for Utf8 {
    fn encode(&self, value: &String) -> Result<Vec<u8>> {
        Ok(value.as_bytes().to_vec())
    }

    fn decode(&self, bytes: &[u8]) -> Result<String> {
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Decode("utf-8 string", e.to_string()))
    }
}
