//! Value codecs.
//!
//! A codec turns a typed value into the text stored in a `value` column or a
//! replication payload, and back.

use crate::error::{Result, StorageError};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Serializes values of type `T` to and from text.
pub trait Codec<T>: Send + Sync {
    /// Short, stable name carried in replication envelopes.
    fn name(&self) -> &'static str;

    fn encode(&self, value: &T) -> Result<String>;

    fn decode(&self, text: &str) -> Result<T>;
}

/// JSON text via `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &T) -> Result<String> {
        serde_json::to_string(value).map_err(|e| StorageError::Encode(e.to_string()))
    }

    fn decode(&self, text: &str) -> Result<T> {
        serde_json::from_str(text).map_err(|e| StorageError::Decode(e.to_string()))
    }
}

/// MessagePack (named fields), hex-armored so it fits a TEXT column.
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgPackCodec;

impl<T> Codec<T> for MsgPackCodec
where
    T: Serialize + DeserializeOwned,
{
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode(&self, value: &T) -> Result<String> {
        let bytes =
            rmp_serde::to_vec_named(value).map_err(|e| StorageError::Encode(e.to_string()))?;
        Ok(hex::encode(bytes))
    }

    fn decode(&self, text: &str) -> Result<T> {
        let bytes = hex::decode(text).map_err(|e| StorageError::Decode(e.to_string()))?;
        rmp_serde::from_slice(&bytes).map_err(|e| StorageError::Decode(e.to_string()))
    }
}
