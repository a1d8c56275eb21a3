//! CBOR payload codec shared by every wire message.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::{NetworkError, NetworkResult};

/// Encode a value to its wire representation
pub fn encode<T: Serialize>(value: &T) -> NetworkResult<Bytes> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| NetworkError::Serialization(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a value from its wire representation
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> NetworkResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| NetworkError::Serialization(e.to_string()))
}
