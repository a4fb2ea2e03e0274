//! Serialization codecs and the format registry
//!
//! The logical value model is `serde_json::Value`; every registered codec
//! encodes and decodes that model. When a request's format matches the
//! cache's native format the bytes cross the proxy untouched, so codecs
//! only run at format boundaries.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Format name of the JSON codec
pub const JSON: &str = "json";

/// Format name of the MessagePack codec
pub const MSGPACK: &str = "msgpack";

/// A codec failure, carrying the format it occurred in
#[derive(Debug, Clone)]
pub struct CodecError {
  pub format: String,
  pub detail: String,
}

impl CodecError {
  pub fn new(format: &str, detail: impl std::fmt::Display) -> Self {
    Self {
      format: format.to_string(),
      detail: detail.to_string(),
    }
  }
}

impl std::fmt::Display for CodecError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "codec '{}' failed: {}", self.format, self.detail)
  }
}

impl std::error::Error for CodecError {}

/// Encodes and decodes logical values for one named format
pub trait Codec: Send + Sync {
  fn name(&self) -> &'static str;
  fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
  fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// Compact JSON
pub struct JsonCodec;

impl Codec for JsonCodec {
  fn name(&self) -> &'static str {
    JSON
  }

  fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(|e| CodecError::new(JSON, e))
  }

  fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
    serde_json::from_slice(bytes).map_err(|e| CodecError::new(JSON, e))
  }
}

/// MessagePack
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
  fn name(&self) -> &'static str {
    MSGPACK
  }

  fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec(value).map_err(|e| CodecError::new(MSGPACK, e))
  }

  fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|e| CodecError::new(MSGPACK, e))
  }
}

/// Decode bytes into a typed payload through the logical value model
pub fn decode_as<T: DeserializeOwned>(codec: &dyn Codec, bytes: &[u8]) -> Result<T, CodecError> {
  let value = codec.decode(bytes)?;
  serde_json::from_value(value).map_err(|e| CodecError::new(codec.name(), e))
}

/// Encode a typed payload through the logical value model
pub fn encode_from<T: Serialize>(codec: &dyn Codec, payload: &T) -> Result<Vec<u8>, CodecError> {
  let value = serde_json::to_value(payload).map_err(|e| CodecError::new(codec.name(), e))?;
  codec.encode(&value)
}

/// Resolves format names to codecs and knows the backend's native format
pub struct CodecRegistry {
  codecs: HashMap<&'static str, Arc<dyn Codec>>,
  cache_format: &'static str,
}

impl CodecRegistry {
  /// Registry with the JSON and MessagePack codecs; MessagePack is the
  /// cache-native format.
  pub fn with_defaults() -> Self {
    let mut codecs: HashMap<&'static str, Arc<dyn Codec>> = HashMap::new();
    codecs.insert(JSON, Arc::new(JsonCodec));
    codecs.insert(MSGPACK, Arc::new(MsgpackCodec));
    Self {
      codecs,
      cache_format: MSGPACK,
    }
  }

  pub fn resolve(&self, format: &str) -> Option<Arc<dyn Codec>> {
    self.codecs.get(format).cloned()
  }

  /// The backend's native format name.
  pub fn cache_format(&self) -> &'static str {
    self.cache_format
  }

  pub fn cache_codec(&self) -> Arc<dyn Codec> {
    self.codecs[self.cache_format].clone()
  }
}
