//! Per-request context
//!
//! A holder bundles the resolved cache with the client and cache codecs
//! for the life of one request. All payload bridging goes through it, and
//! every conversion short-circuits when the client's format is already the
//! cache's native format.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use grid::{
  AsyncCache, BinaryProcessor, Codec, Comparator, Extractor, Filter, GridCache, ProcessorResult,
};
use proto::api::{BoolValue, BytesValue, Entry, OptionalValue};

use crate::error::ProxyError;
use crate::resolver::{CacheResolver, ResolvedCache};

pub struct RequestHolder {
  resolved: ResolvedCache,
  client: Arc<dyn Codec>,
  native: Arc<dyn Codec>,
  passthrough: bool,
}

/// Build a holder for one request. An empty format means the client
/// already speaks the cache's native format.
pub fn create_holder(
  resolver: &CacheResolver,
  scope: &str,
  cache: &str,
  format: &str,
) -> Result<RequestHolder, ProxyError> {
  let resolved = resolver.resolve(scope, cache)?;
  let native = resolved.cache.codec().clone();
  let client = if format.is_empty() || format == native.name() {
    native.clone()
  } else {
    resolved
      .session
      .codecs()
      .resolve(format)
      .ok_or_else(|| ProxyError::invalid(format!("unknown serialization format '{}'", format)))?
  };
  let passthrough = client.name() == native.name();
  Ok(RequestHolder {
    resolved,
    client,
    native,
    passthrough,
  })
}

impl RequestHolder {
  pub fn cache(&self) -> &Arc<GridCache> {
    &self.resolved.cache
  }

  pub fn async_cache(&self) -> &AsyncCache {
    &self.resolved.async_cache
  }

  pub fn client_codec(&self) -> &Arc<dyn Codec> {
    &self.client
  }

  pub fn is_passthrough(&self) -> bool {
    self.passthrough
  }

  /// Client format to cache format.
  pub fn convert_down(&self, bytes: &[u8]) -> Result<Vec<u8>, ProxyError> {
    if self.passthrough {
      return Ok(bytes.to_vec());
    }
    let value = self
      .client
      .decode(bytes)
      .map_err(|e| ProxyError::invalid(e.to_string()))?;
    self
      .native
      .encode(&value)
      .map_err(|e| ProxyError::internal(e))
  }

  pub fn convert_key_down(&self, bytes: &[u8]) -> Result<Vec<u8>, ProxyError> {
    self.convert_down(bytes)
  }

  /// Cache format to client format. Stored bytes that fail to decode are
  /// a backend fault, not the caller's.
  pub fn convert_up(&self, bytes: &[u8]) -> Result<Vec<u8>, ProxyError> {
    if self.passthrough {
      return Ok(bytes.to_vec());
    }
    let value = self
      .native
      .decode(bytes)
      .map_err(|e| ProxyError::internal(e))?;
    self
      .client
      .encode(&value)
      .map_err(|e| ProxyError::internal(e))
  }

  /// Decode a client payload into a typed value.
  pub fn decode_client<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, ProxyError> {
    grid::codec::decode_as(self.client.as_ref(), bytes).map_err(|e| ProxyError::invalid(e.to_string()))
  }

  pub fn decode_client_value(&self, bytes: &[u8]) -> Result<Value, ProxyError> {
    self
      .client
      .decode(bytes)
      .map_err(|e| ProxyError::invalid(e.to_string()))
  }

  pub fn encode_client_value(&self, value: &Value) -> Result<Vec<u8>, ProxyError> {
    self
      .client
      .encode(value)
      .map_err(|e| ProxyError::internal(e))
  }

  /// Empty filter bytes mean match-all.
  pub fn ensure_filter(&self, bytes: &[u8]) -> Result<Filter, ProxyError> {
    if bytes.is_empty() {
      Ok(Filter::Always)
    } else {
      self.decode_client(bytes)
    }
  }

  /// Empty comparator bytes mean natural order.
  pub fn optional_comparator(&self, bytes: &[u8]) -> Result<Option<Comparator>, ProxyError> {
    if bytes.is_empty() {
      Ok(None)
    } else {
      Ok(Some(self.decode_client(bytes)?))
    }
  }

  /// Extractors are required payloads; empty bytes are an error.
  pub fn ensure_extractor(&self, bytes: &[u8]) -> Result<Extractor, ProxyError> {
    if bytes.is_empty() {
      return Err(ProxyError::invalid(
        "the request does not contain a serialized extractor",
      ));
    }
    self.decode_client(bytes)
  }

  /// Decode a processor sent by the client and bring its embedded value
  /// payloads into the cache's format.
  pub fn processor_down(&self, bytes: &[u8]) -> Result<BinaryProcessor, ProxyError> {
    let processor: BinaryProcessor = self.decode_client(bytes)?;
    if self.passthrough {
      return Ok(processor);
    }
    Ok(match processor {
      BinaryProcessor::Get => BinaryProcessor::Get,
      BinaryProcessor::Remove => BinaryProcessor::Remove,
      BinaryProcessor::Put { value, ttl_millis } => BinaryProcessor::Put {
        value: self.convert_down(&value)?,
        ttl_millis,
      },
      BinaryProcessor::PutIfAbsent { value, ttl_millis } => BinaryProcessor::PutIfAbsent {
        value: self.convert_down(&value)?,
        ttl_millis,
      },
      BinaryProcessor::Replace { value } => BinaryProcessor::Replace {
        value: self.convert_down(&value)?,
      },
      BinaryProcessor::ReplaceMapping {
        expect,
        replacement,
      } => BinaryProcessor::ReplaceMapping {
        expect: self.convert_down(&expect)?,
        replacement: self.convert_down(&replacement)?,
      },
      BinaryProcessor::RemoveMapping { value } => BinaryProcessor::RemoveMapping {
        value: self.convert_down(&value)?,
      },
      BinaryProcessor::ContainsValue { value } => BinaryProcessor::ContainsValue {
        value: self.convert_down(&value)?,
      },
    })
  }

  /// Finalize a get-style result, keeping present-but-null distinct from
  /// absent.
  pub fn to_optional_value(&self, result: ProcessorResult) -> Result<OptionalValue, ProxyError> {
    match result {
      ProcessorResult::Value(v) => Ok(OptionalValue::of(self.convert_up(&v)?)),
      ProcessorResult::Absent => Ok(OptionalValue::absent()),
      ProcessorResult::Bool(_) => Err(ProxyError::internal("unexpected boolean result")),
    }
  }

  /// Finalize a prior-value result.
  pub fn to_bytes_value(&self, result: ProcessorResult) -> Result<BytesValue, ProxyError> {
    match result {
      ProcessorResult::Absent => Ok(BytesValue::from(Vec::new())),
      ProcessorResult::Value(v) => Ok(BytesValue::from(self.convert_up(&v)?)),
      ProcessorResult::Bool(b) => Ok(BytesValue::from(
        self.encode_client_value(&Value::Bool(b))?,
      )),
    }
  }

  /// Finalize a predicate result.
  pub fn to_bool_value(&self, result: ProcessorResult) -> Result<BoolValue, ProxyError> {
    match result {
      ProcessorResult::Bool(b) => Ok(BoolValue::from(b)),
      ProcessorResult::Absent => Ok(BoolValue::from(false)),
      ProcessorResult::Value(v) => {
        let decoded = self
          .native
          .decode(&v)
          .map_err(|e| ProxyError::internal(e))?;
        Ok(BoolValue::from(decoded.as_bool().unwrap_or(false)))
      }
    }
  }

  /// Lift a backend entry into the client's format.
  pub fn entry_up(&self, key: &[u8], value: &[u8]) -> Result<Entry, ProxyError> {
    Ok(Entry::new(self.convert_up(key)?, self.convert_up(value)?))
  }
}

/// Required payload check shared by the handlers.
pub fn require_bytes(bytes: &[u8], what: &str) -> Result<(), ProxyError> {
  if bytes.is_empty() {
    Err(ProxyError::invalid(format!(
      "the request does not contain a serialized {}",
      what
    )))
  } else {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use grid::{CodecRegistry, GridInstance, GridSession, InstanceRegistry, PartitionedService};
  use serde_json::json;

  fn resolver() -> Arc<CacheResolver> {
    let registry = InstanceRegistry::new();
    let instance = GridInstance::new(grid::DEFAULT_NAME);
    instance.add_session(GridSession::new(
      "",
      Arc::new(CodecRegistry::with_defaults()),
      PartitionedService::new(1, 7),
    ));
    registry.register(instance);
    CacheResolver::new(registry, None, "")
  }

  #[test]
  fn passthrough_conversions_are_identity() {
    let resolver = resolver();
    let holder = create_holder(&resolver, "", "people", "msgpack").unwrap();
    assert!(holder.is_passthrough());

    let bytes = vec![0xAA, 0xBB];
    assert_eq!(holder.convert_down(&bytes).unwrap(), bytes);
    assert_eq!(holder.convert_up(&bytes).unwrap(), bytes);
  }

  #[test]
  fn empty_format_means_native() {
    let resolver = resolver();
    let holder = create_holder(&resolver, "", "people", "").unwrap();
    assert!(holder.is_passthrough());
  }

  #[test]
  fn cross_format_conversion_bridges_exactly_once() {
    let resolver = resolver();
    let holder = create_holder(&resolver, "", "people", "json").unwrap();
    assert!(!holder.is_passthrough());

    let logical = json!({"id": 1});
    let json_bytes = serde_json::to_vec(&logical).unwrap();
    let native = holder.convert_down(&json_bytes).unwrap();
    assert_ne!(native, json_bytes);

    let back = holder.convert_up(&native).unwrap();
    assert_eq!(serde_json::from_slice::<Value>(&back).unwrap(), logical);
  }

  #[test]
  fn unknown_format_is_invalid_argument() {
    let resolver = resolver();
    assert!(matches!(
      create_holder(&resolver, "", "people", "pof"),
      Err(ProxyError::InvalidArgument(_))
    ));
  }

  #[test]
  fn empty_filter_means_match_all() {
    let resolver = resolver();
    let holder = create_holder(&resolver, "", "people", "json").unwrap();
    assert_eq!(holder.ensure_filter(&[]).unwrap(), Filter::Always);
    assert!(holder.optional_comparator(&[]).unwrap().is_none());
  }

  #[test]
  fn malformed_filter_is_invalid_argument() {
    let resolver = resolver();
    let holder = create_holder(&resolver, "", "people", "json").unwrap();
    assert!(matches!(
      holder.ensure_filter(b"{not valid"),
      Err(ProxyError::InvalidArgument(_))
    ));
  }

  #[test]
  fn processor_down_converts_embedded_values() {
    let resolver = resolver();
    let holder = create_holder(&resolver, "", "people", "json").unwrap();

    let value = serde_json::to_vec(&json!({"id": 1})).unwrap();
    let processor = BinaryProcessor::Put {
      value: value.clone(),
      ttl_millis: 0,
    };
    let bytes =
      serde_json::to_vec(&serde_json::to_value(&processor).unwrap()).unwrap();
    match holder.processor_down(&bytes).unwrap() {
      BinaryProcessor::Put {
        value: converted,
        ttl_millis,
      } => {
        assert_eq!(ttl_millis, 0);
        assert_ne!(converted, value);
        // stored bytes are in the cache's native format
        let native = holder.cache().codec().decode(&converted).unwrap();
        assert_eq!(native, json!({"id": 1}));
      }
      other => panic!("unexpected processor: {:?}", other),
    }
  }

  #[test]
  fn require_bytes_rejects_empty() {
    assert!(require_bytes(&[], "entry processor").is_err());
    assert!(require_bytes(&[1], "entry processor").is_ok());
  }
}
