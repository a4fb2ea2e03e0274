//! Generated wire types for the hoard cache access protocol.
//!
//! The proxy keeps payload bytes opaque: every `bytes` field below crosses
//! the proxy unchanged whenever the request's `format` matches the cache's
//! native format. Helper constructors here only assemble messages; they
//! never look inside payloads.

pub mod api {
  tonic::include_proto!("hoard.v1");
}

pub use api::named_cache_client::NamedCacheClient;
pub use api::named_cache_server::{NamedCache, NamedCacheServer};

use api::{
  map_listener_request, map_listener_response, BoolValue, BytesValue, CacheDestroyed,
  CacheTruncated, Empty, Entry, EntryResult, EventKind, InitRequest, Int32Value,
  MapEventResponse, MapListenerError, MapListenerRequest, MapListenerResponse,
  MapListenerSubscribed, MapListenerUnsubscribed, OptionalValue, SubscribeRequest,
  UnsubscribeRequest,
};

pub const EMPTY: Empty = Empty {};

impl OptionalValue {
  /// A present mapping with the given value bytes.
  pub fn of(value: Vec<u8>) -> Self {
    OptionalValue {
      present: true,
      value,
    }
  }

  /// An absent mapping.
  pub fn absent() -> Self {
    OptionalValue {
      present: false,
      value: Vec::new(),
    }
  }
}

impl Entry {
  pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
    Entry { key, value }
  }
}

impl EntryResult {
  pub fn new(key: Vec<u8>, value: Vec<u8>) -> Self {
    EntryResult {
      key,
      value,
      cookie: Vec::new(),
    }
  }

  pub fn with_cookie(key: Vec<u8>, value: Vec<u8>, cookie: Vec<u8>) -> Self {
    EntryResult { key, value, cookie }
  }
}

impl From<bool> for BoolValue {
  fn from(value: bool) -> Self {
    BoolValue { value }
  }
}

impl From<i32> for Int32Value {
  fn from(value: i32) -> Self {
    Int32Value { value }
  }
}

impl From<Vec<u8>> for BytesValue {
  fn from(value: Vec<u8>) -> Self {
    BytesValue { value }
  }
}

impl MapListenerRequest {
  /// The stream-opening message fixing scope and payload format.
  pub fn init(uid: impl Into<String>, scope: impl Into<String>, format: impl Into<String>) -> Self {
    MapListenerRequest {
      uid: uid.into(),
      request: Some(map_listener_request::Request::Init(InitRequest {
        scope: scope.into(),
        format: format.into(),
      })),
    }
  }

  /// A filter subscription; an empty filter matches every entry.
  pub fn subscribe_filter(
    uid: impl Into<String>,
    filter_id: i64,
    cache: impl Into<String>,
    filter: Vec<u8>,
    lite: bool,
    priming: bool,
  ) -> Self {
    MapListenerRequest {
      uid: uid.into(),
      request: Some(map_listener_request::Request::Subscribe(SubscribeRequest {
        filter_id,
        cache: cache.into(),
        filter,
        keys: Vec::new(),
        lite,
        priming,
      })),
    }
  }

  /// A key subscription for the given set of keys.
  pub fn subscribe_keys(
    uid: impl Into<String>,
    filter_id: i64,
    cache: impl Into<String>,
    keys: Vec<Vec<u8>>,
    lite: bool,
    priming: bool,
  ) -> Self {
    MapListenerRequest {
      uid: uid.into(),
      request: Some(map_listener_request::Request::Subscribe(SubscribeRequest {
        filter_id,
        cache: cache.into(),
        filter: Vec::new(),
        keys,
        lite,
        priming,
      })),
    }
  }

  pub fn unsubscribe(uid: impl Into<String>, filter_id: i64, cache: impl Into<String>) -> Self {
    MapListenerRequest {
      uid: uid.into(),
      request: Some(map_listener_request::Request::Unsubscribe(
        UnsubscribeRequest {
          filter_id,
          cache: cache.into(),
          key: Vec::new(),
        },
      )),
    }
  }
}

impl MapListenerResponse {
  pub fn subscribed(uid: impl Into<String>, filter_id: i64, cache: impl Into<String>) -> Self {
    MapListenerResponse {
      response: Some(map_listener_response::Response::Subscribed(
        MapListenerSubscribed {
          uid: uid.into(),
          filter_id,
          cache: cache.into(),
        },
      )),
    }
  }

  pub fn unsubscribed(uid: impl Into<String>, filter_id: i64, cache: impl Into<String>) -> Self {
    MapListenerResponse {
      response: Some(map_listener_response::Response::Unsubscribed(
        MapListenerUnsubscribed {
          uid: uid.into(),
          filter_id,
          cache: cache.into(),
        },
      )),
    }
  }

  pub fn event(event: MapEventResponse) -> Self {
    MapListenerResponse {
      response: Some(map_listener_response::Response::Event(event)),
    }
  }

  pub fn error(uid: impl Into<String>, code: i32, message: impl Into<String>) -> Self {
    MapListenerResponse {
      response: Some(map_listener_response::Response::Error(MapListenerError {
        uid: uid.into(),
        code,
        message: message.into(),
      })),
    }
  }

  pub fn destroyed(cache: impl Into<String>) -> Self {
    MapListenerResponse {
      response: Some(map_listener_response::Response::Destroyed(CacheDestroyed {
        cache: cache.into(),
      })),
    }
  }

  pub fn truncated(cache: impl Into<String>) -> Self {
    MapListenerResponse {
      response: Some(map_listener_response::Response::Truncated(CacheTruncated {
        cache: cache.into(),
      })),
    }
  }
}

impl EventKind {
  pub fn is_delete(self) -> bool {
    self == EventKind::Deleted
  }
}

#[cfg(test)]
mod tests {
  use super::api::*;
  use super::*;

  #[test]
  fn optional_value_helpers() {
    let present = OptionalValue::of(vec![0xAA, 0xBB]);
    assert!(present.present);
    assert_eq!(present.value, vec![0xAA, 0xBB]);

    let absent = OptionalValue::absent();
    assert!(!absent.present);
    assert!(absent.value.is_empty());
  }

  #[test]
  fn listener_request_oneof_shapes() {
    let init = MapListenerRequest::init("u1", "", "json");
    assert!(matches!(
      init.request,
      Some(map_listener_request::Request::Init(_))
    ));

    let sub = MapListenerRequest::subscribe_filter("u2", 7, "people", Vec::new(), false, true);
    match sub.request {
      Some(map_listener_request::Request::Subscribe(s)) => {
        assert_eq!(s.filter_id, 7);
        assert_eq!(s.cache, "people");
        assert!(s.priming);
        assert!(s.keys.is_empty());
      }
      other => panic!("unexpected request: {:?}", other),
    }
  }

  #[test]
  fn event_kind_roundtrip() {
    assert_eq!(EventKind::try_from(1), Ok(EventKind::Inserted));
    assert_eq!(EventKind::try_from(3), Ok(EventKind::Deleted));
    assert!(EventKind::Deleted.is_delete());
    assert!(!EventKind::Updated.is_delete());
  }
}
