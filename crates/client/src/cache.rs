//! Remote cache handle
//!
//! Implements the embedded cache contract by delegating every operation
//! to the proxy's wire schema. Keys and values are logical values encoded
//! with the session's codec; the proxy bridges them into the cache's
//! native format when the formats differ.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tonic::transport::Channel;
use tonic::Request;

use grid::{Aggregator, BinaryProcessor, Codec, Comparator, Extractor, Filter};
use proto::api::{
  AddIndexRequest, AggregateRequest, ClearRequest, ContainsEntryRequest, ContainsKeyRequest,
  ContainsValueRequest, DestroyRequest, Entry, EntrySetRequest, GetAllRequest, GetRequest,
  IsEmptyRequest, IsReadyRequest, KeySetRequest, PageRequest, PutAllRequest, PutIfAbsentRequest,
  PutRequest, RemoveIndexRequest, RemoveMappingRequest, RemoveRequest, ReplaceMappingRequest,
  ReplaceRequest, SizeRequest, TruncateRequest, ValuesRequest,
};
use proto::NamedCacheClient;

use crate::error::ClientError;
use crate::events::{EventDispatcher, MapListener};

/// Observes the lifecycle of one remote cache handle
pub trait CacheLifecycleListener: Send + Sync {
  fn on_released(&self, _cache: &str) {}
  fn on_truncated(&self, _cache: &str) {}
  fn on_destroyed(&self, _cache: &str) {}
}

pub struct RemoteCache {
  name: String,
  scope: String,
  format: String,
  codec: Arc<dyn Codec>,
  deadline: Duration,
  channel: Channel,
  dispatcher: Arc<EventDispatcher>,
  active: AtomicBool,
  session_closed: Arc<AtomicBool>,
  lifecycle_id: AtomicI64,
  listeners: Mutex<Vec<Arc<dyn CacheLifecycleListener>>>,
}

impl std::fmt::Debug for RemoteCache {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RemoteCache")
      .field("name", &self.name)
      .field("scope", &self.scope)
      .field("format", &self.format)
      .finish()
  }
}

impl RemoteCache {
  #[allow(clippy::too_many_arguments)]
  pub(crate) fn new(
    name: String,
    scope: String,
    format: String,
    codec: Arc<dyn Codec>,
    deadline: Duration,
    channel: Channel,
    dispatcher: Arc<EventDispatcher>,
    session_closed: Arc<AtomicBool>,
  ) -> Arc<Self> {
    Arc::new(Self {
      name,
      scope,
      format,
      codec,
      deadline,
      channel,
      dispatcher,
      active: AtomicBool::new(true),
      session_closed,
      lifecycle_id: AtomicI64::new(0),
      listeners: Mutex::new(Vec::new()),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn is_active(&self) -> bool {
    self.active.load(Ordering::Acquire)
  }

  pub fn add_lifecycle_listener(&self, listener: Arc<dyn CacheLifecycleListener>) {
    self.listeners.lock().push(listener);
  }

  pub(crate) fn set_lifecycle_id(&self, id: i64) {
    self.lifecycle_id.store(id, Ordering::Release);
  }

  pub(crate) fn lifecycle_id(&self) -> i64 {
    self.lifecycle_id.load(Ordering::Acquire)
  }

  pub(crate) fn dispatch_released(&self) {
    self.active.store(false, Ordering::Release);
    for listener in self.listeners.lock().iter() {
      listener.on_released(&self.name);
    }
  }

  pub(crate) fn dispatch_truncated(&self) {
    for listener in self.listeners.lock().iter() {
      listener.on_truncated(&self.name);
    }
  }

  /// Called when a destroy notice for this cache arrives on the session's
  /// event stream, whichever client initiated it.
  pub(crate) fn on_remote_destroyed(&self) {
    if self.active.swap(false, Ordering::AcqRel) {
      for listener in self.listeners.lock().iter() {
        listener.on_destroyed(&self.name);
      }
    }
  }

  // ----- plumbing ---------------------------------------------------------

  fn client(&self) -> NamedCacheClient<Channel> {
    NamedCacheClient::new(self.channel.clone())
  }

  fn request<T>(&self, message: T) -> Request<T> {
    let mut request = Request::new(message);
    request.set_timeout(self.deadline);
    request
  }

  fn ensure_active(&self) -> Result<(), ClientError> {
    if self.session_closed.load(Ordering::Acquire) {
      return Err(ClientError::ServiceStopped);
    }
    if !self.is_active() {
      return Err(ClientError::Inactive(self.name.clone()));
    }
    Ok(())
  }

  fn enc(&self, value: &Value) -> Result<Vec<u8>, ClientError> {
    self.codec.encode(value).map_err(ClientError::codec)
  }

  fn dec(&self, bytes: &[u8]) -> Result<Value, ClientError> {
    self.codec.decode(bytes).map_err(ClientError::codec)
  }

  fn dec_opt(&self, bytes: &[u8]) -> Result<Option<Value>, ClientError> {
    if bytes.is_empty() {
      Ok(None)
    } else {
      self.dec(bytes).map(Some)
    }
  }

  fn enc_payload<T: serde::Serialize>(&self, payload: &T) -> Result<Vec<u8>, ClientError> {
    grid::codec::encode_from(self.codec.as_ref(), payload).map_err(ClientError::codec)
  }

  // ----- point operations -------------------------------------------------

  pub async fn get(&self, key: &Value) -> Result<Option<Value>, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .get(self.request(GetRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        key: self.enc(key)?,
      }))
      .await?
      .into_inner();
    if response.present {
      Ok(Some(self.dec(&response.value)?))
    } else {
      Ok(None)
    }
  }

  pub async fn put(&self, key: &Value, value: &Value) -> Result<Option<Value>, ClientError> {
    self.put_with_ttl(key, value, None).await
  }

  pub async fn put_with_ttl(
    &self,
    key: &Value,
    value: &Value,
    ttl: Option<Duration>,
  ) -> Result<Option<Value>, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .put(self.request(PutRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        key: self.enc(key)?,
        value: self.enc(value)?,
        ttl: ttl.map(|d| d.as_millis() as i64).unwrap_or(0),
      }))
      .await?
      .into_inner();
    self.dec_opt(&response.value)
  }

  pub async fn put_if_absent(
    &self,
    key: &Value,
    value: &Value,
  ) -> Result<Option<Value>, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .put_if_absent(self.request(PutIfAbsentRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        key: self.enc(key)?,
        value: self.enc(value)?,
        ttl: 0,
      }))
      .await?
      .into_inner();
    self.dec_opt(&response.value)
  }

  pub async fn put_all(&self, entries: &[(Value, Value)]) -> Result<(), ClientError> {
    self.ensure_active()?;
    let mut wire = Vec::with_capacity(entries.len());
    for (key, value) in entries {
      wire.push(Entry::new(self.enc(key)?, self.enc(value)?));
    }
    self
      .client()
      .put_all(self.request(PutAllRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        entries: wire,
      }))
      .await?;
    Ok(())
  }

  pub async fn get_all(&self, keys: &[Value]) -> Result<Vec<(Value, Value)>, ClientError> {
    self.ensure_active()?;
    let mut wire = Vec::with_capacity(keys.len());
    for key in keys {
      wire.push(self.enc(key)?);
    }
    let mut stream = self
      .client()
      .get_all(self.request(GetAllRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        keys: wire,
      }))
      .await?
      .into_inner();
    let mut entries = Vec::new();
    while let Some(entry) = stream.message().await? {
      entries.push((self.dec(&entry.key)?, self.dec(&entry.value)?));
    }
    Ok(entries)
  }

  pub async fn remove(&self, key: &Value) -> Result<Option<Value>, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .remove(self.request(RemoveRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        key: self.enc(key)?,
      }))
      .await?
      .into_inner();
    self.dec_opt(&response.value)
  }

  pub async fn remove_mapping(&self, key: &Value, value: &Value) -> Result<bool, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .remove_mapping(self.request(RemoveMappingRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        key: self.enc(key)?,
        value: self.enc(value)?,
      }))
      .await?
      .into_inner();
    Ok(response.value)
  }

  pub async fn replace(&self, key: &Value, value: &Value) -> Result<Option<Value>, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .replace(self.request(ReplaceRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        key: self.enc(key)?,
        value: self.enc(value)?,
      }))
      .await?
      .into_inner();
    self.dec_opt(&response.value)
  }

  pub async fn replace_mapping(
    &self,
    key: &Value,
    expect: &Value,
    replacement: &Value,
  ) -> Result<bool, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .replace_mapping(self.request(ReplaceMappingRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        key: self.enc(key)?,
        previous_value: self.enc(expect)?,
        new_value: self.enc(replacement)?,
      }))
      .await?
      .into_inner();
    Ok(response.value)
  }

  // ----- predicates -------------------------------------------------------

  pub async fn contains_key(&self, key: &Value) -> Result<bool, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .contains_key(self.request(ContainsKeyRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        key: self.enc(key)?,
      }))
      .await?
      .into_inner();
    Ok(response.value)
  }

  pub async fn contains_entry(&self, key: &Value, value: &Value) -> Result<bool, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .contains_entry(self.request(ContainsEntryRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        key: self.enc(key)?,
        value: self.enc(value)?,
      }))
      .await?
      .into_inner();
    Ok(response.value)
  }

  pub async fn contains_value(&self, value: &Value) -> Result<bool, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .contains_value(self.request(ContainsValueRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        value: self.enc(value)?,
      }))
      .await?
      .into_inner();
    Ok(response.value)
  }

  pub async fn size(&self) -> Result<usize, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .size(self.request(SizeRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
      }))
      .await?
      .into_inner();
    Ok(response.value.max(0) as usize)
  }

  pub async fn is_empty(&self) -> Result<bool, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .is_empty(self.request(IsEmptyRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
      }))
      .await?
      .into_inner();
    Ok(response.value)
  }

  pub async fn is_ready(&self) -> Result<bool, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .is_ready(self.request(IsReadyRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
      }))
      .await?
      .into_inner();
    Ok(response.value)
  }

  // ----- processors and aggregation ---------------------------------------

  pub async fn invoke(
    &self,
    key: &Value,
    processor: &BinaryProcessor,
  ) -> Result<Option<Value>, ClientError> {
    self.ensure_active()?;
    let response = self
      .client()
      .invoke(self.request(proto::api::InvokeRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        key: self.enc(key)?,
        processor: self.enc_payload(processor)?,
      }))
      .await?
      .into_inner();
    self.dec_opt(&response.value)
  }

  pub async fn invoke_all(
    &self,
    filter: Option<&Filter>,
    processor: &BinaryProcessor,
  ) -> Result<Vec<(Value, Value)>, ClientError> {
    self.ensure_active()?;
    let filter_bytes = match filter {
      None => Vec::new(),
      Some(f) => self.enc_payload(f)?,
    };
    let mut stream = self
      .client()
      .invoke_all(self.request(proto::api::InvokeAllRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        keys: Vec::new(),
        filter: filter_bytes,
        processor: self.enc_payload(processor)?,
      }))
      .await?
      .into_inner();
    let mut entries = Vec::new();
    while let Some(entry) = stream.message().await? {
      entries.push((self.dec(&entry.key)?, self.dec(&entry.value)?));
    }
    Ok(entries)
  }

  pub async fn aggregate(
    &self,
    filter: Option<&Filter>,
    aggregator: &Aggregator,
  ) -> Result<Value, ClientError> {
    self.ensure_active()?;
    let filter_bytes = match filter {
      None => Vec::new(),
      Some(f) => self.enc_payload(f)?,
    };
    let response = self
      .client()
      .aggregate(self.request(AggregateRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        keys: Vec::new(),
        filter: filter_bytes,
        aggregator: self.enc_payload(aggregator)?,
      }))
      .await?
      .into_inner();
    self.dec(&response.value)
  }

  // ----- queries ----------------------------------------------------------

  pub async fn key_set(&self, filter: Option<&Filter>) -> Result<Vec<Value>, ClientError> {
    self.ensure_active()?;
    let filter_bytes = match filter {
      None => Vec::new(),
      Some(f) => self.enc_payload(f)?,
    };
    let mut stream = self
      .client()
      .key_set(self.request(KeySetRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        filter: filter_bytes,
      }))
      .await?
      .into_inner();
    let mut keys = Vec::new();
    while let Some(key) = stream.message().await? {
      keys.push(self.dec(&key.value)?);
    }
    Ok(keys)
  }

  pub async fn entry_set(
    &self,
    filter: Option<&Filter>,
    comparator: Option<&Comparator>,
  ) -> Result<Vec<(Value, Value)>, ClientError> {
    self.ensure_active()?;
    let filter_bytes = match filter {
      None => Vec::new(),
      Some(f) => self.enc_payload(f)?,
    };
    let comparator_bytes = match comparator {
      None => Vec::new(),
      Some(c) => self.enc_payload(c)?,
    };
    let mut stream = self
      .client()
      .entry_set(self.request(EntrySetRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        filter: filter_bytes,
        comparator: comparator_bytes,
      }))
      .await?
      .into_inner();
    let mut entries = Vec::new();
    while let Some(entry) = stream.message().await? {
      entries.push((self.dec(&entry.key)?, self.dec(&entry.value)?));
    }
    Ok(entries)
  }

  pub async fn values(
    &self,
    filter: Option<&Filter>,
    comparator: Option<&Comparator>,
  ) -> Result<Vec<Value>, ClientError> {
    self.ensure_active()?;
    let filter_bytes = match filter {
      None => Vec::new(),
      Some(f) => self.enc_payload(f)?,
    };
    let comparator_bytes = match comparator {
      None => Vec::new(),
      Some(c) => self.enc_payload(c)?,
    };
    let mut stream = self
      .client()
      .values(self.request(ValuesRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        filter: filter_bytes,
        comparator: comparator_bytes,
      }))
      .await?
      .into_inner();
    let mut values = Vec::new();
    while let Some(value) = stream.message().await? {
      values.push(self.dec(&value.value)?);
    }
    Ok(values)
  }

  /// Drain a paged key iteration. Each page opens with the cookie for the
  /// next one; an empty cookie ends the iteration.
  pub async fn paged_keys(&self) -> Result<Vec<Value>, ClientError> {
    self.ensure_active()?;
    let mut keys = Vec::new();
    let mut cookie = Vec::new();
    loop {
      let mut stream = self
        .client()
        .next_key_set_page(self.request(PageRequest {
          scope: self.scope.clone(),
          cache: self.name.clone(),
          format: self.format.clone(),
          cookie: cookie.clone(),
        }))
        .await?
        .into_inner();

      let Some(first) = stream.message().await? else {
        return Ok(keys);
      };
      cookie = first.value;
      while let Some(key) = stream.message().await? {
        keys.push(self.dec(&key.value)?);
      }
      if cookie.is_empty() {
        return Ok(keys);
      }
    }
  }

  /// Drain a paged entry iteration.
  pub async fn paged_entries(&self) -> Result<Vec<(Value, Value)>, ClientError> {
    self.ensure_active()?;
    let mut entries = Vec::new();
    let mut cookie = Vec::new();
    loop {
      let mut stream = self
        .client()
        .next_entry_set_page(self.request(PageRequest {
          scope: self.scope.clone(),
          cache: self.name.clone(),
          format: self.format.clone(),
          cookie: cookie.clone(),
        }))
        .await?
        .into_inner();

      let mut next_cookie = Vec::new();
      let mut first = true;
      while let Some(result) = stream.message().await? {
        if first {
          next_cookie = result.cookie.clone();
          first = false;
        }
        if result.key.is_empty() {
          // terminal marker of an empty page
          continue;
        }
        entries.push((self.dec(&result.key)?, self.dec(&result.value)?));
      }
      if next_cookie.is_empty() {
        return Ok(entries);
      }
      cookie = next_cookie;
    }
  }

  // ----- indexes ----------------------------------------------------------

  pub async fn add_index(
    &self,
    extractor: &Extractor,
    sorted: bool,
    comparator: Option<&Comparator>,
  ) -> Result<(), ClientError> {
    self.ensure_active()?;
    let comparator_bytes = match comparator {
      None => Vec::new(),
      Some(c) => self.enc_payload(c)?,
    };
    self
      .client()
      .add_index(self.request(AddIndexRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        extractor: self.enc_payload(extractor)?,
        sorted,
        comparator: comparator_bytes,
      }))
      .await?;
    Ok(())
  }

  pub async fn remove_index(&self, extractor: &Extractor) -> Result<(), ClientError> {
    self.ensure_active()?;
    self
      .client()
      .remove_index(self.request(RemoveIndexRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
        format: self.format.clone(),
        extractor: self.enc_payload(extractor)?,
      }))
      .await?;
    Ok(())
  }

  // ----- lifecycle --------------------------------------------------------

  pub async fn clear(&self) -> Result<(), ClientError> {
    self.ensure_active()?;
    self
      .client()
      .clear(self.request(ClearRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
      }))
      .await?;
    Ok(())
  }

  pub async fn truncate(&self) -> Result<(), ClientError> {
    self.ensure_active()?;
    self
      .client()
      .truncate(self.request(TruncateRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
      }))
      .await?;
    Ok(())
  }

  /// Destroy the cache on the grid. Every client's next operation fails
  /// FAILED_PRECONDITION and every subscribed event stream receives one
  /// DESTROYED notice.
  pub async fn destroy(&self) -> Result<(), ClientError> {
    self.ensure_active()?;
    self
      .client()
      .destroy(self.request(DestroyRequest {
        scope: self.scope.clone(),
        cache: self.name.clone(),
      }))
      .await?;
    self.on_remote_destroyed();
    Ok(())
  }

  // ----- entry listeners --------------------------------------------------

  pub async fn add_listener(
    &self,
    filter: Option<&Filter>,
    lite: bool,
    priming: bool,
    listener: Arc<dyn MapListener>,
  ) -> Result<i64, ClientError> {
    self.ensure_active()?;
    self
      .dispatcher
      .subscribe_filter(&self.name, filter, lite, priming, listener)
      .await
  }

  pub async fn add_key_listener(
    &self,
    keys: &[Value],
    lite: bool,
    priming: bool,
    listener: Arc<dyn MapListener>,
  ) -> Result<i64, ClientError> {
    self.ensure_active()?;
    self
      .dispatcher
      .subscribe_keys(&self.name, keys, lite, priming, listener)
      .await
  }

  pub async fn remove_listener(&self, filter_id: i64) -> Result<(), ClientError> {
    self.dispatcher.unsubscribe(&self.name, filter_id).await
  }
}
