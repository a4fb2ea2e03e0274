//! Client session over one gRPC channel
//!
//! A session owns the channel, the shared event stream, and the store of
//! active cache handles. Ensuring a cache takes a per-name lock bounded
//! by the request deadline, so two tasks racing on the same name build
//! one handle while unrelated names proceed independently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tonic::transport::{Channel, Endpoint};

use grid::{Codec, CodecRegistry, Filter};

use crate::cache::RemoteCache;
use crate::error::ClientError;
use crate::events::{EventDispatcher, MapListener, RemoteEvent};

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionOptions {
  /// Scope applied to every request from this session
  pub scope: String,
  /// Serialization format of this session's payloads
  pub format: String,
  /// Bound on ensure-cache waits; also attached to calls as a deadline
  pub request_deadline: Duration,
}

impl Default for SessionOptions {
  fn default() -> Self {
    Self {
      scope: String::new(),
      format: "json".to_string(),
      request_deadline: Duration::from_secs(30),
    }
  }
}

struct NoopListener;

impl MapListener for NoopListener {
  fn on_event(&self, _event: &RemoteEvent) {}
}

pub struct Session {
  channel: Channel,
  options: SessionOptions,
  codec: Arc<dyn Codec>,
  dispatcher: Arc<EventDispatcher>,
  caches: Mutex<HashMap<String, Arc<RemoteCache>>>,
  name_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
  closed: Arc<AtomicBool>,
}

impl Session {
  /// Connect to a proxy endpoint and open the session's event stream.
  pub async fn connect(endpoint: &str, options: SessionOptions) -> Result<Session, ClientError> {
    let codec = CodecRegistry::with_defaults()
      .resolve(&options.format)
      .ok_or_else(|| {
        ClientError::Codec(format!("unknown serialization format '{}'", options.format))
      })?;

    let channel = Endpoint::from_shared(endpoint.to_string())
      .map_err(|e| ClientError::Connect(e.to_string()))?
      .connect()
      .await
      .map_err(|e| ClientError::Connect(e.to_string()))?;

    let dispatcher = EventDispatcher::start(
      channel.clone(),
      &options.scope,
      &options.format,
      codec.clone(),
      options.request_deadline,
    )
    .await?;

    Ok(Session {
      channel,
      options,
      codec,
      dispatcher,
      caches: Mutex::new(HashMap::new()),
      name_locks: Mutex::new(HashMap::new()),
      closed: Arc::new(AtomicBool::new(false)),
    })
  }

  fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
    self
      .name_locks
      .lock()
      .entry(name.to_string())
      .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
      .clone()
  }

  /// Return the active handle for a cache name, building one if needed.
  /// Construction is serialized per name; waiting longer than the request
  /// deadline fails with a timeout error.
  pub async fn ensure_cache(&self, name: &str) -> Result<Arc<RemoteCache>, ClientError> {
    if self.closed.load(Ordering::Acquire) {
      return Err(ClientError::ServiceStopped);
    }
    if let Some(existing) = self.lookup_active(name) {
      return Ok(existing);
    }

    let lock = self.name_lock(name);
    let deadline = self.options.request_deadline;
    let guard = tokio::time::timeout(deadline, lock.lock())
      .await
      .map_err(|_| ClientError::Timeout {
        name: name.to_string(),
        waited: deadline,
      })?;

    // another task may have built the handle while this one waited
    if let Some(existing) = self.lookup_active(name) {
      return Ok(existing);
    }

    let cache = RemoteCache::new(
      name.to_string(),
      self.options.scope.clone(),
      self.options.format.clone(),
      self.codec.clone(),
      deadline,
      self.channel.clone(),
      self.dispatcher.clone(),
      self.closed.clone(),
    );

    self.dispatcher.register_cache(&cache);
    // a never-matching filter keeps lifecycle notices for this cache
    // flowing without receiving entry events
    let lifecycle_id = self
      .dispatcher
      .subscribe_filter(
        name,
        Some(&Filter::Not(Box::new(Filter::Always))),
        true,
        false,
        Arc::new(NoopListener),
      )
      .await?;
    cache.set_lifecycle_id(lifecycle_id);

    self
      .caches
      .lock()
      .insert(name.to_string(), cache.clone());
    drop(guard);
    Ok(cache)
  }

  fn lookup_active(&self, name: &str) -> Option<Arc<RemoteCache>> {
    let mut caches = self.caches.lock();
    match caches.get(name) {
      Some(cache) if cache.is_active() => Some(cache.clone()),
      Some(_) => {
        caches.remove(name);
        None
      }
      None => None,
    }
  }

  /// Release a handle: it becomes inactive, leaves the store, and fires
  /// `released` to its lifecycle listeners. The remote cache keeps its
  /// contents.
  pub async fn release(&self, cache: &Arc<RemoteCache>) -> Result<(), ClientError> {
    self.caches.lock().remove(cache.name());
    self.dispatcher.unregister_cache(cache.name());
    let lifecycle_id = cache.lifecycle_id();
    if lifecycle_id != 0 {
      let _ = self.dispatcher.unsubscribe(cache.name(), lifecycle_id).await;
    }
    cache.dispatch_released();
    Ok(())
  }

  /// Destroy the remote cache and drop the handle.
  pub async fn destroy_cache(&self, cache: &Arc<RemoteCache>) -> Result<(), ClientError> {
    cache.destroy().await?;
    self.caches.lock().remove(cache.name());
    self.dispatcher.unregister_cache(cache.name());
    Ok(())
  }

  /// Close the session. Every handle becomes inactive; subsequent use
  /// fails with a service-stopped error.
  pub async fn close(&self) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    let handles: Vec<Arc<RemoteCache>> = self.caches.lock().drain().map(|(_, c)| c).collect();
    for cache in handles {
      self.dispatcher.unregister_cache(cache.name());
      cache.dispatch_released();
    }
    tracing::debug!("session closed");
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  pub fn cache_names(&self) -> Vec<String> {
    self.caches.lock().keys().cloned().collect()
  }
}
