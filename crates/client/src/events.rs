//! Client side of the multiplexed event stream
//!
//! One bidirectional stream per session carries every listener
//! registration. Outbound requests go through an unbounded queue pumped
//! into the stream; acknowledgments are correlated back to waiters by
//! uid, and inbound events are routed to registered listeners while
//! lifecycle notices (truncated, destroyed) go to the owning cache
//! handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::transport::Channel;
use uuid::Uuid;

use grid::{Codec, EventKind, Filter};
use proto::api::{map_listener_response, MapEventResponse, MapListenerRequest};
use proto::NamedCacheClient;

use crate::cache::RemoteCache;
use crate::error::ClientError;

/// A decoded cache event delivered to a listener
#[derive(Debug, Clone)]
pub struct RemoteEvent {
  pub cache: String,
  pub kind: EventKind,
  pub key: Value,
  pub old: Option<Value>,
  pub new: Option<Value>,
  pub synthetic: bool,
  pub priming: bool,
}

/// Receives entry events for one registration
pub trait MapListener: Send + Sync {
  fn on_event(&self, event: &RemoteEvent);
}

struct DispatcherState {
  listeners: Mutex<HashMap<i64, Arc<dyn MapListener>>>,
  acks: Mutex<HashMap<String, oneshot::Sender<()>>>,
  caches: Mutex<HashMap<String, Weak<RemoteCache>>>,
  next_id: AtomicI64,
}

/// The session's shared event stream
pub struct EventDispatcher {
  outbound: mpsc::UnboundedSender<MapListenerRequest>,
  state: Arc<DispatcherState>,
  codec: Arc<dyn Codec>,
  deadline: Duration,
}

impl EventDispatcher {
  /// Open the stream, send INIT, and wait for its acknowledgment.
  pub async fn start(
    channel: Channel,
    scope: &str,
    format: &str,
    codec: Arc<dyn Codec>,
    deadline: Duration,
  ) -> Result<Arc<Self>, ClientError> {
    let (outbound, rx) = mpsc::unbounded_channel();
    let mut client = NamedCacheClient::new(channel);
    let responses = client
      .events(UnboundedReceiverStream::new(rx))
      .await?
      .into_inner();

    let state = Arc::new(DispatcherState {
      listeners: Mutex::new(HashMap::new()),
      acks: Mutex::new(HashMap::new()),
      caches: Mutex::new(HashMap::new()),
      next_id: AtomicI64::new(1),
    });

    let dispatcher = Arc::new(Self {
      outbound,
      state: state.clone(),
      codec: codec.clone(),
      deadline,
    });

    let init_uid = Uuid::new_v4().to_string();
    let init_ack = dispatcher.expect_ack(&init_uid);
    dispatcher
      .outbound
      .send(MapListenerRequest::init(init_uid, scope, format))
      .map_err(|_| ClientError::ServiceStopped)?;

    tokio::spawn(read_loop(responses, state, codec));

    tokio::time::timeout(deadline, init_ack)
      .await
      .map_err(|_| ClientError::Timeout {
        name: "<events>".to_string(),
        waited: deadline,
      })?
      .map_err(|_| ClientError::ServiceStopped)?;
    Ok(dispatcher)
  }

  fn expect_ack(&self, uid: &str) -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    self.state.acks.lock().insert(uid.to_string(), tx);
    rx
  }

  async fn await_ack(&self, uid: String, rx: oneshot::Receiver<()>) -> Result<(), ClientError> {
    let result = tokio::time::timeout(self.deadline, rx).await;
    match result {
      Ok(Ok(())) => Ok(()),
      Ok(Err(_)) => Err(ClientError::ServiceStopped),
      Err(_) => {
        self.state.acks.lock().remove(&uid);
        Err(ClientError::Timeout {
          name: "<events>".to_string(),
          waited: self.deadline,
        })
      }
    }
  }

  /// Route lifecycle notices for this cache to its handle.
  pub fn register_cache(&self, cache: &Arc<RemoteCache>) {
    self
      .state
      .caches
      .lock()
      .insert(cache.name().to_string(), Arc::downgrade(cache));
  }

  pub fn unregister_cache(&self, name: &str) {
    self.state.caches.lock().remove(name);
  }

  /// Register a filtered listener; returns its filter id.
  pub async fn subscribe_filter(
    &self,
    cache: &str,
    filter: Option<&Filter>,
    lite: bool,
    priming: bool,
    listener: Arc<dyn MapListener>,
  ) -> Result<i64, ClientError> {
    let filter_bytes = match filter {
      None => Vec::new(),
      Some(f) => grid::codec::encode_from(self.codec.as_ref(), f).map_err(ClientError::codec)?,
    };
    let filter_id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
    self.state.listeners.lock().insert(filter_id, listener);

    let uid = Uuid::new_v4().to_string();
    let ack = self.expect_ack(&uid);
    let request =
      MapListenerRequest::subscribe_filter(uid.clone(), filter_id, cache, filter_bytes, lite, priming);
    if self.outbound.send(request).is_err() {
      self.state.listeners.lock().remove(&filter_id);
      return Err(ClientError::ServiceStopped);
    }
    match self.await_ack(uid, ack).await {
      Ok(()) => Ok(filter_id),
      Err(e) => {
        self.state.listeners.lock().remove(&filter_id);
        Err(e)
      }
    }
  }

  /// Register a key listener; returns its filter id.
  pub async fn subscribe_keys(
    &self,
    cache: &str,
    keys: &[Value],
    lite: bool,
    priming: bool,
    listener: Arc<dyn MapListener>,
  ) -> Result<i64, ClientError> {
    let mut encoded = Vec::with_capacity(keys.len());
    for key in keys {
      encoded.push(self.codec.encode(key).map_err(ClientError::codec)?);
    }
    let filter_id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
    self.state.listeners.lock().insert(filter_id, listener);

    let uid = Uuid::new_v4().to_string();
    let ack = self.expect_ack(&uid);
    let request =
      MapListenerRequest::subscribe_keys(uid.clone(), filter_id, cache, encoded, lite, priming);
    if self.outbound.send(request).is_err() {
      self.state.listeners.lock().remove(&filter_id);
      return Err(ClientError::ServiceStopped);
    }
    match self.await_ack(uid, ack).await {
      Ok(()) => Ok(filter_id),
      Err(e) => {
        self.state.listeners.lock().remove(&filter_id);
        Err(e)
      }
    }
  }

  /// Cancel a registration. Unsubscribing twice is a no-op.
  pub async fn unsubscribe(&self, cache: &str, filter_id: i64) -> Result<(), ClientError> {
    if self.state.listeners.lock().remove(&filter_id).is_none() {
      return Ok(());
    }
    let uid = Uuid::new_v4().to_string();
    let ack = self.expect_ack(&uid);
    let request = MapListenerRequest::unsubscribe(uid.clone(), filter_id, cache);
    if self.outbound.send(request).is_err() {
      return Err(ClientError::ServiceStopped);
    }
    self.await_ack(uid, ack).await
  }
}

async fn read_loop(
  mut responses: tonic::Streaming<proto::api::MapListenerResponse>,
  state: Arc<DispatcherState>,
  codec: Arc<dyn Codec>,
) {
  loop {
    let message = match responses.message().await {
      Ok(Some(message)) => message,
      Ok(None) => break,
      Err(status) => {
        tracing::debug!("event stream closed: {}", status);
        break;
      }
    };
    match message.response {
      Some(map_listener_response::Response::Subscribed(ack)) => {
        if let Some(waiter) = state.acks.lock().remove(&ack.uid) {
          let _ = waiter.send(());
        }
      }
      Some(map_listener_response::Response::Unsubscribed(ack)) => {
        if let Some(waiter) = state.acks.lock().remove(&ack.uid) {
          let _ = waiter.send(());
        }
      }
      Some(map_listener_response::Response::Event(event)) => {
        dispatch_event(&state, &codec, event);
      }
      Some(map_listener_response::Response::Truncated(notice)) => {
        if let Some(cache) = lookup(&state, &notice.cache) {
          cache.dispatch_truncated();
        }
      }
      Some(map_listener_response::Response::Destroyed(notice)) => {
        if let Some(cache) = lookup(&state, &notice.cache) {
          cache.on_remote_destroyed();
        }
        state.caches.lock().remove(&notice.cache);
      }
      Some(map_listener_response::Response::Error(err)) => {
        tracing::warn!("event stream error {}: {}", err.code, err.message);
      }
      None => {}
    }
  }

  // stream gone; wake every pending waiter with a closed channel
  state.acks.lock().clear();
}

fn lookup(state: &DispatcherState, cache: &str) -> Option<Arc<RemoteCache>> {
  state.caches.lock().get(cache).and_then(Weak::upgrade)
}

fn dispatch_event(state: &DispatcherState, codec: &Arc<dyn Codec>, event: MapEventResponse) {
  let kind = match proto::api::EventKind::try_from(event.kind) {
    Ok(proto::api::EventKind::Inserted) => EventKind::Inserted,
    Ok(proto::api::EventKind::Updated) => EventKind::Updated,
    Ok(proto::api::EventKind::Deleted) => EventKind::Deleted,
    _ => return,
  };
  let key = match codec.decode(&event.key) {
    Ok(key) => key,
    Err(e) => {
      tracing::warn!("undecodable event key: {}", e);
      return;
    }
  };
  let decode_opt = |bytes: &[u8]| {
    if bytes.is_empty() {
      None
    } else {
      codec.decode(bytes).ok()
    }
  };
  let remote = RemoteEvent {
    cache: event.cache,
    kind,
    key,
    old: decode_opt(&event.old_value),
    new: decode_opt(&event.new_value),
    synthetic: event.synthetic,
    priming: event.priming,
  };

  let listeners = state.listeners.lock();
  for filter_id in &event.filter_ids {
    if let Some(listener) = listeners.get(filter_id) {
      listener.on_event(&remote);
    }
  }
}
