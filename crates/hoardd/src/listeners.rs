//! Event stream multiplexer
//!
//! One bidirectional stream carries any number of listener registrations.
//! The first message must be INIT, fixing the scope and payload format;
//! SUBSCRIBE and UNSUBSCRIBE then manage filter or key registrations per
//! cache. A single task owns the stream's registrations and fans backend
//! changes out to the client, so per-key event order from the backend is
//! preserved on the wire. The outbound window is bounded: a subscriber
//! that stops draining is closed with RESOURCE_EXHAUSTED rather than
//! silently losing events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tokio_stream::{StreamExt, StreamMap};
use tonic::{Status, Streaming};

use grid::{CacheChange, CacheEvent, Codec, EventKind, Filter, GridCache};
use proto::api::{
  map_listener_request, EventKind as WireEventKind, MapEventResponse, MapListenerRequest,
  MapListenerResponse, SubscribeRequest, UnsubscribeRequest,
};

use crate::resolver::CacheResolver;
use crate::workers::WorkerPool;

/// How long a final error send may wait on a congested stream
const ERROR_FLUSH: Duration = Duration::from_secs(5);

/// Open a multiplexed event stream over the given inbound request stream.
pub fn events_stream(
  inbound: Streaming<MapListenerRequest>,
  resolver: Arc<CacheResolver>,
  workers: &WorkerPool,
  buffer: usize,
) -> ReceiverStream<Result<MapListenerResponse, Status>> {
  let (out, rx) = mpsc::channel(buffer.max(1));
  let error_out = out.clone();
  workers.spawn(async move {
    if let Err(status) = run_stream(inbound, resolver, out).await {
      let _ = tokio::time::timeout(ERROR_FLUSH, error_out.send(Err(status))).await;
    }
  });
  ReceiverStream::new(rx)
}

enum Matcher {
  Filter(Filter),
  Keys(HashSet<Vec<u8>>),
}

struct Registration {
  cache: String,
  matcher: Matcher,
  lite: bool,
}

struct StreamState {
  scope: String,
  client: Option<Arc<dyn Codec>>,
  registrations: HashMap<i64, Registration>,
  caches: HashMap<String, Arc<GridCache>>,
}

impl StreamState {
  fn client(&self) -> Result<&Arc<dyn Codec>, Status> {
    self
      .client
      .as_ref()
      .ok_or_else(|| Status::invalid_argument("INIT must be the first message on an event stream"))
  }

  fn convert_up(&self, cache: &GridCache, bytes: &[u8]) -> Result<Vec<u8>, Status> {
    let client = self.client()?;
    if client.name() == cache.format() {
      return Ok(bytes.to_vec());
    }
    let value = cache
      .codec()
      .decode(bytes)
      .map_err(|e| Status::internal(e.to_string()))?;
    client
      .encode(&value)
      .map_err(|e| Status::internal(e.to_string()))
  }

  fn convert_down(&self, cache: &GridCache, bytes: &[u8]) -> Result<Vec<u8>, Status> {
    let client = self.client()?;
    if client.name() == cache.format() {
      return Ok(bytes.to_vec());
    }
    let value = client
      .decode(bytes)
      .map_err(|e| Status::invalid_argument(e.to_string()))?;
    cache
      .codec()
      .encode(&value)
      .map_err(|e| Status::internal(e.to_string()))
  }
}

fn deliver(
  out: &mpsc::Sender<Result<MapListenerResponse, Status>>,
  response: MapListenerResponse,
) -> Result<(), Status> {
  match out.try_send(Ok(response)) {
    Ok(()) => Ok(()),
    Err(mpsc::error::TrySendError::Full(_)) => {
      Err(Status::resource_exhausted("event buffer overflow"))
    }
    Err(mpsc::error::TrySendError::Closed(_)) => Err(Status::cancelled("event stream closed")),
  }
}

async fn run_stream(
  mut inbound: Streaming<MapListenerRequest>,
  resolver: Arc<CacheResolver>,
  out: mpsc::Sender<Result<MapListenerResponse, Status>>,
) -> Result<(), Status> {
  let mut events: StreamMap<String, BroadcastStream<CacheChange>> = StreamMap::new();
  let mut state = StreamState {
    scope: String::new(),
    client: None,
    registrations: HashMap::new(),
    caches: HashMap::new(),
  };

  loop {
    tokio::select! {
      msg = inbound.message() => {
        let Ok(msg) = msg else {
          // client reset the stream
          return Ok(());
        };
        let Some(request) = msg else {
          return Ok(());
        };
        handle_request(&mut state, &mut events, &resolver, &out, request)?;
      }
      Some((cache_name, item)) = events.next(), if !events.is_empty() => {
        match item {
          Ok(change) => {
            if !handle_change(&mut state, &cache_name, change, &out)? {
              return Ok(());
            }
          }
          Err(BroadcastStreamRecvError::Lagged(_)) => {
            return Err(Status::resource_exhausted("event buffer overflow"));
          }
        }
      }
    }
  }
}

fn handle_request(
  state: &mut StreamState,
  events: &mut StreamMap<String, BroadcastStream<CacheChange>>,
  resolver: &CacheResolver,
  out: &mpsc::Sender<Result<MapListenerResponse, Status>>,
  request: MapListenerRequest,
) -> Result<(), Status> {
  let uid = request.uid;
  match request.request {
    Some(map_listener_request::Request::Init(init)) => {
      let session = resolver.resolve_session(&init.scope)?;
      let codecs = session.codecs();
      let client = if init.format.is_empty() || init.format == codecs.cache_format() {
        codecs.cache_codec()
      } else {
        codecs.resolve(&init.format).ok_or_else(|| {
          Status::invalid_argument(format!("unknown serialization format '{}'", init.format))
        })?
      };
      state.scope = init.scope;
      state.client = Some(client);
      deliver(out, MapListenerResponse::subscribed(uid, -1, ""))
    }
    Some(map_listener_request::Request::Subscribe(subscribe)) => {
      handle_subscribe(state, events, resolver, out, uid, subscribe)
    }
    Some(map_listener_request::Request::Unsubscribe(unsubscribe)) => {
      handle_unsubscribe(state, events, out, uid, unsubscribe)
    }
    None => Err(Status::invalid_argument("empty listener request")),
  }
}

fn handle_subscribe(
  state: &mut StreamState,
  events: &mut StreamMap<String, BroadcastStream<CacheChange>>,
  resolver: &CacheResolver,
  out: &mpsc::Sender<Result<MapListenerResponse, Status>>,
  uid: String,
  subscribe: SubscribeRequest,
) -> Result<(), Status> {
  state.client()?;
  let scope = state.scope.clone();
  let resolved = resolver.resolve(&scope, &subscribe.cache)?;
  let cache = resolved.cache;

  let matcher = if subscribe.keys.is_empty() {
    let filter = if subscribe.filter.is_empty() {
      Filter::Always
    } else {
      let client = state.client()?;
      grid::codec::decode_as(client.as_ref(), &subscribe.filter)
        .map_err(|e| Status::invalid_argument(e.to_string()))?
    };
    Matcher::Filter(filter)
  } else {
    let mut keys = HashSet::new();
    for key in &subscribe.keys {
      keys.insert(state.convert_down(&cache, key)?);
    }
    Matcher::Keys(keys)
  };

  // one registration per (stream, filterId); re-subscribing reconfigures
  state.registrations.insert(
    subscribe.filter_id,
    Registration {
      cache: subscribe.cache.clone(),
      matcher,
      lite: subscribe.lite,
    },
  );

  if !state.caches.contains_key(&subscribe.cache) {
    events.insert(subscribe.cache.clone(), BroadcastStream::new(cache.subscribe()));
    state.caches.insert(subscribe.cache.clone(), cache.clone());
  }

  deliver(
    out,
    MapListenerResponse::subscribed(uid, subscribe.filter_id, subscribe.cache.clone()),
  )?;

  if subscribe.priming {
    prime_registration(state, out, subscribe.filter_id, &subscribe.cache, &cache)?;
  }
  Ok(())
}

/// Emit a synthetic insert for every entry the new registration currently
/// matches, so the subscriber observes present state as if it had always
/// been listening.
fn prime_registration(
  state: &StreamState,
  out: &mpsc::Sender<Result<MapListenerResponse, Status>>,
  filter_id: i64,
  cache_name: &str,
  cache: &GridCache,
) -> Result<(), Status> {
  let Some(registration) = state.registrations.get(&filter_id) else {
    return Ok(());
  };

  let entries: Vec<(Vec<u8>, Vec<u8>)> = match &registration.matcher {
    Matcher::Filter(filter) => cache
      .matching_entries(filter)
      .map_err(|e| Status::from(crate::error::ProxyError::from(e)))?,
    Matcher::Keys(keys) => {
      let mut found = Vec::new();
      for key in keys {
        if let Some(value) = cache
          .get(key)
          .map_err(|e| Status::from(crate::error::ProxyError::from(e)))?
        {
          found.push((key.clone(), value));
        }
      }
      found
    }
  };

  for (key, value) in entries {
    let event = CacheEvent::synthetic_insert(key, value);
    let response = build_event(state, cache_name, cache, &event, vec![filter_id], true)?;
    deliver(out, MapListenerResponse::event(response))?;
  }
  Ok(())
}

fn handle_unsubscribe(
  state: &mut StreamState,
  events: &mut StreamMap<String, BroadcastStream<CacheChange>>,
  out: &mpsc::Sender<Result<MapListenerResponse, Status>>,
  uid: String,
  unsubscribe: UnsubscribeRequest,
) -> Result<(), Status> {
  state.client()?;
  let removed = if unsubscribe.key.is_empty() {
    state.registrations.remove(&unsubscribe.filter_id).is_some()
  } else {
    // drop one key from a key registration; the registration goes away
    // with its last key
    let cache = state
      .registrations
      .get(&unsubscribe.filter_id)
      .and_then(|r| state.caches.get(&r.cache))
      .cloned();
    let native_key = match cache {
      Some(cache) => state.convert_down(&cache, &unsubscribe.key)?,
      None => unsubscribe.key.clone(),
    };
    let mut now_empty = false;
    if let Some(registration) = state.registrations.get_mut(&unsubscribe.filter_id) {
      if let Matcher::Keys(keys) = &mut registration.matcher {
        keys.remove(&native_key);
        now_empty = keys.is_empty();
      }
    }
    if now_empty {
      state.registrations.remove(&unsubscribe.filter_id);
    }
    now_empty
  };

  if removed {
    let cache_name = unsubscribe.cache.clone();
    let still_used = state
      .registrations
      .values()
      .any(|r| r.cache == cache_name);
    if !still_used {
      events.remove(&cache_name);
      state.caches.remove(&cache_name);
    }
    deliver(
      out,
      MapListenerResponse::unsubscribed(uid, unsubscribe.filter_id, cache_name),
    )?;
  }
  Ok(())
}

/// Returns false when the stream must close (cache destroyed).
fn handle_change(
  state: &mut StreamState,
  cache_name: &str,
  change: CacheChange,
  out: &mpsc::Sender<Result<MapListenerResponse, Status>>,
) -> Result<bool, Status> {
  match change {
    CacheChange::Truncated => {
      deliver(out, MapListenerResponse::truncated(cache_name))?;
      Ok(true)
    }
    CacheChange::Destroyed => {
      deliver(out, MapListenerResponse::destroyed(cache_name))?;
      state.registrations.retain(|_, r| r.cache != cache_name);
      Ok(false)
    }
    CacheChange::Entry(event) => {
      let Some(cache) = state.caches.get(cache_name).cloned() else {
        return Ok(true);
      };

      let mut matched = Vec::new();
      let mut all_lite = true;
      let mut decoded = None;
      for (id, registration) in &state.registrations {
        if registration.cache != cache_name {
          continue;
        }
        let hit = match &registration.matcher {
          Matcher::Keys(keys) => keys.contains(&event.key),
          Matcher::Filter(Filter::Always) => true,
          Matcher::Filter(filter) => {
            let subject = match event.kind {
              EventKind::Deleted => event.old.as_ref(),
              _ => event.new.as_ref(),
            };
            match subject {
              None => false,
              Some(bytes) => {
                if decoded.is_none() {
                  decoded = Some(
                    cache
                      .codec()
                      .decode(bytes)
                      .map_err(|e| Status::internal(e.to_string()))?,
                  );
                }
                filter.evaluate(decoded.as_ref().unwrap())
              }
            }
          }
        };
        if hit {
          matched.push(*id);
          all_lite &= registration.lite;
        }
      }

      if matched.is_empty() {
        return Ok(true);
      }
      matched.sort_unstable();

      let response = if all_lite {
        build_lite_event(state, cache_name, &cache, &event, matched)?
      } else {
        build_event(state, cache_name, &cache, &event, matched, false)?
      };
      deliver(out, MapListenerResponse::event(response))?;
      Ok(true)
    }
  }
}

fn wire_kind(kind: EventKind) -> i32 {
  let wire = match kind {
    EventKind::Inserted => WireEventKind::Inserted,
    EventKind::Updated => WireEventKind::Updated,
    EventKind::Deleted => WireEventKind::Deleted,
  };
  wire as i32
}

fn build_event(
  state: &StreamState,
  cache_name: &str,
  cache: &GridCache,
  event: &CacheEvent,
  filter_ids: Vec<i64>,
  priming: bool,
) -> Result<MapEventResponse, Status> {
  let old_value = match &event.old {
    Some(bytes) => state.convert_up(cache, bytes)?,
    None => Vec::new(),
  };
  let new_value = match &event.new {
    Some(bytes) => state.convert_up(cache, bytes)?,
    None => Vec::new(),
  };
  Ok(MapEventResponse {
    cache: cache_name.to_string(),
    kind: wire_kind(event.kind),
    key: state.convert_up(cache, &event.key)?,
    old_value,
    new_value,
    synthetic: event.synthetic || priming,
    priming,
    filter_ids,
  })
}

/// A lite event carries only the key.
fn build_lite_event(
  state: &StreamState,
  cache_name: &str,
  cache: &GridCache,
  event: &CacheEvent,
  filter_ids: Vec<i64>,
) -> Result<MapEventResponse, Status> {
  Ok(MapEventResponse {
    cache: cache_name.to_string(),
    kind: wire_kind(event.kind),
    key: state.convert_up(cache, &event.key)?,
    old_value: Vec::new(),
    new_value: Vec::new(),
    synthetic: event.synthetic,
    priming: false,
    filter_ids,
  })
}
