//! The gRPC named-cache service
//!
//! One handler per operation, all with the same shape: validate required
//! payloads, build a request holder on the worker pool, bridge payload
//! bytes, invoke the backend's async API with opaque keys and values, and
//! convert the result for the response or the outbound stream. Nothing in
//! this module blocks a transport thread; every continuation runs on the
//! dedicated pool and client cancellation simply abandons the result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use grid::{Aggregator, BinaryProcessor, Filter, Member};
use proto::api::{
  AddIndexRequest, AggregateRequest, BoolValue, BytesValue, ClearRequest, ContainsEntryRequest,
  ContainsKeyRequest, ContainsValueRequest, DestroyRequest, Empty, Entry, EntryResult,
  EntrySetRequest, GetAllRequest, GetRequest, Int32Value, InvokeAllRequest, InvokeRequest,
  IsEmptyRequest, IsReadyRequest, KeySetRequest, MapListenerRequest, MapListenerResponse,
  OptionalValue, PageRequest, PutAllRequest, PutIfAbsentRequest, PutRequest, RemoveIndexRequest,
  RemoveMappingRequest, RemoveRequest, ReplaceMappingRequest, ReplaceRequest, SizeRequest,
  TruncateRequest, ValuesRequest,
};
use proto::NamedCache;

use crate::config::ProxyConfig;
use crate::cursor::{self, PageCookie};
use crate::error::ProxyError;
use crate::holder::{create_holder, require_bytes, RequestHolder};
use crate::listeners;
use crate::resolver::CacheResolver;
use crate::responses::{fail_stream, request_deadline, send_item, stream_channel, STREAM_BUFFER};
use crate::workers::WorkerPool;

/// The proxy service behind the generated `NamedCache` trait.
pub struct CacheProxy {
  resolver: Arc<CacheResolver>,
  workers: Arc<WorkerPool>,
  config: ProxyConfig,
}

impl CacheProxy {
  pub fn new(resolver: Arc<CacheResolver>, config: ProxyConfig) -> std::io::Result<Self> {
    let workers = Arc::new(WorkerPool::new(config.worker_threads)?);
    Ok(Self {
      resolver,
      workers,
      config,
    })
  }

  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }

  /// Run a unary handler body on the worker pool, honoring the client's
  /// deadline. The cache side-effect may still occur after expiry; only
  /// the wait stops.
  async fn unary<T, F>(&self, deadline: Option<Duration>, work: F) -> Result<Response<T>, Status>
  where
    F: Future<Output = Result<T, Status>> + Send + 'static,
    T: Send + 'static,
  {
    let outcome = match deadline {
      Some(limit) => match tokio::time::timeout(limit, self.workers.run(work)).await {
        Ok(result) => result,
        Err(_) => Err(Status::deadline_exceeded("request deadline elapsed")),
      },
      None => self.workers.run(work).await,
    };
    outcome.map(Response::new)
  }
}

type Stream<T> = ReceiverStream<Result<T, Status>>;

#[tonic::async_trait]
impl NamedCache for CacheProxy {
  // ----- point operations -----------------------------------------------

  async fn get(&self, request: Request<GetRequest>) -> Result<Response<OptionalValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let key = holder.convert_key_down(&req.key)?;
        // a get-processor, not a raw get, so present-but-null stays
        // distinguishable from absent
        let result = holder
          .async_cache()
          .invoke(&key, &BinaryProcessor::Get)
          .await
          .map_err(ProxyError::from)?;
        Ok(holder.to_optional_value(result)?)
      })
      .await
  }

  async fn put(&self, request: Request<PutRequest>) -> Result<Response<BytesValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let key = holder.convert_key_down(&req.key)?;
        let value = holder.convert_down(&req.value)?;
        let processor = BinaryProcessor::Put {
          value,
          ttl_millis: req.ttl.max(0) as u64,
        };
        let result = holder
          .async_cache()
          .invoke(&key, &processor)
          .await
          .map_err(ProxyError::from)?;
        Ok(holder.to_bytes_value(result)?)
      })
      .await
  }

  async fn put_if_absent(
    &self,
    request: Request<PutIfAbsentRequest>,
  ) -> Result<Response<BytesValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let key = holder.convert_key_down(&req.key)?;
        let value = holder.convert_down(&req.value)?;
        let processor = BinaryProcessor::PutIfAbsent {
          value,
          ttl_millis: req.ttl.max(0) as u64,
        };
        let result = holder
          .async_cache()
          .invoke(&key, &processor)
          .await
          .map_err(ProxyError::from)?;
        Ok(holder.to_bytes_value(result)?)
      })
      .await
  }

  async fn put_all(&self, request: Request<PutAllRequest>) -> Result<Response<Empty>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        if req.entries.is_empty() {
          return Ok(proto::EMPTY);
        }
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let mut converted = Vec::with_capacity(req.entries.len());
        for entry in &req.entries {
          converted.push((
            holder.convert_key_down(&entry.key)?,
            holder.convert_down(&entry.value)?,
          ));
        }

        // split by owning member so each shard travels to one member
        // instead of the whole map travelling to all of them; a `None`
        // owner collects entries of orphaned partitions
        let service = holder.async_cache().service().clone();
        let cache = holder.cache().clone();
        let mut shards: HashMap<Option<Member>, Vec<(Vec<u8>, Vec<u8>)>> = HashMap::new();
        for (key, value) in converted {
          let owner = service.owner_of(&cache, &key);
          shards.entry(owner).or_default().push((key, value));
        }

        let tasks: Vec<_> = shards
          .into_values()
          .map(|entries| {
            let async_cache = holder.async_cache().clone();
            tokio::spawn(async move { async_cache.put_all(entries).await })
          })
          .collect();
        for task in tasks {
          task
            .await
            .map_err(ProxyError::internal)?
            .map_err(ProxyError::from)?;
        }
        Ok(proto::EMPTY)
      })
      .await
  }

  async fn remove(&self, request: Request<RemoveRequest>) -> Result<Response<BytesValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let key = holder.convert_key_down(&req.key)?;
        let result = holder
          .async_cache()
          .invoke(&key, &BinaryProcessor::Remove)
          .await
          .map_err(ProxyError::from)?;
        Ok(holder.to_bytes_value(result)?)
      })
      .await
  }

  async fn remove_mapping(
    &self,
    request: Request<RemoveMappingRequest>,
  ) -> Result<Response<BoolValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let key = holder.convert_key_down(&req.key)?;
        let value = holder.convert_down(&req.value)?;
        let result = holder
          .async_cache()
          .invoke(&key, &BinaryProcessor::RemoveMapping { value })
          .await
          .map_err(ProxyError::from)?;
        Ok(holder.to_bool_value(result)?)
      })
      .await
  }

  async fn replace(
    &self,
    request: Request<ReplaceRequest>,
  ) -> Result<Response<BytesValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let key = holder.convert_key_down(&req.key)?;
        let value = holder.convert_down(&req.value)?;
        let result = holder
          .async_cache()
          .invoke(&key, &BinaryProcessor::Replace { value })
          .await
          .map_err(ProxyError::from)?;
        Ok(holder.to_bytes_value(result)?)
      })
      .await
  }

  async fn replace_mapping(
    &self,
    request: Request<ReplaceMappingRequest>,
  ) -> Result<Response<BoolValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let key = holder.convert_key_down(&req.key)?;
        let expect = holder.convert_down(&req.previous_value)?;
        let replacement = holder.convert_down(&req.new_value)?;
        let result = holder
          .async_cache()
          .invoke(
            &key,
            &BinaryProcessor::ReplaceMapping {
              expect,
              replacement,
            },
          )
          .await
          .map_err(ProxyError::from)?;
        Ok(holder.to_bool_value(result)?)
      })
      .await
  }

  // ----- predicates ------------------------------------------------------

  async fn contains_key(
    &self,
    request: Request<ContainsKeyRequest>,
  ) -> Result<Response<BoolValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let key = holder.convert_key_down(&req.key)?;
        let present = holder
          .async_cache()
          .contains_key(&key)
          .await
          .map_err(ProxyError::from)?;
        Ok(BoolValue::from(present))
      })
      .await
  }

  async fn contains_entry(
    &self,
    request: Request<ContainsEntryRequest>,
  ) -> Result<Response<BoolValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let key = holder.convert_key_down(&req.key)?;
        let value = holder.convert_down(&req.value)?;
        // a single-key processor keeps the check on the owning partition,
        // visible against concurrent mutation
        let result = holder
          .async_cache()
          .invoke(&key, &BinaryProcessor::ContainsValue { value })
          .await
          .map_err(ProxyError::from)?;
        Ok(holder.to_bool_value(result)?)
      })
      .await
  }

  async fn contains_value(
    &self,
    request: Request<ContainsValueRequest>,
  ) -> Result<Response<BoolValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let value = holder.decode_client_value(&req.value)?;
        let filter = Filter::equal_identity(value);
        let count = holder
          .async_cache()
          .aggregate_filter(&filter, &Aggregator::Count)
          .await
          .map_err(ProxyError::from)?;
        Ok(BoolValue::from(count.as_u64().unwrap_or(0) > 0))
      })
      .await
  }

  async fn is_empty(
    &self,
    request: Request<IsEmptyRequest>,
  ) -> Result<Response<BoolValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let resolved = resolver.resolve(&req.scope, &req.cache)?;
        let empty = resolved
          .async_cache
          .is_empty()
          .await
          .map_err(ProxyError::from)?;
        Ok(BoolValue::from(empty))
      })
      .await
  }

  async fn is_ready(
    &self,
    request: Request<IsReadyRequest>,
  ) -> Result<Response<BoolValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let resolved = resolver.resolve(&req.scope, &req.cache)?;
        let ready = resolved
          .async_cache
          .is_ready()
          .await
          .map_err(ProxyError::from)?;
        Ok(BoolValue::from(ready))
      })
      .await
  }

  async fn size(&self, request: Request<SizeRequest>) -> Result<Response<Int32Value>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let resolved = resolver.resolve(&req.scope, &req.cache)?;
        let size = resolved.async_cache.size().await.map_err(ProxyError::from)?;
        Ok(Int32Value::from(
          i32::try_from(size).unwrap_or(i32::MAX),
        ))
      })
      .await
  }

  // ----- lifecycle -------------------------------------------------------

  async fn clear(&self, request: Request<ClearRequest>) -> Result<Response<Empty>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let resolved = resolver.resolve(&req.scope, &req.cache)?;
        resolved.async_cache.clear().await.map_err(ProxyError::from)?;
        Ok(proto::EMPTY)
      })
      .await
  }

  async fn truncate(&self, request: Request<TruncateRequest>) -> Result<Response<Empty>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let resolved = resolver.resolve(&req.scope, &req.cache)?;
        resolved
          .async_cache
          .truncate()
          .await
          .map_err(ProxyError::from)?;
        Ok(proto::EMPTY)
      })
      .await
  }

  async fn destroy(&self, request: Request<DestroyRequest>) -> Result<Response<Empty>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let resolved = resolver.resolve(&req.scope, &req.cache)?;
        resolved
          .async_cache
          .destroy()
          .await
          .map_err(ProxyError::from)?;
        tracing::info!("cache '{}' destroyed", req.cache);
        Ok(proto::EMPTY)
      })
      .await
  }

  // ----- processors and aggregation --------------------------------------

  async fn invoke(&self, request: Request<InvokeRequest>) -> Result<Response<BytesValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        require_bytes(&req.processor, "entry processor")?;
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let key = holder.convert_key_down(&req.key)?;
        let processor = holder.processor_down(&req.processor)?;
        let result = holder
          .async_cache()
          .invoke(&key, &processor)
          .await
          .map_err(ProxyError::from)?;
        Ok(holder.to_bytes_value(result)?)
      })
      .await
  }

  async fn aggregate(
    &self,
    request: Request<AggregateRequest>,
  ) -> Result<Response<BytesValue>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        require_bytes(&req.aggregator, "entry aggregator")?;
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let aggregator: Aggregator = holder.decode_client(&req.aggregator)?;

        let result = if req.keys.is_empty() {
          let filter = holder.ensure_filter(&req.filter)?;
          holder
            .async_cache()
            .aggregate_filter(&filter, &aggregator)
            .await
            .map_err(ProxyError::from)?
        } else {
          let mut keys = Vec::with_capacity(req.keys.len());
          for key in &req.keys {
            keys.push(holder.convert_key_down(key)?);
          }
          holder
            .async_cache()
            .aggregate_keys(&keys, &aggregator)
            .await
            .map_err(ProxyError::from)?
        };

        Ok(BytesValue::from(holder.encode_client_value(&result)?))
      })
      .await
  }

  async fn add_index(&self, request: Request<AddIndexRequest>) -> Result<Response<Empty>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        // extractors are logical, so they decode with the client codec
        let extractor = holder.ensure_extractor(&req.extractor)?;
        let comparator = holder.optional_comparator(&req.comparator)?;
        holder
          .async_cache()
          .add_index(extractor, req.sorted, comparator)
          .await
          .map_err(ProxyError::from)?;
        Ok(proto::EMPTY)
      })
      .await
  }

  async fn remove_index(
    &self,
    request: Request<RemoveIndexRequest>,
  ) -> Result<Response<Empty>, Status> {
    let deadline = request_deadline(&request);
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    self
      .unary(deadline, async move {
        let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
        let extractor = holder.ensure_extractor(&req.extractor)?;
        holder
          .async_cache()
          .remove_index(&extractor)
          .await
          .map_err(ProxyError::from)?;
        Ok(proto::EMPTY)
      })
      .await
  }

  // ----- streaming queries ------------------------------------------------

  type GetAllStream = Stream<Entry>;

  async fn get_all(
    &self,
    request: Request<GetAllRequest>,
  ) -> Result<Response<Self::GetAllStream>, Status> {
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    let (tx, response) = stream_channel();

    if req.keys.is_empty() {
      // nothing requested; complete the stream immediately
      drop(tx);
      return Ok(response);
    }

    self.workers.spawn(async move {
      if let Err(err) = get_all_task(resolver, req, &tx).await {
        fail_stream(&tx, err).await;
      }
    });
    Ok(response)
  }

  type InvokeAllStream = Stream<Entry>;

  async fn invoke_all(
    &self,
    request: Request<InvokeAllRequest>,
  ) -> Result<Response<Self::InvokeAllStream>, Status> {
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    let (tx, response) = stream_channel();
    self.workers.spawn(async move {
      if let Err(err) = invoke_all_task(resolver, req, &tx).await {
        fail_stream(&tx, err).await;
      }
    });
    Ok(response)
  }

  type KeySetStream = Stream<BytesValue>;

  async fn key_set(
    &self,
    request: Request<KeySetRequest>,
  ) -> Result<Response<Self::KeySetStream>, Status> {
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    let (tx, response) = stream_channel();
    self.workers.spawn(async move {
      if let Err(err) = key_set_task(resolver, req, &tx).await {
        fail_stream(&tx, err).await;
      }
    });
    Ok(response)
  }

  type EntrySetStream = Stream<Entry>;

  async fn entry_set(
    &self,
    request: Request<EntrySetRequest>,
  ) -> Result<Response<Self::EntrySetStream>, Status> {
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    let (tx, response) = stream_channel();
    self.workers.spawn(async move {
      if let Err(err) = entry_set_task(resolver, req, &tx).await {
        fail_stream(&tx, err).await;
      }
    });
    Ok(response)
  }

  type ValuesStream = Stream<BytesValue>;

  async fn values(
    &self,
    request: Request<ValuesRequest>,
  ) -> Result<Response<Self::ValuesStream>, Status> {
    let resolver = self.resolver.clone();
    let req = request.into_inner();
    let (tx, response) = stream_channel();
    self.workers.spawn(async move {
      if let Err(err) = values_task(resolver, req, &tx).await {
        fail_stream(&tx, err).await;
      }
    });
    Ok(response)
  }

  // ----- paged queries ----------------------------------------------------

  type NextKeySetPageStream = Stream<BytesValue>;

  async fn next_key_set_page(
    &self,
    request: Request<PageRequest>,
  ) -> Result<Response<Self::NextKeySetPageStream>, Status> {
    let resolver = self.resolver.clone();
    let threshold = self.config.transfer_threshold;
    let req = request.into_inner();
    let (tx, response) = stream_channel();
    self.workers.spawn(async move {
      if let Err(err) = key_page_task(resolver, req, threshold, &tx).await {
        fail_stream(&tx, err).await;
      }
    });
    Ok(response)
  }

  type NextEntrySetPageStream = Stream<EntryResult>;

  async fn next_entry_set_page(
    &self,
    request: Request<PageRequest>,
  ) -> Result<Response<Self::NextEntrySetPageStream>, Status> {
    let resolver = self.resolver.clone();
    let threshold = self.config.transfer_threshold;
    let req = request.into_inner();
    let (tx, response) = stream_channel();
    self.workers.spawn(async move {
      if let Err(err) = entry_page_task(resolver, req, threshold, &tx).await {
        fail_stream(&tx, err).await;
      }
    });
    Ok(response)
  }

  // ----- events -----------------------------------------------------------

  type EventsStream = Stream<MapListenerResponse>;

  async fn events(
    &self,
    request: Request<Streaming<MapListenerRequest>>,
  ) -> Result<Response<Self::EventsStream>, Status> {
    let inbound = request.into_inner();
    Ok(Response::new(listeners::events_stream(
      inbound,
      self.resolver.clone(),
      &self.workers,
      self.config.event_buffer,
    )))
  }
}

// ----- streaming task bodies ----------------------------------------------

async fn get_all_task(
  resolver: Arc<CacheResolver>,
  req: GetAllRequest,
  tx: &mpsc::Sender<Result<Entry, Status>>,
) -> Result<(), ProxyError> {
  let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
  let mut keys = Vec::with_capacity(req.keys.len());
  for key in &req.keys {
    keys.push(holder.convert_key_down(key)?);
  }
  stream_bulk_results(&holder, keys, BinaryProcessor::Get, tx).await
}

async fn invoke_all_task(
  resolver: Arc<CacheResolver>,
  req: InvokeAllRequest,
  tx: &mpsc::Sender<Result<Entry, Status>>,
) -> Result<(), ProxyError> {
  require_bytes(&req.processor, "entry processor")?;
  let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
  let processor = holder.processor_down(&req.processor)?;

  if req.keys.is_empty() {
    let filter = holder.ensure_filter(&req.filter)?;
    let (etx, mut erx) = mpsc::channel(STREAM_BUFFER);
    let async_cache = holder.async_cache().clone();
    let backend = tokio::spawn(async move {
      async_cache
        .invoke_all_filter(&filter, &processor, Some(&etx))
        .await
    });
    while let Some((key, value)) = erx.recv().await {
      let entry = holder.entry_up(&key, &value)?;
      if !send_item(tx, entry).await {
        return Ok(());
      }
    }
    backend
      .await
      .map_err(ProxyError::internal)?
      .map_err(ProxyError::from)
  } else {
    let mut keys = Vec::with_capacity(req.keys.len());
    for key in &req.keys {
      keys.push(holder.convert_key_down(key)?);
    }
    stream_bulk_results(&holder, keys, processor, tx).await
  }
}

/// Issue a bulk invocation and pump its per-entry callback onto the
/// outbound stream, lifting every entry into the client's format.
async fn stream_bulk_results(
  holder: &RequestHolder,
  keys: Vec<Vec<u8>>,
  processor: BinaryProcessor,
  tx: &mpsc::Sender<Result<Entry, Status>>,
) -> Result<(), ProxyError> {
  let (etx, mut erx) = mpsc::channel(STREAM_BUFFER);
  let async_cache = holder.async_cache().clone();
  let backend = tokio::spawn(async move {
    async_cache
      .invoke_all_keys(&keys, &processor, Some(&etx))
      .await
  });
  while let Some((key, value)) = erx.recv().await {
    let entry = holder.entry_up(&key, &value)?;
    if !send_item(tx, entry).await {
      return Ok(());
    }
  }
  backend
    .await
    .map_err(ProxyError::internal)?
    .map_err(ProxyError::from)
}

async fn key_set_task(
  resolver: Arc<CacheResolver>,
  req: KeySetRequest,
  tx: &mpsc::Sender<Result<BytesValue, Status>>,
) -> Result<(), ProxyError> {
  let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
  let filter = holder.ensure_filter(&req.filter)?;

  let (ktx, mut krx) = mpsc::channel(STREAM_BUFFER);
  let async_cache = holder.async_cache().clone();
  let backend = tokio::spawn(async move { async_cache.key_set(&filter, ktx).await });
  while let Some(key) = krx.recv().await {
    let up = holder.convert_up(&key)?;
    if !send_item(tx, BytesValue::from(up)).await {
      return Ok(());
    }
  }
  backend
    .await
    .map_err(ProxyError::internal)?
    .map_err(ProxyError::from)
}

async fn entry_set_task(
  resolver: Arc<CacheResolver>,
  req: EntrySetRequest,
  tx: &mpsc::Sender<Result<Entry, Status>>,
) -> Result<(), ProxyError> {
  let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
  let filter = holder.ensure_filter(&req.filter)?;

  match holder.optional_comparator(&req.comparator)? {
    // with a comparator the result set is collected and sorted before
    // emission; without one entries stream as the backend produces them
    Some(comparator) => {
      let entries = holder
        .async_cache()
        .entry_set_sorted(&filter, &comparator)
        .await
        .map_err(ProxyError::from)?;
      for (key, value) in entries {
        let entry = holder.entry_up(&key, &value)?;
        if !send_item(tx, entry).await {
          return Ok(());
        }
      }
      Ok(())
    }
    None => {
      let (etx, mut erx) = mpsc::channel(STREAM_BUFFER);
      let async_cache = holder.async_cache().clone();
      let backend = tokio::spawn(async move { async_cache.entry_set(&filter, etx).await });
      while let Some((key, value)) = erx.recv().await {
        let entry = holder.entry_up(&key, &value)?;
        if !send_item(tx, entry).await {
          return Ok(());
        }
      }
      backend
        .await
        .map_err(ProxyError::internal)?
        .map_err(ProxyError::from)
    }
  }
}

async fn values_task(
  resolver: Arc<CacheResolver>,
  req: ValuesRequest,
  tx: &mpsc::Sender<Result<BytesValue, Status>>,
) -> Result<(), ProxyError> {
  let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
  let filter = holder.ensure_filter(&req.filter)?;

  match holder.optional_comparator(&req.comparator)? {
    Some(comparator) => {
      let values = holder
        .async_cache()
        .values_sorted(&filter, &comparator)
        .await
        .map_err(ProxyError::from)?;
      for value in values {
        let up = holder.convert_up(&value)?;
        if !send_item(tx, BytesValue::from(up)).await {
          return Ok(());
        }
      }
      Ok(())
    }
    None => {
      let (vtx, mut vrx) = mpsc::channel(STREAM_BUFFER);
      let async_cache = holder.async_cache().clone();
      let backend = tokio::spawn(async move { async_cache.values(&filter, vtx).await });
      while let Some(value) = vrx.recv().await {
        let up = holder.convert_up(&value)?;
        if !send_item(tx, BytesValue::from(up)).await {
          return Ok(());
        }
      }
      backend
        .await
        .map_err(ProxyError::internal)?
        .map_err(ProxyError::from)
    }
  }
}

/// The first element of a key page is the cookie for the next page; an
/// empty cookie ends the iteration.
async fn key_page_task(
  resolver: Arc<CacheResolver>,
  req: PageRequest,
  threshold: usize,
  tx: &mpsc::Sender<Result<BytesValue, Status>>,
) -> Result<(), ProxyError> {
  let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
  let cookie = PageCookie::decode(&req.cookie)?;
  let page = cursor::keys_page(holder.cache(), cookie, threshold)?;

  if !send_item(tx, BytesValue::from(page.cookie)).await {
    return Ok(());
  }
  for key in page.keys {
    let up = holder.convert_up(&key)?;
    if !send_item(tx, BytesValue::from(up)).await {
      return Ok(());
    }
  }
  Ok(())
}

/// Entry pages carry the next-page cookie on their first result.
async fn entry_page_task(
  resolver: Arc<CacheResolver>,
  req: PageRequest,
  threshold: usize,
  tx: &mpsc::Sender<Result<EntryResult, Status>>,
) -> Result<(), ProxyError> {
  let holder = create_holder(&resolver, &req.scope, &req.cache, &req.format)?;
  let cookie = PageCookie::decode(&req.cookie)?;
  let page = cursor::entries_page(holder.cache(), cookie, threshold)?;

  let mut next_cookie = Some(page.cookie);
  for (key, value) in page.entries {
    let key_up = holder.convert_up(&key)?;
    let value_up = holder.convert_up(&value)?;
    let result = match next_cookie.take() {
      Some(cookie) => EntryResult::with_cookie(key_up, value_up, cookie),
      None => EntryResult::new(key_up, value_up),
    };
    if !send_item(tx, result).await {
      return Ok(());
    }
  }
  // an empty page still reports the (empty) cookie so the client stops
  if let Some(cookie) = next_cookie {
    let _ = send_item(tx, EntryResult::with_cookie(Vec::new(), Vec::new(), cookie)).await;
  }
  Ok(())
}
