//! Partitioned service and the asynchronous cache facade

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::codec::Codec;
use crate::error::CacheError;
use crate::processor::{BinaryProcessor, ProcessorResult};
use crate::query::{Aggregator, Comparator, Extractor, Filter};
use crate::store::{GridCache, IndexInfo};

/// A storage member of the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Member {
  pub id: u32,
}

/// Cluster-shape knowledge: which member owns which partition.
///
/// A partition with no assigned member is orphaned; its keys have no
/// owner until the grid recovers.
pub struct PartitionedService {
  members: Vec<Member>,
  assignments: Vec<Option<Member>>,
  local_storage: bool,
}

impl PartitionedService {
  /// Round-robin partition assignment across `member_count` members.
  pub fn new(member_count: u32, partition_count: usize) -> Arc<Self> {
    let members: Vec<Member> = (0..member_count.max(1)).map(|id| Member { id }).collect();
    let assignments = (0..partition_count.max(1))
      .map(|p| Some(members[p % members.len()]))
      .collect();
    Arc::new(Self {
      members,
      assignments,
      local_storage: true,
    })
  }

  /// Like `new`, but the listed partitions are left without an owner.
  pub fn with_orphans(member_count: u32, partition_count: usize, orphans: &[usize]) -> Arc<Self> {
    let members: Vec<Member> = (0..member_count.max(1)).map(|id| Member { id }).collect();
    let assignments = (0..partition_count.max(1))
      .map(|p| {
        if orphans.contains(&p) {
          None
        } else {
          Some(members[p % members.len()])
        }
      })
      .collect();
    Arc::new(Self {
      members,
      assignments,
      local_storage: true,
    })
  }

  pub fn members(&self) -> &[Member] {
    &self.members
  }

  pub fn partition_count(&self) -> usize {
    self.assignments.len()
  }

  /// Whether this process stores primary partitions itself. When true,
  /// near fronts are bypassed by the proxy.
  pub fn is_local_storage_enabled(&self) -> bool {
    self.local_storage
  }

  /// The member owning the partition a key hashes to, or `None` for an
  /// orphaned partition.
  pub fn owner_of(&self, cache: &GridCache, key: &[u8]) -> Option<Member> {
    let partition = cache.partition_of(key) % self.assignments.len();
    self.assignments[partition]
  }
}

/// Asynchronous facade over one cache, carrying the service that owns it.
///
/// Every operation the proxy consumes from the backend lives here; the
/// streaming forms deliver results through an `mpsc` sender so callers
/// never hold backend locks across their own processing.
#[derive(Clone)]
pub struct AsyncCache {
  cache: Arc<GridCache>,
  service: Arc<PartitionedService>,
}

impl AsyncCache {
  pub fn new(cache: Arc<GridCache>, service: Arc<PartitionedService>) -> Self {
    Self { cache, service }
  }

  pub fn cache(&self) -> &Arc<GridCache> {
    &self.cache
  }

  pub fn service(&self) -> &Arc<PartitionedService> {
    &self.service
  }

  fn codec(&self) -> &Arc<dyn Codec> {
    self.cache.codec()
  }

  pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
    self.cache.get(key)
  }

  pub async fn put(
    &self,
    key: &[u8],
    value: Vec<u8>,
    ttl: Option<Duration>,
  ) -> Result<Option<Vec<u8>>, CacheError> {
    self.cache.insert(key, value, ttl)
  }

  pub async fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
    self.cache.remove(key)
  }

  pub async fn contains_key(&self, key: &[u8]) -> Result<bool, CacheError> {
    self.cache.contains_key(key)
  }

  pub async fn invoke(
    &self,
    key: &[u8],
    processor: &BinaryProcessor,
  ) -> Result<ProcessorResult, CacheError> {
    self.cache.invoke(key, processor)
  }

  /// Apply a processor to each key, streaming non-absent results as
  /// (key, result-bytes) pairs. Counts as one bulk invocation.
  pub async fn invoke_all_keys(
    &self,
    keys: &[Vec<u8>],
    processor: &BinaryProcessor,
    results: Option<&mpsc::Sender<(Vec<u8>, Vec<u8>)>>,
  ) -> Result<(), CacheError> {
    self.cache.record_bulk_invocation();
    for key in keys {
      let result = self.cache.invoke(key, processor)?;
      if let Some(tx) = results {
        if let Some(bytes) = self.result_bytes(result)? {
          if tx.send((key.clone(), bytes)).await.is_err() {
            // receiver gone, caller cancelled
            return Ok(());
          }
        }
      }
    }
    Ok(())
  }

  /// Apply a processor to every entry matching the filter.
  pub async fn invoke_all_filter(
    &self,
    filter: &Filter,
    processor: &BinaryProcessor,
    results: Option<&mpsc::Sender<(Vec<u8>, Vec<u8>)>>,
  ) -> Result<(), CacheError> {
    let keys: Vec<Vec<u8>> = self
      .cache
      .matching_entries(filter)?
      .into_iter()
      .map(|(k, _)| k)
      .collect();
    self.invoke_all_keys(&keys, processor, results).await
  }

  /// Store every entry as one bulk invocation against this cache.
  pub async fn put_all(&self, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<(), CacheError> {
    self.cache.record_bulk_invocation();
    for (key, value) in entries {
      self.cache.invoke(
        &key,
        &BinaryProcessor::Put {
          value,
          ttl_millis: 0,
        },
      )?;
    }
    Ok(())
  }

  fn result_bytes(&self, result: ProcessorResult) -> Result<Option<Vec<u8>>, CacheError> {
    match result {
      ProcessorResult::Absent => Ok(None),
      ProcessorResult::Value(v) => Ok(Some(v)),
      ProcessorResult::Bool(b) => Ok(Some(self.codec().encode(&Value::Bool(b))?)),
    }
  }

  pub async fn aggregate_filter(
    &self,
    filter: &Filter,
    aggregator: &Aggregator,
  ) -> Result<Value, CacheError> {
    let entries = self.cache.matching_entries(filter)?;
    let mut values = Vec::with_capacity(entries.len());
    for (_, bytes) in &entries {
      values.push(self.codec().decode(bytes)?);
    }
    Ok(aggregator.aggregate(values.iter()))
  }

  pub async fn aggregate_keys(
    &self,
    keys: &[Vec<u8>],
    aggregator: &Aggregator,
  ) -> Result<Value, CacheError> {
    let mut values = Vec::new();
    for key in keys {
      if let Some(bytes) = self.cache.get(key)? {
        values.push(self.codec().decode(&bytes)?);
      }
    }
    Ok(aggregator.aggregate(values.iter()))
  }

  /// Stream matching keys in unspecified order.
  pub async fn key_set(
    &self,
    filter: &Filter,
    out: mpsc::Sender<Vec<u8>>,
  ) -> Result<(), CacheError> {
    for (key, _) in self.cache.matching_entries(filter)? {
      if out.send(key).await.is_err() {
        break;
      }
    }
    Ok(())
  }

  /// Stream matching entries in unspecified order.
  pub async fn entry_set(
    &self,
    filter: &Filter,
    out: mpsc::Sender<(Vec<u8>, Vec<u8>)>,
  ) -> Result<(), CacheError> {
    for entry in self.cache.matching_entries(filter)? {
      if out.send(entry).await.is_err() {
        break;
      }
    }
    Ok(())
  }

  /// Matching entries ordered by the comparator over decoded values.
  pub async fn entry_set_sorted(
    &self,
    filter: &Filter,
    comparator: &Comparator,
  ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, CacheError> {
    let entries = self.cache.matching_entries(filter)?;
    let mut decorated = Vec::with_capacity(entries.len());
    for (key, bytes) in entries {
      let decoded = self.codec().decode(&bytes)?;
      decorated.push((key, bytes, decoded));
    }
    decorated.sort_by(|a, b| comparator.compare(&a.2, &b.2));
    Ok(decorated.into_iter().map(|(k, v, _)| (k, v)).collect())
  }

  /// Stream matching values in unspecified order.
  pub async fn values(
    &self,
    filter: &Filter,
    out: mpsc::Sender<Vec<u8>>,
  ) -> Result<(), CacheError> {
    for (_, value) in self.cache.matching_entries(filter)? {
      if out.send(value).await.is_err() {
        break;
      }
    }
    Ok(())
  }

  /// Matching values ordered by the comparator.
  pub async fn values_sorted(
    &self,
    filter: &Filter,
    comparator: &Comparator,
  ) -> Result<Vec<Vec<u8>>, CacheError> {
    Ok(
      self
        .entry_set_sorted(filter, comparator)
        .await?
        .into_iter()
        .map(|(_, v)| v)
        .collect(),
    )
  }

  pub async fn size(&self) -> Result<usize, CacheError> {
    if self.cache.is_destroyed() {
      return Err(CacheError::Destroyed(self.cache.name().to_string()));
    }
    Ok(self.cache.len())
  }

  pub async fn is_empty(&self) -> Result<bool, CacheError> {
    if self.cache.is_destroyed() {
      return Err(CacheError::Destroyed(self.cache.name().to_string()));
    }
    Ok(self.cache.is_empty())
  }

  /// Whether the cache can serve requests.
  pub async fn is_ready(&self) -> Result<bool, CacheError> {
    Ok(!self.cache.is_destroyed())
  }

  pub async fn clear(&self) -> Result<(), CacheError> {
    self.cache.clear()
  }

  pub async fn truncate(&self) -> Result<(), CacheError> {
    self.cache.truncate()
  }

  pub async fn destroy(&self) -> Result<(), CacheError> {
    self.cache.destroy()
  }

  pub async fn add_index(
    &self,
    extractor: Extractor,
    sorted: bool,
    comparator: Option<Comparator>,
  ) -> Result<(), CacheError> {
    if self.cache.is_destroyed() {
      return Err(CacheError::Destroyed(self.cache.name().to_string()));
    }
    self.cache.add_index(IndexInfo {
      extractor,
      sorted,
      comparator,
    });
    Ok(())
  }

  pub async fn remove_index(&self, extractor: &Extractor) -> Result<(), CacheError> {
    if self.cache.is_destroyed() {
      return Err(CacheError::Destroyed(self.cache.name().to_string()));
    }
    self.cache.remove_index(extractor);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::MsgpackCodec;
  use serde_json::json;

  fn setup() -> AsyncCache {
    let cache = GridCache::new("svc", 13, Arc::new(MsgpackCodec));
    let service = PartitionedService::new(3, 13);
    AsyncCache::new(cache, service)
  }

  #[test]
  fn owner_assignment_covers_every_partition() {
    let service = PartitionedService::new(3, 13);
    let cache = GridCache::new("own", 13, Arc::new(MsgpackCodec));
    for key in [b"a".as_slice(), b"b", b"c", b"dd", b"eee"] {
      let owner = service.owner_of(&cache, key).unwrap();
      assert!(owner.id < 3);
    }
  }

  #[test]
  fn orphaned_partitions_have_no_owner() {
    let partitions = 4;
    let service = PartitionedService::with_orphans(2, partitions, &[0, 1, 2, 3]);
    let cache = GridCache::new("orphan", partitions, Arc::new(MsgpackCodec));
    assert_eq!(service.owner_of(&cache, b"anything"), None);
  }

  #[tokio::test]
  async fn invoke_all_streams_results_and_counts_once() {
    let async_cache = setup();
    let keys: Vec<Vec<u8>> = vec![b"a".to_vec(), b"b".to_vec()];
    for key in &keys {
      async_cache.put(key, vec![7], None).await.unwrap();
    }

    let (tx, mut rx) = mpsc::channel(8);
    async_cache
      .invoke_all_keys(&keys, &BinaryProcessor::Get, Some(&tx))
      .await
      .unwrap();
    drop(tx);

    let mut seen = Vec::new();
    while let Some((key, value)) = rx.recv().await {
      seen.push((key, value));
    }
    assert_eq!(seen.len(), 2);
    assert_eq!(async_cache.cache().stats().bulk_invocations, 1);
  }

  #[tokio::test]
  async fn aggregate_count_over_equality_filter() {
    let async_cache = setup();
    let codec = async_cache.cache().codec().clone();
    async_cache
      .put(b"a", codec.encode(&json!(5)).unwrap(), None)
      .await
      .unwrap();
    async_cache
      .put(b"b", codec.encode(&json!(9)).unwrap(), None)
      .await
      .unwrap();

    let filter = Filter::equal_identity(json!(5));
    let count = async_cache
      .aggregate_filter(&filter, &Aggregator::Count)
      .await
      .unwrap();
    assert_eq!(count, json!(1));
  }

  #[tokio::test]
  async fn entry_set_sorted_orders_by_comparator() {
    let async_cache = setup();
    let codec = async_cache.cache().codec().clone();
    for (key, n) in [(b"x", 3), (b"y", 1), (b"z", 2)] {
      async_cache
        .put(key, codec.encode(&json!({ "n": n })).unwrap(), None)
        .await
        .unwrap();
    }

    let sorted = async_cache
      .entry_set_sorted(
        &Filter::Always,
        &Comparator::By {
          extractor: Extractor::Path("n".into()),
          descending: false,
        },
      )
      .await
      .unwrap();
    let keys: Vec<&[u8]> = sorted.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![&b"y"[..], b"z", b"x"]);
  }
}
