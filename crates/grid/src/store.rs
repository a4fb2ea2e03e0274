//! Partitioned in-memory cache store

use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::codec::Codec;
use crate::entry::CacheEntry;
use crate::error::CacheError;
use crate::events::{CacheChange, CacheEvent};
use crate::processor::{Applied, BinaryProcessor, ProcessorResult};
use crate::query::{Comparator, Extractor, Filter};

const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Counters exposed for observability and tests
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
  pub reads: u64,
  pub writes: u64,
  pub removes: u64,
  /// Number of bulk invocations issued against this cache
  pub bulk_invocations: u64,
}

/// A registered index
#[derive(Debug, Clone)]
pub struct IndexInfo {
  pub extractor: Extractor,
  pub sorted: bool,
  pub comparator: Option<Comparator>,
}

/// A named, partitioned cache of raw-byte keys and values.
///
/// Keys hash to a fixed partition; each partition is an ordered map so
/// paged iteration has a stable key order. Values are opaque bytes in the
/// cache's native format; the cache only decodes them to evaluate filters.
pub struct GridCache {
  name: String,
  partitions: Vec<RwLock<BTreeMap<Vec<u8>, CacheEntry>>>,
  codec: Arc<dyn Codec>,
  destroyed: AtomicBool,
  epoch: AtomicU64,
  reads: AtomicU64,
  writes: AtomicU64,
  removes: AtomicU64,
  bulk_invocations: AtomicU64,
  indexes: RwLock<HashMap<String, IndexInfo>>,
  change_tx: broadcast::Sender<CacheChange>,
}

impl GridCache {
  pub fn new(name: impl Into<String>, partition_count: usize, codec: Arc<dyn Codec>) -> Arc<Self> {
    let (change_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let partitions = (0..partition_count.max(1))
      .map(|_| RwLock::new(BTreeMap::new()))
      .collect();
    Arc::new(Self {
      name: name.into(),
      partitions,
      codec,
      destroyed: AtomicBool::new(false),
      epoch: AtomicU64::new(0),
      reads: AtomicU64::new(0),
      writes: AtomicU64::new(0),
      removes: AtomicU64::new(0),
      bulk_invocations: AtomicU64::new(0),
      indexes: RwLock::new(HashMap::new()),
      change_tx,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// The cache's native serialization format.
  pub fn format(&self) -> &'static str {
    self.codec.name()
  }

  pub fn codec(&self) -> &Arc<dyn Codec> {
    &self.codec
  }

  pub fn partition_count(&self) -> usize {
    self.partitions.len()
  }

  pub fn partition_of(&self, key: &[u8]) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % self.partitions.len() as u64) as usize
  }

  /// Bumped by truncate; stale paged cursors detect it and stop.
  pub fn epoch(&self) -> u64 {
    self.epoch.load(Ordering::Acquire)
  }

  pub fn is_destroyed(&self) -> bool {
    self.destroyed.load(Ordering::Acquire)
  }

  /// Observe every change to this cache, in backend order.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheChange> {
    self.change_tx.subscribe()
  }

  pub fn stats(&self) -> CacheStats {
    CacheStats {
      reads: self.reads.load(Ordering::Relaxed),
      writes: self.writes.load(Ordering::Relaxed),
      removes: self.removes.load(Ordering::Relaxed),
      bulk_invocations: self.bulk_invocations.load(Ordering::Relaxed),
    }
  }

  pub fn record_bulk_invocation(&self) {
    self.bulk_invocations.fetch_add(1, Ordering::Relaxed);
  }

  fn ensure_active(&self) -> Result<(), CacheError> {
    if self.is_destroyed() {
      Err(CacheError::Destroyed(self.name.clone()))
    } else {
      Ok(())
    }
  }

  fn emit(&self, change: CacheChange) {
    let _ = self.change_tx.send(change);
  }

  /// Apply a processor atomically to one key.
  ///
  /// The event is emitted while the partition lock is held so that event
  /// order matches mutation order for every key in the partition.
  pub fn invoke(&self, key: &[u8], processor: &BinaryProcessor) -> Result<ProcessorResult, CacheError> {
    self.ensure_active()?;
    let partition = &self.partitions[self.partition_of(key)];
    let mut map = partition.write();

    let mut slot = match map.remove(key) {
      Some(entry) if entry.is_expired() => None,
      other => other,
    };

    let Applied { result, change } = processor.apply(&mut slot);

    if let Some(entry) = slot {
      map.insert(key.to_vec(), entry);
    }

    if let Some(change) = &change {
      match (&change.old, &change.new) {
        (_, Some(_)) => self.writes.fetch_add(1, Ordering::Relaxed),
        (Some(_), None) => self.removes.fetch_add(1, Ordering::Relaxed),
        _ => 0,
      };
      if let Some(event) = CacheEvent::from_change(key, change) {
        self.emit(CacheChange::Entry(event));
      }
    } else {
      self.reads.fetch_add(1, Ordering::Relaxed);
    }

    Ok(result)
  }

  pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
    match self.invoke(key, &BinaryProcessor::Get)? {
      ProcessorResult::Value(v) => Ok(Some(v)),
      _ => Ok(None),
    }
  }

  pub fn insert(
    &self,
    key: &[u8],
    value: Vec<u8>,
    ttl: Option<Duration>,
  ) -> Result<Option<Vec<u8>>, CacheError> {
    let ttl_millis = ttl.map(|d| d.as_millis() as u64).unwrap_or(0);
    match self.invoke(
      key,
      &BinaryProcessor::Put {
        value,
        ttl_millis,
      },
    )? {
      ProcessorResult::Value(v) => Ok(Some(v)),
      _ => Ok(None),
    }
  }

  pub fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
    match self.invoke(key, &BinaryProcessor::Remove)? {
      ProcessorResult::Value(v) => Ok(Some(v)),
      _ => Ok(None),
    }
  }

  pub fn contains_key(&self, key: &[u8]) -> Result<bool, CacheError> {
    self.ensure_active()?;
    let map = self.partitions[self.partition_of(key)].read();
    Ok(map.get(key).map(|e| !e.is_expired()).unwrap_or(false))
  }

  pub fn len(&self) -> usize {
    self
      .partitions
      .iter()
      .map(|p| p.read().values().filter(|e| !e.is_expired()).count())
      .sum()
  }

  pub fn is_empty(&self) -> bool {
    self
      .partitions
      .iter()
      .all(|p| p.read().values().all(|e| e.is_expired()))
  }

  /// Visit every live entry. Holds one partition read lock at a time.
  pub fn for_each_entry<F>(&self, mut f: F) -> Result<(), CacheError>
  where
    F: FnMut(&[u8], &[u8]),
  {
    self.ensure_active()?;
    for partition in &self.partitions {
      let map = partition.read();
      for (key, entry) in map.iter() {
        if !entry.is_expired() {
          f(key, &entry.value);
        }
      }
    }
    Ok(())
  }

  /// Entries whose decoded value matches the filter.
  pub fn matching_entries(&self, filter: &Filter) -> Result<Vec<(Vec<u8>, Vec<u8>)>, CacheError> {
    self.ensure_active()?;
    let mut out = Vec::new();
    let mut codec_error = None;
    self.for_each_entry(|key, value| {
      if codec_error.is_some() {
        return;
      }
      if matches!(filter, Filter::Always) {
        out.push((key.to_vec(), value.to_vec()));
        return;
      }
      match self.codec.decode(value) {
        Ok(decoded) => {
          if filter.evaluate(&decoded) {
            out.push((key.to_vec(), value.to_vec()));
          }
        }
        Err(e) => codec_error = Some(e),
      }
    })?;
    match codec_error {
      Some(e) => Err(CacheError::Codec(e)),
      None => Ok(out),
    }
  }

  /// Sorted live keys of one partition, strictly after the resume point.
  pub fn partition_keys_after(&self, partition: usize, after: Option<&[u8]>) -> Vec<Vec<u8>> {
    let Some(map) = self.partitions.get(partition).map(|p| p.read()) else {
      return Vec::new();
    };
    map
      .iter()
      .filter(|(key, entry)| {
        !entry.is_expired() && after.map(|a| key.as_slice() > a).unwrap_or(true)
      })
      .map(|(k, _)| k.clone())
      .collect()
  }

  pub fn clear(&self) -> Result<(), CacheError> {
    self.ensure_active()?;
    for partition in &self.partitions {
      let mut map = partition.write();
      let drained: Vec<_> = std::mem::take(&mut *map).into_iter().collect();
      for (key, entry) in drained {
        if !entry.is_expired() {
          self.removes.fetch_add(1, Ordering::Relaxed);
          self.emit(CacheChange::Entry(CacheEvent {
            kind: crate::events::EventKind::Deleted,
            key,
            old: Some(entry.value),
            new: None,
            synthetic: false,
          }));
        }
      }
    }
    Ok(())
  }

  /// Remove every entry without per-entry events; subscribers get exactly
  /// one truncate notice and paged cursors go stale via the epoch.
  pub fn truncate(&self) -> Result<(), CacheError> {
    self.ensure_active()?;
    for partition in &self.partitions {
      partition.write().clear();
    }
    self.epoch.fetch_add(1, Ordering::AcqRel);
    self.emit(CacheChange::Truncated);
    Ok(())
  }

  /// Invalidate the cache process-wide. Subsequent operations through any
  /// handle fail; subscribers get exactly one destroy notice.
  pub fn destroy(&self) -> Result<(), CacheError> {
    if self.destroyed.swap(true, Ordering::AcqRel) {
      return Err(CacheError::Destroyed(self.name.clone()));
    }
    for partition in &self.partitions {
      partition.write().clear();
    }
    self.emit(CacheChange::Destroyed);
    Ok(())
  }

  /// Drop expired entries, emitting synthetic deletes.
  pub fn sweep_expired(&self) -> usize {
    if self.is_destroyed() {
      return 0;
    }
    let mut swept = 0;
    for partition in &self.partitions {
      let mut map = partition.write();
      let expired: Vec<Vec<u8>> = map
        .iter()
        .filter(|(_, e)| e.is_expired())
        .map(|(k, _)| k.clone())
        .collect();
      for key in expired {
        if let Some(entry) = map.remove(&key) {
          swept += 1;
          self.emit(CacheChange::Entry(CacheEvent::expired(key, entry.value)));
        }
      }
    }
    swept
  }

  pub fn add_index(&self, info: IndexInfo) {
    let key = index_key(&info.extractor);
    self.indexes.write().insert(key, info);
  }

  pub fn remove_index(&self, extractor: &Extractor) {
    self.indexes.write().remove(&index_key(extractor));
  }

  pub fn index_count(&self) -> usize {
    self.indexes.read().len()
  }
}

fn index_key(extractor: &Extractor) -> String {
  serde_json::to_string(extractor).unwrap_or_default()
}

/// Periodically sweep expired entries until the cache is destroyed.
pub async fn run_expiry_task(cache: Arc<GridCache>, interval_secs: u64) {
  let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
  loop {
    interval.tick().await;
    if cache.is_destroyed() {
      break;
    }
    let swept = cache.sweep_expired();
    if swept > 0 {
      tracing::debug!("swept {} expired entries from '{}'", swept, cache.name());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::MsgpackCodec;
  use crate::events::EventKind;

  fn new_cache() -> Arc<GridCache> {
    GridCache::new("test", 7, Arc::new(MsgpackCodec))
  }

  #[test]
  fn insert_get_remove_roundtrip() {
    let cache = new_cache();
    assert_eq!(cache.get(b"k").unwrap(), None);
    assert_eq!(cache.insert(b"k", vec![1, 2], None).unwrap(), None);
    assert_eq!(cache.get(b"k").unwrap(), Some(vec![1, 2]));
    assert_eq!(cache.insert(b"k", vec![3], None).unwrap(), Some(vec![1, 2]));
    assert_eq!(cache.remove(b"k").unwrap(), Some(vec![3]));
    assert_eq!(cache.get(b"k").unwrap(), None);
  }

  #[test]
  fn expired_entry_reads_as_absent() {
    let cache = new_cache();
    cache
      .insert(b"k", vec![1], Some(Duration::from_millis(1)))
      .unwrap();
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(cache.get(b"k").unwrap(), None);
    assert!(!cache.contains_key(b"k").unwrap());
    assert!(cache.is_empty());
  }

  #[test]
  fn partition_assignment_is_stable() {
    let cache = new_cache();
    let p1 = cache.partition_of(b"some-key");
    let p2 = cache.partition_of(b"some-key");
    assert_eq!(p1, p2);
    assert!(p1 < cache.partition_count());
  }

  #[test]
  fn truncate_bumps_epoch_and_notifies_once() {
    let cache = new_cache();
    let mut rx = cache.subscribe();
    cache.insert(b"a", vec![1], None).unwrap();
    let before = cache.epoch();
    cache.truncate().unwrap();
    assert_eq!(cache.epoch(), before + 1);
    assert_eq!(cache.len(), 0);

    // one insert event then exactly one truncate notice
    assert!(matches!(rx.try_recv().unwrap(), CacheChange::Entry(_)));
    assert!(matches!(rx.try_recv().unwrap(), CacheChange::Truncated));
    assert!(rx.try_recv().is_err());
  }

  #[test]
  fn destroy_poisons_every_operation() {
    let cache = new_cache();
    cache.insert(b"a", vec![1], None).unwrap();
    cache.destroy().unwrap();
    assert!(cache.is_destroyed());
    assert!(matches!(
      cache.get(b"a"),
      Err(CacheError::Destroyed(_))
    ));
    assert!(matches!(
      cache.insert(b"a", vec![2], None),
      Err(CacheError::Destroyed(_))
    ));
    assert!(matches!(cache.truncate(), Err(CacheError::Destroyed(_))));
    // destroying twice is an error, not a second notice
    assert!(matches!(cache.destroy(), Err(CacheError::Destroyed(_))));
  }

  #[test]
  fn events_preserve_per_key_order() {
    let cache = new_cache();
    let mut rx = cache.subscribe();
    cache.insert(b"k", vec![1], None).unwrap();
    cache.insert(b"k", vec![2], None).unwrap();
    cache.remove(b"k").unwrap();

    let kinds: Vec<EventKind> = (0..3)
      .map(|_| match rx.try_recv().unwrap() {
        CacheChange::Entry(e) => e.kind,
        other => panic!("unexpected change: {:?}", other),
      })
      .collect();
    assert_eq!(
      kinds,
      vec![EventKind::Inserted, EventKind::Updated, EventKind::Deleted]
    );
  }

  #[test]
  fn matching_entries_decodes_with_native_codec() {
    let cache = new_cache();
    let codec = cache.codec().clone();
    let v1 = codec.encode(&serde_json::json!({"n": 1})).unwrap();
    let v2 = codec.encode(&serde_json::json!({"n": 5})).unwrap();
    cache.insert(b"a", v1, None).unwrap();
    cache.insert(b"b", v2.clone(), None).unwrap();

    let filter = Filter::Greater {
      extractor: Extractor::Path("n".into()),
      value: serde_json::json!(2),
    };
    let matched = cache.matching_entries(&filter).unwrap();
    assert_eq!(matched, vec![(b"b".to_vec(), v2)]);
  }

  #[test]
  fn sweep_emits_synthetic_deletes() {
    let cache = new_cache();
    cache
      .insert(b"k", vec![1], Some(Duration::from_millis(1)))
      .unwrap();
    let mut rx = cache.subscribe();
    std::thread::sleep(Duration::from_millis(10));
    assert_eq!(cache.sweep_expired(), 1);
    match rx.try_recv().unwrap() {
      CacheChange::Entry(e) => {
        assert_eq!(e.kind, EventKind::Deleted);
        assert!(e.synthetic);
      }
      other => panic!("unexpected change: {:?}", other),
    }
  }

  #[test]
  fn index_registration() {
    let cache = new_cache();
    cache.add_index(IndexInfo {
      extractor: Extractor::Path("age".into()),
      sorted: true,
      comparator: None,
    });
    assert_eq!(cache.index_count(), 1);
    cache.remove_index(&Extractor::Path("age".into()));
    assert_eq!(cache.index_count(), 0);
  }
}
