//! Byte-level cache views
//!
//! `ByteCache` is the point-operation surface shared by the partitioned
//! store and the near tier that can front it for embedded callers. The
//! proxy never talks to the near tier: when the partitioned service has
//! local storage the front is bypassed and operations go straight to the
//! back cache (leaving it in place would double listener delivery).

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CacheError;
use crate::store::GridCache;

/// Point operations over raw-byte keys and values
#[async_trait]
pub trait ByteCache: Send + Sync {
  async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError>;
  async fn put(
    &self,
    key: Vec<u8>,
    value: Vec<u8>,
    ttl: Option<Duration>,
  ) -> Result<Option<Vec<u8>>, CacheError>;
  async fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError>;
  async fn contains_key(&self, key: &[u8]) -> Result<bool, CacheError>;
  async fn len(&self) -> Result<usize, CacheError>;
}

#[async_trait]
impl ByteCache for GridCache {
  async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
    GridCache::get(self, key)
  }

  async fn put(
    &self,
    key: Vec<u8>,
    value: Vec<u8>,
    ttl: Option<Duration>,
  ) -> Result<Option<Vec<u8>>, CacheError> {
    self.insert(&key, value, ttl)
  }

  async fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
    GridCache::remove(self, key)
  }

  async fn contains_key(&self, key: &[u8]) -> Result<bool, CacheError> {
    GridCache::contains_key(self, key)
  }

  async fn len(&self) -> Result<usize, CacheError> {
    Ok(GridCache::len(self))
  }
}

/// A read-through front map over a back cache
pub struct NearTier {
  front: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
  back: Arc<GridCache>,
}

impl NearTier {
  pub fn new(back: Arc<GridCache>) -> Arc<Self> {
    Arc::new(Self {
      front: RwLock::new(HashMap::new()),
      back,
    })
  }

  /// The partitioned cache behind the front tier.
  pub fn back(&self) -> &Arc<GridCache> {
    &self.back
  }

  pub fn front_len(&self) -> usize {
    self.front.read().len()
  }
}

#[async_trait]
impl ByteCache for NearTier {
  async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
    if let Some(hit) = self.front.read().get(key) {
      return Ok(Some(hit.clone()));
    }
    let value = self.back.get(key)?;
    if let Some(v) = &value {
      self.front.write().insert(key.to_vec(), v.clone());
    }
    Ok(value)
  }

  async fn put(
    &self,
    key: Vec<u8>,
    value: Vec<u8>,
    ttl: Option<Duration>,
  ) -> Result<Option<Vec<u8>>, CacheError> {
    self.front.write().remove(&key);
    self.back.insert(&key, value, ttl)
  }

  async fn remove(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CacheError> {
    self.front.write().remove(key);
    self.back.remove(key)
  }

  async fn contains_key(&self, key: &[u8]) -> Result<bool, CacheError> {
    if self.front.read().contains_key(key) {
      return Ok(true);
    }
    self.back.contains_key(key)
  }

  async fn len(&self) -> Result<usize, CacheError> {
    Ok(self.back.len())
  }
}
