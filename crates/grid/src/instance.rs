//! Grid instances, sessions, and the process-wide instance registry
//!
//! An instance owns the sessions of one tenant; a session owns the named
//! caches of one scope. The proxy resolves (scope, cache) through the
//! registry, so equal names always come back as the same handle within a
//! process.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::codec::CodecRegistry;
use crate::near::NearTier;
use crate::service::{AsyncCache, PartitionedService};
use crate::store::GridCache;
use crate::topics::TopicStatistics;

/// Name of the default instance and the default scope
pub const DEFAULT_NAME: &str = "";

const DEFAULT_TOPIC_CHANNELS: usize = 17;

const EXPIRY_SWEEP_SECS: u64 = 1;

/// The caches of one scope
pub struct GridSession {
  scope: String,
  partition_count: usize,
  codecs: Arc<CodecRegistry>,
  service: Arc<PartitionedService>,
  caches: RwLock<HashMap<String, Arc<GridCache>>>,
  near_configured: RwLock<HashSet<String>>,
  near_tiers: RwLock<HashMap<String, Arc<NearTier>>>,
  topics: RwLock<HashMap<String, Arc<TopicStatistics>>>,
}

impl GridSession {
  pub fn new(
    scope: impl Into<String>,
    codecs: Arc<CodecRegistry>,
    service: Arc<PartitionedService>,
  ) -> Arc<Self> {
    Arc::new(Self {
      scope: scope.into(),
      partition_count: service.partition_count(),
      codecs,
      service,
      caches: RwLock::new(HashMap::new()),
      near_configured: RwLock::new(HashSet::new()),
      near_tiers: RwLock::new(HashMap::new()),
      topics: RwLock::new(HashMap::new()),
    })
  }

  pub fn scope(&self) -> &str {
    &self.scope
  }

  pub fn service(&self) -> &Arc<PartitionedService> {
    &self.service
  }

  pub fn codecs(&self) -> &Arc<CodecRegistry> {
    &self.codecs
  }

  /// The back cache for a name, created on first use. A destroyed cache
  /// keeps its slot so every handle observes the destruction.
  pub fn ensure_cache(&self, name: &str) -> Arc<GridCache> {
    if let Some(existing) = self.caches.read().get(name) {
      return existing.clone();
    }
    let mut caches = self.caches.write();
    caches
      .entry(name.to_string())
      .or_insert_with(|| {
        let cache = GridCache::new(name, self.partition_count, self.codecs.cache_codec());
        // sweep expired entries while a runtime is around; the task ends
        // when the cache is destroyed
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
          handle.spawn(crate::store::run_expiry_task(cache.clone(), EXPIRY_SWEEP_SECS));
        }
        cache
      })
      .clone()
  }

  pub fn lookup(&self, name: &str) -> Option<Arc<GridCache>> {
    self.caches.read().get(name).cloned()
  }

  /// Mark a cache name as near-cache configured for embedded callers.
  pub fn configure_near(&self, name: &str) {
    self.near_configured.write().insert(name.to_string());
  }

  pub fn is_near_configured(&self, name: &str) -> bool {
    self.near_configured.read().contains(name)
  }

  /// The near front for a configured name, sharing the back cache.
  pub fn ensure_near(&self, name: &str) -> Arc<NearTier> {
    if let Some(existing) = self.near_tiers.read().get(name) {
      return existing.clone();
    }
    let back = self.ensure_cache(name);
    let mut tiers = self.near_tiers.write();
    tiers
      .entry(name.to_string())
      .or_insert_with(|| NearTier::new(back))
      .clone()
  }

  pub fn async_cache(&self, name: &str) -> AsyncCache {
    AsyncCache::new(self.ensure_cache(name), self.service.clone())
  }

  pub fn cache_names(&self) -> Vec<String> {
    self.caches.read().keys().cloned().collect()
  }

  /// Create-or-get statistics for a named topic.
  pub fn topic_statistics(&self, name: &str) -> Arc<TopicStatistics> {
    if let Some(existing) = self.topics.read().get(name) {
      return existing.clone();
    }
    let mut topics = self.topics.write();
    topics
      .entry(name.to_string())
      .or_insert_with(|| TopicStatistics::new(DEFAULT_TOPIC_CHANNELS))
      .clone()
  }
}

/// The sessions of one tenant
pub struct GridInstance {
  name: String,
  sessions: RwLock<HashMap<String, Arc<GridSession>>>,
}

impl GridInstance {
  pub fn new(name: impl Into<String>) -> Arc<Self> {
    Arc::new(Self {
      name: name.into(),
      sessions: RwLock::new(HashMap::new()),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn add_session(&self, session: Arc<GridSession>) {
    self
      .sessions
      .write()
      .insert(session.scope().to_string(), session);
  }

  pub fn session(&self, scope: &str) -> Option<Arc<GridSession>> {
    self.sessions.read().get(scope).cloned()
  }

  pub fn scope_names(&self) -> Vec<String> {
    self.sessions.read().keys().cloned().collect()
  }
}

/// Process-wide registry of named instances
#[derive(Default)]
pub struct InstanceRegistry {
  instances: RwLock<HashMap<String, Arc<GridInstance>>>,
}

impl InstanceRegistry {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn register(&self, instance: Arc<GridInstance>) {
    self
      .instances
      .write()
      .insert(instance.name().to_string(), instance);
  }

  pub fn get(&self, name: &str) -> Option<Arc<GridInstance>> {
    self.instances.read().get(name).cloned()
  }

  pub fn instance_names(&self) -> Vec<String> {
    self.instances.read().keys().cloned().collect()
  }
}
