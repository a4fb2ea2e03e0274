//! hoard gRPC access proxy
//!
//! Exposes the partitioned cache grid to remote clients: unary point
//! operations, server-streamed queries and paged cursors, and one
//! bidirectional event stream per client, all with format bridging between
//! the client's serializer and the cache's native serializer.

pub mod config;
pub mod cursor;
pub mod error;
pub mod holder;
pub mod listeners;
pub mod resolver;
pub mod responses;
pub mod service;
pub mod workers;

pub use config::ProxyConfig;
pub use error::ProxyError;
pub use resolver::{AppContext, CacheResolver};
pub use service::CacheProxy;
pub use workers::WorkerPool;

use std::sync::Arc;

use grid::{CodecRegistry, GridInstance, GridSession, InstanceRegistry, PartitionedService};

/// Wire up an in-process grid with one instance and the sessions for the
/// given scopes, returning a resolver over it.
pub fn build_resolver(config: &ProxyConfig) -> Arc<CacheResolver> {
  let registry = InstanceRegistry::new();
  let instance = GridInstance::new(grid::DEFAULT_NAME);
  let codecs = Arc::new(CodecRegistry::with_defaults());
  let service = PartitionedService::new(config.members, config.partitions);

  let mut scopes = vec![String::new()];
  if !config.default_scope.is_empty() {
    scopes.push(config.default_scope.clone());
  }
  for scope in scopes {
    instance.add_session(GridSession::new(scope, codecs.clone(), service.clone()));
  }
  registry.register(instance);
  CacheResolver::new(registry, None, config.default_scope.clone())
}
