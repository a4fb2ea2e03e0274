//! Proxy configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the proxy daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
  /// Bind address for the gRPC listener
  #[serde(default = "default_listen_addr")]
  pub listen_addr: String,

  /// Soft cap in bytes on one page of a paged query
  #[serde(default = "default_transfer_threshold")]
  pub transfer_threshold: usize,

  /// Per-stream outbound event window, in entries
  #[serde(default = "default_event_buffer")]
  pub event_buffer: usize,

  /// Threads in the dedicated handler pool
  #[serde(default = "default_worker_threads")]
  pub worker_threads: usize,

  /// Scope used when a request omits one
  #[serde(default)]
  pub default_scope: String,

  /// Client-side ensure-cache wait, also attached to calls as a deadline
  #[serde(default = "default_request_deadline_ms")]
  pub request_deadline_ms: u64,

  /// Partition count of the in-process grid
  #[serde(default = "default_partitions")]
  pub partitions: usize,

  /// Member count of the in-process grid
  #[serde(default = "default_members")]
  pub members: u32,
}

fn default_listen_addr() -> String {
  "0.0.0.0:1408".to_string()
}

fn default_transfer_threshold() -> usize {
  16 * 1024
}

fn default_event_buffer() -> usize {
  1024
}

fn default_worker_threads() -> usize {
  4
}

fn default_request_deadline_ms() -> u64 {
  30_000
}

fn default_partitions() -> usize {
  17
}

fn default_members() -> u32 {
  1
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen_addr: default_listen_addr(),
      transfer_threshold: default_transfer_threshold(),
      event_buffer: default_event_buffer(),
      worker_threads: default_worker_threads(),
      default_scope: String::new(),
      request_deadline_ms: default_request_deadline_ms(),
      partitions: default_partitions(),
      members: default_members(),
    }
  }
}

impl ProxyConfig {
  /// Load from a JSON file, then apply `HOARD_*` environment overrides.
  pub fn load(path: Option<&Path>) -> Result<Self, anyhow::Error> {
    let mut config = match path {
      Some(path) => {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)?
      }
      None => Self::default(),
    };
    config.apply_env();
    Ok(config)
  }

  fn apply_env(&mut self) {
    if let Ok(addr) = std::env::var("HOARD_LISTEN_ADDR") {
      self.listen_addr = addr;
    }
    if let Some(v) = env_parse("HOARD_TRANSFER_THRESHOLD") {
      self.transfer_threshold = v;
    }
    if let Some(v) = env_parse("HOARD_EVENT_BUFFER") {
      self.event_buffer = v;
    }
    if let Some(v) = env_parse("HOARD_WORKER_THREADS") {
      self.worker_threads = v;
    }
    if let Ok(scope) = std::env::var("HOARD_DEFAULT_SCOPE") {
      self.default_scope = scope;
    }
    if let Some(v) = env_parse("HOARD_REQUEST_DEADLINE_MS") {
      self.request_deadline_ms = v;
    }
  }

  pub fn request_deadline(&self) -> Duration {
    Duration::from_millis(self.request_deadline_ms)
  }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
  std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults() {
    let config = ProxyConfig::default();
    assert_eq!(config.listen_addr, "0.0.0.0:1408");
    assert_eq!(config.transfer_threshold, 16 * 1024);
    assert_eq!(config.event_buffer, 1024);
    assert_eq!(config.worker_threads, 4);
    assert_eq!(config.default_scope, "");
    assert_eq!(config.request_deadline(), Duration::from_secs(30));
  }

  #[test]
  fn partial_json_fills_in_defaults() {
    let config: ProxyConfig =
      serde_json::from_str(r#"{"transfer_threshold": 4096, "default_scope": "tenants"}"#).unwrap();
    assert_eq!(config.transfer_threshold, 4096);
    assert_eq!(config.default_scope, "tenants");
    assert_eq!(config.event_buffer, 1024);
  }
}
