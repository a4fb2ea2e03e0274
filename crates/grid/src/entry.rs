//! Cache entry with expiry metadata

use std::time::{Duration, Instant};

/// A stored value in the cache's native format
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub value: Vec<u8>,
  pub expires_at: Option<Instant>,
}

impl CacheEntry {
  pub fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
    Self {
      value,
      expires_at: ttl.map(|d| Instant::now() + d),
    }
  }

  pub fn is_expired(&self) -> bool {
    self
      .expires_at
      .map(|exp| Instant::now() > exp)
      .unwrap_or(false)
  }

  pub fn ttl_remaining(&self) -> Option<Duration> {
    self.expires_at.and_then(|exp| {
      let now = Instant::now();
      if now > exp {
        None
      } else {
        Some(exp - now)
      }
    })
  }
}

/// Convert a wire TTL in milliseconds to a duration; zero means no expiry.
pub fn ttl_from_millis(millis: i64) -> Option<Duration> {
  if millis > 0 {
    Some(Duration::from_millis(millis as u64))
  } else {
    None
  }
}
