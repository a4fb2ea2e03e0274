//! Cache change events

use crate::processor::EntryChange;

/// What happened to an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
  Inserted,
  Updated,
  Deleted,
}

/// A single entry mutation observed on a cache
#[derive(Debug, Clone)]
pub struct CacheEvent {
  pub kind: EventKind,
  pub key: Vec<u8>,
  /// Pre-image in the cache's native format
  pub old: Option<Vec<u8>>,
  /// Post-image in the cache's native format
  pub new: Option<Vec<u8>>,
  /// True for events not caused by a client mutation (expiry, priming)
  pub synthetic: bool,
}

impl CacheEvent {
  /// Build an event from a processor's pre/post images. Returns `None`
  /// when the change is a no-op.
  pub fn from_change(key: &[u8], change: &EntryChange) -> Option<Self> {
    let kind = match (&change.old, &change.new) {
      (None, Some(_)) => EventKind::Inserted,
      (Some(_), Some(_)) => EventKind::Updated,
      (Some(_), None) => EventKind::Deleted,
      (None, None) => return None,
    };
    Some(CacheEvent {
      kind,
      key: key.to_vec(),
      old: change.old.clone(),
      new: change.new.clone(),
      synthetic: false,
    })
  }

  pub fn synthetic_insert(key: Vec<u8>, value: Vec<u8>) -> Self {
    CacheEvent {
      kind: EventKind::Inserted,
      key,
      old: None,
      new: Some(value),
      synthetic: true,
    }
  }

  pub fn expired(key: Vec<u8>, old: Vec<u8>) -> Self {
    CacheEvent {
      kind: EventKind::Deleted,
      key,
      old: Some(old),
      new: None,
      synthetic: true,
    }
  }
}

/// Everything a cache subscriber can observe, in backend order
#[derive(Debug, Clone)]
pub enum CacheChange {
  Entry(CacheEvent),
  Truncated,
  Destroyed,
}
