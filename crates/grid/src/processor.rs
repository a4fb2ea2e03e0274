//! Binary entry processors
//!
//! Point mutations are expressed as a tagged variant applied atomically to
//! one entry slot, returning the prior value in the cache's native format.
//! This is what lets the proxy answer put/remove/replace without an extra
//! round trip to re-read or re-serialize the previous value.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::entry::CacheEntry;

/// A point operation over one entry's raw bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryProcessor {
  /// Read the current value, distinguishing present from absent
  Get,
  Put {
    value: Vec<u8>,
    #[serde(default)]
    ttl_millis: u64,
  },
  PutIfAbsent {
    value: Vec<u8>,
    #[serde(default)]
    ttl_millis: u64,
  },
  Replace {
    value: Vec<u8>,
  },
  ReplaceMapping {
    expect: Vec<u8>,
    replacement: Vec<u8>,
  },
  Remove,
  RemoveMapping {
    value: Vec<u8>,
  },
  ContainsValue {
    value: Vec<u8>,
  },
}

/// Result of applying a processor
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorResult {
  /// No mapping was present
  Absent,
  /// Value bytes in the cache's native format
  Value(Vec<u8>),
  /// Predicate outcome
  Bool(bool),
}

impl ProcessorResult {
  fn from_prior(prior: Option<Vec<u8>>) -> Self {
    match prior {
      Some(v) => ProcessorResult::Value(v),
      None => ProcessorResult::Absent,
    }
  }
}

/// Pre/post images of a mutation, for event dispatch
#[derive(Debug, Clone)]
pub struct EntryChange {
  pub old: Option<Vec<u8>>,
  pub new: Option<Vec<u8>>,
}

/// Outcome of one processor application
#[derive(Debug, Clone)]
pub struct Applied {
  pub result: ProcessorResult,
  pub change: Option<EntryChange>,
}

impl Applied {
  fn read_only(result: ProcessorResult) -> Self {
    Applied {
      result,
      change: None,
    }
  }
}

impl BinaryProcessor {
  fn ttl(millis: u64) -> Option<Duration> {
    if millis > 0 {
      Some(Duration::from_millis(millis))
    } else {
      None
    }
  }

  /// Apply this processor to an entry slot. The slot must already be
  /// normalized: an expired entry is presented as `None`.
  pub fn apply(&self, slot: &mut Option<CacheEntry>) -> Applied {
    match self {
      BinaryProcessor::Get => match slot {
        Some(entry) => Applied::read_only(ProcessorResult::Value(entry.value.clone())),
        None => Applied::read_only(ProcessorResult::Absent),
      },

      BinaryProcessor::Put { value, ttl_millis } => {
        let old = slot.take().map(|e| e.value);
        *slot = Some(CacheEntry::new(value.clone(), Self::ttl(*ttl_millis)));
        Applied {
          result: ProcessorResult::from_prior(old.clone()),
          change: Some(EntryChange {
            old,
            new: Some(value.clone()),
          }),
        }
      }

      BinaryProcessor::PutIfAbsent { value, ttl_millis } => match slot {
        Some(entry) => Applied::read_only(ProcessorResult::Value(entry.value.clone())),
        None => {
          *slot = Some(CacheEntry::new(value.clone(), Self::ttl(*ttl_millis)));
          Applied {
            result: ProcessorResult::Absent,
            change: Some(EntryChange {
              old: None,
              new: Some(value.clone()),
            }),
          }
        }
      },

      BinaryProcessor::Replace { value } => match slot {
        Some(entry) => {
          let old = std::mem::replace(&mut entry.value, value.clone());
          Applied {
            result: ProcessorResult::Value(old.clone()),
            change: Some(EntryChange {
              old: Some(old),
              new: Some(value.clone()),
            }),
          }
        }
        None => Applied::read_only(ProcessorResult::Absent),
      },

      BinaryProcessor::ReplaceMapping {
        expect,
        replacement,
      } => match slot {
        Some(entry) if entry.value == *expect => {
          let old = std::mem::replace(&mut entry.value, replacement.clone());
          Applied {
            result: ProcessorResult::Bool(true),
            change: Some(EntryChange {
              old: Some(old),
              new: Some(replacement.clone()),
            }),
          }
        }
        _ => Applied::read_only(ProcessorResult::Bool(false)),
      },

      BinaryProcessor::Remove => match slot.take() {
        Some(entry) => Applied {
          result: ProcessorResult::Value(entry.value.clone()),
          change: Some(EntryChange {
            old: Some(entry.value),
            new: None,
          }),
        },
        None => Applied::read_only(ProcessorResult::Absent),
      },

      BinaryProcessor::RemoveMapping { value } => match slot {
        Some(entry) if entry.value == *value => {
          let old = slot.take().map(|e| e.value);
          Applied {
            result: ProcessorResult::Bool(true),
            change: Some(EntryChange {
              old,
              new: None,
            }),
          }
        }
        _ => Applied::read_only(ProcessorResult::Bool(false)),
      },

      BinaryProcessor::ContainsValue { value } => {
        let found = slot.as_ref().map(|e| e.value == *value).unwrap_or(false);
        Applied::read_only(ProcessorResult::Bool(found))
      }
    }
  }
}
