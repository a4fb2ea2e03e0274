//! Paged iteration with a byte transfer budget
//!
//! Pages are bounded by the cumulative serialized payload, not an element
//! count: entry sizes vary by orders of magnitude and a fixed element
//! budget would either starve or overflow a response. Iteration order is
//! partitions ascending, keys ascending within a partition, resumed by an
//! opaque cookie. Consistency is best-effort under concurrent mutation;
//! keys are never delivered twice, and a truncate between pages bumps the
//! cache epoch so the stale cursor ends instead of resurrecting keys.

use serde::{Deserialize, Serialize};

use grid::GridCache;

use crate::error::ProxyError;

/// Resume point of a paged iteration, opaque to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageCookie {
  pub partition: u32,
  pub resume_key: Vec<u8>,
  pub epoch: u64,
}

impl PageCookie {
  pub fn encode(&self) -> Result<Vec<u8>, ProxyError> {
    rmp_serde::to_vec(self).map_err(ProxyError::internal)
  }

  /// Empty bytes start a fresh iteration.
  pub fn decode(bytes: &[u8]) -> Result<Option<Self>, ProxyError> {
    if bytes.is_empty() {
      return Ok(None);
    }
    rmp_serde::from_slice(bytes)
      .map(Some)
      .map_err(|e| ProxyError::invalid(format!("malformed page cookie: {}", e)))
  }
}

/// One page of keys in the cache's native format.
pub struct KeyPage {
  pub keys: Vec<Vec<u8>>,
  /// Cookie for the next page; empty when iteration is complete
  pub cookie: Vec<u8>,
}

/// One page of entries in the cache's native format.
pub struct EntryPage {
  pub entries: Vec<(Vec<u8>, Vec<u8>)>,
  pub cookie: Vec<u8>,
}

fn start_of(cache: &GridCache, cookie: Option<PageCookie>) -> Option<(usize, Option<Vec<u8>>)> {
  match cookie {
    None => Some((0, None)),
    // a stale epoch means the snapshot is gone; end the iteration
    Some(c) if c.epoch != cache.epoch() => None,
    Some(c) => Some((c.partition as usize, Some(c.resume_key))),
  }
}

/// Produce the next page of keys, stopping once the cumulative key payload
/// exceeds the threshold.
pub fn keys_page(
  cache: &GridCache,
  cookie: Option<PageCookie>,
  threshold: usize,
) -> Result<KeyPage, ProxyError> {
  let Some((first_partition, resume)) = start_of(cache, cookie) else {
    return Ok(KeyPage {
      keys: Vec::new(),
      cookie: Vec::new(),
    });
  };

  let epoch = cache.epoch();
  let mut keys = Vec::new();
  let mut budget = 0usize;

  for partition in first_partition..cache.partition_count() {
    let after = if partition == first_partition {
      resume.as_deref()
    } else {
      None
    };
    for key in cache.partition_keys_after(partition, after) {
      budget += key.len();
      keys.push(key);
      if budget > threshold {
        let cookie = PageCookie {
          partition: partition as u32,
          resume_key: keys.last().cloned().unwrap_or_default(),
          epoch,
        }
        .encode()?;
        return Ok(KeyPage { keys, cookie });
      }
    }
  }

  Ok(KeyPage {
    keys,
    cookie: Vec::new(),
  })
}

/// Produce the next page of entries, budgeting on key plus value bytes.
pub fn entries_page(
  cache: &GridCache,
  cookie: Option<PageCookie>,
  threshold: usize,
) -> Result<EntryPage, ProxyError> {
  let Some((first_partition, resume)) = start_of(cache, cookie) else {
    return Ok(EntryPage {
      entries: Vec::new(),
      cookie: Vec::new(),
    });
  };

  let epoch = cache.epoch();
  let mut entries = Vec::new();
  let mut budget = 0usize;

  for partition in first_partition..cache.partition_count() {
    let after = if partition == first_partition {
      resume.as_deref()
    } else {
      None
    };
    for key in cache.partition_keys_after(partition, after) {
      // the entry may vanish between the key snapshot and the read
      let Some(value) = cache.get(&key).map_err(ProxyError::from)? else {
        continue;
      };
      budget += key.len() + value.len();
      entries.push((key, value));
      if budget > threshold {
        let cookie = PageCookie {
          partition: partition as u32,
          resume_key: entries.last().map(|(k, _)| k.clone()).unwrap_or_default(),
          epoch,
        }
        .encode()?;
        return Ok(EntryPage { entries, cookie });
      }
    }
  }

  Ok(EntryPage {
    entries,
    cookie: Vec::new(),
  })
}
