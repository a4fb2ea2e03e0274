//! Topic statistics
//!
//! Per-channel counters and publish meters plus a map of named
//! subscriber-group statistics. Create-or-get of a group goes through a
//! fair lock; readers only touch the shared map under a read lock and
//! never block behind writers queued on the fair lock.

use parking_lot::{FairMutex, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A count with exponentially decayed one/five/fifteen-minute rates
pub struct Meter {
  count: AtomicU64,
  started: Instant,
  rates: Mutex<DecayedRates>,
}

struct DecayedRates {
  last: Instant,
  one: f64,
  five: f64,
  fifteen: f64,
}

impl Meter {
  pub fn new() -> Self {
    let now = Instant::now();
    Self {
      count: AtomicU64::new(0),
      started: now,
      rates: Mutex::new(DecayedRates {
        last: now,
        one: 0.0,
        five: 0.0,
        fifteen: 0.0,
      }),
    }
  }

  pub fn mark(&self, n: u64) {
    self.count.fetch_add(n, Ordering::Relaxed);
    let mut rates = self.rates.lock();
    let now = Instant::now();
    let dt = now.duration_since(rates.last).as_secs_f64().max(1e-9);
    rates.last = now;
    let instant_rate = n as f64 / dt;
    for window in [60.0, 300.0, 900.0] {
      let rate = match window {
        60.0 => &mut rates.one,
        300.0 => &mut rates.five,
        _ => &mut rates.fifteen,
      };
      let alpha = 1.0 - (-dt / window).exp();
      *rate += alpha * (instant_rate - *rate);
    }
  }

  pub fn count(&self) -> u64 {
    self.count.load(Ordering::Relaxed)
  }

  pub fn mean_rate(&self) -> f64 {
    let elapsed = self.started.elapsed().as_secs_f64();
    if elapsed == 0.0 {
      0.0
    } else {
      self.count() as f64 / elapsed
    }
  }

  pub fn one_minute_rate(&self) -> f64 {
    self.rates.lock().one
  }

  pub fn five_minute_rate(&self) -> f64 {
    self.rates.lock().five
  }

  pub fn fifteen_minute_rate(&self) -> f64 {
    self.rates.lock().fifteen
  }
}

impl Default for Meter {
  fn default() -> Self {
    Self::new()
  }
}

/// Statistics for one channel of a topic
pub struct ChannelStatistics {
  channel: usize,
  published: AtomicU64,
  tail: Mutex<Option<u64>>,
}

impl ChannelStatistics {
  fn new(channel: usize) -> Self {
    Self {
      channel,
      published: AtomicU64::new(0),
      tail: Mutex::new(None),
    }
  }

  pub fn channel(&self) -> usize {
    self.channel
  }

  pub fn published_count(&self) -> u64 {
    self.published.load(Ordering::Relaxed)
  }

  /// The last published position in this channel.
  pub fn tail(&self) -> Option<u64> {
    *self.tail.lock()
  }

  fn on_published(&self, count: u64, tail: u64) {
    self.published.fetch_add(count, Ordering::Relaxed);
    *self.tail.lock() = Some(tail);
  }
}

/// Per-channel positions for one subscriber group
pub struct SubscriberGroupStatistics {
  polled: Meter,
  heads: Mutex<Vec<Option<u64>>>,
}

impl SubscriberGroupStatistics {
  fn new(channel_count: usize) -> Self {
    Self {
      polled: Meter::new(),
      heads: Mutex::new(vec![None; channel_count]),
    }
  }

  pub fn on_polled(&self, channel: usize, count: u64, head: u64) {
    self.polled.mark(count);
    let mut heads = self.heads.lock();
    if let Some(slot) = heads.get_mut(channel) {
      *slot = Some(head);
    }
  }

  pub fn polled_count(&self) -> u64 {
    self.polled.count()
  }

  pub fn head(&self, channel: usize) -> Option<u64> {
    self.heads.lock().get(channel).copied().flatten()
  }
}

/// Statistics for one topic
pub struct TopicStatistics {
  channels: Vec<ChannelStatistics>,
  published: Meter,
  groups: RwLock<HashMap<String, Arc<SubscriberGroupStatistics>>>,
  create_lock: FairMutex<()>,
}

impl TopicStatistics {
  pub fn new(channel_count: usize) -> Arc<Self> {
    Arc::new(Self {
      channels: (0..channel_count.max(1)).map(ChannelStatistics::new).collect(),
      published: Meter::new(),
      groups: RwLock::new(HashMap::new()),
      create_lock: FairMutex::new(()),
    })
  }

  pub fn channel_count(&self) -> usize {
    self.channels.len()
  }

  pub fn channel_statistics(&self, channel: usize) -> Option<&ChannelStatistics> {
    self.channels.get(channel)
  }

  pub fn on_published(&self, channel: usize, count: u64, tail: u64) {
    self.published.mark(count);
    if let Some(stats) = self.channels.get(channel) {
      stats.on_published(count, tail);
    }
  }

  pub fn published_count(&self) -> u64 {
    self.published.count()
  }

  pub fn published_mean_rate(&self) -> f64 {
    self.published.mean_rate()
  }

  pub fn published_one_minute_rate(&self) -> f64 {
    self.published.one_minute_rate()
  }

  /// Create-or-get statistics for a named subscriber group. Existing
  /// groups are returned from the shared map without touching the fair
  /// lock.
  pub fn subscriber_group(&self, name: &str) -> Arc<SubscriberGroupStatistics> {
    if let Some(existing) = self.groups.read().get(name) {
      return existing.clone();
    }
    let _guard = self.create_lock.lock();
    self
      .groups
      .write()
      .entry(name.to_string())
      .or_insert_with(|| Arc::new(SubscriberGroupStatistics::new(self.channels.len())))
      .clone()
  }

  pub fn remove_subscriber_group(&self, name: &str) {
    let _guard = self.create_lock.lock();
    self.groups.write().remove(name);
  }

  pub fn subscriber_group_names(&self) -> Vec<String> {
    self.groups.read().keys().cloned().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn meter_counts_and_rates() {
    let meter = Meter::new();
    meter.mark(10);
    meter.mark(5);
    assert_eq!(meter.count(), 15);
    assert!(meter.mean_rate() > 0.0);
    assert!(meter.one_minute_rate() >= 0.0);
  }

  #[test]
  fn channel_statistics_track_tail() {
    let topic = TopicStatistics::new(3);
    topic.on_published(1, 4, 42);
    topic.on_published(1, 2, 44);

    let channel = topic.channel_statistics(1).unwrap();
    assert_eq!(channel.published_count(), 6);
    assert_eq!(channel.tail(), Some(44));
    assert_eq!(topic.published_count(), 6);
  }

  #[test]
  fn subscriber_group_create_or_get_returns_same_instance() {
    let topic = TopicStatistics::new(2);
    let a = topic.subscriber_group("readers");
    let b = topic.subscriber_group("readers");
    assert!(Arc::ptr_eq(&a, &b));

    a.on_polled(0, 3, 7);
    assert_eq!(b.polled_count(), 3);
    assert_eq!(b.head(0), Some(7));

    topic.remove_subscriber_group("readers");
    let c = topic.subscriber_group("readers");
    assert!(!Arc::ptr_eq(&a, &c));
  }

  #[test]
  fn concurrent_create_or_get_yields_one_group() {
    let topic = TopicStatistics::new(1);
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let topic = topic.clone();
        std::thread::spawn(move || topic.subscriber_group("shared"))
      })
      .collect();
    let groups: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for pair in groups.windows(2) {
      assert!(Arc::ptr_eq(&pair[0], &pair[1]));
    }
    assert_eq!(topic.subscriber_group_names(), vec!["shared".to_string()]);
  }
}
