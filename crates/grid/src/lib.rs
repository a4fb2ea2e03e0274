//! Partitioned in-memory cache grid
//!
//! The backend consumed by the hoard proxy: a named, partitioned byte
//! store with entry processors, filtered queries, change events, and a
//! partition-ownership service, plus the serialization codecs shared by
//! proxy and clients.

pub mod codec;
pub mod entry;
pub mod error;
pub mod events;
pub mod instance;
pub mod near;
pub mod processor;
pub mod query;
pub mod service;
pub mod store;
pub mod topics;

pub use codec::{Codec, CodecError, CodecRegistry, JsonCodec, MsgpackCodec};
pub use entry::CacheEntry;
pub use error::CacheError;
pub use events::{CacheChange, CacheEvent, EventKind};
pub use instance::{GridInstance, GridSession, InstanceRegistry, DEFAULT_NAME};
pub use near::{ByteCache, NearTier};
pub use processor::{BinaryProcessor, ProcessorResult};
pub use query::{Aggregator, Comparator, Extractor, Filter};
pub use service::{AsyncCache, Member, PartitionedService};
pub use store::{CacheStats, GridCache};
pub use topics::TopicStatistics;
