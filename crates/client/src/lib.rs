//! Client-side cache proxy for the hoard grid
//!
//! Presents the embedded cache contract over the wire: a `Session` owns a
//! channel and its event stream, and hands out `RemoteCache` handles whose
//! operations delegate to the proxy with the session's serialization
//! format.

pub mod cache;
pub mod error;
pub mod events;
pub mod session;

pub use cache::{CacheLifecycleListener, RemoteCache};
pub use error::ClientError;
pub use events::{MapListener, RemoteEvent};
pub use session::{Session, SessionOptions};
