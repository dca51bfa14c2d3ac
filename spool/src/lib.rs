//! Durable hand-off between collection and delivery.
//!
//! Batches are written to the [`LocalCache`] before anything tries to send
//! them. The [`Forwarder`] drains the cache oldest first and only removes a
//! batch once the endpoint accepted it, or rejected it for good.

#[macro_use]
extern crate tracing;

pub mod cache;
pub mod error;
pub mod forwarder;
pub mod transport;

pub use cache::{
    CacheEntry,
    EntryStatus,
    LocalCache,
};
pub use error::{
    CacheError,
    ForwardError,
};
pub use forwarder::{
    DrainReport,
    Forwarder,
};
pub use transport::{
    HttpTransport,
    Transport,
};
