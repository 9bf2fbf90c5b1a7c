//! Leaf back ends
//!
//! Wire-protocol clients (memcache, redis) live outside this crate and plug
//! in by implementing [`CacheInstance`](crate::CacheInstance). The leaves here
//! are the in-process cache and a fake node for tests.

pub mod fake;
mod memory;

pub use fake::{FakeCache, RequestCounts};
pub use memory::{InMemoryCache, InMemoryOptions};
