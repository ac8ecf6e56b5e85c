//! cachet Storage - Cache Backend Trait and Adapters
//!
//! Defines the [`CacheBackend`] abstraction every store implements, plus the
//! adapters shipped with cachet:
//!
//! - [`MemoryBackend`]: in-process map with lazy expiry and an optional
//!   capacity bound.
//! - [`LmdbBackend`]: persistent single-host store on LMDB.
//! - [`RedisBackend`]: Redis semantics over a [`RedisConnection`]. The real
//!   client (`redis::aio::ConnectionManager`) is behind the `redis` feature.
//! - [`MemcachedBackend`]: memcached semantics over a [`MemcachedConnection`].
//!
//! Batch operations fan out through [`batch::dispatch`] with a bounded
//! concurrency limit and an optional [`Deadline`]. Results are reported per
//! item; one failing key never fails its neighbours.

pub mod batch;
pub mod lmdb_backend;
pub mod memcached_backend;
pub mod memory;
pub mod mock;
pub mod redis_backend;
pub mod traits;

pub use batch::{dispatch, Deadline};
pub use lmdb_backend::LmdbBackend;
pub use memcached_backend::{MemcachedBackend, MemcachedConnection, StoreCommand};
pub use memory::MemoryBackend;
pub use mock::{MockMemcached, MockRedis};
pub use redis_backend::{RedisBackend, RedisConnection, SetCondition};
pub use traits::{CacheBackend, CacheStats, DEFAULT_BATCH_CONCURRENCY};
