//! Server-wide in-memory caches.
//!
//! One sharded LRU instance serves as the block cache for every engine on
//! the server, and a second one backs the table cache. Capacity is a
//! server-wide byte budget passed down by reference at engine open.

pub mod lru;

pub use lru::ShardedLru;
