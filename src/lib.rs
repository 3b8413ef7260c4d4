//! emberdb: the core of a wide-column tablet server.
//!
//! A cluster's scheduler assigns each tablet server a set of tablets:
//! contiguous row ranges of tables, each backed by one LSM engine per
//! locality group. This crate implements that server's core: the tablet
//! lifecycle (load, unload, compact, split), the engines themselves (write
//! path, background compaction, snapshots, crash recovery), and the
//! two-tier block cache between the engines and the distributed
//! filesystem.
//!
//! The master, the coordinator lock service, the RPC transport and the
//! client SDK are external collaborators; their contracts are modelled by
//! the request/response types in [`server::ops`] and the session id checks
//! in [`server::TabletServer`].

pub mod blockcache;
pub mod cache;
pub mod config;
pub mod dfs;
pub mod engine;
pub mod error;
pub mod flash;
pub mod flock;
pub mod scheduler;
pub mod schema;
pub mod server;
pub mod tablet;

pub use config::Flags;
pub use error::{Error, Result, StatusCode};
pub use schema::{ColumnFamily, LocalityGroup, TableSchema};
pub use server::{CacheLayer, TabletServer};
