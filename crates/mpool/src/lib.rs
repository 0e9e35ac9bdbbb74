//! mpool - media-pool object storage
//!
//! This crate implements the mpool user-space client library:
//! - Pools: named object namespaces over a directory of extent files,
//!   with exclusive/shared open modes and per-media-class accounting
//! - Mblocks: bulk append-once extents with all-or-nothing writes, an
//!   asynchronous write context, and page-aligned reads
//! - Mlogs: append-only record logs with generation counters
//! - MDCs: crash-safe metadata containers built from a pair of mlogs
//!   with online compaction
//! - Mcache maps: memory-mapped vectors of committed mblocks for
//!   zero-copy page-level access

pub mod device;
pub mod mblock;
pub mod mcache;
pub mod mdc;
pub mod meta;
pub mod mlog;
pub mod pool;
mod registry;
pub mod writectx;

// Re-exports
pub use mblock::MblockHandle;
pub use mcache::McacheMap;
pub use mdc::{Mdc, MdcUnsync};
pub use mlog::{MlogHandle, MlogOpenFlags};
pub use pool::{Mpool, PoolOpenFlags};
pub use writectx::MblockWriteCtx;

pub use mpool_common::{
    Error, ErrorKind, MapAdvice, MblockProps, MclassProps, MdcProps, MediaClass, MlogProps,
    ObjectKind, Oid, PoolProps, PoolUsage, Result,
    config::{MclassConfig, MpoolConfig, MpoolParams, RUNDIR_ROOT},
    errno_from_code, kind_from_code,
};
