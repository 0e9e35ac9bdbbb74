//! Common foundations for the mpool client library
//!
//! This crate holds what every other mpool crate needs:
//! - Error reporting: the failure taxonomy and the packed 64-bit boundary
//!   code with its errno extractor
//! - Core types: object IDs, media classes, object and pool properties
//! - Configuration: pool parameters with leave-default sentinels

pub mod config;
pub mod error;
pub mod types;

// Re-exports
pub use config::{MclassConfig, MpoolConfig, MpoolParams, RUNDIR_ROOT};
pub use error::{Error, ErrorKind, Result, errno_from_code, kind_from_code};
pub use types::{
    MapAdvice, MblockProps, MclassProps, MdcProps, MediaClass, MlogProps, ObjectKind, Oid,
    PoolProps, PoolUsage,
};
