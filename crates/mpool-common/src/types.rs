//! Core type definitions for mpool
//!
//! Object identifiers, media classes, and the property structures reported
//! for each object kind. An [`Oid`] is a 64-bit value that carries the object
//! kind, media class, and spare flag in its upper bits; lookups recover the
//! kind from the ID, never from caller assertion.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of a persistent object, as encoded in its ID
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ObjectKind {
    /// Bulk append-once data extent
    Mblock = 1,
    /// Append-only record log with a generation counter
    Mlog = 2,
}

impl ObjectKind {
    fn from_bits(v: u64) -> Option<Self> {
        match v {
            1 => Some(Self::Mblock),
            2 => Some(Self::Mlog),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mblock => write!(f, "mblock"),
            Self::Mlog => write!(f, "mlog"),
        }
    }
}

/// Media-class tier selecting among backing devices
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MediaClass {
    /// Bulk capacity tier
    #[default]
    Capacity = 0,
    /// Staging tier
    Staging = 1,
}

impl MediaClass {
    /// Directory name for this class inside a pool
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Capacity => "capacity",
            Self::Staging => "staging",
        }
    }

    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Capacity),
            1 => Some(Self::Staging),
            _ => None,
        }
    }

    /// All defined classes, in tier order
    pub const ALL: [MediaClass; 2] = [Self::Capacity, Self::Staging];
}

impl fmt::Display for MediaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 64-bit object identifier
///
/// Bit layout: `[63:62]` kind, `[61:60]` media class, `[59]` spare flag,
/// `[58:0]` serial. The serial is unique within a pool for the object's
/// lifetime.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct Oid(u64);

const KIND_SHIFT: u64 = 62;
const MCLASS_SHIFT: u64 = 60;
const SPARE_SHIFT: u64 = 59;
const SERIAL_MASK: u64 = (1 << SPARE_SHIFT) - 1;

impl Oid {
    /// Compose an ID from its parts; the serial is masked to 59 bits
    #[must_use]
    pub fn compose(kind: ObjectKind, mclass: MediaClass, spare: bool, serial: u64) -> Self {
        Self(
            (u64::from(kind as u8) << KIND_SHIFT)
                | (u64::from(mclass as u8) << MCLASS_SHIFT)
                | (u64::from(spare) << SPARE_SHIFT)
                | (serial & SERIAL_MASK),
        )
    }

    /// Object kind carried in the ID, if the bits are well formed
    #[must_use]
    pub fn kind(self) -> Option<ObjectKind> {
        ObjectKind::from_bits(self.0 >> KIND_SHIFT)
    }

    /// Media class carried in the ID, if the bits are well formed
    #[must_use]
    pub fn mclass(self) -> Option<MediaClass> {
        MediaClass::from_u8(((self.0 >> MCLASS_SHIFT) & 0x3) as u8)
    }

    /// Whether the object was allocated from spare capacity
    #[must_use]
    pub const fn is_spare(self) -> bool {
        (self.0 >> SPARE_SHIFT) & 1 == 1
    }

    /// Per-pool serial component
    #[must_use]
    pub const fn serial(self) -> u64 {
        self.0 & SERIAL_MASK
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({:#018x})", self.0)
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Properties of an mblock
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MblockProps {
    /// Object ID
    pub oid: Oid,
    /// Media class the extent lives in
    pub mclass: MediaClass,
    /// Extent capacity in bytes
    pub capacity: u64,
    /// Bytes written so far
    pub wlen: u64,
    /// Whether the mblock has been committed (sealed)
    pub committed: bool,
    /// Optimal write alignment; write lengths must be multiples of this
    pub optimal_wrsz: u32,
    /// Page size governing read offsets and mcache granularity
    pub page_size: u32,
}

/// Properties of an mlog
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MlogProps {
    /// Object ID
    pub oid: Oid,
    /// Media class the log lives in
    pub mclass: MediaClass,
    /// Capacity target in bytes
    pub capacity: u64,
    /// Current generation
    pub r#gen: u64,
    /// Whether the mlog has been committed
    pub committed: bool,
}

/// Properties of an MDC (a committed pair of mlogs)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MdcProps {
    /// First constituent mlog
    pub oid1: Oid,
    /// Second constituent mlog
    pub oid2: Oid,
    /// Media class of both mlogs
    pub mclass: MediaClass,
    /// Per-mlog capacity target in bytes
    pub capacity: u64,
}

/// Properties of a media class within a pool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MclassProps {
    /// The class
    pub mclass: MediaClass,
    /// Extent size handed to each mblock allocation
    pub extent_size: u64,
    /// Total byte budget of the class
    pub total: u64,
    /// Bytes currently allocated
    pub used: u64,
    /// Bytes reserved for spare allocations
    pub spare_reserved: u64,
}

/// Properties of a pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolProps {
    /// Pool UUID assigned at create
    pub uuid: Uuid,
    /// Pool name
    pub name: String,
    /// Human label, empty if unset
    pub label: String,
    /// Configured media classes
    pub mclasses: Vec<MclassProps>,
}

/// Aggregate usage of a pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolUsage {
    /// Bytes allocated across all classes
    pub used: u64,
    /// Total byte budget across all classes
    pub total: u64,
    /// Live object count
    pub objects: u64,
}

/// Coarse paging advice for an mcache map, routed to `madvise(2)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MapAdvice {
    /// No special treatment
    #[default]
    Normal,
    /// Expect random access
    Random,
    /// Expect sequential access
    Sequential,
    /// Prefetch eagerly
    WillNeed,
    /// Pages may be dropped
    DontNeed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_carries_kind_class_spare() {
        let oid = Oid::compose(ObjectKind::Mlog, MediaClass::Staging, true, 42);
        assert_eq!(oid.kind(), Some(ObjectKind::Mlog));
        assert_eq!(oid.mclass(), Some(MediaClass::Staging));
        assert!(oid.is_spare());
        assert_eq!(oid.serial(), 42);
    }

    #[test]
    fn oid_serial_masked() {
        let oid = Oid::compose(ObjectKind::Mblock, MediaClass::Capacity, false, u64::MAX);
        assert_eq!(oid.kind(), Some(ObjectKind::Mblock));
        assert!(!oid.is_spare());
        assert_eq!(oid.serial(), (1 << 59) - 1);
    }

    #[test]
    fn oid_rejects_malformed_kind() {
        let raw = Oid::from(0u64);
        assert_eq!(raw.kind(), None);
    }

    #[test]
    fn mclass_names() {
        assert_eq!(MediaClass::Capacity.as_str(), "capacity");
        assert_eq!(MediaClass::from_u8(1), Some(MediaClass::Staging));
        assert_eq!(MediaClass::from_u8(7), None);
    }
}
