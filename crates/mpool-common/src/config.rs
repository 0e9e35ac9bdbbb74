//! Pool parameters and runtime configuration
//!
//! [`MpoolParams`] mirrors the parameter block recognized at pool create:
//! every field has a distinguished *invalid* sentinel meaning "leave
//! default", so callers set only the fields they care about (start from
//! [`MpoolParams::init`], which is all sentinels).

use crate::types::MediaClass;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default process-wide root for per-pool runtime locks
pub const RUNDIR_ROOT: &str = "/var/run/mpool";

/// Sentinel for unset `u32` parameters
pub const U32_INVALID: u32 = u32::MAX;
/// Sentinel for unset `u64` parameters
pub const U64_INVALID: u64 = u64::MAX;
/// Sentinel for unset percentage parameters
pub const PCT_INVALID: u8 = u8::MAX;

/// Pool parameters recognized at create and reported by params-get
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpoolParams {
    /// Owning uid for pool files; sentinel = do not chown
    pub uid: u32,
    /// Owning gid for pool files; sentinel = do not chown
    pub gid: u32,
    /// Permission mode for pool files; sentinel = leave umask result
    pub mode: u32,
    /// Percent of capacity-class bytes reserved for spare allocations
    pub spare_cap_pct: u8,
    /// Percent of staging-class bytes reserved for spare allocations
    pub spare_stg_pct: u8,
    /// Read-ahead window for mcache maps, in pages
    pub ra_pages: u32,
    /// Capacity target of the root MDC (MDC-0), in bytes
    pub mdc0_cap: u64,
    /// Default capacity target of caller-created MDCs, in bytes
    pub mdcn_cap: u64,
    /// Advisory count of caller-created MDCs
    pub mdc_cnt: u32,
    /// Human-readable label; empty = unset
    pub label: String,
}

impl MpoolParams {
    /// All-sentinel parameter block: nothing overridden
    #[must_use]
    pub fn init() -> Self {
        Self {
            uid: U32_INVALID,
            gid: U32_INVALID,
            mode: U32_INVALID,
            spare_cap_pct: PCT_INVALID,
            spare_stg_pct: PCT_INVALID,
            ra_pages: U32_INVALID,
            mdc0_cap: U64_INVALID,
            mdcn_cap: U64_INVALID,
            mdc_cnt: U32_INVALID,
            label: String::new(),
        }
    }

    /// Overlay this block on `base`, taking `base` wherever a field here is
    /// still the sentinel
    #[must_use]
    pub fn merged(&self, base: &Self) -> Self {
        Self {
            uid: if self.uid == U32_INVALID { base.uid } else { self.uid },
            gid: if self.gid == U32_INVALID { base.gid } else { self.gid },
            mode: if self.mode == U32_INVALID { base.mode } else { self.mode },
            spare_cap_pct: if self.spare_cap_pct == PCT_INVALID {
                base.spare_cap_pct
            } else {
                self.spare_cap_pct
            },
            spare_stg_pct: if self.spare_stg_pct == PCT_INVALID {
                base.spare_stg_pct
            } else {
                self.spare_stg_pct
            },
            ra_pages: if self.ra_pages == U32_INVALID {
                base.ra_pages
            } else {
                self.ra_pages
            },
            mdc0_cap: if self.mdc0_cap == U64_INVALID {
                base.mdc0_cap
            } else {
                self.mdc0_cap
            },
            mdcn_cap: if self.mdcn_cap == U64_INVALID {
                base.mdcn_cap
            } else {
                self.mdcn_cap
            },
            mdc_cnt: if self.mdc_cnt == U32_INVALID {
                base.mdc_cnt
            } else {
                self.mdc_cnt
            },
            label: if self.label.is_empty() {
                base.label.clone()
            } else {
                self.label.clone()
            },
        }
    }

    /// Spare-reserve percentage for the given class
    #[must_use]
    pub fn spare_pct(&self, mclass: MediaClass) -> u8 {
        match mclass {
            MediaClass::Capacity => self.spare_cap_pct,
            MediaClass::Staging => self.spare_stg_pct,
        }
    }
}

impl Default for MpoolParams {
    /// Concrete defaults applied where create-time params left the sentinel
    fn default() -> Self {
        Self {
            uid: U32_INVALID,
            gid: U32_INVALID,
            mode: U32_INVALID,
            spare_cap_pct: 5,
            spare_stg_pct: 5,
            ra_pages: 128,
            mdc0_cap: 8 * 1024 * 1024,
            mdcn_cap: 2 * 1024 * 1024,
            mdc_cnt: 16,
            label: String::new(),
        }
    }
}

/// Process-level configuration threaded through pool open
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MpoolConfig {
    /// Root directory for per-pool runtime lock files
    pub rundir_root: PathBuf,
    /// Open extent files with `O_DIRECT`
    pub direct_io: bool,
}

impl Default for MpoolConfig {
    fn default() -> Self {
        Self {
            rundir_root: PathBuf::from(RUNDIR_ROOT),
            direct_io: false,
        }
    }
}

/// Per-media-class sizing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MclassConfig {
    /// Extent size handed to each mblock allocation
    pub extent_size: u64,
    /// Total byte budget; `u64::MAX` = unbounded
    pub total: u64,
}

impl Default for MclassConfig {
    fn default() -> Self {
        Self {
            extent_size: 32 * 1024 * 1024,
            total: u64::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_all_sentinels() {
        let p = MpoolParams::init();
        assert_eq!(p.uid, U32_INVALID);
        assert_eq!(p.mdc0_cap, U64_INVALID);
        assert!(p.label.is_empty());
    }

    #[test]
    fn merged_prefers_set_fields() {
        let mut p = MpoolParams::init();
        p.ra_pages = 32;
        p.label = "tier-a".to_string();

        let merged = p.merged(&MpoolParams::default());
        assert_eq!(merged.ra_pages, 32);
        assert_eq!(merged.label, "tier-a");
        assert_eq!(merged.spare_cap_pct, 5);
        assert_eq!(merged.mdc0_cap, 8 * 1024 * 1024);
    }

    #[test]
    fn spare_pct_per_class() {
        let p = MpoolParams {
            spare_cap_pct: 10,
            spare_stg_pct: 20,
            ..MpoolParams::default()
        };
        assert_eq!(p.spare_pct(MediaClass::Capacity), 10);
        assert_eq!(p.spare_pct(MediaClass::Staging), 20);
    }
}
