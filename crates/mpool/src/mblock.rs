//! Mblock manager
//!
//! An mblock is a bulk extent written once and sealed by commit. Writes are
//! all-or-nothing and strictly append: the write offset only moves forward,
//! and a failed write leaves it where it was. Reads require the committed
//! state and a page-aligned offset.

use crate::device::{self, ExtentFile, OPTIMAL_WRSZ};
use crate::meta::{ObjectMeta, OmState};
use crate::writectx::MblockWriteCtx;
use mpool_common::{Error, ErrorKind, MblockProps, MediaClass, Oid, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Async submissions are split into chunks of this size
pub(crate) const ASYNC_CHUNK: usize = 1024 * 1024;

/// Lifecycle state of an mblock
#[derive(Debug)]
pub(crate) enum MbState {
    Allocated { wlen: u64 },
    Committed { wlen: u64 },
    /// Aborted or deleted; the extent has been returned
    Dropped,
}

/// Mblock descriptor
#[derive(Debug)]
pub(crate) struct MblockObj {
    oid: Oid,
    mclass: MediaClass,
    spare: bool,
    capacity: u64,
    data_path: PathBuf,
    om_path: PathBuf,
    direct: bool,
    refs: AtomicU32,
    /// Mcache maps currently pinning this mblock
    maps: AtomicU32,
    state: Mutex<MbState>,
    file: Mutex<Option<Arc<ExtentFile>>>,
}

impl MblockObj {
    pub(crate) fn new_allocated(
        oid: Oid,
        mclass: MediaClass,
        spare: bool,
        capacity: u64,
        data_path: PathBuf,
        om_path: PathBuf,
        direct: bool,
        file: Arc<ExtentFile>,
    ) -> Self {
        Self {
            oid,
            mclass,
            spare,
            capacity,
            data_path,
            om_path,
            direct,
            refs: AtomicU32::new(0),
            maps: AtomicU32::new(0),
            state: Mutex::new(MbState::Allocated { wlen: 0 }),
            file: Mutex::new(Some(file)),
        }
    }

    /// Rebuild a committed descriptor from its open-scan sidecar
    pub(crate) fn from_scan(
        oid: Oid,
        mclass: MediaClass,
        spare: bool,
        om: &ObjectMeta,
        data_path: PathBuf,
        om_path: PathBuf,
        direct: bool,
    ) -> Self {
        Self {
            oid,
            mclass,
            spare,
            capacity: om.capacity,
            data_path,
            om_path,
            direct,
            refs: AtomicU32::new(0),
            maps: AtomicU32::new(0),
            state: Mutex::new(MbState::Committed { wlen: om.wlen }),
            file: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test(oid: Oid, path: PathBuf) -> Self {
        Self {
            oid,
            mclass: MediaClass::Capacity,
            spare: false,
            capacity: 0,
            om_path: path.clone(),
            data_path: path,
            direct: false,
            refs: AtomicU32::new(0),
            maps: AtomicU32::new(0),
            state: Mutex::new(MbState::Allocated { wlen: 0 }),
            file: Mutex::new(None),
        }
    }

    pub(crate) fn oid(&self) -> Oid {
        self.oid
    }

    pub(crate) fn mclass(&self) -> MediaClass {
        self.mclass
    }

    pub(crate) fn is_spare(&self) -> bool {
        self.spare
    }

    pub(crate) fn capacity(&self) -> u64 {
        self.capacity
    }

    pub(crate) fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn ref_inc(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn ref_dec(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }

    fn extent(&self) -> Result<Arc<ExtentFile>> {
        let mut file = self.file.lock();
        if let Some(f) = file.as_ref() {
            return Ok(f.clone());
        }
        let opened = Arc::new(ExtentFile::open(&self.data_path, false, self.direct)?);
        *file = Some(opened.clone());
        Ok(opened)
    }

    /// Synchronous gather write; all-or-nothing
    pub(crate) fn write_sync(&self, iovs: &[&[u8]]) -> Result<()> {
        let total: u64 = iovs.iter().map(|v| v.len() as u64).sum();
        if total == 0 {
            return Ok(());
        }
        if total % u64::from(OPTIMAL_WRSZ) != 0 {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                format_args!("write length {total} not a multiple of {OPTIMAL_WRSZ}"),
            ));
        }

        let mut state = self.state.lock();
        let wlen = match *state {
            MbState::Allocated { wlen } => wlen,
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mblock {} is not writable", self.oid),
                ));
            }
        };
        if wlen + total > self.capacity {
            return Err(Error::with_detail(
                ErrorKind::NoSpace,
                format_args!("mblock {} extent exhausted", self.oid),
            ));
        }

        let file = self.extent()?;
        let mut off = wlen;
        for iov in iovs {
            file.write_all_at(off, iov)?;
            off += iov.len() as u64;
        }
        file.sync_data()?;

        *state = MbState::Allocated { wlen: wlen + total };
        Ok(())
    }

    /// Queue a gather write onto an async context in 1 MiB chunks
    pub(crate) fn write_async(&self, iovs: &[&[u8]], ctx: &mut MblockWriteCtx) -> Result<()> {
        let total: u64 = iovs.iter().map(|v| v.len() as u64).sum();
        if total == 0 {
            return Ok(());
        }
        if total % u64::from(OPTIMAL_WRSZ) != 0 {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                format_args!("write length {total} not a multiple of {OPTIMAL_WRSZ}"),
            ));
        }

        let mut state = self.state.lock();
        let wlen = match *state {
            MbState::Allocated { wlen } => wlen,
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mblock {} is not writable", self.oid),
                ));
            }
        };
        if wlen + total > self.capacity {
            return Err(Error::with_detail(
                ErrorKind::NoSpace,
                format_args!("mblock {} extent exhausted", self.oid),
            ));
        }

        let file = self.extent()?;
        let mut off = wlen;
        for iov in iovs {
            for chunk in iov.chunks(ASYNC_CHUNK) {
                ctx.submit(file.clone(), off, chunk.to_vec())?;
                off += chunk.len() as u64;
            }
        }

        // The queue preserves issue order; durability is settled at flush
        *state = MbState::Allocated { wlen: wlen + total };
        Ok(())
    }

    /// Page-aligned read; spans at most to the written end
    pub(crate) fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset % device::page_size() as u64 != 0 {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                format_args!("read offset {offset} not page aligned"),
            ));
        }

        let wlen = {
            let state = self.state.lock();
            match *state {
                MbState::Committed { wlen } => wlen,
                _ => {
                    return Err(Error::with_detail(
                        ErrorKind::InvalidState,
                        format_args!("mblock {} is not committed", self.oid),
                    ));
                }
            }
        };
        if offset > wlen {
            return Err(Error::with_detail(
                ErrorKind::OutOfRange,
                format_args!("read offset {offset} beyond mblock end {wlen}"),
            ));
        }

        let n = buf.len().min((wlen - offset) as usize);
        if n == 0 {
            return Ok(0);
        }
        let file = self.extent()?;
        let got = file.read_at(offset, &mut buf[..n])?;
        if got != n {
            return Err(Error::with_detail(
                ErrorKind::Io,
                format_args!("short read on mblock {}", self.oid),
            ));
        }
        Ok(n)
    }

    /// Seal the mblock: allocated → committed
    pub(crate) fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        let wlen = match *state {
            MbState::Allocated { wlen } => wlen,
            MbState::Committed { .. } => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mblock {} already committed", self.oid),
                ));
            }
            MbState::Dropped => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mblock {} was destroyed", self.oid),
                ));
            }
        };

        self.extent()?.sync()?;
        ObjectMeta {
            oid: self.oid,
            state: OmState::Committed,
            wlen,
            capacity: self.capacity,
        }
        .store(&self.om_path)?;

        *state = MbState::Committed { wlen };
        Ok(())
    }

    /// Return an uncommitted extent: allocated → aborted
    pub(crate) fn abort(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            MbState::Allocated { .. } => {}
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mblock {} is not abortable", self.oid),
                ));
            }
        }
        *state = MbState::Dropped;
        drop(state);
        self.unlink();
        Ok(())
    }

    /// Return a committed extent: committed → deleted
    pub(crate) fn delete(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            MbState::Committed { .. } => {}
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mblock {} is not committed", self.oid),
                ));
            }
        }
        if self.maps.load(Ordering::Acquire) > 0 {
            debug!(oid = %self.oid, "delete rejected, mblock is mapped");
            return Err(Error::with_detail(
                ErrorKind::Busy,
                format_args!("mblock {} is pinned by an mcache map", self.oid),
            ));
        }
        *state = MbState::Dropped;
        drop(state);
        self.unlink();
        Ok(())
    }

    fn unlink(&self) {
        self.file.lock().take();
        let _ = std::fs::remove_file(&self.data_path);
        let _ = std::fs::remove_file(&self.om_path);
    }

    pub(crate) fn props(&self) -> MblockProps {
        let (wlen, committed) = match *self.state.lock() {
            MbState::Allocated { wlen } => (wlen, false),
            MbState::Committed { wlen } => (wlen, true),
            MbState::Dropped => (0, false),
        };
        MblockProps {
            oid: self.oid,
            mclass: self.mclass,
            capacity: self.capacity,
            wlen,
            committed,
            optimal_wrsz: OPTIMAL_WRSZ,
            page_size: device::page_size() as u32,
        }
    }

    /// Pin for an mcache map; requires the committed state.
    /// Returns the written length and the extent file to map.
    pub(crate) fn pin_for_map(&self) -> Result<(u64, Arc<ExtentFile>)> {
        let state = self.state.lock();
        let wlen = match *state {
            MbState::Committed { wlen } => wlen,
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mblock {} is not committed", self.oid),
                ));
            }
        };
        // Pin under the state lock so delete cannot slip in between
        self.maps.fetch_add(1, Ordering::AcqRel);
        drop(state);

        match self.extent() {
            Ok(file) => Ok((wlen, file)),
            Err(e) => {
                self.maps.fetch_sub(1, Ordering::AcqRel);
                Err(e)
            }
        }
    }

    /// Release an mcache pin
    pub(crate) fn unpin_map(&self) {
        self.maps.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Caller-held reference to an mblock; the ref is released on drop
#[derive(Debug)]
pub struct MblockHandle {
    pub(crate) obj: Arc<MblockObj>,
}

impl MblockHandle {
    pub(crate) fn new(obj: Arc<MblockObj>) -> Self {
        obj.ref_inc();
        Self { obj }
    }

    /// Object ID of the referenced mblock
    #[must_use]
    pub fn oid(&self) -> Oid {
        self.obj.oid()
    }
}

impl Drop for MblockHandle {
    fn drop(&mut self) {
        self.obj.ref_dec();
    }
}
