//! MDC engine: a metadata container over a pair of mlogs
//!
//! An MDC presents one logical append-only record stream backed by two
//! mlogs used in alternation. Compaction start/end markers (reserved frame
//! types, invisible to readers) delimit a rewritten stream on the standby
//! log; generation numbers plus a validity scan decide on open which log is
//! authoritative, including after a crash anywhere between cstart and cend.
//!
//! Two open paths exist instead of a runtime locking flag: [`Mdc`] wraps
//! the engine in a mutex and serializes every operation; [`MdcUnsync`]
//! exposes the same operations through `&mut self`, so single-threaded
//! access is enforced by the borrow checker rather than warranted by the
//! caller.

use crate::mlog::{MlogHandle, MlogObj, MlogOpenFlags, RecType};
use mpool_common::{Error, ErrorKind, Oid, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of scanning one constituent mlog during recovery
struct LogScan {
    empty: bool,
    valid: bool,
}

/// Validity per the recovery rules: empty, an untouched pre-compaction
/// record run, or a complete cstart…cend compaction with trailing appends
fn scan_validity(types: &[RecType]) -> LogScan {
    if types.is_empty() {
        return LogScan {
            empty: true,
            valid: true,
        };
    }

    let cstarts = types.iter().filter(|t| **t == RecType::CStart).count();
    let cends = types.iter().filter(|t| **t == RecType::CEnd).count();

    let valid = if cstarts == 0 && cends == 0 {
        true // pre-first-compaction regime
    } else {
        types[0] == RecType::CStart && cstarts == 1 && cends == 1
    };

    LogScan {
        empty: false,
        valid,
    }
}

/// The engine proper; callers reach it through [`Mdc`] or [`MdcUnsync`]
#[derive(Debug)]
pub(crate) struct MdcCore {
    logs: [MlogHandle; 2],
    active: usize,
    compacting: bool,
    closed: bool,
}

impl MdcCore {
    /// Open both mlogs, run recovery, and return an engine positioned on
    /// the authoritative log
    pub(crate) fn open(log1: Arc<MlogObj>, log2: Arc<MlogObj>) -> Result<Self> {
        log1.try_acquire_owner()?;
        if let Err(err) = log2.try_acquire_owner() {
            log1.release_owner();
            return Err(err);
        }

        match Self::recover(&log1, &log2) {
            Ok(active) => Ok(Self {
                logs: [MlogHandle::new(log1), MlogHandle::new(log2)],
                active,
                compacting: false,
                closed: false,
            }),
            Err(err) => {
                let _ = log1.close();
                let _ = log2.close();
                log1.release_owner();
                log2.release_owner();
                Err(err)
            }
        }
    }

    /// Pick the authoritative mlog. A valid non-empty log always beats an
    /// empty one; generations only break ties between two non-empty logs.
    fn recover(log1: &Arc<MlogObj>, log2: &Arc<MlogObj>) -> Result<usize> {
        let flags = MlogOpenFlags::default();
        let gen1 = log1.open(flags)?;
        let gen2 = match log2.open(flags) {
            Ok(r#gen) => r#gen,
            Err(err) => {
                let _ = log1.close();
                return Err(err);
            }
        };

        let scan1 = scan_validity(&log1.scan_types()?);
        let scan2 = scan_validity(&log2.scan_types()?);

        let corrupt = || {
            Error::with_detail(
                ErrorKind::Corrupt,
                format_args!(
                    "mdc pair {}/{} has no authoritative mlog",
                    log1.oid(),
                    log2.oid()
                ),
            )
        };

        let active = match (scan1.empty, scan2.empty) {
            (true, true) => 0,
            (false, true) => {
                if scan1.valid {
                    0
                } else {
                    warn!(oid = %log1.oid(), "discarding interrupted compaction");
                    log1.erase(0)?;
                    1
                }
            }
            (true, false) => {
                if scan2.valid {
                    1
                } else {
                    warn!(oid = %log2.oid(), "discarding interrupted compaction");
                    log2.erase(0)?;
                    0
                }
            }
            (false, false) => {
                if gen1 == gen2 {
                    match (scan1.valid, scan2.valid) {
                        (true, true) | (false, false) => return Err(corrupt()),
                        (true, false) => {
                            warn!(oid = %log2.oid(), "discarding interrupted compaction");
                            log2.erase(0)?;
                            0
                        }
                        (false, true) => {
                            warn!(oid = %log1.oid(), "discarding interrupted compaction");
                            log1.erase(0)?;
                            1
                        }
                    }
                } else {
                    let (cand, cand_scan, other, other_scan) = if gen1 > gen2 {
                        (0, &scan1, 1, &scan2)
                    } else {
                        (1, &scan2, 0, &scan1)
                    };
                    if cand_scan.valid {
                        cand
                    } else if other_scan.valid {
                        let loser = [log1, log2][cand];
                        warn!(oid = %loser.oid(), "discarding interrupted compaction");
                        loser.erase(0)?;
                        other
                    } else {
                        return Err(corrupt());
                    }
                }
            }
        };

        debug!(
            active = %[log1, log2][active].oid(),
            gen1, gen2, "mdc recovery complete"
        );

        [log1, log2][active].read_init()?;
        Ok(active)
    }

    fn active_log(&self) -> &Arc<MlogObj> {
        &self.logs[self.active].obj
    }

    pub(crate) fn oids(&self) -> (Oid, Oid) {
        (self.logs[0].oid(), self.logs[1].oid())
    }

    pub(crate) fn append(&mut self, iovs: &[&[u8]], sync: bool) -> Result<()> {
        self.active_log().append(iovs, sync)
    }

    /// Next user record; markers are consumed silently
    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        loop {
            match self.active_log().read_next_typed(buf)? {
                None => return Ok(None),
                Some((rtype, _)) if rtype.is_marker() => {}
                Some((_, n)) => return Ok(Some(n)),
            }
        }
    }

    pub(crate) fn rewind(&mut self) -> Result<()> {
        self.active_log().read_init()
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.active_log().flush()
    }

    /// Bytes used in the active mlog, framing included
    pub(crate) fn usage(&self) -> Result<u64> {
        self.active_log().len()
    }

    /// Begin compaction: swap the pair, erase the new active above the old
    /// generation, and write the start marker
    pub(crate) fn cstart(&mut self) -> Result<()> {
        if self.compacting {
            return Err(Error::with_detail(
                ErrorKind::InvalidState,
                "compaction already in progress",
            ));
        }

        let standby = 1 - self.active;
        let old_gen = self.active_log().r#gen()?;

        self.logs[standby].obj.erase(old_gen + 1)?;
        self.logs[standby]
            .obj
            .append_rec(RecType::CStart, &[], true)?;

        self.active = standby;
        self.compacting = true;
        debug!(active = %self.active_log().oid(), "compaction started");
        Ok(())
    }

    /// Finish compaction: durable end marker, then reclaim the former active
    pub(crate) fn cend(&mut self) -> Result<()> {
        if !self.compacting {
            return Err(Error::with_detail(
                ErrorKind::InvalidState,
                "no compaction in progress",
            ));
        }

        self.active_log().append_rec(RecType::CEnd, &[], true)?;
        self.compacting = false;

        // Space reclaim only; a failure here is repaired by the next cstart
        let former = 1 - self.active;
        if let Err(err) = self.logs[former].obj.erase(0) {
            warn!(oid = %self.logs[former].oid(), %err, "deferred reclaim of former active");
        }
        debug!(active = %self.active_log().oid(), "compaction finished");
        Ok(())
    }

    pub(crate) fn close(mut self) -> Result<()> {
        self.closed = true;
        self.close_logs()
    }

    fn close_logs(&mut self) -> Result<()> {
        let mut first_err = None;
        for handle in &self.logs {
            if let Err(err) = handle.obj.flush().and_then(|()| handle.obj.close()) {
                first_err.get_or_insert(err);
            }
            handle.obj.release_owner();
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for MdcCore {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.close_logs();
        }
    }
}

/// MDC handle with internal serialization; safe to share across threads
pub struct Mdc {
    inner: Mutex<MdcCore>,
}

impl Mdc {
    pub(crate) fn new(core: MdcCore) -> Self {
        Self {
            inner: Mutex::new(core),
        }
    }

    /// The constituent mlog IDs
    #[must_use]
    pub fn oids(&self) -> (Oid, Oid) {
        self.inner.lock().oids()
    }

    /// Append one record to the active mlog
    pub fn append(&self, data: &[u8], sync: bool) -> Result<()> {
        self.inner.lock().append(&[data], sync)
    }

    /// Append one record gathered from multiple buffers
    pub fn append_vec(&self, iovs: &[&[u8]], sync: bool) -> Result<()> {
        self.inner.lock().append(iovs, sync)
    }

    /// Read the next user record; `None` at end of stream
    pub fn read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        self.inner.lock().read(buf)
    }

    /// Position the read cursor at the first record of the authoritative log
    pub fn rewind(&self) -> Result<()> {
        self.inner.lock().rewind()
    }

    /// Flush the active mlog
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().sync()
    }

    /// Estimated bytes used in the active mlog, framing included
    pub fn usage(&self) -> Result<u64> {
        self.inner.lock().usage()
    }

    /// Begin compaction
    pub fn cstart(&self) -> Result<()> {
        self.inner.lock().cstart()
    }

    /// End compaction
    pub fn cend(&self) -> Result<()> {
        self.inner.lock().cend()
    }

    /// Flush and close both mlogs
    pub fn close(self) -> Result<()> {
        self.inner.into_inner().close()
    }
}

/// MDC handle without internal locking; operations take `&mut self`, so
/// concurrent use is rejected at compile time
pub struct MdcUnsync {
    core: MdcCore,
}

impl MdcUnsync {
    pub(crate) fn new(core: MdcCore) -> Self {
        Self { core }
    }

    /// The constituent mlog IDs
    #[must_use]
    pub fn oids(&self) -> (Oid, Oid) {
        self.core.oids()
    }

    /// Append one record to the active mlog
    pub fn append(&mut self, data: &[u8], sync: bool) -> Result<()> {
        self.core.append(&[data], sync)
    }

    /// Append one record gathered from multiple buffers
    pub fn append_vec(&mut self, iovs: &[&[u8]], sync: bool) -> Result<()> {
        self.core.append(iovs, sync)
    }

    /// Read the next user record; `None` at end of stream
    pub fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        self.core.read(buf)
    }

    /// Position the read cursor at the first record of the authoritative log
    pub fn rewind(&mut self) -> Result<()> {
        self.core.rewind()
    }

    /// Flush the active mlog
    pub fn sync(&mut self) -> Result<()> {
        self.core.sync()
    }

    /// Estimated bytes used in the active mlog, framing included
    pub fn usage(&self) -> Result<u64> {
        self.core.usage()
    }

    /// Begin compaction
    pub fn cstart(&mut self) -> Result<()> {
        self.core.cstart()
    }

    /// End compaction
    pub fn cend(&mut self) -> Result<()> {
        self.core.cend()
    }

    /// Flush and close both mlogs
    pub fn close(self) -> Result<()> {
        self.core.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device;
    use mpool_common::{MediaClass, ObjectKind};
    use std::path::Path;
    use tempfile::tempdir;

    fn make_pair(dir: &Path) -> (Arc<MlogObj>, Arc<MlogObj>) {
        let mut logs = Vec::new();
        for serial in 1..=2u64 {
            let oid = Oid::compose(ObjectKind::Mlog, MediaClass::Capacity, false, serial);
            let log = MlogObj::create(
                oid,
                MediaClass::Capacity,
                4 * 1024 * 1024,
                device::data_path(dir, oid),
                device::meta_path(dir, oid),
                false,
            )
            .unwrap();
            log.commit().unwrap();
            logs.push(Arc::new(log));
        }
        let log2 = logs.pop().unwrap();
        (logs.pop().unwrap(), log2)
    }

    fn read_all(core: &mut MdcCore) -> Vec<Vec<u8>> {
        core.rewind().unwrap();
        let mut out = Vec::new();
        let mut buf = vec![0u8; 4096];
        while let Some(n) = core.read(&mut buf).unwrap() {
            out.push(buf[..n].to_vec());
        }
        out
    }

    #[test]
    fn fresh_pair_is_empty() {
        let dir = tempdir().unwrap();
        let (l1, l2) = make_pair(dir.path());
        let mut core = MdcCore::open(l1, l2).unwrap();
        assert!(read_all(&mut core).is_empty());
        core.close().unwrap();
    }

    #[test]
    fn records_survive_close_open() {
        let dir = tempdir().unwrap();
        let (l1, l2) = make_pair(dir.path());

        let mut core = MdcCore::open(l1.clone(), l2.clone()).unwrap();
        core.append(&[b"alpha"], true).unwrap();
        core.append(&[b"beta"], false).unwrap();
        core.close().unwrap();

        let mut core = MdcCore::open(l1, l2).unwrap();
        assert_eq!(read_all(&mut core), vec![b"alpha".to_vec(), b"beta".to_vec()]);
        core.close().unwrap();
    }

    #[test]
    fn compaction_replaces_stream() {
        let dir = tempdir().unwrap();
        let (l1, l2) = make_pair(dir.path());

        let mut core = MdcCore::open(l1.clone(), l2.clone()).unwrap();
        for _ in 0..100 {
            core.append(&[&[b'x'; 128]], false).unwrap();
        }
        core.sync().unwrap();

        core.cstart().unwrap();
        for _ in 0..10 {
            core.append(&[&[b'y'; 128]], false).unwrap();
        }
        core.cend().unwrap();
        core.close().unwrap();

        let mut core = MdcCore::open(l1, l2).unwrap();
        let records = read_all(&mut core);
        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| r == &vec![b'y'; 128]));
        core.close().unwrap();
    }

    #[test]
    fn crash_before_cend_recovers_old_stream() {
        let dir = tempdir().unwrap();
        let (l1, l2) = make_pair(dir.path());

        let mut core = MdcCore::open(l1.clone(), l2.clone()).unwrap();
        for _ in 0..5 {
            core.append(&[b"old"], true).unwrap();
        }
        core.cstart().unwrap();
        for _ in 0..3 {
            core.append(&[b"new"], true).unwrap();
        }
        // Crash: no cend. Dropping the core closes the logs but leaves the
        // standby with a start marker and no end marker.
        drop(core);

        let mut core = MdcCore::open(l1.clone(), l2.clone()).unwrap();
        let records = read_all(&mut core);
        assert_eq!(records, vec![b"old".to_vec(); 5]);
        core.close().unwrap();

        // The recovery outcome is stable across further reopens
        let mut core = MdcCore::open(l1, l2).unwrap();
        assert_eq!(read_all(&mut core), vec![b"old".to_vec(); 5]);
        core.close().unwrap();
    }

    #[test]
    fn compaction_can_repeat() {
        let dir = tempdir().unwrap();
        let (l1, l2) = make_pair(dir.path());

        let mut core = MdcCore::open(l1.clone(), l2.clone()).unwrap();
        for round in 0..3u8 {
            core.append(&[&[round; 16]], true).unwrap();
            core.cstart().unwrap();
            core.append(&[&[round + 10; 16]], true).unwrap();
            core.cend().unwrap();
        }
        core.close().unwrap();

        let mut core = MdcCore::open(l1, l2).unwrap();
        assert_eq!(read_all(&mut core), vec![vec![12u8; 16]]);
        core.close().unwrap();
    }

    #[test]
    fn append_during_compaction_lands_in_new_active() {
        let dir = tempdir().unwrap();
        let (l1, l2) = make_pair(dir.path());

        let mut core = MdcCore::open(l1.clone(), l2.clone()).unwrap();
        core.append(&[b"before"], true).unwrap();
        core.cstart().unwrap();
        core.append(&[b"compacted"], true).unwrap();
        core.append(&[b"tail"], true).unwrap();
        core.cend().unwrap();

        assert_eq!(
            read_all(&mut core),
            vec![b"compacted".to_vec(), b"tail".to_vec()]
        );
        core.close().unwrap();
    }

    #[test]
    fn cend_without_cstart_is_invalid() {
        let dir = tempdir().unwrap();
        let (l1, l2) = make_pair(dir.path());
        let mut core = MdcCore::open(l1, l2).unwrap();
        assert_eq!(core.cend().unwrap_err().kind(), ErrorKind::InvalidState);
        core.close().unwrap();
    }

    #[test]
    fn second_open_is_busy() {
        let dir = tempdir().unwrap();
        let (l1, l2) = make_pair(dir.path());

        let core = MdcCore::open(l1.clone(), l2.clone()).unwrap();
        let err = MdcCore::open(l1.clone(), l2.clone()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);

        core.close().unwrap();
        MdcCore::open(l1, l2).unwrap().close().unwrap();
    }

    #[test]
    fn usage_counts_framing() {
        let dir = tempdir().unwrap();
        let (l1, l2) = make_pair(dir.path());
        let mut core = MdcCore::open(l1, l2).unwrap();
        assert_eq!(core.usage().unwrap(), 0);

        core.append(&[b"1234"], true).unwrap();
        assert_eq!(
            core.usage().unwrap(),
            (crate::mlog::REC_OVERHEAD + 4) as u64
        );
        core.close().unwrap();
    }
}
