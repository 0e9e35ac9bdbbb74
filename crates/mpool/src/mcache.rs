//! Mcache maps: zero-copy page access to committed mblocks
//!
//! A map reserves one contiguous anonymous region sized for every requested
//! mblock, then maps each mblock's extent read-only at its fixed offset
//! inside the reservation. Page pointers handed out by getpages therefore
//! alias the same bytes a page-aligned read would return. Mapped mblocks
//! are pinned: delete fails with *busy* until the map is dropped.

use crate::device::{ExtentFile, page_align, page_size};
use crate::mblock::MblockObj;
use mpool_common::{Error, ErrorKind, MapAdvice, Result};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use tracing::debug;

fn advice_flag(advice: MapAdvice) -> libc::c_int {
    match advice {
        MapAdvice::Normal => libc::MADV_NORMAL,
        MapAdvice::Random => libc::MADV_RANDOM,
        MapAdvice::Sequential => libc::MADV_SEQUENTIAL,
        MapAdvice::WillNeed => libc::MADV_WILLNEED,
        MapAdvice::DontNeed => libc::MADV_DONTNEED,
    }
}

#[derive(Debug)]
struct MapEntry {
    obj: Arc<MblockObj>,
    /// Offset of this mblock's base within the region
    off: usize,
    /// Written (readable) length
    wlen: usize,
    /// Page-rounded mapped length
    map_len: usize,
}

/// A vector of committed mblocks bound into one virtual region
#[derive(Debug)]
pub struct McacheMap {
    base: *mut u8,
    total: usize,
    ents: Vec<MapEntry>,
    contiguous: bool,
    unmapped: bool,
}

// The mapping is read-only and the entry table is immutable after mmap.
unsafe impl Send for McacheMap {}
unsafe impl Sync for McacheMap {}

impl McacheMap {
    pub(crate) fn create(
        objs: Vec<Arc<MblockObj>>,
        advice: MapAdvice,
        ra_pages: u32,
    ) -> Result<Self> {
        if objs.is_empty() {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                "mcache map needs at least one mblock",
            ));
        }
        let page = page_size();

        // Pin everything up front; unwind on any failure
        let mut pinned: Vec<(Arc<MblockObj>, u64, Arc<ExtentFile>)> = Vec::new();
        for obj in objs {
            match obj.pin_for_map() {
                Ok((wlen, file)) => {
                    obj.ref_inc();
                    pinned.push((obj, wlen, file));
                }
                Err(err) => {
                    for (obj, _, _) in &pinned {
                        obj.ref_dec();
                        obj.unpin_map();
                    }
                    return Err(err);
                }
            }
        }

        let mut ents = Vec::with_capacity(pinned.len());
        let mut off = 0usize;
        for (obj, wlen, _) in &pinned {
            let map_len = page_align(*wlen) as usize;
            let wlen = *wlen as usize;
            ents.push(MapEntry {
                obj: obj.clone(),
                off,
                wlen,
                map_len,
            });
            off += map_len;
        }
        let total = off.max(page);

        let unpin_all = |ents: &[MapEntry]| {
            for ent in ents {
                ent.obj.ref_dec();
                ent.obj.unpin_map();
            }
        };

        // One PROT_NONE reservation keeps the whole map contiguous; each
        // extent is then fixed into place read-only.
        #[cfg(target_os = "linux")]
        let reserve_flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
        #[cfg(not(target_os = "linux"))]
        let reserve_flags = libc::MAP_PRIVATE | libc::MAP_ANON;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_NONE,
                reserve_flags,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unpin_all(&ents);
            return Err(Error::with_detail(
                ErrorKind::Io,
                format_args!("mcache reservation failed: {err}"),
            ));
        }
        let base = base.cast::<u8>();

        for (ent, (_, _, file)) in ents.iter().zip(&pinned) {
            if ent.map_len == 0 {
                continue;
            }
            let mapped = unsafe {
                libc::mmap(
                    base.add(ent.off).cast(),
                    ent.map_len,
                    libc::PROT_READ,
                    libc::MAP_SHARED | libc::MAP_FIXED,
                    file.as_file().as_raw_fd(),
                    0,
                )
            };
            if mapped == libc::MAP_FAILED {
                let err = io::Error::last_os_error();
                unsafe {
                    libc::munmap(base.cast(), total);
                }
                unpin_all(&ents);
                return Err(Error::with_detail(
                    ErrorKind::Io,
                    format_args!("mcache mmap of {} failed: {err}", ent.obj.oid()),
                ));
            }
        }

        let map = Self {
            base,
            total,
            ents,
            contiguous: true,
            unmapped: false,
        };

        // Route the coarse hint down to the pages; the read-ahead parameter
        // bounds how much an eager hint touches up front.
        match advice {
            MapAdvice::Normal => {}
            MapAdvice::WillNeed => {
                let span = (ra_pages as usize * page).min(map.total);
                map.madvise_raw(0, span, MapAdvice::WillNeed)?;
            }
            other => map.madvise_raw(0, map.total, other)?,
        }

        debug!(mblocks = map.ents.len(), bytes = map.total, "mcache map created");
        Ok(map)
    }

    /// Number of mblocks bound into the map
    #[must_use]
    pub fn mblock_count(&self) -> usize {
        self.ents.len()
    }

    /// Virtual base of mblock `mbidx`, as a readable slice of its written
    /// bytes; `None` if the index is unknown or the map is not contiguous
    #[must_use]
    pub fn getbase(&self, mbidx: usize) -> Option<&[u8]> {
        if !self.contiguous {
            return None;
        }
        let ent = self.ents.get(mbidx)?;
        Some(unsafe { std::slice::from_raw_parts(self.base.add(ent.off), ent.wlen) })
    }

    /// Resolve page-aligned byte offsets within one mblock to page slices
    pub fn getpages(&self, mbidx: usize, offsets: &[u64]) -> Result<Vec<&[u8]>> {
        let mut pages = Vec::with_capacity(offsets.len());
        for &offset in offsets {
            pages.push(self.page_at(mbidx, offset)?);
        }
        Ok(pages)
    }

    /// Resolve pages across multiple mblocks; the i-th offset is applied
    /// within the i-th mblock index
    pub fn getpagesv(&self, mbidxv: &[usize], offsets: &[u64]) -> Result<Vec<&[u8]>> {
        if mbidxv.len() != offsets.len() {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                "mblock index and offset vectors differ in length",
            ));
        }
        let mut pages = Vec::with_capacity(offsets.len());
        for (&mbidx, &offset) in mbidxv.iter().zip(offsets) {
            pages.push(self.page_at(mbidx, offset)?);
        }
        Ok(pages)
    }

    fn page_at(&self, mbidx: usize, offset: u64) -> Result<&[u8]> {
        let page = page_size() as u64;
        let ent = self.ents.get(mbidx).ok_or_else(|| {
            Error::with_detail(
                ErrorKind::NotFound,
                format_args!("no mblock at map index {mbidx}"),
            )
        })?;
        if offset % page != 0 {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                format_args!("offset {offset} not page aligned"),
            ));
        }
        if offset >= ent.map_len as u64 {
            return Err(Error::with_detail(
                ErrorKind::OutOfRange,
                format_args!("offset {offset} beyond mblock at map index {mbidx}"),
            ));
        }
        let off = ent.off + offset as usize;
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(off), page_size()) })
    }

    /// Page advice for a sub-range; `usize::MAX` length addresses from the
    /// given position to the end of the map, so `(0, 0, usize::MAX)`
    /// addresses the whole map
    pub fn madvise(
        &self,
        mbidx: usize,
        offset: u64,
        length: usize,
        advice: MapAdvice,
    ) -> Result<()> {
        let ent = self.ents.get(mbidx).ok_or_else(|| {
            Error::with_detail(
                ErrorKind::NotFound,
                format_args!("no mblock at map index {mbidx}"),
            )
        })?;
        if offset % page_size() as u64 != 0 {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                format_args!("offset {offset} not page aligned"),
            ));
        }
        if offset > ent.map_len as u64 {
            return Err(Error::with_detail(
                ErrorKind::OutOfRange,
                format_args!("offset {offset} beyond mblock at map index {mbidx}"),
            ));
        }

        let start = ent.off + offset as usize;
        let len = if length == usize::MAX {
            self.total - start
        } else {
            if start + length > self.total {
                return Err(Error::with_detail(
                    ErrorKind::OutOfRange,
                    format_args!("advice range runs past the map"),
                ));
            }
            length
        };
        self.madvise_raw(start, len, advice)
    }

    fn madvise_raw(&self, start: usize, len: usize, advice: MapAdvice) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let rc = unsafe { libc::madvise(self.base.add(start).cast(), len, advice_flag(advice)) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(Error::with_detail(
                ErrorKind::Io,
                format_args!("madvise failed: {err}"),
            ));
        }
        Ok(())
    }

    /// Ask the OS to drop resident pages
    pub fn purge(&self) -> Result<()> {
        self.madvise_raw(0, self.total, MapAdvice::DontNeed)
    }

    /// Resident and virtual set sizes, in pages
    pub fn mincore(&self) -> Result<(usize, usize)> {
        let page = page_size();
        let vss = self.total / page;
        let mut vec = vec![0u8; vss];
        let rc = unsafe { libc::mincore(self.base.cast(), self.total, vec.as_mut_ptr().cast()) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(Error::with_detail(
                ErrorKind::Io,
                format_args!("mincore failed: {err}"),
            ));
        }
        let rss = vec.iter().filter(|b| **b & 1 != 0).count();
        Ok((rss, vss))
    }

    /// Release the mapping and unpin the mblocks
    pub fn munmap(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.unmapped {
            return Ok(());
        }
        self.unmapped = true;

        let rc = unsafe { libc::munmap(self.base.cast(), self.total) };
        for ent in &self.ents {
            ent.obj.ref_dec();
            ent.obj.unpin_map();
        }
        if rc != 0 {
            let err = io::Error::last_os_error();
            return Err(Error::with_detail(
                ErrorKind::Io,
                format_args!("munmap failed: {err}"),
            ));
        }
        Ok(())
    }
}

impl Drop for McacheMap {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device;
    use crate::meta::{ObjectMeta, OmState};
    use mpool_common::{MediaClass, ObjectKind, Oid};
    use std::path::Path;
    use tempfile::tempdir;

    fn committed_mblock(dir: &Path, serial: u64, data: &[u8]) -> Arc<MblockObj> {
        let oid = Oid::compose(ObjectKind::Mblock, MediaClass::Capacity, false, serial);
        let data_path = device::data_path(dir, oid);
        let om_path = device::meta_path(dir, oid);
        let file = Arc::new(ExtentFile::create(&data_path, false).unwrap());
        ObjectMeta {
            oid,
            state: OmState::Allocated,
            wlen: 0,
            capacity: 1 << 20,
        }
        .store(&om_path)
        .unwrap();
        let obj = Arc::new(MblockObj::new_allocated(
            oid,
            MediaClass::Capacity,
            false,
            1 << 20,
            data_path,
            om_path,
            false,
            file,
        ));
        if !data.is_empty() {
            obj.write_sync(&[data]).unwrap();
        }
        obj.commit().unwrap();
        obj
    }

    #[test]
    fn getbase_aliases_read_bytes() {
        let dir = tempdir().unwrap();
        let data = vec![0x5au8; 8192];
        let obj = committed_mblock(dir.path(), 1, &data);

        let map = McacheMap::create(vec![obj.clone()], MapAdvice::Normal, 128).unwrap();
        let base = map.getbase(0).unwrap();
        assert_eq!(base.len(), 8192);
        assert_eq!(base, &data[..]);

        let mut via_read = vec![0u8; 8192];
        obj.read(&mut via_read, 0).unwrap();
        assert_eq!(base, &via_read[..]);
    }

    #[test]
    fn getpages_resolves_distinct_pages() {
        let dir = tempdir().unwrap();
        let page = page_size();
        let mut data = vec![1u8; page];
        data.extend(std::iter::repeat_n(2u8, page));
        let obj = committed_mblock(dir.path(), 1, &data);

        let map = McacheMap::create(vec![obj], MapAdvice::Normal, 128).unwrap();
        let pages = map.getpages(0, &[0, page as u64]).unwrap();
        assert_eq!(pages.len(), 2);
        assert_ne!(pages[0].as_ptr(), pages[1].as_ptr());
        assert!(pages[0].iter().all(|&b| b == 1));
        assert!(pages[1].iter().all(|&b| b == 2));
    }

    #[test]
    fn getpagesv_spans_mblocks() {
        let dir = tempdir().unwrap();
        let page = page_size();
        let a = committed_mblock(dir.path(), 1, &vec![7u8; page]);
        let b = committed_mblock(dir.path(), 2, &vec![8u8; page]);

        let map = McacheMap::create(vec![a, b], MapAdvice::Random, 128).unwrap();
        let pages = map.getpagesv(&[0, 1], &[0, 0]).unwrap();
        assert!(pages[0].iter().all(|&v| v == 7));
        assert!(pages[1].iter().all(|&v| v == 8));
    }

    #[test]
    fn misaligned_and_out_of_range_offsets() {
        let dir = tempdir().unwrap();
        let obj = committed_mblock(dir.path(), 1, &vec![0u8; page_size()]);
        let map = McacheMap::create(vec![obj], MapAdvice::Normal, 128).unwrap();

        assert_eq!(
            map.getpages(0, &[1]).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            map.getpages(0, &[16 * page_size() as u64]).unwrap_err().kind(),
            ErrorKind::OutOfRange
        );
        assert_eq!(map.getpages(9, &[0]).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(map.getbase(9).is_none());
    }

    #[test]
    fn mapped_mblock_rejects_delete_until_unmap() {
        let dir = tempdir().unwrap();
        let obj = committed_mblock(dir.path(), 1, &vec![3u8; page_size()]);

        let map = McacheMap::create(vec![obj.clone()], MapAdvice::Normal, 128).unwrap();
        assert_eq!(obj.delete().unwrap_err().kind(), ErrorKind::Busy);

        map.munmap().unwrap();
        obj.delete().unwrap();
    }

    #[test]
    fn purge_and_mincore() {
        let dir = tempdir().unwrap();
        let page = page_size();
        let obj = committed_mblock(dir.path(), 1, &vec![9u8; 4 * page]);

        let map = McacheMap::create(vec![obj], MapAdvice::WillNeed, 2).unwrap();
        let (_, vss) = map.mincore().unwrap();
        assert_eq!(vss, 4);

        // Touch everything, then drop it again
        let base = map.getbase(0).unwrap();
        let sum: u64 = base.iter().map(|&b| u64::from(b)).sum();
        assert_eq!(sum, 9 * 4 * page as u64);
        let (rss, _) = map.mincore().unwrap();
        assert!(rss > 0);

        map.purge().unwrap();
        map.madvise(0, 0, usize::MAX, MapAdvice::Sequential).unwrap();
    }

    #[test]
    fn uncommitted_mblock_cannot_be_mapped() {
        let dir = tempdir().unwrap();
        let oid = Oid::compose(ObjectKind::Mblock, MediaClass::Capacity, false, 50);
        let data_path = device::data_path(dir.path(), oid);
        let file = Arc::new(ExtentFile::create(&data_path, false).unwrap());
        let obj = Arc::new(MblockObj::new_allocated(
            oid,
            MediaClass::Capacity,
            false,
            1 << 20,
            data_path,
            device::meta_path(dir.path(), oid),
            false,
            file,
        ));

        let err = McacheMap::create(vec![obj], MapAdvice::Normal, 128).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
