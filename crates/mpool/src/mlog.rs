//! Mlog manager
//!
//! An mlog is a commit-once append-only record log with a generation
//! counter. On disk it is a 4 KiB header page followed by framed records:
//!
//! ```text
//! +--------+------+--------+---------+--------+
//! | Magic  | Type | Length | Payload | CRC32C |
//! | 4B     | 1B   | 4B     | var     | 4B     |
//! +--------+------+--------+---------+--------+
//! ```
//!
//! The type tag distinguishes user records from the reserved compaction
//! markers the MDC engine writes; markers are framing-level, never payload
//! content. Opening scans the record region and stops at the first frame
//! that fails validation, so a record torn by a crash either appears whole
//! or not at all. Erase truncates the record region and bumps the
//! generation to at least the caller-supplied floor.

use crate::device::{self, AlignedBuffer, ExtentFile};
use crate::meta::{ObjectMeta, OmState};
use bytes::{Buf, BufMut};
use mpool_common::{Error, ErrorKind, MediaClass, MlogProps, Oid, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Size of the header page preceding the record region
pub(crate) const MLOG_HDR_SIZE: u64 = 4096;

const HDR_MAGIC: [u8; 8] = *b"MPMLOG1\0";
const HDR_VERSION: u32 = 1;
const HDR_LEN: usize = 40;

/// Record frame magic
const REC_MAGIC: u32 = 0x4D4C_4F47; // "MLOG"

/// Frame header: magic + type + length
pub(crate) const REC_HDR_SIZE: usize = 9;

/// Full framing overhead per record
pub(crate) const REC_OVERHEAD: usize = REC_HDR_SIZE + 4;

/// Record type tag carried in the frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecType {
    /// Caller data
    User = 1,
    /// Compaction-start marker (MDC internal)
    CStart = 2,
    /// Compaction-end marker (MDC internal)
    CEnd = 3,
}

impl RecType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::User),
            2 => Some(Self::CStart),
            3 => Some(Self::CEnd),
            _ => None,
        }
    }

    pub(crate) fn is_marker(self) -> bool {
        !matches!(self, Self::User)
    }
}

/// Open flags for an mlog
///
/// Mlog operations always serialize internally on the descriptor: handles
/// from find-get can alias the same log, so the per-object lock is not
/// optional. Callers wanting lock-free single-threaded access get it at the
/// MDC layer through [`crate::MdcUnsync`], whose `&mut` methods make the
/// exclusivity a compile-time fact.
#[derive(Clone, Copy, Debug, Default)]
pub struct MlogOpenFlags {
    /// Reads only; appends and erase are rejected
    pub rdonly: bool,
}

struct LogHeader {
    oid: u64,
    r#gen: u64,
    captgt: u64,
}

impl LogHeader {
    fn to_page(&self) -> AlignedBuffer {
        let mut raw = [0u8; HDR_LEN];
        {
            let mut cursor = &mut raw[..];
            cursor.put_slice(&HDR_MAGIC);
            cursor.put_u32_le(HDR_VERSION);
            cursor.put_u64_le(self.oid);
            cursor.put_u64_le(self.r#gen);
            cursor.put_u64_le(self.captgt);
        }
        let crc = crc32c::crc32c(&raw[..HDR_LEN - 4]);
        raw[HDR_LEN - 4..].copy_from_slice(&crc.to_le_bytes());

        let mut page = AlignedBuffer::new(MLOG_HDR_SIZE as usize);
        page.copy_from(&raw);
        page
    }

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HDR_LEN {
            return Err(Error::with_detail(ErrorKind::Corrupt, "mlog header too small"));
        }
        let stored = u32::from_le_bytes(data[HDR_LEN - 4..HDR_LEN].try_into().unwrap());
        if crc32c::crc32c(&data[..HDR_LEN - 4]) != stored {
            return Err(Error::with_detail(
                ErrorKind::Corrupt,
                "mlog header checksum mismatch",
            ));
        }

        let mut buf = data;
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != HDR_MAGIC {
            return Err(Error::with_detail(ErrorKind::Corrupt, "bad mlog header magic"));
        }
        let version = buf.get_u32_le();
        if version != HDR_VERSION {
            return Err(Error::with_detail(
                ErrorKind::Corrupt,
                format_args!("unsupported mlog header version {version}"),
            ));
        }
        Ok(Self {
            oid: buf.get_u64_le(),
            r#gen: buf.get_u64_le(),
            captgt: buf.get_u64_le(),
        })
    }
}

fn write_header(file: &ExtentFile, oid: Oid, r#gen: u64, captgt: u64) -> Result<()> {
    let header = LogHeader {
        oid: oid.as_u64(),
        r#gen,
        captgt,
    };
    file.write_all_at(0, header.to_page().as_slice())?;
    file.sync()?;
    Ok(())
}

fn read_header(file: &ExtentFile) -> Result<LogHeader> {
    let mut page = AlignedBuffer::new(MLOG_HDR_SIZE as usize);
    let n = file.read_at(0, page.as_mut_slice())?;
    if n < HDR_LEN {
        return Err(Error::with_detail(ErrorKind::Corrupt, "truncated mlog header"));
    }
    LogHeader::parse(page.as_slice())
}

/// Build one framed record from a gather list
fn encode_record(rtype: RecType, iovs: &[&[u8]]) -> Vec<u8> {
    let payload: usize = iovs.iter().map(|v| v.len()).sum();
    let mut buf = Vec::with_capacity(REC_OVERHEAD + payload);
    buf.put_u32_le(REC_MAGIC);
    buf.put_u8(rtype as u8);
    buf.put_u32_le(payload as u32);
    for iov in iovs {
        buf.put_slice(iov);
    }
    let crc = crc32c::crc32c(&buf);
    buf.put_u32_le(crc);
    buf
}

/// Parse a frame header at `off`; `None` past `end`
fn frame_at(file: &ExtentFile, off: u64, end: u64) -> Result<Option<(RecType, u32)>> {
    if off >= end {
        return Ok(None);
    }
    let mut hdr = [0u8; REC_HDR_SIZE];
    if file.read_at(off, &mut hdr)? != REC_HDR_SIZE {
        return Err(Error::with_detail(ErrorKind::Corrupt, "truncated mlog record"));
    }
    let magic = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
    if magic != REC_MAGIC {
        return Err(Error::with_detail(ErrorKind::Corrupt, "bad mlog record magic"));
    }
    let rtype = RecType::from_u8(hdr[4])
        .ok_or_else(|| Error::with_detail(ErrorKind::Corrupt, "bad mlog record type"))?;
    let len = u32::from_le_bytes(hdr[5..9].try_into().unwrap());
    Ok(Some((rtype, len)))
}

/// Find the end of the valid record region; torn tail frames are cut off
fn scan_end(file: &ExtentFile) -> Result<u64> {
    let flen = file.len()?;
    let mut off = MLOG_HDR_SIZE;

    while off + REC_OVERHEAD as u64 <= flen {
        let mut hdr = [0u8; REC_HDR_SIZE];
        if file.read_at(off, &mut hdr)? != REC_HDR_SIZE {
            break;
        }
        let magic = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
        if magic != REC_MAGIC || RecType::from_u8(hdr[4]).is_none() {
            break;
        }
        let len = u32::from_le_bytes(hdr[5..9].try_into().unwrap()) as u64;
        let frame = REC_OVERHEAD as u64 + len;
        if off + frame > flen {
            break;
        }

        let mut rest = vec![0u8; len as usize + 4];
        if file.read_at(off + REC_HDR_SIZE as u64, &mut rest)? != rest.len() {
            break;
        }
        let stored = u32::from_le_bytes(rest[len as usize..].try_into().unwrap());
        let crc = crc32c::crc32c_append(crc32c::crc32c(&hdr), &rest[..len as usize]);
        if crc != stored {
            break;
        }
        off += frame;
    }

    Ok(off)
}

#[derive(Debug)]
struct OpenLog {
    file: Arc<ExtentFile>,
    r#gen: u64,
    rdonly: bool,
    /// End of the record region, including buffered appends
    append_off: u64,
    /// Read cursor; `None` until read-init
    cursor: Option<u64>,
    /// Unsynced appends outstanding
    dirty: bool,
}

#[derive(Debug)]
enum LogState {
    Allocated { r#gen: u64 },
    Committed { r#gen: u64 },
    Open(OpenLog),
    Dropped,
}

/// Mlog descriptor
#[derive(Debug)]
pub(crate) struct MlogObj {
    oid: Oid,
    mclass: MediaClass,
    capacity: u64,
    data_path: PathBuf,
    om_path: PathBuf,
    direct: bool,
    refs: AtomicU32,
    /// Exclusively owned by an open MDC
    owned: AtomicBool,
    state: Mutex<LogState>,
}

impl MlogObj {
    /// Allocate a fresh mlog: create the extent, write header gen 1
    pub(crate) fn create(
        oid: Oid,
        mclass: MediaClass,
        capacity: u64,
        data_path: PathBuf,
        om_path: PathBuf,
        direct: bool,
    ) -> Result<Self> {
        let file = ExtentFile::create(&data_path, direct)?;
        write_header(&file, oid, 1, capacity)?;
        ObjectMeta {
            oid,
            state: OmState::Allocated,
            wlen: 0,
            capacity,
        }
        .store(&om_path)?;

        Ok(Self {
            oid,
            mclass,
            capacity,
            data_path,
            om_path,
            direct,
            refs: AtomicU32::new(0),
            owned: AtomicBool::new(false),
            state: Mutex::new(LogState::Allocated { r#gen: 1 }),
        })
    }

    /// Rebuild a committed descriptor from its open-scan sidecar
    pub(crate) fn from_scan(
        oid: Oid,
        mclass: MediaClass,
        om: &ObjectMeta,
        data_path: PathBuf,
        om_path: PathBuf,
        direct: bool,
    ) -> Result<Self> {
        let file = ExtentFile::open(&data_path, true, false)?;
        let header = read_header(&file)?;
        if header.oid != oid.as_u64() {
            return Err(Error::with_detail(
                ErrorKind::Corrupt,
                format_args!("mlog {oid} header names {:#018x}", header.oid),
            ));
        }

        Ok(Self {
            oid,
            mclass,
            capacity: om.capacity,
            data_path,
            om_path,
            direct,
            refs: AtomicU32::new(0),
            owned: AtomicBool::new(false),
            state: Mutex::new(LogState::Committed { r#gen: header.r#gen }),
        })
    }

    pub(crate) fn oid(&self) -> Oid {
        self.oid
    }

    pub(crate) fn mclass(&self) -> MediaClass {
        self.mclass
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

    /// Claim exclusive MDC ownership
    pub(crate) fn try_acquire_owner(&self) -> Result<()> {
        if self.owned.swap(true, Ordering::AcqRel) {
            return Err(Error::with_detail(
                ErrorKind::Busy,
                format_args!("mlog {} is owned by an open MDC", self.oid),
            ));
        }
        Ok(())
    }

    pub(crate) fn release_owner(&self) {
        self.owned.store(false, Ordering::Release);
    }

    pub(crate) fn is_owned(&self) -> bool {
        self.owned.load(Ordering::Acquire)
    }

    /// Seal the mlog: allocated → committed
    pub(crate) fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        let r#gen = match *state {
            LogState::Allocated { r#gen } => r#gen,
            LogState::Committed { .. } => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mlog {} already committed", self.oid),
                ));
            }
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mlog {} is not committable", self.oid),
                ));
            }
        };

        ObjectMeta {
            oid: self.oid,
            state: OmState::Committed,
            wlen: 0,
            capacity: self.capacity,
        }
        .store(&self.om_path)?;

        *state = LogState::Committed { r#gen };
        Ok(())
    }

    /// Return an uncommitted mlog: allocated → aborted
    pub(crate) fn abort(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            LogState::Allocated { .. } => {}
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mlog {} is not abortable", self.oid),
                ));
            }
        }
        *state = LogState::Dropped;
        drop(state);
        self.unlink();
        Ok(())
    }

    /// Delete a committed, closed mlog
    pub(crate) fn delete(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            LogState::Committed { .. } => {}
            LogState::Open(_) => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mlog {} is open; close it first", self.oid),
                ));
            }
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mlog {} is not committed", self.oid),
                ));
            }
        }
        if self.is_owned() {
            return Err(Error::with_detail(
                ErrorKind::Busy,
                format_args!("mlog {} is owned by an open MDC", self.oid),
            ));
        }
        *state = LogState::Dropped;
        drop(state);
        self.unlink();
        Ok(())
    }

    fn unlink(&self) {
        let _ = std::fs::remove_file(&self.data_path);
        let _ = std::fs::remove_file(&self.om_path);
    }

    /// Open for append/read; returns the current generation
    pub(crate) fn open(&self, flags: MlogOpenFlags) -> Result<u64> {
        let mut state = self.state.lock();
        match *state {
            LogState::Committed { .. } => {}
            LogState::Open(_) => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mlog {} is already open", self.oid),
                ));
            }
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mlog {} is not committed", self.oid),
                ));
            }
        }

        let file = Arc::new(ExtentFile::open(&self.data_path, false, self.direct)?);
        let header = read_header(&file)?;
        if header.oid != self.oid.as_u64() {
            return Err(Error::with_detail(
                ErrorKind::Corrupt,
                format_args!("mlog {} header names {:#018x}", self.oid, header.oid),
            ));
        }
        let append_off = scan_end(&file)?;

        let r#gen = header.r#gen;
        *state = LogState::Open(OpenLog {
            file,
            r#gen,
            rdonly: flags.rdonly,
            append_off,
            cursor: None,
            dirty: false,
        });
        Ok(r#gen)
    }

    /// Drain buffered appends and close
    pub(crate) fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        match &mut *state {
            LogState::Open(open) => {
                if open.dirty {
                    open.file.sync_data()?;
                }
                let r#gen = open.r#gen;
                *state = LogState::Committed { r#gen };
                Ok(())
            }
            _ => Err(Error::with_detail(
                ErrorKind::InvalidState,
                format_args!("mlog {} is not open", self.oid),
            )),
        }
    }

    /// Append one record of the given type from a gather list
    pub(crate) fn append_rec(&self, rtype: RecType, iovs: &[&[u8]], sync: bool) -> Result<()> {
        let mut state = self.state.lock();
        let open = match &mut *state {
            LogState::Open(open) => open,
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mlog {} is not open", self.oid),
                ));
            }
        };
        if open.rdonly {
            return Err(Error::with_detail(
                ErrorKind::InvalidState,
                format_args!("mlog {} is open read-only", self.oid),
            ));
        }

        let frame = encode_record(rtype, iovs);
        let used = open.append_off - MLOG_HDR_SIZE;
        if used + frame.len() as u64 > self.capacity {
            return Err(Error::with_detail(
                ErrorKind::NoSpace,
                format_args!("mlog {} capacity target exhausted", self.oid),
            ));
        }

        open.file.write_all_at(open.append_off, &frame)?;
        if sync {
            open.file.sync_data()?;
            open.dirty = false;
        } else {
            open.dirty = true;
        }
        open.append_off += frame.len() as u64;
        Ok(())
    }

    /// Append one user record
    pub(crate) fn append(&self, iovs: &[&[u8]], sync: bool) -> Result<()> {
        self.append_rec(RecType::User, iovs, sync)
    }

    /// Position the read cursor at the first record
    pub(crate) fn read_init(&self) -> Result<()> {
        let mut state = self.state.lock();
        match &mut *state {
            LogState::Open(open) => {
                open.cursor = Some(MLOG_HDR_SIZE);
                Ok(())
            }
            _ => Err(Error::with_detail(
                ErrorKind::InvalidState,
                format_args!("mlog {} is not open", self.oid),
            )),
        }
    }

    /// Read the next record with its frame type; `None` at end of log.
    /// A short buffer yields *overflow* with the required length and does
    /// not advance the cursor.
    pub(crate) fn read_next_typed(&self, buf: &mut [u8]) -> Result<Option<(RecType, usize)>> {
        let mut state = self.state.lock();
        let open = match &mut *state {
            LogState::Open(open) => open,
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mlog {} is not open", self.oid),
                ));
            }
        };
        let off = open.cursor.ok_or_else(|| {
            Error::with_detail(
                ErrorKind::InvalidState,
                format_args!("mlog {} read cursor not initialized", self.oid),
            )
        })?;

        match Self::read_record_at(open, off, buf)? {
            Some((rtype, len, frame)) => {
                open.cursor = Some(off + frame);
                Ok(Some((rtype, len)))
            }
            None => Ok(None),
        }
    }

    /// Read the record at `off` into `buf`; returns (type, payload, frame len)
    fn read_record_at(
        open: &OpenLog,
        off: u64,
        buf: &mut [u8],
    ) -> Result<Option<(RecType, usize, u64)>> {
        let Some((rtype, len)) = frame_at(&open.file, off, open.append_off)? else {
            return Ok(None);
        };
        let len = len as usize;
        if len > buf.len() {
            return Err(Error::overflow(len as u64));
        }

        let payload_off = off + REC_HDR_SIZE as u64;
        if open.file.read_at(payload_off, &mut buf[..len])? != len {
            return Err(Error::with_detail(ErrorKind::Corrupt, "truncated mlog record"));
        }
        let mut crc_buf = [0u8; 4];
        if open.file.read_at(payload_off + len as u64, &mut crc_buf)? != 4 {
            return Err(Error::with_detail(ErrorKind::Corrupt, "truncated mlog record"));
        }

        let mut hdr = [0u8; REC_HDR_SIZE];
        hdr[0..4].copy_from_slice(&REC_MAGIC.to_le_bytes());
        hdr[4] = rtype as u8;
        hdr[5..9].copy_from_slice(&(len as u32).to_le_bytes());
        let crc = crc32c::crc32c_append(crc32c::crc32c(&hdr), &buf[..len]);
        if crc != u32::from_le_bytes(crc_buf) {
            return Err(Error::with_detail(
                ErrorKind::Corrupt,
                "mlog record checksum mismatch",
            ));
        }

        Ok(Some((rtype, len, (REC_OVERHEAD + len) as u64)))
    }

    /// Read the next record's payload; `None` at end of log
    pub(crate) fn read_next(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        Ok(self.read_next_typed(buf)?.map(|(_, n)| n))
    }

    /// Skip `skip` payload bytes of whole records, then read the next one.
    /// The skip must land exactly on a record boundary. Nothing advances on
    /// failure, including *overflow* of the target record.
    pub(crate) fn seek_read_next(&self, skip: u64, buf: &mut [u8]) -> Result<Option<usize>> {
        let mut state = self.state.lock();
        let open = match &mut *state {
            LogState::Open(open) => open,
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mlog {} is not open", self.oid),
                ));
            }
        };
        let start = open.cursor.ok_or_else(|| {
            Error::with_detail(
                ErrorKind::InvalidState,
                format_args!("mlog {} read cursor not initialized", self.oid),
            )
        })?;

        let mut off = start;
        let mut skipped = 0u64;
        while skipped < skip {
            let Some((_, len)) = frame_at(&open.file, off, open.append_off)? else {
                return Err(Error::with_detail(
                    ErrorKind::InvalidArgument,
                    format_args!("skip {skip} runs past the end of the log"),
                ));
            };
            skipped += u64::from(len);
            off += (REC_OVERHEAD + len as usize) as u64;
        }
        if skipped != skip {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                format_args!("skip {skip} does not land on a record boundary"),
            ));
        }

        match Self::read_record_at(open, off, buf)? {
            Some((_, len, frame)) => {
                open.cursor = Some(off + frame);
                Ok(Some(len))
            }
            None => {
                open.cursor = Some(off);
                Ok(None)
            }
        }
    }

    /// Force buffered appends to stable storage
    pub(crate) fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        match &mut *state {
            LogState::Open(open) => {
                if open.dirty {
                    open.file.sync_data()?;
                    open.dirty = false;
                }
                Ok(())
            }
            _ => Err(Error::with_detail(
                ErrorKind::InvalidState,
                format_args!("mlog {} is not open", self.oid),
            )),
        }
    }

    /// Logical length in bytes, framing included
    pub(crate) fn len(&self) -> Result<u64> {
        let state = self.state.lock();
        match &*state {
            LogState::Open(open) => Ok(open.append_off - MLOG_HDR_SIZE),
            _ => Err(Error::with_detail(
                ErrorKind::InvalidState,
                format_args!("mlog {} is not open", self.oid),
            )),
        }
    }

    pub(crate) fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Discard all records; the new generation is `max(gen + 1, mingen)`
    pub(crate) fn erase(&self, mingen: u64) -> Result<u64> {
        let mut state = self.state.lock();
        match &mut *state {
            LogState::Open(open) => {
                if open.rdonly {
                    return Err(Error::with_detail(
                        ErrorKind::InvalidState,
                        format_args!("mlog {} is open read-only", self.oid),
                    ));
                }
                let newgen = (open.r#gen + 1).max(mingen);
                open.file.truncate(MLOG_HDR_SIZE)?;
                write_header(&open.file, self.oid, newgen, self.capacity)?;
                open.r#gen = newgen;
                open.append_off = MLOG_HDR_SIZE;
                open.cursor = None;
                open.dirty = false;
                Ok(newgen)
            }
            LogState::Committed { r#gen } => {
                let file = ExtentFile::open(&self.data_path, false, self.direct)?;
                let newgen = (*r#gen + 1).max(mingen);
                file.truncate(MLOG_HDR_SIZE)?;
                write_header(&file, self.oid, newgen, self.capacity)?;
                *state = LogState::Committed { r#gen: newgen };
                Ok(newgen)
            }
            _ => Err(Error::with_detail(
                ErrorKind::InvalidState,
                format_args!("mlog {} is not erasable", self.oid),
            )),
        }
    }

    /// Current generation
    pub(crate) fn r#gen(&self) -> Result<u64> {
        let state = self.state.lock();
        match &*state {
            LogState::Allocated { r#gen } | LogState::Committed { r#gen } => Ok(*r#gen),
            LogState::Open(open) => Ok(open.r#gen),
            LogState::Dropped => Err(Error::with_detail(
                ErrorKind::InvalidState,
                format_args!("mlog {} was destroyed", self.oid),
            )),
        }
    }

    pub(crate) fn props(&self) -> MlogProps {
        let state = self.state.lock();
        let (r#gen, committed) = match &*state {
            LogState::Allocated { r#gen } => (*r#gen, false),
            LogState::Committed { r#gen } => (*r#gen, true),
            LogState::Open(open) => (open.r#gen, true),
            LogState::Dropped => (0, false),
        };
        MlogProps {
            oid: self.oid,
            mclass: self.mclass,
            capacity: self.capacity,
            r#gen,
            committed,
        }
    }

    /// Frame-type sequence of the whole log; used by MDC recovery
    pub(crate) fn scan_types(&self) -> Result<Vec<RecType>> {
        let state = self.state.lock();
        let open = match &*state {
            LogState::Open(open) => open,
            _ => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidState,
                    format_args!("mlog {} is not open", self.oid),
                ));
            }
        };

        let mut types = Vec::new();
        let mut off = MLOG_HDR_SIZE;
        while let Some((rtype, len)) = frame_at(&open.file, off, open.append_off)? {
            types.push(rtype);
            off += (REC_OVERHEAD + len as usize) as u64;
        }
        Ok(types)
    }
}

/// Caller-held reference to an mlog; the ref is released on drop
#[derive(Debug)]
pub struct MlogHandle {
    pub(crate) obj: Arc<MlogObj>,
}

impl MlogHandle {
    pub(crate) fn new(obj: Arc<MlogObj>) -> Self {
        obj.ref_inc();
        Self { obj }
    }

    /// Object ID of the referenced mlog
    #[must_use]
    pub fn oid(&self) -> Oid {
        self.obj.oid()
    }
}

impl Drop for MlogHandle {
    fn drop(&mut self) {
        self.obj.ref_dec();
    }
}
