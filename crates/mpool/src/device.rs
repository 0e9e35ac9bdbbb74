//! Extent file I/O for the file-backed device layer
//!
//! Every persistent object is backed by one extent file plus one sidecar
//! meta file inside its media-class directory. [`ExtentFile`] wraps the data
//! file with positioned reads/writes and optional direct I/O; misaligned
//! direct writes are staged through an [`AlignedBuffer`].

use mpool_common::{Error, ErrorKind, Oid, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Optimal write alignment reported in mblock properties; write lengths must
/// be multiples of this and read offsets must be multiples of the page size
pub const OPTIMAL_WRSZ: u32 = 4096;

/// System page size, cached after the first query
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 { sz as usize } else { 4096 }
    })
}

/// Round `v` up to the next page boundary
pub fn page_align(v: u64) -> u64 {
    let page = page_size() as u64;
    v.div_ceil(page) * page
}

/// Extent data file path for an object
pub fn data_path(class_dir: &Path, oid: Oid) -> PathBuf {
    let ext = match oid.kind() {
        Some(mpool_common::ObjectKind::Mlog) => "mlog",
        _ => "mblk",
    };
    class_dir.join(format!("oid-{:016x}.{ext}", oid.as_u64()))
}

/// Sidecar object-meta path for an object
pub fn meta_path(class_dir: &Path, oid: Oid) -> PathBuf {
    class_dir.join(format!("oid-{:016x}.om", oid.as_u64()))
}

/// A single object's backing file
#[derive(Debug)]
pub struct ExtentFile {
    file: File,
    path: PathBuf,
    direct: bool,
    read_only: bool,
}

impl ExtentFile {
    /// Create a fresh extent file; the object must not already exist
    pub fn create(path: impl AsRef<Path>, direct: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true).write(true).create_new(true);

        #[cfg(target_os = "linux")]
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options.open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::with_detail(ErrorKind::AlreadyExists, format_args!("{}", path.display()))
            } else {
                Error::with_detail(ErrorKind::Io, format_args!("create {}: {e}", path.display()))
            }
        })?;

        Ok(Self {
            file,
            path,
            direct,
            read_only: false,
        })
    }

    /// Open an existing extent file
    pub fn open(path: impl AsRef<Path>, read_only: bool, direct: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }

        #[cfg(target_os = "linux")]
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }

        let file = options.open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::with_detail(ErrorKind::NotFound, format_args!("{}", path.display()))
            } else {
                Error::with_detail(ErrorKind::Io, format_args!("open {}: {e}", path.display()))
            }
        })?;

        Ok(Self {
            file,
            path,
            direct,
            read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file length
    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// The underlying descriptor, for mmap
    pub(crate) fn as_file(&self) -> &File {
        &self.file
    }

    /// Read up to `buf.len()` bytes at `offset`; short only at end of file
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    /// Write all of `buf` at `offset`
    pub fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::with_detail(
                ErrorKind::InvalidState,
                format_args!("{} is read-only", self.path.display()),
            ));
        }

        if self.direct {
            // O_DIRECT needs memory alignment the caller's buffer may lack
            let mut staged = AlignedBuffer::new(buf.len());
            staged.copy_from(buf);
            self.file.write_all_at(&staged.as_slice()[..buf.len()], offset)?;
        } else {
            self.file.write_all_at(buf, offset)?;
        }
        Ok(())
    }

    /// Truncate (or extend) the file to `len` bytes
    pub fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Flush data and metadata to stable storage
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Flush data only
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Page-aligned scratch buffer for direct I/O and header pages
pub struct AlignedBuffer {
    data: Vec<u8>,
    alignment: usize,
}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of at least `size` bytes, page aligned
    pub fn new(size: usize) -> Self {
        Self::with_alignment(size, page_size())
    }

    pub fn with_alignment(size: usize, alignment: usize) -> Self {
        use std::alloc::{Layout, alloc_zeroed};

        let aligned_size = size.div_ceil(alignment).max(1) * alignment;
        let layout = Layout::from_size_align(aligned_size, alignment)
            .expect("invalid layout for aligned buffer");

        let data = unsafe {
            let ptr = alloc_zeroed(layout);
            assert!(!ptr.is_null(), "aligned buffer allocation failed");
            Vec::from_raw_parts(ptr, aligned_size, aligned_size)
        };

        Self { data, alignment }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy `src` into the buffer, zero-filling the tail
    pub fn copy_from(&mut self, src: &[u8]) {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
        if n < self.data.len() {
            self.data[n..].fill(0);
        }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        use std::alloc::{Layout, dealloc};

        if !self.data.is_empty() {
            let layout = Layout::from_size_align(self.data.capacity(), self.alignment)
                .expect("invalid layout for deallocation");
            unsafe {
                let ptr = self.data.as_mut_ptr();
                std::mem::forget(std::mem::take(&mut self.data));
                dealloc(ptr, layout);
            }
        }
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpool_common::{MediaClass, ObjectKind};
    use tempfile::tempdir;

    #[test]
    fn aligned_buffer_rounds_up() {
        let mut buf = AlignedBuffer::new(100);
        assert_eq!(buf.len() % page_size(), 0);
        buf.copy_from(b"hello");
        assert_eq!(&buf.as_slice()[..5], b"hello");
        assert_eq!(buf.as_slice()[5], 0);
    }

    #[test]
    fn extent_create_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("oid-0001.mblk");

        let file = ExtentFile::create(&path, false).unwrap();
        file.write_all_at(0, b"extent data").unwrap();
        file.sync().unwrap();

        let file = ExtentFile::open(&path, true, false).unwrap();
        let mut buf = [0u8; 11];
        let n = file.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"extent data");
    }

    #[test]
    fn extent_create_collides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("oid-0002.mblk");

        ExtentFile::create(&path, false).unwrap();
        let err = ExtentFile::create(&path, false).unwrap_err();
        assert_eq!(err.kind(), mpool_common::ErrorKind::AlreadyExists);
    }

    #[test]
    fn read_only_rejects_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("oid-0003.mblk");
        ExtentFile::create(&path, false).unwrap();

        let ro = ExtentFile::open(&path, true, false).unwrap();
        let err = ro.write_all_at(0, b"nope").unwrap_err();
        assert_eq!(err.kind(), mpool_common::ErrorKind::InvalidState);
    }

    #[test]
    fn object_paths_carry_kind() {
        let dir = PathBuf::from("/pool/capacity");
        let mb = mpool_common::Oid::compose(ObjectKind::Mblock, MediaClass::Capacity, false, 7);
        let ml = mpool_common::Oid::compose(ObjectKind::Mlog, MediaClass::Capacity, false, 8);
        assert!(data_path(&dir, mb).to_string_lossy().ends_with(".mblk"));
        assert!(data_path(&dir, ml).to_string_lossy().ends_with(".mlog"));
        assert!(meta_path(&dir, mb).to_string_lossy().ends_with(".om"));
    }
}
