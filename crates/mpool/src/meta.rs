//! On-disk metadata layout
//!
//! Pool layout:
//! ```text
//! <dir>/<name>/
//!     mpool.meta        4KB - magic, version, UUID, params, class table, CRC32C
//!     capacity/         media-class directory
//!         oid-<hex>.mblk|.mlog   extent data
//!         oid-<hex>.om           object meta sidecar
//!     staging/          (present once the class is added)
//! ```
//!
//! Object state must survive reopen, so every object carries a fixed-size
//! sidecar recording its lifecycle state and written length. Objects whose
//! sidecar still says *allocated* at pool open are leftovers from a crash or
//! unclean close and are reclaimed during the open scan.

use bytes::{Buf, BufMut, BytesMut};
use mpool_common::config::{MclassConfig, MpoolParams};
use mpool_common::{Error, ErrorKind, MediaClass, Oid, Result};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Pool meta magic
pub const POOL_META_MAGIC: [u8; 8] = *b"MPOOLSB1";

/// Pool meta format version
pub const POOL_META_VERSION: u32 = 1;

/// Pool meta file size on disk (page padded)
pub const POOL_META_SIZE: usize = 4096;

/// Pool meta file name
pub const POOL_META_FILE: &str = "mpool.meta";

/// Pool superblock: identity, resolved parameters, media-class table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolMeta {
    /// Pool UUID assigned at create
    pub uuid: Uuid,
    /// Pool name; must match the directory name
    pub name: String,
    /// Resolved (sentinel-free where defaults apply) parameters
    pub params: MpoolParams,
    /// Root MDC mlog pair; zero until the root MDC is committed
    pub root_mdc: (u64, u64),
    /// Configured media classes
    pub mclasses: Vec<(MediaClass, MclassConfig)>,
}

impl PoolMeta {
    /// Serialize to the padded on-disk page
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(POOL_META_SIZE);

        buf.put_slice(&POOL_META_MAGIC);
        buf.put_u32_le(POOL_META_VERSION);
        // Content length backpatched below, once known
        let hlen_at = buf.len();
        buf.put_u32_le(0);

        buf.put_slice(self.uuid.as_bytes());

        buf.put_u32_le(self.params.uid);
        buf.put_u32_le(self.params.gid);
        buf.put_u32_le(self.params.mode);
        buf.put_u8(self.params.spare_cap_pct);
        buf.put_u8(self.params.spare_stg_pct);
        buf.put_u32_le(self.params.ra_pages);
        buf.put_u64_le(self.params.mdc0_cap);
        buf.put_u64_le(self.params.mdcn_cap);
        buf.put_u32_le(self.params.mdc_cnt);

        buf.put_u64_le(self.root_mdc.0);
        buf.put_u64_le(self.root_mdc.1);

        put_str(&mut buf, &self.name)?;
        put_str(&mut buf, &self.params.label)?;

        buf.put_u8(self.mclasses.len() as u8);
        for (mclass, cfg) in &self.mclasses {
            buf.put_u8(*mclass as u8);
            buf.put_u64_le(cfg.extent_size);
            buf.put_u64_le(cfg.total);
        }

        let hlen = buf.len() as u32;
        buf[hlen_at..hlen_at + 4].copy_from_slice(&hlen.to_le_bytes());

        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);

        if buf.len() > POOL_META_SIZE {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                "pool meta exceeds its page",
            ));
        }
        buf.resize(POOL_META_SIZE, 0);
        Ok(buf.to_vec())
    }

    /// Parse and verify the on-disk page
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(Error::with_detail(ErrorKind::Corrupt, "pool meta too small"));
        }

        let mut buf = data;

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != POOL_META_MAGIC {
            return Err(Error::with_detail(ErrorKind::Corrupt, "bad pool meta magic"));
        }

        let version = buf.get_u32_le();
        if version != POOL_META_VERSION {
            return Err(Error::with_detail(
                ErrorKind::Corrupt,
                format_args!("unsupported pool meta version {version}"),
            ));
        }

        let hlen = buf.get_u32_le() as usize;
        if hlen + 4 > data.len() || hlen < 16 {
            return Err(Error::with_detail(ErrorKind::Corrupt, "bad pool meta length"));
        }
        let stored_crc = u32::from_le_bytes(data[hlen..hlen + 4].try_into().unwrap());
        if crc32c::crc32c(&data[..hlen]) != stored_crc {
            return Err(Error::with_detail(
                ErrorKind::Corrupt,
                "pool meta checksum mismatch",
            ));
        }

        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);
        let uuid = Uuid::from_bytes(uuid_bytes);

        let mut params = MpoolParams::init();
        params.uid = buf.get_u32_le();
        params.gid = buf.get_u32_le();
        params.mode = buf.get_u32_le();
        params.spare_cap_pct = buf.get_u8();
        params.spare_stg_pct = buf.get_u8();
        params.ra_pages = buf.get_u32_le();
        params.mdc0_cap = buf.get_u64_le();
        params.mdcn_cap = buf.get_u64_le();
        params.mdc_cnt = buf.get_u32_le();

        let root_mdc = (buf.get_u64_le(), buf.get_u64_le());

        let name = get_str(&mut buf)?;
        params.label = get_str(&mut buf)?;

        let nclass = buf.get_u8() as usize;
        let mut mclasses = Vec::with_capacity(nclass);
        for _ in 0..nclass {
            let mclass = MediaClass::from_u8(buf.get_u8()).ok_or_else(|| {
                Error::with_detail(ErrorKind::Corrupt, "unknown media class in pool meta")
            })?;
            let extent_size = buf.get_u64_le();
            let total = buf.get_u64_le();
            mclasses.push((mclass, MclassConfig { extent_size, total }));
        }

        Ok(Self {
            uuid,
            name,
            params,
            root_mdc,
            mclasses,
        })
    }

    /// Write the meta page in place and sync
    pub fn store(&self, pool_dir: &Path) -> Result<()> {
        let path = pool_dir.join(POOL_META_FILE);
        let bytes = self.to_bytes()?;
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        std::os::unix::fs::FileExt::write_all_at(&file, &bytes, 0)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read and verify the meta page
    pub fn load(pool_dir: &Path) -> Result<Self> {
        let path = pool_dir.join(POOL_META_FILE);
        let data = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::with_detail(
                    ErrorKind::NotFound,
                    format_args!("no pool at {}", pool_dir.display()),
                )
            } else {
                e.into()
            }
        })?;
        Self::from_bytes(&data)
    }
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(Error::with_detail(ErrorKind::InvalidArgument, "string too long"));
    }
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(Error::with_detail(ErrorKind::Corrupt, "truncated string"));
    }
    let len = buf.get_u16_le() as usize;
    if buf.remaining() < len {
        return Err(Error::with_detail(ErrorKind::Corrupt, "truncated string"));
    }
    let s = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| Error::with_detail(ErrorKind::Corrupt, "non-utf8 string"))?;
    buf.advance(len);
    Ok(s)
}

/// Durable lifecycle state recorded in an object sidecar
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OmState {
    /// Reserved but not yet committed; reclaimed at pool open
    Allocated = 1,
    /// Committed; survives reopen
    Committed = 2,
}

impl OmState {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Allocated),
            2 => Some(Self::Committed),
            _ => None,
        }
    }
}

/// Fixed-size sidecar meta written next to every extent file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectMeta {
    pub oid: Oid,
    pub state: OmState,
    /// Bytes written (mblocks); zero for mlogs, whose length is scan-derived
    pub wlen: u64,
    /// Extent capacity (mblocks) or capacity target (mlogs)
    pub capacity: u64,
}

impl ObjectMeta {
    /// Sidecar magic
    pub const MAGIC: u32 = 0x4D50_4F4D; // "MPOM"

    /// Sidecar format version
    pub const VERSION: u32 = 1;

    /// Serialized size in bytes
    pub const SIZE: usize = 40;

    const CRC_OFFSET: usize = Self::SIZE - 4;

    /// Serialize to the fixed sidecar image
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        {
            let mut cursor = &mut buf[..];
            cursor.put_u32_le(Self::MAGIC);
            cursor.put_u32_le(Self::VERSION);
            cursor.put_u64_le(self.oid.as_u64());
            cursor.put_u8(self.state as u8);
            cursor.put_slice(&[0u8; 3]);
            cursor.put_u64_le(self.wlen);
            cursor.put_u64_le(self.capacity);
        }
        let crc = crc32c::crc32c(&buf[..Self::CRC_OFFSET]);
        buf[Self::CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse and verify a sidecar image
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::with_detail(ErrorKind::Corrupt, "object meta too small"));
        }

        let stored_crc = u32::from_le_bytes(data[Self::CRC_OFFSET..Self::SIZE].try_into().unwrap());
        if crc32c::crc32c(&data[..Self::CRC_OFFSET]) != stored_crc {
            return Err(Error::with_detail(
                ErrorKind::Corrupt,
                "object meta checksum mismatch",
            ));
        }

        let mut buf = data;
        let magic = buf.get_u32_le();
        if magic != Self::MAGIC {
            return Err(Error::with_detail(ErrorKind::Corrupt, "bad object meta magic"));
        }
        let version = buf.get_u32_le();
        if version != Self::VERSION {
            return Err(Error::with_detail(
                ErrorKind::Corrupt,
                format_args!("unsupported object meta version {version}"),
            ));
        }

        let oid = Oid::from(buf.get_u64_le());
        let state = OmState::from_u8(buf.get_u8())
            .ok_or_else(|| Error::with_detail(ErrorKind::Corrupt, "bad object meta state"))?;
        buf.advance(3);
        let wlen = buf.get_u64_le();
        let capacity = buf.get_u64_le();

        Ok(Self {
            oid,
            state,
            wlen,
            capacity,
        })
    }

    /// Write (or rewrite) the sidecar and sync it
    pub fn store(&self, path: &Path) -> Result<()> {
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        std::os::unix::fs::FileExt::write_all_at(&file, &self.to_bytes(), 0)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read and verify a sidecar
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Self::from_bytes(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpool_common::ObjectKind;

    fn sample_meta() -> PoolMeta {
        PoolMeta {
            uuid: Uuid::new_v4(),
            name: "p0".to_string(),
            params: MpoolParams {
                label: "bench".to_string(),
                ..MpoolParams::default()
            },
            root_mdc: (0x11, 0x22),
            mclasses: vec![(MediaClass::Capacity, MclassConfig::default())],
        }
    }

    #[test]
    fn pool_meta_roundtrip() {
        let meta = sample_meta();
        let bytes = meta.to_bytes().unwrap();
        assert_eq!(bytes.len(), POOL_META_SIZE);

        let parsed = PoolMeta::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn pool_meta_detects_corruption() {
        let meta = sample_meta();
        let mut bytes = meta.to_bytes().unwrap();
        bytes[40] ^= 0xff;
        let err = PoolMeta::from_bytes(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn object_meta_roundtrip() {
        let om = ObjectMeta {
            oid: Oid::compose(ObjectKind::Mblock, MediaClass::Capacity, false, 3),
            state: OmState::Committed,
            wlen: 8192,
            capacity: 32 * 1024 * 1024,
        };
        let bytes = om.to_bytes();
        let parsed = ObjectMeta::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, om);
    }

    #[test]
    fn object_meta_detects_corruption() {
        let om = ObjectMeta {
            oid: Oid::compose(ObjectKind::Mlog, MediaClass::Staging, true, 9),
            state: OmState::Allocated,
            wlen: 0,
            capacity: 1024 * 1024,
        };
        let mut bytes = om.to_bytes();
        bytes[9] ^= 0x01;
        assert!(ObjectMeta::from_bytes(&bytes).is_err());
    }

    #[test]
    fn pool_meta_store_load() {
        let dir = tempfile::tempdir().unwrap();
        let meta = sample_meta();
        meta.store(dir.path()).unwrap();
        let loaded = PoolMeta::load(dir.path()).unwrap();
        assert_eq!(loaded, meta);
    }
}
