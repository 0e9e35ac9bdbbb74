//! Pool handle and administrative surface
//!
//! A pool is a directory holding `mpool.meta`, one subdirectory per media
//! class, and the per-object extent and sidecar files. Open modes map to
//! `flock(2)` on a lock file under the configured runtime directory:
//! exclusive open conflicts with everything, shared opens conflict with
//! exclusive. Opening rebuilds the object registry by scanning the class
//! directories; never-committed leftovers from a crash are reclaimed there.

use crate::device::{self, ExtentFile};
use crate::mblock::{MblockHandle, MblockObj};
use crate::mcache::McacheMap;
use crate::mdc::{Mdc, MdcCore, MdcUnsync};
use crate::meta::{ObjectMeta, OmState, PoolMeta};
use crate::mlog::{MlogHandle, MlogObj, MlogOpenFlags};
use crate::registry::{Object, Registry};
use crate::writectx::MblockWriteCtx;
use mpool_common::config::{MclassConfig, MpoolConfig, MpoolParams, PCT_INVALID, U32_INVALID, U64_INVALID};
use mpool_common::{
    Error, ErrorKind, MapAdvice, MblockProps, MclassProps, MdcProps, MediaClass, MlogProps,
    ObjectKind, Oid, PoolProps, PoolUsage, Result,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pool open flags; the default is a shared read-write open
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolOpenFlags {
    /// Exclusive open: all other opens fail *busy*, and this open fails
    /// *busy* if the pool is already open shared
    pub excl: bool,
    /// Reject allocations and parameter changes through this handle
    pub rdonly: bool,
}

#[derive(Debug)]
struct MclassState {
    cfg: MclassConfig,
    used: AtomicU64,
}

#[derive(Debug)]
struct PoolCore {
    name: String,
    dir: PathBuf,
    uuid: Uuid,
    direct: bool,
    rdonly: bool,
    lock: File,
    params: RwLock<MpoolParams>,
    root_mdc: RwLock<(u64, u64)>,
    mclasses: RwLock<HashMap<MediaClass, MclassState>>,
    registry: Registry,
    meta_store: Mutex<()>,
    closed: AtomicBool,
}

/// An open media pool
#[derive(Debug)]
pub struct Mpool {
    core: Arc<PoolCore>,
}

fn pool_dir(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 || name.contains(['/', '\0']) {
        return Err(Error::with_detail(
            ErrorKind::InvalidArgument,
            format_args!("bad pool name {name:?}"),
        ));
    }
    Ok(())
}

fn lock_path(cfg: &MpoolConfig, name: &str) -> PathBuf {
    cfg.rundir_root.join(format!("{name}.lock"))
}

/// Take the pool's rundir lock; `excl` maps to `LOCK_EX`, shared to `LOCK_SH`
fn acquire_lock(cfg: &MpoolConfig, name: &str, excl: bool) -> Result<File> {
    fs::create_dir_all(&cfg.rundir_root)?;
    let path = lock_path(cfg, name);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;

    let op = if excl { libc::LOCK_EX } else { libc::LOCK_SH } | libc::LOCK_NB;
    let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(Error::with_detail(
                ErrorKind::Busy,
                format_args!("pool {name} is open in a conflicting mode"),
            ));
        }
        return Err(err.into());
    }
    Ok(file)
}

/// True when some process holds the pool's rundir lock
fn is_active(cfg: &MpoolConfig, name: &str) -> bool {
    let Ok(file) = OpenOptions::new().read(true).open(lock_path(cfg, name)) else {
        return false;
    };
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        false
    } else {
        true
    }
}

fn apply_ownership(path: &Path, params: &MpoolParams) -> Result<()> {
    let uid = (params.uid != U32_INVALID).then_some(params.uid);
    let gid = (params.gid != U32_INVALID).then_some(params.gid);
    if uid.is_some() || gid.is_some() {
        std::os::unix::fs::chown(path, uid, gid)?;
    }
    if params.mode != U32_INVALID {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(params.mode))?;
    }
    Ok(())
}

impl Mpool {
    /// Create a pool: format the directory, the capacity class, and the
    /// root MDC (MDC-0), whose IDs are persisted in the pool meta
    pub fn create(
        dir: impl AsRef<Path>,
        name: &str,
        params: &MpoolParams,
        cfg: &MpoolConfig,
    ) -> Result<()> {
        validate_name(name)?;
        let pool_dir = pool_dir(dir.as_ref(), name);
        if pool_dir.join(crate::meta::POOL_META_FILE).exists() {
            return Err(Error::with_detail(
                ErrorKind::AlreadyExists,
                format_args!("pool {name} already exists"),
            ));
        }

        let params = params.merged(&MpoolParams::default());
        fs::create_dir_all(&pool_dir)?;
        fs::create_dir_all(pool_dir.join(MediaClass::Capacity.as_str()))?;
        apply_ownership(&pool_dir, &params)?;

        let meta = PoolMeta {
            uuid: Uuid::new_v4(),
            name: name.to_string(),
            params,
            root_mdc: (0, 0),
            mclasses: vec![(MediaClass::Capacity, MclassConfig::default())],
        };
        meta.store(&pool_dir)?;

        // Bootstrap MDC-0 through a regular open
        let pool = Self::open(dir.as_ref(), name, PoolOpenFlags::default(), cfg)?;
        let result = pool.bootstrap_root_mdc();
        pool.close()?;
        if let Err(err) = result {
            let _ = fs::remove_dir_all(&pool_dir);
            return Err(err);
        }

        info!(pool = name, "created");
        Ok(())
    }

    fn bootstrap_root_mdc(&self) -> Result<()> {
        let cap = self.core.params.read().mdc0_cap;
        let props = self.mdc_alloc(MediaClass::Capacity, cap)?;
        self.mdc_commit(props.oid1, props.oid2)?;

        *self.core.root_mdc.write() = (props.oid1.as_u64(), props.oid2.as_u64());
        self.store_meta()
    }

    /// Open a pool; `flags.excl` takes the exclusive lock
    pub fn open(
        dir: impl AsRef<Path>,
        name: &str,
        flags: PoolOpenFlags,
        cfg: &MpoolConfig,
    ) -> Result<Self> {
        validate_name(name)?;
        let pool_dir = pool_dir(dir.as_ref(), name);
        let meta = PoolMeta::load(&pool_dir)?;
        if meta.name != name {
            return Err(Error::with_detail(
                ErrorKind::Corrupt,
                format_args!("pool meta names {:?}, expected {name:?}", meta.name),
            ));
        }

        let lock = acquire_lock(cfg, name, flags.excl)?;

        let registry = Registry::new();
        let mut mclasses = HashMap::new();
        let mut max_serial = 0u64;

        for (mclass, class_cfg) in &meta.mclasses {
            let class_dir = pool_dir.join(mclass.as_str());
            let used = scan_class_dir(&class_dir, &registry, cfg.direct_io, &mut max_serial)?;
            mclasses.insert(
                *mclass,
                MclassState {
                    cfg: *class_cfg,
                    used: AtomicU64::new(used),
                },
            );
        }
        registry.seed_serial(max_serial + 1);

        debug!(pool = name, objects = registry.len(), "opened");
        Ok(Self {
            core: Arc::new(PoolCore {
                name: name.to_string(),
                dir: pool_dir,
                uuid: meta.uuid,
                direct: cfg.direct_io,
                rdonly: flags.rdonly,
                lock,
                params: RwLock::new(meta.params),
                root_mdc: RwLock::new(meta.root_mdc),
                mclasses: RwLock::new(mclasses),
                registry,
                meta_store: Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Close the pool; fails *busy* while object handles are outstanding
    pub fn close(&self) -> Result<()> {
        self.check_open()?;
        let refs = self.core.registry.outstanding_refs();
        if refs > 0 {
            return Err(Error::with_detail(
                ErrorKind::Busy,
                format_args!("pool {} has {refs} outstanding references", self.core.name),
            ));
        }
        self.core.closed.store(true, Ordering::Release);
        unsafe { libc::flock(self.core.lock.as_raw_fd(), libc::LOCK_UN) };
        debug!(pool = %self.core.name, "closed");
        Ok(())
    }

    /// Destroy an inactive pool: remove its directory and lock file
    pub fn destroy(dir: impl AsRef<Path>, name: &str, cfg: &MpoolConfig) -> Result<()> {
        validate_name(name)?;
        let pool_dir = pool_dir(dir.as_ref(), name);
        if !pool_dir.join(crate::meta::POOL_META_FILE).exists() {
            return Err(Error::with_detail(
                ErrorKind::NotFound,
                format_args!("no pool {name}"),
            ));
        }

        let lock = acquire_lock(cfg, name, true)?;
        fs::remove_dir_all(&pool_dir)?;
        drop(lock);
        let _ = fs::remove_file(lock_path(cfg, name));
        info!(pool = name, "destroyed");
        Ok(())
    }

    /// Rename an inactive pool
    pub fn rename(dir: impl AsRef<Path>, old: &str, new: &str, cfg: &MpoolConfig) -> Result<()> {
        validate_name(old)?;
        validate_name(new)?;
        let dir = dir.as_ref();
        if pool_dir(dir, new).exists() {
            return Err(Error::with_detail(
                ErrorKind::AlreadyExists,
                format_args!("pool {new} already exists"),
            ));
        }

        let lock = acquire_lock(cfg, old, true)?;
        let mut meta = PoolMeta::load(&pool_dir(dir, old))?;
        fs::rename(pool_dir(dir, old), pool_dir(dir, new))?;
        meta.name = new.to_string();
        meta.store(&pool_dir(dir, new))?;
        drop(lock);
        let _ = fs::remove_file(lock_path(cfg, old));
        info!(old, new, "pool renamed");
        Ok(())
    }

    /// Enumerate every pool under `dir`, active or not
    pub fn scan(dir: impl AsRef<Path>) -> Result<Vec<PoolProps>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(dir.as_ref())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match PoolMeta::load(&entry.path()) {
                Ok(meta) => found.push(props_from_meta(&meta)),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(dir = %entry.path().display(), %err, "skipping unreadable pool");
                }
            }
        }
        Ok(found)
    }

    /// Enumerate the pools under `dir` that some process has open
    pub fn list(dir: impl AsRef<Path>, cfg: &MpoolConfig) -> Result<Vec<PoolProps>> {
        Ok(Self::scan(dir)?
            .into_iter()
            .filter(|p| is_active(cfg, &p.name))
            .collect())
    }

    fn check_open(&self) -> Result<()> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(Error::with_detail(
                ErrorKind::InvalidState,
                format_args!("pool {} is closed", self.core.name),
            ));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.core.rdonly {
            return Err(Error::with_detail(
                ErrorKind::InvalidState,
                format_args!("pool {} is open read-only", self.core.name),
            ));
        }
        Ok(())
    }

    fn store_meta(&self) -> Result<()> {
        let _guard = self.core.meta_store.lock();
        let meta = PoolMeta {
            uuid: self.core.uuid,
            name: self.core.name.clone(),
            params: self.core.params.read().clone(),
            root_mdc: *self.core.root_mdc.read(),
            mclasses: {
                let classes = self.core.mclasses.read();
                let mut v: Vec<_> = classes.iter().map(|(c, s)| (*c, s.cfg)).collect();
                v.sort_by_key(|(c, _)| *c as u8);
                v
            },
        };
        meta.store(&self.core.dir)
    }

    /// Pool name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Current parameters
    pub fn params_get(&self) -> Result<MpoolParams> {
        self.check_open()?;
        Ok(self.core.params.read().clone())
    }

    /// Update mutable parameters (ownership, label, read-ahead). Capacity
    /// and MDC shape are fixed at create; changing them is rejected.
    pub fn params_set(&self, update: &MpoolParams) -> Result<()> {
        self.check_writable()?;
        {
            let current = self.core.params.read();
            let frozen = (update.spare_cap_pct != PCT_INVALID
                && update.spare_cap_pct != current.spare_cap_pct)
                || (update.spare_stg_pct != PCT_INVALID
                    && update.spare_stg_pct != current.spare_stg_pct)
                || (update.mdc0_cap != U64_INVALID && update.mdc0_cap != current.mdc0_cap)
                || (update.mdcn_cap != U64_INVALID && update.mdcn_cap != current.mdcn_cap)
                || (update.mdc_cnt != U32_INVALID && update.mdc_cnt != current.mdc_cnt);
            if frozen {
                return Err(Error::with_detail(
                    ErrorKind::InvalidArgument,
                    "spare ratios and MDC shape are fixed at create",
                ));
            }
        }

        let merged = {
            let mut params = self.core.params.write();
            let next = update.merged(&params);
            *params = next.clone();
            next
        };
        apply_ownership(&self.core.dir, &merged)?;
        self.store_meta()
    }

    /// Pool identity and per-class properties
    pub fn props_get(&self) -> Result<PoolProps> {
        self.check_open()?;
        let params = self.core.params.read();
        let classes = self.core.mclasses.read();
        let mut mclasses: Vec<MclassProps> = classes
            .iter()
            .map(|(mclass, state)| class_props(*mclass, state, &params))
            .collect();
        mclasses.sort_by_key(|p| p.mclass as u8);
        Ok(PoolProps {
            uuid: self.core.uuid,
            name: self.core.name.clone(),
            label: params.label.clone(),
            mclasses,
        })
    }

    /// Aggregate usage
    pub fn usage_get(&self) -> Result<PoolUsage> {
        self.check_open()?;
        let classes = self.core.mclasses.read();
        let mut usage = PoolUsage {
            objects: self.core.registry.len(),
            ..PoolUsage::default()
        };
        for state in classes.values() {
            usage.used += state.used.load(Ordering::Relaxed);
            usage.total = usage.total.saturating_add(state.cfg.total);
        }
        Ok(usage)
    }

    /// Add a media class to the pool
    pub fn mclass_add(&self, mclass: MediaClass, cfg: MclassConfig) -> Result<()> {
        self.check_writable()?;
        {
            let mut classes = self.core.mclasses.write();
            if classes.contains_key(&mclass) {
                return Err(Error::with_detail(
                    ErrorKind::AlreadyExists,
                    format_args!("media class {mclass} already configured"),
                ));
            }
            fs::create_dir_all(self.core.dir.join(mclass.as_str()))?;
            classes.insert(
                mclass,
                MclassState {
                    cfg,
                    used: AtomicU64::new(0),
                },
            );
        }
        self.store_meta()
    }

    /// Properties of one media class
    pub fn mclass_get(&self, mclass: MediaClass) -> Result<MclassProps> {
        self.check_open()?;
        let params = self.core.params.read();
        let classes = self.core.mclasses.read();
        let state = classes.get(&mclass).ok_or_else(|| {
            Error::with_detail(
                ErrorKind::NotFound,
                format_args!("media class {mclass} is not configured"),
            )
        })?;
        Ok(class_props(mclass, state, &params))
    }

    /// Properties of the device (directory) backing one media class
    pub fn devprops_get(&self, mclass: MediaClass) -> Result<MclassProps> {
        self.mclass_get(mclass)
    }

    fn class_dir(&self, mclass: MediaClass) -> PathBuf {
        self.core.dir.join(mclass.as_str())
    }

    /// Reserve `bytes` in a class; non-spare allocations may not dig into
    /// the spare reserve
    fn reserve(&self, mclass: MediaClass, bytes: u64, spare: bool) -> Result<()> {
        let params = self.core.params.read();
        let classes = self.core.mclasses.read();
        let state = classes.get(&mclass).ok_or_else(|| {
            Error::with_detail(
                ErrorKind::InvalidArgument,
                format_args!("media class {mclass} is not configured"),
            )
        })?;

        let total = state.cfg.total;
        let reserve = total / 100 * u64::from(params.spare_pct(mclass));
        let limit = if spare { total } else { total - reserve };

        let used = state.used.load(Ordering::Relaxed);
        match used.checked_add(bytes) {
            Some(next) if next <= limit => {
                state.used.fetch_add(bytes, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(Error::with_detail(
                ErrorKind::NoSpace,
                format_args!("media class {mclass} exhausted"),
            )),
        }
    }

    fn release(&self, mclass: MediaClass, bytes: u64) {
        if let Some(state) = self.core.mclasses.read().get(&mclass) {
            state.used.fetch_sub(bytes, Ordering::Relaxed);
        }
    }

    // ------------------------------------------------------------------
    // Mblock operations
    // ------------------------------------------------------------------

    /// Allocate an mblock extent
    pub fn mblock_alloc(
        &self,
        mclass: MediaClass,
        spare: bool,
    ) -> Result<(MblockHandle, MblockProps)> {
        self.check_writable()?;
        let extent_size = {
            let classes = self.core.mclasses.read();
            classes
                .get(&mclass)
                .ok_or_else(|| {
                    Error::with_detail(
                        ErrorKind::InvalidArgument,
                        format_args!("media class {mclass} is not configured"),
                    )
                })?
                .cfg
                .extent_size
        };
        self.reserve(mclass, extent_size, spare)?;

        let result = (|| {
            let serial = self.core.registry.next_serial();
            let oid = Oid::compose(ObjectKind::Mblock, mclass, spare, serial);
            let class_dir = self.class_dir(mclass);
            let data_path = device::data_path(&class_dir, oid);
            let om_path = device::meta_path(&class_dir, oid);

            let file = Arc::new(ExtentFile::create(&data_path, self.core.direct)?);
            ObjectMeta {
                oid,
                state: OmState::Allocated,
                wlen: 0,
                capacity: extent_size,
            }
            .store(&om_path)?;

            let obj = Arc::new(MblockObj::new_allocated(
                oid,
                mclass,
                spare,
                extent_size,
                data_path,
                om_path,
                self.core.direct,
                file,
            ));
            self.core.registry.insert(Object::Mblock(obj.clone()))?;
            Ok(obj)
        })();

        match result {
            Ok(obj) => {
                let props = obj.props();
                Ok((MblockHandle::new(obj), props))
            }
            Err(err) => {
                self.release(mclass, extent_size);
                Err(err)
            }
        }
    }

    /// Resolve an mblock's properties without taking a reference
    pub fn mblock_resolve(&self, oid: Oid) -> Result<MblockProps> {
        self.check_open()?;
        Ok(self.core.registry.mblock(oid)?.props())
    }

    /// Look up an mblock and take a reference
    pub fn mblock_find_get(&self, oid: Oid) -> Result<(MblockHandle, MblockProps)> {
        self.check_open()?;
        let obj = self.core.registry.mblock(oid)?;
        let props = obj.props();
        Ok((MblockHandle::new(obj), props))
    }

    /// Release a reference obtained from alloc or find-get
    pub fn mblock_put(&self, handle: MblockHandle) {
        drop(handle);
    }

    /// Synchronous all-or-nothing gather write
    pub fn mblock_write(&self, handle: &MblockHandle, iovs: &[&[u8]]) -> Result<()> {
        self.check_open()?;
        handle.obj.write_sync(iovs)
    }

    /// Queue a gather write onto `ctx`; durability is settled by
    /// [`MblockWriteCtx::flush`]
    pub fn mblock_write_async(
        &self,
        handle: &MblockHandle,
        iovs: &[&[u8]],
        ctx: &mut MblockWriteCtx,
    ) -> Result<()> {
        self.check_open()?;
        handle.obj.write_async(iovs, ctx)
    }

    /// Read from a committed mblock at a page-aligned offset
    pub fn mblock_read(&self, handle: &MblockHandle, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.check_open()?;
        handle.obj.read(buf, offset)
    }

    /// Seal an mblock
    pub fn mblock_commit(&self, handle: &MblockHandle) -> Result<()> {
        self.check_open()?;
        handle.obj.commit()
    }

    /// Abort an uncommitted mblock and return its extent
    pub fn mblock_abort(&self, handle: &MblockHandle) -> Result<()> {
        self.check_open()?;
        handle.obj.abort()?;
        self.core.registry.remove(handle.oid());
        self.release(handle.obj.mclass(), handle.obj.capacity());
        Ok(())
    }

    /// Delete a committed mblock and return its extent
    pub fn mblock_delete(&self, handle: &MblockHandle) -> Result<()> {
        self.check_open()?;
        handle.obj.delete()?;
        self.core.registry.remove(handle.oid());
        self.release(handle.obj.mclass(), handle.obj.capacity());
        Ok(())
    }

    /// Properties of an mblock
    pub fn mblock_props(&self, handle: &MblockHandle) -> Result<MblockProps> {
        self.check_open()?;
        Ok(handle.obj.props())
    }

    // ------------------------------------------------------------------
    // Mlog operations
    // ------------------------------------------------------------------

    /// Allocate an mlog with the given capacity target
    pub fn mlog_alloc(&self, captgt: u64, mclass: MediaClass) -> Result<(MlogHandle, MlogProps)> {
        self.check_writable()?;
        if captgt == 0 {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                "mlog capacity target must be nonzero",
            ));
        }
        if !self.core.mclasses.read().contains_key(&mclass) {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                format_args!("media class {mclass} is not configured"),
            ));
        }
        self.reserve(mclass, captgt, false)?;

        let result = (|| {
            let serial = self.core.registry.next_serial();
            let oid = Oid::compose(ObjectKind::Mlog, mclass, false, serial);
            let class_dir = self.class_dir(mclass);
            let obj = Arc::new(MlogObj::create(
                oid,
                mclass,
                captgt,
                device::data_path(&class_dir, oid),
                device::meta_path(&class_dir, oid),
                self.core.direct,
            )?);
            self.core.registry.insert(Object::Mlog(obj.clone()))?;
            Ok(obj)
        })();

        match result {
            Ok(obj) => {
                let props = obj.props();
                Ok((MlogHandle::new(obj), props))
            }
            Err(err) => {
                self.release(mclass, captgt);
                Err(err)
            }
        }
    }

    /// Resolve an mlog's properties without taking a reference
    pub fn mlog_resolve(&self, oid: Oid) -> Result<MlogProps> {
        self.check_open()?;
        Ok(self.core.registry.mlog(oid)?.props())
    }

    /// Look up an mlog and take a reference
    pub fn mlog_find_get(&self, oid: Oid) -> Result<(MlogHandle, MlogProps)> {
        self.check_open()?;
        let obj = self.core.registry.mlog(oid)?;
        if obj.is_owned() {
            return Err(Error::with_detail(
                ErrorKind::Busy,
                format_args!("mlog {oid} is owned by an open MDC"),
            ));
        }
        let props = obj.props();
        Ok((MlogHandle::new(obj), props))
    }

    /// Release a reference obtained from alloc or find-get
    pub fn mlog_put(&self, handle: MlogHandle) {
        drop(handle);
    }

    /// Seal an mlog
    pub fn mlog_commit(&self, handle: &MlogHandle) -> Result<()> {
        self.check_open()?;
        handle.obj.commit()
    }

    /// Abort an uncommitted mlog
    pub fn mlog_abort(&self, handle: &MlogHandle) -> Result<()> {
        self.check_open()?;
        handle.obj.abort()?;
        self.core.registry.remove(handle.oid());
        self.release(handle.obj.mclass(), handle.obj.capacity());
        Ok(())
    }

    /// Delete a committed, closed mlog
    pub fn mlog_delete(&self, handle: &MlogHandle) -> Result<()> {
        self.check_open()?;
        handle.obj.delete()?;
        self.core.registry.remove(handle.oid());
        self.release(handle.obj.mclass(), handle.obj.capacity());
        Ok(())
    }

    /// Open an mlog for append/read; returns the current generation
    pub fn mlog_open(&self, handle: &MlogHandle, flags: MlogOpenFlags) -> Result<u64> {
        self.check_open()?;
        handle.obj.open(flags)
    }

    /// Drain buffered appends and close
    pub fn mlog_close(&self, handle: &MlogHandle) -> Result<()> {
        self.check_open()?;
        handle.obj.close()
    }

    /// Append one record
    pub fn mlog_append(&self, handle: &MlogHandle, data: &[u8], sync: bool) -> Result<()> {
        self.check_open()?;
        handle.obj.append(&[data], sync)
    }

    /// Append one record gathered from multiple buffers
    pub fn mlog_append_vec(&self, handle: &MlogHandle, iovs: &[&[u8]], sync: bool) -> Result<()> {
        self.check_open()?;
        handle.obj.append(iovs, sync)
    }

    /// Position the read cursor at the first record
    pub fn mlog_read_init(&self, handle: &MlogHandle) -> Result<()> {
        self.check_open()?;
        handle.obj.read_init()
    }

    /// Read the next record; `None` at end of log
    pub fn mlog_read_next(&self, handle: &MlogHandle, buf: &mut [u8]) -> Result<Option<usize>> {
        self.check_open()?;
        handle.obj.read_next(buf)
    }

    /// Skip whole records totalling `skip` payload bytes, then read
    pub fn mlog_seek_read_next(
        &self,
        handle: &MlogHandle,
        skip: u64,
        buf: &mut [u8],
    ) -> Result<Option<usize>> {
        self.check_open()?;
        handle.obj.seek_read_next(skip, buf)
    }

    /// Force buffered appends to stable storage
    pub fn mlog_flush(&self, handle: &MlogHandle) -> Result<()> {
        self.check_open()?;
        handle.obj.flush()
    }

    /// Logical length in bytes, framing included
    pub fn mlog_len(&self, handle: &MlogHandle) -> Result<u64> {
        self.check_open()?;
        handle.obj.len()
    }

    /// Whether the log holds no records
    pub fn mlog_empty(&self, handle: &MlogHandle) -> Result<bool> {
        self.check_open()?;
        handle.obj.is_empty()
    }

    /// Discard all records, bumping the generation to at least `mingen`
    pub fn mlog_erase(&self, handle: &MlogHandle, mingen: u64) -> Result<u64> {
        self.check_open()?;
        handle.obj.erase(mingen)
    }

    /// Properties of an mlog
    pub fn mlog_props(&self, handle: &MlogHandle) -> Result<MlogProps> {
        self.check_open()?;
        Ok(handle.obj.props())
    }

    // ------------------------------------------------------------------
    // MDC operations
    // ------------------------------------------------------------------

    /// Allocate an MDC: two mlogs with the same capacity target in the
    /// same media class. The caller persists the returned IDs.
    pub fn mdc_alloc(&self, mclass: MediaClass, captgt: u64) -> Result<MdcProps> {
        self.check_writable()?;
        let (h1, p1) = self.mlog_alloc(captgt, mclass)?;
        let (h2, _) = match self.mlog_alloc(captgt, mclass) {
            Ok(pair) => pair,
            Err(err) => {
                let _ = self.mlog_abort(&h1);
                return Err(err);
            }
        };
        Ok(MdcProps {
            oid1: h1.oid(),
            oid2: h2.oid(),
            mclass,
            capacity: p1.capacity,
        })
    }

    /// Commit an MDC pair; if the second commit fails the first is undone,
    /// so recovery never sees a half-committed pair
    pub fn mdc_commit(&self, oid1: Oid, oid2: Oid) -> Result<()> {
        self.check_open()?;
        let log1 = self.core.registry.mlog(oid1)?;
        let log2 = self.core.registry.mlog(oid2)?;

        log1.commit()?;
        if let Err(err) = log2.commit() {
            warn!(%oid1, %oid2, "undoing half-committed mdc pair");
            if log1.delete().is_ok() {
                self.core.registry.remove(oid1);
                self.release(log1.mclass(), log1.capacity());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Destroy an MDC pair; legal only after close
    pub fn mdc_destroy(&self, oid1: Oid, oid2: Oid) -> Result<()> {
        self.check_open()?;
        let log1 = self.core.registry.mlog(oid1)?;
        let log2 = self.core.registry.mlog(oid2)?;

        log1.delete()?;
        self.core.registry.remove(oid1);
        self.release(log1.mclass(), log1.capacity());

        log2.delete()?;
        self.core.registry.remove(oid2);
        self.release(log2.mclass(), log2.capacity());
        Ok(())
    }

    /// Open an MDC with internal serialization
    pub fn mdc_open(&self, oid1: Oid, oid2: Oid) -> Result<Mdc> {
        Ok(Mdc::new(self.mdc_open_core(oid1, oid2)?))
    }

    /// Open an MDC without internal locking; operations take `&mut self`
    pub fn mdc_open_unsync(&self, oid1: Oid, oid2: Oid) -> Result<MdcUnsync> {
        Ok(MdcUnsync::new(self.mdc_open_core(oid1, oid2)?))
    }

    fn mdc_open_core(&self, oid1: Oid, oid2: Oid) -> Result<MdcCore> {
        self.check_open()?;
        if oid1 == oid2 {
            return Err(Error::with_detail(
                ErrorKind::InvalidArgument,
                "an MDC needs two distinct mlogs",
            ));
        }
        let log1 = self.core.registry.mlog(oid1)?;
        let log2 = self.core.registry.mlog(oid2)?;
        MdcCore::open(log1, log2)
    }

    /// The root MDC (MDC-0) pair created with the pool
    pub fn mdc_get_root(&self) -> Result<(Oid, Oid)> {
        self.check_open()?;
        let (oid1, oid2) = *self.core.root_mdc.read();
        if oid1 == 0 || oid2 == 0 {
            return Err(Error::with_detail(ErrorKind::NotFound, "pool has no root MDC"));
        }
        Ok((Oid::from(oid1), Oid::from(oid2)))
    }

    // ------------------------------------------------------------------
    // Mcache operations
    // ------------------------------------------------------------------

    /// Map a vector of committed mblocks for zero-copy page access
    pub fn mcache_mmap(&self, oids: &[Oid], advice: MapAdvice) -> Result<McacheMap> {
        self.check_open()?;
        let mut objs = Vec::with_capacity(oids.len());
        for &oid in oids {
            objs.push(self.core.registry.mblock(oid)?);
        }
        let ra_pages = self.core.params.read().ra_pages;
        McacheMap::create(objs, advice, ra_pages)
    }
}

impl Drop for PoolCore {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            unsafe { libc::flock(self.lock.as_raw_fd(), libc::LOCK_UN) };
        }
    }
}

fn class_props(mclass: MediaClass, state: &MclassState, params: &MpoolParams) -> MclassProps {
    let total = state.cfg.total;
    MclassProps {
        mclass,
        extent_size: state.cfg.extent_size,
        total,
        used: state.used.load(Ordering::Relaxed),
        spare_reserved: total / 100 * u64::from(params.spare_pct(mclass)),
    }
}

fn props_from_meta(meta: &PoolMeta) -> PoolProps {
    PoolProps {
        uuid: meta.uuid,
        name: meta.name.clone(),
        label: meta.params.label.clone(),
        mclasses: meta
            .mclasses
            .iter()
            .map(|(mclass, cfg)| MclassProps {
                mclass: *mclass,
                extent_size: cfg.extent_size,
                total: cfg.total,
                used: 0,
                spare_reserved: cfg.total / 100 * u64::from(meta.params.spare_pct(*mclass)),
            })
            .collect(),
    }
}

/// Rebuild one class directory's registry entries; returns bytes in use
fn scan_class_dir(
    class_dir: &Path,
    registry: &Registry,
    direct: bool,
    max_serial: &mut u64,
) -> Result<u64> {
    let mut used = 0u64;
    if !class_dir.is_dir() {
        return Ok(used);
    }

    for entry in fs::read_dir(class_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.ends_with(".om") {
            continue;
        }

        let om_path = entry.path();
        let om = match ObjectMeta::load(&om_path) {
            Ok(om) => om,
            Err(err) => {
                warn!(file = %om_path.display(), %err, "dropping unreadable object meta");
                let _ = fs::remove_file(&om_path);
                continue;
            }
        };

        let oid = om.oid;
        let (Some(kind), Some(mclass)) = (oid.kind(), oid.mclass()) else {
            warn!(%oid, "dropping object with malformed ID");
            let _ = fs::remove_file(&om_path);
            continue;
        };
        let data_path = device::data_path(class_dir, oid);

        if om.state == OmState::Allocated {
            // Never-committed leftovers do not survive reopen
            warn!(%oid, "reclaiming uncommitted object");
            let _ = fs::remove_file(&data_path);
            let _ = fs::remove_file(&om_path);
            continue;
        }

        let object = match kind {
            ObjectKind::Mblock => Object::Mblock(Arc::new(MblockObj::from_scan(
                oid, mclass, oid.is_spare(), &om, data_path, om_path, direct,
            ))),
            ObjectKind::Mlog => Object::Mlog(Arc::new(MlogObj::from_scan(
                oid, mclass, &om, data_path, om_path, direct,
            )?)),
        };
        registry.insert(object)?;
        used += om.capacity;
        *max_serial = (*max_serial).max(oid.serial());
    }

    Ok(used)
}
