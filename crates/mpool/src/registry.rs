//! Object-ID registry
//!
//! Maps every live object ID to its descriptor. Lookups take read-side
//! access; allocate and destroy take write-side. Reference counts live on
//! the descriptors themselves (handles increment on issue, decrement on
//! drop); the registry only sums them for the close-time balance check.

use crate::mblock::MblockObj;
use crate::mlog::MlogObj;
use mpool_common::{Error, ErrorKind, ObjectKind, Oid, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A registered descriptor, tagged by kind
#[derive(Clone, Debug)]
pub(crate) enum Object {
    Mblock(Arc<MblockObj>),
    Mlog(Arc<MlogObj>),
}

impl Object {
    pub(crate) fn oid(&self) -> Oid {
        match self {
            Self::Mblock(o) => o.oid(),
            Self::Mlog(o) => o.oid(),
        }
    }

    fn refs(&self) -> u32 {
        match self {
            Self::Mblock(o) => o.refs(),
            Self::Mlog(o) => o.refs(),
        }
    }
}

/// Per-pool object registry
#[derive(Debug)]
pub(crate) struct Registry {
    objects: RwLock<HashMap<Oid, Object>>,
    next_serial: AtomicU64,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Claim the next unused serial
    pub(crate) fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Raise the serial floor above everything found by the open scan
    pub(crate) fn seed_serial(&self, floor: u64) {
        self.next_serial.fetch_max(floor, Ordering::Relaxed);
    }

    /// Insert a freshly allocated or scanned descriptor
    pub(crate) fn insert(&self, obj: Object) -> Result<()> {
        let oid = obj.oid();
        let mut objects = self.objects.write();
        if objects.contains_key(&oid) {
            return Err(Error::with_detail(
                ErrorKind::AlreadyExists,
                format_args!("object {oid} already registered"),
            ));
        }
        objects.insert(oid, obj);
        Ok(())
    }

    /// Remove a destroyed descriptor
    pub(crate) fn remove(&self, oid: Oid) {
        self.objects.write().remove(&oid);
    }

    /// Resolve an mblock descriptor without taking a reference
    pub(crate) fn mblock(&self, oid: Oid) -> Result<Arc<MblockObj>> {
        match self.lookup(oid, ObjectKind::Mblock)? {
            Object::Mblock(o) => Ok(o),
            Object::Mlog(_) => unreachable!("kind checked in lookup"),
        }
    }

    /// Resolve an mlog descriptor without taking a reference
    pub(crate) fn mlog(&self, oid: Oid) -> Result<Arc<MlogObj>> {
        match self.lookup(oid, ObjectKind::Mlog)? {
            Object::Mlog(o) => Ok(o),
            Object::Mblock(_) => unreachable!("kind checked in lookup"),
        }
    }

    fn lookup(&self, oid: Oid, want: ObjectKind) -> Result<Object> {
        // The kind is carried in the ID; a mismatched lookup is a caller bug
        match oid.kind() {
            Some(kind) if kind == want => {}
            Some(kind) => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidArgument,
                    format_args!("object {oid} is an {kind}, not an {want}"),
                ));
            }
            None => {
                return Err(Error::with_detail(
                    ErrorKind::InvalidArgument,
                    format_args!("malformed object ID {oid}"),
                ));
            }
        }

        self.objects.read().get(&oid).cloned().ok_or_else(|| {
            Error::with_detail(ErrorKind::NotFound, format_args!("no such object {oid}"))
        })
    }

    /// Sum of outstanding handle references across all objects
    pub(crate) fn outstanding_refs(&self) -> u64 {
        self.objects
            .read()
            .values()
            .map(|o| u64::from(o.refs()))
            .sum()
    }

    /// Live object count
    pub(crate) fn len(&self) -> u64 {
        self.objects.read().len() as u64
    }

    /// Snapshot of all descriptors, for usage accounting
    pub(crate) fn snapshot(&self) -> Vec<Object> {
        self.objects.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mpool_common::MediaClass;
    use std::path::PathBuf;

    fn mblock_obj(serial: u64) -> Arc<MblockObj> {
        let oid = Oid::compose(ObjectKind::Mblock, MediaClass::Capacity, false, serial);
        Arc::new(MblockObj::for_test(oid, PathBuf::from("/nonexistent")))
    }

    #[test]
    fn insert_then_lookup() {
        let reg = Registry::new();
        let obj = mblock_obj(1);
        let oid = obj.oid();
        reg.insert(Object::Mblock(obj)).unwrap();

        assert_eq!(reg.mblock(oid).unwrap().oid(), oid);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_insert_fails() {
        let reg = Registry::new();
        reg.insert(Object::Mblock(mblock_obj(1))).unwrap();
        let err = reg.insert(Object::Mblock(mblock_obj(1))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    }

    #[test]
    fn wrong_kind_lookup_fails() {
        let reg = Registry::new();
        let obj = mblock_obj(1);
        let oid = obj.oid();
        reg.insert(Object::Mblock(obj)).unwrap();

        let err = reg.mlog(Oid::from(oid.as_u64())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn missing_object_not_found() {
        let reg = Registry::new();
        let oid = Oid::compose(ObjectKind::Mblock, MediaClass::Capacity, false, 99);
        assert_eq!(reg.mblock(oid).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn serial_seeding() {
        let reg = Registry::new();
        reg.seed_serial(100);
        assert_eq!(reg.next_serial(), 100);
        assert_eq!(reg.next_serial(), 101);
    }
}
