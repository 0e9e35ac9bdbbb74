//! End-to-end pool scenarios

use mpool::{
    MapAdvice, MblockWriteCtx, MclassConfig, MediaClass, MlogOpenFlags, Mpool, MpoolConfig,
    MpoolParams, PoolOpenFlags,
};
use std::path::Path;

fn test_cfg(root: &Path) -> MpoolConfig {
    MpoolConfig {
        rundir_root: root.join("run"),
        direct_io: false,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn make_pool(root: &Path, name: &str) -> Mpool {
    init_tracing();
    let cfg = test_cfg(root);
    let params = MpoolParams {
        mdc0_cap: 256 * 1024,
        ..MpoolParams::init()
    };
    Mpool::create(root, name, &params, &cfg).unwrap();
    Mpool::open(root, name, PoolOpenFlags::default(), &cfg).unwrap()
}

#[test]
fn mblock_write_commit_read() {
    let dir = tempfile::tempdir().unwrap();
    let mp = make_pool(dir.path(), "p0");

    let (mbh, props) = mp.mblock_alloc(MediaClass::Capacity, false).unwrap();
    assert!(!props.committed);
    assert_eq!(props.optimal_wrsz % 512, 0);
    assert!(props.capacity >= 4096);

    let page = vec![0x5au8; 4096];
    mp.mblock_write(&mbh, &[&page]).unwrap();
    mp.mblock_commit(&mbh).unwrap();

    let mut back = vec![0u8; 4096];
    let n = mp.mblock_read(&mbh, &mut back, 0).unwrap();
    assert_eq!(n, 4096);
    assert!(back.iter().all(|&b| b == 0x5a));

    mp.mblock_put(mbh);
    mp.close().unwrap();
}

#[test]
fn mblock_async_write_flush_then_read() {
    let dir = tempfile::tempdir().unwrap();
    let mp = make_pool(dir.path(), "p0");

    let (mbh, _) = mp.mblock_alloc(MediaClass::Capacity, false).unwrap();
    let chunk = vec![0x11u8; 2 * 1024 * 1024 + 4096];

    let mut ctx = MblockWriteCtx::new();
    mp.mblock_write_async(&mbh, &[&chunk], &mut ctx).unwrap();
    ctx.flush().unwrap();
    mp.mblock_commit(&mbh).unwrap();

    let mut back = vec![0u8; chunk.len()];
    let n = mp.mblock_read(&mbh, &mut back, 0).unwrap();
    assert_eq!(n, chunk.len());
    assert_eq!(back, chunk);

    mp.mblock_put(mbh);
    mp.close().unwrap();
}

#[test]
fn mlog_records_survive_reopen_with_generation() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let cfg = test_cfg(root);
    let mp = make_pool(root, "p0");

    let oid = {
        let (mlh, _) = mp.mlog_alloc(1024 * 1024, MediaClass::Capacity).unwrap();
        mp.mlog_commit(&mlh).unwrap();
        let r#gen = mp.mlog_open(&mlh, MlogOpenFlags::default()).unwrap();

        for rec in [b"a".as_slice(), b"bb", b"ccc"] {
            mp.mlog_append(&mlh, rec, true).unwrap();
        }
        mp.mlog_close(&mlh).unwrap();
        let oid = mlh.oid();
        mp.mlog_put(mlh);
        mp.close().unwrap();
        assert_eq!(r#gen, 1);
        oid
    };

    let mp = Mpool::open(root, "p0", PoolOpenFlags::default(), &cfg).unwrap();
    let (mlh, props) = mp.mlog_find_get(oid).unwrap();
    assert!(props.committed);

    let r#gen = mp.mlog_open(&mlh, MlogOpenFlags::default()).unwrap();
    assert_eq!(r#gen, 1, "generation unchanged by clean close/reopen");

    mp.mlog_read_init(&mlh).unwrap();
    let mut records = Vec::new();
    let mut buf = vec![0u8; 16];
    while let Some(n) = mp.mlog_read_next(&mlh, &mut buf).unwrap() {
        records.push(buf[..n].to_vec());
    }
    assert_eq!(records, vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);

    mp.mlog_close(&mlh).unwrap();
    mp.mlog_put(mlh);
    mp.close().unwrap();
}

#[test]
fn mdc_compaction_keeps_only_rewritten_stream() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let cfg = test_cfg(root);
    let mp = make_pool(root, "p0");

    let props = mp.mdc_alloc(MediaClass::Capacity, 4 * 1024 * 1024).unwrap();
    mp.mdc_commit(props.oid1, props.oid2).unwrap();

    let mdc = mp.mdc_open(props.oid1, props.oid2).unwrap();
    for _ in 0..1000 {
        mdc.append(&[b'x'; 128], false).unwrap();
    }
    mdc.sync().unwrap();

    mdc.cstart().unwrap();
    for _ in 0..10 {
        mdc.append(&[b'y'; 128], false).unwrap();
    }
    mdc.cend().unwrap();
    mdc.close().unwrap();
    mp.close().unwrap();

    let mp = Mpool::open(root, "p0", PoolOpenFlags::default(), &cfg).unwrap();
    let mdc = mp.mdc_open(props.oid1, props.oid2).unwrap();
    mdc.rewind().unwrap();

    let mut count = 0;
    let mut buf = vec![0u8; 256];
    while let Some(n) = mdc.read(&mut buf).unwrap() {
        assert_eq!(&buf[..n], &[b'y'; 128]);
        count += 1;
    }
    assert_eq!(count, 10);

    mdc.close().unwrap();
    mp.close().unwrap();
}

#[test]
fn mdc_crash_without_cend_recovers_old_records() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let cfg = test_cfg(root);
    let mp = make_pool(root, "p0");

    let props = mp.mdc_alloc(MediaClass::Capacity, 1024 * 1024).unwrap();
    mp.mdc_commit(props.oid1, props.oid2).unwrap();

    let mdc = mp.mdc_open(props.oid1, props.oid2).unwrap();
    for _ in 0..5 {
        mdc.append(b"old", true).unwrap();
    }
    mdc.cstart().unwrap();
    for _ in 0..3 {
        mdc.append(b"new", true).unwrap();
    }
    // Simulated crash: the MDC is dropped without cend and the pool handle
    // is abandoned without close
    drop(mdc);
    drop(mp);

    let mp = Mpool::open(root, "p0", PoolOpenFlags::default(), &cfg).unwrap();
    let mdc = mp.mdc_open(props.oid1, props.oid2).unwrap();
    mdc.rewind().unwrap();

    let mut records = Vec::new();
    let mut buf = vec![0u8; 16];
    while let Some(n) = mdc.read(&mut buf).unwrap() {
        records.push(buf[..n].to_vec());
    }
    assert_eq!(records, vec![b"old".to_vec(); 5]);

    mdc.close().unwrap();
    mp.close().unwrap();
}

#[test]
fn mcache_map_of_three_mblocks() {
    let dir = tempfile::tempdir().unwrap();
    let mp = make_pool(dir.path(), "p0");
    let page = 4096u64;

    let mut oids = Vec::new();
    for fill in 1..=3u8 {
        let (mbh, _) = mp.mblock_alloc(MediaClass::Capacity, false).unwrap();
        let data = vec![fill; 2 * page as usize];
        mp.mblock_write(&mbh, &[&data]).unwrap();
        mp.mblock_commit(&mbh).unwrap();
        oids.push(mbh.oid());
        mp.mblock_put(mbh);
    }

    let map = mp.mcache_mmap(&oids, MapAdvice::Normal).unwrap();
    assert_eq!(map.mblock_count(), 3);

    let base = map.getbase(0).unwrap();
    assert_eq!(base.len(), 2 * page as usize);
    assert!(base.iter().all(|&b| b == 1));

    let pages = map.getpages(0, &[0, page]).unwrap();
    assert_ne!(pages[0].as_ptr(), pages[1].as_ptr());
    assert!(pages[0].as_ptr() >= base.as_ptr());
    assert!(pages[1].as_ptr() > pages[0].as_ptr());
    assert_eq!(
        pages[1].as_ptr() as usize - pages[0].as_ptr() as usize,
        page as usize
    );

    // Page content aliases what mblock reads return
    let (mbh, _) = mp.mblock_find_get(oids[1]).unwrap();
    let mut via_read = vec![0u8; page as usize];
    mp.mblock_read(&mbh, &mut via_read, page).unwrap();
    let aliased = map.getpagesv(&[1], &[page]).unwrap();
    assert_eq!(aliased[0], &via_read[..]);
    mp.mblock_put(mbh);

    // Mapped mblocks are pinned against delete
    let (mbh, _) = mp.mblock_find_get(oids[2]).unwrap();
    assert_eq!(
        mp.mblock_delete(&mbh).unwrap_err().kind(),
        mpool::ErrorKind::Busy
    );

    let (_rss, vss) = map.mincore().unwrap();
    assert_eq!(vss, 6);
    map.purge().unwrap();
    map.munmap().unwrap();

    mp.mblock_delete(&mbh).unwrap();
    mp.mblock_put(mbh);
    mp.close().unwrap();
}

#[test]
fn exclusive_open_blocks_second_open() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let cfg = test_cfg(root);
    let params = MpoolParams {
        mdc0_cap: 256 * 1024,
        ..MpoolParams::init()
    };
    Mpool::create(root, "p0", &params, &cfg).unwrap();

    let excl = Mpool::open(
        root,
        "p0",
        PoolOpenFlags {
            excl: true,
            ..Default::default()
        },
        &cfg,
    )
    .unwrap();

    let err = Mpool::open(root, "p0", PoolOpenFlags::default(), &cfg).unwrap_err();
    assert_eq!(err.kind(), mpool::ErrorKind::Busy);

    excl.close().unwrap();
}

#[test]
fn staging_class_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mp = make_pool(dir.path(), "p0");
    mp.mclass_add(MediaClass::Staging, MclassConfig::default())
        .unwrap();

    let (mbh, props) = mp.mblock_alloc(MediaClass::Staging, true).unwrap();
    assert_eq!(props.mclass, MediaClass::Staging);
    assert!(mbh.oid().is_spare());
    assert_eq!(mbh.oid().mclass(), Some(MediaClass::Staging));

    let data = vec![0xcdu8; 4096];
    mp.mblock_write(&mbh, &[&data]).unwrap();
    mp.mblock_commit(&mbh).unwrap();

    let mut back = vec![0u8; 4096];
    mp.mblock_read(&mbh, &mut back, 0).unwrap();
    assert_eq!(back, data);

    mp.mblock_delete(&mbh).unwrap();
    mp.mblock_put(mbh);
    mp.close().unwrap();
}
