//! Asynchronous mblock write context
//!
//! A context is a FIFO of write chunks drained by a worker thread that is
//! spawned lazily on the first submission. Submissions across distinct
//! mblocks may share one context; within a single mblock the manager issues
//! chunks in offset order, and the queue preserves issue order end to end.
//!
//! Durability is settled at [`MblockWriteCtx::flush`]: it waits for every
//! queued chunk, syncs every touched extent, and reports the first failure.
//! A chunk that fails poisons the context; later submissions are rejected
//! until flush retrieves the error and retires the context.

use crate::device::ExtentFile;
use mpool_common::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;

struct Job {
    file: Arc<ExtentFile>,
    offset: u64,
    data: Vec<u8>,
}

/// Shared context for chunked asynchronous mblock writes
pub struct MblockWriteCtx {
    tx: Option<mpsc::Sender<Job>>,
    worker: Option<thread::JoinHandle<()>>,
    poisoned: Arc<AtomicBool>,
    first_err: Arc<Mutex<Option<Error>>>,
}

impl MblockWriteCtx {
    /// An empty context; worker state is allocated on first submission
    #[must_use]
    pub fn new() -> Self {
        Self {
            tx: None,
            worker: None,
            poisoned: Arc::new(AtomicBool::new(false)),
            first_err: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn submit(
        &mut self,
        file: Arc<ExtentFile>,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::with_detail(
                ErrorKind::InvalidState,
                "write context failed; flush to retrieve the error",
            ));
        }

        let tx = self.tx.get_or_insert_with(|| {
            let (tx, rx) = mpsc::channel::<Job>();
            let poisoned = self.poisoned.clone();
            let first_err = self.first_err.clone();
            self.worker = Some(thread::spawn(move || worker_loop(rx, poisoned, first_err)));
            tx
        });

        tx.send(Job { file, offset, data })
            .map_err(|_| Error::with_detail(ErrorKind::Io, "write context worker is gone"))
    }

    /// Drain the context: wait for all queued I/O to persist and report the
    /// first failure, if any. The context is consumed either way.
    pub fn flush(mut self) -> Result<()> {
        self.drain()
    }

    fn drain(&mut self) -> Result<()> {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| Error::with_detail(ErrorKind::Io, "write context worker panicked"))?;
        }
        match self.first_err.lock().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MblockWriteCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MblockWriteCtx {
    fn drop(&mut self) {
        // Dropping without flush still drains the queue; errors are lost
        let _ = self.drain();
    }
}

fn worker_loop(
    rx: mpsc::Receiver<Job>,
    poisoned: Arc<AtomicBool>,
    first_err: Arc<Mutex<Option<Error>>>,
) {
    let mut touched: Vec<Arc<ExtentFile>> = Vec::new();

    for job in rx {
        if poisoned.load(Ordering::Acquire) {
            continue; // drain the queue, first failure already recorded
        }
        if let Err(err) = job.file.write_all_at(job.offset, &job.data) {
            poisoned.store(true, Ordering::Release);
            first_err.lock().get_or_insert(err);
            continue;
        }
        if !touched.iter().any(|f| Arc::ptr_eq(f, &job.file)) {
            touched.push(job.file);
        }
    }

    // Sender gone: flush barrier. Persist every extent touched.
    if !poisoned.load(Ordering::Acquire) {
        for file in touched {
            if let Err(err) = file.sync_data() {
                poisoned.store(true, Ordering::Release);
                first_err.lock().get_or_insert(err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn unused_context_flushes_clean() {
        let ctx = MblockWriteCtx::new();
        ctx.flush().unwrap();
    }

    #[test]
    fn chunks_persist_in_order() {
        let dir = tempdir().unwrap();
        let file = Arc::new(ExtentFile::create(dir.path().join("x.mblk"), false).unwrap());

        let mut ctx = MblockWriteCtx::new();
        ctx.submit(file.clone(), 0, vec![1u8; 4096]).unwrap();
        ctx.submit(file.clone(), 4096, vec![2u8; 4096]).unwrap();
        ctx.flush().unwrap();

        let mut buf = vec![0u8; 8192];
        assert_eq!(file.read_at(0, &mut buf).unwrap(), 8192);
        assert!(buf[..4096].iter().all(|&b| b == 1));
        assert!(buf[4096..].iter().all(|&b| b == 2));
    }

    #[test]
    fn context_spans_multiple_files() {
        let dir = tempdir().unwrap();
        let a = Arc::new(ExtentFile::create(dir.path().join("a.mblk"), false).unwrap());
        let b = Arc::new(ExtentFile::create(dir.path().join("b.mblk"), false).unwrap());

        let mut ctx = MblockWriteCtx::new();
        ctx.submit(a.clone(), 0, vec![0xaa; 512]).unwrap();
        ctx.submit(b.clone(), 0, vec![0xbb; 512]).unwrap();
        ctx.flush().unwrap();

        let mut buf = [0u8; 512];
        a.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&v| v == 0xaa));
        b.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&v| v == 0xbb));
    }

    #[test]
    fn failure_poisons_until_flush() {
        let dir = tempdir().unwrap();
        let good = Arc::new(ExtentFile::create(dir.path().join("g.mblk"), false).unwrap());
        // A read-only extent makes every queued write fail
        let ro_path = dir.path().join("ro.mblk");
        ExtentFile::create(&ro_path, false).unwrap();
        let ro = Arc::new(ExtentFile::open(&ro_path, true, false).unwrap());

        let mut ctx = MblockWriteCtx::new();
        ctx.submit(ro, 0, vec![0u8; 64]).unwrap();

        // Give the worker time to hit the failure, then submissions bounce
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut rejected = false;
        while std::time::Instant::now() < deadline {
            match ctx.submit(good.clone(), 0, vec![1u8; 64]) {
                Err(e) if e.kind() == ErrorKind::InvalidState => {
                    rejected = true;
                    break;
                }
                _ => std::thread::yield_now(),
            }
        }
        assert!(rejected, "poisoned context kept accepting writes");

        let err = ctx.flush().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }
}
