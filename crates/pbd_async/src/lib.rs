//! # PBD Async
//!
//! Async facade over [`pbd_core::PersistentBinaryDeque`].
//!
//! The deque's file I/O is synchronous; this crate keeps it off async
//! runtime threads by funneling every operation through one dedicated
//! worker thread. Operations complete in submission order, and an
//! optional permit limit bounds how many operations may be in flight at
//! once.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use bytes::Bytes;
use parking_lot::Mutex;
use pbd_core::{
    IdRange, PbdError, PbdResult, PersistentBinaryDeque, PolledEntry, ReadCursor, SeekErrorRule,
    TruncateReport, TruncatorResponse,
};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send>;

/// An async handle to a [`PersistentBinaryDeque`].
///
/// All methods submit work to a single worker thread and await its
/// completion, so two concurrent `offer` calls never interleave and
/// complete in the order they were submitted. Dropping the handle joins
/// the worker after the queued jobs have drained.
pub struct AsyncDeque {
    deque: Arc<PersistentBinaryDeque>,
    jobs: Option<mpsc::Sender<Job>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    limiter: Option<Arc<Semaphore>>,
}

impl AsyncDeque {
    /// Wraps a deque without an in-flight limit.
    #[must_use]
    pub fn new(deque: PersistentBinaryDeque) -> Self {
        Self::build(deque, None)
    }

    /// Wraps a deque, allowing at most `permits` operations in flight at
    /// a time. Callers beyond the limit wait asynchronously.
    #[must_use]
    pub fn with_operation_limit(deque: PersistentBinaryDeque, permits: usize) -> Self {
        Self::build(deque, Some(Arc::new(Semaphore::new(permits))))
    }

    fn build(deque: PersistentBinaryDeque, limiter: Option<Arc<Semaphore>>) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let worker = std::thread::Builder::new()
            .name("pbd-worker".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
                debug!("deque worker drained");
            })
            .ok();
        Self {
            deque: Arc::new(deque),
            jobs: Some(tx),
            worker: Mutex::new(worker),
            limiter,
        }
    }

    /// Runs `f` against the deque on the worker thread.
    ///
    /// A permit is acquired before the job is submitted, so the in-flight
    /// limit covers every operation, including ones composed by callers.
    /// Jobs run in submission order and never interleave.
    pub async fn with_deque<T, F>(&self, f: F) -> PbdResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&PersistentBinaryDeque) -> PbdResult<T> + Send + 'static,
    {
        let permit = self.acquire_permit().await?;
        self.submit(permit, f).await
    }

    /// Submits `f` to the worker thread.
    ///
    /// The permit, when present, is released by the worker after the job
    /// runs, even when the caller's future was cancelled in the
    /// meantime.
    async fn submit<T, F>(&self, permit: Option<OwnedSemaphorePermit>, f: F) -> PbdResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&PersistentBinaryDeque) -> PbdResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let deque = Arc::clone(&self.deque);
        let job: Job = Box::new(move || {
            let result = f(&deque);
            let _ = tx.send(result);
            drop(permit);
        });
        self.jobs
            .as_ref()
            .and_then(|jobs| jobs.send(job).ok())
            .ok_or(PbdError::Closed)?;
        rx.await.map_err(|_| PbdError::Closed)?
    }

    async fn acquire_permit(&self) -> PbdResult<Option<OwnedSemaphorePermit>> {
        match &self.limiter {
            None => Ok(None),
            Some(semaphore) => Arc::clone(semaphore)
                .acquire_owned()
                .await
                .map(Some)
                .map_err(|_| PbdError::Closed),
        }
    }

    /// Appends an entry without sequence ids.
    pub async fn offer(&self, payload: Bytes) -> PbdResult<usize> {
        self.with_deque(move |d| d.offer(&payload)).await
    }

    /// Appends an entry covering the sequence-id range `ids`.
    pub async fn offer_with_ids(&self, payload: Bytes, ids: IdRange) -> PbdResult<usize> {
        self.with_deque(move |d| d.offer_with_ids(&payload, ids))
            .await
    }

    /// Writes a batch of untracked entries in front of everything
    /// already stored; see [`PersistentBinaryDeque::push`].
    pub async fn push(&self, payloads: Vec<Bytes>) -> PbdResult<()> {
        self.with_deque(move |d| d.push(&payloads)).await
    }

    /// Writes a batch of id-tracked entries in front of everything
    /// already stored; see [`PersistentBinaryDeque::push_with_ids`].
    pub async fn push_with_ids(&self, entries: Vec<(Bytes, IdRange)>) -> PbdResult<()> {
        self.with_deque(move |d| d.push_with_ids(&entries)).await
    }

    /// Replaces the extra-header blob stamped into future segments.
    pub async fn update_extra_header(&self, blob: Bytes) -> PbdResult<()> {
        self.with_deque(move |d| d.update_extra_header(blob)).await
    }

    /// Opens (or re-attaches to) the named cursor.
    pub async fn open_for_read(&self, name: &str) -> PbdResult<ReadCursor> {
        let name = name.to_string();
        self.with_deque(move |d| d.open_for_read(&name)).await
    }

    /// Reads the next unread entry for the named cursor.
    pub async fn poll(&self, cursor: &ReadCursor) -> PbdResult<Option<PolledEntry>> {
        let name = cursor.name().to_string();
        self.with_deque(move |d| {
            let cursor = d.open_for_read(&name)?;
            cursor.poll()
        })
        .await
    }

    /// Positions the named cursor per [`ReadCursor::seek_to_segment`].
    pub async fn seek_to_segment(
        &self,
        cursor: &ReadCursor,
        entry_id: i64,
        rule: SeekErrorRule,
    ) -> PbdResult<()> {
        let name = cursor.name().to_string();
        self.with_deque(move |d| {
            d.open_for_read(&name)?.seek_to_segment(entry_id, rule)
        })
        .await
    }

    /// Runs a truncation pass; see
    /// [`PersistentBinaryDeque::parse_and_truncate`].
    pub async fn parse_and_truncate<F>(&self, truncator: F) -> PbdResult<TruncateReport>
    where
        F: FnMut(&[u8]) -> TruncatorResponse + Send + 'static,
    {
        self.with_deque(move |d| d.parse_and_truncate(truncator))
            .await
    }

    /// Flushes the active segment to durable storage.
    pub async fn sync(&self) -> PbdResult<()> {
        self.with_deque(PersistentBinaryDeque::sync).await
    }

    /// Seals the active segment and marks the deque closed.
    pub async fn close(&self) -> PbdResult<()> {
        self.with_deque(PersistentBinaryDeque::close).await
    }

    /// The wrapped deque, for synchronous inspection calls.
    #[must_use]
    pub fn deque(&self) -> &PersistentBinaryDeque {
        &self.deque
    }
}

impl Drop for AsyncDeque {
    fn drop(&mut self) {
        // Dropping the sender lets the worker drain and exit.
        self.jobs = None;
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for AsyncDeque {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncDeque")
            .field("deque", &self.deque)
            .field("limited", &self.limiter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbd_core::DequeConfig;
    use tempfile::tempdir;

    fn new_deque(dir: &std::path::Path) -> PersistentBinaryDeque {
        PersistentBinaryDeque::builder("t", dir)
            .config(DequeConfig::new().chunk_size(64 * 1024))
            .open()
            .unwrap()
    }

    #[tokio::test]
    async fn offer_and_poll_round_trip() {
        let dir = tempdir().unwrap();
        let deque = AsyncDeque::new(new_deque(dir.path()));

        deque.offer(Bytes::from_static(b"alpha")).await.unwrap();
        deque.offer(Bytes::from_static(b"beta")).await.unwrap();

        let cursor = deque.open_for_read("r").await.unwrap();
        let entry = deque.poll(&cursor).await.unwrap().unwrap();
        assert_eq!(&entry[..], b"alpha");
        entry.release().unwrap();
        let entry = deque.poll(&cursor).await.unwrap().unwrap();
        assert_eq!(&entry[..], b"beta");
        entry.release().unwrap();
        assert!(deque.poll(&cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sequential_offers_keep_order() {
        let dir = tempdir().unwrap();
        let deque = AsyncDeque::new(new_deque(dir.path()));
        for i in 0..20u8 {
            deque.offer(Bytes::from(vec![i; 8])).await.unwrap();
        }
        let cursor = deque.open_for_read("r").await.unwrap();
        for i in 0..20u8 {
            let entry = deque.poll(&cursor).await.unwrap().unwrap();
            assert_eq!(&entry[..], &[i; 8][..]);
            entry.release().unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn operation_limit_admits_all_operations_eventually() {
        let dir = tempdir().unwrap();
        let deque = Arc::new(AsyncDeque::with_operation_limit(new_deque(dir.path()), 2));

        let mut handles = Vec::new();
        for i in 0..16u8 {
            let deque = Arc::clone(&deque);
            handles.push(tokio::spawn(async move {
                deque.offer(Bytes::from(vec![i; 16])).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(deque.deque().stats().unwrap().entries, 16);
    }

    #[tokio::test]
    async fn closures_run_against_the_deque_in_order() {
        let dir = tempdir().unwrap();
        let deque = AsyncDeque::with_operation_limit(new_deque(dir.path()), 1);

        let written = deque
            .with_deque(|d| {
                d.offer(b"first")?;
                d.offer(b"second")
            })
            .await
            .unwrap();
        assert!(written > 0);
        let stats = deque.with_deque(|d| d.stats()).await.unwrap();
        assert_eq!(stats.entries, 2);
    }

    #[tokio::test]
    async fn push_requeues_ahead_of_offers() {
        let dir = tempdir().unwrap();
        let deque = AsyncDeque::new(new_deque(dir.path()));
        deque.offer(Bytes::from_static(b"current")).await.unwrap();
        deque
            .push(vec![Bytes::from_static(b"replayed")])
            .await
            .unwrap();

        let cursor = deque.open_for_read("r").await.unwrap();
        let entry = deque.poll(&cursor).await.unwrap().unwrap();
        assert_eq!(&entry[..], b"replayed");
        entry.release().unwrap();
        let entry = deque.poll(&cursor).await.unwrap().unwrap();
        assert_eq!(&entry[..], b"current");
        entry.release().unwrap();
    }

    #[tokio::test]
    async fn id_errors_propagate() {
        let dir = tempdir().unwrap();
        let deque = AsyncDeque::new(new_deque(dir.path()));
        deque
            .offer_with_ids(Bytes::from_static(b"a"), IdRange::new(0, 5))
            .await
            .unwrap();
        let err = deque
            .offer_with_ids(Bytes::from_static(b"b"), IdRange::new(3, 9))
            .await
            .unwrap_err();
        assert!(matches!(err, PbdError::InvalidIds { .. }));
    }

    #[tokio::test]
    async fn close_rejects_later_operations() {
        let dir = tempdir().unwrap();
        let deque = AsyncDeque::new(new_deque(dir.path()));
        deque.offer(Bytes::from_static(b"x")).await.unwrap();
        deque.close().await.unwrap();
        assert!(matches!(
            deque.offer(Bytes::from_static(b"y")).await,
            Err(PbdError::Closed)
        ));
    }
}
