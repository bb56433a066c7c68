//! Bounded buffer between category producers and the single committer.
//!
//! `offer` suspends while `capacity` items are held, which is the primary
//! backpressure mechanism and is independent of memory-pressure throttling.
//! A slot is taken before an item is queued and handed back only after the
//! item has been drained, so occupancy counts every item between the two.
//! Items from one producer are drained in the order that producer offered
//! them; there is no ordering across producers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};

pub const DEFAULT_CAPACITY: usize = 200;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("buffer is closed")]
pub struct BufferClosed;

pub struct BackpressureBuffer<T> {
    tx: Mutex<Option<mpsc::UnboundedSender<T>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
    slots: Semaphore,
    capacity: usize,
    len: AtomicUsize,
    peak: AtomicUsize,
}

impl<T: Send> BackpressureBuffer<T> {
    /// Create a buffer holding at most `capacity` items (`capacity > 0`).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            slots: Semaphore::new(capacity),
            capacity,
            len: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items offered and not yet drained.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest occupancy observed since creation.
    pub fn peak_occupancy(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Add an item, waiting for space while the buffer is full.
    ///
    /// Fails only once the buffer has been closed.
    pub async fn offer(&self, item: T) -> Result<(), BufferClosed> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| BufferClosed)?
            .clone()
            .ok_or(BufferClosed)?;

        self.slots.acquire().await.map_err(|_| BufferClosed)?.forget();
        let held = self.len.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(held, Ordering::SeqCst);

        if tx.send(item).is_err() {
            self.release(1);
            return Err(BufferClosed);
        }
        Ok(())
    }

    /// Wait for at least one item and return up to `max` of them.
    ///
    /// Returns an empty vec once the buffer is closed and every remaining
    /// item has been drained.
    pub async fn drain(&self, max: usize) -> Vec<T> {
        let max = max.max(1);
        let mut out = Vec::with_capacity(max.min(self.capacity));
        let mut rx = self.rx.lock().await;
        let n = rx.recv_many(&mut out, max).await;
        self.release(n);
        out
    }

    /// Stop accepting new items. Offers already waiting for space still land;
    /// everything buffered stays drainable.
    pub fn close(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().map(|tx| tx.is_none()).unwrap_or(true)
    }

    fn release(&self, n: usize) {
        if n > 0 {
            self.len.fetch_sub(n, Ordering::SeqCst);
            self.slots.add_permits(n);
        }
    }
}
