//! Pooled per-request buffers
//!
//! A [`Transfer`] holds everything one in-flight request needs to forward its
//! body to the primary upstream and replay it to every secondary: the scratch
//! buffer the inbound body is read into, the captured snapshot of that body, a
//! rewindable cursor over the snapshot, and the accumulator that receives one
//! upstream response body at a time.
//!
//! Transfers are recycled through a lock-free [`TransferPool`] built on
//! crossbeam's `ArrayQueue`. Acquiring hands out a [`PooledTransfer`] guard
//! with exclusive ownership; dropping the guard clears the transfer and
//! returns it, so release happens on every exit path.
//!
//! The pool never has more than `capacity` transfers checked out. Each
//! guard holds a semaphore permit, and acquiring waits for one, so a request
//! whose mirroring is still running keeps its slot busy.

use crate::proxy::types::*;
use axum::body::Body;
use bytes::{Bytes, BytesMut};
use crossbeam::queue::ArrayQueue;
use http_body_util::{BodyExt, Full};
use hyper::HeaderMap;
use std::io::Cursor;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Initial capacity reserved for freshly allocated buffers
const INITIAL_BUFFER_CAPACITY: usize = 4 * 1024;

/// Scratch state for one in-flight request
#[derive(Debug)]
pub struct Transfer {
    read: BytesMut,
    data: Bytes,
    input: Cursor<Bytes>,
    trailers: Option<HeaderMap>,
    out: BytesMut,
}

impl Transfer {
    pub fn new() -> Self {
        Self {
            read: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            data: Bytes::new(),
            input: Cursor::new(Bytes::new()),
            trailers: None,
            out: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Read the whole inbound body and capture it
    ///
    /// After this returns successfully the captured body and trailers are
    /// fixed for the rest of the request and the input cursor sits at
    /// offset 0.
    pub async fn ingest(&mut self, mut body: Body) -> ProxyResult<()> {
        while let Some(frame) = body.frame().await {
            match frame?.into_data() {
                Ok(chunk) => self.read.extend_from_slice(&chunk),
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        self.trailers.get_or_insert_with(HeaderMap::new).extend(trailers);
                    }
                }
            }
        }
        self.capture();
        Ok(())
    }

    /// Snapshot the scratch buffer as the captured body
    pub fn capture(&mut self) {
        self.data = self.read.split().freeze();
        self.input = Cursor::new(self.data.clone());
    }

    /// The captured inbound body
    pub fn captured(&self) -> &Bytes {
        &self.data
    }

    /// Move the input cursor back to offset 0
    pub fn rewind(&mut self) {
        self.input.set_position(0);
    }

    /// Current offset of the input cursor
    pub fn position(&self) -> u64 {
        self.input.position()
    }

    /// Hand out the unread part of the captured body, leaving the cursor at the end
    pub fn take_input(&mut self) -> Bytes {
        let len = self.input.get_ref().len();
        let start = usize::try_from(self.input.position())
            .unwrap_or(len)
            .min(len);
        let remaining = self.input.get_ref().slice(start..);
        self.input.set_position(len as u64);
        remaining
    }

    /// Trailer headers sent after the inbound body, if any
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// Outbound request body: the unread input followed by the inbound trailers
    pub fn outbound_body(&mut self) -> Body {
        let data = Full::new(self.take_input());
        match self.trailers.clone() {
            Some(trailers) => Body::new(
                data.with_trailers(std::future::ready(Some(Ok(trailers)))),
            ),
            None => Body::new(data),
        }
    }

    /// The bytes accumulated from the last upstream response
    pub fn output(&self) -> &[u8] {
        &self.out
    }

    pub(crate) fn output_mut(&mut self) -> &mut BytesMut {
        &mut self.out
    }

    /// Empty the output accumulator, keeping its allocation
    pub fn reset_output(&mut self) {
        self.out.clear();
    }

    /// Drop every per-request reference before going back to the pool
    pub fn clear(&mut self) {
        self.input = Cursor::new(Bytes::new());
        self.data = Bytes::new();
        self.trailers = None;
        self.out.clear();
        self.read.clear();
    }

    fn is_clear(&self) -> bool {
        self.data.is_empty()
            && self.trailers.is_none()
            && self.out.is_empty()
            && self.read.is_empty()
    }
}

impl Default for Transfer {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about pool usage
#[derive(Debug, Default)]
pub struct TransferPoolStats {
    allocations: AtomicU64,
    reuses: AtomicU64,
    returns: AtomicU64,
    outstanding: AtomicUsize,
    peak_outstanding: AtomicUsize,
}

impl TransferPoolStats {
    /// Transfers allocated because the pool was empty
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Transfers handed out again from the pool
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Transfers put back into the pool
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Transfers currently checked out
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Highest number of transfers ever checked out at once
    pub fn peak_outstanding(&self) -> usize {
        self.peak_outstanding.load(Ordering::Acquire)
    }
}

/// Lock-free pool of transfers shared by every request
#[derive(Debug)]
pub struct TransferPool {
    transfers: ArrayQueue<Transfer>,
    slots: Arc<Semaphore>,
    stats: TransferPoolStats,
}

impl TransferPool {
    pub fn new(capacity: PoolCapacity) -> Self {
        let capacity = capacity.into_inner();
        Self {
            transfers: ArrayQueue::new(capacity),
            slots: Arc::new(Semaphore::new(capacity)),
            stats: TransferPoolStats::default(),
        }
    }

    /// Check out a transfer, waiting while every slot is in use
    ///
    /// Fails with [`ProxyError::Cancelled`] once the pool has been closed.
    pub async fn acquire(self: &Arc<Self>) -> ProxyResult<PooledTransfer> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::Cancelled)?;
        Ok(self.check_out(permit))
    }

    /// Check out a transfer only if a slot is free right now
    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledTransfer> {
        let permit = Arc::clone(&self.slots).try_acquire_owned().ok()?;
        Some(self.check_out(permit))
    }

    fn check_out(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> PooledTransfer {
        // Counted before the pop so an idle transfer is never unaccounted for
        let outstanding = self.stats.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats
            .peak_outstanding
            .fetch_max(outstanding, Ordering::AcqRel);

        let transfer = match self.transfers.pop() {
            Some(transfer) => {
                self.stats.reuses.fetch_add(1, Ordering::Relaxed);
                transfer
            }
            None => {
                self.stats.allocations.fetch_add(1, Ordering::Relaxed);
                Transfer::new()
            }
        };

        PooledTransfer {
            transfer: Some(transfer),
            pool: Arc::clone(self),
            _permit: permit,
        }
    }

    /// Reject every pending and future acquire
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    fn release(&self, mut transfer: Transfer) {
        transfer.clear();
        debug_assert!(transfer.is_clear());

        // Idle plus checked-out transfers never exceed the slot count, so
        // the queue always has room
        if self.transfers.push(transfer).is_ok() {
            self.stats.returns.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.outstanding.fetch_sub(1, Ordering::AcqRel);
    }

    /// Maximum number of transfers checked out or retained idle
    pub fn capacity(&self) -> usize {
        self.transfers.capacity()
    }

    /// Slots free for immediate checkout
    pub fn free_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Idle transfers ready for reuse
    pub fn available(&self) -> usize {
        self.transfers.len()
    }

    pub fn stats(&self) -> &TransferPoolStats {
        &self.stats
    }
}

impl Default for TransferPool {
    fn default() -> Self {
        Self::new(PoolCapacity::default())
    }
}

/// Exclusive handle on a checked-out transfer
///
/// The transfer is cleared and returned to its pool when the guard drops,
/// then its slot is freed.
#[derive(Debug)]
pub struct PooledTransfer {
    transfer: Option<Transfer>,
    pool: Arc<TransferPool>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledTransfer {
    type Target = Transfer;

    fn deref(&self) -> &Transfer {
        match &self.transfer {
            Some(transfer) => transfer,
            None => unreachable!("transfer is only taken in drop"),
        }
    }
}

impl DerefMut for PooledTransfer {
    fn deref_mut(&mut self) -> &mut Transfer {
        match &mut self.transfer {
            Some(transfer) => transfer,
            None => unreachable!("transfer is only taken in drop"),
        }
    }
}

impl Drop for PooledTransfer {
    fn drop(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            self.pool.release(transfer);
        }
    }
}
