//! Lock-free SPSC byte ring between the socket thread and the
//! processing thread.
//!
//! A fixed-capacity circular byte buffer with one producer and one
//! consumer. The only cross-thread state is the pair of atomic cursors;
//! everything else is confined to whichever half owns it.
//!
//! # Overview
//!
//! - [`RingProducer`] - write end; pulls bytes from a [`ByteSource`]
//!   directly into ring memory (no intermediate copy).
//! - [`RingConsumer`] - read end; hands the whole readable run to a
//!   [`ByteSink`] as one contiguous slice.
//! - Backpressure is a zero-result, never a block: `push` returns
//!   `Ok(None)` when the free space cannot take the request, and the
//!   caller retries. Capacity must be sized so that one readiness-wait
//!   span of production never approaches it.
//!
//! # Wrap handling
//!
//! The backing region carries [`MAX_PUSH_BYTES`] of slack past the
//! logical capacity. A push that would cross the logical end writes
//! into the slack in one contiguous call, then the overflow is copied
//! back to the physical start before the write cursor is published. On
//! the read side a wrapped run is reassembled through a consumer-owned
//! scratch buffer, so the sink always sees one contiguous slice and
//! frames never straddle sink invocations.
//!
//! # Thread Safety
//!
//! Both halves are [`Send`] but **not** [`Sync`]: ownership can move to
//! another thread, but `&RingProducer` cannot be shared (no concurrent
//! `push`).

pub mod layout;
pub mod region;

use std::cell::Cell;
use std::io;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use minstant::Instant;
use thiserror::Error;

pub use layout::MAX_PUSH_BYTES;
use region::Region;
pub use region::RegionError;

/// Reads bytes from an opaque source into a caller-provided buffer.
///
/// Implemented by the feed sockets (one datagram per call) and by
/// in-memory slices in tests.
pub trait ByteSource {
    /// Reads up to `buf.len()` bytes. Returning `Ok(0)` means the
    /// source is currently dry, not end-of-stream.
    ///
    /// # Errors
    ///
    /// Propagates I/O failures from the underlying source.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl ByteSource for &[u8] {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.len().min(buf.len());
        buf[..n].copy_from_slice(&self[..n]);
        *self = &self[n..];
        Ok(n)
    }
}

/// Consumes one contiguous byte run popped from the ring.
pub trait ByteSink {
    type Error;

    /// Consumes the run. A returned error stops the current pop; the
    /// bytes still count as delivered (the read cursor has advanced).
    ///
    /// # Errors
    ///
    /// Implementation-defined; surfaced unchanged by
    /// [`RingConsumer::pop_all`].
    fn consume(&mut self, run: &[u8]) -> Result<(), Self::Error>;
}

impl ByteSink for Vec<u8> {
    type Error = std::convert::Infallible;

    fn consume(&mut self, run: &[u8]) -> Result<(), Self::Error> {
        self.extend_from_slice(run);
        Ok(())
    }
}

/// Timeout specification for blocking push retries.
#[derive(Debug, Clone, Copy)]
pub enum Timeout {
    /// Retry indefinitely.
    Infinite,
    /// Retry for at most the specified duration.
    Duration(Duration),
}

impl From<Duration> for Timeout {
    fn from(d: Duration) -> Self {
        Self::Duration(d)
    }
}

/// Errors constructing a ring.
#[derive(Debug, Error)]
pub enum RingError {
    /// Capacity of zero bytes was requested.
    #[error("ring capacity must be non-zero")]
    ZeroCapacity,
    /// Backing memory could not be obtained.
    #[error(transparent)]
    Region(#[from] RegionError),
}

/// Cursor on its own cache line to avoid false sharing between the
/// producer's and consumer's hot stores.
#[repr(align(64))]
struct Cursor(AtomicUsize);

struct RingShared {
    region: Region,
    /// Logical capacity; cursors live in `[0, capacity)`. The region is
    /// `capacity + MAX_PUSH_BYTES` long (slack tail for wrap handling).
    capacity: usize,
    /// Next byte the producer will write. Owned by the producer,
    /// acquire-loaded by the consumer.
    write: Cursor,
    /// Next byte the consumer will read. Owned by the consumer,
    /// acquire-loaded by the producer.
    read: Cursor,
}

// SAFETY: concurrent access is mediated by the two atomic cursors with
// Release/Acquire ordering; each byte range is accessed by exactly one
// side at a time per the SPSC protocol documented on Region.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the byte ring.
pub struct RingProducer {
    shared: Arc<RingShared>,
    _unsync: PhantomUnsync,
}

/// Read end of the byte ring.
pub struct RingConsumer {
    shared: Arc<RingShared>,
    /// Reassembly buffer for wrapped runs; grows to the largest wrapped
    /// run seen and is reused across pops.
    scratch: Vec<u8>,
    _unsync: PhantomUnsync,
}

/// Creates a new SPSC byte ring.
///
/// `capacity` is rounded up to the page granularity of the chosen
/// backing (4 KiB heap, 2 MiB huge pages); the backing region is
/// allocated with [`MAX_PUSH_BYTES`] of additional slack. Returns a
/// `(RingProducer, RingConsumer)` pair whose halves can be sent to
/// different threads.
///
/// # Errors
///
/// Returns [`RingError::ZeroCapacity`] for a zero request and
/// [`RingError::Region`] if the backing memory cannot be obtained
/// (huge pages in particular require OS-level reservation).
pub fn channel(capacity: usize, huge_pages: bool) -> Result<(RingProducer, RingConsumer), RingError> {
    if capacity == 0 {
        return Err(RingError::ZeroCapacity);
    }

    let capacity = layout::align_size(capacity, huge_pages);
    let mut backing_len = capacity + MAX_PUSH_BYTES;
    if huge_pages {
        // mmap length granularity matches the page size.
        backing_len = layout::align_size(backing_len, true);
    }
    let region = Region::allocate(backing_len, huge_pages)?;

    let shared = Arc::new(RingShared {
        region,
        capacity,
        write: Cursor(AtomicUsize::new(0)),
        read: Cursor(AtomicUsize::new(0)),
    });

    let producer = RingProducer {
        shared: Arc::clone(&shared),
        _unsync: PhantomData,
    };
    let consumer = RingConsumer {
        shared,
        scratch: Vec::new(),
        _unsync: PhantomData,
    };

    Ok((producer, consumer))
}

impl RingProducer {
    /// Logical capacity in bytes (after page rounding).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Free bytes currently available to the producer.
    #[must_use]
    pub fn free_space(&self) -> usize {
        let write = self.shared.write.0.load(Ordering::Relaxed);
        let read = self.shared.read.0.load(Ordering::Acquire);
        layout::write_available(write, read, self.shared.capacity)
    }

    /// Pulls up to `max_bytes` from `source` into the ring.
    ///
    /// Returns `Ok(None)` without touching the source when the free
    /// space cannot take `max_bytes` (backpressure; the caller must
    /// retry or drop). Returns `Ok(Some(n))` with the byte count the
    /// source produced, which may be 0 for a dry source.
    ///
    /// # Errors
    ///
    /// Propagates source I/O errors; the write cursor is unchanged in
    /// that case.
    ///
    /// # Panics
    ///
    /// Panics if `max_bytes` exceeds [`MAX_PUSH_BYTES`], the slack the
    /// backing region was sized for.
    pub fn push<S: ByteSource>(
        &mut self,
        source: &mut S,
        max_bytes: usize,
    ) -> io::Result<Option<usize>> {
        assert!(
            max_bytes <= MAX_PUSH_BYTES,
            "push of {max_bytes} bytes exceeds MAX_PUSH_BYTES"
        );
        let shared = &*self.shared;

        let write = shared.write.0.load(Ordering::Relaxed);
        let read = shared.read.0.load(Ordering::Acquire);
        if layout::write_available(write, read, shared.capacity) < max_bytes {
            return Ok(None);
        }

        // SAFETY: [write, write + max_bytes) is unpublished free space
        // (checked above) extended into the slack tail, which only the
        // producer ever touches.
        let buf = unsafe { shared.region.slice_mut(write, max_bytes) };
        let n = source.read(buf)?;
        debug_assert!(n <= max_bytes);

        let end = write + n;
        let new_write = if end > shared.capacity {
            // The write crossed the logical end: fold the overflow back
            // to the physical start before publishing.
            let overflow = end - shared.capacity;
            // SAFETY: [capacity, capacity + overflow) is slack and
            // [0, overflow) is free space (overflow < max_bytes <=
            // free), both producer-owned until the cursor publish.
            unsafe { shared.region.copy_within(shared.capacity, 0, overflow) };
            overflow
        } else if end == shared.capacity {
            0
        } else {
            end
        };

        shared.write.0.store(new_write, Ordering::Release);
        Ok(Some(n))
    }

    /// Spins until the ring has room, then pushes.
    ///
    /// Returns `Ok(None)` only on timeout.
    ///
    /// # Errors
    ///
    /// Propagates source I/O errors, as [`push`](Self::push).
    pub fn push_blocking<S: ByteSource>(
        &mut self,
        source: &mut S,
        max_bytes: usize,
        timeout: Timeout,
    ) -> io::Result<Option<usize>> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            match self.push(source, max_bytes)? {
                Some(n) => return Ok(Some(n)),
                None => {
                    if let Some(dl) = deadline
                        && Instant::now() > dl
                    {
                        return Ok(None);
                    }
                    std::hint::spin_loop();
                }
            }
        }
    }
}

impl RingConsumer {
    /// Drains every currently-readable byte into `sink`.
    ///
    /// The whole readable run is delivered as a single contiguous sink
    /// call; a run that wraps the logical end is first reassembled into
    /// the consumer's scratch buffer. Returns the number of bytes
    /// delivered; `Ok(0)` means the ring was empty (never blocks).
    ///
    /// # Errors
    ///
    /// Propagates the sink's error. The read cursor has already
    /// advanced past the delivered bytes when this happens: the data
    /// was handed over, the sink chose to reject it.
    pub fn pop_all<S: ByteSink>(&mut self, sink: &mut S) -> Result<usize, S::Error> {
        let shared = &*self.shared;

        let write = shared.write.0.load(Ordering::Acquire);
        let read = shared.read.0.load(Ordering::Relaxed);
        let avail = layout::read_available(write, read, shared.capacity);
        if avail == 0 {
            return Ok(0);
        }

        let end = read + avail;
        let (result, new_read) = if end > shared.capacity {
            let first = shared.capacity - read;
            let second = avail - first;
            self.scratch.clear();
            self.scratch.reserve(avail);
            // SAFETY: [read, capacity) and [0, second) are both
            // published and unreleased, hence consumer-owned.
            unsafe {
                self.scratch.extend_from_slice(shared.region.slice(read, first));
                self.scratch.extend_from_slice(shared.region.slice(0, second));
            }
            (sink.consume(&self.scratch), second)
        } else {
            // SAFETY: [read, read + avail) is published and unreleased.
            let run = unsafe { shared.region.slice(read, avail) };
            let result = sink.consume(run);
            (result, if end == shared.capacity { 0 } else { end })
        };

        shared.read.0.store(new_read, Ordering::Release);
        result.map(|()| avail)
    }
}
