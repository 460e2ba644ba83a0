//! Two-thread capture pipeline wiring.
//!
//! [`Pipeline::spawn`] builds the ring, the socket multiplexer, and the
//! consumer-side processing chain, then starts the two hot-path
//! threads:
//!
//! - `feedcap-rx`: readiness wait + ring production, pinned to its own
//!   core when the placement allows.
//! - `feedcap-proc`: ring consumption + decode + arbitrate + persist,
//!   pinned to a different core.
//!
//! Neither loop has a natural suspension point besides the readiness
//! wait and the consumer's idle sleep, so shutdown is a checked flag:
//! the producer observes it between readiness waits (forced awake by
//! the mux waker), the consumer between empty polls.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::affinity::{self, CpuConfig};
use crate::arbiter::{FeedArbiter, Verdict};
use crate::capture::{CaptureError, CaptureFormat, CaptureWriter};
use crate::channel::{ChannelTable, StreamId};
use crate::decode::{self, FrameSink, ScanError};
use crate::mux::{MuxError, SocketMux, SocketProvider};
use crate::ring::{self, ByteSink, RingError};
use crate::trace::{error, info};
use crate::wire::{Message, StreamHeader};

/// Default ring capacity: sized so one readiness-wait span of bursting
/// sockets never approaches it.
pub const DEFAULT_RING_CAPACITY: usize = 1 << 30; // 1 GiB

/// Smallest ring the pipeline accepts; pushes are up to
/// [`ring::MAX_PUSH_BYTES`] and a ring that cannot hold a few of them
/// would spin the producer forever.
pub const MIN_RING_CAPACITY: usize = 2 * ring::MAX_PUSH_BYTES;

/// Pipeline construction parameters. No process-wide state: everything
/// a stage needs arrives through here or the channel table.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Ring capacity in bytes (rounded up to page granularity).
    pub ring_capacity: usize,
    /// Back the ring with huge pages.
    pub huge_pages: bool,
    /// Thread placement for the two stages.
    pub cpu: CpuConfig,
    /// Directory for capture files.
    pub capture_dir: PathBuf,
    /// On-disk capture layout.
    pub format: CaptureFormat,
    /// Append to existing capture files instead of creating fresh.
    pub append: bool,
    /// Consumer sleep between empty ring polls.
    pub idle_sleep: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            huge_pages: false,
            cpu: CpuConfig::default(),
            capture_dir: PathBuf::from("."),
            format: CaptureFormat::Envelope,
            append: false,
            idle_sleep: Duration::from_micros(1),
        }
    }
}

/// Errors constructing or tearing down the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The requested ring cannot absorb even a couple of bursts.
    #[error("ring capacity {requested} is below the minimum {minimum}")]
    RingCapacity { requested: usize, minimum: usize },
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// A pipeline thread panicked; state is unrecoverable.
    #[error("{0} thread panicked")]
    Panicked(&'static str),
}

/// Errors that stop the consumer loop.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Scan(#[from] ScanError<CaptureError>),
}

/// Consumer-side processing chain: decode → arbitrate → persist.
///
/// Implements [`ByteSink`] (fed whole ring runs) by scanning frames
/// into itself as the [`FrameSink`]. Kept public so the chain can be
/// driven directly by tests or by embedders that bypass the socket
/// layer (e.g. replaying a recorded byte stream).
pub struct FeedProcessor {
    arbiter: FeedArbiter,
    capture: CaptureWriter,
}

impl FeedProcessor {
    #[must_use]
    pub fn new(capture: CaptureWriter) -> Self {
        Self {
            arbiter: FeedArbiter::new(),
            capture,
        }
    }

    /// Arbitration state, for diagnostics.
    #[must_use]
    pub fn arbiter(&self) -> &FeedArbiter {
        &self.arbiter
    }
}

impl FrameSink for FeedProcessor {
    type Error = CaptureError;

    fn on_frame(
        &mut self,
        header: StreamHeader,
        _message: &Message,
        raw: &[u8],
    ) -> Result<(), Self::Error> {
        match self.arbiter.accept(header.stream(), header.seq_no) {
            Verdict::Accepted => {
                self.capture.ingest(raw)?;
                Ok(())
            }
            Verdict::Duplicate => Ok(()),
        }
    }
}

impl ByteSink for FeedProcessor {
    type Error = ProcessError;

    fn consume(&mut self, run: &[u8]) -> Result<(), Self::Error> {
        decode::scan(run, self)?;
        Ok(())
    }
}

/// Handle to the running capture pipeline.
///
/// Dropping the handle signals shutdown without waiting for the
/// threads; use [`Pipeline::shutdown`] for a joined teardown.
#[derive(Debug)]
pub struct Pipeline {
    shutdown_flag: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
    producer_handle: Option<JoinHandle<Result<(), MuxError>>>,
    consumer_handle: Option<JoinHandle<Result<(), ProcessError>>>,
    capture_paths: Vec<(StreamId, PathBuf)>,
}

impl Pipeline {
    /// Builds every stage and spawns the two pipeline threads.
    ///
    /// All resource acquisition (sockets, ring memory, capture files)
    /// happens on the calling thread before anything starts running, so
    /// a failure here leaves no partially-initialized pipeline behind.
    ///
    /// # Errors
    ///
    /// Surfaces the first resource-acquisition failure.
    ///
    /// # Panics
    ///
    /// Panics if thread spawning fails.
    pub fn spawn<P: SocketProvider>(
        config: PipelineConfig,
        table: &ChannelTable,
        provider: &mut P,
    ) -> Result<Self, PipelineError> {
        if config.ring_capacity < MIN_RING_CAPACITY {
            return Err(PipelineError::RingCapacity {
                requested: config.ring_capacity,
                minimum: MIN_RING_CAPACITY,
            });
        }

        info!(
            channels = table.len(),
            ring_capacity = config.ring_capacity,
            huge_pages = config.huge_pages,
            "pipeline starting"
        );

        let (mut ring_producer, mut ring_consumer) =
            ring::channel(config.ring_capacity, config.huge_pages)?;
        let mut mux = SocketMux::open(table, provider)?;
        let waker = mux.waker();
        let capture =
            CaptureWriter::create(table, &config.capture_dir, config.format, config.append)?;
        let capture_paths = table
            .iter()
            .filter_map(|c| {
                capture
                    .path(c.stream_id)
                    .map(|p| (c.stream_id, p.to_path_buf()))
            })
            .collect();
        let mut processor = FeedProcessor::new(capture);

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let placement = config.cpu.resolve();
        let idle_sleep = config.idle_sleep;

        let producer_shutdown = Arc::clone(&shutdown_flag);
        let producer_handle = thread::Builder::new()
            .name("feedcap-rx".into())
            .spawn(move || {
                affinity::pin_if_assigned(placement.producer_core);
                mux.run(&mut ring_producer, &producer_shutdown)
            })
            .expect("failed to spawn rx thread");

        let consumer_shutdown = Arc::clone(&shutdown_flag);
        let consumer_handle = thread::Builder::new()
            .name("feedcap-proc".into())
            .spawn(move || {
                affinity::pin_if_assigned(placement.consumer_core);
                info!("consumer loop started");
                loop {
                    match ring_consumer.pop_all(&mut processor) {
                        Ok(0) => {
                            // Everything drained; this is the only spot
                            // where stopping cannot lose buffered bytes.
                            if consumer_shutdown.load(Ordering::Acquire) {
                                break;
                            }
                            thread::sleep(idle_sleep);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(error = %e, "consumer loop stopping on decode failure");
                            return Err(e);
                        }
                    }
                }
                info!(
                    accepted = processor.arbiter().total_accepted(),
                    duplicates = processor.arbiter().total_duplicates(),
                    "consumer loop stopped"
                );
                Ok(())
            })
            .expect("failed to spawn processing thread");

        Ok(Self {
            shutdown_flag,
            waker,
            producer_handle: Some(producer_handle),
            consumer_handle: Some(consumer_handle),
            capture_paths,
        })
    }

    /// Capture file path for one stream.
    #[must_use]
    pub fn capture_path(&self, stream: StreamId) -> Option<&Path> {
        self.capture_paths
            .iter()
            .find(|(s, _)| *s == stream)
            .map(|(_, p)| p.as_path())
    }

    /// Signals both threads to stop and joins them.
    ///
    /// The producer is forced out of its readiness wait via the waker;
    /// the consumer exits once the ring is drained.
    ///
    /// # Errors
    ///
    /// Returns the first error either loop ended with, or
    /// [`PipelineError::Panicked`] if a thread died.
    pub fn shutdown(mut self) -> Result<(), PipelineError> {
        info!("pipeline shutdown initiated");
        self.shutdown_flag.store(true, Ordering::Release);
        let _ = self.waker.wake();

        if let Some(handle) = self.producer_handle.take() {
            handle
                .join()
                .map_err(|_| PipelineError::Panicked("rx"))??;
        }
        if let Some(handle) = self.consumer_handle.take() {
            handle
                .join()
                .map_err(|_| PipelineError::Panicked("processing"))??;
        }
        info!("pipeline shutdown complete");
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        // Signal shutdown if not already done; shutdown() is the
        // joining teardown path.
        self.shutdown_flag.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}
