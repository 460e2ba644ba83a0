//! Capture pipeline for a redundant multicast market-data feed.
//!
//! A feed is delivered as two independent multicast copies per logical
//! channel (primary + secondary). This crate receives both copies across
//! many non-blocking UDP sockets, moves the raw bytes to a processing
//! thread over a lock-free SPSC byte ring, splits them into
//! length-prefixed frames, accepts each sequence number exactly once
//! (whichever copy arrives first wins), and appends accepted frames to a
//! per-channel capture file.
//!
//! # Architecture
//!
//! Two long-lived threads form the hot path:
//!
//! ```text
//! sockets ──> SocketMux ──> ByteRing ──> FrameDecoder ──> FeedArbiter ──> CaptureWriter
//!             (rx thread)   (SPSC)       (processing thread)
//! ```
//!
//! The rx thread blocks in the readiness wait and pushes every ready
//! datagram into the ring; the processing thread drains the ring, scans
//! frames, deduplicates across the two feed copies, and persists. The
//! ring's two atomic cursors are the only cross-thread state.
//!
//! [`pipeline::Pipeline::spawn`] wires all of this up; the individual
//! stages are usable (and tested) on their own.

pub mod affinity;
pub mod arbiter;
pub mod capture;
pub mod channel;
pub mod decode;
pub mod mux;
pub mod net;
pub mod pipeline;
pub mod ring;
pub(crate) mod trace;
pub mod wire;

pub use arbiter::{FeedArbiter, Verdict};
pub use capture::{CaptureFormat, CaptureWriter};
pub use channel::{ChannelConfig, ChannelTable, FeedEndpoint, StreamId};
pub use pipeline::{Pipeline, PipelineConfig};
pub use trace::init_tracing;
