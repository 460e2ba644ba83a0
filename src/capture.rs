//! Per-channel persistence of accepted frames.
//!
//! Each channel gets its own capture file, named deterministically from
//! the channel's identity and the capture date so restarts on the same
//! day find the same file. Two on-disk layouts are supported:
//!
//! - [`CaptureFormat::Envelope`]: the legacy nanosecond packet-capture
//!   convention — a 24-byte file header followed by records of
//!   `{ts_sec, ts_nsec, caplen, orig_len}` + raw frame bytes — so
//!   existing replay tooling keeps working.
//! - [`CaptureFormat::Raw`]: raw frame bytes, nothing else.
//!
//! The writer applies the same sequence-dedup rule as the arbiter
//! against its own per-channel counter. This is defense in depth: the
//! sink stays correct even when invoked directly without an arbiter in
//! front of it, or when appending after a restart mid-day.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use thiserror::Error;

use crate::channel::{ChannelConfig, ChannelTable, StreamId};
use crate::trace::{debug, info};
use crate::wire::StreamHeader;

/// Magic of the nanosecond-resolution capture file convention.
pub const FILE_MAGIC: u32 = 0xa1b2_3c4d;
/// Format version written to the file header.
pub const FILE_VERSION: (u16, u16) = (2, 4);
/// Maximum record size advertised in the file header.
pub const FILE_SNAPLEN: u32 = 0x10000;
/// Link type advertised in the file header (0 = no link-layer header).
pub const FILE_LINKTYPE: u32 = 0;
/// Size of the file-level header in bytes.
pub const FILE_HEADER_SIZE: usize = 24;
/// Size of each per-record envelope header in bytes.
pub const RECORD_HEADER_SIZE: usize = 16;

/// On-disk layout of a capture file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    /// Capture-file envelope around each frame.
    Envelope,
    /// Raw frame bytes only.
    Raw,
}

impl CaptureFormat {
    const fn extension(self) -> &'static str {
        match self {
            Self::Envelope => "pcap",
            Self::Raw => "bin",
        }
    }
}

/// Errors from the capture writer.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A capture file could not be created or opened.
    #[error("failed to open capture file `{path}`")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The file-level header could not be written.
    #[error("failed to write capture file header to `{path}`")]
    Header {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A frame too short to carry a header was offered.
    #[error("frame of {0} bytes is too short to carry a header")]
    BadFrame(usize),
    /// The frame's channel id has no open capture file. Indicates a
    /// channel-table mismatch between receiver and writer.
    #[error("no capture file open for stream {0}")]
    UnknownChannel(StreamId),
    /// The record write failed; the file position may be mid-record.
    #[error("write failed for stream {0}")]
    Write(StreamId, #[source] io::Error),
    /// The record was only partially written; the file position is now
    /// mid-record and the channel must be reopened before further use.
    #[error("short write for stream {stream}: {written} of {expected} bytes")]
    ShortWrite {
        stream: StreamId,
        written: usize,
        expected: usize,
    },
    /// A previous write failure latched this channel; reopen to resume.
    #[error("stream {0} stopped accepting writes after an earlier failure")]
    ChannelFailed(StreamId),
}

#[derive(Debug)]
struct ChannelFile {
    file: File,
    path: PathBuf,
    /// Highest sequence number written; mirrors the arbiter's rule.
    last_seq: i64,
    /// Latched on write failure: the file position is untrustworthy.
    failed: bool,
}

/// Appends accepted frames to one file per channel.
#[derive(Debug)]
pub struct CaptureWriter {
    channels: BTreeMap<StreamId, ChannelFile>,
    format: CaptureFormat,
    /// Reused serialization buffer so each record is one write call.
    record_buf: Vec<u8>,
}

/// Deterministic capture file name for one channel on one date:
/// `{primary_ip, dots as underscores}__{primary_port}__{stream_id}__{YYYY_MM_DD}.{pcap|bin}`.
#[must_use]
pub fn capture_file_name(config: &ChannelConfig, format: CaptureFormat, date: NaiveDate) -> String {
    let ip = match config.primary.group {
        Some(group) => group.to_string().replace('.', "_"),
        None => "0_0_0_0".to_string(),
    };
    format!(
        "{ip}__{port}__{stream}__{date}.{ext}",
        port = config.primary.port,
        stream = config.stream_id,
        date = date.format("%Y_%m_%d"),
        ext = format.extension(),
    )
}

fn write_file_header(file: &mut File) -> io::Result<()> {
    let mut header = Vec::with_capacity(FILE_HEADER_SIZE);
    header.extend_from_slice(&FILE_MAGIC.to_le_bytes());
    header.extend_from_slice(&FILE_VERSION.0.to_le_bytes());
    header.extend_from_slice(&FILE_VERSION.1.to_le_bytes());
    header.extend_from_slice(&0i32.to_le_bytes()); // thiszone
    header.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
    header.extend_from_slice(&FILE_SNAPLEN.to_le_bytes());
    header.extend_from_slice(&FILE_LINKTYPE.to_le_bytes());
    file.write_all(&header)
}

impl CaptureWriter {
    /// Opens one capture file per channel in `dir`.
    ///
    /// With `append == false` each file is created fresh and, in
    /// envelope mode, stamped with the file header; a file that already
    /// exists is opened for append instead (the restart-on-the-same-day
    /// case). With `append == true` files must already exist.
    ///
    /// # Errors
    ///
    /// Fails fast on the first file that cannot be opened; no partially
    /// initialized writer is returned.
    pub fn create(
        table: &ChannelTable,
        dir: impl AsRef<Path>,
        format: CaptureFormat,
        append: bool,
    ) -> Result<Self, CaptureError> {
        let dir = dir.as_ref();
        let today = Utc::now().date_naive();
        let mut channels = BTreeMap::new();

        for config in table.iter() {
            let path = dir.join(capture_file_name(config, format, today));
            let file = Self::open_channel_file(&path, format, append)?;
            info!(stream = %config.stream_id, path = %path.display(), "capture file open");
            channels.insert(
                config.stream_id,
                ChannelFile {
                    file,
                    path,
                    last_seq: 0,
                    failed: false,
                },
            );
        }

        Ok(Self {
            channels,
            format,
            record_buf: Vec::with_capacity(FILE_SNAPLEN as usize),
        })
    }

    fn open_channel_file(
        path: &Path,
        format: CaptureFormat,
        append: bool,
    ) -> Result<File, CaptureError> {
        let open_err = |source| CaptureError::Open {
            path: path.to_path_buf(),
            source,
        };

        if append {
            return OpenOptions::new().append(true).open(path).map_err(open_err);
        }

        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                if format == CaptureFormat::Envelope {
                    write_file_header(&mut file).map_err(|source| CaptureError::Header {
                        path: path.to_path_buf(),
                        source,
                    })?;
                }
                Ok(file)
            }
            // Pre-existing file: fall back to appending to it.
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                OpenOptions::new().append(true).open(path).map_err(open_err)
            }
            Err(e) => Err(open_err(e)),
        }
    }

    /// Path of the capture file for one stream.
    #[must_use]
    pub fn path(&self, stream: StreamId) -> Option<&Path> {
        self.channels.get(&stream).map(|c| c.path.as_path())
    }

    /// Persists one frame, deduplicating by sequence number.
    ///
    /// Returns the number of bytes written, or 0 when the frame is a
    /// duplicate. Unsequenced frames (`seq_no == 0`) bypass dedup and
    /// are always written.
    ///
    /// # Errors
    ///
    /// See [`CaptureError`]. Write failures latch the channel: further
    /// ingests for it fail until the writer is recreated.
    pub fn ingest(&mut self, frame: &[u8]) -> Result<usize, CaptureError> {
        let header = StreamHeader::parse(frame).ok_or(CaptureError::BadFrame(frame.len()))?;
        let stream = header.stream();
        let channel = self
            .channels
            .get_mut(&stream)
            .ok_or(CaptureError::UnknownChannel(stream))?;

        if channel.failed {
            return Err(CaptureError::ChannelFailed(stream));
        }

        // Same accept rule as the arbiter; unsequenced frames pass.
        if header.seq_no != 0 {
            let seq = i64::from(header.seq_no);
            if seq <= channel.last_seq {
                debug!(stream = %stream, seq, "duplicate sequence, not persisted");
                return Ok(0);
            }
            channel.last_seq = seq;
        }

        self.record_buf.clear();
        if self.format == CaptureFormat::Envelope {
            let now = Utc::now();
            self.record_buf
                .extend_from_slice(&(now.timestamp() as u32).to_le_bytes());
            self.record_buf
                .extend_from_slice(&now.timestamp_subsec_nanos().to_le_bytes());
            self.record_buf
                .extend_from_slice(&(frame.len() as u32).to_le_bytes());
            self.record_buf
                .extend_from_slice(&(frame.len() as u32).to_le_bytes());
        }
        self.record_buf.extend_from_slice(frame);

        // One write call per record: a short count here means the file
        // position is mid-record, which poisons the channel.
        match channel.file.write(&self.record_buf) {
            Ok(written) if written == self.record_buf.len() => Ok(written),
            Ok(written) => {
                channel.failed = true;
                Err(CaptureError::ShortWrite {
                    stream,
                    written,
                    expected: self.record_buf.len(),
                })
            }
            Err(e) => {
                channel.failed = true;
                Err(CaptureError::Write(stream, e))
            }
        }
    }
}
