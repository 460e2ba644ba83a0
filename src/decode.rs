//! Frame decoder: splits contiguous byte runs into length-prefixed
//! frames and dispatches them by message tag.
//!
//! The decoder trusts nothing about the input beyond the ring's
//! delivery guarantees: the declared length alone drives advancement,
//! and record decoding is bounded by it. A frame whose declared length
//! cannot possibly be valid poisons the rest of the run — there is no
//! way to find the next frame boundary — so scanning stops with a
//! reportable error and the caller decides policy (a feed process may
//! prefer to drop the run and keep running rather than die).

use thiserror::Error;

use crate::trace::warn;
use crate::wire::{self, HEADER_SIZE, Message, StreamHeader, WireError};

/// Receives each decoded frame during a scan.
pub trait FrameSink {
    type Error;

    /// Called once per frame with the parsed header, the decoded
    /// message, and the raw frame bytes (header included, exactly
    /// `header.msg_len` long).
    ///
    /// # Errors
    ///
    /// Implementation-defined; aborts the scan via
    /// [`ScanError::Sink`].
    fn on_frame(
        &mut self,
        header: StreamHeader,
        message: &Message,
        raw: &[u8],
    ) -> Result<(), Self::Error>;
}

/// Outcome of a successful scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// Frames dispatched to the sink.
    pub frames: usize,
    /// Bytes left unconsumed at the end of the run (0 on success; the
    /// field exists so callers need not assume it).
    pub remaining: usize,
}

/// Errors that abort a scan.
#[derive(Debug, Error)]
pub enum ScanError<E> {
    /// The frame's declared length cannot contain its own header and
    /// tag. Non-positive lengths from the wire land here; advancing by
    /// such a length would rescan garbage forever.
    #[error("frame at offset {offset} declares unusable length {len}")]
    BadLength { offset: usize, len: i16 },
    /// The run ends before the declared frame does. Datagrams carry
    /// whole frames, so this indicates corruption, not a partial read.
    #[error("frame at offset {offset} declares {declared} bytes but only {available} remain")]
    TruncatedFrame {
        offset: usize,
        declared: usize,
        available: usize,
    },
    /// A known tag's record did not fit inside the declared length.
    #[error("frame at offset {offset} carries a malformed record")]
    Record {
        offset: usize,
        #[source]
        source: WireError,
    },
    /// The sink rejected a frame.
    #[error("sink rejected frame at offset {offset}")]
    Sink {
        offset: usize,
        #[source]
        source: E,
    },
}

/// Walks `run` from offset 0 and dispatches every frame to `sink`.
///
/// Unknown message tags are logged and passed through unharmed
/// (forward compatibility); structurally invalid frames abort the scan
/// with the offending offset.
///
/// # Errors
///
/// See [`ScanError`]. Frames dispatched before the error stay
/// dispatched.
pub fn scan<S: FrameSink>(run: &[u8], sink: &mut S) -> Result<ScanReport, ScanError<S::Error>> {
    let mut offset = 0;
    let mut frames = 0;

    while offset < run.len() {
        let rest = &run[offset..];
        let Some(header) = StreamHeader::parse(rest) else {
            return Err(ScanError::TruncatedFrame {
                offset,
                declared: HEADER_SIZE,
                available: rest.len(),
            });
        };

        // msg_len must at least cover header + tag; this also catches
        // non-positive lengths from the wire.
        if header.msg_len as i32 <= HEADER_SIZE as i32 {
            return Err(ScanError::BadLength {
                offset,
                len: header.msg_len,
            });
        }
        let declared = header.msg_len as usize;
        if declared > rest.len() {
            return Err(ScanError::TruncatedFrame {
                offset,
                declared,
                available: rest.len(),
            });
        }

        let raw = &rest[..declared];
        let message = wire::decode_message(raw)
            .map_err(|source| ScanError::Record { offset, source })?;
        if matches!(message, Message::Unknown { .. }) {
            warn!(
                offset,
                tag = message.tag(),
                "unknown message tag, passing frame through"
            );
        }

        sink.on_frame(header, &message, raw)
            .map_err(|source| ScanError::Sink { offset, source })?;

        frames += 1;
        offset += declared;
    }

    Ok(ScanReport {
        frames,
        remaining: run.len() - offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StreamId;
    use crate::wire::{HeartbeatRecord, tag};
    use std::convert::Infallible;

    /// Sink that records (header, tag, frame length) per dispatch.
    #[derive(Default)]
    struct RecordingSink {
        frames: Vec<(StreamHeader, u8, usize)>,
    }

    impl FrameSink for RecordingSink {
        type Error = Infallible;

        fn on_frame(
            &mut self,
            header: StreamHeader,
            message: &Message,
            raw: &[u8],
        ) -> Result<(), Self::Error> {
            assert_eq!(header.msg_len as usize, raw.len());
            self.frames.push((header, message.tag(), raw.len()));
            Ok(())
        }
    }

    /// Builds a heartbeat frame padded out to `total_len` bytes.
    fn padded_heartbeat(stream: i16, seq: i32, total_len: i16) -> Vec<u8> {
        let mut buf = Vec::new();
        StreamHeader {
            msg_len: total_len,
            stream_id: stream,
            seq_no: seq,
        }
        .write_to(&mut buf);
        buf.push(tag::HEARTBEAT);
        buf.extend_from_slice(&seq.to_le_bytes());
        buf.resize(total_len as usize, 0);
        buf
    }

    #[test]
    fn scans_three_concatenated_frames() {
        let mut run = Vec::new();
        run.extend_from_slice(&padded_heartbeat(7, 1, 24));
        {
            // Frame of 40 bytes: an order record with 2 bytes padding.
            let mut frame = Vec::new();
            crate::wire::encode_frame(
                &mut frame,
                StreamId(7),
                2,
                &Message::NewOrder(crate::wire::OrderRecord {
                    timestamp: 1,
                    order_id: 2.0,
                    token: 3,
                    order_kind: b'S',
                    price: 4,
                    quantity: 5,
                }),
            )
            .unwrap();
            frame[0..2].copy_from_slice(&40i16.to_le_bytes());
            frame.resize(40, 0);
            run.extend_from_slice(&frame);
        }
        run.extend_from_slice(&padded_heartbeat(7, 3, 16));

        let mut sink = RecordingSink::default();
        let report = scan(&run, &mut sink).unwrap();

        assert_eq!(report.frames, 3);
        assert_eq!(report.remaining, 0);

        let lens: Vec<usize> = sink.frames.iter().map(|f| f.2).collect();
        assert_eq!(lens, vec![24, 40, 16]);

        // Offsets follow from the cumulative lengths: 0, 24, 64.
        let offsets: Vec<usize> = lens
            .iter()
            .scan(0, |acc, len| {
                let here = *acc;
                *acc += len;
                Some(here)
            })
            .collect();
        assert_eq!(offsets, vec![0, 24, 64]);
    }

    #[test]
    fn zero_length_frame_aborts_with_no_dispatch() {
        let mut run = Vec::new();
        StreamHeader {
            msg_len: 0,
            stream_id: 7,
            seq_no: 1,
        }
        .write_to(&mut run);
        run.extend_from_slice(&[0u8; 16]);

        let mut sink = RecordingSink::default();
        let err = scan(&run, &mut sink).unwrap_err();
        assert!(matches!(err, ScanError::BadLength { offset: 0, len: 0 }));
        assert!(sink.frames.is_empty());
    }

    #[test]
    fn negative_length_frame_aborts() {
        let mut run = Vec::new();
        StreamHeader {
            msg_len: -24,
            stream_id: 7,
            seq_no: 1,
        }
        .write_to(&mut run);
        run.extend_from_slice(&[0u8; 16]);

        let mut sink = RecordingSink::default();
        let err = scan(&run, &mut sink).unwrap_err();
        assert!(matches!(err, ScanError::BadLength { offset: 0, len: -24 }));
    }

    #[test]
    fn frames_before_a_bad_one_stay_dispatched() {
        let mut run = Vec::new();
        run.extend_from_slice(&padded_heartbeat(3, 10, 16));
        StreamHeader {
            msg_len: 0,
            stream_id: 3,
            seq_no: 11,
        }
        .write_to(&mut run);

        let mut sink = RecordingSink::default();
        let err = scan(&run, &mut sink).unwrap_err();
        assert!(matches!(err, ScanError::BadLength { offset: 16, len: 0 }));
        assert_eq!(sink.frames.len(), 1);
    }

    #[test]
    fn frame_past_end_of_run_is_truncated() {
        let mut run = padded_heartbeat(3, 10, 32);
        run.truncate(20);

        let mut sink = RecordingSink::default();
        let err = scan(&run, &mut sink).unwrap_err();
        assert!(matches!(
            err,
            ScanError::TruncatedFrame {
                offset: 0,
                declared: 32,
                available: 20
            }
        ));
    }

    #[test]
    fn unknown_tag_is_dispatched_not_dropped() {
        let mut run = Vec::new();
        StreamHeader {
            msg_len: 12,
            stream_id: 2,
            seq_no: 9,
        }
        .write_to(&mut run);
        run.push(b'Q');
        run.extend_from_slice(&[0, 0, 0]);

        let mut sink = RecordingSink::default();
        let report = scan(&run, &mut sink).unwrap();
        assert_eq!(report.frames, 1);
        assert_eq!(sink.frames[0].1, b'Q');
    }

    #[test]
    fn short_record_for_known_tag_is_an_error() {
        let mut run = Vec::new();
        StreamHeader {
            msg_len: 10,
            stream_id: 2,
            seq_no: 9,
        }
        .write_to(&mut run);
        run.push(tag::HEARTBEAT);
        run.push(0); // heartbeat record needs 4 bytes, only 1 present

        let mut sink = RecordingSink::default();
        let err = scan(&run, &mut sink).unwrap_err();
        assert!(matches!(
            err,
            ScanError::Record {
                offset: 0,
                source: WireError::UnexpectedEnd
            }
        ));
    }

    #[test]
    fn empty_run_is_a_clean_noop() {
        let mut sink = RecordingSink::default();
        let report = scan(&[], &mut sink).unwrap();
        assert_eq!(report, ScanReport { frames: 0, remaining: 0 });
    }

    #[test]
    fn heartbeat_message_decodes_inside_scan() {
        let run = padded_heartbeat(4, 0, 16);

        struct HeartbeatSink {
            seen: Option<i32>,
        }
        impl FrameSink for HeartbeatSink {
            type Error = Infallible;
            fn on_frame(
                &mut self,
                _header: StreamHeader,
                message: &Message,
                _raw: &[u8],
            ) -> Result<(), Self::Error> {
                if let Message::Heartbeat(HeartbeatRecord { seq_no }) = message {
                    self.seen = Some(*seq_no);
                }
                Ok(())
            }
        }

        let mut sink = HeartbeatSink { seen: None };
        scan(&run, &mut sink).unwrap();
        assert_eq!(sink.seen, Some(0));
    }
}
