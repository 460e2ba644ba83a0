//! End-to-end test of the capture pipeline over loopback UDP.
//!
//! Two redundant byte sources for one channel deliver overlapping
//! sequence ranges; the arbitrated, persisted output must contain each
//! sequence number exactly once, whichever copy arrived first.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=feedcap=trace cargo test --features tracing --test capture_pipeline -- --nocapture
//! ```

use std::net::UdpSocket;
use std::path::Path;
use std::sync::Once;
use std::time::{Duration, Instant};

use feedcap::capture::{FILE_HEADER_SIZE, FILE_MAGIC, RECORD_HEADER_SIZE};
use feedcap::mux::MulticastSocketProvider;
use feedcap::pipeline::MIN_RING_CAPACITY;
use feedcap::wire::{self, Message, OrderRecord, StreamHeader};
use feedcap::{
    CaptureFormat, ChannelConfig, ChannelTable, FeedEndpoint, Pipeline, PipelineConfig, StreamId,
};

static INIT_TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        feedcap::init_tracing();
    });
}

/// Reserves a free UDP port by binding an ephemeral socket and
/// releasing it. A small race window exists, which is acceptable in a
/// test.
fn reserve_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind ephemeral");
    socket.local_addr().expect("local addr").port()
}

fn order_frame(stream: i16, seq: i32) -> Vec<u8> {
    let mut buf = Vec::new();
    wire::encode_frame(
        &mut buf,
        StreamId(stream),
        seq,
        &Message::NewOrder(OrderRecord {
            timestamp: 1_700_000_000_000 + i64::from(seq),
            order_id: f64::from(seq) * 10.0,
            token: 424_242,
            order_kind: b'B',
            price: 101_000 + seq,
            quantity: 5,
        }),
    )
    .expect("encode");
    buf
}

/// Parses the sequence numbers of all complete records in an
/// envelope-format capture file.
fn read_envelope_seqs(path: &Path) -> Vec<i32> {
    let Ok(bytes) = std::fs::read(path) else {
        return Vec::new();
    };
    if bytes.len() < FILE_HEADER_SIZE {
        return Vec::new();
    }
    assert_eq!(
        u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        FILE_MAGIC,
        "capture file must start with the format magic"
    );

    let mut seqs = Vec::new();
    let mut offset = FILE_HEADER_SIZE;
    while offset + RECORD_HEADER_SIZE <= bytes.len() {
        let caplen =
            u32::from_le_bytes(bytes[offset + 8..offset + 12].try_into().unwrap()) as usize;
        let frame_start = offset + RECORD_HEADER_SIZE;
        if frame_start + caplen > bytes.len() {
            break; // record still being written
        }
        let header = StreamHeader::parse(&bytes[frame_start..]).expect("frame header");
        assert_eq!(header.msg_len as usize, caplen);
        seqs.push(header.seq_no);
        offset = frame_start + caplen;
    }
    seqs
}

#[test]
fn redundant_feeds_are_arbitrated_and_persisted_once() {
    init_test_tracing();

    let dir = tempfile::tempdir().expect("tempdir");
    let primary_port = reserve_port();
    let secondary_port = reserve_port();

    let table = ChannelTable::new([ChannelConfig {
        stream_id: StreamId(7),
        primary: FeedEndpoint {
            group: None,
            port: primary_port,
        },
        secondary: FeedEndpoint {
            group: None,
            port: secondary_port,
        },
    }])
    .expect("table");

    let config = PipelineConfig {
        ring_capacity: MIN_RING_CAPACITY,
        capture_dir: dir.path().to_path_buf(),
        format: CaptureFormat::Envelope,
        idle_sleep: Duration::from_micros(100),
        ..PipelineConfig::default()
    };

    let mut provider = MulticastSocketProvider {
        recv_buffer_bytes: 1 << 20,
    };
    let pipeline = Pipeline::spawn(config, &table, &mut provider).expect("spawn");
    let capture_path = pipeline
        .capture_path(StreamId(7))
        .expect("capture path")
        .to_path_buf();

    // Primary delivers [1, 3] (drops 2); secondary delivers
    // [1, 2, 2, 3] (repeats 2). Short gaps keep the arrival order
    // deterministic on loopback.
    let sender = UdpSocket::bind("127.0.0.1:0").expect("bind sender");
    let sends: &[(u16, i32)] = &[
        (primary_port, 1),
        (secondary_port, 1),
        (secondary_port, 2),
        (secondary_port, 2),
        (secondary_port, 3),
        (primary_port, 3),
    ];
    for &(port, seq) in sends {
        sender
            .send_to(&order_frame(7, seq), ("127.0.0.1", port))
            .expect("send");
        std::thread::sleep(Duration::from_millis(2));
    }

    // Wait for the three accepted records to land on disk.
    let deadline = Instant::now() + Duration::from_secs(5);
    let seqs = loop {
        let seqs = read_envelope_seqs(&capture_path);
        if seqs.len() >= 3 || Instant::now() > deadline {
            break seqs;
        }
        std::thread::sleep(Duration::from_millis(10));
    };

    // Accepted sequences are strictly increasing per channel, so the
    // on-disk order is exactly 1, 2, 3 for any interleaving.
    assert_eq!(seqs, vec![1, 2, 3]);

    pipeline.shutdown().expect("shutdown");

    // Nothing more may appear after shutdown; duplicates stayed dropped.
    assert_eq!(read_envelope_seqs(&capture_path), vec![1, 2, 3]);
}

#[test]
fn idle_pipeline_shuts_down_cleanly() {
    init_test_tracing();

    let dir = tempfile::tempdir().expect("tempdir");
    let table = ChannelTable::new([
        ChannelConfig {
            stream_id: StreamId(1),
            primary: FeedEndpoint {
                group: None,
                port: reserve_port(),
            },
            secondary: FeedEndpoint {
                group: None,
                port: reserve_port(),
            },
        },
        ChannelConfig {
            stream_id: StreamId(2),
            primary: FeedEndpoint {
                group: None,
                port: reserve_port(),
            },
            secondary: FeedEndpoint {
                group: None,
                port: reserve_port(),
            },
        },
    ])
    .expect("table");

    let config = PipelineConfig {
        ring_capacity: MIN_RING_CAPACITY,
        capture_dir: dir.path().to_path_buf(),
        format: CaptureFormat::Raw,
        ..PipelineConfig::default()
    };

    let mut provider = MulticastSocketProvider {
        recv_buffer_bytes: 1 << 20,
    };
    let pipeline = Pipeline::spawn(config, &table, &mut provider).expect("spawn");

    // Both capture files exist and are empty in raw mode.
    for stream in [StreamId(1), StreamId(2)] {
        let path = pipeline.capture_path(stream).expect("path").to_path_buf();
        assert_eq!(std::fs::metadata(path).expect("metadata").len(), 0);
    }

    // A channel that never sends is not an error.
    std::thread::sleep(Duration::from_millis(50));
    pipeline.shutdown().expect("shutdown");
}
