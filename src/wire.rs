//! Exchange wire format for feed frames.
//!
//! ## Wire Format
//!
//! All multi-byte integers are little-endian, packed with no padding.
//! Every frame starts with a fixed 8-byte header:
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────┐
//! │ msg_len (i2) │ stream_id (i2)│ seq_no (i4)  │
//! └──────────────┴───────────────┴──────────────┘
//! ```
//!
//! `msg_len` counts the whole frame including the header and is
//! authoritative for scanning. `seq_no == 0` is the unsequenced
//! sentinel (heartbeats). The header is followed by a one-byte ASCII
//! message tag and a fixed-size record selected by that tag:
//!
//! | Tag  | Message              | Record                  | Size |
//! |------|----------------------|-------------------------|------|
//! | `N`  | new order            | [`OrderRecord`]         | 29   |
//! | `M`  | modify order         | [`OrderRecord`]         | 29   |
//! | `X`  | cancel order         | [`OrderRecord`]         | 29   |
//! | `T`  | trade                | [`TradeRecord`]         | 36   |
//! | `G`  | new spread order     | [`OrderRecord`]         | 29   |
//! | `H`  | modify spread order  | [`OrderRecord`]         | 29   |
//! | `J`  | cancel spread order  | [`OrderRecord`]         | 29   |
//! | `K`  | spread trade         | [`TradeRecord`]         | 36   |
//! | `Z`  | heartbeat            | [`HeartbeatRecord`]     | 4    |
//! | `R`  | recovery request     | [`RecoveryRequestRecord`] | 10 |
//! | `Y`  | recovery response    | [`RecoveryResponseRecord`] | 1 |
//!
//! A frame may declare a length longer than header + tag + record
//! (declared length wins for advancement); decoding never reads past
//! the declared length nor past the record the tag promises.

use thiserror::Error;

use crate::channel::StreamId;

/// Size of the frame header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Message type tags, ASCII per the exchange specification.
pub mod tag {
    pub const NEW_SPREAD_ORDER: u8 = b'G';
    pub const MODIFY_SPREAD_ORDER: u8 = b'H';
    pub const CANCEL_SPREAD_ORDER: u8 = b'J';
    pub const SPREAD_TRADE: u8 = b'K';
    pub const MODIFY_ORDER: u8 = b'M';
    pub const NEW_ORDER: u8 = b'N';
    pub const TRADE: u8 = b'T';
    pub const CANCEL_ORDER: u8 = b'X';
    pub const HEARTBEAT: u8 = b'Z';
    pub const RECOVERY_REQUEST: u8 = b'R';
    pub const RECOVERY_RESPONSE: u8 = b'Y';
}

/// Errors during frame encode/decode.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// A record extends past the frame's declared length.
    #[error("record extends past the declared frame length")]
    UnexpectedEnd,
    /// The frame is too short to contain the header and tag byte.
    #[error("frame too short for header and tag ({0} bytes)")]
    TooShort(usize),
    /// Encoding was asked to serialize an unknown-tag message.
    #[error("cannot encode message with unknown tag 0x{0:02x}")]
    UnknownTag(u8),
}

/// Fixed frame header: declared length, stream id, sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Total frame length in bytes, including this header.
    pub msg_len: i16,
    /// Logical channel the frame belongs to.
    pub stream_id: i16,
    /// Sequence number; 0 means unsequenced.
    pub seq_no: i32,
}

impl StreamHeader {
    /// Parses a header from the start of `buf`.
    ///
    /// Returns `None` if fewer than [`HEADER_SIZE`] bytes are available.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            msg_len: i16::from_le_bytes([buf[0], buf[1]]),
            stream_id: i16::from_le_bytes([buf[2], buf[3]]),
            seq_no: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// Appends the wire form of this header to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.msg_len.to_le_bytes());
        out.extend_from_slice(&self.stream_id.to_le_bytes());
        out.extend_from_slice(&self.seq_no.to_le_bytes());
    }

    /// The stream id as a typed channel key.
    #[must_use]
    pub const fn stream(&self) -> StreamId {
        StreamId(self.stream_id)
    }
}

/// Order record, shared by the order and spread-order message families.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderRecord {
    pub timestamp: i64,
    pub order_id: f64,
    pub token: i32,
    pub order_kind: u8,
    pub price: i32,
    pub quantity: i32,
}

impl OrderRecord {
    pub const SIZE: usize = 29;
}

/// Trade record, shared by the trade and spread-trade messages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeRecord {
    pub timestamp: i64,
    pub buy_order_id: f64,
    pub sell_order_id: f64,
    pub token: i32,
    pub price: i32,
    pub quantity: i32,
}

impl TradeRecord {
    pub const SIZE: usize = 36;
}

/// Heartbeat record: echoes the stream's latest sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatRecord {
    pub seq_no: i32,
}

impl HeartbeatRecord {
    pub const SIZE: usize = 4;
}

/// Tick-recovery request record (decoded but not acted on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryRequestRecord {
    pub stream_id: i16,
    pub start_seq: i32,
    pub end_seq: i32,
}

impl RecoveryRequestRecord {
    pub const SIZE: usize = 10;
}

/// Tick-recovery response record (decoded but not acted on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryResponseRecord {
    pub status: u8,
}

impl RecoveryResponseRecord {
    pub const SIZE: usize = 1;
}

/// One decoded feed message, keyed by the frame's type tag.
///
/// Unknown tags are preserved rather than rejected so new message types
/// pass through the pipeline unharmed (forward compatibility).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Message {
    NewOrder(OrderRecord),
    ModifyOrder(OrderRecord),
    CancelOrder(OrderRecord),
    Trade(TradeRecord),
    NewSpreadOrder(OrderRecord),
    ModifySpreadOrder(OrderRecord),
    CancelSpreadOrder(OrderRecord),
    SpreadTrade(TradeRecord),
    Heartbeat(HeartbeatRecord),
    RecoveryRequest(RecoveryRequestRecord),
    RecoveryResponse(RecoveryResponseRecord),
    Unknown { tag: u8 },
}

impl Message {
    /// The wire tag for this message.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::NewOrder(_) => tag::NEW_ORDER,
            Self::ModifyOrder(_) => tag::MODIFY_ORDER,
            Self::CancelOrder(_) => tag::CANCEL_ORDER,
            Self::Trade(_) => tag::TRADE,
            Self::NewSpreadOrder(_) => tag::NEW_SPREAD_ORDER,
            Self::ModifySpreadOrder(_) => tag::MODIFY_SPREAD_ORDER,
            Self::CancelSpreadOrder(_) => tag::CANCEL_SPREAD_ORDER,
            Self::SpreadTrade(_) => tag::SPREAD_TRADE,
            Self::Heartbeat(_) => tag::HEARTBEAT,
            Self::RecoveryRequest(_) => tag::RECOVERY_REQUEST,
            Self::RecoveryResponse(_) => tag::RECOVERY_RESPONSE,
            Self::Unknown { tag } => *tag,
        }
    }

    /// The fixed record size the tag promises, if the tag is known.
    #[must_use]
    pub const fn record_size(&self) -> Option<usize> {
        match self {
            Self::NewOrder(_)
            | Self::ModifyOrder(_)
            | Self::CancelOrder(_)
            | Self::NewSpreadOrder(_)
            | Self::ModifySpreadOrder(_)
            | Self::CancelSpreadOrder(_) => Some(OrderRecord::SIZE),
            Self::Trade(_) | Self::SpreadTrade(_) => Some(TradeRecord::SIZE),
            Self::Heartbeat(_) => Some(HeartbeatRecord::SIZE),
            Self::RecoveryRequest(_) => Some(RecoveryRequestRecord::SIZE),
            Self::RecoveryResponse(_) => Some(RecoveryResponseRecord::SIZE),
            Self::Unknown { .. } => None,
        }
    }
}

/// Reader for decoding records from a frame body.
struct WireReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> WireReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        if self.cursor + N > self.buf.len() {
            return Err(WireError::UnexpectedEnd);
        }
        let mut arr = [0u8; N];
        arr.copy_from_slice(&self.buf[self.cursor..self.cursor + N]);
        self.cursor += N;
        Ok(arr)
    }

    fn take_u8(&mut self) -> Result<u8, WireError> {
        self.take::<1>().map(|[b]| b)
    }

    fn take_i16(&mut self) -> Result<i16, WireError> {
        self.take::<2>().map(i16::from_le_bytes)
    }

    fn take_i32(&mut self) -> Result<i32, WireError> {
        self.take::<4>().map(i32::from_le_bytes)
    }

    fn take_i64(&mut self) -> Result<i64, WireError> {
        self.take::<8>().map(i64::from_le_bytes)
    }

    fn take_f64(&mut self) -> Result<f64, WireError> {
        self.take::<8>().map(f64::from_le_bytes)
    }
}

/// Writer for encoding records into a byte buffer.
struct WireWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> WireWriter<'a> {
    fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_i16(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn read_order(r: &mut WireReader<'_>) -> Result<OrderRecord, WireError> {
    Ok(OrderRecord {
        timestamp: r.take_i64()?,
        order_id: r.take_f64()?,
        token: r.take_i32()?,
        order_kind: r.take_u8()?,
        price: r.take_i32()?,
        quantity: r.take_i32()?,
    })
}

fn read_trade(r: &mut WireReader<'_>) -> Result<TradeRecord, WireError> {
    Ok(TradeRecord {
        timestamp: r.take_i64()?,
        buy_order_id: r.take_f64()?,
        sell_order_id: r.take_f64()?,
        token: r.take_i32()?,
        price: r.take_i32()?,
        quantity: r.take_i32()?,
    })
}

fn write_order(w: &mut WireWriter<'_>, o: &OrderRecord) {
    w.put_i64(o.timestamp);
    w.put_f64(o.order_id);
    w.put_i32(o.token);
    w.put_u8(o.order_kind);
    w.put_i32(o.price);
    w.put_i32(o.quantity);
}

fn write_trade(w: &mut WireWriter<'_>, t: &TradeRecord) {
    w.put_i64(t.timestamp);
    w.put_f64(t.buy_order_id);
    w.put_f64(t.sell_order_id);
    w.put_i32(t.token);
    w.put_i32(t.price);
    w.put_i32(t.quantity);
}

/// Decodes the message body of a complete frame.
///
/// `frame` must already be bounded to the declared `msg_len`, so record
/// decoding can never read past the frame. Extra bytes between the
/// record and the declared end are ignored (frames may carry padding).
///
/// # Errors
///
/// Returns [`WireError::TooShort`] if the frame cannot contain header +
/// tag, or [`WireError::UnexpectedEnd`] if a known tag's record does
/// not fit inside the declared length.
pub fn decode_message(frame: &[u8]) -> Result<Message, WireError> {
    if frame.len() <= HEADER_SIZE {
        return Err(WireError::TooShort(frame.len()));
    }
    let msg_tag = frame[HEADER_SIZE];
    let mut r = WireReader::new(&frame[HEADER_SIZE + 1..]);

    let message = match msg_tag {
        tag::NEW_ORDER => Message::NewOrder(read_order(&mut r)?),
        tag::MODIFY_ORDER => Message::ModifyOrder(read_order(&mut r)?),
        tag::CANCEL_ORDER => Message::CancelOrder(read_order(&mut r)?),
        tag::TRADE => Message::Trade(read_trade(&mut r)?),
        tag::NEW_SPREAD_ORDER => Message::NewSpreadOrder(read_order(&mut r)?),
        tag::MODIFY_SPREAD_ORDER => Message::ModifySpreadOrder(read_order(&mut r)?),
        tag::CANCEL_SPREAD_ORDER => Message::CancelSpreadOrder(read_order(&mut r)?),
        tag::SPREAD_TRADE => Message::SpreadTrade(read_trade(&mut r)?),
        tag::HEARTBEAT => Message::Heartbeat(HeartbeatRecord {
            seq_no: r.take_i32()?,
        }),
        tag::RECOVERY_REQUEST => Message::RecoveryRequest(RecoveryRequestRecord {
            stream_id: r.take_i16()?,
            start_seq: r.take_i32()?,
            end_seq: r.take_i32()?,
        }),
        tag::RECOVERY_RESPONSE => Message::RecoveryResponse(RecoveryResponseRecord {
            status: r.take_u8()?,
        }),
        other => Message::Unknown { tag: other },
    };

    Ok(message)
}

/// Encodes a complete frame (header + tag + record) into `buf`.
///
/// The declared length is exactly header + tag + record with no
/// padding. The buffer is appended to, not cleared, so callers can
/// batch several frames into one datagram.
///
/// # Errors
///
/// Returns [`WireError::UnknownTag`] for [`Message::Unknown`], which
/// has no record shape to serialize.
pub fn encode_frame(
    buf: &mut Vec<u8>,
    stream: StreamId,
    seq_no: i32,
    message: &Message,
) -> Result<(), WireError> {
    let record_size = message
        .record_size()
        .ok_or(WireError::UnknownTag(message.tag()))?;
    let msg_len = (HEADER_SIZE + 1 + record_size) as i16;

    StreamHeader {
        msg_len,
        stream_id: stream.0,
        seq_no,
    }
    .write_to(buf);

    let mut w = WireWriter::new(buf);
    w.put_u8(message.tag());
    match message {
        Message::NewOrder(o)
        | Message::ModifyOrder(o)
        | Message::CancelOrder(o)
        | Message::NewSpreadOrder(o)
        | Message::ModifySpreadOrder(o)
        | Message::CancelSpreadOrder(o) => write_order(&mut w, o),
        Message::Trade(t) | Message::SpreadTrade(t) => write_trade(&mut w, t),
        Message::Heartbeat(h) => w.put_i32(h.seq_no),
        Message::RecoveryRequest(req) => {
            w.put_i16(req.stream_id);
            w.put_i32(req.start_seq);
            w.put_i32(req.end_seq);
        }
        Message::RecoveryResponse(rsp) => w.put_u8(rsp.status),
        Message::Unknown { .. } => unreachable!("rejected above"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_eight_bytes_le() {
        let mut buf = Vec::new();
        StreamHeader {
            msg_len: 38,
            stream_id: 7,
            seq_no: 0x0102_0304,
        }
        .write_to(&mut buf);

        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(buf, [38, 0, 7, 0, 0x04, 0x03, 0x02, 0x01]);

        let parsed = StreamHeader::parse(&buf).unwrap();
        assert_eq!(parsed.msg_len, 38);
        assert_eq!(parsed.stream(), StreamId(7));
        assert_eq!(parsed.seq_no, 0x0102_0304);
    }

    #[test]
    fn header_parse_rejects_short_input() {
        assert!(StreamHeader::parse(&[1, 2, 3]).is_none());
    }

    #[test]
    fn order_frame_round_trip() {
        let order = OrderRecord {
            timestamp: 1_700_000_000_123,
            order_id: 4_500_000_001.0,
            token: 56789,
            order_kind: b'B',
            price: 102_550,
            quantity: 75,
        };

        let mut buf = Vec::new();
        encode_frame(&mut buf, StreamId(3), 42, &Message::NewOrder(order)).unwrap();

        assert_eq!(buf.len(), HEADER_SIZE + 1 + OrderRecord::SIZE);
        let header = StreamHeader::parse(&buf).unwrap();
        assert_eq!(header.msg_len as usize, buf.len());
        assert_eq!(header.seq_no, 42);

        match decode_message(&buf).unwrap() {
            Message::NewOrder(decoded) => assert_eq!(decoded, order),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn trade_frame_round_trip() {
        let trade = TradeRecord {
            timestamp: 1_700_000_000_456,
            buy_order_id: 4_500_000_001.0,
            sell_order_id: 4_500_000_002.0,
            token: 56789,
            price: 102_600,
            quantity: 10,
        };

        let mut buf = Vec::new();
        encode_frame(&mut buf, StreamId(5), 7, &Message::SpreadTrade(trade)).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 1 + TradeRecord::SIZE);

        match decode_message(&buf).unwrap() {
            Message::SpreadTrade(decoded) => assert_eq!(decoded, trade),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn heartbeat_keeps_zero_sequence() {
        let mut buf = Vec::new();
        encode_frame(
            &mut buf,
            StreamId(1),
            0,
            &Message::Heartbeat(HeartbeatRecord { seq_no: 900 }),
        )
        .unwrap();

        let header = StreamHeader::parse(&buf).unwrap();
        assert_eq!(header.seq_no, 0);
        match decode_message(&buf).unwrap() {
            Message::Heartbeat(h) => assert_eq!(h.seq_no, 900),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn recovery_messages_round_trip() {
        let request = RecoveryRequestRecord {
            stream_id: 7,
            start_seq: 100,
            end_seq: 250,
        };
        let mut buf = Vec::new();
        encode_frame(&mut buf, StreamId(7), 0, &Message::RecoveryRequest(request)).unwrap();
        match decode_message(&buf).unwrap() {
            Message::RecoveryRequest(decoded) => assert_eq!(decoded, request),
            other => panic!("unexpected message: {other:?}"),
        }

        let mut buf = Vec::new();
        encode_frame(
            &mut buf,
            StreamId(7),
            0,
            &Message::RecoveryResponse(RecoveryResponseRecord { status: b'A' }),
        )
        .unwrap();
        match decode_message(&buf).unwrap() {
            Message::RecoveryResponse(decoded) => assert_eq!(decoded.status, b'A'),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_preserved() {
        let mut buf = Vec::new();
        StreamHeader {
            msg_len: 12,
            stream_id: 2,
            seq_no: 5,
        }
        .write_to(&mut buf);
        buf.push(b'Q');
        buf.extend_from_slice(&[0, 0, 0]);

        assert_eq!(decode_message(&buf).unwrap(), Message::Unknown { tag: b'Q' });
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut buf = Vec::new();
        // Declares a trade but carries only 4 bytes of record.
        StreamHeader {
            msg_len: 13,
            stream_id: 2,
            seq_no: 5,
        }
        .write_to(&mut buf);
        buf.push(tag::TRADE);
        buf.extend_from_slice(&[0, 0, 0, 0]);

        assert_eq!(decode_message(&buf).unwrap_err(), WireError::UnexpectedEnd);
    }

    #[test]
    fn padding_after_record_is_ignored() {
        let mut buf = Vec::new();
        encode_frame(
            &mut buf,
            StreamId(1),
            3,
            &Message::Heartbeat(HeartbeatRecord { seq_no: 3 }),
        )
        .unwrap();
        // Widen the declared length and append padding.
        let padded_len = (buf.len() + 6) as i16;
        buf[0..2].copy_from_slice(&padded_len.to_le_bytes());
        buf.extend_from_slice(&[0xAA; 6]);

        match decode_message(&buf).unwrap() {
            Message::Heartbeat(h) => assert_eq!(h.seq_no, 3),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn encode_rejects_unknown_tag() {
        let mut buf = Vec::new();
        let err = encode_frame(&mut buf, StreamId(1), 1, &Message::Unknown { tag: 0x7f });
        assert_eq!(err.unwrap_err(), WireError::UnknownTag(0x7f));
    }
}
