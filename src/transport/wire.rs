use anyhow::bail;
use bytes::{Buf, BufMut};
use num_enum::TryFromPrimitive;

/// Datagrams carrying a different version are dropped without comment.
pub const PROTOCOL_VERSION: u8 = 0;

pub const HEADER_LEN: usize = 3;

/// largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM_LEN: usize = 65_507;

const ACK_FLAG: u8 = 0x20;

/// Ack frames carry the [DeliveryMode::Reliable] bits in the mode field for
///  wire compatibility; receivers look at the ack flag alone.
const ACK_HEADER_BITS: u8 = ACK_FLAG | ((DeliveryMode::Reliable as u8) << 2);

/// The delivery discipline of a frame, three bits of the header's first byte.
///
/// Sequencing and ordering are tracked independently per channel, so a
///  high-frequency telemetry channel never stalls behind a control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum DeliveryMode {
    /// fire and forget
    Unreliable = 0,
    /// unacknowledged, but frames older than the channel watermark are dropped
    UnreliableSequenced = 1,
    /// acknowledged and retransmitted; duplicates are possible
    Reliable = 2,
    /// acknowledged; frames older than the channel watermark are dropped
    ReliableSequenced = 3,
    /// acknowledged and released to the application in strict sequence order
    ReliableOrdered = 4,
}

impl DeliveryMode {
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            DeliveryMode::Reliable | DeliveryMode::ReliableSequenced | DeliveryMode::ReliableOrdered
        )
    }
}

/// The three-byte frame header in front of every datagram:
///
/// ```text
/// byte 0:  [ unused : 2 ][ isAck : 1 ][ mode : 3 ][ version : 2 ]   (MSB..LSB)
/// byte 1:  channel
/// byte 2:  sequence
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHeader {
    Ack { channel: u8, sequence: u8 },
    Data { mode: DeliveryMode, channel: u8, sequence: u8 },
}

impl FrameHeader {
    pub fn try_parse(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        if buf.remaining() < HEADER_LEN {
            bail!("datagram of {} bytes is shorter than the frame header", buf.remaining());
        }
        let flags = buf.get_u8();
        let channel = buf.get_u8();
        let sequence = buf.get_u8();

        let version = flags & 0x03;
        if version != PROTOCOL_VERSION {
            bail!("unsupported protocol version {}", version);
        }

        if flags & ACK_FLAG != 0 {
            // the mode bits of an ack frame are not meaningful
            return Ok(FrameHeader::Ack { channel, sequence });
        }

        let mode = DeliveryMode::try_from((flags >> 2) & 0x07)?;
        Ok(FrameHeader::Data { mode, channel, sequence })
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        match *self {
            FrameHeader::Ack { channel, sequence } => {
                buf.put_u8(PROTOCOL_VERSION | ACK_HEADER_BITS);
                buf.put_u8(channel);
                buf.put_u8(sequence);
            }
            FrameHeader::Data { mode, channel, sequence } => {
                buf.put_u8(PROTOCOL_VERSION | ((mode as u8) << 2));
                buf.put_u8(channel);
                buf.put_u8(sequence);
            }
        }
    }
}

/// Wrap-aware "newer" comparison for 8-bit sequence numbers: a candidate up to
///  half the window ahead of the watermark counts as newer, anything else as a
///  stale duplicate.
pub fn is_seq_newer(candidate: u8, watermark: u8) -> bool {
    let d = candidate.wrapping_sub(watermark);
    d != 0 && d <= 128
}
