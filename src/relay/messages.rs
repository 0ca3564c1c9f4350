use anyhow::bail;
use bytes::Bytes;

use crate::codec::MessageBuffer;

// Every application frame starts with an i16 opcode. 0..5 are client
// requests, 200.. are server notifications; anything else passes through the
// relay verbatim.
pub const OP_JOIN: i16 = 0;
pub const OP_DISCONNECT: i16 = 1;
pub const OP_CLIENT_STATE: i16 = 2;
pub const OP_VOICE: i16 = 3;
pub const OP_POSITION: i16 = 4;
pub const OP_SKELETAL: i16 = 5;
pub const OP_PEER_JOINED: i16 = 200;
pub const OP_PEER_LEFT: i16 = 201;
pub const OP_ROSTER: i16 = 202;

pub const MIN_UPDATE_RATE: u8 = 1;
pub const MAX_UPDATE_RATE: u8 = 60;

/// high bit of a client-state entry grants audibility, the low seven carry the rate
const AUDIBLE_FLAG: u8 = 0x80;
const RATE_MASK: u8 = 0x7F;

pub struct JoinRequest {
    pub user_id: String,
    pub token: String,
}

/// Parses a join request. The opcode has already been consumed.
pub fn parse_join(msg: &mut MessageBuffer) -> anyhow::Result<JoinRequest> {
    let user_id = msg.read_str()?;
    let token = msg.read_str()?;
    Ok(JoinRequest { user_id, token })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateEntry {
    pub peer_id: i16,
    pub rate: u8,
    pub audible: bool,
}

/// Parses a client-state frame: a count, then `(peer id, packed bits)` pairs.
pub fn parse_client_state(msg: &mut MessageBuffer) -> anyhow::Result<Vec<StateEntry>> {
    let count = msg.read_i16()?;
    if count < 0 {
        bail!("negative client-state entry count {}", count);
    }
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let peer_id = msg.read_i16()?;
        let bits = msg.read_u8()?;
        entries.push(StateEntry {
            peer_id,
            rate: (bits & RATE_MASK).clamp(MIN_UPDATE_RATE, MAX_UPDATE_RATE),
            audible: bits & AUDIBLE_FLAG != 0,
        });
    }
    Ok(entries)
}

pub fn peer_joined(network_id: i16, user_id: &str) -> Bytes {
    let mut msg = MessageBuffer::new();
    msg.write_i16(OP_PEER_JOINED);
    msg.write_i16(network_id);
    msg.write_str(user_id);
    msg.to_bytes()
}

pub fn peer_left(network_id: i16) -> Bytes {
    let mut msg = MessageBuffer::new();
    msg.write_i16(OP_PEER_LEFT);
    msg.write_i16(network_id);
    msg.to_bytes()
}

pub fn roster(entries: &[(i16, &str)]) -> Bytes {
    let mut msg = MessageBuffer::new();
    msg.write_i16(OP_ROSTER);
    msg.write_i16(entries.len() as i16);
    for (network_id, user_id) in entries {
        msg.write_i16(*network_id);
        msg.write_str(user_id);
    }
    msg.to_bytes()
}

/// A position or skeletal frame as fanned out by the server: the opcode, the
///  authoritative sender id, the negotiated rate, and the payload with the
///  sender-supplied id prefix already stripped.
pub fn telemetry(opcode: i16, sender_id: i16, effective_rate: u8, payload: &[u8]) -> Bytes {
    let mut msg = MessageBuffer::new();
    msg.write_i16(opcode);
    msg.write_i16(sender_id);
    msg.write_u8(effective_rate);
    msg.write_bytes(payload);
    msg.to_bytes()
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_parse_join() {
        let mut msg = MessageBuffer::new();
        msg.write_str("u1");
        msg.write_str("t1");

        let mut msg = MessageBuffer::from_bytes(&msg.to_bytes());
        let join = parse_join(&mut msg).unwrap();
        assert_eq!(join.user_id, "u1");
        assert_eq!(join.token, "t1");
    }

    #[rstest]
    #[case::audible_rate_5(0x85, 5, true)]
    #[case::audible_rate_10(0x8A, 10, true)]
    #[case::muted_rate_5(0x05, 5, false)]
    #[case::rate_floor(0x80, MIN_UPDATE_RATE, true)]
    #[case::rate_ceiling(0x7F, MAX_UPDATE_RATE, false)]
    fn test_state_entry_bits(#[case] bits: u8, #[case] rate: u8, #[case] audible: bool) {
        let mut msg = MessageBuffer::new();
        msg.write_i16(1);
        msg.write_i16(9);
        msg.write_u8(bits);

        let mut msg = MessageBuffer::from_bytes(&msg.to_bytes());
        let entries = parse_client_state(&mut msg).unwrap();
        assert_eq!(entries, vec![StateEntry { peer_id: 9, rate, audible }]);
    }

    #[test]
    fn test_parse_client_state_multiple_entries() {
        let mut msg = MessageBuffer::new();
        msg.write_i16(2);
        msg.write_i16(1);
        msg.write_u8(0x85);
        msg.write_i16(2);
        msg.write_u8(0x0A);

        let mut msg = MessageBuffer::from_bytes(&msg.to_bytes());
        let entries = parse_client_state(&mut msg).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], StateEntry { peer_id: 1, rate: 5, audible: true });
        assert_eq!(entries[1], StateEntry { peer_id: 2, rate: 10, audible: false });
    }

    #[test]
    fn test_parse_client_state_truncated_is_an_error() {
        let mut msg = MessageBuffer::new();
        msg.write_i16(2);
        msg.write_i16(1);
        msg.write_u8(0x85);

        let mut msg = MessageBuffer::from_bytes(&msg.to_bytes());
        assert!(parse_client_state(&mut msg).is_err());
    }

    #[test]
    fn test_peer_joined_layout() {
        assert_eq!(
            peer_joined(1, "u2").as_ref(),
            &[200, 0, 1, 0, 2, 0, 0, 0, b'u', b'2']
        );
    }

    #[test]
    fn test_peer_left_layout() {
        assert_eq!(peer_left(259).as_ref(), &[201, 0, 3, 1]);
    }

    #[test]
    fn test_roster_layout() {
        let frame = roster(&[(0, "u1")]);
        assert_eq!(frame.as_ref(), &[202, 0, 1, 0, 0, 0, 2, 0, 0, 0, b'u', b'1']);
    }

    #[test]
    fn test_telemetry_layout() {
        let frame = telemetry(OP_POSITION, 2, 10, &[9, 9, 9]);
        assert_eq!(frame.as_ref(), &[4, 0, 2, 0, 10, 9, 9, 9]);
    }
}
