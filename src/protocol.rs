//! Wire codec for the boop protocol.
//!
//! Messages are single text frames, each beginning with a one-byte tag.
//! Integers are base-36, lowercase, unpadded, 1..=11 characters (the full
//! 53-bit safe-integer range fits in eleven digits).
//!
//! # Frames
//!
//! ```text
//! Tag  Direction  Payload                    Meaning
//! h    both       (none)                     heartbeat / heartbeat-ack
//! b    C→S        <boopId>                   boop request
//! d    C→S        <queryId>                  cooldown query
//! b    S→C        <boopId>                   boop accepted
//! r    S→C        <boopId>,<cooldownMs>      boop rejected, wait ms
//! d    S→C        <queryId>[,<cooldownMs>]   cooldown reply (omitted = 0)
//! c    S→C        <count>                    current global count
//! i    S→C        (none)                     last frame was invalid
//! ```
//!
//! Decoding a frame that matches no recognized pattern yields
//! [`MalformedFrame`] and never a partial value.

use std::fmt;

use crate::constants::MAX_WIRE_INT_DIGITS;

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A frame the client sends to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFrame {
    /// Keepalive; the server echoes it back.
    Heartbeat,
    /// Request to admit one boop, correlated by a client-assigned id.
    Boop(u64),
    /// Ask for the current cooldown without attempting a boop.
    CooldownQuery(u64),
}

/// A frame the server sends to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFrame {
    /// Heartbeat ack.
    Heartbeat,
    /// The boop with this id was admitted.
    BoopAccepted(u64),
    /// The boop with this id was rejected; retry after `cooldown_ms`.
    BoopRejected {
        /// Echoed client-assigned boop id.
        boop_id: u64,
        /// Remaining cooldown in milliseconds.
        cooldown_ms: u64,
    },
    /// Reply to a cooldown query. `cooldown_ms == 0` means boops are
    /// currently admissible; the field is omitted on the wire.
    CooldownReply {
        /// Echoed client-assigned query id.
        query_id: u64,
        /// Remaining cooldown in milliseconds.
        cooldown_ms: u64,
    },
    /// Current global count (optimistic: includes unsynced admissions).
    Count(u64),
    /// The last client frame did not decode; the connection continues.
    InvalidFrame,
}

/// Error returned when a text frame matches no recognized pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MalformedFrame;

impl fmt::Display for MalformedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed frame")
    }
}

impl std::error::Error for MalformedFrame {}

/// Encode a non-negative integer as lowercase base-36.
pub fn encode_int(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = [0u8; 16];
    let mut i = buf.len();
    while n > 0 {
        i -= 1;
        buf[i] = BASE36_DIGITS[(n % 36) as usize];
        n /= 36;
    }
    String::from_utf8_lossy(&buf[i..]).into_owned()
}

/// Decode a lowercase base-36 integer of 1..=11 digits.
///
/// Anything else (empty, too wide, uppercase, non-alphanumeric) is rejected.
pub fn decode_int(text: &str) -> Result<u64, MalformedFrame> {
    if text.is_empty() || text.len() > MAX_WIRE_INT_DIGITS {
        return Err(MalformedFrame);
    }
    let mut n: u64 = 0;
    for b in text.bytes() {
        let digit = match b {
            b'0'..=b'9' => u64::from(b - b'0'),
            b'a'..=b'z' => u64::from(b - b'a') + 10,
            _ => return Err(MalformedFrame),
        };
        n = n * 36 + digit;
    }
    Ok(n)
}

impl ClientFrame {
    /// Encode to a wire frame.
    pub fn encode(&self) -> String {
        match self {
            Self::Heartbeat => "h".to_string(),
            Self::Boop(id) => format!("b{}", encode_int(*id)),
            Self::CooldownQuery(id) => format!("d{}", encode_int(*id)),
        }
    }

    /// Decode a text frame received from a client.
    pub fn decode(text: &str) -> Result<Self, MalformedFrame> {
        match text.as_bytes().first() {
            Some(b'h') if text.len() == 1 => Ok(Self::Heartbeat),
            Some(b'b') => Ok(Self::Boop(decode_int(&text[1..])?)),
            Some(b'd') => Ok(Self::CooldownQuery(decode_int(&text[1..])?)),
            _ => Err(MalformedFrame),
        }
    }
}

impl ServerFrame {
    /// Encode to a wire frame.
    pub fn encode(&self) -> String {
        match self {
            Self::Heartbeat => "h".to_string(),
            Self::BoopAccepted(id) => format!("b{}", encode_int(*id)),
            Self::BoopRejected {
                boop_id,
                cooldown_ms,
            } => format!("r{},{}", encode_int(*boop_id), encode_int(*cooldown_ms)),
            Self::CooldownReply {
                query_id,
                cooldown_ms: 0,
            } => format!("d{}", encode_int(*query_id)),
            Self::CooldownReply {
                query_id,
                cooldown_ms,
            } => format!("d{},{}", encode_int(*query_id), encode_int(*cooldown_ms)),
            Self::Count(n) => format!("c{}", encode_int(*n)),
            Self::InvalidFrame => "i".to_string(),
        }
    }

    /// Decode a text frame received from the server.
    pub fn decode(text: &str) -> Result<Self, MalformedFrame> {
        match text.as_bytes().first() {
            Some(b'h') if text.len() == 1 => Ok(Self::Heartbeat),
            Some(b'i') if text.len() == 1 => Ok(Self::InvalidFrame),
            Some(b'b') => Ok(Self::BoopAccepted(decode_int(&text[1..])?)),
            Some(b'c') => Ok(Self::Count(decode_int(&text[1..])?)),
            Some(b'r') => {
                let (id, ms) = text[1..].split_once(',').ok_or(MalformedFrame)?;
                Ok(Self::BoopRejected {
                    boop_id: decode_int(id)?,
                    cooldown_ms: decode_int(ms)?,
                })
            }
            Some(b'd') => match text[1..].split_once(',') {
                None => Ok(Self::CooldownReply {
                    query_id: decode_int(&text[1..])?,
                    cooldown_ms: 0,
                }),
                Some((id, ms)) => Ok(Self::CooldownReply {
                    query_id: decode_int(id)?,
                    cooldown_ms: decode_int(ms)?,
                }),
            },
            _ => Err(MalformedFrame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_int_known_vectors() {
        assert_eq!(encode_int(0), "0");
        assert_eq!(encode_int(35), "z");
        assert_eq!(encode_int(36), "10");
        assert_eq!(encode_int(42), "16");
        assert_eq!(encode_int(43), "17");
        assert_eq!(encode_int(1001), "rt");
    }

    #[test]
    fn test_decode_int_rejects_bad_input() {
        assert!(decode_int("").is_err());
        assert!(decode_int("A").is_err());
        assert!(decode_int("1 2").is_err());
        assert!(decode_int("-1").is_err());
        // Twelve digits exceeds the wire width even if numerically valid.
        assert!(decode_int("100000000000").is_err());
        // Eleven digits is the maximum.
        assert_eq!(decode_int("zzzzzzzzzzz"), Ok(36u64.pow(11) - 1));
    }

    #[test]
    fn test_client_frame_round_trip() {
        let frames = [
            ClientFrame::Heartbeat,
            ClientFrame::Boop(0),
            ClientFrame::Boop(1001),
            ClientFrame::CooldownQuery(7),
        ];
        for frame in frames {
            assert_eq!(ClientFrame::decode(&frame.encode()), Ok(frame));
        }
    }

    #[test]
    fn test_server_frame_round_trip() {
        let frames = [
            ServerFrame::Heartbeat,
            ServerFrame::BoopAccepted(12),
            ServerFrame::BoopRejected {
                boop_id: 3,
                cooldown_ms: 59_950,
            },
            ServerFrame::CooldownReply {
                query_id: 1,
                cooldown_ms: 0,
            },
            ServerFrame::CooldownReply {
                query_id: 1,
                cooldown_ms: 1_800_000,
            },
            ServerFrame::Count(43),
            ServerFrame::InvalidFrame,
        ];
        for frame in frames {
            assert_eq!(ServerFrame::decode(&frame.encode()), Ok(frame));
        }
    }

    #[test]
    fn test_cooldown_reply_omits_zero_field() {
        let frame = ServerFrame::CooldownReply {
            query_id: 1,
            cooldown_ms: 0,
        };
        assert_eq!(frame.encode(), "d1");
    }

    #[test]
    fn test_client_decode_rejects_malformed() {
        for text in [
            "", "x", "b", "d", "hh", "h1", "bA", "b1,2", "r1,2", "c5", "i",
            "b100000000000",
        ] {
            assert_eq!(ClientFrame::decode(text), Err(MalformedFrame), "{text:?}");
        }
    }

    #[test]
    fn test_server_decode_rejects_malformed() {
        for text in ["", "x", "r1", "r1,", "r,2", "d", "c", "ii", "b"] {
            assert_eq!(ServerFrame::decode(text), Err(MalformedFrame), "{text:?}");
        }
    }

    #[test]
    fn test_count_frame_matches_base36_display() {
        // A stored count of 42 goes out as "c16".
        assert_eq!(ServerFrame::Count(42).encode(), "c16");
    }
}
