//! Frame type and codec.
//!
//! Layout on the wire:
//! `[tag: 1 byte] + [session_id: 8 bytes, Big Endian] + [body: variable]`
//!
//! A session id of zero addresses every participant on the stream
//! (broadcast). `More` carries a demand increment where [`UNBOUNDED`] means
//! "no bound"; heartbeat frames echo the requester's nanosecond timestamp so
//! the requester can match replies without any per-request state.
//!
//! # Invariants
//!
//! - Round trip: `decode(encode(f)) == f` for every frame whose payload fits
//!   the transport MTU. The codec itself imposes no size limit; the
//!   publication rejects oversized messages.
//! - `decode` reads exactly the tagged variant's fixed fields and takes the
//!   remainder as payload; it never over-reads.

use bytes::{BufMut, Bytes};

use crate::errors::ProtocolError;

/// Fixed preamble: tag byte plus session id.
pub const HEADER_LEN: usize = 9;

/// Demand value meaning "no bound" in a [`Frame::More`] request.
pub const UNBOUNDED: u64 = u64::MAX;

const TAG_JOIN: u8 = 0x01;
const TAG_MORE: u8 = 0x02;
const TAG_CANCEL: u8 = 0x03;
const TAG_HEARTBEAT_REQUEST: u8 = 0x10;
const TAG_HEARTBEAT_REPLY: u8 = 0x11;
const TAG_NEXT: u8 = 0x20;
const TAG_COMPLETE: u8 = 0x21;
const TAG_ERROR: u8 = 0x22;

/// A single protocol frame.
///
/// Service frames (`Join`, `More`, `Cancel`, `HeartbeatRequest`,
/// `HeartbeatReply`) travel on the service stream; `Next` and `Complete` on
/// the data stream; `Error` on the error stream. Nothing in the encoding
/// enforces that split - senders put frames on the right stream, receivers
/// discard misplaced ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A remote subscriber registers on a sender's outbound stream.
    Join {
        /// Session id proposed by the subscriber; nonzero.
        session_id: u64,
    },

    /// A remote subscriber grants additional demand.
    More {
        /// Session the demand belongs to.
        session_id: u64,
        /// Demand increment; [`UNBOUNDED`] lifts the bound entirely.
        n: u64,
    },

    /// A remote subscriber abandons its session.
    Cancel {
        /// Session being cancelled.
        session_id: u64,
    },

    /// Liveness probe from a subscriber toward its sender.
    HeartbeatRequest {
        /// Session the probe belongs to.
        session_id: u64,
        /// Requester's monotonic clock, nanoseconds.
        sender_nanos: u64,
    },

    /// Sender's answer to a [`Frame::HeartbeatRequest`].
    HeartbeatReply {
        /// Session the reply belongs to.
        session_id: u64,
        /// The `sender_nanos` of the probe being answered.
        echoed_nanos: u64,
    },

    /// One data item.
    Next {
        /// Target session, or zero for broadcast.
        session_id: u64,
        /// Opaque item bytes.
        payload: Bytes,
    },

    /// Terminal: the upstream finished normally.
    Complete {
        /// Target session, or zero for broadcast.
        session_id: u64,
    },

    /// Terminal: the upstream failed.
    Error {
        /// Target session, or zero for broadcast.
        session_id: u64,
        /// UTF-8 error text, possibly empty. Kept as raw bytes; receivers
        /// render it lossily and never reconstruct a typed error from it.
        message: Bytes,
    },
}

impl Frame {
    /// Tag byte identifying this variant on the wire.
    #[must_use]
    pub fn tag(&self) -> u8 {
        match self {
            Self::Join { .. } => TAG_JOIN,
            Self::More { .. } => TAG_MORE,
            Self::Cancel { .. } => TAG_CANCEL,
            Self::HeartbeatRequest { .. } => TAG_HEARTBEAT_REQUEST,
            Self::HeartbeatReply { .. } => TAG_HEARTBEAT_REPLY,
            Self::Next { .. } => TAG_NEXT,
            Self::Complete { .. } => TAG_COMPLETE,
            Self::Error { .. } => TAG_ERROR,
        }
    }

    /// Session id carried in the preamble.
    #[must_use]
    pub fn session_id(&self) -> u64 {
        match self {
            Self::Join { session_id }
            | Self::More { session_id, .. }
            | Self::Cancel { session_id }
            | Self::HeartbeatRequest { session_id, .. }
            | Self::HeartbeatReply { session_id, .. }
            | Self::Next { session_id, .. }
            | Self::Complete { session_id }
            | Self::Error { session_id, .. } => *session_id,
        }
    }

    /// Whether the frame addresses every participant on its stream.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.session_id() == 0
    }

    /// Number of bytes [`Frame::encode`] will write.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + match self {
                Self::Join { .. } | Self::Cancel { .. } | Self::Complete { .. } => 0,
                Self::More { .. }
                | Self::HeartbeatRequest { .. }
                | Self::HeartbeatReply { .. } => 8,
                Self::Next { payload, .. } => payload.len(),
                Self::Error { message, .. } => message.len(),
            }
    }

    /// Encode into `dst`.
    ///
    /// Infallible: the codec imposes no size limit. Callers that care about
    /// the transport MTU check `encoded_len()` against the publication's
    /// maximum message length before offering.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.tag());
        dst.put_u64(self.session_id());

        match self {
            Self::Join { .. } | Self::Cancel { .. } | Self::Complete { .. } => {},
            Self::More { n, .. } => dst.put_u64(*n),
            Self::HeartbeatRequest { sender_nanos, .. } => dst.put_u64(*sender_nanos),
            Self::HeartbeatReply { echoed_nanos, .. } => dst.put_u64(*echoed_nanos),
            Self::Next { payload, .. } => dst.put_slice(payload),
            Self::Error { message, .. } => dst.put_slice(message),
        }
    }

    /// Encode into a freshly allocated buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        Bytes::from(buf)
    }

    /// Decode a frame from wire bytes.
    ///
    /// Variable-length variants (`Next`, `Error`) consume the entire
    /// remainder of `bytes`; trailing garbage after a fixed-length variant is
    /// rejected as truncation of the *next* frame's responsibility, i.e. it
    /// is ignored here - the transport delivers one frame per poll.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::Truncated`] if `bytes` is shorter than the tagged
    ///   variant's fixed fields.
    /// - [`ProtocolError::UnknownTag`] if the tag byte names no variant.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (tag, session_id, body) = split_preamble(bytes)?;

        let frame = match tag {
            TAG_JOIN => Self::Join { session_id },
            TAG_MORE => Self::More { session_id, n: read_u64(body, bytes.len())? },
            TAG_CANCEL => Self::Cancel { session_id },
            TAG_HEARTBEAT_REQUEST => {
                Self::HeartbeatRequest { session_id, sender_nanos: read_u64(body, bytes.len())? }
            },
            TAG_HEARTBEAT_REPLY => {
                Self::HeartbeatReply { session_id, echoed_nanos: read_u64(body, bytes.len())? }
            },
            TAG_NEXT => Self::Next { session_id, payload: Bytes::copy_from_slice(body) },
            TAG_COMPLETE => Self::Complete { session_id },
            TAG_ERROR => Self::Error { session_id, message: Bytes::copy_from_slice(body) },
            tag => return Err(ProtocolError::UnknownTag { tag }),
        };

        Ok(frame)
    }
}

/// Split off the 9-byte preamble, returning `(tag, session_id, body)`.
fn split_preamble(bytes: &[u8]) -> Result<(u8, u64, &[u8]), ProtocolError> {
    let Some((preamble, body)) = bytes.split_at_checked(HEADER_LEN) else {
        return Err(ProtocolError::Truncated { expected: HEADER_LEN, actual: bytes.len() });
    };

    let mut id = [0u8; 8];
    id.copy_from_slice(&preamble[1..HEADER_LEN]);

    Ok((preamble[0], u64::from_be_bytes(id), body))
}

/// Read the fixed 8-byte word that follows the preamble.
fn read_u64(body: &[u8], frame_len: usize) -> Result<u64, ProtocolError> {
    let Some(word) = body.get(..8) else {
        return Err(ProtocolError::Truncated { expected: HEADER_LEN + 8, actual: frame_len });
    };

    let mut buf = [0u8; 8];
    buf.copy_from_slice(word);
    Ok(u64::from_be_bytes(buf))
}
