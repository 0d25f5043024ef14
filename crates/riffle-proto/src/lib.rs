//! Wire frames for the riffle service protocol.
//!
//! Every signal that crosses the transport - data, terminals, and the
//! control traffic that carries demand and liveness - is a [`Frame`]: a
//! 1-byte tag, an 8-byte big-endian session id, and a variant-specific body.
//! Data frames travel on the data stream, `Error` on the error stream, and
//! the service frames (`Join`, `More`, `Cancel`, heartbeats) on the service
//! stream; the codec itself is stream-agnostic.
//!
//! The codec is intentionally dumb: no versioning, no schema, no payload
//! interpretation. Payloads are opaque bytes and an `Error` frame's message
//! is never rehydrated into a typed error - receivers surface the text as-is.

#![forbid(unsafe_code)]

mod errors;
mod frame;

pub use errors::ProtocolError;
pub use frame::{Frame, HEADER_LEN, UNBOUNDED};
