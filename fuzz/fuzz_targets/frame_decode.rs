//! Fuzz target for Frame::decode
//!
//! Feeds arbitrary byte sequences to the frame decoder to find:
//! - Parser crashes or panics
//! - Integer overflows in length handling
//! - Buffer over-reads
//!
//! The decoder should NEVER panic. All invalid inputs return an error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use riffle_proto::Frame;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must only ever return Ok or Err.
    let _ = Frame::decode(data);
});
