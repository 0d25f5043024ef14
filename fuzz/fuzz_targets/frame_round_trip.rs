//! Fuzz target for the decode/encode round trip.
//!
//! Any bytes that decode successfully must re-encode to a frame that
//! decodes to the same value. Catches asymmetries between the encoder and
//! decoder that unit tests with well-formed frames would miss.

#![no_main]

use libfuzzer_sys::fuzz_target;
use riffle_proto::Frame;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(data) {
        let wire = frame.to_bytes();
        let again = Frame::decode(&wire).expect("re-encoded frame must decode");
        assert_eq!(frame, again);
    }
});
