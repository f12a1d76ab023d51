//! Fuzz target for the multipart document decoder.
//!
//! This tests that `decode_document` never panics on arbitrary input.

#![no_main]

use couch_replicator::multipart::decode_document;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Malformed bodies must surface as decode errors, never panics
    let _ = decode_document("multipart/mixed; boundary=\"fuzz\"", data);
});
