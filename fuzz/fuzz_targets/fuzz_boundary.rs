//! Fuzz target for content-type boundary extraction.

#![no_main]

use couch_replicator::multipart::boundary_param;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(content_type) = std::str::from_utf8(data) {
        let _ = boundary_param(content_type, "multipart/mixed");
        let _ = boundary_param(content_type, "multipart/related");
    }
});
