#![no_main]

use keel_proto::{Reader, StreamTable};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut reader = Reader::new(StreamTable::with_max_payload(64 * 1024));
    // One byte at a time exercises every phase boundary.
    for byte in data.chunks(1) {
        if reader.feed(byte).is_err() {
            return;
        }
    }
});
