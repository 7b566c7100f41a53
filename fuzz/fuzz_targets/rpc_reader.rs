#![no_main]

use keel_proto::{Payload, Reader, RpcTable};
use libfuzzer_sys::fuzz_target;

// Arbitrary bytes, split at an arbitrary point, must never panic the RPC
// reader or the session payload decoder.
fuzz_target!(|data: &[u8]| {
    let Some((&split, rest)) = data.split_first() else { return };
    let split = usize::from(split).min(rest.len());
    let (first, second) = rest.split_at(split);

    let mut reader = Reader::new(RpcTable::new());
    for chunk in [first, second] {
        let Ok(frames) = reader.feed(chunk) else { return };
        for frame in frames {
            if frame.header.opcode().is_session() {
                let _ = Payload::from_frame(&frame);
            }
        }
    }
});
