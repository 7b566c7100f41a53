#![no_main]

use bytes::Bytes;
use keel_proto::PlanSet;
use keel_server::messages;
use libfuzzer_sys::fuzz_target;

// Request and response bodies of every registered opcode.
fuzz_target!(|data: &[u8]| {
    let (Ok(registry), Ok(handlers)) = (messages::registry(), messages::handlers()) else { return };
    let Ok(schemas) = messages::announced_schemas(&registry, &handlers) else { return };
    let Ok(plans) = PlanSet::negotiate(&schemas, &registry) else { return };

    let body = Bytes::copy_from_slice(data);
    for entry in handlers.entries() {
        for response in [false, true] {
            if let Some(plan) = plans.get(entry.opcode, response) {
                let _ = plan.decode(&body);
            }
        }
    }
});
