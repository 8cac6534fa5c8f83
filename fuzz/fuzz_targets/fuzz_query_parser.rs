#![no_main]

use libfuzzer_sys::fuzz_target;
use npsearch::query::{QueryEngine, parse_query};

fuzz_target!(|data: &str| {
    // Parsing may reject input but must never panic; accepted requests must validate or fail cleanly
    if let Ok(request) = parse_query(data) {
        let _ = QueryEngine::with_defaults().validate(&request);
    }
});
