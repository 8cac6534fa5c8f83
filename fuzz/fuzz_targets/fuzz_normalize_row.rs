#![no_main]

use libfuzzer_sys::fuzz_target;
use npsearch::normalize::{Schema, SchemaVersion, normalize_row, parse_line};

const HEADER: &str = "EIN,NAME,STREET,CITY,STATE,ZIP,NTEE_CD,ASSET_AMT,INCOME_AMT,REVENUE_AMT";

fuzz_target!(|data: &[u8]| {
    let Ok(schema) = Schema::from_header(HEADER, SchemaVersion::default(), b',') else {
        return;
    };
    // Arbitrary bytes either normalize or come back as a rejected row
    if let Ok(normalized) = normalize_row(&parse_line(data, b','), &schema, 0) {
        assert_eq!(normalized.org.ein.as_str().len(), 9);
    }
});
