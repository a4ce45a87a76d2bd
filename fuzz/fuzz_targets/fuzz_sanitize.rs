#![no_main]

use libfuzzer_sys::fuzz_target;
use serde_json::{json, Value};
use wirepool::sanitize::count_placeholders;
use wirepool::{sanitize, Dialect};

fuzz_target!(|data: &[u8]| {
    let Ok(template) = std::str::from_utf8(data) else {
        return;
    };

    let expected = count_placeholders(template);
    let params: Vec<Value> = (0..expected).map(|i| json!(format!("v'{}", i))).collect();

    let positional = sanitize(template, &params, Dialect::Positional).unwrap();
    assert_eq!(positional.values.len(), expected);
    assert_eq!(count_placeholders(&positional.sql), 0);

    let inline = sanitize(template, &params, Dialect::Inline).unwrap();
    assert!(inline.values.is_empty());

    if expected > 0 {
        assert!(sanitize(template, &params[1..], Dialect::Positional).is_err());
    }
});
