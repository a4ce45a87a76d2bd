#![no_main]

use libfuzzer_sys::fuzz_target;
use wirepool::protocol::decode_message;

fuzz_target!(|data: &[u8]| {
    // Several frames may arrive in one read
    let mut rest = data;
    while let Ok(Some((_, consumed))) = decode_message(rest) {
        assert!(consumed > 0 && consumed <= rest.len());
        rest = &rest[consumed..];
    }
});
