#![no_main]

use libfuzzer_sys::fuzz_target;
use taskmill_core::failure_queue::{decode_operations, encode_operations};

fuzz_target!(|data: &[u8]| {
    let Ok(operations) = decode_operations(data) else {
        return;
    };
    let encoded = encode_operations(&operations).expect("decoded operations re-encode");
    let again = decode_operations(&encoded).expect("current envelope decodes");
    assert_eq!(again.len(), operations.len());
});
