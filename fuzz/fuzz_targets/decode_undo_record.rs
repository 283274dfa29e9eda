#![no_main]

use libfuzzer_sys::fuzz_target;
use sombra_undo::storage::undo::{decode, encode};

fuzz_target!(|data: &[u8]| {
    // Anything that decodes must survive another trip through the codec.
    if let Ok(record) = decode(data) {
        let bytes = encode(&record).expect("decoded record re-encodes");
        assert_eq!(decode(&bytes).expect("re-encoded record decodes"), record);
    }
});
