#![no_main]

use libfuzzer_sys::fuzz_target;
use peerwire::wire::{Handshake, HANDSHAKE_LEN};

fuzz_target!(|data: &[u8]| {
    if data.len() < HANDSHAKE_LEN {
        return;
    }
    let mut buf = [0u8; HANDSHAKE_LEN];
    buf.copy_from_slice(&data[..HANDSHAKE_LEN]);

    // Parsing never panics, and anything accepted round-trips
    if let Ok(handshake) = Handshake::parse(&buf) {
        assert_eq!(handshake.encode(), buf);
    }
});
