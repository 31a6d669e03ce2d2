#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use peerwire::wire::WireDecoder;
use tokio_util::codec::Decoder;

/// Pull frames until the decoder wants more bytes or rejects the input.
/// Returns false once the decoder errored; its state is undefined after
/// that, matching a closed connection.
fn drain(decoder: &mut WireDecoder, buf: &mut BytesMut) -> bool {
    loop {
        match decoder.decode(buf) {
            Ok(Some(_)) => continue,
            Ok(None) => return true,
            Err(_) => return false,
        }
    }
}

fuzz_target!(|data: &[u8]| {
    // Whole input at once
    let mut decoder = WireDecoder::new(64 * 1024);
    let mut buf = BytesMut::from(data);
    drain(&mut decoder, &mut buf);

    // Byte-at-a-time arrival must behave identically and never panic
    let mut decoder = WireDecoder::new(64 * 1024);
    let mut buf = BytesMut::new();
    for byte in data {
        buf.extend_from_slice(&[*byte]);
        if !drain(&mut decoder, &mut buf) {
            break;
        }
    }
});
