//! Bootstrap networking: the ring buffer, proxy resolution and the blocking
//! HTTPS helper used for the OTP exchange.
//!
//! Everything here runs outside the MQTT transport. The HTTPS client is a
//! deliberately small blocking helper driven from `spawn_blocking` by the
//! connection lifecycle; it is not a general-purpose HTTP stack.

pub mod https;
pub mod proxy;
pub mod ringbuf;

use base64::prelude::*;

/// Base64-encodes `data`, with no embedded line breaks.
pub fn b64_encode(data: &[u8]) -> String {
    BASE64_STANDARD.encode(data)
}

/// Decodes standard Base64, tolerating padding only in the final quantum.
pub fn b64_decode(data: &str) -> Option<Vec<u8>> {
    BASE64_STANDARD.decode(data.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trip() {
        let cases: &[&[u8]] = &[b"", b"a", b"ab", b"abc", b"\x00\xff\x10binary\x7f"];
        for &input in cases {
            let encoded = b64_encode(input);
            assert!(!encoded.contains('\n'));
            assert_eq!(b64_decode(&encoded).unwrap(), input);
        }
    }

    #[test]
    fn base64_rejects_garbage() {
        assert!(b64_decode("not base64 !!!").is_none());
    }
}
