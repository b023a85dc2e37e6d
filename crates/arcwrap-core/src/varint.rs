//! Unsigned LEB128 helpers shared by the protobuf and CAR codecs.

use unsigned_varint::{decode, encode};

pub(crate) fn put(out: &mut Vec<u8>, n: u64) {
    let mut buf = encode::u64_buffer();
    out.extend_from_slice(encode::u64(n, &mut buf));
}

/// Decode a varint from the front of `bytes`, returning the value and the rest.
pub(crate) fn take(bytes: &[u8]) -> Result<(u64, &[u8]), String> {
    decode::u64(bytes).map_err(|e| format!("bad varint: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_byte_values() {
        let mut out = Vec::new();
        put(&mut out, 300);
        assert_eq!(out, vec![0xac, 0x02]);
        let (n, rest) = take(&out).unwrap();
        assert_eq!(n, 300);
        assert!(rest.is_empty());
    }

    #[test]
    fn truncated_varint_is_an_error() {
        assert!(take(&[0x80]).is_err());
        assert!(take(&[]).is_err());
    }
}
