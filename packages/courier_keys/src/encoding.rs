//! Text encodings for keys and peer ids: Crockford base32 and URL-safe base64 (unpadded).

use std::sync::LazyLock;

use data_encoding::{BASE64URL_NOPAD, DecodeError, Encoding, Specification};

/// Crockford base32 without padding. Decoding is case-insensitive and maps
/// the ambiguous letters `O`, `I` and `L` onto `0`, `1` and `1`.
static CROCKFORD: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str("0123456789ABCDEFGHJKMNPQRSTVWXYZ");
    spec.translate.from.push_str("abcdefghjkmnpqrstvwxyzOoIiLl");
    spec.translate.to.push_str("ABCDEFGHJKMNPQRSTVWXYZ001111");
    spec.encoding().expect("crockford alphabet is a valid base32 specification")
});

pub fn crockford_encode(bytes: &[u8]) -> String {
    CROCKFORD.encode(bytes)
}

pub fn crockford_decode(s: &str) -> Result<Vec<u8>, DecodeError> {
    CROCKFORD.decode(s.as_bytes())
}

pub fn base64_encode(bytes: &[u8]) -> String {
    BASE64URL_NOPAD.encode(bytes)
}

pub fn base64_decode(s: &str) -> Result<Vec<u8>, DecodeError> {
    BASE64URL_NOPAD.decode(s.as_bytes())
}
