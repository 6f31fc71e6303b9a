use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};

/// SHA-1 hex digest of a UTF-8 string.
///
/// SHA-1 is fixed by the persisted-data contract: derived message ids and
/// content hashes must stay byte-compatible with documents written by
/// earlier syncs.
pub(crate) fn sha1_hex(input: &str) -> String {
    hex_encode(digest(&SHA1_FOR_LEGACY_USE_ONLY, input.as_bytes()).as_ref())
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}
