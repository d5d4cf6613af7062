//! Canonical byte encoding for PSI-Ca
//!
//! All values hashed or exponentiated inside the PSI-Ca primitive are first
//! reduced to a canonical 128-byte big-endian representation: left-padded
//! with zeros, any excess high-order bytes dropped. This is a protocol
//! contract, not an implementation detail. Deviating in either direction
//! breaks cardinality between two peers.
//!
//! We represent group elements as [`num_bigint::BigUint`] throughout, which
//! has no sign bit and therefore no sign byte to strip on `to_bytes_be`
//! (unlike a signed-BigInteger implementation, which must drop a leading
//! 0x00 added to keep the top bit from reading as negative).

use num_bigint::BigUint;

/// Canonical byte length for the RFC 5114 1024-bit MODP group (§4.1).
pub const GROUP_BYTE_LEN: usize = 128;

/// Canonicalize an arbitrary byte string to [`GROUP_BYTE_LEN`] bytes,
/// big-endian, left-zero-padded.
///
/// If `bytes` is longer than [`GROUP_BYTE_LEN`], the excess high-order bytes are dropped: this is
/// equivalent to reducing the big-endian integer modulo `2^(128*8)`, which
/// is what any implementation that treats an oversized byte string as "too
/// big to be a group element" must do to stay within the field.
pub fn canonicalize(bytes: &[u8]) -> [u8; GROUP_BYTE_LEN] {
    let mut out = [0u8; GROUP_BYTE_LEN];
    if bytes.len() >= GROUP_BYTE_LEN {
        out.copy_from_slice(&bytes[bytes.len() - GROUP_BYTE_LEN..]);
    } else {
        out[GROUP_BYTE_LEN - bytes.len()..].copy_from_slice(bytes);
    }
    out
}

/// Canonicalize a group element (a [`BigUint`] known to be `< p`) to its
/// fixed 128-byte representation.
pub fn canonicalize_biguint(n: &BigUint) -> [u8; GROUP_BYTE_LEN] {
    canonicalize(&n.to_bytes_be())
}
