//! RFC 5114 §2.1 1024-bit MODP group and device identity
//!
//! Both the per-device DH-1024 identity keypair and the PSI-Ca primitive
//! operate over this single fixed group: a 1024-bit safe-ish prime `p` with
//! generator `g` of a 160-bit-order subgroup `q`. Using one group for both
//! keeps the canonical byte length (128 bytes) and modular arithmetic
//! consistent across the whole crypto core.

use num_bigint::BigUint;
use num_traits::{Num, One};
use once_cell::sync::Lazy;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::canonical::canonicalize_biguint;

const P_HEX: &str = concat!(
    "B10B8F96A080E01DDE92DE5EAE5D54EC52C99FBCFB06A3C6",
    "9A6A9DCA52D23B616073E28675A23D189838EF1E2EE652C0",
    "13ECB4AEA906112324975C3CD49B83BFACCBDD7D90C4BD70",
    "98488E9C219A73724EFFD6FAE5644738FAA31A4FF55BCCC0",
    "A151AF5F0DC8B4BD45BF37DF365C1A65E68CFDA76D4DA708",
    "DF1FB2BC2E4A4371",
);

const G_HEX: &str = concat!(
    "A4D1CBD5C3FD34126765A442EFB99905F8104DD258AC507F",
    "D6406CFF14266D31266FEA1E5C41564B777E690F5504F213",
    "160217B4B01B886A5E91547F9E2749F4D7FBD7D3B9A92EE1",
    "909D0D2263F80A76A6A24C087A091F531DBF0A0169B6A28A",
    "D662A4D18E73AFA32D779D5918D08BC8858F4DCEF97C2A24",
    "855E6EEB22B3B2E5",
);

const Q_HEX: &str = "F518AA8781A8DF278ABA4E7D64B7CB9D49462353";

/// The RFC 5114 1024-bit MODP prime.
pub static P: Lazy<BigUint> = Lazy::new(|| BigUint::from_str_radix(P_HEX, 16).unwrap());
/// The RFC 5114 generator of the 160-bit-order subgroup.
pub static G: Lazy<BigUint> = Lazy::new(|| BigUint::from_str_radix(G_HEX, 16).unwrap());
/// The RFC 5114 subgroup order (prime, ~160 bits).
pub static Q: Lazy<BigUint> = Lazy::new(|| BigUint::from_str_radix(Q_HEX, 16).unwrap());

/// Sample a uniform random exponent in `[2, q)`, for use as a group scalar.
/// Rejects `0` and `1`, matching the sampling
/// restriction PSI-Ca places on its blinding exponent.
pub fn sample_exponent(rng: &mut impl RngCore) -> BigUint {
    loop {
        let mut buf = vec![0u8; Q.to_bytes_be().len()];
        rng.fill_bytes(&mut buf);
        let candidate = BigUint::from_bytes_be(&buf) % &*Q;
        if candidate >= BigUint::from(2u8) {
            return candidate;
        }
    }
}

/// A device's long-lived DH-1024 keypair. A device owns exactly one for
/// life; regenerating it invalidates `device_id`.
#[derive(Clone)]
pub struct DhKeyPair {
    secret: BigUint,
    public: BigUint,
}

impl DhKeyPair {
    /// Generate a fresh keypair.
    pub fn generate(rng: &mut impl RngCore) -> Self {
        let secret = sample_exponent(rng);
        let public = G.modpow(&secret, &P);
        Self { secret, public }
    }

    /// Reconstruct a keypair from a persisted secret scalar.
    pub fn from_secret(secret: BigUint) -> Self {
        let public = G.modpow(&secret, &P);
        Self { secret, public }
    }

    pub fn secret_scalar(&self) -> &BigUint {
        &self.secret
    }

    pub fn public_key(&self) -> &BigUint {
        &self.public
    }

    /// Canonical 128-byte big-endian public key bytes.
    pub fn public_key_bytes(&self) -> [u8; crate::canonical::GROUP_BYTE_LEN] {
        canonicalize_biguint(&self.public)
    }

    /// `device_id`: lowercase hex of the first 8 bytes of
    /// SHA-256(public-key-bytes), the stable, privacy-preserving identifier
    /// used across all transports.
    pub fn device_id(&self) -> String {
        device_id_from_public_key(&self.public_key_bytes())
    }
}

/// Derive a `device_id` from canonical public-key bytes (used both for our
/// own identity and to validate a peer's advertised id after a handshake).
pub fn device_id_from_public_key(public_key_bytes: &[u8]) -> String {
    let digest = Sha256::digest(public_key_bytes);
    hex::encode(&digest[..8])
}

/// Sanity check that `g` generates a subgroup of order `q`: `g^q mod p == 1`.
pub fn group_is_consistent() -> bool {
    G.modpow(&Q, &P) == BigUint::one()
}
