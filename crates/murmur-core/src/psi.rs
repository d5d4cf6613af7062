//! Private Set Intersection with Cardinality
//!
//! A two-party protocol that reveals only `|A ∩ B|`, never the elements of
//! either set. Built over the RFC 5114 1024-bit MODP group in [`crate::dh`].
//!
//! The three steps map directly onto the three PSI messages in the exchange
//! state machine:
//!
//! 1. [`PsiSession::begin`]: blind our own friend set, send the blinded
//! items as `ClientMessage::friends`.
//! 2. [`PsiSession::reply`]: on receiving the peer's blinded set, double-
//! blind it and self-hash our own blinded set; send both as
//! `ServerMessage{dblind, dhash}`.
//! 3. [`PsiSession::cardinality`]: on receiving the peer's reply, unblind
//! with our own inverse exponent and count matches against the peer's
//! self-hashes.

use num_bigint::BigUint;
use num_traits::One;
use rand::seq::SliceRandom;
use rand::RngCore;
use sha1::{Digest, Sha1};
use std::collections::HashSet;

use crate::canonical::{canonicalize, canonicalize_biguint};
use crate::dh::{sample_exponent, G, P, Q};
use crate::error::{Error, Result};

/// A SHA-1 digest over canonical bytes, as exchanged on the wire
/// (base64-encoded at the wire-codec layer; raw bytes here).
pub type PsiHash = [u8; 20];

fn sha1_canonical(n: &BigUint) -> PsiHash {
    let mut hasher = Sha1::new();
    hasher.update(canonicalize_biguint(n));
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Hash an arbitrary input byte string (a friend-list entry) to a positive
/// big integer, as step 3 requires: `h = SHA1(canonical(v))`.
fn hash_item_to_biguint(item: &[u8]) -> BigUint {
    let canon = canonicalize(item);
    let mut hasher = Sha1::new();
    hasher.update(canon);
    let digest = hasher.finalize();
    BigUint::from_bytes_be(&digest)
}

/// One side's state across a single PSI-Ca round. Holds the private
/// blinding exponent and our own blinded items so the reply step can
/// self-hash them.
pub struct PsiSession {
    /// Private blinding exponent for this round: `x = g^rand mod p`.
    x: BigUint,
    /// Our own blinded items from [`PsiSession::begin`], kept for the
    /// self-hash computed in [`PsiSession::reply`].
    blinded_mine: Vec<BigUint>,
}

impl PsiSession {
    /// Step 1 (client construction): blind our friend set `items`.
    /// Returns the session (to be kept for steps 2–3) and the blinded
    /// items to transmit, already shuffled with a CSPRNG.
    pub fn begin(items: &[Vec<u8>], rng: &mut impl RngCore) -> Result<(Self, Vec<BigUint>)> {
        let x = sample_exponent(rng);
        let mut blinded: Vec<BigUint> = items
        .iter()
        .map(|v| {
                let h = hash_item_to_biguint(v);
                let m = G.modpow(&h, &P);
                m.modpow(&x, &P)
        })
        .collect();
        blinded.shuffle(rng);

        Ok((
                Self {
                    x,
                    blinded_mine: blinded.clone(),
                },
                blinded,
        ))
    }

    /// Step 2 (server reply): given the peer's blinded items `peer_blinded`,
    /// double-blind them with our own exponent and self-hash our own
    /// blinded items. Returns `(dblind, dhash)` to transmit.
    pub fn reply(
        &self,
        peer_blinded: &[BigUint],
        rng: &mut impl RngCore,
    ) -> Result<(Vec<BigUint>, Vec<PsiHash>)> {
        if peer_blinded.is_empty() && self.blinded_mine.is_empty() {
            return Err(Error::InvalidInput("empty blinded sets on both sides".into()));
        }
        for b in peer_blinded {
            validate_group_element(b)?;
        }

        let mut dblind: Vec<BigUint> = peer_blinded.iter().map(|b| b.modpow(&self.x, &P)).collect();
        dblind.shuffle(rng);

        let dhash: Vec<PsiHash> = self.blinded_mine.iter().map(sha1_canonical).collect();

        Ok((dblind, dhash))
    }

    /// Step 3 (cardinality): given the peer's `(dblind, dhash)` reply,
    /// compute the (noisy upper bound on the) intersection size.
    ///
    /// Failure modes: invalid group parameters, negative or
    /// oversized integers, or an empty reply all fail with
    /// [`Error::InvalidInput`]. They never silently return `0`.
    pub fn cardinality(&self, peer_dblind: &[BigUint], peer_dhash: &[PsiHash]) -> Result<usize> {
        if peer_dblind.is_empty() && peer_dhash.is_empty() {
            return Err(Error::InvalidInput("empty PSI reply".into()));
        }
        for b in peer_dblind {
            validate_group_element(b)?;
        }

        let x_mod_q = &self.x % &*Q;
        if x_mod_q == num_bigint::BigUint::from(0u8) {
            return Err(Error::Crypto("degenerate blinding exponent".into()));
        }
        // q is prime: Fermat's little theorem gives the modular inverse.
        let q_minus_2 = &*Q - BigUint::from(2u8);
        let x_inv = x_mod_q.modpow(&q_minus_2, &Q);

        let peer_hash_set: HashSet<PsiHash> = peer_dhash.iter().copied().collect();

        let mut matches = 0usize;
        for b in peer_dblind {
            let u = b.modpow(&x_inv, &P);
            if peer_hash_set.contains(&sha1_canonical(&u)) {
                matches += 1;
            }
        }
        Ok(matches)
    }
}

fn validate_group_element(n: &BigUint) -> Result<()> {
    if n >= &*P {
        return Err(Error::InvalidInput("group element out of range".into()));
    }
    if *n == BigUint::one() || *n == num_bigint::BigUint::from(0u8) {
        return Err(Error::InvalidInput("degenerate group element".into()));
    }
    Ok(())
}
