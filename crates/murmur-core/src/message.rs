//! Trust recomputation and combined-priority ordering

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::types::Message;

/// Sigmoid steepness, protocol-locked.
const SIGMOID_STEEPNESS: f64 = 13.0;
/// Sigmoid midpoint (fraction of shared friends at which trust is 0.5).
const SIGMOID_MIDPOINT: f64 = 0.3;
/// Variance of the Gaussian noise added to the trust multiplier.
const NOISE_VARIANCE: f64 = 0.003;
/// Multiplier used when a peer reports zero shared friends.
const ZERO_SHARED_MULT: f64 = 0.001;

/// Recompute the trust multiplier for a peer given `shared_friends` out of
/// `my_friends` total, applying the sigmoid-plus-noise model.
///
/// `rng` supplies the Gaussian noise; tests that need determinism should
/// pass a seeded RNG and check the result lies within the noise band rather
/// than asserting an exact float.
pub fn trust_multiplier(shared_friends: u32, my_friends: u32, rng: &mut impl Rng) -> f64 {
    if shared_friends == 0 {
        return ZERO_SHARED_MULT;
    }
    let fraction = if my_friends == 0 {
        0.0
    } else {
        shared_friends as f64 / my_friends as f64
    };
    let sig = 1.0 / (1.0 + (-SIGMOID_STEEPNESS * (fraction - SIGMOID_MIDPOINT)).exp());
    let normal = Normal::new(0.0, NOISE_VARIANCE.sqrt()).expect("fixed, valid parameters");
    let noise = normal.sample(rng);
    (sig + noise).clamp(0.0, 1.0)
}

/// `new_trust = base_priority * mult`, the per-message trust update applied
/// on every outbound wire encoding and on merge.
pub fn recompute_trust(base_priority: f64, shared_friends: u32, my_friends: u32, rng: &mut impl Rng) -> f64 {
    let mult = trust_multiplier(shared_friends, my_friends, rng);
    (base_priority * mult).clamp(0.0, 1.0)
}

/// `newPriority(remote, stored, shared, mine) = max(sigmoid(remote, shared, mine), stored)`.
/// Merges never reduce stored trust.
pub fn new_priority(remote_base_priority: f64, stored_trust: f64, shared_friends: u32, my_friends: u32, rng: &mut impl Rng) -> f64 {
    let candidate = recompute_trust(remote_base_priority, shared_friends, my_friends, rng);
    candidate.max(stored_trust)
}

/// Half-life for the recency component of combined priority, in ms (8 hours).
const RECENCY_HALF_LIFE_MS: f64 = 8.0 * 60.0 * 60.0 * 1000.0;
/// Below this trust, combined priority is gated to at most 0.3.
const TRUST_GATE_THRESHOLD: f64 = 0.3;
const TRUST_GATE_CEILING: f64 = 0.3;
const MIN_PRIORITY: f64 = 0.01;

/// Combined priority used for exchange ordering and feed display.
///
/// ```text
/// trust_component = 0.50 * trust
/// recency_component = 0.25 * 0.5^(age_ms / 8h)
/// hearts_component = 0.25 * min(1, log10(priority+1) / 2)
/// raw = trust_component + recency_component + hearts_component
/// if trust < 0.3 then raw = min(raw, 0.3)
/// priority = max(0.01, raw)
/// ```
pub fn combined_priority(message: &Message, now_ms: u64) -> f64 {
    let trust_component = 0.50 * message.trust_score;

    let age_ms = message.age_ms(now_ms) as f64;
    let recency_component = 0.25 * 0.5f64.powf(age_ms / RECENCY_HALF_LIFE_MS);

    let hearts_component = 0.25 * (((message.priority as f64 + 1.0).log10() / 2.0).min(1.0));

    let mut raw = trust_component + recency_component + hearts_component;
    if message.trust_score < TRUST_GATE_THRESHOLD {
        raw = raw.min(TRUST_GATE_CEILING);
    }
    raw.max(MIN_PRIORITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn zero_shared_friends_uses_fixed_multiplier() {
        let mut rng = StdRng::seed_from_u64(1);
        let mult = trust_multiplier(0, 10, &mut rng);
        assert_eq!(mult, ZERO_SHARED_MULT);
    }

    #[test]
    fn midpoint_fraction_is_near_half() {
        // shared=3, my=10 => fraction=0.3, the sigmoid midpoint: sig == 0.5 exactly.
        let mut rng = StdRng::seed_from_u64(42);
        let mult = trust_multiplier(3, 10, &mut rng);
        assert!((mult - 0.5).abs() < 0.05, "mult={mult} should be close to 0.5 (S2)");
    }

    #[test]
    fn new_priority_never_lowers_stored_trust() {
        let mut rng = StdRng::seed_from_u64(7);
        let stored = 0.8;
        let result = new_priority(0.1, stored, 1, 100, &mut rng);
        assert!(result >= stored, "newPriority must never lower stored trust");
    }

    #[test]
    fn high_trust_message_ranks_above_stale_low_trust_message() {
        let now = 1_000_000_000u64;
        let mut fresh = Message::new("fresh", now);
        fresh.received_timestamp = now;
        fresh.set_trust_score(0.9);
        fresh.priority = 5;

        let mut stale = Message::new("stale", now);
        stale.received_timestamp = now - (20 * 60 * 60 * 1000);
        stale.set_trust_score(0.1);
        stale.priority = 0;

        assert!(combined_priority(&fresh, now) > combined_priority(&stale, now));
    }

    #[test]
    fn low_trust_is_gated_regardless_of_recency_or_hearts() {
        let now = 1_000_000_000u64;
        let mut msg = Message::new("low trust but fresh and hearted", now);
        msg.received_timestamp = now;
        msg.set_trust_score(0.1);
        msg.priority = 1000;

        let p = combined_priority(&msg, now);
        assert!(p <= TRUST_GATE_CEILING + f64::EPSILON);
    }

    #[test]
    fn priority_never_below_floor() {
        let now = 1_000_000_000u64;
        let mut msg = Message::new("ancient and untrusted", now);
        msg.received_timestamp = 0;
        msg.set_trust_score(0.0);
        msg.priority = 0;

        assert_eq!(combined_priority(&msg, now), MIN_PRIORITY);
    }
}
