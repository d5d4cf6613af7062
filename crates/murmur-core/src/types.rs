//! Core domain types for the Murmur mesh protocol
//!
//! These are the wire-independent domain types. Wire envelopes (the JSON
//! shapes actually exchanged between peers) live in [`crate::wire`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of a message body, in UTF-8 characters.
pub const MAX_TEXT_CHARS: usize = 140;

/// Geographic coordinate attached to a message, if the author opted in.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LatLong {
    pub lat: f64,
    pub long: f64,
}

/// A short text message circulating through the mesh.
///
/// Field invariants (enforced by the setters below, not by construction.
/// Messages arriving over the wire are clamped on receipt by the store):
/// - `text` is truncated to [`MAX_TEXT_CHARS`] chars.
/// - `trust_score` is clamped to `[0, 1]`.
/// - `priority` and `hop_count` are clamped to `>= 0` (they're unsigned, so
/// this is automatic; the clamp helpers exist for symmetry with trust).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub text: String,
    pub trust_score: f64,
    /// Heart / endorsement count. Unified with the wire "priority" field.
    pub priority: u32,
    /// Local-only: whether the current user has hearted this message.
    pub liked: bool,
    pub pseudonym: Option<String>,
    /// Creation time, ms since epoch.
    pub timestamp: u64,
    /// Local receipt time, ms since epoch. `0` until stored.
    pub received_timestamp: u64,
    /// Local-only: whether the current user has read this message.
    pub read: bool,
    pub hop_count: u32,
    /// Gate for relaying: a message is only included in an exchange when the
    /// peer's shared-friend count is at least this value.
    pub min_contacts_for_hop: u32,
    /// Duration in ms after `timestamp` at which the message expires. `0`
    /// means never.
    pub expiration_time: u64,
    pub lat_long: Option<LatLong>,
    pub parent_id: Option<Uuid>,
    pub big_parent_id: Option<Uuid>,
}

impl Message {
    /// Construct a new locally-authored message with sane defaults for the
    /// local-only fields. `now_ms` is the creation timestamp.
    pub fn new(text: impl Into<String>, now_ms: u64) -> Self {
        let mut msg = Self {
            message_id: Uuid::new_v4(),
            text: String::new(),
            trust_score: 0.0,
            priority: 0,
            liked: false,
            pseudonym: None,
            timestamp: now_ms,
            received_timestamp: 0,
            read: false,
            hop_count: 0,
            min_contacts_for_hop: 0,
            expiration_time: 0,
            lat_long: None,
            parent_id: None,
            big_parent_id: None,
        };
        msg.set_text(text);
        msg
    }

    /// Set the body, truncating to [`MAX_TEXT_CHARS`] Unicode scalar values.
    pub fn set_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.text = text.chars().take(MAX_TEXT_CHARS).collect();
    }

    /// Set trust, clamping to `[0, 1]`.
    pub fn set_trust_score(&mut self, trust: f64) {
        self.trust_score = trust.clamp(0.0, 1.0);
    }

    /// Whether this message has expired relative to `now_ms`.
    ///
    /// `expired ⇔ expiration_time > 0 ∧ now > timestamp + expiration_time`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiration_time > 0 && now_ms > self.timestamp.saturating_add(self.expiration_time)
    }

    /// Age in ms relative to `now_ms`, measured from `received_timestamp`
    ///.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.received_timestamp)
    }
}

/// A friend-list entry. Either a full public-key identity, or a hashed
/// phone-number contact; both are opaque byte strings from the PSI-Ca
/// primitive's point of view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FriendEntry {
    /// Hex-encoded DH public key of a known device.
    PublicId { public_id: String, display_name: Option<String> },
    /// SHA-256 of an E.164 phone number, for contacts imported without a
    /// live handshake.
    HashedContact { hash: [u8; 32] },
}

impl FriendEntry {
    /// The opaque bytes PSI-Ca blinds for this entry.
    pub fn psi_bytes(&self) -> Vec<u8> {
        match self {
            FriendEntry::PublicId { public_id,.. } => {
                hex::decode(public_id).unwrap_or_else(|_| public_id.as_bytes().to_vec())
            }
            FriendEntry::HashedContact { hash } => hash.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_is_truncated_at_max_chars() {
        let long = "x".repeat(MAX_TEXT_CHARS + 50);
        let msg = Message::new(long, 0);
        assert_eq!(msg.text.chars().count(), MAX_TEXT_CHARS);
    }

    #[test]
    fn trust_score_is_clamped_to_unit_interval() {
        let mut msg = Message::new("hi", 0);
        msg.set_trust_score(1.5);
        assert_eq!(msg.trust_score, 1.0);
        msg.set_trust_score(-0.5);
        assert_eq!(msg.trust_score, 0.0);
    }

    #[test]
    fn expiry_is_relative_to_timestamp_not_now() {
        let mut msg = Message::new("hi", 1_000);
        msg.expiration_time = 500;
        assert!(!msg.is_expired(1_400));
        assert!(msg.is_expired(1_600));
    }

    #[test]
    fn zero_expiration_never_expires() {
        let msg = Message::new("hi", 1_000);
        assert!(!msg.is_expired(u64::MAX));
    }

    #[test]
    fn psi_bytes_decodes_hex_public_id() {
        let entry = FriendEntry::PublicId { public_id: hex::encode([1u8, 2, 3]), display_name: None };
        assert_eq!(entry.psi_bytes(), vec![1u8, 2, 3]);
    }
}
