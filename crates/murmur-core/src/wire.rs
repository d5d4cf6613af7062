//! Wire envelope shapes for the exchange protocol
//!
//! These are the exact JSON shapes exchanged between peers. Field names are
//! a protocol contract. They must be preserved bit-for-bit, so every field
//! below carries an explicit `#[serde(rename = "...")]` even where it would
//! already match Rust's default (de)serialization, to make the contract
//! visible at the call site rather than implicit in naming convention.
//!
//! Framing (the 4-byte length prefix around these bodies) lives in
//! `murmur-net`, which is the layer that owns the byte stream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{LatLong, Message};

/// A message as it appears inside a `ClientMessage.messages` array.
/// Field names are fixed by the protocol:
/// `messageId, text, trust, priority, pseudonym, latlang, timebound, parent,
/// bigparent, hop, min_users_p_hop, ts`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "messageId")]
    pub message_id: Uuid,
    #[serde(rename = "text")]
    pub text: String,
    #[serde(rename = "trust", default = "default_trust")]
    pub trust: f64,
    #[serde(rename = "priority")]
    pub priority: u32,
    #[serde(rename = "pseudonym", skip_serializing_if = "Option::is_none", default)]
    pub pseudonym: Option<String>,
    #[serde(rename = "latlang", skip_serializing_if = "Option::is_none", default)]
    pub lat_long: Option<LatLong>,
    #[serde(rename = "timebound")]
    pub timebound: u64,
    #[serde(rename = "parent", skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<Uuid>,
    #[serde(rename = "bigparent", skip_serializing_if = "Option::is_none", default)]
    pub bigparent: Option<Uuid>,
    #[serde(rename = "hop")]
    pub hop: u32,
    #[serde(rename = "min_users_p_hop")]
    pub min_users_p_hop: u32,
    #[serde(rename = "ts", default = "default_ts")]
    pub ts: u64,
}

fn default_trust() -> f64 {
    0.01
}

/// Parser rule: missing `ts` defaults to "now". Serde's `default` attribute
/// can't call a clock, so this returns `0` as a placeholder; callers that
/// parse an incoming frame MUST patch a zero `ts` to `now_ms` immediately
/// after deserializing, per the parser rule. See
/// [`WireMessage::patch_missing_ts`].
fn default_ts() -> u64 {
    0
}

impl WireMessage {
    /// Build the wire form of a stored message, honoring the security
    /// profile's field-inclusion rules (`include_pseudonym`/`include_latlang`,
    ///) and bumping `hop` by one for relay.
    pub fn from_message(msg: &Message, trust: f64, include_pseudonym: bool, include_latlang: bool) -> Self {
        Self {
            message_id: msg.message_id,
            text: msg.text.clone(),
            trust,
            priority: msg.priority,
            pseudonym: if include_pseudonym { msg.pseudonym.clone() } else { None },
            lat_long: if include_latlang { msg.lat_long } else { None },
            timebound: msg.expiration_time,
            parent: msg.parent_id,
            bigparent: msg.big_parent_id,
            hop: msg.hop_count + 1,
            min_users_p_hop: msg.min_contacts_for_hop,
            ts: msg.timestamp,
        }
    }

    /// Convert a received wire message into a domain [`Message`], with
    /// `received_timestamp` set to the local receipt time.
    pub fn into_message(self, now_ms: u64) -> Message {
        let ts = if self.ts == 0 { now_ms } else { self.ts };
        Message {
            message_id: self.message_id,
            text: self.text,
            trust_score: self.trust,
            priority: self.priority,
            liked: false,
            pseudonym: self.pseudonym,
            timestamp: ts,
            received_timestamp: now_ms,
            read: false,
            hop_count: self.hop,
            min_contacts_for_hop: self.min_users_p_hop,
            expiration_time: self.timebound,
            lat_long: self.lat_long,
            parent_id: self.parent,
            big_parent_id: self.bigparent,
        }
    }

    /// Patch a missing `ts` (deserialized as `0`) to `now_ms`, per the
    /// parser rule. Call immediately after `serde_json`
    /// deserialization and before any other use of `ts`.
    pub fn patch_missing_ts(&mut self, now_ms: u64) {
        if self.ts == 0 {
            self.ts = now_ms;
        }
    }
}

/// The client-to-server (and symmetric server-to-client) envelope used for
/// PSI init and message rounds.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "messages", default)]
    pub messages: Vec<WireMessage>,
    /// Base64-encoded blinded PSI items.
    #[serde(rename = "friends", default)]
    pub friends: Vec<String>,
    #[serde(rename = "device_id_hash", skip_serializing_if = "Option::is_none", default)]
    pub device_id_hash: Option<String>,
    #[serde(rename = "exchange_id", skip_serializing_if = "Option::is_none", default)]
    pub exchange_id: Option<String>,
    #[serde(rename = "public_id", skip_serializing_if = "Option::is_none", default)]
    pub public_id: Option<String>,
}

/// The PSI-reply envelope: double-blinded items and self-hashes
///.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Base64-encoded double-blinded items.
    #[serde(rename = "dblind", default)]
    pub dblind: Vec<String>,
    /// Base64-encoded SHA-1 self-hashes.
    #[serde(rename = "dhash", default)]
    pub dhash: Vec<String>,
}

/// The short count-exchange frame transmitting the outbound message count
///.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExchangeInfo {
    pub count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Property #5: encode -> decode is identity for a fully-populated frame.
    #[test]
    fn client_message_round_trips() {
        let msg = ClientMessage {
            messages: vec![WireMessage {
                    message_id: Uuid::new_v4(),
                    text: "hello".into(),
                    trust: 0.42,
                    priority: 3,
                    pseudonym: Some("anon".into()),
                    lat_long: Some(LatLong { lat: 1.0, long: 2.0 }),
                    timebound: 0,
                    parent: None,
                    bigparent: None,
                    hop: 1,
                    min_users_p_hop: 0,
                    ts: 1_700_000_000_000,
            }],
            friends: vec!["YWJj".into()],
            device_id_hash: Some("deadbeef".into()),
            exchange_id: None,
            public_id: Some("abc123".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn server_message_round_trips() {
        let msg = ServerMessage {
            dblind: vec!["YQ==".into(), "Yg==".into()],
            dhash: vec!["Yw==".into()],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let decoded: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn missing_trust_defaults_to_point_zero_one() {
        let json = r#"{
            "messageId": "00000000-0000-0000-0000-000000000000",
            "text": "hi",
            "priority": 0,
            "timebound": 0,
            "hop": 0,
            "min_users_p_hop": 0
        }"#;
        let decoded: WireMessage = serde_json::from_str(json).unwrap();
        assert_eq!(decoded.trust, 0.01);
    }

    #[test]
    fn missing_ts_is_patched_to_now() {
        let json = r#"{
            "messageId": "00000000-0000-0000-0000-000000000000",
            "text": "hi",
            "priority": 0,
            "timebound": 0,
            "hop": 0,
            "min_users_p_hop": 0
        }"#;
        let mut decoded: WireMessage = serde_json::from_str(json).unwrap();
        assert_eq!(decoded.ts, 0);
        decoded.patch_missing_ts(123);
        assert_eq!(decoded.ts, 123);
    }

    #[test]
    fn exchange_info_round_trips() {
        let info = ExchangeInfo { count: 7 };
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(json, r#"{"count":7}"#);
        let decoded: ExchangeInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, info);
    }
}
