//! Core types, canonical encoding, PSI-Ca, trust model, and wire envelopes
//! for the Murmur mesh protocol.

pub mod canonical;
pub mod dh;
pub mod error;
pub mod message;
pub mod psi;
pub mod types;
pub mod wire;

pub use error::{Error, Result};
pub use types::*;
