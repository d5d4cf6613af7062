//! Transport abstraction, cross-transport peer registry, and
//! length-prefixed JSON framing for the Murmur mesh protocol.

pub mod framing;
pub mod lan;
pub mod peer;
pub mod transport;

pub use framing::{FrameError, JsonFrameCodec};
pub use peer::{PeerRecord, PeerRegistry, TransportEntry, TransportKind};
pub use transport::{Discovery, InboundHandler, Transport, TransportError, TransportEvent};
