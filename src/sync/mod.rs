//! Peer-to-peer synchronization protocol
//!
//! Peers exchange clocks per document and then ship each other exactly the
//! changes the other side's clock does not cover.

pub mod message;
pub mod session;

pub use message::{FrameDecoder, SyncMessage, WireError, DEFAULT_MAX_FRAME, WIRE_VERSION};
pub use session::{SessionConfig, SessionState, SessionStatus, SyncSession};
