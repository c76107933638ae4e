//! Signaling Module - Broadcast-Relay und Wire-Contract
//!
//! Dieses Modul verwaltet die Kommunikation über das gemeinsame
//! Broadcast-Topic:
//! - Wire-Typen der Signaling-Nachrichten
//! - Relay-Anbindung per WebSocket (fire-and-forget senden, Abo empfangen)
//! - In-Memory-Loopback für Tests
//!

mod channel;
mod messages;

pub use channel::{LoopbackChannel, RelayChannel, SignalChannel, SignalingError};
pub use messages::{CandidatePayload, Identity, SignalAction, SignalMessage};
