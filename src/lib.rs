//! Intercom - Zwei-Stationen-Gegensprechanlage über WebRTC
//!
//! Architektur:
//! - Gemeinsames Broadcast-Topic auf einem Pub/Sub-Relay als Signalweg
//! - Deterministische Call State Machine (Idle/Calling/Ringing/Active)
//! - WebRTC für die P2P-Audioverbindung
//! - cpal für Mikrofon und Wiedergabe
//!
//! Es gibt genau zwei Stationen, [`signaling::Identity::Mobile`] und
//! [`signaling::Identity::Base`]; jede Nachricht auf dem Topic ist von
//! beiden sichtbar und wird über ihr `to`-Feld gefiltert.

pub mod call;
pub mod config;
pub mod media;
pub mod signaling;

pub use call::{CallController, CallHandle, CallSnapshot, Phase};
pub use config::Config;
pub use signaling::{Identity, RelayChannel};
