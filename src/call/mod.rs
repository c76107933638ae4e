//! Call Module - Zustandsmaschine und Controller
//!
//! Dieses Modul verwaltet den Lebenszyklus eines Anrufs:
//! - die reine Zustandsmaschine (Übergänge als Werte, keine I/O)
//! - der Aktor, der sie mit Relay, Peer Session und Timern verdrahtet
//!

mod controller;
mod state;

pub use controller::{CallController, CallHandle, CallSnapshot};
pub use state::{CallEvent, CallSession, Effect, Phase};
