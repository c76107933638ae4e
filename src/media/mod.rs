//! Media Module - Peer-Transport und Audio
//!
//! Dieses Modul verwaltet:
//! - die Peer-Session-Abstraktion, über die die Call State Machine den
//!   P2P-Transport treibt
//! - die WebRTC-Umsetzung (Offer/Answer, Kandidaten, Konnektivität)
//! - Audio Capture und Playback über cpal

mod audio;
mod peer;

pub use audio::{AudioError, AudioIo, AudioShared, FRAME_SIZE, SAMPLE_RATE};
pub use peer::{PeerError, PeerEvent, PeerEventStream, PeerFactory, PeerSession, WebRtcFactory};
