//! Peer Session - Abstraktion über den P2P-Medientransport
//!
//! Die Call State Machine treibt den Transport ausschließlich über den
//! [`PeerSession`]-Trait und den [`PeerEvent`]-Strom. Die konkrete
//! WebRTC-Umsetzung verwaltet Peer Connection, Audio-Track und die
//! Pufferung von Kandidaten, die vor der Remote Description eintreffen.

use super::audio::{AudioError, AudioIo, AudioShared, FRAME_SIZE, SAMPLE_RATE};
use crate::signaling::CandidatePayload;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum PeerError {
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),
}

// ============================================================================
// PEER SESSION CONTRACT
// ============================================================================

/// Ereignisse einer laufenden Peer Session
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Lokal entdeckter Kandidat; muss als `ice-candidate`-Nachricht an
    /// die Gegenstelle weitergereicht werden
    CandidateDiscovered(CandidatePayload),
    /// Medienpfad steht
    LinkUp,
    /// Medienpfad getrennt oder fehlgeschlagen
    LinkDown,
}

pub type PeerEventStream = mpsc::UnboundedReceiver<PeerEvent>;

/// Eine verhandelbare P2P-Medienverbindung
///
/// Genau eine Instanz pro Anruf; sie besitzt das lokale Audio und wird
/// beim Rückfall auf Idle geschlossen. `close` ist idempotent und auch
/// dann sicher, wenn die Verbindung nie zustande kam.
#[async_trait]
pub trait PeerSession: Send + Sync {
    /// Produziert das lokale Offer (Anruferseite)
    async fn create_offer(&self) -> Result<String, PeerError>;

    /// Wendet das Remote-Offer an und produziert das lokale Answer
    /// (Angerufenenseite)
    async fn accept_offer(&self, offer: String) -> Result<String, PeerError>;

    /// Wendet das Remote-Answer auf die bestehende Session an
    async fn apply_answer(&self, answer: String) -> Result<(), PeerError>;

    /// Nimmt einen Remote-Kandidaten entgegen; trifft er vor der Remote
    /// Description ein, wird er gepuffert statt verworfen
    async fn add_remote_candidate(&self, candidate: CandidatePayload) -> Result<(), PeerError>;

    /// Schaltet das lokale Mikrofon stumm/frei (keine Neuverhandlung)
    fn set_muted(&self, muted: bool);

    /// Gibt Transport und Audio frei; doppelt aufrufbar
    async fn close(&self);
}

/// Öffnet neue Peer Sessions samt zugehörigem Ereignisstrom
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn open(&self) -> Result<(Arc<dyn PeerSession>, PeerEventStream), PeerError>;
}

// ============================================================================
// CANDIDATE CONVERSION
// ============================================================================

fn to_init(c: CandidatePayload) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: c.candidate,
        sdp_mid: c.sdp_mid,
        sdp_mline_index: c.sdp_mline_index,
        username_fragment: c.username_fragment,
    }
}

fn from_init(i: RTCIceCandidateInit) -> CandidatePayload {
    CandidatePayload {
        candidate: i.candidate,
        sdp_mid: i.sdp_mid,
        sdp_mline_index: i.sdp_mline_index,
        username_fragment: i.username_fragment,
    }
}

// ============================================================================
// WEBRTC FACTORY
// ============================================================================

/// Baut Peer Sessions über die webrtc-Crate
pub struct WebRtcFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<RTCIceServer>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerFactory for WebRtcFactory {
    async fn open(&self) -> Result<(Arc<dyn PeerSession>, PeerEventStream), PeerError> {
        // Audio zuerst: schlägt der Geräteerwerb fehl, entsteht gar
        // keine Peer Connection
        let audio = AudioIo::start()?;
        let shared = audio.shared();

        let pc = new_peer_connection(self.ice_servers.clone()).await?;

        // Opus-Audio-Track anlegen, damit die SDP-Verhandlung eine
        // Audiospur enthält
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_owned(),
            "intercom".to_owned(),
        ));
        pc.add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Konnektivitätsübergänge an die Maschine melden
        let tx = event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);
            match s {
                RTCPeerConnectionState::Connected => {
                    let _ = tx.send(PeerEvent::LinkUp);
                }
                RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                    let _ = tx.send(PeerEvent::LinkDown);
                }
                _ => {}
            }
            Box::pin(async {})
        }));

        // Lokal entdeckte Kandidaten nach draußen reichen
        let tx = event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::CandidateDiscovered(from_init(init)));
                    }
                    Err(e) => tracing::warn!("Failed to encode local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // Eingehende Spur in den Playback-Buffer pumpen
        let playback = Arc::clone(&shared);
        pc.on_track(Box::new(move |track, _, _| {
            let playback = Arc::clone(&playback);
            Box::pin(async move {
                tracing::info!("Remote track received: {:?}", track.codec());
                pump_remote_track(track, playback).await;
            })
        }));

        // Capture-Frames auf den lokalen Track pumpen
        // TODO: Opus-Encoding einsetzen, sobald audiopus eingebunden ist;
        // bis dahin gehen rohe PCM16-Frames über den Track
        let capture = Arc::clone(&shared);
        let pump_track = Arc::clone(&track);
        let pump = tokio::spawn(async move {
            pump_local_track(pump_track, capture).await;
        });

        let peer = Arc::new(WebRtcPeer {
            pc,
            audio: Mutex::new(Some(audio)),
            pending_candidates: tokio::sync::Mutex::new(Vec::new()),
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        });

        Ok((peer, event_rx))
    }
}

/// Erstellt die Peer Connection mit Media Engine und Default-Interceptors
async fn new_peer_connection(
    ice_servers: Vec<RTCIceServer>,
) -> Result<Arc<RTCPeerConnection>, PeerError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|e| PeerError::WebRtc(e.to_string()))?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|e| PeerError::WebRtc(e.to_string()))?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    let pc = api
        .new_peer_connection(config)
        .await
        .map_err(|e| PeerError::WebRtc(e.to_string()))?;

    Ok(Arc::new(pc))
}

/// Schiebt Capture-Frames als Samples auf den lokalen Track
async fn pump_local_track(track: Arc<TrackLocalStaticSample>, audio: Arc<AudioShared>) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(20));
    loop {
        interval.tick().await;
        let Some(frame) = audio.read_frame() else {
            continue;
        };
        let mut data = Vec::with_capacity(FRAME_SIZE * 2);
        for sample in frame {
            let pcm = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            data.extend_from_slice(&pcm.to_le_bytes());
        }
        let sample = Sample {
            data: Bytes::from(data),
            duration: tokio::time::Duration::from_millis(20),
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            tracing::debug!("Local track closed: {}", e);
            break;
        }
    }
}

/// Liest die Remote-Spur und stellt die Samples zur Wiedergabe ein
async fn pump_remote_track(track: Arc<TrackRemote>, audio: Arc<AudioShared>) {
    while let Ok((packet, _)) = track.read_rtp().await {
        let payload = packet.payload;
        let mut samples = Vec::with_capacity(payload.len() / 2);
        for chunk in payload.chunks_exact(2) {
            let pcm = i16::from_le_bytes([chunk[0], chunk[1]]);
            samples.push(pcm as f32 / i16::MAX as f32);
        }
        audio.write_samples(&samples);
    }
    tracing::debug!("Remote track ended");
}

// ============================================================================
// WEBRTC PEER SESSION
// ============================================================================

/// Eine Peer Connection samt zugehörigem Audio
struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    audio: Mutex<Option<AudioIo>>,
    /// Kandidaten, die vor der Remote Description eintrafen
    pending_candidates: tokio::sync::Mutex<Vec<RTCIceCandidateInit>>,
    pump: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    /// Spült gepufferte Kandidaten, sobald die Remote Description steht
    async fn flush_pending_candidates(&self) -> Result<(), PeerError> {
        let mut pending = self.pending_candidates.lock().await;
        for init in pending.drain(..) {
            self.pc
                .add_ice_candidate(init)
                .await
                .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerSession for WebRtcPeer {
    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, offer: String) -> Result<String, PeerError> {
        let remote =
            RTCSessionDescription::offer(offer).map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        self.flush_pending_candidates().await?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        Ok(answer.sdp)
    }

    async fn apply_answer(&self, answer: String) -> Result<(), PeerError> {
        let remote = RTCSessionDescription::answer(answer)
            .map_err(|e| PeerError::InvalidSdp(e.to_string()))?;
        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))?;
        self.flush_pending_candidates().await
    }

    async fn add_remote_candidate(&self, candidate: CandidatePayload) -> Result<(), PeerError> {
        let init = to_init(candidate);
        // Der Lock schützt auch die Reihenfolge gegenüber dem Flush:
        // entweder landet der Kandidat im Puffer, bevor gespült wird,
        // oder die Remote Description ist bereits sichtbar
        let mut pending = self.pending_candidates.lock().await;
        if self.pc.remote_description().await.is_none() {
            tracing::debug!("Buffering candidate until the remote description is set");
            pending.push(init);
            return Ok(());
        }
        drop(pending);
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::WebRtc(e.to_string()))
    }

    fn set_muted(&self, muted: bool) {
        if let Some(audio) = self.audio.lock().as_ref() {
            audio.set_muted(muted);
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        // Audio-Streams enden mit dem Drop
        self.audio.lock().take();
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection: {}", e);
        }
        tracing::info!("Peer session closed");
    }
}
