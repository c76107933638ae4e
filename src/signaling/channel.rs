//! Signaling Channel Adapter
//!
//! Kapselt das externe Publish/Subscribe-Relay hinter einem schmalen
//! Trait: `send` ist fire-and-forget (keine Zustellbestätigung, keine
//! Ordnungsgarantie), `subscribe` liefert jede auf dem Topic zugestellte
//! Nachricht, auch die an die andere Station adressierten. Das Filtern
//! nach Empfänger ist Sache der Call State Machine.

use super::messages::SignalMessage;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SignalingError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Relay connection failed: {0}")]
    ConnectionFailed(String),
}

// ============================================================================
// CHANNEL TRAIT
// ============================================================================

/// Zugang zum Broadcast-Topic des Relays
///
/// Sendefehler sind nicht fatal und werden hier nicht wiederholt: ein
/// stumpf wiederholter, inzwischen veralteter Anrufwunsch könnte einen
/// bereits aufgegebenen Anruf wieder öffnen. Retry ist Sache des
/// Aufrufers. Das Abo endet durch Droppen des Receivers.
pub trait SignalChannel: Send + Sync {
    /// Publiziert eine Nachricht auf dem Topic (fire-and-forget)
    fn send(&self, msg: SignalMessage);

    /// Abonniert alle auf dem Topic zugestellten Nachrichten
    fn subscribe(&self) -> broadcast::Receiver<SignalMessage>;
}

// ============================================================================
// RELAY CHANNEL (WEBSOCKET)
// ============================================================================

/// WebSocket-Anbindung an ein benanntes Broadcast-Topic des Relays
///
/// Jede Station verbindet sich mit demselben Topic; jeder Text-Frame ist
/// genau eine `SignalMessage` als JSON. Bricht die Verbindung ab, wird
/// mit gedeckeltem exponentiellen Backoff neu verbunden.
pub struct RelayChannel {
    out_tx: mpsc::Sender<String>,
    event_tx: broadcast::Sender<SignalMessage>,
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

impl RelayChannel {
    /// Verbindet mit `<relay_url>/<topic>` und startet die Socket-Tasks
    ///
    /// Der erste Verbindungsaufbau schlägt hart fehl; danach hält ein
    /// Reconnect-Loop die Verbindung best-effort am Leben.
    pub async fn open(relay_url: &str, topic: &str) -> Result<Self, SignalingError> {
        let ws_url = format!("{}/{}", relay_url.trim_end_matches('/'), topic);
        let url = Url::parse(&ws_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

        tracing::info!("Connecting to relay topic: {}", url);

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (event_tx, _) = broadcast::channel(100);
        let (out_tx, out_rx) = mpsc::channel::<String>(100);

        tokio::spawn(Self::run(url, ws, out_rx, event_tx.clone()));

        Ok(Self { out_tx, event_tx })
    }

    /// Socket-Loop: pumpt ausgehende Frames, parst eingehende,
    /// verbindet nach Abbrüchen neu
    async fn run(
        url: Url,
        first: WsStream,
        mut out_rx: mpsc::Receiver<String>,
        event_tx: broadcast::Sender<SignalMessage>,
    ) {
        let mut ws = Some(first);
        let mut backoff_secs = 1u64;

        loop {
            let mut socket = match ws.take() {
                Some(s) => s,
                None => {
                    tracing::info!("Reconnecting to relay in {}s", backoff_secs);
                    tokio::time::sleep(tokio::time::Duration::from_secs(backoff_secs)).await;
                    backoff_secs = (backoff_secs * 2).min(30);
                    match connect_async(url.as_str()).await {
                        Ok((s, _)) => {
                            tracing::info!("Relay connection re-established");
                            backoff_secs = 1;
                            s
                        }
                        Err(e) => {
                            tracing::warn!("Relay reconnect failed: {}", e);
                            continue;
                        }
                    }
                }
            };

            loop {
                tokio::select! {
                    out = out_rx.recv() => match out {
                        Some(text) => {
                            if let Err(e) = socket.send(Message::Text(text)).await {
                                tracing::warn!("Relay send failed: {}", e);
                                break;
                            }
                        }
                        // Alle Sender gedroppt: Channel wird abgebaut
                        None => {
                            let _ = socket.close(None).await;
                            return;
                        }
                    },
                    frame = socket.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<SignalMessage>(&text) {
                                Ok(msg) => {
                                    let _ = event_tx.send(msg);
                                }
                                // Fremdverkehr auf dem Topic ist erwartbar,
                                // kein Anlass für mehr als ein Debug-Log
                                Err(e) => {
                                    tracing::debug!("Dropping malformed relay frame: {}", e);
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            tracing::info!("Relay closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::warn!("Relay socket error: {}", e);
                            break;
                        }
                    },
                }
            }
        }
    }
}

impl SignalChannel for RelayChannel {
    fn send(&self, msg: SignalMessage) {
        let text = match serde_json::to_string(&msg) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!("Failed to encode signal: {}", e);
                return;
            }
        };
        // try_send: blockiert nie; ein volles Fenster oder ein totes
        // Relay kostet die Nachricht, nicht den Anrufzustand
        if let Err(e) = self.out_tx.try_send(text) {
            tracing::warn!("Dropping outbound signal, relay unreachable: {}", e);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.event_tx.subscribe()
    }
}

// ============================================================================
// LOOPBACK CHANNEL (IN-MEMORY)
// ============================================================================

/// In-Memory-Relay: beide Stationen im selben Prozess, ein gemeinsames
/// Broadcast-Topic. Von den Szenario-Tests verwendet.
#[derive(Clone)]
pub struct LoopbackChannel {
    topic: broadcast::Sender<SignalMessage>,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        let (topic, _) = broadcast::channel(100);
        Self { topic }
    }
}

impl Default for LoopbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalChannel for LoopbackChannel {
    fn send(&self, msg: SignalMessage) {
        // Ohne Abonnenten verpufft die Nachricht, wie beim echten Relay
        let _ = self.topic.send(msg);
    }

    fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.topic.subscribe()
    }
}
