//! Konfiguration der Station
//!
//! Alles kommt aus Umgebungsvariablen mit brauchbaren Defaults; eine
//! Konfigurationsdatei braucht die Gegensprechanlage nicht.
//!
//! | Variable              | Bedeutung                              |
//! |-----------------------|----------------------------------------|
//! | `INTERCOM_RELAY_URL`  | WebSocket-Basis-URL des Relays         |
//! | `INTERCOM_TOPIC`      | Gemeinsames Broadcast-Topic            |
//! | `INTERCOM_DIAL_TIMEOUT_SECS` | Wähl-Timeout in Sekunden        |
//! | `INTERCOM_TURN_URL` / `_USER` / `_PASS` | Optionaler TURN-Server |

use std::time::Duration;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// Default-Relay, wenn nichts konfiguriert ist
const DEFAULT_RELAY_URL: &str = "wss://relay.example.net";

/// Default-Topic beider Stationen
const DEFAULT_TOPIC: &str = "intercom";

/// Wie lange ein unbeantworteter Anruf klingeln darf
const DEFAULT_DIAL_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// CONFIG
// ============================================================================

/// Laufzeitkonfiguration einer Station
#[derive(Debug, Clone)]
pub struct Config {
    /// Basis-URL des Broadcast-Relays (ohne Topic-Pfad)
    pub relay_url: String,
    /// Topic, über das beide Stationen sprechen
    pub topic: String,
    /// Timeout für unbeantwortete ausgehende Anrufe
    pub dial_timeout: Duration,
    /// Optionaler TURN-Server als (url, username, credential)
    pub turn: Option<(String, String, String)>,
}

impl Config {
    /// Liest die Konfiguration aus der Umgebung
    pub fn from_env() -> Self {
        let relay_url = std::env::var("INTERCOM_RELAY_URL")
            .unwrap_or_else(|_| DEFAULT_RELAY_URL.to_string());
        let topic =
            std::env::var("INTERCOM_TOPIC").unwrap_or_else(|_| DEFAULT_TOPIC.to_string());
        let dial_timeout = std::env::var("INTERCOM_DIAL_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS));

        let turn = match (
            std::env::var("INTERCOM_TURN_URL"),
            std::env::var("INTERCOM_TURN_USER"),
            std::env::var("INTERCOM_TURN_PASS"),
        ) {
            (Ok(url), Ok(user), Ok(pass)) => Some((url, user, pass)),
            _ => None,
        };

        Self {
            relay_url,
            topic,
            dial_timeout,
            turn,
        }
    }

    /// STUN/TURN-Konfiguration für die Peer Session
    ///
    /// Google STUN deckt die meisten NAT-Situationen ab; ein TURN-Server
    /// kommt nur dazu, wenn er konfiguriert wurde.
    pub fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = vec![RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        }];

        if let Some((url, username, credential)) = &self.turn {
            servers.push(RTCIceServer {
                urls: vec![url.clone()],
                username: username.clone(),
                credential: credential.clone(),
                ..Default::default()
            });
        }

        servers
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            topic: DEFAULT_TOPIC.to_string(),
            dial_timeout: Duration::from_secs(DEFAULT_DIAL_TIMEOUT_SECS),
            turn: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_stun_only() {
        let config = Config::default();
        let servers = config.ice_servers();
        assert_eq!(servers.len(), 1);
        assert!(servers[0].urls[0].starts_with("stun:"));
    }

    #[test]
    fn turn_server_is_appended() {
        let config = Config {
            turn: Some((
                "turn:turn.example.net:3478".to_string(),
                "station".to_string(),
                "secret".to_string(),
            )),
            ..Config::default()
        };
        let servers = config.ice_servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].username, "station");
    }
}
