//! Message Types für das Signaling-Protokoll
//!
//! Das Relay ist ein gemeinsames Broadcast-Topic: jede Station sieht
//! jede Nachricht und filtert selbst nach dem `to`-Feld. Die Typen hier
//! bilden den Wire-Contract ab und müssen byte-für-byte durch das Relay
//! round-trippen.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

// ============================================================================
// IDENTITY
// ============================================================================

/// Eine der zwei festen Stations-Identitäten der Gegensprechanlage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Identity {
    /// Das mobile Handgerät
    Mobile,
    /// Die Basisstation
    Base,
}

impl Identity {
    /// Liefert die jeweils andere Station (totale, feste Paarung)
    pub fn counterpart(self) -> Identity {
        match self {
            Identity::Mobile => Identity::Base,
            Identity::Base => Identity::Mobile,
        }
    }

    /// Parst eine Identität aus einem CLI-Argument
    pub fn parse(s: &str) -> Option<Identity> {
        match s.to_ascii_lowercase().as_str() {
            "mobile" | "m" => Some(Identity::Mobile),
            "base" | "b" => Some(Identity::Base),
            _ => None,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Mobile => write!(f, "mobile"),
            Identity::Base => write!(f, "base"),
        }
    }
}

// ============================================================================
// SIGNAL ACTIONS
// ============================================================================

/// Art einer Signaling-Nachricht
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalAction {
    /// Anrufwunsch, trägt das SDP Offer
    Call,
    /// Annahme, trägt das SDP Answer
    Answer,
    /// Ablehnung eines Anrufwunsches
    Reject,
    /// Beenden bzw. Zurückziehen eines Anrufs
    End,
    /// Netzwerk-Kandidat für die ICE-Verhandlung
    IceCandidate,
}

// ============================================================================
// CANDIDATE PAYLOAD
// ============================================================================

/// Ein ICE-Kandidat im WebRTC-JSON-Format (entspricht `RTCIceCandidateInit`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none", default)]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub username_fragment: Option<String>,
}

// ============================================================================
// SIGNAL MESSAGE
// ============================================================================

/// Eine Nachricht auf dem Broadcast-Topic
///
/// `offer` ist genau dann gesetzt wenn `action == Call`, `answer` genau
/// dann wenn `action == Answer`, `candidate` genau dann wenn
/// `action == IceCandidate`. Der Timestamp ist pro Sender monoton
/// steigend und dient ausschließlich der Diagnose; das Protokoll darf
/// keine Reihenfolge daraus ableiten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub from: Identity,
    pub to: Identity,
    pub action: SignalAction,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub offer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub candidate: Option<CandidatePayload>,
    pub timestamp: i64,
}

/// Zuletzt vergebener Timestamp, damit die Folge auch bei gleichem
/// Wanduhr-Millisekundenwert streng monoton bleibt
static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

fn next_timestamp() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    match LAST_TIMESTAMP.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(now.max(last + 1))
    }) {
        Ok(last) | Err(last) => now.max(last + 1),
    }
}

impl SignalMessage {
    fn base(from: Identity, action: SignalAction) -> Self {
        Self {
            from,
            to: from.counterpart(),
            action,
            offer: None,
            answer: None,
            candidate: None,
            timestamp: next_timestamp(),
        }
    }

    /// Anrufwunsch mit SDP Offer an die Gegenstelle
    pub fn call(from: Identity, offer: String) -> Self {
        Self {
            offer: Some(offer),
            ..Self::base(from, SignalAction::Call)
        }
    }

    /// Annahme mit SDP Answer an die Gegenstelle
    pub fn answer(from: Identity, answer: String) -> Self {
        Self {
            answer: Some(answer),
            ..Self::base(from, SignalAction::Answer)
        }
    }

    /// Ablehnung an die Gegenstelle
    pub fn reject(from: Identity) -> Self {
        Self::base(from, SignalAction::Reject)
    }

    /// Beenden/Zurückziehen an die Gegenstelle
    pub fn end(from: Identity) -> Self {
        Self::base(from, SignalAction::End)
    }

    /// ICE-Kandidat an die Gegenstelle
    pub fn ice_candidate(from: Identity, candidate: CandidatePayload) -> Self {
        Self {
            candidate: Some(candidate),
            ..Self::base(from, SignalAction::IceCandidate)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
