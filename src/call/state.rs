//! Call State Machine
//!
//! Der Kern des Protokolls: eine reine Übergangsfunktion
//! `(Zustand, Ereignis) -> Effekte`. Die Maschine besitzt keinerlei
//! Transport: sie konsumiert lokale Aktionen, Relay-Nachrichten,
//! Peer-Session-Resultate und Konnektivitätssignale und gibt eine
//! geordnete Liste von Effekten zurück, die der Controller ausführt.
//! Dadurch ist jede Protokoll-Eigenschaft ohne Relay und ohne Geräte
//! testbar.
//!
//! Garantien:
//! - Nachrichten an die andere Station werden ohne Zustandsänderung
//!   verworfen (das Topic ist ein geteiltes Broadcast-Medium).
//! - Höchstens ein Anruf pro Stationspaar: ein `call` im Nicht-Idle
//!   wird automatisch mit `reject` beantwortet ("busy").
//! - `Active` wird ausschließlich vom Transport-Konnektivitätssignal
//!   betreten, nie von der Nachrichtenreihenfolge.
//! - Jeder Ausgang aus einem Nicht-Idle-Zustand räumt Peer Session und
//!   Audio genau einmal ab; doppeltes Schließen ist ein No-op.

use crate::signaling::{CandidatePayload, Identity, SignalAction, SignalMessage};
use std::time::{Duration, Instant};

// ============================================================================
// PHASE
// ============================================================================

/// Aktuelle Phase des (einzigen) Anrufs dieser Station
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Kein Anruf; Ausgangs- und einziger Endzustand
    Idle,
    /// Ausgehender Anrufwunsch unterwegs, warten auf Answer
    Calling,
    /// Eingehender Anrufwunsch liegt vor, warten auf Annahme/Ablehnung
    Ringing,
    /// Medienverbindung steht
    Active,
}

// ============================================================================
// EVENTS
// ============================================================================

/// Ereignisse, die die Maschine konsumiert
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Lokal: Anruf starten
    Dial,
    /// Lokal: eingehenden Anruf annehmen
    Accept,
    /// Lokal: eingehenden Anruf ablehnen
    Reject,
    /// Lokal: Anruf beenden bzw. zurückziehen
    HangUp,
    /// Lokal: Mikrofon stummschalten/freigeben
    ToggleMute,
    /// Eine auf dem Topic zugestellte Nachricht (an wen auch immer)
    Signal(SignalMessage),
    /// Peer Session hat das lokale Offer produziert
    OfferReady(String),
    /// Peer Session hat das lokale Answer produziert
    AnswerReady(String),
    /// Audio-Erwerb oder Transportverhandlung fehlgeschlagen
    MediaFailed(String),
    /// Transport meldet: Medienpfad steht
    LinkUp,
    /// Transport meldet: Medienpfad getrennt/fehlgeschlagen
    LinkDown,
    /// Wählzeit abgelaufen, ohne dass ein Answer kam
    DialTimeout,
}

// ============================================================================
// EFFECTS
// ============================================================================

/// Vom Controller auszuführende Effekte, in Reihenfolge
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Nachricht auf dem Topic publizieren
    Send(SignalMessage),
    /// Audio erwerben, Peer Session öffnen, Offer produzieren
    /// (mündet in `OfferReady` oder `MediaFailed`)
    OpenPeerForOffer,
    /// Audio erwerben, Peer Session öffnen, Remote-Offer anwenden,
    /// Answer produzieren (mündet in `AnswerReady` oder `MediaFailed`)
    OpenPeerForAnswer { offer: String },
    /// Remote-Answer auf die bestehende Peer Session anwenden
    ApplyAnswer { answer: String },
    /// Remote-Kandidaten an die bestehende Peer Session weiterreichen
    ForwardCandidate { candidate: CandidatePayload },
    /// Mute-Flag an das Audio durchreichen (keine Neuverhandlung)
    SetMuted { muted: bool },
    /// Peer Session samt Audio schließen (idempotent)
    ClosePeer,
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Der eine veränderliche Anrufzustand dieser Station
///
/// Wird ausschließlich über [`CallSession::apply`] mutiert und kehrt
/// nach jedem Anrufausgang auf die Idle-Grundlinie zurück.
#[derive(Debug)]
pub struct CallSession {
    identity: Identity,
    phase: Phase,
    counterpart: Option<Identity>,
    /// Gespeichertes Remote-Offer, nur während `Ringing` belegt
    pending_offer: Option<String>,
    /// Es wurde eine Peer Session angefordert (offen oder im Aufbau)
    peer_requested: bool,
    /// Beginn der aktiven Phase; `elapsed()` leitet die Dauer daraus ab
    connected_at: Option<Instant>,
    muted: bool,
}

impl CallSession {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            phase: Phase::Idle,
            counterpart: None,
            pending_offer: None,
            peer_requested: false,
            connected_at: None,
            muted: false,
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Gegenstelle des laufenden Anrufs, `None` im Idle
    pub fn counterpart(&self) -> Option<Identity> {
        self.counterpart
    }

    pub fn muted(&self) -> bool {
        self.muted
    }

    /// Bisherige Dauer der aktiven Phase
    pub fn elapsed(&self) -> Option<Duration> {
        self.connected_at.map(|t| t.elapsed())
    }

    /// Das gespeicherte eingehende Offer (nur während `Ringing`)
    pub fn pending_offer(&self) -> Option<&str> {
        self.pending_offer.as_deref()
    }

    // ========================================================================
    // TRANSITION FUNCTION
    // ========================================================================

    /// Verarbeitet ein Ereignis vollständig und liefert die Effekte
    pub fn apply(&mut self, event: CallEvent) -> Vec<Effect> {
        match event {
            CallEvent::Dial => self.on_dial(),
            CallEvent::Accept => self.on_accept(),
            CallEvent::Reject => self.on_reject(),
            CallEvent::HangUp => self.on_hang_up(),
            CallEvent::ToggleMute => self.on_toggle_mute(),
            CallEvent::Signal(msg) => self.on_signal(msg),
            CallEvent::OfferReady(sdp) => self.on_offer_ready(sdp),
            CallEvent::AnswerReady(sdp) => self.on_answer_ready(sdp),
            CallEvent::MediaFailed(reason) => self.on_media_failed(reason),
            CallEvent::LinkUp => self.on_link_up(),
            CallEvent::LinkDown => self.on_link_down(),
            CallEvent::DialTimeout => self.on_dial_timeout(),
        }
    }

    // ========================================================================
    // LOCAL ACTIONS
    // ========================================================================

    fn on_dial(&mut self) -> Vec<Effect> {
        if self.phase != Phase::Idle {
            // Ein bereits gespeicherter eingehender Anrufwunsch bleibt
            // unangetastet, die beiden Anrufversuche teilen keinen Zustand
            tracing::warn!("Dial ignored, call already in progress ({:?})", self.phase);
            return Vec::new();
        }
        self.phase = Phase::Calling;
        self.counterpart = Some(self.identity.counterpart());
        self.peer_requested = true;
        vec![Effect::OpenPeerForOffer]
    }

    fn on_accept(&mut self) -> Vec<Effect> {
        if self.phase != Phase::Ringing {
            tracing::warn!("Accept ignored, nothing is ringing");
            return Vec::new();
        }
        if self.peer_requested {
            // Annahme läuft bereits; keine zweite Peer Session öffnen
            return Vec::new();
        }
        match self.pending_offer.take() {
            Some(offer) => {
                self.peer_requested = true;
                vec![Effect::OpenPeerForAnswer { offer }]
            }
            None => Vec::new(),
        }
    }

    fn on_reject(&mut self) -> Vec<Effect> {
        if self.phase != Phase::Ringing {
            tracing::warn!("Reject ignored, nothing is ringing");
            return Vec::new();
        }
        let mut effects = vec![Effect::Send(SignalMessage::reject(self.identity))];
        effects.extend(self.teardown());
        effects
    }

    fn on_hang_up(&mut self) -> Vec<Effect> {
        match self.phase {
            Phase::Idle => Vec::new(),
            // Auflegen während es klingelt ist eine Ablehnung
            Phase::Ringing => self.on_reject(),
            Phase::Calling | Phase::Active => {
                let mut effects = vec![Effect::Send(SignalMessage::end(self.identity))];
                effects.extend(self.teardown());
                effects
            }
        }
    }

    fn on_toggle_mute(&mut self) -> Vec<Effect> {
        if self.phase == Phase::Idle {
            return Vec::new();
        }
        self.muted = !self.muted;
        vec![Effect::SetMuted { muted: self.muted }]
    }

    // ========================================================================
    // INBOUND SIGNALS
    // ========================================================================

    fn on_signal(&mut self, msg: SignalMessage) -> Vec<Effect> {
        if msg.to != self.identity {
            // Broadcast-Rauschen: adressiert an die andere Station
            tracing::trace!("Ignoring signal addressed to {}", msg.to);
            return Vec::new();
        }
        match msg.action {
            SignalAction::Call => self.on_inbound_call(msg),
            SignalAction::Answer => self.on_inbound_answer(msg),
            SignalAction::Reject => self.on_inbound_reject(),
            SignalAction::End => self.on_inbound_end(),
            SignalAction::IceCandidate => self.on_inbound_candidate(msg),
        }
    }

    fn on_inbound_call(&mut self, msg: SignalMessage) -> Vec<Effect> {
        match self.phase {
            Phase::Idle => {
                let offer = match msg.offer {
                    Some(o) => o,
                    None => {
                        tracing::debug!("Dropping call signal without offer payload");
                        return Vec::new();
                    }
                };
                self.phase = Phase::Ringing;
                self.counterpart = Some(msg.from);
                self.pending_offer = Some(offer);
                Vec::new()
            }
            // Duplikat des bereits klingelnden Anrufwunsches: das
            // gespeicherte Offer bleibt maßgeblich
            Phase::Ringing => {
                tracing::debug!("Duplicate call request while ringing, ignoring");
                Vec::new()
            }
            // Besetzt: eigener Versuch bleibt bestehen, der eingehende
            // wird abgewiesen, so lösen sich auch kreuzende Anrufe auf
            Phase::Calling | Phase::Active => {
                tracing::info!("Busy, auto-rejecting call request from {}", msg.from);
                vec![Effect::Send(SignalMessage::reject(self.identity))]
            }
        }
    }

    fn on_inbound_answer(&mut self, msg: SignalMessage) -> Vec<Effect> {
        if self.phase != Phase::Calling {
            tracing::debug!("Stale answer in phase {:?}, ignoring", self.phase);
            return Vec::new();
        }
        match msg.answer {
            // Active folgt erst auf das Konnektivitätssignal des
            // Transports, nicht auf den Signaling-Abschluss
            Some(answer) => vec![Effect::ApplyAnswer { answer }],
            None => {
                tracing::debug!("Dropping answer signal without payload");
                Vec::new()
            }
        }
    }

    fn on_inbound_reject(&mut self) -> Vec<Effect> {
        match self.phase {
            Phase::Calling => self.teardown(),
            _ => {
                tracing::debug!("Stale reject in phase {:?}, ignoring", self.phase);
                Vec::new()
            }
        }
    }

    fn on_inbound_end(&mut self) -> Vec<Effect> {
        match self.phase {
            // Kein `end` zurücksenden: der Auslöser war selbst ein `end`
            Phase::Calling | Phase::Ringing | Phase::Active => self.teardown(),
            Phase::Idle => Vec::new(),
        }
    }

    fn on_inbound_candidate(&mut self, msg: SignalMessage) -> Vec<Effect> {
        if self.phase == Phase::Idle || !self.peer_requested {
            tracing::debug!("No peer session, ignoring candidate");
            return Vec::new();
        }
        match msg.candidate {
            Some(candidate) => vec![Effect::ForwardCandidate { candidate }],
            None => Vec::new(),
        }
    }

    // ========================================================================
    // PEER SESSION RESULTS
    // ========================================================================

    fn on_offer_ready(&mut self, sdp: String) -> Vec<Effect> {
        if self.phase != Phase::Calling || !self.peer_requested {
            // Der Anruf wurde während der Offer-Produktion aufgegeben;
            // das späte Resultat darf ihn nicht wiederbeleben
            tracing::debug!("Discarding stale offer in phase {:?}", self.phase);
            return Vec::new();
        }
        vec![Effect::Send(SignalMessage::call(self.identity, sdp))]
    }

    fn on_answer_ready(&mut self, sdp: String) -> Vec<Effect> {
        if self.phase != Phase::Ringing || !self.peer_requested {
            tracing::debug!("Discarding stale answer in phase {:?}", self.phase);
            return Vec::new();
        }
        vec![Effect::Send(SignalMessage::answer(self.identity, sdp))]
    }

    fn on_media_failed(&mut self, reason: String) -> Vec<Effect> {
        match self.phase {
            Phase::Idle => Vec::new(),
            // Annahme gescheitert (z.B. kein Mikrofon): implizite
            // Ablehnung an den Anrufer
            Phase::Ringing => {
                tracing::error!("Media setup failed while ringing: {}", reason);
                let mut effects = vec![Effect::Send(SignalMessage::reject(self.identity))];
                effects.extend(self.teardown());
                effects
            }
            Phase::Calling | Phase::Active => {
                tracing::error!("Media failure, ending call: {}", reason);
                let mut effects = vec![Effect::Send(SignalMessage::end(self.identity))];
                effects.extend(self.teardown());
                effects
            }
        }
    }

    // ========================================================================
    // TRANSPORT CONNECTIVITY
    // ========================================================================

    fn on_link_up(&mut self) -> Vec<Effect> {
        match self.phase {
            Phase::Calling | Phase::Ringing if self.peer_requested => {
                self.phase = Phase::Active;
                // Der Anruf-Timer startet genau einmal, hier
                self.connected_at = Some(Instant::now());
                tracing::info!("Call active with {:?}", self.counterpart);
                Vec::new()
            }
            _ => {
                tracing::debug!("Connectivity signal in phase {:?}, ignoring", self.phase);
                Vec::new()
            }
        }
    }

    fn on_link_down(&mut self) -> Vec<Effect> {
        if self.phase == Phase::Idle || !self.peer_requested {
            return Vec::new();
        }
        // Best-effort-Benachrichtigung, danach in jedem Fall abräumen
        self.on_media_failed("transport disconnected".to_string())
    }

    // ========================================================================
    // TIMER
    // ========================================================================

    fn on_dial_timeout(&mut self) -> Vec<Effect> {
        if self.phase != Phase::Calling {
            return Vec::new();
        }
        tracing::info!("No answer, abandoning outbound call");
        let mut effects = vec![Effect::Send(SignalMessage::end(self.identity))];
        effects.extend(self.teardown());
        effects
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Setzt die Session auf die Idle-Grundlinie zurück und schließt
    /// eine angeforderte Peer Session
    fn teardown(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.peer_requested {
            effects.push(Effect::ClosePeer);
        }
        self.phase = Phase::Idle;
        self.counterpart = None;
        self.pending_offer = None;
        self.peer_requested = false;
        self.connected_at = None;
        self.muted = false;
        effects
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mobile() -> CallSession {
        CallSession::new(Identity::Mobile)
    }

    fn base() -> CallSession {
        CallSession::new(Identity::Base)
    }

    /// Liefert die in den Effekten enthaltenen Nachrichten
    fn sent(effects: &[Effect]) -> Vec<&SignalMessage> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    /// Bringt eine Session per Dial+OfferReady nach Calling
    fn dial(session: &mut CallSession) -> SignalMessage {
        let effects = session.apply(CallEvent::Dial);
        assert_eq!(effects, vec![Effect::OpenPeerForOffer]);
        let effects = session.apply(CallEvent::OfferReady("offer-sdp".to_string()));
        match &effects[..] {
            [Effect::Send(msg)] => msg.clone(),
            other => panic!("expected call request, got {:?}", other),
        }
    }

    /// Bringt eine Session per eingehendem Call nach Ringing
    fn ring(session: &mut CallSession, from: Identity) {
        let msg = SignalMessage::call(from, "offer-sdp".to_string());
        let effects = session.apply(CallEvent::Signal(msg));
        assert!(effects.is_empty());
        assert_eq!(session.phase(), Phase::Ringing);
    }

    // ------------------------------------------------------------------
    // Adressfilter
    // ------------------------------------------------------------------

    #[test]
    fn signal_addressed_to_other_station_is_a_no_op() {
        // Eine an Base adressierte Nachricht erreicht per Broadcast auch
        // Mobile und darf dort nichts bewegen, in keiner Phase
        let to_base = SignalMessage::call(Identity::Mobile, "x".to_string());
        assert_eq!(to_base.to, Identity::Base);

        let mut session = mobile();
        assert!(session.apply(CallEvent::Signal(to_base.clone())).is_empty());
        assert_eq!(session.phase(), Phase::Idle);

        dial(&mut session);
        assert!(session.apply(CallEvent::Signal(to_base.clone())).is_empty());
        assert_eq!(session.phase(), Phase::Calling);
    }

    // ------------------------------------------------------------------
    // Aufbau und Annahme (Szenario A, maschinenseitig)
    // ------------------------------------------------------------------

    #[test]
    fn outbound_call_reaches_active_via_link_up() {
        let mut m = mobile();
        let request = dial(&mut m);
        assert_eq!(m.phase(), Phase::Calling);
        assert_eq!(m.counterpart(), Some(Identity::Base));
        assert_eq!(request.action, SignalAction::Call);
        assert_eq!(request.to, Identity::Base);

        // Answer kommt an: nur anwenden, noch nicht aktiv
        let answer = SignalMessage::answer(Identity::Base, "answer-sdp".to_string());
        let effects = m.apply(CallEvent::Signal(answer));
        assert_eq!(
            effects,
            vec![Effect::ApplyAnswer {
                answer: "answer-sdp".to_string()
            }]
        );
        assert_eq!(m.phase(), Phase::Calling);
        assert!(m.elapsed().is_none());

        // Erst das Transportsignal schaltet aktiv und startet den Timer
        assert!(m.apply(CallEvent::LinkUp).is_empty());
        assert_eq!(m.phase(), Phase::Active);
        assert!(m.elapsed().is_some());
    }

    #[test]
    fn inbound_call_accept_answers_and_activates_on_link_up() {
        let mut b = base();
        ring(&mut b, Identity::Mobile);
        assert_eq!(b.counterpart(), Some(Identity::Mobile));
        assert_eq!(b.pending_offer(), Some("offer-sdp"));

        let effects = b.apply(CallEvent::Accept);
        assert_eq!(
            effects,
            vec![Effect::OpenPeerForAnswer {
                offer: "offer-sdp".to_string()
            }]
        );
        // Bis zum Konnektivitätssignal bleibt es bei Ringing
        assert_eq!(b.phase(), Phase::Ringing);

        let effects = b.apply(CallEvent::AnswerReady("answer-sdp".to_string()));
        let msgs = sent(&effects);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].action, SignalAction::Answer);
        assert_eq!(msgs[0].to, Identity::Mobile);

        b.apply(CallEvent::LinkUp);
        assert_eq!(b.phase(), Phase::Active);
    }

    #[test]
    fn second_accept_does_not_open_a_second_peer_session() {
        let mut b = base();
        ring(&mut b, Identity::Mobile);
        assert_eq!(b.apply(CallEvent::Accept).len(), 1);
        assert!(b.apply(CallEvent::Accept).is_empty());
    }

    // ------------------------------------------------------------------
    // Besetzt-Politik und kreuzende Anrufe (Szenario B)
    // ------------------------------------------------------------------

    #[test]
    fn call_request_while_busy_is_auto_rejected_without_state_change() {
        let mut m = mobile();
        dial(&mut m);

        let inbound = SignalMessage::call(Identity::Base, "their-offer".to_string());
        let effects = m.apply(CallEvent::Signal(inbound));
        let msgs = sent(&effects);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].action, SignalAction::Reject);
        assert_eq!(msgs[0].to, Identity::Base);
        // Eigener Versuch bleibt unberührt
        assert_eq!(m.phase(), Phase::Calling);
    }

    #[test]
    fn simultaneous_dials_resolve_to_both_idle() {
        // Beide wählen, bevor sie den Wunsch der Gegenseite sehen
        let mut m = mobile();
        let mut b = base();
        let m_request = dial(&mut m);
        let b_request = dial(&mut b);

        // Jede Seite ist besetzt und weist den fremden Wunsch ab
        let m_reject = sent(&m.apply(CallEvent::Signal(b_request)))[0].clone();
        let b_reject = sent(&b.apply(CallEvent::Signal(m_request)))[0].clone();

        // Die Ablehnungen räumen beide ausgehenden Versuche ab
        let effects = m.apply(CallEvent::Signal(b_reject));
        assert!(effects.contains(&Effect::ClosePeer));
        let effects = b.apply(CallEvent::Signal(m_reject));
        assert!(effects.contains(&Effect::ClosePeer));

        assert_eq!(m.phase(), Phase::Idle);
        assert_eq!(b.phase(), Phase::Idle);
    }

    #[test]
    fn duplicate_call_request_while_ringing_is_ignored() {
        let mut b = base();
        ring(&mut b, Identity::Mobile);

        // At-least-once-Zustellung: derselbe Wunsch kommt erneut an
        let dup = SignalMessage::call(Identity::Mobile, "different-offer".to_string());
        assert!(b.apply(CallEvent::Signal(dup)).is_empty());
        // Das ursprünglich gespeicherte Offer bleibt maßgeblich
        assert_eq!(b.pending_offer(), Some("offer-sdp"));
    }

    #[test]
    fn dial_while_ringing_keeps_the_stored_request_intact() {
        let mut b = base();
        ring(&mut b, Identity::Mobile);

        assert!(b.apply(CallEvent::Dial).is_empty());
        assert_eq!(b.phase(), Phase::Ringing);
        assert_eq!(b.pending_offer(), Some("offer-sdp"));
        assert_eq!(b.counterpart(), Some(Identity::Mobile));
    }

    // ------------------------------------------------------------------
    // Abbruch vor Annahme (Szenario C)
    // ------------------------------------------------------------------

    #[test]
    fn caller_cancel_clears_a_ringing_callee() {
        let mut b = base();
        ring(&mut b, Identity::Mobile);

        let effects = b.apply(CallEvent::Signal(SignalMessage::end(Identity::Mobile)));
        // Keine Peer Session angefordert, also auch nichts zu schließen
        assert!(effects.is_empty());
        assert_eq!(b.phase(), Phase::Idle);
        assert!(b.pending_offer().is_none());
        assert!(b.counterpart().is_none());
    }

    #[test]
    fn local_cancel_of_outbound_call_notifies_and_tears_down() {
        let mut m = mobile();
        dial(&mut m);

        let effects = m.apply(CallEvent::HangUp);
        let msgs = sent(&effects);
        assert_eq!(msgs[0].action, SignalAction::End);
        assert!(effects.contains(&Effect::ClosePeer));
        assert_eq!(m.phase(), Phase::Idle);
    }

    #[test]
    fn local_reject_sends_reject_and_discards_request() {
        let mut b = base();
        ring(&mut b, Identity::Mobile);

        let effects = b.apply(CallEvent::Reject);
        let msgs = sent(&effects);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].action, SignalAction::Reject);
        assert_eq!(b.phase(), Phase::Idle);
        assert!(b.pending_offer().is_none());
    }

    // ------------------------------------------------------------------
    // Idempotenz und veraltete Signale
    // ------------------------------------------------------------------

    #[test]
    fn second_end_for_an_idle_station_has_no_effect() {
        let mut m = mobile();
        dial(&mut m);

        let end = SignalMessage::end(Identity::Base);
        let first = m.apply(CallEvent::Signal(end.clone()));
        assert!(first.contains(&Effect::ClosePeer));
        assert_eq!(m.phase(), Phase::Idle);

        // At-least-once: dieselbe Nachricht noch einmal
        assert!(m.apply(CallEvent::Signal(end)).is_empty());
        assert_eq!(m.phase(), Phase::Idle);
    }

    #[test]
    fn stale_offer_after_cancel_does_not_resurrect_the_call() {
        let mut m = mobile();
        m.apply(CallEvent::Dial);
        // Nutzer bricht ab, während das Offer noch produziert wird
        m.apply(CallEvent::HangUp);
        assert_eq!(m.phase(), Phase::Idle);

        // Das späte Resultat läuft ins Leere
        assert!(m
            .apply(CallEvent::OfferReady("late-offer".to_string()))
            .is_empty());
        assert_eq!(m.phase(), Phase::Idle);
    }

    #[test]
    fn stale_answer_result_after_remote_end_is_discarded() {
        let mut b = base();
        ring(&mut b, Identity::Mobile);
        b.apply(CallEvent::Accept);
        b.apply(CallEvent::Signal(SignalMessage::end(Identity::Mobile)));
        assert_eq!(b.phase(), Phase::Idle);

        assert!(b
            .apply(CallEvent::AnswerReady("late-answer".to_string()))
            .is_empty());
        assert_eq!(b.phase(), Phase::Idle);
    }

    #[test]
    fn stale_answer_signal_in_idle_is_ignored() {
        let mut m = mobile();
        let answer = SignalMessage::answer(Identity::Base, "sdp".to_string());
        assert!(m.apply(CallEvent::Signal(answer)).is_empty());
        assert_eq!(m.phase(), Phase::Idle);
    }

    // ------------------------------------------------------------------
    // Kandidaten
    // ------------------------------------------------------------------

    fn candidate_signal(from: Identity) -> SignalMessage {
        SignalMessage::ice_candidate(
            from,
            CandidatePayload {
                candidate: "candidate:0 1 udp 1 198.51.100.7 9 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        )
    }

    #[test]
    fn candidate_is_forwarded_while_a_session_exists() {
        let mut m = mobile();
        dial(&mut m);

        let effects = m.apply(CallEvent::Signal(candidate_signal(Identity::Base)));
        assert!(matches!(effects[..], [Effect::ForwardCandidate { .. }]));
        assert_eq!(m.phase(), Phase::Calling);
    }

    #[test]
    fn candidate_without_a_session_is_ignored() {
        // Idle: gar kein Anruf
        let mut m = mobile();
        assert!(m
            .apply(CallEvent::Signal(candidate_signal(Identity::Base)))
            .is_empty());

        // Ringing vor der Annahme: noch keine Peer Session
        let mut b = base();
        ring(&mut b, Identity::Mobile);
        assert!(b
            .apply(CallEvent::Signal(candidate_signal(Identity::Mobile)))
            .is_empty());
    }

    // ------------------------------------------------------------------
    // Aktive Phase: Ende, Verbindungsverlust, Mute (Szenario D)
    // ------------------------------------------------------------------

    fn active_call() -> CallSession {
        let mut m = mobile();
        dial(&mut m);
        m.apply(CallEvent::Signal(SignalMessage::answer(
            Identity::Base,
            "answer-sdp".to_string(),
        )));
        m.apply(CallEvent::LinkUp);
        assert_eq!(m.phase(), Phase::Active);
        m
    }

    #[test]
    fn local_hang_up_notifies_counterpart_and_resets() {
        let mut m = active_call();
        let effects = m.apply(CallEvent::HangUp);
        let msgs = sent(&effects);
        assert_eq!(msgs[0].action, SignalAction::End);
        assert!(effects.contains(&Effect::ClosePeer));
        assert_eq!(m.phase(), Phase::Idle);
        assert!(m.elapsed().is_none());
    }

    #[test]
    fn remote_end_tears_down_without_echoing_end() {
        let mut m = active_call();
        let effects = m.apply(CallEvent::Signal(SignalMessage::end(Identity::Base)));
        assert!(sent(&effects).is_empty());
        assert!(effects.contains(&Effect::ClosePeer));
        assert_eq!(m.phase(), Phase::Idle);
    }

    #[test]
    fn link_loss_during_active_ends_with_best_effort_notify() {
        let mut m = active_call();
        let effects = m.apply(CallEvent::LinkDown);
        let msgs = sent(&effects);
        assert_eq!(msgs[0].action, SignalAction::End);
        assert!(effects.contains(&Effect::ClosePeer));
        assert_eq!(m.phase(), Phase::Idle);
    }

    #[test]
    fn double_mute_toggle_restores_the_flag_without_renegotiation() {
        let mut m = active_call();
        assert!(!m.muted());

        let effects = m.apply(CallEvent::ToggleMute);
        assert_eq!(effects, vec![Effect::SetMuted { muted: true }]);
        assert!(m.muted());

        let effects = m.apply(CallEvent::ToggleMute);
        assert_eq!(effects, vec![Effect::SetMuted { muted: false }]);
        assert!(!m.muted());
        // Keine Send-, Open- oder Apply-Effekte: nichts wird neu verhandelt
    }

    #[test]
    fn mute_resets_on_return_to_idle() {
        let mut m = active_call();
        m.apply(CallEvent::ToggleMute);
        assert!(m.muted());
        m.apply(CallEvent::HangUp);
        assert!(!m.muted());
    }

    // ------------------------------------------------------------------
    // Fehlerpfade
    // ------------------------------------------------------------------

    #[test]
    fn media_failure_while_ringing_is_an_implicit_reject() {
        let mut b = base();
        ring(&mut b, Identity::Mobile);
        b.apply(CallEvent::Accept);

        let effects = b.apply(CallEvent::MediaFailed("no input device".to_string()));
        let msgs = sent(&effects);
        assert_eq!(msgs[0].action, SignalAction::Reject);
        assert!(effects.contains(&Effect::ClosePeer));
        assert_eq!(b.phase(), Phase::Idle);
    }

    #[test]
    fn media_failure_while_calling_ends_the_attempt() {
        let mut m = mobile();
        m.apply(CallEvent::Dial);

        let effects = m.apply(CallEvent::MediaFailed("device busy".to_string()));
        let msgs = sent(&effects);
        assert_eq!(msgs[0].action, SignalAction::End);
        assert_eq!(m.phase(), Phase::Idle);
    }

    #[test]
    fn dial_timeout_abandons_an_unanswered_call() {
        let mut m = mobile();
        dial(&mut m);

        let effects = m.apply(CallEvent::DialTimeout);
        let msgs = sent(&effects);
        assert_eq!(msgs[0].action, SignalAction::End);
        assert!(effects.contains(&Effect::ClosePeer));
        assert_eq!(m.phase(), Phase::Idle);

        // Nach der Rückkehr zu Idle ist der Timeout bedeutungslos
        assert!(m.apply(CallEvent::DialTimeout).is_empty());
    }

    #[test]
    fn link_up_in_idle_is_ignored() {
        let mut m = mobile();
        assert!(m.apply(CallEvent::LinkUp).is_empty());
        assert_eq!(m.phase(), Phase::Idle);
        assert!(m.elapsed().is_none());
    }
}
