//! Call Controller
//!
//! Führt die reine Call State Machine als Aktor aus: genau ein Task pro
//! Station wählt über lokale Kommandos, Relay-Nachrichten, Peer-Events
//! und den Wähl-Timeout und führt die Effekte der Maschine aus. Damit
//! gibt es pro Station genau einen logischen Kontrollfaden, keine zwei
//! Übergänge verschränken sich.
//!
//! Langlaufende Peer-Operationen (Geräteerwerb, Offer/Answer-Produktion)
//! laufen in eigenen Tasks; ihre Resultate tragen die Generation der
//! Peer Session, unter der sie gestartet wurden. Kehrte der Anruf
//! inzwischen auf Idle zurück, ist die Generation weitergezählt und das
//! verspätete Resultat wird verworfen statt den Anruf wiederzubeleben.

use super::state::{CallEvent, CallSession, Effect, Phase};
use crate::media::{PeerEvent, PeerEventStream, PeerFactory, PeerSession};
use crate::signaling::{CandidatePayload, Identity, SignalChannel, SignalMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

// ============================================================================
// SNAPSHOT
// ============================================================================

/// Der nach oben (Präsentationsschicht) sichtbare Anrufzustand
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub phase: Phase,
    pub counterpart: Option<Identity>,
    /// Bisherige Dauer der aktiven Phase
    pub elapsed: Option<Duration>,
    pub muted: bool,
}

// ============================================================================
// COMMANDS
// ============================================================================

/// Lokale Aktionen der Präsentationsschicht
#[derive(Debug, Clone, Copy)]
enum Command {
    Dial,
    Accept,
    Reject,
    HangUp,
    ToggleMute,
}

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Zugriffspunkt der Präsentationsschicht auf die Station
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    /// Anruf zur Gegenstelle starten
    pub async fn dial(&self) {
        self.send(Command::Dial).await;
    }

    /// Eingehenden Anruf annehmen
    pub async fn accept(&self) {
        self.send(Command::Accept).await;
    }

    /// Eingehenden Anruf ablehnen
    pub async fn reject(&self) {
        self.send(Command::Reject).await;
    }

    /// Anruf beenden bzw. zurückziehen
    pub async fn hang_up(&self) {
        self.send(Command::HangUp).await;
    }

    /// Mikrofon stummschalten/freigeben
    pub async fn toggle_mute(&self) {
        self.send(Command::ToggleMute).await;
    }

    /// Aktueller Zustand
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Beobachtbarer Zustand für ereignisgetriebene Oberflächen
    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    async fn send(&self, cmd: Command) {
        if self.commands.send(cmd).await.is_err() {
            tracing::warn!("Call controller is gone, dropping {:?}", cmd);
        }
    }
}

// ============================================================================
// PEER TASK OUTCOMES
// ============================================================================

/// Resultat eines abgesetzten Peer-Tasks, gestempelt mit der Generation
enum PeerOutcome {
    Ready {
        generation: u64,
        peer: Arc<dyn PeerSession>,
        events: PeerEventStream,
        sdp: String,
        answering: bool,
    },
    Failed {
        generation: u64,
        reason: String,
    },
}

/// Was den Aktor geweckt hat
enum Wake {
    Event(CallEvent),
    Outcome(PeerOutcome),
    LocalCandidate(CandidatePayload),
    PeerStreamEnded,
    Lagged(u64),
    Tick,
    Stop,
}

// ============================================================================
// CALL CONTROLLER
// ============================================================================

/// Der Aktor hinter einem [`CallHandle`]
pub struct CallController {
    session: CallSession,
    channel: Arc<dyn SignalChannel>,
    peers: Arc<dyn PeerFactory>,
    peer: Option<Arc<dyn PeerSession>>,
    peer_events: Option<PeerEventStream>,
    /// Remote-Kandidaten, die eintrafen, während die Peer Session noch
    /// im Aufbau war; werden beim Abschluss des Aufbaus nachgereicht
    queued_candidates: Vec<CandidatePayload>,
    /// Zählt bei jedem Schließen der Peer Session weiter; veraltete
    /// Task-Resultate tragen eine kleinere Generation
    generation: u64,
    dial_timeout: Duration,
    dial_deadline: Option<Instant>,
    outcome_tx: mpsc::UnboundedSender<PeerOutcome>,
    snapshot_tx: watch::Sender<CallSnapshot>,
}

impl CallController {
    /// Startet den Aktor einer Station und liefert ihren Zugriffspunkt
    pub fn spawn(
        identity: Identity,
        channel: Arc<dyn SignalChannel>,
        peers: Arc<dyn PeerFactory>,
        dial_timeout: Duration,
    ) -> CallHandle {
        let session = CallSession::new(identity);
        // Vor dem Spawn abonnieren, damit nichts verpasst wird
        let inbound = channel.subscribe();

        let (command_tx, command_rx) = mpsc::channel(16);
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot {
            phase: Phase::Idle,
            counterpart: None,
            elapsed: None,
            muted: false,
        });

        let controller = Self {
            session,
            channel,
            peers,
            peer: None,
            peer_events: None,
            queued_candidates: Vec::new(),
            generation: 0,
            dial_timeout,
            dial_deadline: None,
            outcome_tx,
            snapshot_tx,
        };

        tokio::spawn(controller.run(command_rx, inbound, outcome_rx));

        CallHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut inbound: broadcast::Receiver<SignalMessage>,
        mut outcomes: mpsc::UnboundedReceiver<PeerOutcome>,
    ) {
        tracing::info!("Call controller running as {}", self.session.identity());
        loop {
            let deadline = self
                .dial_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            let wake = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => Wake::Event(command_event(cmd)),
                    // Handle gedroppt: Station wird abgebaut
                    None => Wake::Stop,
                },
                msg = inbound.recv() => match msg {
                    Ok(msg) => Wake::Event(CallEvent::Signal(msg)),
                    Err(broadcast::error::RecvError::Lagged(n)) => Wake::Lagged(n),
                    Err(broadcast::error::RecvError::Closed) => Wake::Stop,
                },
                outcome = outcomes.recv() => match outcome {
                    Some(outcome) => Wake::Outcome(outcome),
                    None => Wake::Stop,
                },
                ev = next_peer_event(&mut self.peer_events) => match ev {
                    Some(PeerEvent::CandidateDiscovered(c)) => Wake::LocalCandidate(c),
                    Some(PeerEvent::LinkUp) => Wake::Event(CallEvent::LinkUp),
                    Some(PeerEvent::LinkDown) => Wake::Event(CallEvent::LinkDown),
                    None => Wake::PeerStreamEnded,
                },
                _ = tokio::time::sleep_until(deadline), if self.dial_deadline.is_some() => {
                    Wake::Event(CallEvent::DialTimeout)
                }
                // Im aktiven Anruf den Snapshot sekündlich auffrischen,
                // damit die angezeigte Dauer auch ohne Ereignisse läuft
                _ = tokio::time::sleep(Duration::from_secs(1)),
                    if self.session.phase() == Phase::Active => Wake::Tick,
            };

            match wake {
                Wake::Event(event) => self.dispatch(event).await,
                Wake::Outcome(outcome) => {
                    if let Some(event) = self.admit(outcome) {
                        self.dispatch(event).await;
                    }
                }
                Wake::LocalCandidate(candidate) => self.forward_local_candidate(candidate),
                Wake::PeerStreamEnded => self.peer_events = None,
                Wake::Lagged(n) => {
                    tracing::warn!("Relay subscription lagged, skipped {} messages", n);
                }
                Wake::Tick => self.publish(),
                Wake::Stop => break,
            }
        }

        // Beim Abbau keinen Anruf zurücklassen
        self.dispatch(CallEvent::HangUp).await;
        tracing::info!("Call controller stopped");
    }

    /// Ein Ereignis vollständig verarbeiten: Übergang, Effekte, Snapshot
    async fn dispatch(&mut self, event: CallEvent) {
        let effects = self.session.apply(event);
        for effect in effects {
            self.perform(effect).await;
        }
        self.update_dial_deadline();
        self.publish();
    }

    async fn perform(&mut self, effect: Effect) {
        match effect {
            Effect::Send(msg) => self.channel.send(msg),
            Effect::OpenPeerForOffer => self.open_peer(None),
            Effect::OpenPeerForAnswer { offer } => self.open_peer(Some(offer)),
            Effect::ApplyAnswer { answer } => {
                let Some(peer) = self.peer.clone() else {
                    tracing::debug!("No peer session for answer, dropping");
                    return;
                };
                let tx = self.outcome_tx.clone();
                let generation = self.generation;
                tokio::spawn(async move {
                    // Ein strukturell kaputtes Answer beendet den Anruf
                    if let Err(e) = peer.apply_answer(answer).await {
                        let _ = tx.send(PeerOutcome::Failed {
                            generation,
                            reason: e.to_string(),
                        });
                    }
                });
            }
            Effect::ForwardCandidate { candidate } => {
                let Some(peer) = self.peer.clone() else {
                    // Die Gegenseite trickelt schon, während hier noch
                    // Geräte erworben werden: bis zum Abschluss des
                    // Aufbaus sammeln, nichts geht verloren
                    tracing::debug!("Peer session still opening, queueing remote candidate");
                    self.queued_candidates.push(candidate);
                    return;
                };
                tokio::spawn(async move {
                    // Ein einzelner unbrauchbarer Kandidat ist nicht fatal
                    if let Err(e) = peer.add_remote_candidate(candidate).await {
                        tracing::warn!("Failed to add remote candidate: {}", e);
                    }
                });
            }
            Effect::SetMuted { muted } => {
                if let Some(peer) = &self.peer {
                    peer.set_muted(muted);
                }
            }
            Effect::ClosePeer => {
                self.generation += 1;
                self.peer_events = None;
                self.queued_candidates.clear();
                if let Some(peer) = self.peer.take() {
                    tokio::spawn(async move {
                        peer.close().await;
                    });
                }
            }
        }
    }

    /// Öffnet eine Peer Session im Hintergrund; `offer` entscheidet, ob
    /// ein Answer (Angerufener) oder ein Offer (Anrufer) produziert wird
    fn open_peer(&mut self, offer: Option<String>) {
        let peers = Arc::clone(&self.peers);
        let tx = self.outcome_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let answering = offer.is_some();
            let result = async {
                let (peer, events) = peers.open().await?;
                let sdp = match offer {
                    Some(remote) => peer.accept_offer(remote).await,
                    None => peer.create_offer().await,
                };
                match sdp {
                    Ok(sdp) => Ok((peer, events, sdp)),
                    Err(e) => {
                        peer.close().await;
                        Err(e)
                    }
                }
            }
            .await;

            let outcome = match result {
                Ok((peer, events, sdp)) => PeerOutcome::Ready {
                    generation,
                    peer,
                    events,
                    sdp,
                    answering,
                },
                Err(e) => PeerOutcome::Failed {
                    generation,
                    reason: e.to_string(),
                },
            };
            let _ = tx.send(outcome);
        });
    }

    /// Prüft ein Task-Resultat gegen die aktuelle Generation
    fn admit(&mut self, outcome: PeerOutcome) -> Option<CallEvent> {
        match outcome {
            PeerOutcome::Ready {
                generation,
                peer,
                events,
                sdp,
                answering,
            } => {
                if generation != self.generation {
                    // Der Anruf wurde während des Aufbaus aufgegeben
                    tracing::debug!("Discarding peer session from a finished call");
                    tokio::spawn(async move {
                        peer.close().await;
                    });
                    return None;
                }
                self.peer = Some(Arc::clone(&peer));
                self.peer_events = Some(events);
                // Während des Aufbaus gesammelte Kandidaten in
                // Empfangsreihenfolge nachreichen
                let queued = std::mem::take(&mut self.queued_candidates);
                if !queued.is_empty() {
                    tracing::debug!("Delivering {} queued remote candidate(s)", queued.len());
                    let peer = Arc::clone(&peer);
                    tokio::spawn(async move {
                        for candidate in queued {
                            if let Err(e) = peer.add_remote_candidate(candidate).await {
                                tracing::warn!("Failed to add queued candidate: {}", e);
                            }
                        }
                    });
                }
                Some(if answering {
                    CallEvent::AnswerReady(sdp)
                } else {
                    CallEvent::OfferReady(sdp)
                })
            }
            PeerOutcome::Failed { generation, reason } => {
                if generation != self.generation {
                    tracing::debug!("Ignoring late failure from a finished call: {}", reason);
                    return None;
                }
                Some(CallEvent::MediaFailed(reason))
            }
        }
    }

    /// Lokal entdeckte Kandidaten an die Gegenstelle publizieren
    fn forward_local_candidate(&self, candidate: CandidatePayload) {
        if self.session.phase() == Phase::Idle {
            return;
        }
        self.channel.send(SignalMessage::ice_candidate(
            self.session.identity(),
            candidate,
        ));
    }

    /// Armiert den Wähl-Timeout beim Eintritt in `Calling`, löst ihn
    /// beim Verlassen
    fn update_dial_deadline(&mut self) {
        if self.session.phase() == Phase::Calling {
            if self.dial_deadline.is_none() {
                self.dial_deadline = Some(Instant::now() + self.dial_timeout);
            }
        } else {
            self.dial_deadline = None;
        }
    }

    fn publish(&self) {
        let snapshot = CallSnapshot {
            phase: self.session.phase(),
            counterpart: self.session.counterpart(),
            elapsed: self.session.elapsed(),
            muted: self.session.muted(),
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

fn command_event(cmd: Command) -> CallEvent {
    match cmd {
        Command::Dial => CallEvent::Dial,
        Command::Accept => CallEvent::Accept,
        Command::Reject => CallEvent::Reject,
        Command::HangUp => CallEvent::HangUp,
        Command::ToggleMute => CallEvent::ToggleMute,
    }
}

/// Wartet auf das nächste Peer-Event oder ewig, wenn keine Session lebt
async fn next_peer_event(events: &mut Option<PeerEventStream>) -> Option<PeerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
