//! Peer Connection Orchestrator
//!
//! Owns one negotiation link per remote member, the local capture stream and
//! the local voice state. Every link negotiates independently; the link's own
//! lock serializes the steps of a single negotiation.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::media::{
    AudioDevice, CaptureConstraints, CaptureDevice, CaptureStream, LocalTrack, MediaError,
    PeerEventSender, PeerFactory, PeerTransport, SharedVoice, TransportState, VoiceState,
};
use crate::protocol::{IceCandidate, SessionDescription};
use crate::room::MemberId;

/// Orchestrator errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("No link for member {0}")]
    UnknownPeer(MemberId),
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("Negotiation with {remote} failed: {reason}")]
    Negotiation { remote: MemberId, reason: String },
    #[error("Device error: {0}")]
    Device(String),
    #[error("Link closed")]
    Closed,
}

/// Which side of the description exchange this link is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationRole {
    OfferSent,
    AnswerSent,
}

/// Negotiation state of one link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPhase {
    Idle,
    Negotiating(NegotiationRole),
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkPhase::Idle => f.write_str("idle"),
            LinkPhase::Negotiating(NegotiationRole::OfferSent) => f.write_str("negotiating (offer sent)"),
            LinkPhase::Negotiating(NegotiationRole::AnswerSent) => f.write_str("negotiating (answer sent)"),
            LinkPhase::Connected => f.write_str("connected"),
            LinkPhase::Failed => f.write_str("failed"),
            LinkPhase::Closed => f.write_str("closed"),
        }
    }
}

/// Microphone capture as handed back to callers
#[derive(Clone)]
pub struct MediaHandle {
    pub device_id: String,
    pub track: LocalTrack,
}

/// What the caller should do after a transport state report
#[derive(Debug, Clone, PartialEq)]
pub enum TransportOutcome {
    /// Nothing to send
    Unchanged,
    Connected,
    /// Send this ICE-restart offer to the peer
    Restart(SessionDescription),
    /// The restart budget is spent; the link stays failed
    GaveUp,
}

struct LinkState {
    phase: LinkPhase,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    pending_candidates: VecDeque<IceCandidate>,
    transport_connected: bool,
    restart_attempted: bool,
    track_attached: bool,
}

impl LinkState {
    fn new() -> Self {
        Self {
            phase: LinkPhase::Idle,
            local_description: None,
            remote_description: None,
            pending_candidates: VecDeque::new(),
            transport_connected: false,
            restart_attempted: false,
            track_attached: false,
        }
    }

    fn descriptions_set(&self) -> bool {
        self.local_description.is_some() && self.remote_description.is_some()
    }
}

struct Link {
    remote: MemberId,
    transport: Arc<dyn PeerTransport>,
    state: tokio::sync::Mutex<LinkState>,
}

impl Link {
    fn negotiation(&self, err: MediaError) -> OrchestratorError {
        OrchestratorError::Negotiation {
            remote: self.remote.clone(),
            reason: err.to_string(),
        }
    }

    async fn flush_candidates(&self, state: &mut LinkState) {
        while let Some(candidate) = state.pending_candidates.pop_front() {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                log::warn!("Failed to apply queued candidate from {}: {}", self.remote, e);
            }
        }
    }
}

/// Handle to a live link
#[derive(Clone)]
pub struct LinkHandle {
    link: Arc<Link>,
}

impl LinkHandle {
    pub fn remote(&self) -> &MemberId {
        &self.link.remote
    }

    pub async fn phase(&self) -> LinkPhase {
        self.link.state.lock().await.phase
    }
}

pub struct Orchestrator {
    capture_device: Arc<dyn CaptureDevice>,
    peer_factory: Arc<dyn PeerFactory>,
    peer_events: PeerEventSender,
    constraints: Mutex<CaptureConstraints>,
    /// Serializes capture open/switch; never held by readers
    capture_op: tokio::sync::Mutex<()>,
    capture: RwLock<Option<Arc<dyn CaptureStream>>>,
    links: Mutex<HashMap<MemberId, Arc<Link>>>,
    local_member: RwLock<Option<MemberId>>,
    voice: SharedVoice,
    /// Bumped by `close_all` so in-flight device opens can tell they were cancelled
    epoch: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        capture_device: Arc<dyn CaptureDevice>,
        peer_factory: Arc<dyn PeerFactory>,
        peer_events: PeerEventSender,
        voice: SharedVoice,
    ) -> Self {
        Self {
            capture_device,
            peer_factory,
            peer_events,
            constraints: Mutex::new(CaptureConstraints::default()),
            capture_op: tokio::sync::Mutex::new(()),
            capture: RwLock::new(None),
            links: Mutex::new(HashMap::new()),
            local_member: RwLock::new(None),
            voice,
            epoch: AtomicU64::new(0),
        }
    }

    /// Our own member id, used for glare resolution
    pub fn set_local_member(&self, id: Option<MemberId>) {
        *self.local_member.write() = id;
    }

    pub fn local_member(&self) -> Option<MemberId> {
        self.local_member.read().clone()
    }

    /// Acquire the microphone. A second call returns the existing capture.
    pub async fn initialize_capture(
        &self,
        constraints: CaptureConstraints,
    ) -> Result<MediaHandle, OrchestratorError> {
        let _op = self.capture_op.lock().await;
        if let Some(capture) = self.capture.read().as_ref() {
            return Ok(MediaHandle {
                device_id: capture.device_id().to_string(),
                track: capture.track(),
            });
        }

        let epoch = self.epoch.load(Ordering::SeqCst);
        let stream = self
            .capture_device
            .open(&constraints)
            .await
            .map_err(capture_error)?;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            log::debug!("Session ended while opening capture; releasing device");
            return Err(OrchestratorError::Closed);
        }

        let stream: Arc<dyn CaptureStream> = Arc::from(stream);
        let muted = {
            let mut voice = self.voice.write();
            voice.capturing = true;
            voice.muted
        };
        stream.set_enabled(!muted);
        *self.capture.write() = Some(stream.clone());
        *self.constraints.lock() = constraints;
        log::info!("Capture started on {}", stream.device_id());

        for link in self.snapshot_links() {
            let mut state = link.state.lock().await;
            if state.phase == LinkPhase::Closed || state.track_attached {
                continue;
            }
            match link.transport.add_track(stream.track()).await {
                Ok(()) => state.track_attached = true,
                Err(e) => log::warn!("Failed to attach track for {}: {}", link.remote, e),
            }
        }

        Ok(MediaHandle {
            device_id: stream.device_id().to_string(),
            track: stream.track(),
        })
    }

    /// Allocate a link for a peer, replacing any previous one.
    pub async fn create_link(&self, remote: &MemberId) -> Result<LinkHandle, OrchestratorError> {
        self.close_link(remote).await;

        let transport = self
            .peer_factory
            .create(remote, self.peer_events.clone())
            .await
            .map_err(|e| OrchestratorError::Negotiation {
                remote: remote.clone(),
                reason: e.to_string(),
            })?;

        // Held until the link is registered so a concurrent capture start or
        // device switch sees it.
        let _op = self.capture_op.lock().await;
        let mut state = LinkState::new();
        let track = self.capture.read().as_ref().map(|c| c.track());
        if let Some(track) = track {
            transport.add_track(track).await.map_err(|e| OrchestratorError::Negotiation {
                remote: remote.clone(),
                reason: e.to_string(),
            })?;
            state.track_attached = true;
        }

        let link = Arc::new(Link {
            remote: remote.clone(),
            transport,
            state: tokio::sync::Mutex::new(state),
        });
        self.links.lock().insert(remote.clone(), link.clone());
        log::debug!("Link created for {}", remote);
        Ok(LinkHandle { link })
    }

    pub fn has_link(&self, remote: &MemberId) -> bool {
        self.links.lock().contains_key(remote)
    }

    pub async fn make_offer(&self, remote: &MemberId) -> Result<SessionDescription, OrchestratorError> {
        let link = self.link(remote)?;
        let mut state = link.state.lock().await;
        if state.phase == LinkPhase::Closed {
            return Err(OrchestratorError::Closed);
        }
        let ice_restart = state.phase == LinkPhase::Failed;
        self.offer_locked(&link, &mut state, ice_restart).await
    }

    /// Answer a remote offer. Returns `None` when our own pending offer wins glare
    /// and the remote offer is discarded.
    pub async fn make_answer(
        &self,
        remote: &MemberId,
        offer: SessionDescription,
    ) -> Result<Option<SessionDescription>, OrchestratorError> {
        let link = self.link(remote)?;
        let mut state = link.state.lock().await;
        if state.phase == LinkPhase::Closed {
            return Err(OrchestratorError::Closed);
        }

        if state.phase == LinkPhase::Negotiating(NegotiationRole::OfferSent) {
            if self.wins_glare(remote) {
                log::info!("Glare with {}: keeping our offer", remote);
                return Ok(None);
            }
            log::info!("Glare with {}: rolling back our offer", remote);
            link.transport.rollback().await.map_err(|e| link.negotiation(e))?;
            state.local_description = None;
        }

        link.transport
            .set_remote_description(offer.clone())
            .await
            .map_err(|e| link.negotiation(e))?;
        state.remote_description = Some(offer);
        link.flush_candidates(&mut state).await;

        let answer = link.transport.create_answer().await.map_err(|e| link.negotiation(e))?;
        link.transport
            .set_local_description(answer.clone())
            .await
            .map_err(|e| link.negotiation(e))?;
        state.local_description = Some(answer.clone());
        state.phase = if state.transport_connected {
            LinkPhase::Connected
        } else {
            LinkPhase::Negotiating(NegotiationRole::AnswerSent)
        };
        log::debug!("Link {} is {}", remote, state.phase);
        Ok(Some(answer))
    }

    pub async fn apply_remote_answer(
        &self,
        remote: &MemberId,
        answer: SessionDescription,
    ) -> Result<(), OrchestratorError> {
        let link = self.link(remote)?;
        let mut state = link.state.lock().await;
        match state.phase {
            LinkPhase::Closed => return Err(OrchestratorError::Closed),
            LinkPhase::Negotiating(NegotiationRole::OfferSent) => {}
            phase => {
                return Err(OrchestratorError::Negotiation {
                    remote: remote.clone(),
                    reason: format!("unexpected answer while {}", phase),
                })
            }
        }

        link.transport
            .set_remote_description(answer.clone())
            .await
            .map_err(|e| link.negotiation(e))?;
        state.remote_description = Some(answer);
        link.flush_candidates(&mut state).await;
        if state.transport_connected {
            state.phase = LinkPhase::Connected;
        }
        log::debug!("Link {} is {}", remote, state.phase);
        Ok(())
    }

    /// Apply a remote candidate, or hold it until the remote description is set.
    pub async fn enqueue_remote_candidate(
        &self,
        remote: &MemberId,
        candidate: IceCandidate,
    ) -> Result<(), OrchestratorError> {
        let link = self.link(remote)?;
        let mut state = link.state.lock().await;
        if state.phase == LinkPhase::Closed {
            return Err(OrchestratorError::Closed);
        }
        if state.remote_description.is_none() {
            state.pending_candidates.push_back(candidate);
            return Ok(());
        }
        link.transport
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| link.negotiation(e))
    }

    /// Feed a connectivity report from the transport into the link's state machine.
    pub async fn handle_transport_state(
        &self,
        remote: &MemberId,
        transport_state: TransportState,
    ) -> Result<TransportOutcome, OrchestratorError> {
        let link = self.link(remote)?;
        let mut state = link.state.lock().await;
        if state.phase == LinkPhase::Closed {
            return Ok(TransportOutcome::Unchanged);
        }

        match transport_state {
            TransportState::Connected => {
                state.transport_connected = true;
                state.restart_attempted = false;
                if state.descriptions_set() {
                    state.phase = LinkPhase::Connected;
                }
                log::info!("Link {} connected", remote);
                Ok(TransportOutcome::Connected)
            }
            TransportState::Failed => {
                state.transport_connected = false;
                state.phase = LinkPhase::Failed;
                if state.restart_attempted {
                    log::error!("Link {} failed again after ICE restart; giving up", remote);
                    return Ok(TransportOutcome::GaveUp);
                }
                state.restart_attempted = true;
                log::warn!("Link {} failed; attempting ICE restart", remote);
                let offer = self.offer_locked(&link, &mut state, true).await?;
                Ok(TransportOutcome::Restart(offer))
            }
            TransportState::Disconnected => {
                state.transport_connected = false;
                log::debug!("Link {} transport disconnected", remote);
                Ok(TransportOutcome::Unchanged)
            }
            TransportState::New | TransportState::Connecting | TransportState::Closed => {
                Ok(TransportOutcome::Unchanged)
            }
        }
    }

    /// Silence or resume outbound audio. Negotiation is untouched.
    pub fn set_muted(&self, muted: bool) {
        self.voice.write().muted = muted;
        if let Some(capture) = self.capture.read().as_ref() {
            capture.set_enabled(!muted);
        }
        log::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
    }

    /// Clamp and store the playback volume; returns the stored value.
    pub fn set_volume(&self, volume: u8) -> u8 {
        let volume = volume.min(100);
        self.voice.write().volume = volume;
        volume
    }

    /// Current input level, 0 while muted or not capturing.
    pub fn meter_level(&self) -> u8 {
        let level = match self.capture.read().as_ref() {
            Some(capture) if !self.voice.get().muted => capture.level().min(100),
            _ => 0,
        };
        self.voice.write().audio_level = level;
        level
    }

    pub fn voice_state(&self) -> VoiceState {
        self.voice.get()
    }

    pub fn list_input_devices(&self) -> Result<Vec<AudioDevice>, OrchestratorError> {
        self.capture_device
            .input_devices()
            .map_err(|e| OrchestratorError::Device(e.to_string()))
    }

    /// Move capture to another input device. On failure the previous device
    /// stays active on every link.
    pub async fn switch_input_device(&self, device_id: &str) -> Result<(), OrchestratorError> {
        let _op = self.capture_op.lock().await;
        let previous = self
            .capture
            .read()
            .clone()
            .ok_or_else(|| OrchestratorError::Device("capture is not initialized".to_string()))?;
        if previous.device_id() == device_id {
            return Ok(());
        }

        let constraints = self.constraints.lock().with_device(device_id);
        let next: Arc<dyn CaptureStream> = Arc::from(
            self.capture_device
                .open(&constraints)
                .await
                .map_err(|e| OrchestratorError::Device(e.to_string()))?,
        );
        next.set_enabled(!self.voice.get().muted);

        let mut replaced: Vec<Arc<Link>> = Vec::new();
        for link in self.snapshot_links() {
            if let Err(e) = link.transport.replace_track(next.track()).await {
                log::warn!("Track replacement failed for {}: {}; reverting", link.remote, e);
                for done in replaced {
                    if let Err(e) = done.transport.replace_track(previous.track()).await {
                        log::error!("Failed to restore track for {}: {}", done.remote, e);
                    }
                }
                return Err(OrchestratorError::Device(e.to_string()));
            }
            replaced.push(link);
        }

        *self.capture.write() = Some(next);
        *self.constraints.lock() = constraints;
        log::info!("Switched input device from {} to {}", previous.device_id(), device_id);
        Ok(())
    }

    pub async fn link_state(&self, remote: &MemberId) -> Option<LinkPhase> {
        let link = self.links.lock().get(remote).cloned()?;
        let phase = link.state.lock().await.phase;
        Some(phase)
    }

    pub async fn link_states(&self) -> HashMap<MemberId, LinkPhase> {
        let mut phases = HashMap::new();
        for link in self.snapshot_links() {
            let phase = link.state.lock().await.phase;
            phases.insert(link.remote.clone(), phase);
        }
        phases
    }

    /// Tear down one link. Safe on unknown or already-closed links.
    pub async fn close_link(&self, remote: &MemberId) {
        let link = self.links.lock().remove(remote);
        if let Some(link) = link {
            Self::shutdown_link(&link).await;
            log::debug!("Link {} closed", remote);
        }
    }

    /// Tear down every link and release the microphone.
    pub async fn close_all(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let links: Vec<_> = self.links.lock().drain().map(|(_, link)| link).collect();
        for link in &links {
            Self::shutdown_link(link).await;
        }

        let _op = self.capture_op.lock().await;
        if let Some(capture) = self.capture.write().take() {
            log::info!("Capture stopped on {}", capture.device_id());
        }
        let mut voice = self.voice.write();
        voice.capturing = false;
        voice.audio_level = 0;
    }

    fn link(&self, remote: &MemberId) -> Result<Arc<Link>, OrchestratorError> {
        self.links
            .lock()
            .get(remote)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownPeer(remote.clone()))
    }

    fn snapshot_links(&self) -> Vec<Arc<Link>> {
        self.links.lock().values().cloned().collect()
    }

    fn wins_glare(&self, remote: &MemberId) -> bool {
        match self.local_member.read().as_ref() {
            Some(local) => local < remote,
            None => false,
        }
    }

    async fn offer_locked(
        &self,
        link: &Link,
        state: &mut LinkState,
        ice_restart: bool,
    ) -> Result<SessionDescription, OrchestratorError> {
        let offer = link
            .transport
            .create_offer(ice_restart)
            .await
            .map_err(|e| link.negotiation(e))?;
        link.transport
            .set_local_description(offer.clone())
            .await
            .map_err(|e| link.negotiation(e))?;
        state.local_description = Some(offer.clone());
        // Candidates for the new exchange wait for the matching answer.
        state.remote_description = None;
        state.phase = LinkPhase::Negotiating(NegotiationRole::OfferSent);
        log::debug!("Offer created for {} (ice restart: {})", link.remote, ice_restart);
        Ok(offer)
    }

    async fn shutdown_link(link: &Link) {
        let mut state = link.state.lock().await;
        if state.phase == LinkPhase::Closed {
            return;
        }
        state.phase = LinkPhase::Closed;
        state.pending_candidates.clear();
        state.local_description = None;
        state.remote_description = None;
        if let Err(e) = link.transport.close().await {
            log::warn!("Error closing link {}: {}", link.remote, e);
        }
    }
}

fn capture_error(err: MediaError) -> OrchestratorError {
    match err {
        MediaError::PermissionDenied(reason) => OrchestratorError::PermissionDenied(reason),
        MediaError::Closed => OrchestratorError::Closed,
        other => OrchestratorError::Device(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{candidate, FakeCaptureDevice, FakePeerFactory};
    use std::sync::atomic::Ordering;
    use tokio::sync::mpsc;

    struct Fixture {
        orchestrator: Orchestrator,
        capture: Arc<FakeCaptureDevice>,
        peers: Arc<FakePeerFactory>,
    }

    fn fixture(local: &str) -> Fixture {
        let capture = Arc::new(FakeCaptureDevice::default());
        let peers = Arc::new(FakePeerFactory::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(capture.clone(), peers.clone(), tx, SharedVoice::default());
        orchestrator.set_local_member(Some(MemberId::from(local)));
        Fixture {
            orchestrator,
            capture,
            peers,
        }
    }

    fn id(s: &str) -> MemberId {
        MemberId::from(s)
    }

    #[tokio::test]
    async fn test_initialize_capture_is_idempotent() {
        let f = fixture("a");
        let first = f.orchestrator.initialize_capture(CaptureConstraints::default()).await.unwrap();
        let second = f.orchestrator.initialize_capture(CaptureConstraints::default()).await.unwrap();

        assert_eq!(first.device_id, second.device_id);
        assert_eq!(f.capture.opened.lock().len(), 1);
        assert!(f.orchestrator.voice_state().capturing);
    }

    #[tokio::test]
    async fn test_permission_denied() {
        let f = fixture("a");
        f.capture.deny.store(true, Ordering::SeqCst);

        let err = f
            .orchestrator
            .initialize_capture(CaptureConstraints::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, OrchestratorError::PermissionDenied(_)));
        assert!(!f.orchestrator.voice_state().capturing);

        // A retry by the user succeeds once access is granted.
        f.capture.deny.store(false, Ordering::SeqCst);
        assert!(f.orchestrator.initialize_capture(CaptureConstraints::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_create_link_attaches_track() {
        let f = fixture("a");
        f.orchestrator.create_link(&id("early")).await.unwrap();
        assert!(f.peers.transport("early").calls().is_empty());

        f.orchestrator.initialize_capture(CaptureConstraints::default()).await.unwrap();
        // Links created before capture pick up the track when capture starts.
        assert_eq!(f.peers.transport("early").calls(), vec!["add_track"]);

        let handle = f.orchestrator.create_link(&id("late")).await.unwrap();
        assert_eq!(handle.remote(), &id("late"));
        assert_eq!(handle.phase().await, LinkPhase::Idle);
        assert_eq!(f.peers.transport("late").calls(), vec!["add_track"]);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let f = fixture("a");
        let ghost = id("ghost");

        assert_eq!(
            f.orchestrator.make_offer(&ghost).await.err(),
            Some(OrchestratorError::UnknownPeer(ghost.clone()))
        );
        assert!(matches!(
            f.orchestrator.make_answer(&ghost, SessionDescription::offer("x")).await,
            Err(OrchestratorError::UnknownPeer(_))
        ));
        assert!(matches!(
            f.orchestrator.apply_remote_answer(&ghost, SessionDescription::answer("x")).await,
            Err(OrchestratorError::UnknownPeer(_))
        ));
        assert!(matches!(
            f.orchestrator.enqueue_remote_candidate(&ghost, candidate(1)).await,
            Err(OrchestratorError::UnknownPeer(_))
        ));
    }

    #[tokio::test]
    async fn test_offer_answer_connect() {
        let f = fixture("a");
        let bob = id("b");
        f.orchestrator.create_link(&bob).await.unwrap();

        let offer = f.orchestrator.make_offer(&bob).await.unwrap();
        assert_eq!(offer.sdp, "offer-b-0");
        assert_eq!(
            f.orchestrator.link_state(&bob).await,
            Some(LinkPhase::Negotiating(NegotiationRole::OfferSent))
        );

        f.orchestrator
            .apply_remote_answer(&bob, SessionDescription::answer("answer-from-b"))
            .await
            .unwrap();
        // Descriptions alone do not make a link connected.
        assert_eq!(
            f.orchestrator.link_state(&bob).await,
            Some(LinkPhase::Negotiating(NegotiationRole::OfferSent))
        );

        let outcome = f
            .orchestrator
            .handle_transport_state(&bob, TransportState::Connected)
            .await
            .unwrap();
        assert_eq!(outcome, TransportOutcome::Connected);
        assert_eq!(f.orchestrator.link_state(&bob).await, Some(LinkPhase::Connected));
    }

    #[tokio::test]
    async fn test_answer_side() {
        let f = fixture("b");
        let alice = id("a");
        f.orchestrator.create_link(&alice).await.unwrap();

        let answer = f
            .orchestrator
            .make_answer(&alice, SessionDescription::offer("offer-from-a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.sdp, "answer-a");
        assert_eq!(
            f.orchestrator.link_state(&alice).await,
            Some(LinkPhase::Negotiating(NegotiationRole::AnswerSent))
        );
        assert_eq!(
            f.peers.transport("a").calls(),
            vec!["set_remote:offer-from-a", "create_answer", "set_local:answer-a"]
        );

        // An answer without a pending offer is a negotiation error.
        assert!(matches!(
            f.orchestrator.apply_remote_answer(&alice, SessionDescription::answer("late")).await,
            Err(OrchestratorError::Negotiation { .. })
        ));
    }

    #[tokio::test]
    async fn test_candidates_queued_until_description() {
        let f = fixture("a");
        let bob = id("b");
        f.orchestrator.create_link(&bob).await.unwrap();
        f.orchestrator.make_offer(&bob).await.unwrap();

        for n in 1..=3 {
            f.orchestrator.enqueue_remote_candidate(&bob, candidate(n)).await.unwrap();
        }
        assert!(!f.peers.transport("b").calls().iter().any(|c| c.starts_with("candidate")));

        f.orchestrator
            .apply_remote_answer(&bob, SessionDescription::answer("ans"))
            .await
            .unwrap();
        f.orchestrator.enqueue_remote_candidate(&bob, candidate(4)).await.unwrap();

        let calls = f.peers.transport("b").calls();
        let applied: Vec<_> = calls.iter().filter(|c| c.starts_with("candidate")).collect();
        assert_eq!(applied, vec!["candidate:c1", "candidate:c2", "candidate:c3", "candidate:c4"]);
        let remote_set = calls.iter().position(|c| c == "set_remote:ans").unwrap();
        let first_candidate = calls.iter().position(|c| c == "candidate:c1").unwrap();
        assert!(remote_set < first_candidate);
    }

    #[tokio::test]
    async fn test_glare_lower_id_wins() {
        // "a" < "b": our offer stands and theirs is ignored.
        let f = fixture("a");
        let bob = id("b");
        f.orchestrator.create_link(&bob).await.unwrap();
        f.orchestrator.make_offer(&bob).await.unwrap();

        let result = f
            .orchestrator
            .make_answer(&bob, SessionDescription::offer("offer-from-b"))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(
            f.orchestrator.link_state(&bob).await,
            Some(LinkPhase::Negotiating(NegotiationRole::OfferSent))
        );
        assert!(!f.peers.transport("b").calls().contains(&"rollback".to_string()));
    }

    #[tokio::test]
    async fn test_glare_higher_id_yields() {
        let f = fixture("b");
        let alice = id("a");
        f.orchestrator.create_link(&alice).await.unwrap();
        f.orchestrator.make_offer(&alice).await.unwrap();

        let answer = f
            .orchestrator
            .make_answer(&alice, SessionDescription::offer("offer-from-a"))
            .await
            .unwrap();
        assert!(answer.is_some());

        let calls = f.peers.transport("a").calls();
        let rollback = calls.iter().position(|c| c == "rollback").unwrap();
        let remote = calls.iter().position(|c| c == "set_remote:offer-from-a").unwrap();
        assert!(rollback < remote);
        assert_eq!(
            f.orchestrator.link_state(&alice).await,
            Some(LinkPhase::Negotiating(NegotiationRole::AnswerSent))
        );
    }

    #[tokio::test]
    async fn test_single_ice_restart() {
        let f = fixture("a");
        let bob = id("b");
        f.orchestrator.create_link(&bob).await.unwrap();
        f.orchestrator.make_offer(&bob).await.unwrap();
        f.orchestrator
            .apply_remote_answer(&bob, SessionDescription::answer("ans"))
            .await
            .unwrap();
        f.orchestrator
            .handle_transport_state(&bob, TransportState::Connected)
            .await
            .unwrap();

        let outcome = f
            .orchestrator
            .handle_transport_state(&bob, TransportState::Failed)
            .await
            .unwrap();
        match outcome {
            TransportOutcome::Restart(offer) => assert_eq!(offer.sdp, "offer-b-1"),
            other => panic!("expected restart, got {:?}", other),
        }
        assert!(f.peers.transport("b").calls().contains(&"create_offer:true".to_string()));
        assert_eq!(
            f.orchestrator.link_state(&bob).await,
            Some(LinkPhase::Negotiating(NegotiationRole::OfferSent))
        );

        // The restart also fails: the link stays failed.
        let outcome = f
            .orchestrator
            .handle_transport_state(&bob, TransportState::Failed)
            .await
            .unwrap();
        assert_eq!(outcome, TransportOutcome::GaveUp);
        assert_eq!(f.orchestrator.link_state(&bob).await, Some(LinkPhase::Failed));
        let restarts = f
            .peers
            .transport("b")
            .calls()
            .iter()
            .filter(|c| *c == "create_offer:true")
            .count();
        assert_eq!(restarts, 1);
    }

    #[tokio::test]
    async fn test_restart_budget_resets_after_recovery() {
        let f = fixture("a");
        let bob = id("b");
        f.orchestrator.create_link(&bob).await.unwrap();
        f.orchestrator.make_offer(&bob).await.unwrap();

        let first = f.orchestrator.handle_transport_state(&bob, TransportState::Failed).await.unwrap();
        assert!(matches!(first, TransportOutcome::Restart(_)));
        f.orchestrator
            .apply_remote_answer(&bob, SessionDescription::answer("restarted"))
            .await
            .unwrap();
        f.orchestrator.handle_transport_state(&bob, TransportState::Connected).await.unwrap();
        assert_eq!(f.orchestrator.link_state(&bob).await, Some(LinkPhase::Connected));

        let second = f.orchestrator.handle_transport_state(&bob, TransportState::Failed).await.unwrap();
        assert!(matches!(second, TransportOutcome::Restart(_)));
    }

    #[tokio::test]
    async fn test_mute_and_meter() {
        let f = fixture("a");
        assert_eq!(f.orchestrator.meter_level(), 0);

        f.orchestrator.initialize_capture(CaptureConstraints::default()).await.unwrap();
        let stream = f.capture.latest();
        stream.level.store(42, Ordering::SeqCst);
        assert_eq!(f.orchestrator.meter_level(), 42);
        assert_eq!(f.orchestrator.voice_state().audio_level, 42);

        let bob = id("b");
        f.orchestrator.create_link(&bob).await.unwrap();
        let calls_before = f.peers.transport("b").calls().len();

        f.orchestrator.set_muted(true);
        assert!(!stream.enabled.load(Ordering::SeqCst));
        assert_eq!(f.orchestrator.meter_level(), 0);
        assert!(f.orchestrator.voice_state().muted);
        // Muting does not renegotiate.
        assert_eq!(f.peers.transport("b").calls().len(), calls_before);

        f.orchestrator.set_muted(false);
        assert!(stream.enabled.load(Ordering::SeqCst));
        assert_eq!(f.orchestrator.meter_level(), 42);
    }

    #[tokio::test]
    async fn test_mute_before_capture_applies_on_open() {
        let f = fixture("a");
        f.orchestrator.set_muted(true);
        f.orchestrator.initialize_capture(CaptureConstraints::default()).await.unwrap();
        assert!(!f.capture.latest().enabled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_set_volume_clamps() {
        let f = fixture("a");
        assert_eq!(f.orchestrator.voice_state().volume, 50);
        assert_eq!(f.orchestrator.set_volume(80), 80);
        assert_eq!(f.orchestrator.set_volume(250), 100);
        assert_eq!(f.orchestrator.voice_state().volume, 100);
    }

    #[tokio::test]
    async fn test_switch_input_device() {
        let f = fixture("a");
        f.orchestrator.initialize_capture(CaptureConstraints::default()).await.unwrap();
        f.orchestrator.create_link(&id("b")).await.unwrap();
        f.orchestrator.create_link(&id("c")).await.unwrap();
        f.orchestrator.set_muted(true);

        f.orchestrator.switch_input_device("usb").await.unwrap();

        for peer in ["b", "c"] {
            let calls = f.peers.transport(peer).calls();
            assert!(calls.contains(&"replace_track:usb".to_string()));
            assert!(!calls.iter().any(|c| c.starts_with("create_offer")));
        }
        let stream = f.capture.latest();
        assert_eq!(stream.device_id, "usb");
        assert!(!stream.enabled.load(Ordering::SeqCst));
        assert!(f.capture.live.lock()[0].released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_switch_input_device_failure_keeps_previous() {
        let f = fixture("a");
        f.orchestrator.initialize_capture(CaptureConstraints::default()).await.unwrap();
        f.orchestrator.create_link(&id("b")).await.unwrap();

        let err = f.orchestrator.switch_input_device("broken").await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Device(_)));
        assert!(!f.capture.live.lock()[0].released.load(Ordering::SeqCst));

        // A failure on the second link restores the first one.
        f.orchestrator.create_link(&id("c")).await.unwrap();
        let order: Vec<MemberId> = f
            .orchestrator
            .snapshot_links()
            .iter()
            .map(|link| link.remote.clone())
            .collect();
        let (first, second) = (order[0].as_str(), order[1].as_str());
        f.peers.transport(second).fail_replace.store(true, Ordering::SeqCst);

        let result = f.orchestrator.switch_input_device("usb").await;
        assert!(matches!(result, Err(OrchestratorError::Device(_))));

        let first_calls = f.peers.transport(first).calls();
        assert_eq!(
            first_calls
                .iter()
                .filter(|c| c.starts_with("replace_track"))
                .map(String::as_str)
                .collect::<Vec<_>>(),
            ["replace_track:usb", "replace_track:default"]
        );
        assert_eq!(
            f.peers.transport(first).tracks.lock().last().map(String::as_str),
            Some("default")
        );
        assert!(!f
            .peers
            .transport(second)
            .calls()
            .iter()
            .any(|c| c.starts_with("replace_track")));
        let stream = f.capture.live.lock()[0].clone();
        assert!(!stream.released.load(Ordering::SeqCst));
        assert!(f.capture.latest().released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_link_created_during_capture_start_gets_one_track() {
        let f = fixture("a");
        let bob = id("b");
        let (capture, link) = tokio::join!(
            f.orchestrator.initialize_capture(CaptureConstraints::default()),
            f.orchestrator.create_link(&bob),
        );
        capture.unwrap();
        link.unwrap();

        let calls = f.peers.transport("b").calls();
        assert_eq!(calls.iter().filter(|c| *c == "add_track").count(), 1);
        assert_eq!(f.peers.transport("b").tracks.lock().as_slice(), ["default"]);
    }

    #[tokio::test]
    async fn test_close_link_is_idempotent() {
        let f = fixture("a");
        let bob = id("b");
        let handle = f.orchestrator.create_link(&bob).await.unwrap();
        f.orchestrator.make_offer(&bob).await.unwrap();
        f.orchestrator.enqueue_remote_candidate(&bob, candidate(1)).await.unwrap();

        f.orchestrator.close_link(&bob).await;
        f.orchestrator.close_link(&bob).await;

        assert_eq!(handle.phase().await, LinkPhase::Closed);
        assert_eq!(f.orchestrator.link_state(&bob).await, None);
        let calls = f.peers.transport("b").calls();
        assert_eq!(calls.iter().filter(|c| *c == "close").count(), 1);
        assert!(!calls.iter().any(|c| c.starts_with("candidate")));
    }

    #[tokio::test]
    async fn test_recreate_link_closes_previous() {
        let f = fixture("a");
        let bob = id("b");
        let old = f.orchestrator.create_link(&bob).await.unwrap();
        f.orchestrator.create_link(&bob).await.unwrap();

        assert_eq!(old.phase().await, LinkPhase::Closed);
        assert_eq!(f.peers.created("b"), 2);
        assert_eq!(f.orchestrator.link_state(&bob).await, Some(LinkPhase::Idle));
    }

    #[tokio::test]
    async fn test_close_all_releases_capture() {
        let f = fixture("a");
        f.orchestrator.initialize_capture(CaptureConstraints::default()).await.unwrap();
        f.orchestrator.create_link(&id("b")).await.unwrap();
        f.orchestrator.create_link(&id("c")).await.unwrap();

        f.orchestrator.close_all().await;

        assert!(f.orchestrator.link_states().await.is_empty());
        assert!(f.capture.latest().released.load(Ordering::SeqCst));
        assert!(!f.orchestrator.voice_state().capturing);
        assert_eq!(f.orchestrator.meter_level(), 0);
        f.orchestrator.close_all().await;
    }

    #[tokio::test]
    async fn test_link_states() {
        let f = fixture("a");
        f.orchestrator.create_link(&id("b")).await.unwrap();
        f.orchestrator.create_link(&id("c")).await.unwrap();
        f.orchestrator.make_offer(&id("c")).await.unwrap();

        let states = f.orchestrator.link_states().await;
        assert_eq!(states.get(&id("b")), Some(&LinkPhase::Idle));
        assert_eq!(
            states.get(&id("c")),
            Some(&LinkPhase::Negotiating(NegotiationRole::OfferSent))
        );
    }

    #[test]
    fn test_list_input_devices() {
        let f = fixture("a");
        let devices = f.orchestrator.list_input_devices().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].label, "USB Mic");
    }
}
