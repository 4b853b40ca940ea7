//! Session Coordinator
//!
//! Binds relay traffic to the orchestrator: decides when peer links are created,
//! offered, answered and torn down, and publishes typed events to subscribers.
//!
//! The newly joined member initiates offers to everyone already in the room;
//! existing members create a link for the newcomer and wait for its offer.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::media::{CaptureConstraints, PeerEvent, VoiceState};
use crate::orchestrator::{LinkPhase, Orchestrator, OrchestratorError, TransportOutcome};
use crate::protocol::{ErrorCode, IceCandidate, MemberInfo, RoomInfo, SdpKind, SessionDescription, SignalingMessage};
use crate::room::{MemberId, MemberUpdate};
use crate::transport::ClientEvent;

/// Per-session settings
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub display_name: String,
    pub constraints: CaptureConstraints,
    /// Input level above which the local member counts as speaking
    pub speaking_threshold: u8,
    pub meter_interval: Duration,
}

impl From<&ClientConfig> for SessionOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            display_name: config.display_name.clone(),
            constraints: CaptureConstraints::from(&config.audio),
            speaking_threshold: config.audio.speaking_threshold,
            meter_interval: config.audio.meter_interval(),
        }
    }
}

/// Requests from the user interface
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Join(String),
    Leave,
    SetMuted(bool),
    SetVolume(u8),
    SwitchDevice(String),
    End,
}

/// Notifications published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Joined { room: RoomInfo, member: MemberInfo },
    MemberJoined(MemberInfo),
    MemberLeft(MemberId),
    MemberUpdated(MemberInfo),
    LinkChanged { remote: MemberId, phase: LinkPhase },
    RemoteAudio(MemberId),
    Voice(VoiceState),
    CaptureFailed(String),
    DeviceSwitchFailed(String),
    Error { message: String, code: Option<ErrorCode> },
    Disconnected,
    Reconnected,
    Left,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A live subscription. Dropping it unsubscribes lazily on the next publish.
pub struct Subscription {
    id: SubscriptionId,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.events.try_recv().ok()
    }
}

#[derive(Default)]
struct Subscribers {
    next_id: u64,
    senders: HashMap<SubscriptionId, mpsc::UnboundedSender<SessionEvent>>,
}

/// Fan-out of session events to explicit subscribers
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Subscribers>>,
}

impl EventBus {
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.senders.insert(id, tx);
        Subscription { id, events: rx }
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.lock().senders.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().senders.len()
    }

    fn publish(&self, event: SessionEvent) {
        self.inner
            .lock()
            .senders
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    /// Drop every subscription; receivers see the stream end.
    fn close(&self) {
        self.inner.lock().senders.clear();
    }
}

pub struct Session {
    orchestrator: Arc<Orchestrator>,
    outbound: mpsc::UnboundedSender<SignalingMessage>,
    options: SessionOptions,
    events: EventBus,
    /// Room the relay has confirmed we are in
    room_id: Option<String>,
    /// Room requested but not yet confirmed by a snapshot
    pending_room: Option<String>,
    local: Option<MemberInfo>,
    /// Proves ownership of `local.id` when rejoining
    reconnect_token: Option<String>,
    /// Other members of the room, in join order
    members: Vec<MemberInfo>,
    speaking: bool,
    /// Relay link is up; joins wait for it
    connected: bool,
}

impl Session {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        outbound: mpsc::UnboundedSender<SignalingMessage>,
        options: SessionOptions,
    ) -> Self {
        Self {
            orchestrator,
            outbound,
            options,
            events: EventBus::default(),
            room_id: None,
            pending_room: None,
            local: None,
            reconnect_token: None,
            members: Vec::new(),
            speaking: false,
            connected: false,
        }
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn local_member(&self) -> Option<&MemberInfo> {
        self.local.as_ref()
    }

    pub fn members(&self) -> &[MemberInfo] {
        &self.members
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Drive the session until it is ended or the relay is unreachable for good.
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut signaling: mpsc::UnboundedReceiver<ClientEvent>,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let mut meter = tokio::time::interval(self.options.meter_interval);
        meter.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::End) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                event = signaling.recv() => match event {
                    Some(event) => {
                        if !self.handle_client_event(event).await {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = peer_events.recv() => self.handle_peer_event(event).await,
                _ = meter.tick() => self.poll_meter(),
            }
        }

        self.end().await;
    }

    pub async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Join(room_id) => self.join(&room_id).await,
            SessionCommand::Leave => self.leave().await,
            SessionCommand::SetMuted(muted) => self.set_muted(muted),
            SessionCommand::SetVolume(volume) => {
                self.orchestrator.set_volume(volume);
                self.events.publish(SessionEvent::Voice(self.orchestrator.voice_state()));
            }
            SessionCommand::SwitchDevice(device_id) => {
                match self.orchestrator.switch_input_device(&device_id).await {
                    Ok(()) => self.events.publish(SessionEvent::Voice(self.orchestrator.voice_state())),
                    Err(e) => {
                        log::warn!("Device switch to {} failed: {}", device_id, e);
                        self.events.publish(SessionEvent::DeviceSwitchFailed(e.to_string()));
                    }
                }
            }
            SessionCommand::End => self.end().await,
        }
    }

    /// Ask the relay to put us in `room_id`. Our previous identity travels along
    /// so a reconnect or room change keeps the same member id. The current room
    /// and its links stay in place until the relay confirms the move.
    pub async fn join(&mut self, room_id: &str) {
        self.pending_room = Some(room_id.to_string());
        if self.connected {
            self.send_join(room_id);
        }
    }

    pub async fn leave(&mut self) {
        self.pending_room = None;
        self.reconnect_token = None;
        let (Some(room_id), Some(local)) = (self.room_id.take(), self.local.take()) else {
            self.room_id = None;
            return;
        };
        self.send(SignalingMessage::Leave {
            room_id,
            member_id: local.id,
        });
        self.members.clear();
        self.speaking = false;
        self.orchestrator.set_local_member(None);
        self.orchestrator.close_all().await;
        self.events.publish(SessionEvent::Left);
    }

    /// Leave, release every resource and drop all subscriptions.
    pub async fn end(&mut self) {
        self.leave().await;
        self.orchestrator.close_all().await;
        self.events.publish(SessionEvent::Ended);
        self.events.close();
        log::info!("Session ended");
    }

    pub fn set_muted(&mut self, muted: bool) {
        self.orchestrator.set_muted(muted);
        let mut fields = MemberUpdate {
            muted: Some(muted),
            speaking: None,
        };
        if muted && self.speaking {
            self.speaking = false;
            fields.speaking = Some(false);
        }
        self.send_update(fields);
        self.events.publish(SessionEvent::Voice(self.orchestrator.voice_state()));
    }

    /// Sample the input level and publish speaking changes.
    pub fn poll_meter(&mut self) {
        let level = self.orchestrator.meter_level();
        let speaking = level > self.options.speaking_threshold;
        if speaking == self.speaking {
            return;
        }
        self.speaking = speaking;
        self.send_update(MemberUpdate {
            muted: None,
            speaking: Some(speaking),
        });
        self.events.publish(SessionEvent::Voice(self.orchestrator.voice_state()));
    }

    /// Returns false once the relay connection is gone for good.
    pub async fn handle_client_event(&mut self, event: ClientEvent) -> bool {
        match event {
            ClientEvent::Message(message) => self.handle_message(message).await,
            ClientEvent::Connected { reconnect } => {
                self.connected = true;
                let target = self.pending_room.clone().or_else(|| self.room_id.clone());
                if let Some(room_id) = target {
                    log::info!("Relay connected; joining {}", room_id);
                    self.send_join(&room_id);
                }
                if reconnect {
                    self.events.publish(SessionEvent::Reconnected);
                }
            }
            ClientEvent::Disconnected => {
                self.connected = false;
                self.events.publish(SessionEvent::Disconnected);
            }
            ClientEvent::GaveUp => {
                self.events.publish(SessionEvent::Error {
                    message: "Lost connection to the relay".to_string(),
                    code: None,
                });
                return false;
            }
        }
        true
    }

    pub async fn handle_message(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::RoomSnapshot {
                room,
                member,
                reconnect_token,
            } => {
                self.reconnect_token = Some(reconnect_token);
                self.on_snapshot(room, member).await
            }
            SignalingMessage::MemberJoined { member } => self.on_member_joined(member).await,
            SignalingMessage::MemberLeft { member_id } => self.on_member_left(member_id).await,
            SignalingMessage::MemberUpdated { member } => self.on_member_updated(member),
            SignalingMessage::OfferReceived {
                from_member_id,
                description,
            } => self.on_offer(from_member_id, description).await,
            SignalingMessage::AnswerReceived {
                from_member_id,
                description,
            } => self.on_answer(from_member_id, description).await,
            SignalingMessage::IceCandidateReceived {
                from_member_id,
                candidate,
            } => self.on_remote_candidate(from_member_id, candidate).await,
            SignalingMessage::Error { message, code } => {
                log::warn!("Relay error: {}", message);
                if code == Some(ErrorCode::RoomFull) {
                    if let Some(rejected) = self.pending_room.take() {
                        log::info!("Staying in {:?}; {} is full", self.room_id, rejected);
                    }
                }
                self.events.publish(SessionEvent::Error { message, code });
            }
            other => log::debug!("Ignoring unexpected {} from relay", other.kind()),
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate { remote, candidate } => {
                let Some(room_id) = self.room_id.clone() else {
                    return;
                };
                self.send(SignalingMessage::IceCandidate {
                    room_id,
                    target_member_id: remote,
                    candidate,
                });
            }
            PeerEvent::StateChanged { remote, state } => {
                match self.orchestrator.handle_transport_state(&remote, state).await {
                    Ok(TransportOutcome::Restart(offer)) => self.send_offer(&remote, offer),
                    Ok(TransportOutcome::GaveUp) => {
                        log::warn!("Giving up on link to {}", remote);
                    }
                    Ok(_) => {}
                    Err(OrchestratorError::UnknownPeer(_)) => {
                        log::debug!("State change for closed link {}", remote);
                        return;
                    }
                    Err(e) => log::warn!("Transport state handling for {} failed: {}", remote, e),
                }
                if let Some(phase) = self.orchestrator.link_state(&remote).await {
                    self.events.publish(SessionEvent::LinkChanged { remote, phase });
                }
            }
            PeerEvent::RemoteTrack { remote } => self.events.publish(SessionEvent::RemoteAudio(remote)),
        }
    }

    async fn on_snapshot(&mut self, room: RoomInfo, member: MemberInfo) {
        log::info!("Joined {} as {} ({} members)", room.id, member.id, room.members.len());
        self.room_id = Some(room.id.clone());
        self.pending_room = None;
        self.orchestrator.set_local_member(Some(member.id.clone()));
        self.local = Some(member.clone());

        let others: Vec<MemberInfo> = room
            .members
            .iter()
            .filter(|m| m.id != member.id)
            .cloned()
            .collect();
        for stale in self.members.iter().filter(|m| !others.iter().any(|o| o.id == m.id)) {
            self.orchestrator.close_link(&stale.id).await;
        }
        self.members = others;
        self.events.publish(SessionEvent::Joined {
            room: room.clone(),
            member,
        });

        if let Err(e) = self
            .orchestrator
            .initialize_capture(self.options.constraints.clone())
            .await
        {
            log::error!("Cannot capture audio: {}", e);
            self.events.publish(SessionEvent::CaptureFailed(e.to_string()));
            return;
        }
        self.events.publish(SessionEvent::Voice(self.orchestrator.voice_state()));

        // Each peer negotiates on its own; one slow link does not hold up the rest.
        let offers = join_all(self.members.iter().map(|m| {
            let orchestrator = self.orchestrator.clone();
            let remote = m.id.clone();
            async move {
                let result: Result<SessionDescription, OrchestratorError> = async {
                    orchestrator.create_link(&remote).await?;
                    orchestrator.make_offer(&remote).await
                }
                .await;
                (remote, result)
            }
        }))
        .await;
        for (remote, result) in offers {
            match result {
                Ok(offer) => self.send_offer(&remote, offer),
                Err(e) => log::warn!("Failed to offer to {}: {}", remote, e),
            }
        }
    }

    async fn on_member_joined(&mut self, member: MemberInfo) {
        if self.local.as_ref().is_some_and(|local| local.id == member.id) {
            return;
        }
        log::info!("{} joined", member.display_name);
        // A rejoining member renegotiates from scratch.
        if let Err(e) = self.orchestrator.create_link(&member.id).await {
            log::warn!("Failed to create link for {}: {}", member.id, e);
        }
        match self.members.iter_mut().find(|m| m.id == member.id) {
            Some(existing) => *existing = member.clone(),
            None => self.members.push(member.clone()),
        }
        self.events.publish(SessionEvent::MemberJoined(member));
    }

    async fn on_member_left(&mut self, member_id: MemberId) {
        self.orchestrator.close_link(&member_id).await;
        self.members.retain(|m| m.id != member_id);
        log::info!("{} left", member_id);
        self.events.publish(SessionEvent::MemberLeft(member_id));
    }

    fn on_member_updated(&mut self, member: MemberInfo) {
        if let Some(existing) = self.members.iter_mut().find(|m| m.id == member.id) {
            *existing = member.clone();
        }
        self.events.publish(SessionEvent::MemberUpdated(member));
    }

    async fn on_offer(&mut self, remote: MemberId, offer: SessionDescription) {
        if offer.kind != SdpKind::Offer {
            log::warn!("Ignoring {:?} description sent as an offer by {}", offer.kind, remote);
            return;
        }
        if !self.orchestrator.has_link(&remote) {
            if let Err(e) = self.orchestrator.create_link(&remote).await {
                log::warn!("Failed to create link for {}: {}", remote, e);
                return;
            }
        }
        match self.orchestrator.make_answer(&remote, offer).await {
            Ok(Some(answer)) => {
                let Some(room_id) = self.room_id.clone() else {
                    return;
                };
                self.send(SignalingMessage::Answer {
                    room_id,
                    target_member_id: remote,
                    description: answer,
                });
            }
            Ok(None) => log::debug!("Discarded offer from {} after glare", remote),
            Err(e) => log::warn!("Failed to answer {}: {}", remote, e),
        }
    }

    async fn on_answer(&mut self, remote: MemberId, answer: SessionDescription) {
        if let Err(e) = self.orchestrator.apply_remote_answer(&remote, answer).await {
            log::warn!("Failed to apply answer from {}: {}", remote, e);
        }
    }

    async fn on_remote_candidate(&mut self, remote: MemberId, candidate: IceCandidate) {
        if let Err(e) = self.orchestrator.enqueue_remote_candidate(&remote, candidate).await {
            log::debug!("Dropped candidate from {}: {}", remote, e);
        }
    }

    fn send_join(&self, room_id: &str) {
        self.send(SignalingMessage::Join {
            room_id: room_id.to_string(),
            display_name: self.options.display_name.clone(),
            member_id: self.local.as_ref().map(|m| m.id.clone()),
            reconnect_token: self.reconnect_token.clone(),
        });
    }

    fn send_offer(&self, remote: &MemberId, description: SessionDescription) {
        let Some(room_id) = self.room_id.clone() else {
            return;
        };
        self.send(SignalingMessage::Offer {
            room_id,
            target_member_id: remote.clone(),
            description,
        });
    }

    fn send_update(&self, fields: MemberUpdate) {
        if self.local.is_none() {
            return;
        }
        let Some(room_id) = self.room_id.clone() else {
            return;
        };
        self.send(SignalingMessage::UpdateState { room_id, fields });
    }

    fn send(&self, message: SignalingMessage) {
        if self.outbound.send(message).is_err() {
            log::debug!("Signaling transport is gone; message dropped");
        }
    }
}
