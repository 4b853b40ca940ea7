//! Signaling Relay
//!
//! Routes client messages to the presence store or to one addressed peer.
//!
//! The relay is a single task that owns its presence store outright. Connection
//! tasks feed it [`RelayEvent`]s over a channel and each event is handled to
//! completion before the next one, with the stale-room sweep interleaved between
//! events. Outbound delivery only pushes onto per-connection unbounded channels, so
//! handling never awaits.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::protocol::{
    ErrorCode, IceCandidate, MemberInfo, RoomInfo, SessionDescription, SignalingMessage,
};
use crate::room::{
    ConnectionId, IdentityClaim, JoinOutcome, Member, MemberId, MemberUpdate, RoomError, RoomRegistry,
};

/// The presence operations the relay needs; swappable for a shared store.
pub trait PresenceStore {
    fn join(
        &mut self,
        room_id: &str,
        display_name: &str,
        connection_id: ConnectionId,
        claim: Option<&IdentityClaim>,
    ) -> Result<JoinOutcome, RoomError>;
    fn leave(&mut self, room_id: &str, member_id: &MemberId) -> Option<Member>;
    fn update_member(&mut self, room_id: &str, member_id: &MemberId, update: &MemberUpdate) -> Option<Member>;
    fn resolve_by_connection(&self, connection_id: &ConnectionId) -> Option<Member>;
    fn resolve_by_id(&self, member_id: &MemberId) -> Option<Member>;
    fn room_of(&self, member_id: &MemberId) -> Option<String>;
    /// Members of an addressable room; empty for unknown or empty rooms.
    fn room_members(&self, room_id: &str) -> Vec<Member>;
    fn sweep_stale_rooms(&mut self, max_idle: Duration) -> Vec<String>;
}

impl PresenceStore for RoomRegistry {
    fn join(
        &mut self,
        room_id: &str,
        display_name: &str,
        connection_id: ConnectionId,
        claim: Option<&IdentityClaim>,
    ) -> Result<JoinOutcome, RoomError> {
        RoomRegistry::join(self, room_id, display_name, connection_id, claim)
    }

    fn leave(&mut self, room_id: &str, member_id: &MemberId) -> Option<Member> {
        RoomRegistry::leave(self, room_id, member_id)
    }

    fn update_member(&mut self, room_id: &str, member_id: &MemberId, update: &MemberUpdate) -> Option<Member> {
        RoomRegistry::update_member(self, room_id, member_id, update)
    }

    fn resolve_by_connection(&self, connection_id: &ConnectionId) -> Option<Member> {
        RoomRegistry::resolve_by_connection(self, connection_id)
    }

    fn resolve_by_id(&self, member_id: &MemberId) -> Option<Member> {
        RoomRegistry::resolve_by_id(self, member_id)
    }

    fn room_of(&self, member_id: &MemberId) -> Option<String> {
        RoomRegistry::room_of(self, member_id).map(str::to_string)
    }

    fn room_members(&self, room_id: &str) -> Vec<Member> {
        self.active_room(room_id)
            .map(|room| room.members().to_vec())
            .unwrap_or_default()
    }

    fn sweep_stale_rooms(&mut self, max_idle: Duration) -> Vec<String> {
        RoomRegistry::sweep_stale_rooms(self, max_idle)
    }
}

/// Input to the relay task
#[derive(Debug)]
pub enum RelayEvent {
    Connected {
        connection_id: ConnectionId,
        outbound: mpsc::UnboundedSender<SignalingMessage>,
    },
    Message {
        connection_id: ConnectionId,
        message: SignalingMessage,
    },
    Disconnected {
        connection_id: ConnectionId,
    },
}

/// Addressed payload carried by offer/answer/candidate messages
enum Addressed {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

/// Signaling relay over an injected presence store
pub struct Relay<S = RoomRegistry> {
    store: S,
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<SignalingMessage>>,
}

impl<S: PresenceStore> Relay<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            connections: HashMap::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Tear down, handing the store back to the caller.
    pub fn into_store(self) -> S {
        self.store
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Process events until every sender is dropped, sweeping stale rooms between events.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<RelayEvent>,
        sweep_interval: Duration,
        max_idle: Duration,
    ) -> S {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = sweep.tick() => {
                    let swept = self.store.sweep_stale_rooms(max_idle);
                    if !swept.is_empty() {
                        log::info!("Swept {} stale room(s)", swept.len());
                    }
                }
            }
        }

        log::info!("Relay stopped");
        self.store
    }

    /// Handle one event to completion.
    pub fn handle(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Connected {
                connection_id,
                outbound,
            } => {
                log::debug!("Connection {} registered", connection_id);
                self.connections.insert(connection_id, outbound);
            }
            RelayEvent::Message {
                connection_id,
                message,
            } => self.handle_message(connection_id, message),
            RelayEvent::Disconnected { connection_id } => self.handle_disconnect(connection_id),
        }
    }

    fn handle_message(&mut self, connection_id: ConnectionId, message: SignalingMessage) {
        log::debug!("{} from connection {}", message.kind(), connection_id);
        match message {
            SignalingMessage::Join {
                room_id,
                display_name,
                member_id,
                reconnect_token,
            } => {
                let claim = member_id
                    .zip(reconnect_token)
                    .map(|(member_id, token)| IdentityClaim { member_id, token });
                self.handle_join(connection_id, &room_id, &display_name, claim.as_ref())
            }

            SignalingMessage::Leave { room_id, member_id } => {
                self.handle_leave(connection_id, &room_id, &member_id)
            }

            SignalingMessage::UpdateState { room_id, fields } => {
                self.handle_update(connection_id, &room_id, &fields)
            }

            SignalingMessage::Offer {
                room_id,
                target_member_id,
                description,
            } => self.forward(connection_id, &room_id, &target_member_id, Addressed::Offer(description)),

            SignalingMessage::Answer {
                room_id,
                target_member_id,
                description,
            } => self.forward(connection_id, &room_id, &target_member_id, Addressed::Answer(description)),

            SignalingMessage::IceCandidate {
                room_id,
                target_member_id,
                candidate,
            } => self.forward(connection_id, &room_id, &target_member_id, Addressed::Candidate(candidate)),

            other => {
                log::warn!("Connection {} sent relay-only message {}", connection_id, other.kind());
                self.send(
                    &connection_id,
                    SignalingMessage::error("Unsupported message type", ErrorCode::Unsupported),
                );
            }
        }
    }

    fn handle_join(
        &mut self,
        connection_id: ConnectionId,
        room_id: &str,
        display_name: &str,
        claim: Option<&IdentityClaim>,
    ) {
        let room_id = room_id.trim();
        let display_name = display_name.trim();
        if room_id.is_empty() || display_name.is_empty() {
            self.send(
                &connection_id,
                SignalingMessage::error("Room id and display name are required", ErrorCode::InvalidMessage),
            );
            return;
        }

        match self.store.join(room_id, display_name, connection_id, claim) {
            Ok(outcome) => {
                for (old_room, member) in &outcome.departed {
                    self.broadcast(
                        old_room,
                        &member.id,
                        SignalingMessage::MemberLeft {
                            member_id: member.id.clone(),
                        },
                    );
                }

                self.send(
                    &connection_id,
                    SignalingMessage::RoomSnapshot {
                        room: RoomInfo::from(&outcome.room),
                        member: MemberInfo::from(&outcome.member),
                        reconnect_token: outcome.token.clone(),
                    },
                );
                self.broadcast(
                    room_id,
                    &outcome.member.id,
                    SignalingMessage::MemberJoined {
                        member: MemberInfo::from(&outcome.member),
                    },
                );
            }
            Err(RoomError::RoomFull) => {
                self.send(
                    &connection_id,
                    SignalingMessage::error("Room is full", ErrorCode::RoomFull),
                );
            }
        }
    }

    fn handle_leave(&mut self, connection_id: ConnectionId, room_id: &str, member_id: &MemberId) {
        let owned = self
            .store
            .resolve_by_connection(&connection_id)
            .map_or(false, |m| &m.id == member_id);
        if !owned {
            self.send(
                &connection_id,
                SignalingMessage::error("Not a member of this room", ErrorCode::NotInRoom),
            );
            return;
        }

        if let Some(member) = self.store.leave(room_id, member_id) {
            self.broadcast(
                room_id,
                &member.id,
                SignalingMessage::MemberLeft {
                    member_id: member.id.clone(),
                },
            );
        }
    }

    fn handle_update(&mut self, connection_id: ConnectionId, room_id: &str, fields: &MemberUpdate) {
        let Some(sender) = self.store.resolve_by_connection(&connection_id) else {
            self.send(
                &connection_id,
                SignalingMessage::error("Not a member of this room", ErrorCode::NotInRoom),
            );
            return;
        };
        if fields.is_empty() {
            return;
        }

        if let Some(updated) = self.store.update_member(room_id, &sender.id, fields) {
            self.broadcast(
                room_id,
                &updated.id,
                SignalingMessage::MemberUpdated {
                    member: MemberInfo::from(&updated),
                },
            );
        }
    }

    /// Deliver to the target's current connection only. Unknown or absent targets
    /// are dropped without telling the sender.
    fn forward(
        &mut self,
        connection_id: ConnectionId,
        room_id: &str,
        target_id: &MemberId,
        payload: Addressed,
    ) {
        let Some(sender) = self.store.resolve_by_connection(&connection_id) else {
            log::debug!("Dropping addressed message from unjoined connection {}", connection_id);
            return;
        };
        let Some(target) = self.store.resolve_by_id(target_id) else {
            log::debug!("Dropping addressed message for unknown member {}", target_id);
            return;
        };

        let same_room = self.store.room_of(&sender.id).as_deref() == Some(room_id)
            && self.store.room_of(&target.id).as_deref() == Some(room_id);
        if !same_room || !target.connected {
            log::debug!(
                "Dropping addressed message from {} to {} outside room {}",
                sender.id,
                target.id,
                room_id
            );
            return;
        }

        let from_member_id = sender.id;
        let message = match payload {
            Addressed::Offer(description) => SignalingMessage::OfferReceived {
                from_member_id,
                description,
            },
            Addressed::Answer(description) => SignalingMessage::AnswerReceived {
                from_member_id,
                description,
            },
            Addressed::Candidate(candidate) => SignalingMessage::IceCandidateReceived {
                from_member_id,
                candidate,
            },
        };
        self.send(&target.connection_id, message);
    }

    /// A dropped connection converges on the same path as an explicit leave.
    fn handle_disconnect(&mut self, connection_id: ConnectionId) {
        self.connections.remove(&connection_id);

        let Some(member) = self.store.resolve_by_connection(&connection_id) else {
            log::debug!("Connection {} closed without a room", connection_id);
            return;
        };
        let Some(room_id) = self.store.room_of(&member.id) else {
            return;
        };

        if let Some(removed) = self.store.leave(&room_id, &member.id) {
            log::info!("Member {} disconnected from room {}", removed.id, room_id);
            self.broadcast(
                &room_id,
                &removed.id,
                SignalingMessage::MemberLeft {
                    member_id: removed.id.clone(),
                },
            );
        }
    }

    /// Send to every current member of the room except the originator.
    fn broadcast(&self, room_id: &str, originator: &MemberId, message: SignalingMessage) {
        for member in self.store.room_members(room_id) {
            if &member.id == originator {
                continue;
            }
            self.send(&member.connection_id, message.clone());
        }
    }

    fn send(&self, connection_id: &ConnectionId, message: SignalingMessage) {
        match self.connections.get(connection_id) {
            Some(tx) => {
                if let Err(e) = tx.send(message) {
                    log::warn!("Failed to queue message for {}: {}", connection_id, e);
                }
            }
            None => log::debug!("Connection {} not registered", connection_id),
        }
    }
}
