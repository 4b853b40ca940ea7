//! Room Management
//!
//! The presence registry: which rooms exist, who is in them, and which transport
//! connection currently carries each member.
//!
//! The registry is plain owned state with no interior locking. It is meant to be
//! owned by a single task that applies one event at a time (see [`crate::relay`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Stable member identity; survives transport reconnects within a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MemberId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one transport connection; changes on every reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A member id presented together with the reconnect token issued for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityClaim {
    pub member_id: MemberId,
    pub token: String,
}

/// Reconnect secret of an issued member id
#[derive(Debug)]
struct Credential {
    token: String,
    /// Set while the id is in no room; cleared when it is reclaimed.
    retired_at: Option<Instant>,
}

fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Represents a member of a room
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub id: MemberId,
    pub display_name: String,
    pub connection_id: ConnectionId,
    pub connected: bool,
    pub muted: bool,
    pub speaking: bool,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn new(id: MemberId, display_name: String, connection_id: ConnectionId) -> Self {
        Self {
            id,
            display_name,
            connection_id,
            connected: true,
            muted: false,
            speaking: false,
            joined_at: Utc::now(),
        }
    }
}

/// Partial member state sent with `update_state`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaking: Option<bool>,
}

impl MemberUpdate {
    pub fn is_empty(&self) -> bool {
        self.muted.is_none() && self.speaking.is_none()
    }

    fn apply(&self, member: &mut Member) {
        if let Some(muted) = self.muted {
            member.muted = muted;
        }
        if let Some(speaking) = self.speaking {
            member.speaking = speaking;
        }
    }
}

/// Represents a voice room
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub display_name: String,
    pub capacity: usize,
    pub created_at: DateTime<Utc>,
    /// False while the room is empty and waiting to be swept.
    pub active: bool,
    members: Vec<Member>,
    emptied_at: Option<Instant>,
}

impl Room {
    pub fn new(id: String, capacity: usize) -> Self {
        Self {
            display_name: format!("Room {}", id),
            id,
            capacity,
            created_at: Utc::now(),
            active: true,
            members: Vec::new(),
            emptied_at: None,
        }
    }

    /// Members in join order
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity
    }

    pub fn get_member(&self, member_id: &MemberId) -> Option<&Member> {
        self.members.iter().find(|m| &m.id == member_id)
    }

    fn get_member_mut(&mut self, member_id: &MemberId) -> Option<&mut Member> {
        self.members.iter_mut().find(|m| &m.id == member_id)
    }
}

/// Room-related errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Room is full")]
    RoomFull,
}

/// Result of a successful join
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Authoritative snapshot of the room after the join
    pub room: Room,
    pub member: Member,
    /// Reconnect token for `member.id`; only ever sent to that member
    pub token: String,
    /// True when an existing record was reused for a new connection
    pub reconnected: bool,
    /// Members removed as a side effect, with the room each was removed from
    pub departed: Vec<(String, Member)>,
}

/// Manages all rooms and the member/connection indexes
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: HashMap<String, Room>,
    /// Maps member ID to room ID
    member_rooms: HashMap<MemberId, String>,
    /// Maps live connection ID to member ID
    connections: HashMap<ConnectionId, MemberId>,
    /// Reconnect tokens of every issued id, kept for a while after it leaves
    credentials: HashMap<MemberId, Credential>,
    capacity: usize,
    empty_room_retention: Duration,
}

impl RoomRegistry {
    pub fn new(capacity: usize, empty_room_retention: Duration) -> Self {
        Self {
            rooms: HashMap::new(),
            member_rooms: HashMap::new(),
            connections: HashMap::new(),
            credentials: HashMap::new(),
            capacity,
            empty_room_retention,
        }
    }

    /// Join a room, creating it on first reference.
    ///
    /// The prior identity is the member `connection_id` already carries, or a
    /// `claim` whose token matches the one issued for that id. If that member is
    /// still in this room its record is reused and re-pointed at `connection_id`;
    /// otherwise a new member is created, keeping the prior id when there is one.
    /// A claim with the wrong token is ignored. A full room is left untouched.
    pub fn join(
        &mut self,
        room_id: &str,
        display_name: &str,
        connection_id: ConnectionId,
        claim: Option<&IdentityClaim>,
    ) -> Result<JoinOutcome, RoomError> {
        let prior = self
            .verify(claim)
            .or_else(|| self.connections.get(&connection_id).cloned());
        let reuse = prior
            .as_ref()
            .filter(|id| self.member_rooms.get(*id).map(String::as_str) == Some(room_id))
            .cloned();

        if let Some(member_id) = reuse {
            if let Some(outcome) = self.rebind(room_id, display_name, connection_id, &member_id) {
                return Ok(outcome);
            }
        }

        if self.rooms.get(room_id).map_or(false, Room::is_full) {
            log::info!("Rejected join to full room {}", room_id);
            return Err(RoomError::RoomFull);
        }

        // A member id lives in at most one room, and a connection carries one member.
        let mut departed = Vec::new();
        if let Some(id) = prior.as_ref() {
            departed.extend(self.detach(id));
        }
        if let Some(other) = self.connections.get(&connection_id).cloned() {
            departed.extend(self.detach(&other));
        }

        let capacity = self.capacity;
        let room = self
            .rooms
            .entry(room_id.to_string())
            .or_insert_with(|| {
                log::info!("Created room {}", room_id);
                Room::new(room_id.to_string(), capacity)
            });
        if !room.active {
            room.active = true;
            room.emptied_at = None;
            log::info!("Room {} reactivated", room_id);
        }

        let member = Member::new(
            prior.unwrap_or_else(MemberId::generate),
            display_name.to_string(),
            connection_id,
        );
        room.members.push(member.clone());
        let snapshot = room.clone();
        self.member_rooms.insert(member.id.clone(), room_id.to_string());
        self.connections.insert(connection_id, member.id.clone());
        let token = self.activate_credential(&member.id);

        log::info!(
            "Member {} ({}) joined room {} ({}/{})",
            member.display_name,
            member.id,
            room_id,
            snapshot.member_count(),
            snapshot.capacity
        );
        Ok(JoinOutcome {
            room: snapshot,
            member,
            token,
            reconnected: false,
            departed,
        })
    }

    /// Remove a member. Returns the removed member, or `None` if it was not there.
    pub fn leave(&mut self, room_id: &str, member_id: &MemberId) -> Option<Member> {
        let room = self.rooms.get_mut(room_id)?;
        let index = room.members.iter().position(|m| &m.id == member_id)?;
        let mut member = room.members.remove(index);
        member.connected = false;
        let now_empty = room.members.is_empty();

        self.member_rooms.remove(member_id);
        if self.connections.get(&member.connection_id) == Some(member_id) {
            self.connections.remove(&member.connection_id);
        }
        self.retire_credential(member_id);

        log::info!("Member {} ({}) left room {}", member.display_name, member.id, room_id);

        if now_empty {
            if self.empty_room_retention.is_zero() {
                self.rooms.remove(room_id);
                log::info!("Removed empty room {}", room_id);
            } else if let Some(room) = self.rooms.get_mut(room_id) {
                room.active = false;
                room.emptied_at = Some(Instant::now());
                log::debug!("Room {} is empty, retained for reconnects", room_id);
            }
        }
        Some(member)
    }

    /// Merge mute/speaking flags into a member. No-op for unknown ids.
    pub fn update_member(
        &mut self,
        room_id: &str,
        member_id: &MemberId,
        update: &MemberUpdate,
    ) -> Option<Member> {
        let member = self.rooms.get_mut(room_id)?.get_member_mut(member_id)?;
        update.apply(member);
        Some(member.clone())
    }

    /// The member currently carried by a connection
    pub fn resolve_by_connection(&self, connection_id: &ConnectionId) -> Option<Member> {
        let member_id = self.connections.get(connection_id)?;
        self.resolve_by_id(member_id)
    }

    pub fn resolve_by_id(&self, member_id: &MemberId) -> Option<Member> {
        let room_id = self.member_rooms.get(member_id)?;
        self.rooms.get(room_id)?.get_member(member_id).cloned()
    }

    /// Room the member is currently in
    pub fn room_of(&self, member_id: &MemberId) -> Option<&str> {
        self.member_rooms.get(member_id).map(String::as_str)
    }

    /// A room that can be addressed by the relay; empty rooms are not.
    pub fn active_room(&self, room_id: &str) -> Option<&Room> {
        self.rooms.get(room_id).filter(|r| r.active)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Evict rooms that have been empty for longer than `max_idle`, and forget
    /// identities that have been out of every room as long.
    pub fn sweep_stale_rooms(&mut self, max_idle: Duration) -> Vec<String> {
        self.sweep_stale_rooms_at(max_idle, Instant::now())
    }

    pub fn sweep_stale_rooms_at(&mut self, max_idle: Duration, now: Instant) -> Vec<String> {
        let stale: Vec<String> = self
            .rooms
            .values()
            .filter(|room| {
                room.members.is_empty()
                    && room
                        .emptied_at
                        .map_or(true, |t| now.saturating_duration_since(t) > max_idle)
            })
            .map(|room| room.id.clone())
            .collect();

        for room_id in &stale {
            self.rooms.remove(room_id);
            log::info!("Cleaned up empty room: {}", room_id);
        }

        let before = self.credentials.len();
        self.credentials.retain(|_, credential| {
            credential
                .retired_at
                .map_or(true, |t| now.saturating_duration_since(t) <= max_idle)
        });
        if self.credentials.len() < before {
            log::debug!("Forgot {} retired identities", before - self.credentials.len());
        }
        stale
    }

    /// Point an existing member at a new connection.
    fn rebind(
        &mut self,
        room_id: &str,
        display_name: &str,
        connection_id: ConnectionId,
        member_id: &MemberId,
    ) -> Option<JoinOutcome> {
        let mut departed = Vec::new();
        if let Some(other) = self.connections.get(&connection_id).cloned() {
            if &other != member_id {
                departed.extend(self.detach(&other));
            }
        }

        let room = self.rooms.get_mut(room_id)?;
        let member = room.get_member_mut(member_id)?;
        let old_connection = member.connection_id;
        member.connection_id = connection_id;
        member.connected = true;
        member.display_name = display_name.to_string();
        let member = member.clone();
        let snapshot = room.clone();

        if self.connections.get(&old_connection) == Some(member_id) {
            self.connections.remove(&old_connection);
        }
        self.connections.insert(connection_id, member_id.clone());
        let token = self.activate_credential(member_id);

        log::info!(
            "Member {} ({}) reconnected to room {}",
            member.display_name,
            member.id,
            room_id
        );
        Some(JoinOutcome {
            room: snapshot,
            member,
            token,
            reconnected: true,
            departed,
        })
    }

    /// The member id a claim proves ownership of
    fn verify(&self, claim: Option<&IdentityClaim>) -> Option<MemberId> {
        let claim = claim?;
        match self.credentials.get(&claim.member_id) {
            Some(credential) if credential.token == claim.token => Some(claim.member_id.clone()),
            _ => {
                log::warn!("Rejected identity claim for member {}", claim.member_id);
                None
            }
        }
    }

    /// Mark an id as in use, issuing a token if it has none.
    fn activate_credential(&mut self, member_id: &MemberId) -> String {
        let credential = self
            .credentials
            .entry(member_id.clone())
            .or_insert_with(|| Credential {
                token: new_token(),
                retired_at: None,
            });
        credential.retired_at = None;
        credential.token.clone()
    }

    fn retire_credential(&mut self, member_id: &MemberId) {
        if self.empty_room_retention.is_zero() {
            self.credentials.remove(member_id);
        } else if let Some(credential) = self.credentials.get_mut(member_id) {
            credential.retired_at = Some(Instant::now());
        }
    }

    fn detach(&mut self, member_id: &MemberId) -> Option<(String, Member)> {
        let room_id = self.member_rooms.get(member_id)?.clone();
        let member = self.leave(&room_id, member_id)?;
        Some((room_id, member))
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let mut indexed = 0;
        for room in self.rooms.values() {
            assert!(room.members.len() <= room.capacity);
            assert_eq!(room.active, !room.members.is_empty());
            for member in &room.members {
                indexed += 1;
                assert_eq!(self.member_rooms.get(&member.id), Some(&room.id));
                assert_eq!(self.connections.get(&member.connection_id), Some(&member.id));
                assert!(self
                    .credentials
                    .get(&member.id)
                    .is_some_and(|c| c.retired_at.is_none()));
            }
        }
        assert_eq!(indexed, self.member_rooms.len());
        assert_eq!(indexed, self.connections.len());
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new(4, Duration::from_secs(120))
    }
}
