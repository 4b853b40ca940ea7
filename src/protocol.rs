//! Signaling Protocol
//!
//! Defines the message format exchanged between voice clients and the relay,
//! and the length-prefixed framing used on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::room::{Member, MemberId, MemberUpdate, Room};

/// Default upper bound on a single frame (JSON is small; SDP is the largest payload).
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Signaling messages exchanged between client and relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    // Client -> Relay
    Join {
        room_id: String,
        display_name: String,
        /// Identity from an earlier connection, presented when reconnecting.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        member_id: Option<MemberId>,
        /// Token from the snapshot that granted `member_id`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reconnect_token: Option<String>,
    },
    Leave {
        room_id: String,
        member_id: MemberId,
    },
    UpdateState {
        room_id: String,
        fields: MemberUpdate,
    },
    Offer {
        room_id: String,
        target_member_id: MemberId,
        description: SessionDescription,
    },
    Answer {
        room_id: String,
        target_member_id: MemberId,
        description: SessionDescription,
    },
    IceCandidate {
        room_id: String,
        target_member_id: MemberId,
        candidate: IceCandidate,
    },

    // Relay -> Client
    RoomSnapshot {
        room: RoomInfo,
        member: MemberInfo,
        /// Secret proving ownership of `member.id` on a later join
        #[serde(default)]
        reconnect_token: String,
    },
    MemberJoined {
        member: MemberInfo,
    },
    MemberLeft {
        member_id: MemberId,
    },
    MemberUpdated {
        member: MemberInfo,
    },
    OfferReceived {
        from_member_id: MemberId,
        description: SessionDescription,
    },
    AnswerReceived {
        from_member_id: MemberId,
        description: SessionDescription,
    },
    IceCandidateReceived {
        from_member_id: MemberId,
        candidate: IceCandidate,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
}

/// Machine-readable reason attached to an `error` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RoomFull,
    NotInRoom,
    InvalidMessage,
    Unsupported,
}

/// Kind of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP offer or answer as exchanged over the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A trickled ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Public view of a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub id: String,
    pub display_name: String,
    pub members: Vec<MemberInfo>,
    pub capacity: usize,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

/// Public view of a member; the transport connection id never leaves the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub id: MemberId,
    pub display_name: String,
    pub connected: bool,
    pub muted: bool,
    pub speaking: bool,
    pub joined_at: DateTime<Utc>,
}

impl From<&Member> for MemberInfo {
    fn from(member: &Member) -> Self {
        Self {
            id: member.id.clone(),
            display_name: member.display_name.clone(),
            connected: member.connected,
            muted: member.muted,
            speaking: member.speaking,
            joined_at: member.joined_at,
        }
    }
}

impl From<&Room> for RoomInfo {
    fn from(room: &Room) -> Self {
        Self {
            id: room.id.clone(),
            display_name: room.display_name.clone(),
            members: room.members().iter().map(MemberInfo::from).collect(),
            capacity: room.capacity,
            created_at: room.created_at,
            active: room.active,
        }
    }
}

/// Framing and decoding errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("Invalid message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    Closed,
}

impl SignalingMessage {
    /// Serialize the message to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a message from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Create a framed message with length prefix (4 bytes, big-endian)
    pub fn to_framed(&self) -> Result<Vec<u8>, serde_json::Error> {
        let data = self.to_bytes()?;
        let len = (data.len() as u32).to_be_bytes();
        let mut framed = Vec::with_capacity(4 + data.len());
        framed.extend_from_slice(&len);
        framed.extend_from_slice(&data);
        Ok(framed)
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Join { .. } => "join",
            SignalingMessage::Leave { .. } => "leave",
            SignalingMessage::UpdateState { .. } => "update_state",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice_candidate",
            SignalingMessage::RoomSnapshot { .. } => "room_snapshot",
            SignalingMessage::MemberJoined { .. } => "member_joined",
            SignalingMessage::MemberLeft { .. } => "member_left",
            SignalingMessage::MemberUpdated { .. } => "member_updated",
            SignalingMessage::OfferReceived { .. } => "offer_received",
            SignalingMessage::AnswerReceived { .. } => "answer_received",
            SignalingMessage::IceCandidateReceived { .. } => "ice_candidate_received",
            SignalingMessage::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>, code: ErrorCode) -> Self {
        SignalingMessage::Error {
            message: message.into(),
            code: Some(code),
        }
    }
}

/// Read one length-prefixed frame. A clean EOF before the prefix yields `Closed`.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::Closed)
        }
        Err(e) => return Err(e.into()),
    }

    let msg_len = u32::from_be_bytes(len_buf) as usize;
    if msg_len > max_len {
        return Err(ProtocolError::FrameTooLarge(msg_len));
    }

    let mut msg_buf = vec![0u8; msg_len];
    reader.read_exact(&mut msg_buf).await?;
    Ok(msg_buf)
}

/// Read and decode one message
pub async fn receive_message<R>(reader: &mut R, max_len: usize) -> Result<SignalingMessage, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader, max_len).await?;
    Ok(SignalingMessage::from_bytes(&frame)?)
}

/// Encode and write one message
pub async fn send_message<W>(writer: &mut W, message: &SignalingMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let data = message.to_framed()?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape_is_tagged_snake_case() {
        let msg = SignalingMessage::Offer {
            room_id: "r1".to_string(),
            target_member_id: MemberId::from("bob"),
            description: SessionDescription::offer("v=0"),
        };
        let value: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["target_member_id"], "bob");
        assert_eq!(value["description"]["type"], "offer");
        assert_eq!(value["description"]["sdp"], "v=0");
    }

    #[test]
    fn test_join_without_member_id() {
        let parsed = SignalingMessage::from_bytes(
            br#"{"type":"join","room_id":"r1","display_name":"Alice"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed,
            SignalingMessage::Join {
                room_id: "r1".to_string(),
                display_name: "Alice".to_string(),
                member_id: None,
                reconnect_token: None,
            }
        );
    }

    #[test]
    fn test_error_code_encoding() {
        let msg = SignalingMessage::error("Room is full", ErrorCode::RoomFull);
        let value: serde_json::Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(value["code"], "room_full");
        assert_eq!(msg.kind(), "error");
    }

    #[test]
    fn test_framed_message() {
        let msg = SignalingMessage::MemberLeft {
            member_id: MemberId::from("m1"),
        };
        let framed = msg.to_framed().unwrap();

        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]);
        assert_eq!(len as usize, framed.len() - 4);
    }

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = SignalingMessage::IceCandidateReceived {
            from_member_id: MemberId::from("alice"),
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        };
        send_message(&mut a, &msg).await.unwrap();
        let received = receive_message(&mut b, MAX_FRAME_LEN).await.unwrap();
        assert_eq!(received, msg);

        drop(a);
        assert!(matches!(
            receive_message(&mut b, MAX_FRAME_LEN).await,
            Err(ProtocolError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let _ = a.write_all(&(1_000_000u32).to_be_bytes()).await;
        });
        assert!(matches!(
            read_frame(&mut b, MAX_FRAME_LEN).await,
            Err(ProtocolError::FrameTooLarge(1_000_000))
        ));
    }
}
