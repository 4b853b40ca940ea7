//! Media Handling
//!
//! The seams between the orchestrator and real media: microphone capture and
//! per-peer transports. Device-backed implementations live in `audio` and
//! `rtc`; tests substitute their own.

use async_trait::async_trait;
use parking_lot::{RwLock, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::AudioConfig;
use crate::protocol::{IceCandidate, SessionDescription};
use crate::room::MemberId;

/// Outbound audio track shared by every peer link
pub type LocalTrack = Arc<TrackLocalStaticSample>;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MediaError {
    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Peer connection error: {0}")]
    Rtc(String),
    #[error("Closed")]
    Closed,
}

/// Audio capture constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    /// Device to open; the host default when `None`.
    pub device_id: Option<String>,
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self::from(&AudioConfig::default())
    }
}

impl From<&AudioConfig> for CaptureConstraints {
    fn from(config: &AudioConfig) -> Self {
        Self {
            device_id: config.device.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
            auto_gain_control: config.auto_gain_control,
        }
    }
}

impl CaptureConstraints {
    pub fn with_device(&self, device_id: &str) -> Self {
        Self {
            device_id: Some(device_id.to_string()),
            ..self.clone()
        }
    }
}

/// An input device as presented to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioDevice {
    pub id: String,
    pub label: String,
}

/// Opens microphone streams
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn CaptureStream>, MediaError>;

    fn input_devices(&self) -> Result<Vec<AudioDevice>, MediaError>;
}

/// A live microphone stream feeding a local track. Dropping it releases the device.
pub trait CaptureStream: Send + Sync {
    fn track(&self) -> LocalTrack;

    fn device_id(&self) -> &str;

    /// Current input level, 0..=100
    fn level(&self) -> u8;

    /// Enable or silence outbound audio without touching negotiation.
    fn set_enabled(&self, enabled: bool);
}

/// Connectivity of one peer transport, as reported by the underlying stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Asynchronous notifications from peer transports
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate {
        remote: MemberId,
        candidate: IceCandidate,
    },
    StateChanged {
        remote: MemberId,
        state: TransportState,
    },
    RemoteTrack {
        remote: MemberId,
    },
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Creates one transport per remote member
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        remote: &MemberId,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>, MediaError>;
}

/// The negotiation surface of one peer-to-peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: LocalTrack) -> Result<(), MediaError>;

    /// Swap the outbound audio track in place, without renegotiation.
    async fn replace_track(&self, track: LocalTrack) -> Result<(), MediaError>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MediaError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError>;

    /// Abandon a pending local offer.
    async fn rollback(&self) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    async fn close(&self) -> Result<(), MediaError>;
}

/// Local voice state, written by the orchestrator and read everywhere else
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceState {
    pub muted: bool,
    /// Playback volume, 0..=100
    pub volume: u8,
    /// Last metered input level, 0..=100
    pub audio_level: u8,
    pub capturing: bool,
}

impl Default for VoiceState {
    fn default() -> Self {
        Self {
            muted: false,
            volume: 50,
            audio_level: 0,
            capturing: false,
        }
    }
}

/// Voice state shared between the orchestrator, which writes it, and readers
/// such as playback.
#[derive(Debug, Clone, Default)]
pub struct SharedVoice(Arc<RwLock<VoiceState>>);

impl SharedVoice {
    pub fn get(&self) -> VoiceState {
        *self.0.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, VoiceState> {
        self.0.write()
    }
}

/// A fresh Opus track for a capture stream
pub fn new_audio_track(stream_id: &str) -> LocalTrack {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 1,
            ..Default::default()
        },
        "audio".to_owned(),
        stream_id.to_owned(),
    ))
}

/// RMS of a block of samples mapped onto 0..=100.
pub fn level_from_samples(samples: &[f32]) -> u8 {
    if samples.is_empty() {
        return 0;
    }
    let mean_square = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    let rms = mean_square.sqrt();
    // Speech RMS rarely exceeds ~0.3 of full scale.
    ((rms / 0.3) * 100.0).round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_from_samples() {
        assert_eq!(level_from_samples(&[]), 0);
        assert_eq!(level_from_samples(&[0.0; 480]), 0);
        assert_eq!(level_from_samples(&[1.0; 480]), 100);

        let quiet = level_from_samples(&[0.03; 480]);
        let loud = level_from_samples(&[0.15; 480]);
        assert!(quiet < loud);
        assert_eq!(loud, 50);
    }

    #[test]
    fn test_constraints_from_config() {
        let config = AudioConfig {
            device: Some("USB Mic".to_string()),
            ..AudioConfig::default()
        };
        let constraints = CaptureConstraints::from(&config);
        assert_eq!(constraints.device_id.as_deref(), Some("USB Mic"));
        assert_eq!(constraints.with_device("Other").device_id.as_deref(), Some("Other"));
        assert_eq!(constraints.sample_rate, 48000);
    }

    #[test]
    fn test_transport_state_display() {
        assert_eq!(TransportState::Failed.to_string(), "failed");
    }
}
