//! In-memory capture devices and peer transports for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use webrtc::track::track_local::TrackLocal;

use crate::media::{
    new_audio_track, AudioDevice, CaptureConstraints, CaptureDevice, CaptureStream, LocalTrack,
    MediaError, PeerEventSender, PeerFactory, PeerTransport,
};
use crate::protocol::{IceCandidate, SessionDescription};
use crate::room::MemberId;

#[derive(Default)]
pub struct FakeCaptureDevice {
    pub deny: AtomicBool,
    pub opened: Mutex<Vec<String>>,
    pub live: Mutex<Vec<Arc<FakeStreamState>>>,
}

pub struct FakeStreamState {
    pub device_id: String,
    pub level: AtomicU8,
    pub enabled: AtomicBool,
    pub released: AtomicBool,
}

struct FakeStream {
    state: Arc<FakeStreamState>,
    track: LocalTrack,
}

impl Drop for FakeStream {
    fn drop(&mut self) {
        self.state.released.store(true, Ordering::SeqCst);
    }
}

impl CaptureStream for FakeStream {
    fn track(&self) -> LocalTrack {
        self.track.clone()
    }

    fn device_id(&self) -> &str {
        &self.state.device_id
    }

    fn level(&self) -> u8 {
        self.state.level.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl FakeCaptureDevice {
    pub fn latest(&self) -> Arc<FakeStreamState> {
        self.live.lock().last().cloned().expect("a stream was opened")
    }
}

#[async_trait]
impl CaptureDevice for FakeCaptureDevice {
    async fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn CaptureStream>, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("denied by user".to_string()));
        }
        let device_id = constraints.device_id.clone().unwrap_or_else(|| "default".to_string());
        if device_id == "broken" {
            return Err(MediaError::DeviceNotFound(device_id));
        }
        let state = Arc::new(FakeStreamState {
            device_id: device_id.clone(),
            level: AtomicU8::new(0),
            enabled: AtomicBool::new(true),
            released: AtomicBool::new(false),
        });
        self.opened.lock().push(device_id.clone());
        self.live.lock().push(state.clone());
        Ok(Box::new(FakeStream {
            state,
            track: new_audio_track(&device_id),
        }))
    }

    fn input_devices(&self) -> Result<Vec<AudioDevice>, MediaError> {
        Ok(vec![
            AudioDevice {
                id: "default".to_string(),
                label: "Default".to_string(),
            },
            AudioDevice {
                id: "usb".to_string(),
                label: "USB Mic".to_string(),
            },
        ])
    }
}

/// Records every call made on a transport
#[derive(Default)]
pub struct FakeTransport {
    pub remote: String,
    pub calls: Mutex<Vec<String>>,
    pub tracks: Mutex<Vec<String>>,
    pub fail_replace: AtomicBool,
    offers: AtomicU8,
}

impl FakeTransport {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: LocalTrack) -> Result<(), MediaError> {
        self.record("add_track");
        self.tracks.lock().push(track.stream_id().to_string());
        Ok(())
    }

    async fn replace_track(&self, track: LocalTrack) -> Result<(), MediaError> {
        if self.fail_replace.load(Ordering::SeqCst) && track.stream_id() != "default" {
            return Err(MediaError::Rtc("replace failed".to_string()));
        }
        self.record(format!("replace_track:{}", track.stream_id()));
        self.tracks.lock().push(track.stream_id().to_string());
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        self.record(format!("create_offer:{}", ice_restart));
        Ok(SessionDescription::offer(format!("offer-{}-{}", self.remote, n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        self.record("create_answer");
        Ok(SessionDescription::answer(format!("answer-{}", self.remote)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        self.record(format!("set_local:{}", description.sdp));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        self.record(format!("set_remote:{}", description.sdp));
        Ok(())
    }

    async fn rollback(&self) -> Result<(), MediaError> {
        self.record("rollback");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.record(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.record("close");
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePeerFactory {
    pub transports: Mutex<HashMap<MemberId, Vec<Arc<FakeTransport>>>>,
}

impl FakePeerFactory {
    /// Most recent transport created for a peer
    pub fn transport(&self, remote: &str) -> Arc<FakeTransport> {
        self.transports
            .lock()
            .get(&MemberId::from(remote))
            .and_then(|all| all.last().cloned())
            .expect("transport exists")
    }

    pub fn created(&self, remote: &str) -> usize {
        self.transports
            .lock()
            .get(&MemberId::from(remote))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        remote: &MemberId,
        _events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>, MediaError> {
        let transport = Arc::new(FakeTransport {
            remote: remote.to_string(),
            ..Default::default()
        });
        self.transports
            .lock()
            .entry(remote.clone())
            .or_default()
            .push(transport.clone());
        Ok(transport)
    }
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("c{}", n),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}
