//! Peer transports backed by the `webrtc` crate

use async_trait::async_trait;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::media::{LocalTrack, MediaError, PeerEvent, PeerEventSender, PeerFactory, PeerTransport, TransportState};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};
use crate::room::MemberId;

/// Receives remote audio tracks for playback
pub trait TrackSink: Send + Sync {
    fn play(&self, remote: MemberId, track: Arc<TrackRemote>);
}

impl From<webrtc::Error> for MediaError {
    fn from(e: webrtc::Error) -> Self {
        MediaError::Rtc(e.to_string())
    }
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, MediaError> {
    let rtc = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpKind::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback
        }
    };
    Ok(rtc)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, MediaError> {
    let kind = match description.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(MediaError::Rtc("unspecified description type".to_string()))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: description.sdp,
    })
}

/// Builds one `RTCPeerConnection` per remote member
pub struct RtcPeerFactory {
    api: API,
    config: RTCConfiguration,
    sink: Option<Arc<dyn TrackSink>>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: &[String], sink: Option<Arc<dyn TrackSink>>) -> Result<Self, MediaError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        Ok(Self { api, config, sink })
    }
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        remote: &MemberId,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerTransport>, MediaError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);

        let candidate_tx = events.clone();
        let candidate_remote = remote.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(PeerEvent::LocalCandidate {
                            remote: candidate_remote.clone(),
                            candidate: IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                                username_fragment: init.username_fragment,
                            },
                        });
                    }
                    Err(e) => log::warn!("Failed to serialize local candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        let state_tx = events.clone();
        let state_remote = remote.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            log::debug!("Peer connection to {} is {}", state_remote, state);
            let _ = state_tx.send(PeerEvent::StateChanged {
                remote: state_remote.clone(),
                state: TransportState::from(state),
            });
            Box::pin(async {})
        }));

        let track_tx = events;
        let track_remote = remote.clone();
        let sink = self.sink.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            if track.kind() == RTPCodecType::Audio {
                log::info!(
                    "Audio track from {} ({})",
                    track_remote,
                    track.codec().capability.mime_type
                );
                if let Some(sink) = &sink {
                    sink.play(track_remote.clone(), track);
                }
                let _ = track_tx.send(PeerEvent::RemoteTrack {
                    remote: track_remote.clone(),
                });
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeerTransport {
            remote: remote.clone(),
            pc,
        }))
    }
}

pub struct RtcPeerTransport {
    remote: MemberId,
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn add_track(&self, track: LocalTrack) -> Result<(), MediaError> {
        let sender = self
            .pc
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        // Interceptors only run while RTCP is being read.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn replace_track(&self, track: LocalTrack) -> Result<(), MediaError> {
        for sender in self.pc.get_senders().await {
            sender
                .replace_track(Some(track.clone() as Arc<dyn TrackLocal + Send + Sync>))
                .await?;
        }
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, MediaError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, MediaError> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), MediaError> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), MediaError> {
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc.set_local_description(rollback).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        log::debug!("Closing peer connection to {}", self.remote);
        self.pc.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::new_audio_track;
    use tokio::sync::mpsc;

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Connected),
            TransportState::Connected
        );
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Disconnected),
            TransportState::Disconnected
        );
        assert_eq!(
            TransportState::from(RTCPeerConnectionState::Unspecified),
            TransportState::New
        );
    }

    #[test]
    fn test_rollback_description() {
        let rtc = to_rtc(SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        })
        .unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Rollback);

        let mut unspecified = RTCSessionDescription::default();
        unspecified.sdp = "v=0".to_string();
        assert!(from_rtc(unspecified).is_err());
    }

    #[tokio::test]
    async fn test_local_offer_answer() {
        let factory = RtcPeerFactory::new(&[], None).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();

        let alice = factory.create(&MemberId::from("alice"), tx.clone()).await.unwrap();
        let bob = factory.create(&MemberId::from("bob"), tx).await.unwrap();
        alice.add_track(new_audio_track("alice-mic")).await.unwrap();
        bob.add_track(new_audio_track("bob-mic")).await.unwrap();

        let offer = alice.create_offer(false).await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("opus"));
        alice.set_local_description(offer.clone()).await.unwrap();

        bob.set_remote_description(offer).await.unwrap();
        let answer = bob.create_answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        bob.set_local_description(answer.clone()).await.unwrap();
        alice.set_remote_description(answer).await.unwrap();

        alice.close().await.unwrap();
        bob.close().await.unwrap();
    }
}
