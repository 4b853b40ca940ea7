//! Real-time Audio Capture and Playback
//!
//! Microphone capture into an Opus track, and mixed playback of remote tracks.
//! Uses CPAL for cross-platform audio I/O. CPAL streams cannot leave the thread
//! that built them, so each one lives on its own thread until its guard drops.

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleRate, Stream, StreamConfig};
use parking_lot::Mutex;
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use webrtc::media::Sample;
use webrtc::track::track_remote::TrackRemote;

use crate::audio_codec::{
    apply_volume, downmix, FrameAssembler, OpusDecoder, OpusEncoder, FRAME_DURATION, SAMPLE_RATE,
};
use crate::media::{
    level_from_samples, new_audio_track, AudioDevice, CaptureConstraints, CaptureDevice, CaptureStream,
    LocalTrack, MediaError, SharedVoice,
};
use crate::rtc::TrackSink;
use crate::room::MemberId;

/// Capture ring size: one second of mono audio
const CAPTURE_BUFFER_SAMPLES: usize = SAMPLE_RATE as usize;
/// Per-peer playback buffer; small to keep latency low
const PLAYBACK_BUFFER_MS: usize = 120;

/// Keeps a CPAL stream alive on its owning thread
struct StreamGuard {
    _stop: std::sync::mpsc::Sender<()>,
}

/// Build and start a stream on a dedicated thread.
async fn spawn_stream<F>(name: &str, build: F) -> Result<StreamGuard, MediaError>
where
    F: FnOnce() -> Result<Stream, MediaError> + Send + 'static,
{
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let stream = match build() {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(MediaError::Device(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            // Returns once the guard's sender is dropped.
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| MediaError::Device(e.to_string()))?;

    ready_rx
        .await
        .map_err(|_| MediaError::Device("audio thread exited".to_string()))??;
    Ok(StreamGuard { _stop: stop_tx })
}

fn device_label(device: &Device) -> String {
    device.name().unwrap_or_else(|_| "Unknown".to_string())
}

fn stream_error(err: cpal::BuildStreamError) -> MediaError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => MediaError::DeviceNotFound(err.to_string()),
        other => MediaError::Device(other.to_string()),
    }
}

/// Microphones of the default CPAL host
pub struct CpalCapture {
    host: Host,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self {
            host: cpal::default_host(),
        }
    }

    fn find_input(&self, device_id: Option<&str>) -> Result<Device, MediaError> {
        match device_id {
            None => self
                .host
                .default_input_device()
                .ok_or_else(|| MediaError::DeviceNotFound("default input".to_string())),
            Some(id) => self
                .host
                .input_devices()
                .map_err(|e| MediaError::Device(e.to_string()))?
                .find(|d| d.name().map(|n| n == id).unwrap_or(false))
                .ok_or_else(|| MediaError::DeviceNotFound(id.to_string())),
        }
    }
}

impl Default for CpalCapture {
    fn default() -> Self {
        Self::new()
    }
}

struct CaptureShared {
    level: AtomicU8,
    enabled: AtomicBool,
    running: AtomicBool,
}

struct CpalStream {
    device_id: String,
    track: LocalTrack,
    shared: Arc<CaptureShared>,
    _stream: StreamGuard,
}

impl CaptureStream for CpalStream {
    fn track(&self) -> LocalTrack {
        self.track.clone()
    }

    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn level(&self) -> u8 {
        self.shared.level.load(Ordering::Relaxed)
    }

    fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        log::info!("Audio capture stopped on {}", self.device_id);
    }
}

#[async_trait]
impl CaptureDevice for CpalCapture {
    async fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn CaptureStream>, MediaError> {
        let device = self.find_input(constraints.device_id.as_deref())?;
        let device_id = device_label(&device);
        log::info!("Using input device: {}", device_id);
        if constraints.echo_cancellation || constraints.noise_suppression || constraints.auto_gain_control {
            log::debug!("Echo cancellation, noise suppression and gain control are left to the OS");
        }

        let channels = constraints.channels.max(1);
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };

        let shared = Arc::new(CaptureShared {
            level: AtomicU8::new(0),
            enabled: AtomicBool::new(true),
            running: AtomicBool::new(true),
        });
        let (producer, consumer) = HeapRb::<f32>::new(CAPTURE_BUFFER_SAMPLES).split();

        let callback_shared = shared.clone();
        let guard = spawn_stream("voice-capture", move || {
            let mut producer: HeapProducer<f32> = producer;
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let mut mono = downmix(data, channels);
                        if !callback_shared.enabled.load(Ordering::Relaxed) {
                            mono.iter_mut().for_each(|s| *s = 0.0);
                        }
                        callback_shared
                            .level
                            .store(level_from_samples(&mono), Ordering::Relaxed);
                        // A full ring drops the newest audio rather than blocking the callback.
                        producer.push_slice(&mono);
                    },
                    |err| log::error!("Audio input error: {}", err),
                    None,
                )
                .map_err(stream_error)
        })
        .await?;

        let track = new_audio_track(&device_id);
        tokio::spawn(encode_loop(consumer, track.clone(), shared.clone()));
        log::info!("Audio capture started: {}Hz, {} channel(s)", SAMPLE_RATE, channels);

        Ok(Box::new(CpalStream {
            device_id,
            track,
            shared,
            _stream: guard,
        }))
    }

    fn input_devices(&self) -> Result<Vec<AudioDevice>, MediaError> {
        let default = self.host.default_input_device().map(|d| device_label(&d));
        let devices = self
            .host
            .input_devices()
            .map_err(|e| MediaError::Device(e.to_string()))?;

        Ok(devices
            .filter_map(|d| d.name().ok())
            .map(|name| {
                let label = if default.as_deref() == Some(name.as_str()) {
                    format!("{} (default)", name)
                } else {
                    name.clone()
                };
                AudioDevice { id: name, label }
            })
            .collect())
    }
}

/// Drain captured samples into Opus frames on the outbound track.
async fn encode_loop(mut consumer: HeapConsumer<f32>, track: LocalTrack, shared: Arc<CaptureShared>) {
    let mut encoder = match OpusEncoder::new() {
        Ok(encoder) => encoder,
        Err(e) => {
            log::error!("{}", e);
            return;
        }
    };
    let mut assembler = FrameAssembler::default();
    let mut block = vec![0f32; CAPTURE_BUFFER_SAMPLES];
    let mut ticker = tokio::time::interval(FRAME_DURATION);

    while shared.running.load(Ordering::Relaxed) {
        ticker.tick().await;
        let n = consumer.pop_slice(&mut block);
        for frame in assembler.push(&block[..n]) {
            let packet = match encoder.encode(&frame) {
                Ok(packet) => packet,
                Err(e) => {
                    log::warn!("{}", e);
                    continue;
                }
            };
            let sample = Sample {
                data: Bytes::from(packet),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = track.write_sample(&sample).await {
                log::debug!("Failed to write audio sample: {}", e);
            }
        }
    }
}

type Mixer = Arc<Mutex<HashMap<MemberId, HeapConsumer<f32>>>>;

/// Plays every remote track through the default output device, scaled by
/// the local playback volume.
pub struct Playback {
    voice: SharedVoice,
    mixer: Mixer,
    _stream: StreamGuard,
}

impl Playback {
    pub async fn start(voice: SharedVoice) -> Result<Self, MediaError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| MediaError::DeviceNotFound("default output".to_string()))?;
        log::info!("Using output device: {}", device_label(&device));

        let config = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };
        let mixer: Mixer = Arc::new(Mutex::new(HashMap::new()));
        let sources = mixer.clone();

        let guard = spawn_stream("voice-playback", move || {
            device
                .build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        data.iter_mut().for_each(|s| *s = 0.0);
                        let mut sources = sources.lock();
                        for consumer in sources.values_mut() {
                            for sample in data.iter_mut() {
                                *sample += consumer.pop().unwrap_or(0.0);
                            }
                        }
                        data.iter_mut().for_each(|s| *s = s.clamp(-1.0, 1.0));
                    },
                    |err| log::error!("Audio output error: {}", err),
                    None,
                )
                .map_err(stream_error)
        })
        .await?;

        log::info!("Audio playback started: {}Hz", SAMPLE_RATE);
        Ok(Self {
            voice,
            mixer,
            _stream: guard,
        })
    }
}

impl TrackSink for Playback {
    fn play(&self, remote: MemberId, track: Arc<TrackRemote>) {
        let capacity = (SAMPLE_RATE as usize * PLAYBACK_BUFFER_MS) / 1000;
        let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
        self.mixer.lock().insert(remote.clone(), consumer);
        tokio::spawn(decode_loop(remote, track, producer, self.voice.clone(), self.mixer.clone()));
    }
}

async fn decode_loop(
    remote: MemberId,
    track: Arc<TrackRemote>,
    mut producer: HeapProducer<f32>,
    voice: SharedVoice,
    mixer: Mixer,
) {
    let mut decoder = match OpusDecoder::new() {
        Ok(decoder) => decoder,
        Err(e) => {
            log::error!("{}", e);
            return;
        }
    };

    while let Ok((packet, _)) = track.read_rtp().await {
        if packet.payload.is_empty() {
            continue;
        }
        match decoder.decode(&packet.payload) {
            Ok(mut samples) => {
                apply_volume(&mut samples, voice.get().volume);
                producer.push_slice(&samples);
            }
            Err(e) => log::warn!("Audio decode error from {}: {}", remote, e),
        }
    }

    mixer.lock().remove(&remote);
    log::info!("Audio track from {} ended", remote);
}
