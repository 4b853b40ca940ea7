//! Opus framing for voice tracks
//!
//! Capture produces arbitrarily sized blocks; the encoder wants 20 ms frames.

use opus::{Application, Channels, Decoder, Encoder};
use std::time::Duration;

use crate::media::MediaError;

pub const SAMPLE_RATE: u32 = 48000;
/// 20 ms at 48 kHz mono
pub const FRAME_SAMPLES: usize = 960;
pub const FRAME_DURATION: Duration = Duration::from_millis(20);
/// 120 ms, the longest Opus packet duration
const MAX_FRAME_SAMPLES: usize = 5760;
const MAX_PACKET_LEN: usize = 4000;

/// Opus voice encoder (48 kHz, mono)
pub struct OpusEncoder {
    encoder: Encoder,
}

impl OpusEncoder {
    pub fn new() -> Result<Self, MediaError> {
        let encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| MediaError::Device(format!("Failed to create Opus encoder: {:?}", e)))?;
        Ok(Self { encoder })
    }

    /// Encode exactly one 20 ms frame.
    pub fn encode(&mut self, frame: &[f32]) -> Result<Vec<u8>, MediaError> {
        if frame.len() != FRAME_SAMPLES {
            return Err(MediaError::Device(format!(
                "Opus frame must be {} samples, got {}",
                FRAME_SAMPLES,
                frame.len()
            )));
        }
        let mut packet = vec![0u8; MAX_PACKET_LEN];
        let len = self
            .encoder
            .encode_float(frame, &mut packet)
            .map_err(|e| MediaError::Device(format!("Opus encode failed: {:?}", e)))?;
        packet.truncate(len);
        Ok(packet)
    }
}

/// Opus voice decoder (48 kHz, mono)
pub struct OpusDecoder {
    decoder: Decoder,
}

impl OpusDecoder {
    pub fn new() -> Result<Self, MediaError> {
        let decoder = Decoder::new(SAMPLE_RATE, Channels::Mono)
            .map_err(|e| MediaError::Device(format!("Failed to create Opus decoder: {:?}", e)))?;
        Ok(Self { decoder })
    }

    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>, MediaError> {
        let mut samples = vec![0f32; MAX_FRAME_SAMPLES];
        let len = self
            .decoder
            .decode_float(packet, &mut samples, false)
            .map_err(|e| MediaError::Device(format!("Opus decode failed: {:?}", e)))?;
        samples.truncate(len);
        Ok(samples)
    }
}

/// Collects capture blocks into whole encoder frames.
#[derive(Default)]
pub struct FrameAssembler {
    pending: Vec<f32>,
}

impl FrameAssembler {
    /// Append samples and return every frame that is now complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / FRAME_SAMPLES;
        let frames = self
            .pending
            .chunks_exact(FRAME_SAMPLES)
            .map(<[f32]>::to_vec)
            .collect();
        self.pending.drain(..complete * FRAME_SAMPLES);
        frames
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Average interleaved channels down to mono.
pub fn downmix(data: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Scale samples by a 0..=100 volume.
pub fn apply_volume(samples: &mut [f32], volume: u8) {
    let gain = f32::from(volume.min(100)) / 100.0;
    for sample in samples.iter_mut() {
        *sample *= gain;
    }
}
