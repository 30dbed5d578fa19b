//! Opus ⇄ PCM transcoding for device audio.
//!
//! Devices speak 16 kHz mono Opus in fixed 60 ms frames, in both directions. This module owns:
//! - stateful decoding (Opus uses inter-frame prediction, so one decoder per session),
//! - re-framing arbitrary PCM into fixed frames for encoding, with leftover carry in
//!   streaming mode,
//! - the short fade-in applied to the first frame of a fresh utterance.
//!
//! The frame duration here is the same constant the player paces transmission with.

use audiopus::coder::{Decoder, Encoder};
use audiopus::packet::Packet;
use audiopus::{Application, Bitrate, Channels, MutSignals, SampleRate};

use crate::error::CodecError;

/// Device sample rate (Hz).
pub const SAMPLE_RATE: u32 = 16_000;

/// Duration of one Opus frame on the wire.
pub const FRAME_DURATION_MS: u64 = 60;

/// Samples per frame at [`SAMPLE_RATE`].
pub const FRAME_SAMPLES: usize = (SAMPLE_RATE as usize / 1000) * FRAME_DURATION_MS as usize;

/// Encoder target bitrate (bits/s).
pub const BITRATE: i32 = 48_000;

/// Largest packet Opus can produce for one frame.
pub const MAX_PACKET_BYTES: usize = 1275;

// Opus packets can carry up to 120 ms of audio; leave generous headroom.
const MAX_DECODE_SAMPLES: usize = FRAME_SAMPLES * 6;

const FADE_IN_SAMPLES: usize = 320;

/// Stateful Opus codec for one direction-pair of a session.
pub struct AudioCodec {
    decoder: Decoder,
    encoder: Encoder,
    leftover: Vec<i16>,
    fade_pending: bool,
}

impl AudioCodec {
    pub fn new() -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(SampleRate::Hz16000, Channels::Mono, Application::Audio)
            .map_err(|e| CodecError::Init(e.to_string()))?;
        encoder
            .set_bitrate(Bitrate::BitsPerSecond(BITRATE))
            .map_err(|e| CodecError::Init(e.to_string()))?;

        Ok(Self {
            decoder: new_decoder()?,
            encoder,
            leftover: Vec::with_capacity(FRAME_SAMPLES),
            fade_pending: true,
        })
    }

    /// Decode one Opus packet into 16-bit PCM.
    ///
    /// On failure the decoder is rebuilt before returning, so the offending frame is dropped
    /// without corrupting the prediction state used by later frames.
    pub fn decode_frame(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
        if packet.is_empty() {
            return Err(CodecError::EmptyPacket);
        }

        let mut out = vec![0i16; MAX_DECODE_SAMPLES];
        match decode_into(&mut self.decoder, packet, &mut out) {
            Ok(n) => {
                out.truncate(n);
                Ok(out)
            }
            Err(err) => {
                self.decoder = new_decoder()?;
                Err(CodecError::Decode(err.to_string()))
            }
        }
    }

    /// Encode PCM into fixed-duration Opus frames.
    ///
    /// - `continuation = true`: samples that don't fill a whole frame are held back and
    ///   prepended to the next call.
    /// - `continuation = false`: the trailing partial frame is zero-padded and emitted, and
    ///   the codec is ready for a fresh utterance afterwards.
    pub fn encode_stream(
        &mut self,
        pcm: &[i16],
        continuation: bool,
    ) -> Result<Vec<Vec<u8>>, CodecError> {
        let mut samples = std::mem::take(&mut self.leftover);
        samples.extend_from_slice(pcm);

        if self.fade_pending && !samples.is_empty() {
            apply_fade_in(&mut samples);
            self.fade_pending = false;
        }

        let whole = samples.len() / FRAME_SAMPLES * FRAME_SAMPLES;
        let mut frames = Vec::with_capacity(samples.len() / FRAME_SAMPLES + 1);
        for frame in samples[..whole].chunks_exact(FRAME_SAMPLES) {
            frames.push(self.encode_frame(frame)?);
        }

        let tail = &samples[whole..];
        if continuation {
            self.leftover.extend_from_slice(tail);
        } else {
            if !tail.is_empty() {
                let mut padded = tail.to_vec();
                padded.resize(FRAME_SAMPLES, 0);
                frames.push(self.encode_frame(&padded)?);
            }
            self.reset();
        }

        Ok(frames)
    }

    /// Emit whatever a streaming encode still holds back (zero-padded) and reset.
    pub fn flush(&mut self) -> Result<Vec<Vec<u8>>, CodecError> {
        self.encode_stream(&[], false)
    }

    /// Forget streaming state; the next encoded sample starts a fresh utterance.
    pub fn reset(&mut self) {
        self.leftover.clear();
        self.fade_pending = true;
    }

    /// Number of samples currently held back by a streaming encode.
    pub fn pending_samples(&self) -> usize {
        self.leftover.len()
    }

    fn encode_frame(&mut self, frame: &[i16]) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![0u8; MAX_PACKET_BYTES];
        let n = self
            .encoder
            .encode(frame, &mut out)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        out.truncate(n);
        Ok(out)
    }
}

fn new_decoder() -> Result<Decoder, CodecError> {
    Decoder::new(SampleRate::Hz16000, Channels::Mono).map_err(|e| CodecError::Init(e.to_string()))
}

fn decode_into(decoder: &mut Decoder, packet: &[u8], out: &mut [i16]) -> audiopus::Result<usize> {
    let packet: Packet<'_> = audiopus::TryInto::try_into(packet)?;
    let mut signals: MutSignals<'_, i16> = audiopus::TryInto::try_into(out)?;
    decoder.decode(Some(&packet), &mut signals, false)
}

fn apply_fade_in(samples: &mut [i16]) {
    let len = FADE_IN_SAMPLES.min(FRAME_SAMPLES).min(samples.len());
    for (i, s) in samples[..len].iter_mut().enumerate() {
        *s = (*s as f32 * (i as f32 / len as f32)) as i16;
    }
}

/// Convert 16-bit PCM to normalized `f32` in `[-1, 1)`.
pub fn pcm_to_f32(pcm: &[i16]) -> Vec<f32> {
    pcm.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Convert normalized `f32` back to 16-bit PCM, clamping out-of-range samples.
pub fn f32_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// Duration of `samples` mono samples at [`SAMPLE_RATE`], in milliseconds.
pub fn samples_to_ms(samples: usize) -> u64 {
    (samples as u64 * 1000) / SAMPLE_RATE as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(samples: usize, freq: f32, amp: f32) -> Vec<i16> {
        (0..samples)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                ((2.0 * std::f32::consts::PI * freq * t).sin() * amp * 32767.0) as i16
            })
            .collect()
    }

    fn rms(pcm: &[i16]) -> f32 {
        let sum: f64 = pcm.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / pcm.len().max(1) as f64).sqrt() as f32
    }

    #[test]
    fn round_trip_preserves_frame_count_and_energy() -> anyhow::Result<()> {
        let mut codec = AudioCodec::new()?;
        let pcm = sine(SAMPLE_RATE as usize, 440.0, 0.3);

        let frames = codec.encode_stream(&pcm, false)?;
        assert_eq!(frames.len(), pcm.len().div_ceil(FRAME_SAMPLES));

        let mut decoded = Vec::new();
        for frame in &frames {
            let chunk = codec.decode_frame(frame)?;
            assert_eq!(chunk.len(), FRAME_SAMPLES);
            decoded.extend_from_slice(&chunk);
        }

        // Skip the fade-in and codec warm-up frame before comparing levels.
        let original = rms(&pcm[FRAME_SAMPLES..pcm.len() - FRAME_SAMPLES]);
        let restored = rms(&decoded[FRAME_SAMPLES..pcm.len() - FRAME_SAMPLES]);
        let ratio = restored / original;
        assert!((0.7..1.3).contains(&ratio), "energy ratio {ratio}");
        Ok(())
    }

    #[test]
    fn streaming_mode_carries_leftover_between_calls() -> anyhow::Result<()> {
        let mut codec = AudioCodec::new()?;

        assert!(codec.encode_stream(&vec![100; 500], true)?.is_empty());
        assert_eq!(codec.pending_samples(), 500);

        let frames = codec.encode_stream(&vec![100; 500], true)?;
        assert_eq!(frames.len(), 1);
        assert_eq!(codec.pending_samples(), 1000 - FRAME_SAMPLES);

        assert_eq!(codec.flush()?.len(), 1);
        assert_eq!(codec.pending_samples(), 0);
        Ok(())
    }

    #[test]
    fn non_streaming_mode_retains_nothing() -> anyhow::Result<()> {
        let mut codec = AudioCodec::new()?;
        let frames = codec.encode_stream(&vec![0; FRAME_SAMPLES + 1], false)?;
        assert_eq!(frames.len(), 2);
        assert_eq!(codec.pending_samples(), 0);
        Ok(())
    }

    #[test]
    fn fade_in_ramps_first_samples_only() {
        let mut samples = vec![10_000i16; FRAME_SAMPLES];
        apply_fade_in(&mut samples);
        assert_eq!(samples[0], 0);
        assert!(samples[FADE_IN_SAMPLES / 2] < 10_000);
        assert_eq!(samples[FADE_IN_SAMPLES], 10_000);
    }

    #[test]
    fn decode_error_resets_and_later_frames_still_decode() -> anyhow::Result<()> {
        let mut codec = AudioCodec::new()?;
        let good = codec.encode_stream(&sine(FRAME_SAMPLES, 300.0, 0.2), false)?;

        assert!(matches!(codec.decode_frame(&[]), Err(CodecError::EmptyPacket)));
        // Code-3 TOC byte without the mandatory frame-count byte.
        assert!(matches!(codec.decode_frame(&[0xFB]), Err(CodecError::Decode(_))));

        let pcm = codec.decode_frame(&good[0])?;
        assert_eq!(pcm.len(), FRAME_SAMPLES);
        Ok(())
    }

    #[test]
    fn sample_conversion_clamps() {
        assert_eq!(f32_to_pcm(&[2.0, -2.0]), vec![32767, -32767]);
        let back = pcm_to_f32(&[16384]);
        assert!((back[0] - 0.5).abs() < 1e-6);
    }
}
