//! TTS clip normalization.
//!
//! Providers return speech at whatever rate/layout they like; the player only speaks 16 kHz
//! mono. This module:
//! - downmixes interleaved multi-channel PCM to mono,
//! - resamples to [`SAMPLE_RATE`] with a windowed-sinc resampler,
//! - compensates the resampler delay so clip boundaries stay aligned.
//!
//! One [`ClipNormalizer`] is kept per synthesizer; the resampler is rebuilt only when the
//! provider's rate changes.

use anyhow::{Context, anyhow, bail};
use rubato::{Resampler, SincFixedIn, WindowFunction};

use crate::Result;
use crate::codec::{SAMPLE_RATE, f32_to_pcm, pcm_to_f32};

// Source frames fed to rubato per `process()` call.
const IN_CHUNK_FRAMES: usize = 1024;

#[derive(Default)]
pub struct ClipNormalizer {
    resampler: Option<(u32, SincFixedIn<f32>)>,
}

impl ClipNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert interleaved 16-bit PCM at `src_rate` into 16 kHz mono.
    pub fn normalize(&mut self, pcm: &[i16], src_rate: u32, channels: u16) -> Result<Vec<i16>> {
        if channels == 0 {
            return Err(anyhow!("clip has zero channels").into());
        }
        if src_rate == 0 {
            return Err(anyhow!("clip has zero sample rate").into());
        }

        // Fast path: already in device format.
        if src_rate == SAMPLE_RATE && channels == 1 {
            return Ok(pcm.to_vec());
        }

        let mono = downmix_to_mono(&pcm_to_f32(pcm), channels as usize);
        if src_rate == SAMPLE_RATE {
            return Ok(f32_to_pcm(&mono));
        }

        let out = self.resample(&mono, src_rate)?;
        Ok(f32_to_pcm(&out))
    }

    fn ensure_resampler(&mut self, src_rate: u32) -> anyhow::Result<&mut SincFixedIn<f32>> {
        let stale = !matches!(&self.resampler, Some((rate, _)) if *rate == src_rate);
        if stale {
            let rs = SincFixedIn::<f32>::new(
                SAMPLE_RATE as f64 / src_rate as f64,
                2.0,
                rubato::SincInterpolationParameters {
                    sinc_len: 256,
                    f_cutoff: 0.95,
                    interpolation: rubato::SincInterpolationType::Linear,
                    oversampling_factor: 256,
                    window: WindowFunction::BlackmanHarris2,
                },
                IN_CHUNK_FRAMES,
                1, // mono
            )
            .map_err(|e| anyhow!(e))
            .context("failed to init resampler")?;
            self.resampler = Some((src_rate, rs));
        }

        match self.resampler.as_mut() {
            Some((_, rs)) => {
                rs.reset();
                Ok(rs)
            }
            None => bail!("resampler not initialized"),
        }
    }

    fn resample(&mut self, mono: &[f32], src_rate: u32) -> anyhow::Result<Vec<f32>> {
        let expected = (mono.len() as f64 * SAMPLE_RATE as f64 / src_rate as f64).round() as usize;
        let rs = self.ensure_resampler(src_rate)?;
        let delay = rs.output_delay();

        // rubato wants exact blocks: pad the clip, plus enough extra to push the delay out.
        let in_max = rs.input_frames_max();
        let mut input = mono.to_vec();
        let needed = input.len() + in_max;
        input.resize(needed.div_ceil(in_max) * in_max, 0.0);

        let mut out = Vec::with_capacity(expected + delay + in_max);
        for block in input.chunks_exact(in_max) {
            let processed = rs
                .process(&vec![block.to_vec()], None)
                .map_err(|e| anyhow!(e))
                .context("resampler process failed")?;
            if processed.len() != 1 {
                bail!("expected mono output from resampler");
            }
            out.extend_from_slice(&processed[0]);
            if out.len() >= expected + delay {
                break;
            }
        }

        let end = (delay + expected).min(out.len());
        Ok(out.get(delay..end).map(<[f32]>::to_vec).unwrap_or_default())
    }
}

/// Downmix interleaved samples into mono by averaging channels.
fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved.to_vec();
    }

    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
