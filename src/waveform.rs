use rubato::{
    calculate_cutoff, Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use serde::Serialize;

use crate::{Error, Result};

/// Rate every downstream model expects.
pub const SAMPLE_RATE: u32 = 16000;

/// Shortest waveform handed to a model: one second at [`SAMPLE_RATE`].
pub const MIN_SAMPLES: usize = SAMPLE_RATE as usize;

/// Source rates outside this range are refused before any resampling. A
/// header claiming 1 Hz would otherwise be upsampled 16000x.
pub const SOURCE_RATES: std::ops::RangeInclusive<u32> = 8_000..=384_000;

const RESAMPLE_CHUNK: usize = 1024;

/// Rejects a sample rate read from untrusted input.
pub fn check_rate(rate: u32) -> Result<()> {
    if SOURCE_RATES.contains(&rate) {
        Ok(())
    } else {
        Err(Error::Decode(format!(
            "sample rate {}Hz outside {}..={}Hz",
            rate,
            SOURCE_RATES.start(),
            SOURCE_RATES.end()
        )))
    }
}

/// Raw request input: the encoded bytes plus the caller's sample-rate hint.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    pub data: Vec<u8>,
    pub rate_hint: u32,
}

impl AudioBuffer {
    pub fn new(data: Vec<u8>, rate_hint: u32) -> Self {
        Self { data, rate_hint }
    }
}

/// Output of one decode strategy, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Interleaved when `channels > 1`.
    pub samples: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1)
    }
}

/// Mono waveform ready for a model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Waveform {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl Waveform {
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Seconds of audio, padding included.
    pub fn duration(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Brings decoded audio to mono, [`SAMPLE_RATE`] and at least [`MIN_SAMPLES`].
///
/// Short clips are zero-padded on the right. Long clips are kept whole.
pub fn normalize(decoded: DecodedAudio) -> Result<Waveform> {
    if decoded.channels == 0 {
        return Err(Error::Decode("audio reports zero channels".into()));
    }
    check_rate(decoded.sample_rate)?;

    let mono = downmix(&decoded.samples, decoded.channels);
    let mut samples = resample(&mono, decoded.sample_rate, SAMPLE_RATE)?;
    if samples.len() < MIN_SAMPLES {
        samples.resize(MIN_SAMPLES, 0.0);
    }

    Ok(Waveform {
        samples,
        sample_rate: SAMPLE_RATE,
    })
}

/// Averages interleaved channels into one.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Sinc resampling of a mono signal. Output length is `len * to / from`, rounded.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let sinc_len = 128;
    let window = WindowFunction::BlackmanHarris2;
    let params = SincInterpolationParameters {
        sinc_len,
        f_cutoff: calculate_cutoff(sinc_len, window),
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| Error::Decode(format!("cannot resample {}Hz -> {}Hz: {}", from_rate, to_rate, e)))?;
    let resample_err = |e: rubato::ResampleError| Error::Decode(format!("resampling failed: {}", e));

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut out: Vec<f32> = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut chunks = samples.chunks_exact(RESAMPLE_CHUNK);
    for chunk in &mut chunks {
        let input = vec![chunk.to_vec()];
        let output = resampler.process(&input, None).map_err(resample_err)?;
        out.extend_from_slice(&output[0]);
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        let input = vec![rest.to_vec()];
        let output = resampler
            .process_partial(Some(input.as_slice()), None)
            .map_err(resample_err)?;
        out.extend_from_slice(&output[0]);
    }

    // Flush the filter tail so the delay can be trimmed off the front.
    while out.len() < expected + delay {
        let output = resampler
            .process_partial::<Vec<f32>>(None, None)
            .map_err(resample_err)?;
        if output[0].is_empty() {
            break;
        }
        out.extend_from_slice(&output[0]);
    }

    out.drain(..delay.min(out.len()));
    out.resize(expected, 0.0);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, rate: u32) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * 220.0 * i as f32 / rate as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn short_clip_is_padded_with_zeros_after_originals() {
        let original = tone(4000, SAMPLE_RATE);
        let w = normalize(DecodedAudio {
            samples: original.clone(),
            channels: 1,
            sample_rate: SAMPLE_RATE,
        })
        .unwrap();

        assert_eq!(w.len(), MIN_SAMPLES);
        assert_eq!(w.sample_rate(), SAMPLE_RATE);
        assert_eq!(&w.samples()[..4000], original.as_slice());
        assert!(w.samples()[4000..].iter().all(|s| *s == 0.0));
        assert_eq!(w.duration(), 1.0);
    }

    #[test]
    fn long_clip_is_not_truncated() {
        let original = tone(40_000, SAMPLE_RATE);
        let w = normalize(DecodedAudio {
            samples: original.clone(),
            channels: 1,
            sample_rate: SAMPLE_RATE,
        })
        .unwrap();
        assert_eq!(w.samples(), original.as_slice());
        assert!((w.duration() - 2.5).abs() < 1e-6);
    }

    #[test]
    fn stereo_collapses_to_one_channel_length() {
        let frames = 20_000;
        let mut interleaved = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            interleaved.push(i as f32 / frames as f32);
            interleaved.push(-(i as f32) / frames as f32 + 0.5);
        }
        let w = normalize(DecodedAudio {
            samples: interleaved,
            channels: 2,
            sample_rate: SAMPLE_RATE,
        })
        .unwrap();
        assert_eq!(w.len(), frames);
        assert!(w.samples().iter().all(|s| (*s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn downmix_averages() {
        assert_eq!(downmix(&[1.0, 3.0, -1.0, 1.0], 2), vec![2.0, 0.0]);
        assert_eq!(downmix(&[0.3, 0.6], 1), vec![0.3, 0.6]);
    }

    #[test]
    fn resample_produces_expected_length() {
        let out = resample(&tone(24_000, 48_000), 48_000, SAMPLE_RATE).unwrap();
        assert_eq!(out.len(), 8_000);
        let out = resample(&tone(8_000, 8_000), 8_000, SAMPLE_RATE).unwrap();
        assert_eq!(out.len(), 16_000);
        assert!(out.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn resample_keeps_signal_aligned() {
        // A constant signal should come out constant away from the edges.
        let out = resample(&vec![0.5; 22_050], 22_050, SAMPLE_RATE).unwrap();
        assert_eq!(out.len(), 16_000);
        for s in &out[2_000..14_000] {
            assert!((s - 0.5).abs() < 0.01, "{}", s);
        }
    }

    #[test]
    fn implausible_rates_are_rejected_before_resampling() {
        for rate in [1, 7_999, 384_001] {
            let res = normalize(DecodedAudio {
                samples: vec![0.0; 400],
                channels: 1,
                sample_rate: rate,
            });
            assert!(matches!(res, Err(Error::Decode(_))), "{}", rate);
        }
        assert!(check_rate(8_000).is_ok());
        assert!(check_rate(384_000).is_ok());
    }

    #[test]
    fn zero_rate_is_rejected() {
        let res = normalize(DecodedAudio {
            samples: vec![0.0; 10],
            channels: 1,
            sample_rate: 0,
        });
        assert!(matches!(res, Err(Error::Decode(_))));
    }
}
