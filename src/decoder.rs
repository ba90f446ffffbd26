//! Decode cascade: an ordered list of strategies that turn encoded audio
//! bytes into samples, tried in turn until one succeeds.

use std::io::Cursor;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::waveform::{check_rate, downmix, normalize, resample, DecodedAudio, Waveform};
use crate::{Error, Result};

/// Rates the primary codec is retried at when everything else failed.
pub const FALLBACK_RATES: [u32; 4] = [16000, 22050, 44100, 48000];

/// One way of interpreting encoded audio.
pub trait DecodeStrategy: Send + Sync {
    fn name(&self) -> String;

    fn decode(&self, data: &[u8], rate_hint: u32) -> Result<DecodedAudio>;
}

/// Rate the primary codec delivers its output at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRate {
    /// The caller's hint.
    Hint,
    Fixed(u32),
    /// Used only when the hint itself is out of range. With a usable hint
    /// the native decode was already tried at [`TargetRate::Hint`] and would
    /// fail the same way, so the attempt is skipped without decoding.
    Fallback(u32),
}

/// Primary codec: symphonia probe + decode, downmixed to mono and resampled
/// to the target rate.
pub struct SymphoniaDecoder {
    target: TargetRate,
}

impl SymphoniaDecoder {
    pub fn at_hint() -> Self {
        Self {
            target: TargetRate::Hint,
        }
    }

    pub fn at_rate(rate: u32) -> Self {
        Self {
            target: TargetRate::Fixed(rate),
        }
    }

    pub fn fallback(rate: u32) -> Self {
        Self {
            target: TargetRate::Fallback(rate),
        }
    }
}

impl DecodeStrategy for SymphoniaDecoder {
    fn name(&self) -> String {
        match self.target {
            TargetRate::Hint => "symphonia@hint".to_string(),
            TargetRate::Fixed(r) | TargetRate::Fallback(r) => format!("symphonia@{}", r),
        }
    }

    fn decode(&self, data: &[u8], rate_hint: u32) -> Result<DecodedAudio> {
        let rate = match self.target {
            TargetRate::Hint => rate_hint,
            TargetRate::Fixed(r) => r,
            TargetRate::Fallback(r) => {
                if check_rate(rate_hint).is_ok() {
                    return Err(Error::Decode(format!(
                        "skipped, hint {}Hz was usable",
                        rate_hint
                    )));
                }
                r
            }
        };
        check_rate(rate)?;

        let native = decode_symphonia(data)?;
        let mono = downmix(&native.samples, native.channels);
        let samples = resample(&mono, native.sample_rate, rate)?;
        Ok(DecodedAudio {
            samples,
            channels: 1,
            sample_rate: rate,
        })
    }
}

fn decode_symphonia(data: &[u8]) -> Result<DecodedAudio> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(data.to_vec())), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| Error::Decode(format!("unrecognized container: {}", e)))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| Error::Decode("no decodable audio track".into()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate;
    let mut channels = track.codec_params.channels.map(|c| c.count());

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| Error::Decode(format!("unsupported codec: {}", e)))?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(Error::Decode(format!("reading packet: {}", e))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = Some(spec.rate);
                channels = Some(spec.channels.count());
                let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
            // corrupt packet, keep going
            Err(SymphoniaError::IoError(_)) | Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(Error::Decode(format!("decoding packet: {}", e))),
        }
    }

    let sample_rate = sample_rate.ok_or_else(|| Error::Decode("unknown sample rate".into()))?;
    check_rate(sample_rate)?;
    let channels = channels.unwrap_or(1);
    if samples.is_empty() {
        return Err(Error::Decode("stream contained no samples".into()));
    }

    Ok(DecodedAudio {
        samples,
        channels,
        sample_rate,
    })
}

/// Secondary codec: hound, for plain RIFF/WAV, at whatever rate and channel
/// count the file declares.
pub struct WavDecoder;

impl DecodeStrategy for WavDecoder {
    fn name(&self) -> String {
        "hound".to_string()
    }

    fn decode(&self, data: &[u8], _rate_hint: u32) -> Result<DecodedAudio> {
        let reader = hound::WavReader::new(Cursor::new(data))
            .map_err(|e| Error::Decode(format!("not a wav file: {}", e)))?;
        let spec = reader.spec();
        check_rate(spec.sample_rate)?;

        let samples: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| Error::Decode(format!("wav samples: {}", e)))?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| Error::Decode(format!("wav samples: {}", e)))?
            }
        };
        if samples.is_empty() {
            return Err(Error::Decode("wav file contained no samples".into()));
        }

        Ok(DecodedAudio {
            samples,
            channels: spec.channels as usize,
            sample_rate: spec.sample_rate,
        })
    }
}

/// Ordered list of [`DecodeStrategy`]s; the first success wins.
pub struct DecodeCascade {
    strategies: Vec<Box<dyn DecodeStrategy>>,
}

impl DecodeCascade {
    pub fn new(strategies: Vec<Box<dyn DecodeStrategy>>) -> Self {
        Self { strategies }
    }

    /// Primary at the hint, then the wav reader at its native rate, then the
    /// primary again at each of [`FALLBACK_RATES`]. The retries only decode
    /// when the hint was out of range.
    pub fn standard() -> Self {
        let mut strategies: Vec<Box<dyn DecodeStrategy>> =
            vec![Box::new(SymphoniaDecoder::at_hint()), Box::new(WavDecoder)];
        for rate in FALLBACK_RATES {
            strategies.push(Box::new(SymphoniaDecoder::fallback(rate)));
        }
        Self::new(strategies)
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn decode(&self, data: &[u8], rate_hint: u32) -> Result<DecodedAudio> {
        if data.is_empty() {
            return Err(Error::Validation("empty audio payload".into()));
        }

        let mut last_failure = String::from("no decode strategies configured");
        for strategy in &self.strategies {
            match strategy.decode(data, rate_hint) {
                Ok(audio) => {
                    debug!(
                        strategy = %strategy.name(),
                        rate = audio.sample_rate,
                        channels = audio.channels,
                        frames = audio.frames(),
                        "decoded audio"
                    );
                    return Ok(audio);
                }
                Err(e) => {
                    warn!(strategy = %strategy.name(), error = %e, "decode strategy failed");
                    last_failure = format!("{}: {}", strategy.name(), e);
                }
            }
        }

        Err(Error::Decode(format!(
            "all decode strategies failed, last was {}",
            last_failure
        )))
    }

    /// [`DecodeCascade::decode`] followed by [`normalize`].
    pub fn decode_normalized(&self, data: &[u8], rate_hint: u32) -> Result<Waveform> {
        normalize(self.decode(data, rate_hint)?)
    }
}

impl Default for DecodeCascade {
    fn default() -> Self {
        Self::standard()
    }
}
