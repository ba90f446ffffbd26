use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tract_onnx::prelude::*;

use crate::waveform::{Waveform, SAMPLE_RATE};
use crate::{Error, Result};

/// Color used for labels we do not know.
pub const NEUTRAL_COLOR: &str = "#6b7280";
/// Icon used for labels we do not know.
pub const NEUTRAL_EMOJI: &str = "😐";

/// Labels the classifier scores, in model output order.
///
/// The derived ordering follows declaration order, which is also the
/// tie-break order when picking the dominant emotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Calm,
    Disgust,
    Fearful,
    Happy,
    Neutral,
    Sad,
    Surprised,
}

impl Emotion {
    pub const ALL: [Emotion; 8] = [
        Emotion::Angry,
        Emotion::Calm,
        Emotion::Disgust,
        Emotion::Fearful,
        Emotion::Happy,
        Emotion::Neutral,
        Emotion::Sad,
        Emotion::Surprised,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Emotion::Angry => "angry",
            Emotion::Calm => "calm",
            Emotion::Disgust => "disgust",
            Emotion::Fearful => "fearful",
            Emotion::Happy => "happy",
            Emotion::Neutral => "neutral",
            Emotion::Sad => "sad",
            Emotion::Surprised => "surprised",
        }
    }

    /// Display color as a CSS hex string.
    pub fn color(self) -> &'static str {
        match self {
            Emotion::Angry => "#ef4444",
            Emotion::Calm => "#10b981",
            Emotion::Disgust => "#8b5cf6",
            Emotion::Fearful => "#f59e0b",
            Emotion::Happy => "#f59e0b",
            Emotion::Neutral => NEUTRAL_COLOR,
            Emotion::Sad => "#3b82f6",
            Emotion::Surprised => "#ec4899",
        }
    }

    pub fn emoji(self) -> &'static str {
        match self {
            Emotion::Angry => "😠",
            Emotion::Calm => "😌",
            Emotion::Disgust => "🤢",
            Emotion::Fearful => "😨",
            Emotion::Happy => "😊",
            Emotion::Neutral => NEUTRAL_EMOJI,
            Emotion::Sad => "😢",
            Emotion::Surprised => "😲",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Emotion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Emotion::ALL
            .into_iter()
            .find(|e| e.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::Validation(format!("unknown emotion label {:?}", s)))
    }
}

/// Display color for a label; unknown labels get [`NEUTRAL_COLOR`].
pub fn color_for(label: &str) -> &'static str {
    label.parse::<Emotion>().map(Emotion::color).unwrap_or(NEUTRAL_COLOR)
}

/// Icon for a label; unknown labels get [`NEUTRAL_EMOJI`].
pub fn emoji_for(label: &str) -> &'static str {
    label.parse::<Emotion>().map(Emotion::emoji).unwrap_or(NEUTRAL_EMOJI)
}

#[derive(Debug, Clone, Serialize)]
pub struct EmotionInfo {
    pub emotion: Emotion,
    pub color: &'static str,
    pub emoji: &'static str,
}

/// Every label with its display properties.
pub fn emotion_info() -> Vec<EmotionInfo> {
    Emotion::ALL
        .into_iter()
        .map(|emotion| EmotionInfo {
            emotion,
            color: emotion.color(),
            emoji: emotion.emoji(),
        })
        .collect()
}

/// Probability distribution over [`Emotion::ALL`] for one clip.
#[derive(Debug, Clone, Serialize)]
pub struct EmotionResult {
    pub emotions: BTreeMap<Emotion, f32>,
    pub dominant_emotion: Emotion,
    pub confidence: f32,
    /// Seconds, measured on the normalized (padded) waveform.
    #[serde(rename = "audio_duration")]
    pub duration: f32,
    pub sample_rate: u32,
}

impl EmotionResult {
    pub fn color(&self) -> &'static str {
        self.dominant_emotion.color()
    }

    pub fn emoji(&self) -> &'static str {
        self.dominant_emotion.emoji()
    }

    pub fn probability(&self, emotion: Emotion) -> f32 {
        self.emotions.get(&emotion).copied().unwrap_or(0.0)
    }
}

/// Maps model features to one raw score per [`Emotion`], in label order.
///
/// Implementations are shared across worker threads and must not mutate
/// state during a forward pass.
pub trait EmotionModel: Send + Sync {
    fn logits(&self, features: &[f32]) -> Result<Vec<f32>>;
}

/// Zero-mean, unit-variance scaling of a 16 kHz waveform, as the wav2vec2
/// feature extractor does.
pub fn extract_features(waveform: &Waveform) -> Result<Vec<f32>> {
    if waveform.sample_rate() != SAMPLE_RATE {
        return Err(Error::Inference(format!(
            "model expects {}Hz audio, got {}Hz",
            SAMPLE_RATE,
            waveform.sample_rate()
        )));
    }
    let samples = waveform.samples();
    if samples.is_empty() {
        return Err(Error::Inference("empty waveform".into()));
    }

    let n = samples.len() as f64;
    let mean = samples.iter().map(|s| *s as f64).sum::<f64>() / n;
    let var = samples.iter().map(|s| (*s as f64 - mean).powi(2)).sum::<f64>() / n;
    let denom = (var + 1e-7).sqrt();
    Ok(samples
        .iter()
        .map(|s| ((*s as f64 - mean) / denom) as f32)
        .collect())
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Runs `model` over a normalized waveform.
pub fn classify(model: &dyn EmotionModel, waveform: &Waveform) -> Result<EmotionResult> {
    let features = extract_features(waveform)?;
    let logits = model.logits(&features)?;
    if logits.len() != Emotion::ALL.len() {
        return Err(Error::Inference(format!(
            "model produced {} scores, expected {}",
            logits.len(),
            Emotion::ALL.len()
        )));
    }
    if logits.iter().any(|l| !l.is_finite()) {
        return Err(Error::Inference("model produced non-finite scores".into()));
    }

    let probs = softmax(&logits);
    // Strict comparison keeps the earliest label on ties.
    let mut best = 0;
    for (i, p) in probs.iter().enumerate() {
        if *p > probs[best] {
            best = i;
        }
    }

    Ok(EmotionResult {
        emotions: Emotion::ALL.into_iter().zip(probs.iter().copied()).collect(),
        dominant_emotion: Emotion::ALL[best],
        confidence: probs[best],
        duration: waveform.duration(),
        sample_rate: waveform.sample_rate(),
    })
}

/// wav2vec2 sequence classifier exported to ONNX.
///
/// Input `[1, samples]` float features, output `[1, 8]` logits.
pub struct OnnxEmotionModel {
    model: TypedRunnableModel<TypedModel>,
}

impl OnnxEmotionModel {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let model = tract_onnx::onnx()
            // load the model
            .model_for_path(path)
            .and_then(|m| m.into_optimized())
            .and_then(|m| m.into_runnable())
            .map_err(|e| Error::ModelLoad(format!("{}: {:#}", path.display(), e)))?;
        Ok(Self { model })
    }
}

impl EmotionModel for OnnxEmotionModel {
    fn logits(&self, features: &[f32]) -> Result<Vec<f32>> {
        let input = Tensor::from_shape(&[1, features.len()], features)
            .map_err(|e| Error::Inference(format!("building input tensor: {:#}", e)))?;
        let out = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| Error::Inference(format!("forward pass: {:#}", e)))?
            .remove(0);
        let logits = out
            .as_slice::<f32>()
            .map_err(|e| Error::Inference(format!("reading logits: {:#}", e)))?;
        Ok(logits.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::{normalize, DecodedAudio};

    struct FixedLogits(Vec<f32>);

    impl EmotionModel for FixedLogits {
        fn logits(&self, _features: &[f32]) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn waveform(len: usize) -> Waveform {
        normalize(DecodedAudio {
            samples: (0..len).map(|i| (i as f32 * 0.01).sin()).collect(),
            channels: 1,
            sample_rate: SAMPLE_RATE,
        })
        .unwrap()
    }

    #[test]
    fn probabilities_form_a_distribution() {
        let model = FixedLogits(vec![2.0, -1.0, 0.5, 3.5, 0.0, 1.0, -4.0, 12.0]);
        let res = classify(&model, &waveform(20_000)).unwrap();

        assert_eq!(res.emotions.len(), 8);
        let sum: f32 = res.emotions.values().sum();
        assert!((sum - 1.0).abs() < 1e-4, "{}", sum);
        assert!(res.emotions.values().all(|p| *p >= 0.0));
        assert_eq!(res.dominant_emotion, Emotion::Surprised);
        assert_eq!(res.confidence, res.probability(Emotion::Surprised));
        assert_eq!(res.sample_rate, 16000);
        assert!((res.duration - 1.25).abs() < 1e-6);
    }

    #[test]
    fn ties_go_to_the_earliest_label() {
        let model = FixedLogits(vec![0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
        let res = classify(&model, &waveform(100)).unwrap();
        assert_eq!(res.dominant_emotion, Emotion::Calm);
    }

    #[test]
    fn wrong_arity_is_an_inference_error() {
        let model = FixedLogits(vec![1.0; 7]);
        assert!(matches!(
            classify(&model, &waveform(100)),
            Err(Error::Inference(_))
        ));
    }

    #[test]
    fn non_finite_scores_are_an_inference_error() {
        let mut logits = vec![0.0; 8];
        logits[3] = f32::NAN;
        assert!(matches!(
            classify(&FixedLogits(logits), &waveform(100)),
            Err(Error::Inference(_))
        ));
    }

    #[test]
    fn softmax_is_stable_for_large_scores() {
        let p = softmax(&[1000.0, 1000.0]);
        assert!((p[0] - 0.5).abs() < 1e-6);
        assert!((p[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn features_are_standardized() {
        let f = extract_features(&waveform(32_000)).unwrap();
        let mean = f.iter().sum::<f32>() / f.len() as f32;
        let var = f.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / f.len() as f32;
        assert!(mean.abs() < 1e-3);
        assert!((var - 1.0).abs() < 1e-2);
    }

    #[test]
    fn silence_does_not_blow_up() {
        let silent = normalize(DecodedAudio {
            samples: vec![0.0; 10],
            channels: 1,
            sample_rate: SAMPLE_RATE,
        })
        .unwrap();
        let f = extract_features(&silent).unwrap();
        assert!(f.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn lookups() {
        assert_eq!(color_for("angry"), "#ef4444");
        assert_eq!(emoji_for("sad"), "😢");
        assert_eq!(color_for("Happy"), "#f59e0b");
        assert_eq!(color_for("bored"), NEUTRAL_COLOR);
        assert_eq!(emoji_for(""), NEUTRAL_EMOJI);
        assert_eq!(emotion_info().len(), 8);
        assert_eq!(emotion_info()[7].emotion, Emotion::Surprised);
    }

    #[test]
    fn result_serializes_with_label_keys() {
        let res = classify(&FixedLogits(vec![0.0; 8]), &waveform(100)).unwrap();
        let json = serde_json::to_value(&res).unwrap();
        assert_eq!(json["dominant_emotion"], "angry");
        assert!(json["emotions"]["surprised"].is_number());
        assert_eq!(json["sample_rate"], 16000);
        assert_eq!(json["audio_duration"], 1.0);
    }

    #[test]
    fn missing_model_file_is_a_load_error() {
        assert!(matches!(
            OnnxEmotionModel::load("/nonexistent/emotion.onnx"),
            Err(Error::ModelLoad(_))
        ));
    }
}
