use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tract_onnx::prelude::*;
use tracing::debug;

use crate::{Error, Result};

/// A detected face region in source-image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
}

impl FaceBox {
    fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn iou(&self, other: &FaceBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Finds faces in an image. The returned order is the order the encoder
/// trusts: it embeds the first region only.
pub trait FaceDetector: Send + Sync {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>>;
}

/// Turns a cropped face into a fixed-length embedding.
pub trait FaceEmbedder: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, face: &DynamicImage) -> Result<Vec<f64>>;
}

/// Embedding of a registered face plus where its source image was stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEncoding {
    pub vector: Vec<f64>,
    pub image_path: PathBuf,
}

/// Decodes a base64 image, optionally wrapped in a data URL.
pub fn decode_image(encoded: &str) -> Result<DynamicImage> {
    let payload = match encoded.find(',') {
        Some(idx) => &encoded[idx + 1..],
        None => encoded,
    };
    let payload: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if payload.is_empty() {
        return Err(Error::Decode("empty image payload".into()));
    }

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| Error::Decode(format!("invalid base64: {}", e)))?;
    image::load_from_memory(&bytes).map_err(|e| Error::Decode(format!("invalid image: {}", e)))
}

/// Cuts `face` out of `image`, clamped to the image bounds.
pub fn crop(image: &DynamicImage, face: &FaceBox) -> Result<DynamicImage> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let x1 = face.x.clamp(0.0, w);
    let y1 = face.y.clamp(0.0, h);
    let x2 = (face.x + face.width).clamp(0.0, w);
    let y2 = (face.y + face.height).clamp(0.0, h);
    let (cw, ch) = ((x2 - x1) as u32, (y2 - y1) as u32);
    if cw == 0 || ch == 0 {
        return Err(Error::Inference(format!("face box {:?} is outside the image", face)));
    }
    Ok(image.crop_imm(x1 as u32, y1 as u32, cw, ch))
}

/// Image → face embedding, with storage of registered source images.
pub struct FaceEncoder {
    detector: Arc<dyn FaceDetector>,
    embedder: Arc<dyn FaceEmbedder>,
    storage_dir: PathBuf,
}

impl FaceEncoder {
    pub fn new<P: Into<PathBuf>>(
        detector: Arc<dyn FaceDetector>,
        embedder: Arc<dyn FaceEmbedder>,
        storage_dir: P,
    ) -> Self {
        Self {
            detector,
            embedder,
            storage_dir: storage_dir.into(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    pub fn image_path_for(&self, user_id: u64) -> PathBuf {
        self.storage_dir.join(format!("face_{}.jpg", user_id))
    }

    /// Embedding of the first detected face, or `None` when there is no face.
    pub fn encode(&self, encoded_image: &str) -> Result<Option<Vec<f64>>> {
        let image = decode_image(encoded_image)?;
        self.encode_image(&image)
    }

    fn encode_image(&self, image: &DynamicImage) -> Result<Option<Vec<f64>>> {
        let faces = self.detector.detect(image)?;
        debug!(faces = faces.len(), "face detection done");
        let first = match faces.first() {
            Some(f) => f,
            None => return Ok(None),
        };

        let vector = self.embedder.embed(&crop(image, first)?)?;
        if vector.len() != self.embedder.dimension() {
            return Err(Error::Inference(format!(
                "embedding has {} values, expected {}",
                vector.len(),
                self.embedder.dimension()
            )));
        }
        Ok(Some(vector))
    }

    /// Encodes the image and, if it holds a face, writes a JPEG copy keyed by
    /// `user_id` into a temp file beside its final path. The copy only
    /// replaces the user's previous image once [`StagedImage::commit`] runs.
    pub fn encode_and_stage(
        &self,
        user_id: u64,
        encoded_image: &str,
    ) -> Result<Option<(FaceEncoding, StagedImage)>> {
        let image = decode_image(encoded_image)?;
        let vector = match self.encode_image(&image)? {
            Some(v) => v,
            None => return Ok(None),
        };

        fs::create_dir_all(&self.storage_dir)?;
        let mut file = tempfile::Builder::new()
            .prefix(&format!("face_{}.", user_id))
            .suffix(".jpg.tmp")
            .tempfile_in(&self.storage_dir)?;
        DynamicImage::ImageRgb8(image.to_rgb8())
            .write_to(&mut file, ImageFormat::Jpeg)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        let target = self.image_path_for(user_id);
        let encoding = FaceEncoding {
            vector,
            image_path: target.clone(),
        };
        Ok(Some((encoding, StagedImage { file, target })))
    }
}

/// A face image written next to its final path but not yet moved there.
/// Dropping it without committing deletes the temp file.
#[derive(Debug)]
pub struct StagedImage {
    file: NamedTempFile,
    target: PathBuf,
}

impl StagedImage {
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Atomically replaces the image at the final path.
    pub fn commit(self) -> Result<PathBuf> {
        let StagedImage { file, target } = self;
        file.persist(&target).map_err(|e| Error::Io(e.error))?;
        Ok(target)
    }
}

/// NCHW float tensor of an RGB image resized to `width` x `height`.
fn image_tensor(
    image: &DynamicImage,
    width: u32,
    height: u32,
    norm: impl Fn(u8) -> f32,
) -> Result<Tensor> {
    let rgb = image.resize_exact(width, height, FilterType::Triangle).to_rgb8();
    let (w, h) = (width as usize, height as usize);
    let mut data = vec![0f32; 3 * w * h];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * w + x as usize;
        for c in 0..3 {
            data[c * w * h + idx] = norm(pixel[c]);
        }
    }
    Tensor::from_shape(&[1, 3, h, w], &data)
        .map_err(|e| Error::Inference(format!("building image tensor: {:#}", e)))
}

/// Keeps the highest-scoring boxes, dropping any that overlap a kept box by
/// `iou_threshold` or more. Output is ordered by descending score.
pub fn non_max_suppression(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| k.iou(&candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

/// Detector settings for [`OnnxFaceDetector`].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Model input as `[width, height]`.
    pub input_size: [u32; 2],
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_size: [320, 240],
            confidence_threshold: 0.7,
            iou_threshold: 0.3,
        }
    }
}

/// UltraFace-style detector: outputs `scores [1, N, 2]` and
/// `boxes [1, N, 4]` with corners normalized to `0..1`.
pub struct OnnxFaceDetector {
    model: TypedRunnableModel<TypedModel>,
    cfg: DetectorConfig,
}

impl OnnxFaceDetector {
    pub fn load<P: AsRef<Path>>(path: P, cfg: DetectorConfig) -> Result<Self> {
        let path = path.as_ref();
        let [w, h] = cfg.input_size;
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|m| m.with_input_fact(0, f32::fact([1, 3, h as usize, w as usize]).into()))
            .and_then(|m| m.into_optimized())
            .and_then(|m| m.into_runnable())
            .map_err(|e| Error::ModelLoad(format!("{}: {:#}", path.display(), e)))?;
        Ok(Self { model, cfg })
    }
}

impl FaceDetector for OnnxFaceDetector {
    fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let [w, h] = self.cfg.input_size;
        let input = image_tensor(image, w, h, |p| (p as f32 - 127.0) / 128.0)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| Error::Inference(format!("face detection: {:#}", e)))?;
        if outputs.len() < 2 {
            return Err(Error::Inference("face detector must output scores and boxes".into()));
        }
        let read = |i: usize| {
            outputs[i]
                .as_slice::<f32>()
                .map_err(|e| Error::Inference(format!("reading detector output: {:#}", e)))
        };
        let (scores, corners) = (read(0)?, read(1)?);

        let (iw, ih) = (image.width() as f32, image.height() as f32);
        let boxes = scores
            .chunks_exact(2)
            .zip(corners.chunks_exact(4))
            .filter(|(s, _)| s[1] >= self.cfg.confidence_threshold)
            .map(|(s, c)| FaceBox {
                x: c[0] * iw,
                y: c[1] * ih,
                width: (c[2] - c[0]) * iw,
                height: (c[3] - c[1]) * ih,
                score: s[1],
            })
            .collect();

        Ok(non_max_suppression(boxes, self.cfg.iou_threshold))
    }
}

/// Face embedding network taking `[1, 3, S, S]` and producing `[1, D]`.
/// Outputs are L2-normalized.
pub struct OnnxFaceEmbedder {
    model: TypedRunnableModel<TypedModel>,
    input_size: u32,
    dim: usize,
}

impl OnnxFaceEmbedder {
    pub fn load<P: AsRef<Path>>(path: P, input_size: u32) -> Result<Self> {
        let path = path.as_ref();
        let s = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|m| m.with_input_fact(0, f32::fact([1, 3, s, s]).into()))
            .and_then(|m| m.into_optimized())
            .and_then(|m| m.into_runnable())
            .map_err(|e| Error::ModelLoad(format!("{}: {:#}", path.display(), e)))?;

        // Probe once to learn the embedding width.
        let mut out = Self {
            model,
            input_size,
            dim: 0,
        };
        let blank = DynamicImage::new_rgb8(input_size, input_size);
        out.dim = out
            .run(&blank)
            .map_err(|e| Error::ModelLoad(format!("{}: {}", path.display(), e)))?
            .len();
        if out.dim == 0 {
            return Err(Error::ModelLoad(format!("{}: empty embedding", path.display())));
        }
        Ok(out)
    }

    fn run(&self, face: &DynamicImage) -> Result<Vec<f64>> {
        let input = image_tensor(face, self.input_size, self.input_size, |p| p as f32 / 127.5 - 1.0)?;
        let out = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| Error::Inference(format!("face embedding: {:#}", e)))?
            .remove(0);
        let mut v: Vec<f64> = out
            .as_slice::<f32>()
            .map_err(|e| Error::Inference(format!("reading embedding: {:#}", e)))?
            .iter()
            .map(|x| *x as f64)
            .collect();

        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(v)
    }
}

impl FaceEmbedder for OnnxFaceEmbedder {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed(&self, face: &DynamicImage) -> Result<Vec<f64>> {
        self.run(face)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    /// Two-tone PNG, red on the left half and blue on the right.
    pub(crate) fn two_tone_png() -> String {
        let img = RgbImage::from_fn(64, 64, |x, _| {
            if x < 32 {
                Rgb([255, 0, 0])
            } else {
                Rgb([0, 0, 255])
            }
        });
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(buf)
    }

    /// Returns a fixed list of boxes.
    pub(crate) struct Boxes(pub Vec<FaceBox>);

    impl FaceDetector for Boxes {
        fn detect(&self, _image: &DynamicImage) -> Result<Vec<FaceBox>> {
            Ok(self.0.clone())
        }
    }

    /// Embeds a face as its mean RGB color.
    pub(crate) struct MeanColor;

    impl FaceEmbedder for MeanColor {
        fn dimension(&self) -> usize {
            3
        }

        fn embed(&self, face: &DynamicImage) -> Result<Vec<f64>> {
            let rgb = face.to_rgb8();
            let n = (rgb.width() * rgb.height()) as f64;
            let mut sum = [0f64; 3];
            for p in rgb.pixels() {
                for c in 0..3 {
                    sum[c] += p[c] as f64 / 255.0;
                }
            }
            Ok(sum.iter().map(|s| s / n).collect())
        }
    }

    pub(crate) fn left_box() -> FaceBox {
        FaceBox {
            x: 0.0,
            y: 0.0,
            width: 32.0,
            height: 64.0,
            score: 0.8,
        }
    }

    pub(crate) fn right_box() -> FaceBox {
        FaceBox {
            x: 32.0,
            y: 0.0,
            width: 32.0,
            height: 64.0,
            score: 0.99,
        }
    }

    #[test]
    fn data_url_header_is_stripped() {
        let plain = two_tone_png();
        let url = format!("data:image/png;base64,{}", plain);
        assert_eq!(decode_image(&url).unwrap().width(), 64);
        assert_eq!(decode_image(&plain).unwrap().height(), 64);
    }

    #[test]
    fn malformed_input_is_a_decode_error() {
        assert!(matches!(decode_image("data:image/png;base64,@@@@"), Err(Error::Decode(_))));
        let not_image = base64::engine::general_purpose::STANDARD.encode(b"hello there");
        assert!(matches!(decode_image(&not_image), Err(Error::Decode(_))));
        assert!(matches!(decode_image(""), Err(Error::Decode(_))));
    }

    #[test]
    fn no_face_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let enc = FaceEncoder::new(Arc::new(Boxes(vec![])), Arc::new(MeanColor), dir.path());
        assert_eq!(enc.encode(&two_tone_png()).unwrap(), None);
        assert!(enc.encode_and_stage(1, &two_tone_png()).unwrap().is_none());
        assert!(!enc.image_path_for(1).exists());
    }

    #[test]
    fn first_detection_is_embedded_not_the_best() {
        let dir = tempfile::tempdir().unwrap();
        // Left (red) first even though right scores higher.
        let enc = FaceEncoder::new(
            Arc::new(Boxes(vec![left_box(), right_box()])),
            Arc::new(MeanColor),
            dir.path(),
        );
        let v = enc.encode(&two_tone_png()).unwrap().unwrap();
        assert!((v[0] - 1.0).abs() < 1e-9);
        assert!(v[2].abs() < 1e-9);
    }

    #[test]
    fn committed_image_is_stored_by_user_id() {
        let dir = tempfile::tempdir().unwrap();
        let faces = dir.path().join("faces");
        let enc = FaceEncoder::new(Arc::new(Boxes(vec![right_box()])), Arc::new(MeanColor), &faces);
        let (face, staged) = enc.encode_and_stage(42, &two_tone_png()).unwrap().unwrap();
        assert_eq!(face.image_path, faces.join("face_42.jpg"));
        assert_eq!(staged.target(), face.image_path.as_path());
        assert!(!face.image_path.exists());
        assert_eq!(face.vector.len(), 3);

        assert_eq!(staged.commit().unwrap(), face.image_path);
        assert!(image::open(&face.image_path).is_ok());
        assert_eq!(fs::read_dir(&faces).unwrap().count(), 1);
    }

    #[test]
    fn dropped_stage_keeps_the_previous_image() {
        let dir = tempfile::tempdir().unwrap();
        let enc = FaceEncoder::new(Arc::new(Boxes(vec![left_box()])), Arc::new(MeanColor), dir.path());
        fs::write(enc.image_path_for(3), b"previous").unwrap();

        let (_, staged) = enc.encode_and_stage(3, &two_tone_png()).unwrap().unwrap();
        drop(staged);
        assert_eq!(fs::read(enc.image_path_for(3)).unwrap(), b"previous");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn storage_dir_that_is_a_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocked = dir.path().join("faces");
        fs::write(&blocked, b"not a dir").unwrap();
        let enc = FaceEncoder::new(Arc::new(Boxes(vec![left_box()])), Arc::new(MeanColor), &blocked);
        assert!(matches!(enc.encode_and_stage(1, &two_tone_png()), Err(Error::Io(_))));
    }

    #[test]
    fn crop_outside_image_fails() {
        let img = DynamicImage::new_rgb8(10, 10);
        let off = FaceBox {
            x: 20.0,
            y: 20.0,
            width: 5.0,
            height: 5.0,
            score: 1.0,
        };
        assert!(crop(&img, &off).is_err());
        let partly = FaceBox {
            x: 5.0,
            y: -3.0,
            width: 10.0,
            height: 6.0,
            score: 1.0,
        };
        let c = crop(&img, &partly).unwrap();
        assert_eq!((c.width(), c.height()), (5, 3));
    }

    #[test]
    fn nms_orders_by_score_and_drops_overlaps() {
        let a = FaceBox {
            x: 0.0,
            y: 0.0,
            width: 10.0,
            height: 10.0,
            score: 0.9,
        };
        let a_dup = FaceBox { x: 1.0, score: 0.95, ..a };
        let b = FaceBox {
            x: 50.0,
            y: 50.0,
            width: 10.0,
            height: 10.0,
            score: 0.8,
        };
        let kept = non_max_suppression(vec![b, a, a_dup], 0.3);
        assert_eq!(kept, vec![a_dup, b]);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = left_box();
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert_eq!(a.iou(&right_box()), 0.0);
    }
}
