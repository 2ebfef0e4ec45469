//! ONNX Runtime session handling and per-capability inference.
//!
//! Preprocessing differs per engine family: the risk classifier takes
//! 224x224 inputs normalized to [-1, 1], the tagger takes 512x512 in [0, 1],
//! the face detector takes 320x240 with (p-127)/128, and the CLIP visual
//! encoder takes 224x224 with ImageNet statistics.

use anyhow::{anyhow, Result};
use image::DynamicImage;
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::collections::HashSet;
use std::path::Path;

use super::TagPrediction;
use crate::db::FaceBox;

/// One loaded ONNX session with its resolved input name.
pub struct OnnxEngine {
    session: Session,
    input_name: String,
}

impl OnnxEngine {
    pub fn load(model_path: &Path) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)?;
        let input_name = session
            .inputs()
            .first()
            .map(|input| input.name().to_string())
            .ok_or_else(|| anyhow!("model has no inputs: {}", model_path.display()))?;
        Ok(Self {
            session,
            input_name,
        })
    }
}

/// General and character tag vocabularies backing the tagger output layer.
pub struct TagVocabulary {
    tags: Vec<String>,
    characters: HashSet<String>,
}

impl TagVocabulary {
    /// Missing vocabulary files leave the tagger effectively disabled but
    /// are not fatal; the tags capability then yields empty output.
    pub fn load(tags_path: &Path, characters_path: &Path) -> Self {
        let tags = read_lines(tags_path);
        if tags.is_empty() {
            tracing::warn!(path = ?tags_path, "tag vocabulary not found or empty");
        }
        let characters: HashSet<String> = read_lines(characters_path).into_iter().collect();
        Self { tags, characters }
    }

    #[cfg(test)]
    pub fn from_lists(tags: Vec<String>, characters: Vec<String>) -> Self {
        Self {
            tags,
            characters: characters.into_iter().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|content| {
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn load_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|e| anyhow!("failed to load image: {}", e))
}

/// Build an NCHW tensor from an image with a per-channel-value transform.
fn nchw_tensor(
    img: &DynamicImage,
    width: u32,
    height: u32,
    normalize: impl Fn(u8, usize) -> f32,
) -> Result<Tensor<f32>> {
    let resized = img.resize_exact(width, height, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let mut array = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for y in 0..height as usize {
        for x in 0..width as usize {
            let pixel = rgb.get_pixel(x as u32, y as u32);
            for channel in 0..3 {
                array[[0, channel, y, x]] = normalize(pixel[channel], channel);
            }
        }
    }

    let shape = [1usize, 3, height as usize, width as usize];
    let (data, _offset) = array.into_raw_vec_and_offset();
    Ok(Tensor::from_array((shape, data.into_boxed_slice()))?)
}

/// Run the risk classifier. Output layout follows the binary classifier
/// convention: index 1 is the positive class when two logits are present.
pub fn predict_risk(engine: &mut OnnxEngine, image_path: &Path) -> Result<f64> {
    const INPUT_SIZE: u32 = 224;

    let img = load_image(image_path)?;
    let input = nchw_tensor(&img, INPUT_SIZE, INPUT_SIZE, |p, _| {
        (p as f32 / 255.0 - 0.5) / 0.5
    })?;

    let input_name = engine.input_name.clone();
    let outputs = engine.session.run(ort::inputs![input_name => input])?;
    let (_, output) = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("risk model produced no output"))?;
    let (_shape, data) = output.try_extract_tensor::<f32>()?;

    Ok(risk_from_scores(data))
}

/// Run the tagger and split predictions across the two vocabularies.
pub fn predict_tags(
    engine: &mut OnnxEngine,
    image_path: &Path,
    vocab: &TagVocabulary,
    threshold: f32,
) -> Result<TagPrediction> {
    const INPUT_SIZE: u32 = 512;

    if vocab.is_empty() {
        tracing::warn!("tag vocabulary empty, returning no tags");
        return Ok(TagPrediction::default());
    }

    let img = load_image(image_path)?;
    let input = nchw_tensor(&img, INPUT_SIZE, INPUT_SIZE, |p, _| p as f32 / 255.0)?;

    let input_name = engine.input_name.clone();
    let outputs = engine.session.run(ort::inputs![input_name => input])?;
    let (_, output) = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("tagger produced no output"))?;
    let (_shape, probs) = output.try_extract_tensor::<f32>()?;

    Ok(select_tags(probs, vocab, threshold))
}

/// Run the face detector (UltraFace-style scores/boxes outputs) and return
/// bounding boxes in original-image pixel coordinates.
pub fn predict_face_boxes(engine: &mut OnnxEngine, image_path: &Path) -> Result<Vec<FaceBox>> {
    const INPUT_WIDTH: u32 = 320;
    const INPUT_HEIGHT: u32 = 240;
    const CONFIDENCE_THRESHOLD: f32 = 0.7;
    const NMS_THRESHOLD: f32 = 0.3;

    let img = load_image(image_path)?;
    let (orig_width, orig_height) = (img.width() as f32, img.height() as f32);
    let input = nchw_tensor(&img, INPUT_WIDTH, INPUT_HEIGHT, |p, _| {
        (p as f32 - 127.0) / 128.0
    })?;

    let input_name = engine.input_name.clone();
    let outputs = engine.session.run(ort::inputs![input_name => input])?;

    let scores_value = outputs
        .get("scores")
        .ok_or_else(|| anyhow!("no scores output"))?;
    let boxes_value = outputs
        .get("boxes")
        .ok_or_else(|| anyhow!("no boxes output"))?;

    let (scores_shape, scores) = scores_value.try_extract_tensor::<f32>()?;
    let (_boxes_shape, boxes) = boxes_value.try_extract_tensor::<f32>()?;

    // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4]
    // normalized x1,y1,x2,y2.
    let num_anchors = scores_shape[1] as usize;
    let mut detected = Vec::new();
    for i in 0..num_anchors {
        let confidence = scores[i * 2 + 1];
        if confidence <= CONFIDENCE_THRESHOLD {
            continue;
        }
        detected.push(FaceBox {
            x1: (boxes[i * 4] * orig_width).max(0.0),
            y1: (boxes[i * 4 + 1] * orig_height).max(0.0),
            x2: boxes[i * 4 + 2] * orig_width,
            y2: boxes[i * 4 + 3] * orig_height,
            confidence: Some(confidence),
        });
    }

    Ok(nms(detected, NMS_THRESHOLD))
}

/// Run the CLIP visual encoder and return an L2-normalized embedding.
pub fn predict_embedding(engine: &mut OnnxEngine, image_path: &Path) -> Result<Vec<f32>> {
    const INPUT_SIZE: u32 = 224;

    // CLIP normalization constants (ImageNet stats)
    const MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
    const STD: [f32; 3] = [0.26862954, 0.26130258, 0.27577711];

    let img = load_image(image_path)?;
    let input = nchw_tensor(&img, INPUT_SIZE, INPUT_SIZE, |p, channel| {
        ((p as f32 / 255.0) - MEAN[channel]) / STD[channel]
    })?;

    let input_name = engine.input_name.clone();
    let outputs = engine.session.run(ort::inputs![input_name => input])?;
    let (_, output) = outputs
        .iter()
        .next()
        .ok_or_else(|| anyhow!("encoder produced no output"))?;
    let (_shape, data) = output.try_extract_tensor::<f32>()?;

    Ok(l2_normalize(data.to_vec()))
}

fn risk_from_scores(scores: &[f32]) -> f64 {
    let raw = if scores.len() > 1 {
        scores[1]
    } else {
        scores.first().copied().unwrap_or(0.0)
    };
    (raw as f64).clamp(0.0, 1.0)
}

fn select_tags(probs: &[f32], vocab: &TagVocabulary, threshold: f32) -> TagPrediction {
    let count = vocab.tags.len().min(probs.len());
    let mut prediction = TagPrediction::default();
    for index in 0..count {
        if probs[index] < threshold {
            continue;
        }
        let tag = &vocab.tags[index];
        if vocab.characters.contains(tag) {
            prediction.characters.push(tag.clone());
        } else {
            prediction.general.push(tag.clone());
        }
    }
    prediction
}

fn l2_normalize(embedding: Vec<f32>) -> Vec<f32> {
    let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        embedding.iter().map(|x| x / norm).collect()
    } else {
        embedding
    }
}

/// Non-maximum suppression on overlapping face boxes.
fn nms(mut boxes: Vec<FaceBox>, threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        let overlaps = keep
            .iter()
            .any(|kept| iou(kept, &candidate) > threshold);
        if !overlaps {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let intersection = ix * iy;
    let area_a = (a.x2 - a.x1).max(0.0) * (a.y2 - a.y1).max(0.0);
    let area_b = (b.x2 - b.x1).max(0.0) * (b.y2 - b.y1).max(0.0);
    let union = area_a + area_b - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_from_scores_prefers_positive_class() {
        assert!((risk_from_scores(&[0.3, 0.8]) - 0.8).abs() < 1e-6);
        assert_eq!(risk_from_scores(&[0.25]), 0.25);
        assert_eq!(risk_from_scores(&[]), 0.0);
        assert_eq!(risk_from_scores(&[0.0, 1.5]), 1.0);
    }

    #[test]
    fn test_select_tags_splits_vocabularies() {
        let vocab = TagVocabulary::from_lists(
            vec!["sky".into(), "alice".into(), "tree".into()],
            vec!["alice".into()],
        );
        let prediction = select_tags(&[0.9, 0.8, 0.1], &vocab, 0.5);
        assert_eq!(prediction.general, vec!["sky"]);
        assert_eq!(prediction.characters, vec!["alice"]);
    }

    #[test]
    fn test_select_tags_handles_probs_shorter_than_vocab() {
        let vocab = TagVocabulary::from_lists(vec!["a".into(), "b".into()], vec![]);
        let prediction = select_tags(&[0.9], &vocab, 0.5);
        assert_eq!(prediction.general, vec!["a"]);
    }

    #[test]
    fn test_l2_normalize() {
        let normalized = l2_normalize(vec![3.0, 4.0]);
        assert!((normalized[0] - 0.6).abs() < 1e-6);
        assert!((normalized[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_nms_drops_overlapping_lower_confidence() {
        let boxes = vec![
            FaceBox {
                x1: 0.0,
                y1: 0.0,
                x2: 10.0,
                y2: 10.0,
                confidence: Some(0.9),
            },
            FaceBox {
                x1: 1.0,
                y1: 1.0,
                x2: 11.0,
                y2: 11.0,
                confidence: Some(0.8),
            },
            FaceBox {
                x1: 50.0,
                y1: 50.0,
                x2: 60.0,
                y2: 60.0,
                confidence: Some(0.7),
            },
        ];
        let kept = nms(boxes, 0.3);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, Some(0.9));
        assert_eq!(kept[1].confidence, Some(0.7));
    }
}
