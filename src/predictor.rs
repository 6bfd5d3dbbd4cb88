use crate::tree::{Tree, ROOT_LABEL};
use image::RgbImage;
use ndarray::{Array2, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PredictorError {
    #[error("{encoder} encodings do not match the tree labels")]
    EncodingMismatch { encoder: EncoderKind },
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// The two independent text encoders a configuration carries encodings for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderKind {
    Clip,
    Owl,
}

impl EncoderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderKind::Clip => "clip",
            EncoderKind::Owl => "owl",
        }
    }
}

impl std::fmt::Display for EncoderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One embedding row per tree label, in label order.
#[derive(Debug, Clone, PartialEq)]
pub struct TextEncodings {
    pub encoder: EncoderKind,
    pub labels: Vec<String>,
    pub embeddings: Array2<f32>,
}

impl TextEncodings {
    /// True when these encodings were computed from `tree`.
    pub fn matches(&self, tree: &Tree) -> bool {
        self.labels == tree.labels && self.embeddings.nrows() == tree.label_count()
    }

    pub fn embedding(&self, label: usize) -> Option<ArrayView1<'_, f32>> {
        (label < self.embeddings.nrows()).then(|| self.embeddings.row(label))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub id: usize,
    pub parent_id: Option<usize>,
    /// `[x1, y1, x2, y2]` in image pixels.
    pub bbox: [f32; 4],
    pub labels: Vec<usize>,
    pub scores: Vec<f32>,
}

impl Detection {
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self {
            id: 0,
            parent_id: None,
            bbox: [0.0, 0.0, width as f32, height as f32],
            labels: vec![ROOT_LABEL],
            scores: vec![1.0],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectionResult {
    pub detections: Vec<Detection>,
}

/// Model back end used by the frame pipeline.
///
/// Calls are synchronous and CPU-bound; callers run them on the blocking pool.
pub trait TreePredictor: Send + Sync + 'static {
    fn encode_text(&self, tree: &Tree, encoder: EncoderKind)
        -> Result<TextEncodings, PredictorError>;

    fn detect(
        &self,
        image: &RgbImage,
        tree: &Tree,
        clip_encodings: &TextEncodings,
        owl_encodings: &TextEncodings,
    ) -> Result<DetectionResult, PredictorError>;
}

/// Model-free predictor: hashed character trigram text encodings and a single
/// detection for the root label spanning the whole frame.
#[derive(Debug, Clone)]
pub struct FullFramePredictor {
    embedding_dim: usize,
}

impl FullFramePredictor {
    pub fn new(embedding_dim: usize) -> Self {
        Self {
            embedding_dim: embedding_dim.max(1),
        }
    }

    fn embed(&self, label: &str, encoder: EncoderKind) -> Vec<f32> {
        let mut row = vec![0.0f32; self.embedding_dim];
        let padded: Vec<char> = format!("  {}  ", label.to_lowercase()).chars().collect();
        for trigram in padded.windows(3) {
            let hash = fnv1a(encoder_seed(encoder), trigram);
            let index = (hash % self.embedding_dim as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            row[index] += sign;
        }

        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            row.iter_mut().for_each(|v| *v /= norm);
        }
        row
    }
}

impl TreePredictor for FullFramePredictor {
    fn encode_text(
        &self,
        tree: &Tree,
        encoder: EncoderKind,
    ) -> Result<TextEncodings, PredictorError> {
        let values: Vec<f32> = tree
            .labels
            .iter()
            .flat_map(|label| self.embed(label, encoder))
            .collect();
        let embeddings = Array2::from_shape_vec((tree.label_count(), self.embedding_dim), values)
            .map_err(|e| PredictorError::Inference(format!("invalid embedding shape: {}", e)))?;

        Ok(TextEncodings {
            encoder,
            labels: tree.labels.clone(),
            embeddings,
        })
    }

    fn detect(
        &self,
        image: &RgbImage,
        tree: &Tree,
        clip_encodings: &TextEncodings,
        owl_encodings: &TextEncodings,
    ) -> Result<DetectionResult, PredictorError> {
        for encodings in [clip_encodings, owl_encodings] {
            if !encodings.matches(tree) {
                return Err(PredictorError::EncodingMismatch {
                    encoder: encodings.encoder,
                });
            }
        }

        Ok(DetectionResult {
            detections: vec![Detection::full_frame(image.width(), image.height())],
        })
    }
}

fn encoder_seed(encoder: EncoderKind) -> u64 {
    match encoder {
        EncoderKind::Clip => 0xcbf2_9ce4_8422_2325,
        EncoderKind::Owl => 0x84222325_cbf29ce4,
    }
}

fn fnv1a(seed: u64, chars: &[char]) -> u64 {
    let mut hash = seed;
    for ch in chars {
        let mut buf = [0u8; 4];
        for byte in ch.encode_utf8(&mut buf).bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
    }
    hash
}
