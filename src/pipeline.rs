use crate::overlay::OverlayRenderer;
use crate::predictor::{PredictorError, TreePredictor};
use crate::prompt::Configuration;
use image::{codecs::jpeg::JpegEncoder, RgbImage};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("JPEG quality must be within 1..=100, got {0}")]
    InvalidQuality(u8),
    #[error("JPEG encoding failed: {0}")]
    Image(image::ImageError),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to decode frame: {0}")]
    Decode(image::ImageError),
    #[error("Failed to encode frame: {0}")]
    Encode(#[from] EncodeError),
    #[error("Predictor failed: {0}")]
    Predictor(#[from] PredictorError),
}

pub fn decode_frame(data: &[u8]) -> Result<RgbImage, PipelineError> {
    let image = image::load_from_memory(data).map_err(PipelineError::Decode)?;
    Ok(image.to_rgb8())
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, EncodeError> {
    if !(1..=100).contains(&quality) {
        return Err(EncodeError::InvalidQuality(quality));
    }
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    image
        .write_with_encoder(encoder)
        .map_err(EncodeError::Image)?;
    Ok(buf)
}

/// Decode, annotate and re-encode a single frame. Stateless between calls.
pub struct FramePipeline {
    predictor: Arc<dyn TreePredictor>,
    overlay: OverlayRenderer,
    quality: u8,
}

impl FramePipeline {
    pub fn new(predictor: Arc<dyn TreePredictor>, overlay: OverlayRenderer, quality: u8) -> Self {
        Self {
            predictor,
            overlay,
            quality,
        }
    }

    pub fn predictor(&self) -> &Arc<dyn TreePredictor> {
        &self.predictor
    }

    /// Without a configuration the frame is only re-encoded.
    pub fn process(
        &self,
        data: &[u8],
        configuration: Option<&Configuration>,
    ) -> Result<Vec<u8>, PipelineError> {
        let mut image = decode_frame(data)?;

        if let Some(configuration) = configuration {
            let tree = configuration.tree();
            let detections = self.predictor.detect(
                &image,
                tree,
                configuration.clip_encodings(),
                configuration.owl_encodings(),
            )?;
            tracing::debug!(
                "Drawing {} detections on {}x{} frame",
                detections.detections.len(),
                image.width(),
                image.height()
            );
            self.overlay.render(&mut image, &detections, tree);
        }

        Ok(encode_jpeg(&image, self.quality)?)
    }
}
