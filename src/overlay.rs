use crate::config::OverlayConfig;
use crate::predictor::{Detection, DetectionResult};
use crate::tree::Tree;
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::f32::consts::PI;
use std::path::PathBuf;
use thiserror::Error;

const TEXT_OFFSET_X: i32 = 8;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("Failed to read font file {path:?}: {source}")]
    FontRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid font file {0:?}")]
    InvalidFont(PathBuf),
}

/// `count` colors sampled evenly along a rainbow ramp, violet first and red last.
pub fn palette(count: usize) -> Vec<Rgb<u8>> {
    (0..count)
        .map(|i| {
            let x = if count > 1 {
                i as f32 / (count - 1) as f32
            } else {
                0.0
            };
            let red = (2.0 * x - 0.5).abs();
            let green = (PI * x).sin();
            let blue = (PI * x / 2.0).cos();
            Rgb([to_channel(red), to_channel(green), to_channel(blue)])
        })
        .collect()
}

fn to_channel(value: f32) -> u8 {
    (255.0 * value.clamp(0.0, 1.0)) as u8
}

struct LabelFont {
    font: FontVec,
    scale: PxScale,
}

pub struct OverlayRenderer {
    line_thickness: u32,
    num_colors: Option<usize>,
    font: Option<LabelFont>,
}

impl OverlayRenderer {
    pub fn new(config: &OverlayConfig) -> Result<Self, OverlayError> {
        let font = match (&config.font_path, config.draw_text) {
            (Some(path), true) => {
                let data = std::fs::read(path).map_err(|source| OverlayError::FontRead {
                    path: path.clone(),
                    source,
                })?;
                let font =
                    FontVec::try_from_vec(data).map_err(|_| OverlayError::InvalidFont(path.clone()))?;
                Some(LabelFont {
                    font,
                    scale: PxScale::from(config.font_scale),
                })
            }
            _ => None,
        };

        Ok(Self {
            line_thickness: config.line_thickness.max(1),
            num_colors: config.num_colors,
            font,
        })
    }

    pub fn colors_for(&self, tree: &Tree) -> Vec<Rgb<u8>> {
        palette(self.num_colors.unwrap_or(tree.label_count()).max(1))
    }

    pub fn render(&self, image: &mut RgbImage, result: &DetectionResult, tree: &Tree) {
        let colors = self.colors_for(tree);
        let color_of = |label: usize| colors[label % colors.len()];

        for detection in &result.detections {
            let Some(&first_label) = detection.labels.iter().min() else {
                continue;
            };
            let Some((x, y, width, height)) = clamp_box(detection, image.width(), image.height())
            else {
                continue;
            };

            for t in 0..self.line_thickness {
                let inner_width = width.saturating_sub(2 * t);
                let inner_height = height.saturating_sub(2 * t);
                if inner_width == 0 || inner_height == 0 {
                    break;
                }
                let rect = Rect::at((x + t) as i32, (y + t) as i32).of_size(inner_width, inner_height);
                draw_hollow_rect_mut(image, rect, color_of(first_label));
            }

            if let Some(font) = &self.font {
                let step = font.scale.y.ceil() as i32;
                let mut offset_y = self.line_thickness as i32 + 2;
                for &label in &detection.labels {
                    let Some(text) = tree.label(label) else {
                        continue;
                    };
                    draw_text_mut(
                        image,
                        color_of(label),
                        x as i32 + TEXT_OFFSET_X,
                        y as i32 + offset_y,
                        font.scale,
                        &font.font,
                        text,
                    );
                    offset_y += step;
                }
            }
        }
    }
}

/// Clips a detection box to the image, returning `(x, y, width, height)`.
fn clamp_box(detection: &Detection, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
    let [x1, y1, x2, y2] = detection.bbox;
    if !(x1.is_finite() && y1.is_finite() && x2.is_finite() && y2.is_finite()) {
        return None;
    }
    let x1 = x1.max(0.0).min(image_width as f32) as u32;
    let y1 = y1.max(0.0).min(image_height as f32) as u32;
    let x2 = x2.max(0.0).min(image_width as f32) as u32;
    let y2 = y2.max(0.0).min(image_height as f32) as u32;

    let width = x2.saturating_sub(x1);
    let height = y2.saturating_sub(y1);
    (width > 0 && height > 0).then_some((x1, y1, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BACKGROUND: Rgb<u8> = Rgb([10, 10, 10]);

    fn renderer() -> OverlayRenderer {
        OverlayRenderer::new(&OverlayConfig::default()).unwrap()
    }

    fn detection(bbox: [f32; 4], labels: Vec<usize>) -> Detection {
        Detection {
            id: 1,
            parent_id: Some(0),
            bbox,
            scores: vec![0.9; labels.len()],
            labels,
        }
    }

    #[test]
    fn test_palette_endpoints() {
        let colors = palette(5);
        assert_eq!(colors.len(), 5);
        assert_eq!(colors[0], Rgb([127, 0, 255]));
        assert_eq!(colors[4], Rgb([255, 0, 0]));
        assert_eq!(palette(1), vec![Rgb([127, 0, 255])]);
        assert_eq!(palette(5), colors);
    }

    #[test]
    fn test_render_draws_box_in_label_color() {
        let tree = Tree::from_prompt("[a cat, a dog]").unwrap();
        let mut image = RgbImage::from_pixel(50, 50, BACKGROUND);
        let result = DetectionResult {
            detections: vec![detection([10.0, 10.0, 40.0, 40.0], vec![2])],
        };

        renderer().render(&mut image, &result, &tree);

        let dog_color = palette(3)[2];
        assert_eq!(*image.get_pixel(10, 10), dog_color);
        assert_eq!(*image.get_pixel(12, 25), dog_color);
        assert_eq!(*image.get_pixel(13, 25), BACKGROUND);
        assert_eq!(*image.get_pixel(25, 25), BACKGROUND);
        assert_eq!(*image.get_pixel(5, 5), BACKGROUND);
    }

    #[test]
    fn test_render_clips_out_of_bounds_boxes() {
        let tree = Tree::from_prompt("[a cat]").unwrap();
        let mut image = RgbImage::from_pixel(20, 20, BACKGROUND);
        let result = DetectionResult {
            detections: vec![
                detection([-30.0, -30.0, 500.0, 500.0], vec![0]),
                detection([100.0, 100.0, 200.0, 200.0], vec![1]),
                detection([f32::NAN, 0.0, 5.0, 5.0], vec![1]),
                detection([0.0, 0.0, 5.0, 5.0], vec![]),
            ],
        };

        renderer().render(&mut image, &result, &tree);

        assert_eq!(*image.get_pixel(0, 0), palette(2)[0]);
        assert_eq!(*image.get_pixel(19, 19), palette(2)[0]);
        assert_eq!(*image.get_pixel(10, 10), BACKGROUND);
    }

    #[test]
    fn test_fixed_palette_size() {
        let config = OverlayConfig {
            num_colors: Some(8),
            ..OverlayConfig::default()
        };
        let renderer = OverlayRenderer::new(&config).unwrap();
        let tree = Tree::from_prompt("[a cat]").unwrap();
        assert_eq!(renderer.colors_for(&tree), palette(8));
    }

    #[test]
    fn test_missing_font_is_an_error() {
        let config = OverlayConfig {
            font_path: Some(PathBuf::from("/nonexistent/font.ttf")),
            ..OverlayConfig::default()
        };
        assert!(matches!(
            OverlayRenderer::new(&config),
            Err(OverlayError::FontRead { .. })
        ));
    }
}
