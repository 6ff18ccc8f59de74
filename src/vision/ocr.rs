//! C4 OCR Port: text-region detection over a sub-image, backed by `ocrs`
//! (an ONNX-model-free-standing Rust OCR engine via `rten`), replacing the
//! original's RapidOCR/ONNXRuntime pipeline with the idiomatic Rust
//! equivalent used elsewhere in the retrieval pack.

use super::BBox;
use ocrs::{ImageSource, OcrEngine, OcrEngineParams};
use opencv::core::{Mat, MatTraitConst, Rect};
use opencv::prelude::*;
use rten::Model;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct OcrResult {
    pub text: String,
    pub confidence: f32,
    pub bbox: BBox,
}

impl OcrResult {
    pub fn center(&self) -> (i32, i32) {
        self.bbox.center()
    }
}

pub struct OcrPort {
    engine: Arc<OcrEngine>,
}

impl OcrPort {
    pub fn load(detection_model_path: &str, recognition_model_path: &str) -> anyhow::Result<Self> {
        let detection_model = Model::load_file(detection_model_path)?;
        let recognition_model = Model::load_file(recognition_model_path)?;
        let engine = OcrEngine::new(OcrEngineParams {
            detection_model: Some(detection_model),
            recognition_model: Some(recognition_model),
            ..Default::default()
        })?;
        Ok(Self {
            engine: Arc::new(engine),
        })
    }

    /// Run OCR over the full frame.
    pub fn recognize(&self, frame: &Mat) -> anyhow::Result<Vec<OcrResult>> {
        self.recognize_region(frame, &BBox::new(0, 0, frame.cols(), frame.rows()))
    }

    /// Run OCR over `region` of `frame`, translating result bboxes back into
    /// global frame coordinates (spec §4.5 step 3).
    pub fn recognize_region(&self, frame: &Mat, region: &BBox) -> anyhow::Result<Vec<OcrResult>> {
        if !region.is_valid() {
            return Ok(Vec::new());
        }
        let rect = Rect::new(
            region.x1,
            region.y1,
            region.width().min(frame.cols() - region.x1),
            region.height().min(frame.rows() - region.y1),
        );
        let sub = Mat::roi(frame, rect)?;
        let rgb = Self::to_rgb_bytes(&sub)?;
        let width = sub.cols() as u32;
        let height = sub.rows() as u32;
        let source = ImageSource::from_bytes(&rgb, (width, height))?;
        let ocr_input = self.engine.prepare_input(source)?;
        let word_rects = self.engine.detect_words(&ocr_input)?;
        let line_rects = self.engine.find_text_lines(&ocr_input, &word_rects);
        let lines = self.engine.recognize_text(&ocr_input, &line_rects)?;

        let mut out = Vec::new();
        for line in lines.into_iter().flatten() {
            let text = line.to_string();
            if text.trim().is_empty() {
                continue;
            }
            let r = line.rotated_rect().bounding_rect();
            let bbox = BBox::new(
                region.x1 + r.left() as i32,
                region.y1 + r.top() as i32,
                region.x1 + r.right() as i32,
                region.y1 + r.bottom() as i32,
            );
            let confidence = line
                .words()
                .map(|w| w.confidence())
                .fold(0.0_f32, f32::max);
            out.push(OcrResult {
                text,
                confidence,
                bbox,
            });
        }
        Ok(out)
    }

    fn to_rgb_bytes(mat: &Mat) -> anyhow::Result<Vec<u8>> {
        let mut rgb = Mat::default();
        opencv::imgproc::cvt_color(
            mat,
            &mut rgb,
            opencv::imgproc::COLOR_BGR2RGB,
            0,
            opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT,
        )
        .or_else(|_| {
            warn!("cvt_color with hint failed, retrying legacy signature");
            Err(anyhow::anyhow!("cvt_color failed"))
        })?;
        Ok(rgb.data_bytes()?.to_vec())
    }

    /// Apply configured OCR-correction substitutions (game-profile
    /// `ocr_corrections`) to a raw recognized string.
    pub fn apply_corrections(text: &str, corrections: &std::collections::HashMap<String, String>) -> String {
        let mut out = text.to_string();
        for (from, to) in corrections {
            out = out.replace(from.as_str(), to.as_str());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn apply_corrections_replaces_known_misreads() {
        let mut corrections = HashMap::new();
        corrections.insert("O".to_string(), "0".to_string());
        let corrected = OcrPort::apply_corrections("LV.O1", &corrections);
        assert_eq!(corrected, "LV.01");
    }
}
