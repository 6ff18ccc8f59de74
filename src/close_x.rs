//! C10 Close-X Verifier: multi-candidate template match plus HSV red-pixel
//! verification to reject false positives. Grounded on spec §4.7.

use crate::vision::template_matcher::TemplateMatcher;
use crate::vision::template_store::TemplateStore;
use crate::vision::BBox;
use opencv::core::{Mat, MatTraitConst, Rect, Scalar};
use opencv::imgproc;
use opencv::prelude::*;

const MAX_CANDIDATES: usize = 50;

#[derive(Debug, Clone)]
pub struct CloseXMatch {
    pub bbox: BBox,
    pub red_opaque: f32,
    pub red_bg: f32,
}

pub struct CloseXVerifier<'a> {
    pub templates: &'a TemplateStore,
}

impl<'a> CloseXVerifier<'a> {
    pub fn verify(&self, frame: &Mat) -> anyhow::Result<Option<CloseXMatch>> {
        let Some(template) = self.templates.get("buttons/close_x") else {
            return Ok(None);
        };
        let candidates = TemplateMatcher::multi_match(frame, &template, 0.5, MAX_CANDIDATES)?;

        let w = frame.cols();
        let h = frame.rows();
        let top_35 = (h as f32 * 0.35) as i32;
        let right_55 = (w as f32 * 0.45) as i32;

        let mut best: Option<CloseXMatch> = None;
        for c in candidates {
            if c.bbox.y1 > top_35 || c.bbox.x1 < right_55 {
                continue;
            }
            let Some((red_opaque, red_bg)) = Self::red_fractions(frame, &c.bbox, template.mask.as_ref())? else {
                continue;
            };
            if red_opaque < 0.15 || red_bg > 0.30 {
                continue;
            }
            let score = red_opaque - red_bg;
            let candidate = CloseXMatch {
                bbox: c.bbox,
                red_opaque,
                red_bg,
            };
            let better = best
                .as_ref()
                .map(|b| score > (b.red_opaque - b.red_bg))
                .unwrap_or(true);
            if better {
                best = Some(candidate);
            }
        }
        Ok(best)
    }

    fn red_fractions(
        frame: &Mat,
        bbox: &BBox,
        mask: Option<&Mat>,
    ) -> anyhow::Result<Option<(f32, f32)>> {
        let x1 = bbox.x1.max(0);
        let y1 = bbox.y1.max(0);
        let x2 = bbox.x2.min(frame.cols());
        let y2 = bbox.y2.min(frame.rows());
        if x2 <= x1 || y2 <= y1 {
            return Ok(None);
        }
        let rect = Rect::new(x1, y1, x2 - x1, y2 - y1);
        let sub = Mat::roi(frame, rect)?;
        let mut hsv = Mat::default();
        imgproc::cvt_color(
            &sub,
            &mut hsv,
            imgproc::COLOR_BGR2HSV,
            0,
            opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;
        let mut red_lo = Mat::default();
        opencv::core::in_range(
            &hsv,
            &Scalar::new(0.0, 80.0, 80.0, 0.0),
            &Scalar::new(10.0, 255.0, 255.0, 0.0),
            &mut red_lo,
        )?;
        let mut red_hi = Mat::default();
        opencv::core::in_range(
            &hsv,
            &Scalar::new(170.0, 80.0, 80.0, 0.0),
            &Scalar::new(180.0, 255.0, 255.0, 0.0),
            &mut red_hi,
        )?;
        let mut red = Mat::default();
        opencv::core::bitwise_or(&red_lo, &red_hi, &mut red, &opencv::core::no_array())?;

        let Some(mask) = mask else {
            let total = (rect.width * rect.height).max(1) as f32;
            let count = opencv::core::count_non_zero(&red)? as f32;
            return Ok(Some((count / total, 0.0)));
        };
        let mask_rect = Rect::new(0, 0, rect.width.min(mask.cols()), rect.height.min(mask.rows()));
        let mask_sub = Mat::roi(mask, mask_rect)?;
        let mut inv_mask = Mat::default();
        opencv::core::bitwise_not(&mask_sub, &mut inv_mask, &opencv::core::no_array())?;

        let mut red_opaque_mat = Mat::default();
        opencv::core::bitwise_and(&red, &mask_sub, &mut red_opaque_mat, &opencv::core::no_array())?;
        let mut red_bg_mat = Mat::default();
        opencv::core::bitwise_and(&red, &inv_mask, &mut red_bg_mat, &opencv::core::no_array())?;

        let opaque_total = opencv::core::count_non_zero(&mask_sub)?.max(1) as f32;
        let bg_total = opencv::core::count_non_zero(&inv_mask)?.max(1) as f32;
        let red_opaque = opencv::core::count_non_zero(&red_opaque_mat)? as f32 / opaque_total;
        let red_bg = opencv::core::count_non_zero(&red_bg_mat)? as f32 / bg_total;
        Ok(Some((red_opaque, red_bg)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acceptance_rule_matches_spec_thresholds() {
        let accept = |red_opaque: f32, red_bg: f32| red_opaque >= 0.15 && red_bg <= 0.30;
        assert!(!accept(0.94, 0.74));
        assert!(accept(0.84, 0.03));
    }

    #[test]
    fn score_maximizes_opaque_minus_background() {
        let score = |ro: f32, rb: f32| ro - rb;
        assert!(score(0.84, 0.03) > score(0.20, 0.10));
    }
}
