//! C3 Template Matcher: normalized correlation matching, with or without a
//! mask, plus non-overlapping multi-match. Grounded on
//! `original_source/SLGrobot/vision/template_matcher.py`.

use super::template_store::Template;
use super::BBox;
use opencv::core::{Mat, MatTraitConst, Point, Rect};
use opencv::imgproc;
use opencv::prelude::*;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct MatchResult {
    pub template_name: String,
    pub confidence: f32,
    pub bbox: BBox,
}

impl MatchResult {
    pub fn center(&self) -> (i32, i32) {
        self.bbox.center()
    }
}

pub struct TemplateMatcher;

impl TemplateMatcher {
    /// Single best match, or `None` if nothing clears `threshold`.
    pub fn best_match(frame: &Mat, template: &Template, threshold: f32) -> anyhow::Result<Option<MatchResult>> {
        let (result, method) = Self::correlate(frame, template)?;
        let mut min_val = 0.0;
        let mut max_val = 0.0;
        let mut min_loc = Point::default();
        let mut max_loc = Point::default();
        opencv::core::min_max_loc(
            &result,
            Some(&mut min_val),
            Some(&mut max_val),
            Some(&mut min_loc),
            Some(&mut max_loc),
            &opencv::core::no_array(),
        )?;
        let _ = (min_val, min_loc, method);
        if max_val < threshold as f64 {
            return Ok(None);
        }
        let tw = template.image.cols();
        let th = template.image.rows();
        let bbox = BBox::new(max_loc.x, max_loc.y, max_loc.x + tw, max_loc.y + th);
        Ok(Some(MatchResult {
            template_name: template.name.clone(),
            confidence: max_val as f32,
            bbox,
        }))
    }

    /// Up to `max_matches` non-overlapping matches, highest confidence first.
    /// Each accepted hit suppresses a half-template-size window around itself
    /// (spec §4.2) before the next argmax scan.
    pub fn multi_match(
        frame: &Mat,
        template: &Template,
        threshold: f32,
        max_matches: usize,
    ) -> anyhow::Result<Vec<MatchResult>> {
        let (mut result, _) = Self::correlate(frame, template)?;
        let tw = template.image.cols();
        let th = template.image.rows();
        let mut out = Vec::new();

        for _ in 0..max_matches {
            let mut max_val = 0.0;
            let mut max_loc = Point::default();
            opencv::core::min_max_loc(
                &result,
                None,
                Some(&mut max_val),
                None,
                Some(&mut max_loc),
                &opencv::core::no_array(),
            )?;
            if max_val < threshold as f64 {
                break;
            }
            let bbox = BBox::new(max_loc.x, max_loc.y, max_loc.x + tw, max_loc.y + th);
            out.push(MatchResult {
                template_name: template.name.clone(),
                confidence: max_val as f32,
                bbox,
            });

            let half_w = (tw / 2).max(1);
            let half_h = (th / 2).max(1);
            let rw = result.cols();
            let rh = result.rows();
            let x1 = (max_loc.x - half_w).max(0);
            let y1 = (max_loc.y - half_h).max(0);
            let x2 = (max_loc.x + half_w).min(rw - 1);
            let y2 = (max_loc.y + half_h).min(rh - 1);
            if x2 > x1 && y2 > y1 {
                let rect = Rect::new(x1, y1, x2 - x1, y2 - y1);
                let mut sub = Mat::roi(&result, rect)?;
                sub.set_to(&opencv::core::Scalar::all(-1.0), &opencv::core::no_array())?;
            }
        }
        trace!("multi_match({}) -> {} hits", template.name, out.len());
        Ok(out)
    }

    /// CCORR_NORMED with the template's mask when present (masked matching
    /// requires this method in OpenCV); CCOEFF_NORMED (mean-subtracted)
    /// otherwise.
    fn correlate(frame: &Mat, template: &Template) -> anyhow::Result<(Mat, i32)> {
        let mut result = Mat::default();
        let method = if template.mask.is_some() {
            imgproc::TM_CCORR_NORMED
        } else {
            imgproc::TM_CCOEFF_NORMED
        };
        match &template.mask {
            Some(mask) => {
                imgproc::match_template(
                    frame,
                    &template.image,
                    &mut result,
                    method,
                    mask,
                )?;
            }
            None => {
                imgproc::match_template(
                    frame,
                    &template.image,
                    &mut result,
                    method,
                    &opencv::core::no_array(),
                )?;
            }
        }
        Ok((result, method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suppression_window_is_half_template_dimensions() {
        // pure arithmetic check of the window calc used above, independent of opencv.
        let tw = 40;
        let th = 20;
        let max_loc = (100, 200);
        let half_w = (tw / 2).max(1);
        let half_h = (th / 2).max(1);
        assert_eq!(half_w, 20);
        assert_eq!(half_h, 10);
        let x1 = max_loc.0 - half_w;
        let y1 = max_loc.1 - half_h;
        let x2 = max_loc.0 + half_w;
        let y2 = max_loc.1 + half_h;
        assert_eq!((x1, y1, x2, y2), (80, 190, 120, 210));
    }
}
