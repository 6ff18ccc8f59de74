//! C8 Quest-Bar Detector. Grounded on
//! `original_source/SLGrobot/vision/quest_bar_detector.py`.

use crate::vision::ocr::OcrPort;
use crate::vision::template_matcher::TemplateMatcher;
use crate::vision::template_store::TemplateStore;
use crate::vision::BBox;
use opencv::core::{Mat, MatTraitConst, Rect, Scalar};
use opencv::imgproc;
use opencv::prelude::*;

#[derive(Debug, Clone, Default)]
pub struct QuestBarInfo {
    pub visible: bool,
    pub scroll_center: Option<(i32, i32)>,
    pub scroll_bbox: Option<BBox>,
    pub has_red_badge: bool,
    pub current_quest_text: String,
    pub current_quest_bbox: Option<BBox>,
    pub has_green_check: bool,
    pub has_tutorial_finger: bool,
    pub tutorial_finger_center: Option<(i32, i32)>,
}

pub struct QuestBarDetector<'a> {
    pub templates: &'a TemplateStore,
    pub ocr: &'a OcrPort,
}

impl<'a> QuestBarDetector<'a> {
    pub fn detect(&self, frame: &Mat) -> anyhow::Result<QuestBarInfo> {
        let mut info = QuestBarInfo::default();
        let h = frame.rows();
        let w = frame.cols();

        let Some(scroll_template) = self.templates.get("icons/quest_scroll") else {
            return Ok(info);
        };
        let Some(m) = TemplateMatcher::best_match(frame, &scroll_template, 0.8)? else {
            return Ok(info);
        };
        let (_, cy) = m.center();
        let band_lo = (h as f32 * 0.82) as i32;
        let band_hi = (h as f32 * 0.92) as i32;
        if cy < band_lo || cy > band_hi {
            return Ok(info);
        }

        info.visible = true;
        info.scroll_center = Some(m.center());
        info.scroll_bbox = Some(m.bbox.clone());

        // Red badge: upper-right quadrant of the scroll bbox.
        let badge_w = (m.bbox.width() / 2).max(1);
        let badge_h = (m.bbox.height() / 2).max(1);
        let badge_rect = Rect::new(
            (m.bbox.x1 + m.bbox.width() / 2).min(w - 1),
            m.bbox.y1.max(0),
            badge_w.min(w - m.bbox.x1 - m.bbox.width() / 2).max(1),
            badge_h.min(h - m.bbox.y1).max(1),
        );
        if badge_rect.width > 0 && badge_rect.height > 0 {
            let sub = Mat::roi(frame, badge_rect)?;
            info.has_red_badge = count_hsv_in_range(&sub, &[(0, 120, 150, 10, 255, 255), (170, 120, 150, 180, 255, 255)])? >= 50;
        }

        // Quest text OCR: band to the right of the scroll icon.
        let pad = (m.bbox.height() / 4).max(1);
        let ox1 = m.bbox.x2.min(w);
        let oy1 = (m.bbox.y1 - pad).max(0);
        let ox2 = ((w as f32) * 0.9) as i32;
        let oy2 = (m.bbox.y2 + pad).min(h);
        if ox2 > ox1 && oy2 > oy1 {
            let region = BBox::new(ox1, oy1, ox2, oy2);
            let results = self.ocr.recognize_region(frame, &region)?;
            if let Some(best) = results.into_iter().max_by(|a, b| a.confidence.partial_cmp(&b.confidence).unwrap()) {
                info.current_quest_text = best.text;
                info.current_quest_bbox = Some(best.bbox);
            }
        }

        // Green check: to the right of the quest bbox, width ~2x bbox height.
        if let Some(qbbox) = &info.current_quest_bbox {
            let check_w = (qbbox.height() * 2).max(1);
            let gx1 = qbbox.x2.min(w - 1);
            let gx2 = (gx1 + check_w).min(w);
            if gx2 > gx1 {
                let rect = Rect::new(gx1, qbbox.y1.max(0), gx2 - gx1, qbbox.height().max(1).min(h - qbbox.y1.max(0)));
                if rect.width > 0 && rect.height > 0 {
                    let sub = Mat::roi(frame, rect)?;
                    info.has_green_check = count_hsv_in_range(&sub, &[(50, 100, 100, 85, 255, 255)])? >= 50;
                }
            }
        }

        // Tutorial finger: plain template match anywhere.
        if let Some(t) = self.templates.get("icons/tutorial_finger") {
            if let Some(fm) = TemplateMatcher::best_match(frame, &t, 0.8)? {
                info.has_tutorial_finger = true;
                info.tutorial_finger_center = Some(fm.center());
            }
        }

        Ok(info)
    }
}

/// Count pixels inside any of the given (h_lo, s_lo, v_lo, h_hi, s_hi, v_hi)
/// HSV ranges.
fn count_hsv_in_range(bgr: &Mat, ranges: &[(i32, i32, i32, i32, i32, i32)]) -> anyhow::Result<i32> {
    let mut hsv = Mat::default();
    imgproc::cvt_color(
        bgr,
        &mut hsv,
        imgproc::COLOR_BGR2HSV,
        0,
        opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;
    let mut total_mask = Mat::default();
    for (i, r) in ranges.iter().enumerate() {
        let mut mask = Mat::default();
        opencv::core::in_range(
            &hsv,
            &Scalar::new(r.0 as f64, r.1 as f64, r.2 as f64, 0.0),
            &Scalar::new(r.3 as f64, r.4 as f64, r.5 as f64, 0.0),
            &mut mask,
        )?;
        if i == 0 {
            total_mask = mask;
        } else {
            let mut combined = Mat::default();
            opencv::core::bitwise_or(&total_mask, &mask, &mut combined, &opencv::core::no_array())?;
            total_mask = combined;
        }
    }
    Ok(opencv::core::count_non_zero(&total_mask)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scroll_band_bounds_match_spec() {
        let h = 1920.0_f32;
        let lo = (h * 0.82) as i32;
        let hi = (h * 0.92) as i32;
        assert_eq!((lo, hi), (1574, 1766));
    }

    #[test]
    fn default_info_is_not_visible() {
        let info = QuestBarInfo::default();
        assert!(!info.visible);
        assert!(!info.has_green_check);
        assert!(info.current_quest_text.is_empty());
    }
}
