//! C20 Popup Filter: shared stateless popup-dismiss ladder, used standalone
//! by the auto-loop (spec §4.11 step 8) and by the quest workflow's
//! ExecuteQuest/ReturnToCity escalation (spec §4.10). Grounded on
//! `original_source/SLGrobot/scene/popup_filter.py`.

use super::classifier::has_dark_overlay;
use crate::device::DevicePort;
use crate::vision::element_detector::ElementDetector;
use crate::vision::ocr::OcrPort;
use crate::vision::template_matcher::TemplateMatcher;
use crate::vision::template_store::TemplateStore;
use crate::vision::BBox;
use opencv::core::{Mat, MatTraitConst};
use opencv::prelude::*;

pub const CLOSE_TEMPLATES: [&str; 6] = [
    "buttons/close",
    "buttons/close_x",
    "buttons/x",
    "buttons/cancel",
    "buttons/confirm",
    "buttons/ok",
];

pub const CLOSE_TEXTS: [&str; 6] = ["返回领地", "领取", "返回", "关闭", "确定", "确认"];

#[derive(Debug, Clone)]
pub enum PopupDismissal {
    OcrText(String, (i32, i32)),
    CloseTemplate(String, (i32, i32)),
    ButtonTemplate(String, (i32, i32)),
    DarkOverlayFallback((i32, i32)),
    None,
}

pub struct PopupFilter<'a> {
    pub templates: &'a TemplateStore,
    pub ocr: Option<&'a OcrPort>,
}

impl<'a> PopupFilter<'a> {
    pub fn is_popup(&self, frame: &Mat) -> anyhow::Result<bool> {
        for name in CLOSE_TEMPLATES {
            if let Some(t) = self.templates.get(name) {
                if TemplateMatcher::best_match(frame, &t, 0.8)?.is_some() {
                    return Ok(true);
                }
            }
        }
        has_dark_overlay(frame)
    }

    /// Ordered dismissal strategy (spec §4.15). Returns which stage fired and
    /// where it tapped, or `None` if nothing applies.
    pub fn handle(&self, frame: &Mat) -> anyhow::Result<PopupDismissal> {
        // Stage 1: OCR text search, tried first because template matching
        // false-positives on unrelated chevrons/icons.
        if let Some(ocr) = self.ocr {
            let results = ocr.recognize(frame)?;
            for text in CLOSE_TEXTS {
                if let Some(r) = results.iter().find(|r| r.text.contains(text)) {
                    return Ok(PopupDismissal::OcrText(text.to_string(), r.center()));
                }
            }
        }

        let w = frame.cols();
        let h = frame.rows();

        // Stage 2: close template, position-validated to top 35% / right 55%.
        for name in CLOSE_TEMPLATES {
            if let Some(t) = self.templates.get(name) {
                if let Some(m) = TemplateMatcher::best_match(frame, &t, 0.8)? {
                    let (cx, cy) = m.center();
                    if cy as f32 > h as f32 * 0.35 || (cx as f32) < w as f32 * 0.45 {
                        continue;
                    }
                    return Ok(PopupDismissal::CloseTemplate(name.to_string(), (cx, cy)));
                }
            }
        }

        // Stage 3: any button/* template, preferring the upper-right quadrant.
        let mut candidates: Vec<(String, (i32, i32), bool)> = Vec::new();
        for name in self.templates.names_with_prefix("buttons/") {
            if let Some(t) = self.templates.get(&name) {
                if let Some(m) = TemplateMatcher::best_match(frame, &t, 0.8)? {
                    let (cx, cy) = m.center();
                    let upper_right = cx > w / 3 && cy < 2 * h / 3;
                    candidates.push((name, (cx, cy), upper_right));
                }
            }
        }
        candidates.sort_by_key(|(_, _, ur)| !*ur);
        if let Some((name, center, _)) = candidates.into_iter().next() {
            return Ok(PopupDismissal::ButtonTemplate(name, center));
        }

        // Stage 4: dark overlay but nothing tappable; tap outside popup area.
        if has_dark_overlay(frame)? {
            return Ok(PopupDismissal::DarkOverlayFallback((w / 20, h / 20)));
        }

        Ok(PopupDismissal::None)
    }

    pub async fn dismiss(&self, device: &DevicePort, frame: &Mat) -> anyhow::Result<bool> {
        let dismissal = self.handle(frame)?;
        match dismissal {
            PopupDismissal::OcrText(_, (x, y))
            | PopupDismissal::CloseTemplate(_, (x, y))
            | PopupDismissal::ButtonTemplate(_, (x, y))
            | PopupDismissal::DarkOverlayFallback((x, y)) => {
                device.tap(x, y)?;
                Ok(true)
            }
            PopupDismissal::None => Ok(false),
        }
    }

    pub fn is_on_colored_button(
        &self,
        detector: &ElementDetector,
        frame: &Mat,
        bbox: &BBox,
    ) -> anyhow::Result<bool> {
        detector.is_on_colored_button(frame, bbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_texts_and_templates_match_spec_lists() {
        assert_eq!(CLOSE_TEXTS, ["返回领地", "领取", "返回", "关闭", "确定", "确认"]);
        assert_eq!(
            CLOSE_TEMPLATES,
            [
                "buttons/close",
                "buttons/close_x",
                "buttons/x",
                "buttons/cancel",
                "buttons/confirm",
                "buttons/ok",
            ]
        );
    }
}
