//! C7 Scene Classifier: ordered, disjoint rules, first match wins. Grounded
//! on `original_source/SLGrobot/scene/classifier.py`.

use super::{ClassificationResult, Scene};
use crate::vision::template_matcher::TemplateMatcher;
use crate::vision::template_store::TemplateStore;
use opencv::core::{Mat, MatTraitConst, Rect, Scalar};
use opencv::imgproc;
use opencv::prelude::*;
use std::collections::HashMap;

/// Bottom-right corner region (fractional) used to disambiguate main-city
/// vs world-map via their respective nav-bar icons.
pub const CORNER_REGION: (f64, f64, f64, f64) = (0.78, 0.85, 1.0, 1.0);

pub struct SceneClassifier<'a> {
    pub templates: &'a TemplateStore,
}

impl<'a> SceneClassifier<'a> {
    pub fn classify(&self, frame: &Mat) -> anyhow::Result<ClassificationResult> {
        let mut scores: HashMap<Scene, f32> = HashMap::new();
        for s in [
            Scene::MainCity,
            Scene::WorldMap,
            Scene::Hero,
            Scene::HeroRecruit,
            Scene::HeroUpgrade,
            Scene::Battle,
            Scene::Popup,
            Scene::ExitDialog,
            Scene::Loading,
            Scene::StoryDialogue,
        ] {
            scores.insert(s, 0.0);
        }

        // 1. Popup: border/center luminance ratio.
        if has_dark_overlay(frame)? {
            let mut score = 0.7;
            if let Some(t) = self.templates.get("buttons/close_x") {
                if let Some(m) = TemplateMatcher::best_match(frame, &t, 0.8)? {
                    if m.confidence >= 0.8 {
                        score = score.max(0.9);
                    }
                }
            }
            scores.insert(Scene::Popup, score);
            return Ok(ClassificationResult {
                scene: Scene::Popup,
                scores,
            });
        }

        // 2. ExitDialog: template match in lower-center region.
        if let Some(t) = self.templates.get("scenes/exit_dialog") {
            let h = frame.rows();
            let w = frame.cols();
            let rect = Rect::new(w / 4, h * 3 / 4, w / 2, h / 4);
            if rect.width > 0 && rect.height > 0 {
                let sub = Mat::roi(frame, rect)?;
                if let Some(m) = TemplateMatcher::best_match(&sub, &t, 0.8)? {
                    if m.confidence >= 0.8 {
                        scores.insert(Scene::ExitDialog, m.confidence);
                        return Ok(ClassificationResult {
                            scene: Scene::ExitDialog,
                            scores,
                        });
                    }
                }
            }
        }

        // 3. Loading: global std-dev / mean thresholds.
        let (mean, stddev) = mean_stddev(frame)?;
        if stddev < 20.0 {
            scores.insert(Scene::Loading, 0.8);
            return Ok(ClassificationResult {
                scene: Scene::Loading,
                scores,
            });
        }
        if mean < 30.0 || mean > 240.0 {
            scores.insert(Scene::Loading, 0.6);
            return Ok(ClassificationResult {
                scene: Scene::Loading,
                scores,
            });
        }

        // 4. StoryDialogue: down-triangle continue icon.
        if let Some(t) = self.templates.get("icons/continue_triangle") {
            if let Some(m) = TemplateMatcher::best_match(frame, &t, 0.9)? {
                if m.confidence >= 0.9 {
                    scores.insert(Scene::StoryDialogue, m.confidence);
                    return Ok(ClassificationResult {
                        scene: Scene::StoryDialogue,
                        scores,
                    });
                }
            }
        }

        // 5. MainCity vs WorldMap: corner-region nav icons.
        let w = frame.cols();
        let h = frame.rows();
        let cx1 = (w as f64 * CORNER_REGION.0) as i32;
        let cy1 = (h as f64 * CORNER_REGION.1) as i32;
        let corner_rect = Rect::new(cx1, cy1, w - cx1, h - cy1);
        if corner_rect.width > 0 && corner_rect.height > 0 {
            let corner = Mat::roi(frame, corner_rect)?;
            let main_city_conf = self.match_in(&corner, "nav_bar/main_city_icon", 0.5)?;
            let world_map_conf = self.match_in(&corner, "nav_bar/world_map_icon", 0.5)?;
            if main_city_conf.is_some() || world_map_conf.is_some() {
                let mc = main_city_conf.unwrap_or(0.0);
                let wm = world_map_conf.unwrap_or(0.0);
                scores.insert(Scene::MainCity, mc);
                scores.insert(Scene::WorldMap, wm);
                let scene = if mc >= wm { Scene::MainCity } else { Scene::WorldMap };
                return Ok(ClassificationResult { scene, scores });
            }
        }

        // 6. Other scenes: full-screen scan of scenes/*.
        let mut best: Option<(Scene, f32)> = None;
        for name in self.templates.names_with_prefix("scenes/") {
            let scene = match name.as_str() {
                "scenes/hero" => Scene::Hero,
                "scenes/hero_recruit" => Scene::HeroRecruit,
                "scenes/hero_upgrade" => Scene::HeroUpgrade,
                "scenes/battle" => Scene::Battle,
                _ => continue,
            };
            if let Some(t) = self.templates.get(&name) {
                if let Some(m) = TemplateMatcher::best_match(frame, &t, 0.5)? {
                    scores.insert(scene, m.confidence);
                    if best.as_ref().map(|(_, c)| m.confidence > *c).unwrap_or(true) {
                        best = Some((scene, m.confidence));
                    }
                }
            }
        }
        if let Some((scene, _)) = best {
            return Ok(ClassificationResult { scene, scores });
        }

        Ok(ClassificationResult {
            scene: Scene::Unknown,
            scores,
        })
    }

    fn match_in(&self, region: &Mat, name: &str, threshold: f32) -> anyhow::Result<Option<f32>> {
        let Some(t) = self.templates.get(name) else {
            return Ok(None);
        };
        Ok(TemplateMatcher::best_match(region, &t, threshold)?.map(|m| m.confidence))
    }
}

/// Shared with `popup_filter::is_popup`: mean luminance of four 10% border
/// strips vs the central 50%x50% region; popup-like iff
/// `center_mean > 50 && border_mean < 0.5 * center_mean`.
pub fn has_dark_overlay(frame: &Mat) -> anyhow::Result<bool> {
    let mut gray = Mat::default();
    imgproc::cvt_color(
        frame,
        &mut gray,
        imgproc::COLOR_BGR2GRAY,
        0,
        opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;
    let w = gray.cols();
    let h = gray.rows();
    let bw = w / 10;
    let bh = h / 10;

    let top = Mat::roi(&gray, Rect::new(0, 0, w, bh.max(1)))?;
    let bottom = Mat::roi(&gray, Rect::new(0, (h - bh).max(0), w, bh.max(1)))?;
    let left = Mat::roi(&gray, Rect::new(0, 0, bw.max(1), h))?;
    let right = Mat::roi(&gray, Rect::new((w - bw).max(0), 0, bw.max(1), h))?;

    let border_mean = (mean_of(&top)? + mean_of(&bottom)? + mean_of(&left)? + mean_of(&right)?) / 4.0;

    let cw = w / 2;
    let ch = h / 2;
    let center = Mat::roi(&gray, Rect::new(w / 4, h / 4, cw, ch))?;
    let center_mean = mean_of(&center)?;

    Ok(center_mean > 50.0 && border_mean < center_mean * 0.5)
}

fn mean_of(mat: &Mat) -> anyhow::Result<f64> {
    let m = opencv::core::mean(mat, &opencv::core::no_array())?;
    Ok(m[0])
}

fn mean_stddev(frame: &Mat) -> anyhow::Result<(f64, f64)> {
    let mut gray = Mat::default();
    imgproc::cvt_color(
        frame,
        &mut gray,
        imgproc::COLOR_BGR2GRAY,
        0,
        opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;
    let mut mean = opencv::core::Scalar::default();
    let mut stddev = opencv::core::Scalar::default();
    opencv::core::mean_std_dev(&gray, &mut mean, &mut stddev, &opencv::core::no_array())?;
    let _ = Scalar::default();
    Ok((mean[0], stddev[0]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corner_region_fraction_matches_spec() {
        assert_eq!(CORNER_REGION, (0.78, 0.85, 1.0, 1.0));
    }
}
