//! C12 Quest-Script Runner: step-wise interpreter for the declarative
//! action-script mini-language. Grounded on spec §4.9/§6/§9; the untagged
//! "exactly one verb key alongside modifiers" shape is the same idea as the
//! teacher's own `flow.rs` `FlowAction` (`Simple(String) | Keyed(Map)`),
//! generalized to many verbs with typed positional args.

pub mod eval;

use crate::action::Action;
use crate::scene::Scene;
use crate::vision::element_detector::ElementDetector;
use crate::vision::ocr::OcrPort;
use crate::vision::BBox;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum StepVerb {
    TapXy { x: i32, y: i32 },
    TapText { text: String, nth: i32 },
    TapIcon { name: String, nth: i32 },
    Swipe { x1: i32, y1: i32, x2: i32, y2: i32, ms: u64 },
    WaitText { text: String },
    ReadText { x: i32, y: i32, var: String, w: i32, h: i32 },
    Eval { var: String, expr: String },
    EnsureMainCity { max_retries: u32 },
    EnsureWorldMap { max_retries: u32 },
    FindBuilding { name: String, scroll: bool, max_attempts: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub verb: StepVerb,
    pub delay: f64,
    pub repeat: u32,
    pub optional: bool,
    pub description: Option<String>,
    pub region: Option<BBox>,
    pub offset_x: i32,
    pub offset_y: i32,
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let obj = value.as_object().ok_or_else(|| de::Error::custom("step must be a JSON object"))?;

        let delay = obj.get("delay").and_then(|v| v.as_f64()).unwrap_or(1.0);
        let repeat = obj.get("repeat").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
        let optional = obj.get("optional").and_then(|v| v.as_bool()).unwrap_or(false);
        let description = obj.get("description").and_then(|v| v.as_str()).map(str::to_string);
        let region = obj.get("region").and_then(|v| v.as_array()).and_then(|a| {
            if a.len() == 4 {
                Some(BBox::new(
                    a[0].as_i64()? as i32,
                    a[1].as_i64()? as i32,
                    a[2].as_i64()? as i32,
                    a[3].as_i64()? as i32,
                ))
            } else {
                None
            }
        });
        let offset_x = obj.get("offset_x").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        let offset_y = obj.get("offset_y").and_then(|v| v.as_i64()).unwrap_or(0) as i32;

        const MODIFIER_KEYS: [&str; 6] =
            ["delay", "repeat", "optional", "description", "region", "offset_x", "offset_y"];
        let verb_entry = obj
            .iter()
            .find(|(k, _)| !MODIFIER_KEYS.contains(&k.as_str()))
            .ok_or_else(|| de::Error::custom("step has no verb key"))?;

        let verb = parse_verb(verb_entry.0, verb_entry.1).map_err(de::Error::custom)?;

        Ok(Step {
            verb,
            delay,
            repeat,
            optional,
            description,
            region,
            offset_x,
            offset_y,
        })
    }
}

fn parse_verb(key: &str, value: &serde_json::Value) -> Result<StepVerb, String> {
    let arr = value.as_array();
    let arg = |i: usize| -> Option<&serde_json::Value> { arr.and_then(|a| a.get(i)) };
    let as_i32 = |v: &serde_json::Value| v.as_i64().map(|i| i as i32);

    match key {
        "tap_xy" => Ok(StepVerb::TapXy {
            x: arg(0).and_then(as_i32).ok_or("tap_xy needs [x, y]")?,
            y: arg(1).and_then(as_i32).ok_or("tap_xy needs [x, y]")?,
        }),
        "tap_text" => {
            let (text, nth) = if let Some(s) = value.as_str() {
                (s.to_string(), 1)
            } else {
                let text = arg(0).and_then(|v| v.as_str()).ok_or("tap_text needs a string")?.to_string();
                let nth = arg(1).and_then(|v| v.as_i64()).unwrap_or(1) as i32;
                (text, nth)
            };
            Ok(StepVerb::TapText { text, nth })
        }
        "tap_icon" => {
            let name = arg(0).and_then(|v| v.as_str()).or_else(|| value.as_str()).ok_or("tap_icon needs a name")?.to_string();
            let nth = arg(1).and_then(|v| v.as_i64()).unwrap_or(1) as i32;
            Ok(StepVerb::TapIcon { name, nth })
        }
        "swipe" => Ok(StepVerb::Swipe {
            x1: arg(0).and_then(as_i32).ok_or("swipe needs 4-5 coords")?,
            y1: arg(1).and_then(as_i32).ok_or("swipe needs 4-5 coords")?,
            x2: arg(2).and_then(as_i32).ok_or("swipe needs 4-5 coords")?,
            y2: arg(3).and_then(as_i32).ok_or("swipe needs 4-5 coords")?,
            ms: arg(4).and_then(|v| v.as_u64()).unwrap_or(300),
        }),
        "wait_text" => {
            let text = value.as_str().or_else(|| arg(0).and_then(|v| v.as_str())).ok_or("wait_text needs a string")?;
            Ok(StepVerb::WaitText { text: text.to_string() })
        }
        "read_text" => Ok(StepVerb::ReadText {
            x: arg(0).and_then(as_i32).ok_or("read_text needs [x,y,var,w,h]")?,
            y: arg(1).and_then(as_i32).ok_or("read_text needs [x,y,var,w,h]")?,
            var: arg(2).and_then(|v| v.as_str()).ok_or("read_text needs a var name")?.to_string(),
            w: arg(3).and_then(as_i32).unwrap_or(200),
            h: arg(4).and_then(as_i32).unwrap_or(60),
        }),
        "eval" => Ok(StepVerb::Eval {
            var: arg(0).and_then(|v| v.as_str()).ok_or("eval needs [var, expr]")?.to_string(),
            expr: arg(1).and_then(|v| v.as_str()).ok_or("eval needs [var, expr]")?.to_string(),
        }),
        "ensure_main_city" => Ok(StepVerb::EnsureMainCity {
            max_retries: arg(0).and_then(|v| v.as_u64()).or_else(|| value.as_u64()).unwrap_or(10) as u32,
        }),
        "ensure_world_map" => Ok(StepVerb::EnsureWorldMap {
            max_retries: arg(0).and_then(|v| v.as_u64()).or_else(|| value.as_u64()).unwrap_or(10) as u32,
        }),
        "find_building" => {
            let name = arg(0).and_then(|v| v.as_str()).ok_or("find_building needs a name")?.to_string();
            let opts = arg(1).and_then(|v| v.as_object());
            let scroll = opts.and_then(|o| o.get("scroll")).and_then(|v| v.as_bool()).unwrap_or(true);
            let max_attempts = opts.and_then(|o| o.get("max_attempts")).and_then(|v| v.as_u64()).unwrap_or(3) as u32;
            Ok(StepVerb::FindBuilding { name, scroll, max_attempts })
        }
        other => Err(format!("unknown verb: {other}")),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestScript {
    #[serde(default)]
    pub name: Option<String>,
    pub pattern: String,
    pub steps: Vec<Step>,
}

/// Non-verb runtime context the runner needs each tick.
pub struct StepContext<'a> {
    pub detector: &'a ElementDetector<'a>,
    pub ocr: &'a OcrPort,
    pub frame: &'a opencv::core::Mat,
    pub scene: Scene,
}

#[derive(Debug, Clone)]
pub enum RunnerOutcome {
    /// Waiting for a condition; do nothing this tick.
    Wait,
    /// Actions to dispatch; advance once they're executed.
    Actions(Vec<Action>),
    /// Script finished.
    Done,
    /// Script gave up, with a reason.
    Aborted(String),
}

pub struct QuestScriptRunner {
    steps: Vec<Step>,
    index: usize,
    repeat_remaining: u32,
    vars: HashMap<String, String>,
    aborted: Option<String>,
    last_scene: Option<Scene>,
    nav_fail_count: u32,
}

impl QuestScriptRunner {
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            index: 0,
            repeat_remaining: 0,
            vars: HashMap::new(),
            aborted: None,
            last_scene: None,
            nav_fail_count: 0,
        }
    }

    pub fn load(&mut self, steps: Vec<Step>) {
        self.steps = steps;
        self.reset();
    }

    pub fn reset(&mut self) {
        self.index = 0;
        self.repeat_remaining = self.steps.first().map(|s| s.repeat).unwrap_or(0);
        self.vars.clear();
        self.aborted = None;
        self.nav_fail_count = 0;
    }

    pub fn is_done(&self) -> bool {
        self.aborted.is_none() && self.index >= self.steps.len()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.aborted.as_deref()
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.index)
    }

    pub fn execute_one(&mut self, ctx: &StepContext) -> anyhow::Result<RunnerOutcome> {
        if self.is_aborted() {
            return Ok(RunnerOutcome::Aborted(self.aborted.clone().unwrap()));
        }
        if self.is_done() {
            return Ok(RunnerOutcome::Done);
        }
        let step = self.steps[self.index].clone();
        let result = self.run_verb(&step, ctx)?;

        match result {
            VerbResult::Wait => {
                if step.optional {
                    self.advance();
                    return Ok(RunnerOutcome::Actions(Vec::new()));
                }
                Ok(RunnerOutcome::Wait)
            }
            VerbResult::Actions(actions) => {
                self.advance();
                Ok(RunnerOutcome::Actions(actions))
            }
            VerbResult::NoAdvance(actions) => Ok(RunnerOutcome::Actions(actions)),
            VerbResult::Abort(reason) => {
                self.aborted = Some(reason.clone());
                Ok(RunnerOutcome::Aborted(reason))
            }
        }
    }

    fn advance(&mut self) {
        if self.repeat_remaining > 1 {
            self.repeat_remaining -= 1;
            return;
        }
        self.index += 1;
        self.repeat_remaining = self.steps.get(self.index).map(|s| s.repeat).unwrap_or(0);
    }

    fn run_verb(&mut self, step: &Step, ctx: &StepContext) -> anyhow::Result<VerbResult> {
        use crate::vision::element_detector::LocateMethod;

        match &step.verb {
            StepVerb::TapXy { x, y } => Ok(VerbResult::Actions(vec![Action::Tap { x: *x, y: *y }])),
            StepVerb::TapText { text, nth } => {
                let region = step.region.clone();
                let results = match &region {
                    Some(r) => ctx.ocr.recognize_region(ctx.frame, r)?,
                    None => ctx.ocr.recognize(ctx.frame)?,
                };
                let mut matches: Vec<_> = results.into_iter().filter(|r| r.text.contains(text.as_str())).collect();
                matches.sort_by_key(|r| (r.bbox.y1, r.bbox.x1));
                let idx = if *nth >= 0 {
                    (*nth - 1).max(0) as usize
                } else {
                    (matches.len() as i32 + *nth).max(0) as usize
                };
                match matches.get(idx) {
                    Some(m) => {
                        let (cx, cy) = m.center();
                        Ok(VerbResult::Actions(vec![Action::Tap {
                            x: cx + step.offset_x,
                            y: cy + step.offset_y,
                        }]))
                    }
                    None => Ok(VerbResult::Wait),
                }
            }
            StepVerb::TapIcon { name, nth } => {
                let template = ctx
                    .detector
                    .templates
                    .get(name)
                    .or_else(|| ctx.detector.templates.get(&format!("icons/{name}")));
                let Some(template) = template else {
                    return Ok(VerbResult::Wait);
                };
                let mut matches = crate::vision::template_matcher::TemplateMatcher::multi_match(
                    ctx.frame,
                    &template,
                    ctx.detector.match_threshold,
                    10,
                )?;
                matches.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap());
                let idx = (*nth - 1).max(0) as usize;
                match matches.get(idx) {
                    Some(m) => {
                        let (cx, cy) = m.center();
                        Ok(VerbResult::Actions(vec![Action::Tap { x: cx, y: cy }]))
                    }
                    None => Ok(VerbResult::Wait),
                }
            }
            StepVerb::Swipe { x1, y1, x2, y2, ms } => Ok(VerbResult::Actions(vec![Action::Swipe {
                x1: *x1,
                y1: *y1,
                x2: *x2,
                y2: *y2,
                duration_ms: *ms,
            }])),
            StepVerb::WaitText { text } => {
                let results = ctx.ocr.recognize(ctx.frame)?;
                if results.iter().any(|r| r.text.contains(text.as_str())) {
                    Ok(VerbResult::Actions(Vec::new()))
                } else {
                    Ok(VerbResult::Wait)
                }
            }
            StepVerb::ReadText { x, y, var, w, h } => {
                let region = BBox::new(x - w / 2, y - h / 2, x + w / 2, y + h / 2);
                let results = ctx.ocr.recognize_region(ctx.frame, &region)?;
                let text: String = results.iter().map(|r| r.text.as_str()).collect::<Vec<_>>().join("");
                self.vars.insert(var.clone(), text);
                Ok(VerbResult::Actions(Vec::new()))
            }
            StepVerb::Eval { var, expr } => {
                match eval::eval_expr(expr, &self.vars) {
                    Ok(result) => {
                        self.vars.insert(var.clone(), result);
                        Ok(VerbResult::Actions(Vec::new()))
                    }
                    Err(e) => Ok(VerbResult::Abort(format!("eval error: {e}"))),
                }
            }
            StepVerb::EnsureMainCity { max_retries } => {
                self.ensure_scene(Scene::MainCity, Scene::WorldMap, *max_retries, ctx, LocateMethod::Template)
            }
            StepVerb::EnsureWorldMap { max_retries } => {
                self.ensure_scene(Scene::WorldMap, Scene::MainCity, *max_retries, ctx, LocateMethod::Template)
            }
            StepVerb::FindBuilding { name, .. } => {
                // Delegated to C19; the runner only emits a marker action,
                // the caller (workflow/auto-loop) is responsible for
                // invoking the building finder and feeding back a tap.
                Ok(VerbResult::Actions(vec![Action::FindBuilding { name: name.clone() }]))
            }
        }
    }

    fn ensure_scene(
        &mut self,
        target: Scene,
        other: Scene,
        max_retries: u32,
        ctx: &StepContext,
        _method: crate::vision::element_detector::LocateMethod,
    ) -> anyhow::Result<VerbResult> {
        if ctx.scene == target {
            self.nav_fail_count = 0;
            return Ok(VerbResult::Actions(Vec::new()));
        }
        if ctx.scene == Scene::Popup {
            // A popup may have been opened by a tutorial finger; let the
            // caller's normal popup handling deal with it first.
            return Ok(VerbResult::NoAdvance(Vec::new()));
        }

        self.nav_fail_count += 1;
        if self.nav_fail_count > max_retries {
            let reason = format!("ensure_scene({:?}) exceeded {max_retries} retries", target);
            return Ok(VerbResult::Abort(reason));
        }

        if ctx.scene == other {
            let nav_name = match target {
                Scene::MainCity => "nav_bar/territory",
                Scene::WorldMap => "nav_bar/world_map",
                _ => "nav_bar/territory",
            };
            if let Some(el) = ctx.detector.locate(ctx.frame, nav_name, &[crate::vision::element_detector::LocateMethod::Template])? {
                let (x, y) = el.center();
                return Ok(VerbResult::NoAdvance(vec![Action::Tap { x, y }]));
            }
        }

        if let Some(el) = ctx.detector.locate(ctx.frame, "back_arrow", &[crate::vision::element_detector::LocateMethod::Template])? {
            let (x, y) = el.center();
            return Ok(VerbResult::NoAdvance(vec![Action::Tap { x, y }]));
        }
        if let Some(el) = ctx.detector.locate(ctx.frame, "close_x", &[crate::vision::element_detector::LocateMethod::Template])? {
            let (x, y) = el.center();
            return Ok(VerbResult::NoAdvance(vec![Action::Tap { x, y }]));
        }

        if self.nav_fail_count >= 5 {
            return Ok(VerbResult::NoAdvance(vec![Action::Tap { x: 500, y: 600 }]));
        }

        Ok(VerbResult::NoAdvance(Vec::new()))
    }
}

impl Default for QuestScriptRunner {
    fn default() -> Self {
        Self::new()
    }
}

enum VerbResult {
    Wait,
    Actions(Vec<Action>),
    NoAdvance(Vec<Action>),
    Abort(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tap_xy_with_modifiers() {
        let json = r#"{ "tap_xy": [100, 200], "delay": 1.5, "description": "tap start" }"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(step.verb, StepVerb::TapXy { x: 100, y: 200 });
        assert_eq!(step.delay, 1.5);
        assert_eq!(step.description.as_deref(), Some("tap start"));
    }

    #[test]
    fn deserializes_wait_text_as_bare_string() {
        let json = r#"{ "wait_text": "战斗成功" }"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(step.verb, StepVerb::WaitText { text: "战斗成功".to_string() });
        assert_eq!(step.repeat, 1);
        assert!(!step.optional);
    }

    #[test]
    fn deserializes_find_building_with_options() {
        let json = r#"{ "find_building": ["兵营", {"scroll": true, "max_attempts": 3}] }"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(
            step.verb,
            StepVerb::FindBuilding { name: "兵营".to_string(), scroll: true, max_attempts: 3 }
        );
    }

    #[test]
    fn deserializes_eval_and_read_text() {
        let step: Step = serde_json::from_str(r#"{"eval": ["next", "{lvl} + 1"]}"#).unwrap();
        assert_eq!(step.verb, StepVerb::Eval { var: "next".into(), expr: "{lvl} + 1".into() });

        let step: Step = serde_json::from_str(r#"{"read_text": [540, 800, "lvl", 200, 60]}"#).unwrap();
        assert_eq!(step.verb, StepVerb::ReadText { x: 540, y: 800, var: "lvl".into(), w: 200, h: 60 });
    }

    #[test]
    fn runner_reset_restores_initial_state() {
        let mut runner = QuestScriptRunner::new();
        runner.load(vec![Step {
            verb: StepVerb::TapXy { x: 1, y: 2 },
            delay: 1.0,
            repeat: 2,
            optional: false,
            description: None,
            region: None,
            offset_x: 0,
            offset_y: 0,
        }]);
        runner.index = 1;
        runner.vars.insert("x".into(), "1".into());
        runner.reset();
        assert_eq!(runner.index, 0);
        assert!(runner.vars.is_empty());
        assert!(!runner.is_done());
    }

    #[test]
    fn unknown_verb_key_fails_to_deserialize() {
        let result: Result<Step, _> = serde_json::from_str(r#"{"fly_away": [1]}"#);
        assert!(result.is_err());
    }
}
