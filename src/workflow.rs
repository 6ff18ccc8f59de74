//! C13 Quest Workflow: the IDLE → ... → VERIFY state machine that drives one
//! quest at a time across auto-loop iterations. Grounded on
//! `original_source/SLGrobot/brain/quest_workflow.py`.

use crate::action::Action;
use crate::quest_bar::QuestBarInfo;
use crate::quest_script::{QuestScript, QuestScriptRunner, RunnerOutcome, StepContext};
use crate::scene::popup_filter::{PopupDismissal, PopupFilter};
use crate::scene::Scene;
use crate::vision::element_detector::ElementDetector;
use crate::vision::ocr::OcrPort;
use chrono::Utc;
use opencv::core::{Mat, MatTraitConst};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::warn;

const CLOSE_DISMISS_TEXTS: [&str; 5] = ["返回领地", "返回", "确定", "确认", "关闭"];
const REWARD_DISMISS_TEXTS: [&str; 4] = ["领取", "确定", "确认", "关闭"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestPhase {
    Idle,
    EnsureMainCity,
    ReadQuest,
    ClickQuest,
    ExecuteQuest,
    ReturnToCity,
    CheckCompletion,
    ClaimReward,
    Verify,
}

impl QuestPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestPhase::Idle => "idle",
            QuestPhase::EnsureMainCity => "ensure_main_city",
            QuestPhase::ReadQuest => "read_quest",
            QuestPhase::ClickQuest => "click_quest",
            QuestPhase::ExecuteQuest => "execute_quest",
            QuestPhase::ReturnToCity => "return_to_city",
            QuestPhase::CheckCompletion => "check_completion",
            QuestPhase::ClaimReward => "claim_reward",
            QuestPhase::Verify => "verify",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestWorkflowConfig {
    #[serde(default = "default_max_execute_iterations")]
    pub max_execute_iterations: u32,
    #[serde(default = "default_max_check_retries")]
    pub max_check_retries: u32,
    #[serde(default = "default_max_verify_retries")]
    pub max_verify_retries: u32,
    #[serde(default = "default_exhaust_threshold")]
    pub action_button_exhaust_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: i64,
    #[serde(default)]
    pub action_button_keywords: Vec<String>,
}

fn default_max_execute_iterations() -> u32 {
    40
}
fn default_max_check_retries() -> u32 {
    3
}
fn default_max_verify_retries() -> u32 {
    3
}
fn default_exhaust_threshold() -> u32 {
    2
}
fn default_cooldown_secs() -> i64 {
    180
}

impl Default for QuestWorkflowConfig {
    fn default() -> Self {
        Self {
            max_execute_iterations: default_max_execute_iterations(),
            max_check_retries: default_max_check_retries(),
            max_verify_retries: default_max_verify_retries(),
            action_button_exhaust_threshold: default_exhaust_threshold(),
            cooldown_secs: default_cooldown_secs(),
            action_button_keywords: Vec::new(),
        }
    }
}

/// Everything `step()` needs about the current perception tick.
pub struct WorkflowContext<'a> {
    pub frame: &'a Mat,
    pub scene: Scene,
    pub quest_bar: &'a QuestBarInfo,
    pub detector: &'a ElementDetector<'a>,
    pub ocr: &'a OcrPort,
    pub quest_scripts: &'a [QuestScript],
}

pub struct QuestWorkflow {
    phase: QuestPhase,
    config: QuestWorkflowConfig,
    target_quest_name: String,
    execute_iterations: u32,
    check_retries: u32,
    verify_retries: u32,
    popup_back_count: u32,
    action_button_counts: HashMap<String, u32>,
    exhausted_buttons: HashSet<String>,
    last_execute_scene: Option<Scene>,
    script: QuestScriptRunner,
    script_active: bool,
}

impl QuestWorkflow {
    pub fn new(config: QuestWorkflowConfig) -> Self {
        Self {
            phase: QuestPhase::Idle,
            config,
            target_quest_name: String::new(),
            execute_iterations: 0,
            check_retries: 0,
            verify_retries: 0,
            popup_back_count: 0,
            action_button_counts: HashMap::new(),
            exhausted_buttons: HashSet::new(),
            last_execute_scene: None,
            script: QuestScriptRunner::new(),
            script_active: false,
        }
    }

    pub fn phase(&self) -> QuestPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase != QuestPhase::Idle
    }

    pub fn target_quest_name(&self) -> &str {
        &self.target_quest_name
    }

    /// Whether a fresh quest run of `quest_name` may begin: false within
    /// `cooldown_secs` of its last abort, unless a green check is already
    /// showing (nothing to cool down from in that case).
    pub fn should_start(&self, quest_name: &str, cooldowns: &HashMap<String, String>, has_green_check: bool) -> bool {
        if has_green_check {
            return true;
        }
        let Some(last) = cooldowns.get(quest_name) else {
            return true;
        };
        let Ok(last_ts) = chrono::DateTime::parse_from_rfc3339(last) else {
            return true;
        };
        let elapsed = Utc::now().signed_duration_since(last_ts).num_seconds();
        elapsed >= self.config.cooldown_secs
    }

    pub fn start(&mut self) {
        self.phase = QuestPhase::EnsureMainCity;
        self.reset_execute_state();
        self.check_retries = 0;
        self.verify_retries = 0;
    }

    /// Fast-forward an early-phase workflow straight to `ExecuteQuest` — the
    /// tutorial finger having opened a popup means the quest is already
    /// underway (spec §4.11 step 5).
    pub fn jump_to_execute_quest(&mut self) {
        if matches!(
            self.phase,
            QuestPhase::Idle | QuestPhase::EnsureMainCity | QuestPhase::ReadQuest | QuestPhase::ClickQuest
        ) {
            self.phase = QuestPhase::ExecuteQuest;
            self.reset_execute_state();
        }
    }

    /// Abort the active quest, recording a cooldown entry and returning to idle.
    pub fn abort(&mut self, reason: &str, cooldowns: &mut HashMap<String, String>) {
        warn!("quest workflow aborting '{}': {reason}", self.target_quest_name);
        if !self.target_quest_name.is_empty() {
            cooldowns.insert(self.target_quest_name.clone(), Utc::now().to_rfc3339());
        }
        self.phase = QuestPhase::Idle;
        self.target_quest_name.clear();
        self.script_active = false;
    }

    fn reset_execute_state(&mut self) {
        self.execute_iterations = 0;
        self.popup_back_count = 0;
        self.action_button_counts.clear();
        self.exhausted_buttons.clear();
        self.last_execute_scene = None;
        self.script_active = false;
    }

    pub fn step(&mut self, ctx: &WorkflowContext, cooldowns: &mut HashMap<String, String>) -> anyhow::Result<Vec<Action>> {
        match self.phase {
            QuestPhase::Idle => Ok(Vec::new()),
            QuestPhase::EnsureMainCity => self.step_ensure_main_city(ctx),
            QuestPhase::ReadQuest => self.step_read_quest(ctx, cooldowns),
            QuestPhase::ClickQuest => self.step_click_quest(ctx),
            QuestPhase::ExecuteQuest => self.step_execute_quest(ctx),
            QuestPhase::ReturnToCity => self.step_return_to_city(ctx),
            QuestPhase::CheckCompletion => self.step_check_completion(ctx, cooldowns),
            QuestPhase::ClaimReward => self.step_claim_reward(ctx),
            QuestPhase::Verify => self.step_verify(ctx, cooldowns),
        }
    }

    fn step_ensure_main_city(&mut self, ctx: &WorkflowContext) -> anyhow::Result<Vec<Action>> {
        if ctx.scene == Scene::Popup {
            // The tutorial finger may have opened a popup before we got here.
            self.phase = QuestPhase::ExecuteQuest;
            self.reset_execute_state();
            return Ok(Vec::new());
        }
        if ctx.scene == Scene::MainCity {
            self.phase = QuestPhase::ReadQuest;
            return Ok(Vec::new());
        }
        if let Some(el) = ctx.detector.find_primary_button(ctx.frame)? {
            let (x, y) = el.center();
            return Ok(vec![Action::Tap { x, y }]);
        }
        Ok(vec![Action::Key { code: "KEYCODE_BACK".to_string() }])
    }

    fn step_read_quest(&mut self, ctx: &WorkflowContext, cooldowns: &mut HashMap<String, String>) -> anyhow::Result<Vec<Action>> {
        if !ctx.quest_bar.visible {
            self.abort("quest bar not visible", cooldowns);
            return Ok(Vec::new());
        }
        if ctx.quest_bar.has_green_check {
            self.phase = QuestPhase::ClaimReward;
            return Ok(Vec::new());
        }
        self.target_quest_name = ctx.quest_bar.current_quest_text.clone();
        self.phase = QuestPhase::ClickQuest;
        Ok(Vec::new())
    }

    fn step_click_quest(&mut self, ctx: &WorkflowContext) -> anyhow::Result<Vec<Action>> {
        self.phase = QuestPhase::ExecuteQuest;
        self.reset_execute_state();
        if let Some(bbox) = &ctx.quest_bar.current_quest_bbox {
            let (x, y) = bbox.center();
            return Ok(vec![Action::Tap { x, y }]);
        }
        Ok(Vec::new())
    }

    fn step_execute_quest(&mut self, ctx: &WorkflowContext) -> anyhow::Result<Vec<Action>> {
        self.execute_iterations += 1;
        if self.execute_iterations > self.config.max_execute_iterations {
            self.phase = QuestPhase::ReturnToCity;
            return Ok(Vec::new());
        }

        if self.last_execute_scene != Some(ctx.scene) {
            self.exhausted_buttons.clear();
            self.action_button_counts.clear();
            self.last_execute_scene = Some(ctx.scene);
        }

        // Popup handling, stages A-D plus the back-count escalation ladder.
        if ctx.scene == Scene::Popup {
            if let Some(action) = self.dismiss_popup(ctx)? {
                return Ok(vec![action]);
            }
        } else {
            self.popup_back_count = 0;
        }

        if let Some((x, y)) = self.find_tutorial_finger(ctx)? {
            return Ok(vec![Action::Tap { x, y }]);
        }

        if ctx.scene == Scene::StoryDialogue {
            return Ok(vec![self.dismiss_story_dialogue(ctx)?]);
        }

        if ctx.scene == Scene::MainCity {
            self.phase = QuestPhase::CheckCompletion;
            return Ok(Vec::new());
        }

        if !self.script_active {
            self.try_load_quest_script(ctx);
        }
        if self.script_active {
            let step_ctx = StepContext {
                detector: ctx.detector,
                ocr: ctx.ocr,
                frame: ctx.frame,
                scene: ctx.scene,
            };
            match self.script.execute_one(&step_ctx)? {
                RunnerOutcome::Wait => return Ok(Vec::new()),
                RunnerOutcome::Actions(actions) => return Ok(actions),
                RunnerOutcome::Done => {
                    self.script_active = false;
                    self.phase = QuestPhase::ReturnToCity;
                    return Ok(Vec::new());
                }
                RunnerOutcome::Aborted(reason) => {
                    warn!("quest script aborted, falling back to generic handling: {reason}");
                    self.script_active = false;
                }
            }
        }

        if let Some(action) = self.find_action_button(ctx)? {
            return Ok(vec![action]);
        }

        let all_known_exhausted = !self.config.action_button_keywords.is_empty()
            && self
                .config
                .action_button_keywords
                .iter()
                .all(|k| self.exhausted_buttons.contains(k));
        if all_known_exhausted {
            self.phase = QuestPhase::ReturnToCity;
            return Ok(Vec::new());
        }

        let close_x = crate::close_x::CloseXVerifier { templates: ctx.detector.templates }.verify(ctx.frame)?;
        if let Some(close) = close_x {
            let (x, y) = close.bbox.center();
            return Ok(vec![Action::Tap { x, y }]);
        }

        Ok(vec![tap_frame_center(ctx.frame)])
    }

    fn try_load_quest_script(&mut self, ctx: &WorkflowContext) {
        let matched = ctx
            .quest_scripts
            .iter()
            .find(|s| s.name.as_deref() == Some(self.target_quest_name.as_str()))
            .or_else(|| {
                ctx.quest_scripts.iter().find(|s| {
                    regex::Regex::new(&s.pattern)
                        .map(|re| re.is_match(&self.target_quest_name))
                        .unwrap_or(false)
                })
            });
        if let Some(script) = matched {
            self.script.load(script.steps.clone());
            self.script_active = true;
        }
    }

    fn dismiss_popup(&mut self, ctx: &WorkflowContext) -> anyhow::Result<Option<Action>> {
        let filter = PopupFilter { templates: ctx.detector.templates, ocr: Some(ctx.ocr) };

        // Stage A requires the text to sit on a colored button, not body text.
        let ocr_results = ctx.ocr.recognize(ctx.frame)?;
        for text in CLOSE_DISMISS_TEXTS {
            if let Some(r) = ocr_results.iter().find(|r| r.text.contains(text)) {
                if ctx.detector.is_on_colored_button(ctx.frame, &r.bbox)? {
                    return Ok(Some(Action::Tap { x: r.center().0, y: r.center().1 }));
                }
            }
        }

        // Stage B: verified close-x.
        if let Some(m) = crate::close_x::CloseXVerifier { templates: ctx.detector.templates }.verify(ctx.frame)? {
            let (x, y) = m.bbox.center();
            return Ok(Some(Action::Tap { x, y }));
        }

        // Stage C: tutorial finger inside the popup (text is unreliable here).
        if let Some((x, y)) = self.find_tutorial_finger(ctx)? {
            return Ok(Some(Action::Tap { x, y }));
        }

        // Stage D: primary-button contour.
        if let Some(el) = ctx.detector.find_primary_button(ctx.frame)? {
            let (x, y) = el.center();
            return Ok(Some(Action::Tap { x, y }));
        }

        self.popup_back_count += 1;
        let w = ctx.frame.cols();
        let h = ctx.frame.rows();
        let action = if self.popup_back_count <= 2 {
            if let Some(bt) = ctx.detector.templates.get("icons/back_arrow") {
                if let Some(m) = crate::vision::template_matcher::TemplateMatcher::best_match(ctx.frame, &bt, 0.7)? {
                    let (x, y) = m.center();
                    Action::Tap { x, y }
                } else {
                    Action::Tap { x: w / 10, y: (h as f32 * 0.9) as i32 }
                }
            } else {
                Action::Tap { x: w / 10, y: (h as f32 * 0.9) as i32 }
            }
        } else if self.popup_back_count <= 4 {
            tap_frame_center(ctx.frame)
        } else {
            match filter.handle(ctx.frame)? {
                PopupDismissal::None => tap_frame_center(ctx.frame),
                PopupDismissal::OcrText(_, (x, y))
                | PopupDismissal::CloseTemplate(_, (x, y))
                | PopupDismissal::ButtonTemplate(_, (x, y))
                | PopupDismissal::DarkOverlayFallback((x, y)) => Action::Tap { x, y },
            }
        };
        Ok(Some(action))
    }

    fn find_tutorial_finger(&self, ctx: &WorkflowContext) -> anyhow::Result<Option<(i32, i32)>> {
        let detector = crate::finger::FingerDetector { templates: ctx.detector.templates, ccorr_min: 0.6, ncc_min: 0.45 };
        Ok(detector.detect(ctx.frame)?.map(|m| m.fingertip))
    }

    fn dismiss_story_dialogue(&self, ctx: &WorkflowContext) -> anyhow::Result<Action> {
        let results = ctx.ocr.recognize(ctx.frame)?;
        if let Some(r) = results.iter().find(|r| r.text.contains("skip") || r.text.contains("跳过")) {
            return Ok(Action::Tap { x: r.center().0, y: r.center().1 });
        }
        if let Some(t) = ctx.detector.templates.get("icons/continue_triangle") {
            if let Some(m) = crate::vision::template_matcher::TemplateMatcher::best_match(ctx.frame, &t, 0.7)? {
                let (x, y) = m.center();
                return Ok(Action::Tap { x, y });
            }
        }
        Ok(tap_frame_center(ctx.frame))
    }

    fn find_action_button(&mut self, ctx: &WorkflowContext) -> anyhow::Result<Option<Action>> {
        let results = ctx.ocr.recognize(ctx.frame)?;
        let h = ctx.frame.rows();

        for keyword in self.config.action_button_keywords.clone() {
            if self.exhausted_buttons.contains(&keyword) {
                continue;
            }
            // Strict pass: tight length bound and must sit on a colored button.
            let strict = results.iter().find(|r| {
                r.text.contains(keyword.as_str())
                    && r.text.chars().count() <= keyword.chars().count() + 4
                    && ctx.detector.is_on_colored_button(ctx.frame, &r.bbox).unwrap_or(false)
            });
            let chosen = strict.or_else(|| {
                results.iter().find(|r| {
                    r.text.contains(keyword.as_str())
                        && r.text.chars().count() <= keyword.chars().count() + 1
                        && r.center().1 > h / 2
                })
            });
            if let Some(r) = chosen {
                let count = self.action_button_counts.entry(keyword.clone()).or_insert(0);
                *count += 1;
                if *count > self.config.action_button_exhaust_threshold {
                    self.exhausted_buttons.insert(keyword);
                    continue;
                }
                let (x, y) = r.center();
                return Ok(Some(Action::Tap { x, y }));
            }
        }
        Ok(None)
    }

    fn step_return_to_city(&mut self, ctx: &WorkflowContext) -> anyhow::Result<Vec<Action>> {
        if ctx.scene == Scene::MainCity {
            self.phase = QuestPhase::CheckCompletion;
            return Ok(Vec::new());
        }
        if ctx.scene == Scene::Popup {
            if let Some(action) = self.dismiss_popup(ctx)? {
                return Ok(vec![action]);
            }
        }
        Ok(vec![Action::Key { code: "KEYCODE_BACK".to_string() }])
    }

    fn step_check_completion(&mut self, ctx: &WorkflowContext, cooldowns: &mut HashMap<String, String>) -> anyhow::Result<Vec<Action>> {
        if ctx.quest_bar.has_green_check {
            self.phase = QuestPhase::ClaimReward;
            return Ok(Vec::new());
        }
        self.check_retries += 1;
        if self.check_retries > self.config.max_check_retries {
            self.abort("quest never reached completion", cooldowns);
            return Ok(Vec::new());
        }
        self.phase = QuestPhase::ClickQuest;
        Ok(Vec::new())
    }

    fn step_claim_reward(&mut self, ctx: &WorkflowContext) -> anyhow::Result<Vec<Action>> {
        self.phase = QuestPhase::Verify;
        if let Some(bbox) = &ctx.quest_bar.current_quest_bbox {
            let (x, y) = bbox.center();
            return Ok(vec![Action::Tap { x, y }]);
        }
        Ok(Vec::new())
    }

    fn step_verify(&mut self, ctx: &WorkflowContext, cooldowns: &mut HashMap<String, String>) -> anyhow::Result<Vec<Action>> {
        if !ctx.quest_bar.visible {
            let results = ctx.ocr.recognize(ctx.frame)?;
            if let Some(r) = REWARD_DISMISS_TEXTS.iter().find_map(|t| results.iter().find(|r| r.text.contains(t))) {
                let (x, y) = r.center();
                return Ok(vec![Action::Tap { x, y }]);
            }
            self.phase = QuestPhase::Idle;
            self.target_quest_name.clear();
            return Ok(Vec::new());
        }

        if ctx.quest_bar.current_quest_text != self.target_quest_name {
            self.phase = QuestPhase::Idle;
            self.target_quest_name.clear();
            return Ok(Vec::new());
        }

        self.verify_retries += 1;
        if self.verify_retries > self.config.max_verify_retries {
            self.abort("reward claim did not change the quest name", cooldowns);
        }
        Ok(Vec::new())
    }
}

fn tap_frame_center(frame: &Mat) -> Action {
    Action::Tap { x: frame.cols() / 2, y: frame.rows() / 2 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_labels_match_lifecycle_names() {
        assert_eq!(QuestPhase::EnsureMainCity.as_str(), "ensure_main_city");
        assert_eq!(QuestPhase::CheckCompletion.as_str(), "check_completion");
    }

    #[test]
    fn starts_idle_and_start_moves_to_ensure_main_city() {
        let mut wf = QuestWorkflow::new(QuestWorkflowConfig::default());
        assert_eq!(wf.phase(), QuestPhase::Idle);
        assert!(!wf.is_active());
        wf.start();
        assert_eq!(wf.phase(), QuestPhase::EnsureMainCity);
        assert!(wf.is_active());
    }

    #[test]
    fn should_start_respects_cooldown_unless_green_check() {
        let wf = QuestWorkflow::new(QuestWorkflowConfig::default());
        let mut cooldowns = HashMap::new();
        cooldowns.insert("collect wood".to_string(), Utc::now().to_rfc3339());
        assert!(!wf.should_start("collect wood", &cooldowns, false));
        assert!(wf.should_start("collect wood", &cooldowns, true));
        assert!(wf.should_start("unrelated quest", &cooldowns, false));
    }

    #[test]
    fn should_start_allows_after_cooldown_elapses() {
        let wf = QuestWorkflow::new(QuestWorkflowConfig::default());
        let mut cooldowns = HashMap::new();
        let old = Utc::now() - chrono::Duration::seconds(200);
        cooldowns.insert("collect wood".to_string(), old.to_rfc3339());
        assert!(wf.should_start("collect wood", &cooldowns, false));
    }

    #[test]
    fn abort_records_cooldown_and_returns_to_idle() {
        let mut wf = QuestWorkflow::new(QuestWorkflowConfig::default());
        wf.start();
        wf.target_quest_name = "collect wood".to_string();
        let mut cooldowns = HashMap::new();
        wf.abort("timed out", &mut cooldowns);
        assert_eq!(wf.phase(), QuestPhase::Idle);
        assert!(cooldowns.contains_key("collect wood"));
    }
}
