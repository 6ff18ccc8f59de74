//! C14 Auto-Loop: the perceive-decide-act pipeline that drives the engine
//! when no operator command is active. Grounded on the numbered-step
//! structure of teacher's `main.rs` `heartbeat_tick()`, generalized to the
//! 15-step body of spec §4.11.

use crate::action::{Action, ActionPipeline};
use crate::building_finder::BuildingFinder;
use crate::config::Config;
use crate::device::DevicePort;
use crate::finger::FingerDetector;
use crate::game_profile::GameProfile;
use crate::quest_bar::QuestBarDetector;
use crate::scene::classifier::SceneClassifier;
use crate::scene::popup_filter::PopupFilter;
use crate::scene::Scene;
use crate::state::{GameState, StateTracker};
use crate::stuck::StuckRecovery;
use crate::vision::element_detector::ElementDetector;
use crate::vision::grid::GridOverlay;
use crate::vision::ocr::OcrPort;
use crate::vision::template_store::TemplateStore;
use crate::workflow::{QuestPhase, QuestWorkflow, WorkflowContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct AutoLoop {
    device: Arc<DevicePort>,
    templates: TemplateStore,
    ocr: Arc<OcrPort>,
    config: Config,
    profile: GameProfile,
    state: GameState,
    state_path: std::path::PathBuf,
    workflow: QuestWorkflow,
    stuck: StuckRecovery,
    scene_history: Vec<String>,
    consecutive_capture_failures: u32,
    consecutive_unknown: u32,
    consecutive_errors: u32,
}

impl AutoLoop {
    pub fn new(
        device: Arc<DevicePort>,
        templates: TemplateStore,
        ocr: Arc<OcrPort>,
        config: Config,
        profile: GameProfile,
    ) -> Self {
        let state_path = profile.state_file.clone();
        let state = std::fs::read_to_string(&state_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_else(|| GameState::new(profile.file.default_resources.clone()));

        let mut stuck_config = config.stuck.clone();
        stuck_config.game_package = Some(profile.file.package.clone());

        let mut workflow_config = config.quest_workflow.clone();
        if workflow_config.action_button_keywords.is_empty() {
            workflow_config.action_button_keywords = profile.file.action_button_texts.clone();
        }

        Self {
            device,
            templates,
            ocr,
            workflow: QuestWorkflow::new(workflow_config),
            stuck: StuckRecovery::new(stuck_config),
            profile,
            state,
            state_path,
            config,
            scene_history: Vec::new(),
            consecutive_capture_failures: 0,
            consecutive_unknown: 0,
            consecutive_errors: 0,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match self.tick().await {
                Ok(()) => self.consecutive_errors = 0,
                Err(e) => {
                    warn!("auto-loop tick error: {e}");
                    self.consecutive_errors += 1;
                    if self.consecutive_errors >= self.config.r#loop.consecutive_error_budget {
                        anyhow::bail!("consecutive error budget ({}) exhausted", self.config.r#loop.consecutive_error_budget);
                    }
                }
            }
            tokio::time::sleep(Duration::from_secs_f64(self.config.r#loop.interval_secs)).await;
        }
    }

    fn detector(&self) -> ElementDetector {
        ElementDetector {
            templates: &self.templates,
            ocr: Some(&self.ocr),
            grid: GridOverlay::new(self.config.screen.width as i32, self.config.screen.height as i32, self.config.grid.cols, self.config.grid.rows),
            match_threshold: self.config.templates.match_threshold,
        }
    }

    /// One perceive-decide-act cycle (spec §4.11).
    pub async fn tick(&mut self) -> anyhow::Result<()> {
        // 1. Reconnect if the device dropped.
        if !self.device.is_alive() {
            let reconnected = self.device.reconnect(self.config.device.reconnect_max_tries, Duration::from_secs_f64(self.config.device.reconnect_base_delay_secs));
            if !reconnected {
                anyhow::bail!("device reconnect exhausted its retries");
            }
        }

        // 2. Capture.
        let frame = match self.device.capture() {
            Ok(f) => {
                self.consecutive_capture_failures = 0;
                f
            }
            Err(e) => {
                self.consecutive_capture_failures += 1;
                if self.consecutive_capture_failures >= 3 {
                    self.device.reconnect(self.config.device.reconnect_max_tries, Duration::from_secs_f64(self.config.device.reconnect_base_delay_secs));
                }
                return Err(e.into());
            }
        };
        let mat = &frame.mat;

        // 3. Classify and record scene history.
        let classification = SceneClassifier { templates: &self.templates }.classify(mat)?;
        let scene = classification.scene;
        self.scene_history.push(scene.as_str().to_string());
        let history_cap = 2 * self.config.stuck.max_same_scene as usize;
        if self.scene_history.len() > history_cap {
            let excess = self.scene_history.len() - history_cap;
            self.scene_history.drain(0..excess);
        }

        // 4. Stuck recovery.
        if self.stuck.check(&self.scene_history) {
            self.stuck.recover(&self.device, self.config.screen.width as i32, self.config.screen.height as i32)?;
            self.scene_history.clear();
            return Ok(());
        }

        let detector = self.detector();

        // 5. Finger first, before the OCR-expensive state update.
        let finger = FingerDetector { templates: &self.templates, ccorr_min: self.config.finger.ccorr_min, ncc_min: self.config.finger.ncc_min }.detect(mat)?;
        if let Some(m) = finger {
            self.device.tap(m.fingertip.0, m.fingertip.1)?;
            let quest_bar = QuestBarDetector { templates: &self.templates, ocr: &self.ocr }.detect(mat)?;
            if quest_bar.has_tutorial_finger
                && matches!(
                    self.workflow.phase(),
                    QuestPhase::Idle | QuestPhase::EnsureMainCity | QuestPhase::ReadQuest | QuestPhase::ClickQuest
                )
            {
                if !self.workflow.is_active() {
                    self.workflow.start();
                }
                self.workflow.jump_to_execute_quest();
            }
            tokio::time::sleep(Duration::from_millis(1500)).await;
            self.stuck.reset();
            return Ok(());
        }
        self.stuck.reset();

        // 6. State tracker, only while in the main city.
        if scene == Scene::MainCity {
            StateTracker { ocr: &self.ocr, templates: &self.templates }.update(&mut self.state, mat, scene)?;
        }

        // 7. Scene-specific fast paths.
        match scene {
            Scene::ExitDialog => {
                if let Some(el) = detector.find_primary_button(mat)? {
                    let (x, y) = el.center();
                    self.device.tap(x, y)?;
                }
                tokio::time::sleep(Duration::from_secs(60)).await;
                return Ok(());
            }
            Scene::Hero | Scene::HeroRecruit => {
                self.device.key("KEYCODE_BACK")?;
                return Ok(());
            }
            Scene::HeroUpgrade => {
                if let Some(el) = detector.find_primary_button(mat)? {
                    if !detector.has_red_text_near(mat, &el.bbox)? {
                        let (x, y) = el.center();
                        self.device.tap(x, y)?;
                        return Ok(());
                    }
                }
                self.device.key("KEYCODE_BACK")?;
                return Ok(());
            }
            _ => {}
        }

        // 8. Popup outside an active workflow.
        if scene == Scene::Popup && !self.workflow.is_active() {
            let filter = PopupFilter { templates: &self.templates, ocr: Some(&self.ocr) };
            filter.dismiss(&self.device, mat).await?;
            return Ok(());
        }

        // 9. Story dialogue.
        if scene == Scene::StoryDialogue {
            let results = self.ocr.recognize(mat)?;
            if let Some(r) = results.iter().find(|r| r.text.contains("skip") || r.text.contains("跳过")) {
                self.device.tap(r.center().0, r.center().1)?;
            } else if let Some(t) = self.templates.get("icons/continue_triangle") {
                if let Some(m) = crate::vision::template_matcher::TemplateMatcher::best_match(mat, &t, 0.7)? {
                    let (x, y) = m.center();
                    self.device.tap(x, y)?;
                }
            } else {
                self.device.tap(mat.cols() / 2, mat.rows() / 2)?;
            }
            return Ok(());
        }

        // 10. Loading (possibly a misclassified reward popup).
        if scene == Scene::Loading {
            if let Some(el) = detector.find_primary_button(mat)? {
                let (x, y) = el.center();
                self.device.tap(x, y)?;
            } else {
                tokio::time::sleep(Duration::from_millis(800)).await;
            }
            return Ok(());
        }

        // 11. Active workflow drives the tick.
        if self.workflow.is_active() {
            let quest_bar = QuestBarDetector { templates: &self.templates, ocr: &self.ocr }.detect(mat)?;
            let ctx = WorkflowContext {
                frame: mat,
                scene,
                quest_bar: &quest_bar,
                detector: &detector,
                ocr: &self.ocr,
                quest_scripts: &self.profile.file.quest_scripts,
            };
            let actions = self.workflow.step(&ctx, &mut self.state.cooldowns)?;
            self.dispatch(&actions, mat, &detector).await?;
            self.persist_state()?;
            return Ok(());
        }

        // 12. Unknown scene cascade.
        if scene == Scene::Unknown {
            self.consecutive_unknown += 1;
            if let Some(t) = self.templates.get("icons/back_arrow") {
                if let Some(m) = crate::vision::template_matcher::TemplateMatcher::best_match(mat, &t, 0.7)? {
                    let (x, y) = m.center();
                    self.device.tap(x, y)?;
                    self.consecutive_unknown = 0;
                    return Ok(());
                }
            }
            if let Some(el) = detector.find_primary_button(mat)? {
                let (x, y) = el.center();
                self.device.tap(x, y)?;
                self.consecutive_unknown = 0;
                return Ok(());
            }
            if crate::scene::classifier::has_dark_overlay(mat)? {
                let filter = PopupFilter { templates: &self.templates, ocr: Some(&self.ocr) };
                if filter.dismiss(&self.device, mat).await? {
                    self.consecutive_unknown = 0;
                    return Ok(());
                }
            }
            if self.consecutive_unknown >= 3 {
                self.device.tap(500, 100)?;
                self.consecutive_unknown = 0;
            } else {
                self.device.tap(mat.cols() / 2, mat.rows() / 2)?;
            }
            return Ok(());
        }
        self.consecutive_unknown = 0;

        // 13. Start the quest workflow opportunistically.
        let quest_bar = QuestBarDetector { templates: &self.templates, ocr: &self.ocr }.detect(mat)?;
        if scene == Scene::MainCity
            && quest_bar.visible
            && self.workflow.should_start(&quest_bar.current_quest_text, &self.state.cooldowns, quest_bar.has_green_check)
        {
            self.workflow.start();
            return Ok(());
        }

        // 14. Nothing opportunistic configured beyond the quest workflow;
        // the LLM advisor seam (unimplemented in this crate) would plug in
        // here for auto-handler/rule-engine style opportunistic actions.

        // 15. Persist the snapshot.
        self.persist_state()?;
        Ok(())
    }

    async fn dispatch(&mut self, actions: &[Action], frame: &opencv::core::Mat, detector: &ElementDetector<'_>) -> anyhow::Result<()> {
        for action in actions {
            if let Action::FindBuilding { name } = action {
                let layout = self
                    .profile
                    .file
                    .city_layout
                    .iter()
                    .map(|(k, v)| (k.clone(), (v.0 as f64, v.1 as f64)))
                    .collect();
                let finder = BuildingFinder::new(
                    Arc::clone(&self.device),
                    Arc::clone(&self.ocr),
                    layout,
                    crate::building_finder::CityLayoutConfig::default(),
                );
                finder.find_and_tap(name, true, 5).await?;
                continue;
            }
            let pipeline = ActionPipeline {
                device: &self.device,
                detector,
                config: &self.config.action,
                screen_width: self.config.screen.width as i32,
                screen_height: self.config.screen.height as i32,
            };
            pipeline.run(action, frame, &mut self.state)?;
        }
        Ok(())
    }

    fn persist_state(&mut self) -> anyhow::Result<()> {
        self.state.quest_workflow_phase = self.workflow.phase().as_str().to_string();
        self.state.quest_workflow_target = self.workflow.target_quest_name().to_string();

        let json = serde_json::to_string_pretty(&self.state)?;
        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.state_path, json)?;
        Ok(())
    }
}
