//! C11 State Tracker + `GameState`: in-memory game state, refreshed each
//! loop iteration from OCR/template observations. Grounded on
//! `original_source/SLGrobot/state/game_state.py` and `state_tracker.py`.

use crate::quest_bar::{QuestBarDetector, QuestBarInfo};
use crate::vision::ocr::OcrPort;
use crate::vision::template_store::TemplateStore;
use crate::scene::Scene;
use chrono::Utc;
use opencv::core::{Mat, MatTraitConst};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildingState {
    pub name: String,
    #[serde(default = "default_level")]
    pub level: u32,
    #[serde(default)]
    pub upgrading: bool,
    #[serde(default)]
    pub finish_time: Option<String>,
}

fn default_level() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarchState {
    pub target: String,
    pub action: String,
    #[serde(default)]
    pub return_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub timestamp: String,
    pub action: String,
    pub scene: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameState {
    #[serde(default = "default_scene")]
    pub scene: String,
    pub resources: HashMap<String, i64>,
    #[serde(default)]
    pub buildings: HashMap<String, BuildingState>,
    #[serde(default)]
    pub troops_marching: Vec<MarchState>,
    #[serde(default)]
    pub task_queue: Vec<String>,
    #[serde(default)]
    pub last_actions: Vec<ActionRecord>,
    #[serde(default)]
    pub cooldowns: HashMap<String, String>,
    #[serde(default)]
    pub last_llm_consult: String,
    #[serde(default)]
    pub last_update: String,
    #[serde(default)]
    pub loop_count: u64,

    #[serde(default)]
    pub quest_bar_visible: bool,
    #[serde(default)]
    pub quest_bar_has_red_badge: bool,
    #[serde(default)]
    pub quest_bar_current_quest: String,
    #[serde(default)]
    pub quest_bar_has_green_check: bool,
    #[serde(default)]
    pub quest_bar_has_tutorial_finger: bool,

    #[serde(default = "default_phase")]
    pub quest_workflow_phase: String,
    #[serde(default)]
    pub quest_workflow_target: String,
}

fn default_scene() -> String {
    "unknown".to_string()
}

fn default_phase() -> String {
    "idle".to_string()
}

const MAX_ACTIONS: usize = 50;
const TRIM_TO: usize = 20;
const RESOURCE_ORDER: [&str; 4] = ["food", "wood", "stone", "gold"];

impl GameState {
    pub fn new(default_resources: HashMap<String, i64>) -> Self {
        let resources = if default_resources.is_empty() {
            RESOURCE_ORDER.iter().map(|k| (k.to_string(), 0)).collect()
        } else {
            default_resources
        };
        Self {
            scene: default_scene(),
            resources,
            buildings: HashMap::new(),
            troops_marching: Vec::new(),
            task_queue: Vec::new(),
            last_actions: Vec::new(),
            cooldowns: HashMap::new(),
            last_llm_consult: String::new(),
            last_update: String::new(),
            loop_count: 0,
            quest_bar_visible: false,
            quest_bar_has_red_badge: false,
            quest_bar_current_quest: String::new(),
            quest_bar_has_green_check: false,
            quest_bar_has_tutorial_finger: false,
            quest_workflow_phase: default_phase(),
            quest_workflow_target: String::new(),
        }
    }

    /// Appends an action record, keeping a bounded history: once it grows
    /// past `MAX_ACTIONS` the buffer is trimmed down to the last `TRIM_TO`
    /// entries rather than popping one at a time (spec §3).
    pub fn record_action(&mut self, action: impl Into<String>) {
        self.last_actions.push(ActionRecord {
            timestamp: Utc::now().to_rfc3339(),
            action: action.into(),
            scene: self.scene.clone(),
        });
        if self.last_actions.len() > MAX_ACTIONS {
            let drain_count = self.last_actions.len() - TRIM_TO;
            self.last_actions.drain(..drain_count);
        }
    }

    /// A separate, independent last-20 re-slice taken at serialization time:
    /// `last_actions` itself may hold up to `MAX_ACTIONS` between trims, but
    /// anything persisted or shown externally only ever exposes the tail.
    pub fn recent_actions(&self) -> &[ActionRecord] {
        let len = self.last_actions.len();
        &self.last_actions[len.saturating_sub(TRIM_TO)..]
    }

    pub fn summary_for_llm(&self) -> String {
        let mut lines = vec![format!("Scene: {}", self.scene)];

        let res_parts: Vec<String> = self
            .resources
            .iter()
            .filter(|(_, v)| **v > 0)
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if !res_parts.is_empty() {
            lines.push(format!("Resources: {}", res_parts.join(", ")));
        }

        if !self.buildings.is_empty() {
            let bld_parts: Vec<String> = self
                .buildings
                .values()
                .map(|b| {
                    let mut s = format!("{} Lv{}", b.name, b.level);
                    if b.upgrading {
                        s.push_str(&format!(" (upgrading, done {})", b.finish_time.as_deref().unwrap_or("?")));
                    }
                    s
                })
                .collect();
            lines.push(format!("Buildings: {}", bld_parts.join("; ")));
        }

        if !self.troops_marching.is_empty() {
            let march_parts: Vec<String> = self
                .troops_marching
                .iter()
                .map(|m| format!("{}->{} (ret {})", m.action, m.target, m.return_time))
                .collect();
            lines.push(format!("Marches: {}", march_parts.join("; ")));
        }

        if !self.task_queue.is_empty() {
            let shown: Vec<&String> = self.task_queue.iter().take(5).collect();
            lines.push(format!("Pending tasks: {}", shown.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")));
        }

        if self.quest_bar_visible {
            let mut quest_parts = vec![format!("quest='{}'", self.quest_bar_current_quest)];
            if self.quest_bar_has_red_badge {
                quest_parts.push("red_badge".to_string());
            }
            if self.quest_bar_has_green_check {
                quest_parts.push("green_check".to_string());
            }
            if self.quest_bar_has_tutorial_finger {
                quest_parts.push("tutorial_finger".to_string());
            }
            lines.push(format!("Quest bar: {}", quest_parts.join(", ")));
        }

        lines.push(format!(
            "Quest workflow: phase={}, target='{}'",
            self.quest_workflow_phase, self.quest_workflow_target
        ));

        lines.join("\n")
    }
}

static SUFFIX_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"([\d,.]+)\s*([KkMmBb])").unwrap());
static PLAIN_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"([\d,]+)").unwrap());

/// Parses "12,345", "1.2M", "500K", "1.5B" and plain digit strings. Returns
/// `None` for anything that doesn't contain a recognizable number.
pub fn parse_resource_number(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Some(captures) = SUFFIX_RE.captures(text) {
        let num_str = captures.get(1)?.as_str().replace(',', "");
        let num: f64 = num_str.parse().ok()?;
        let suffix = captures.get(2)?.as_str().to_ascii_uppercase();
        let multiplier = match suffix.as_str() {
            "K" => 1_000.0,
            "M" => 1_000_000.0,
            "B" => 1_000_000_000.0,
            _ => 1.0,
        };
        return Some((num * multiplier) as i64);
    }
    if let Some(captures) = PLAIN_RE.captures(text) {
        let num_str = captures.get(1)?.as_str().replace(',', "");
        return num_str.parse().ok();
    }
    None
}

pub struct StateTracker<'a> {
    pub ocr: &'a OcrPort,
    pub templates: &'a TemplateStore,
}

impl<'a> StateTracker<'a> {
    /// Refreshes `state` from `frame` according to `scene` (spec §4.12).
    pub fn update(&self, state: &mut GameState, frame: &Mat, scene: Scene) -> anyhow::Result<()> {
        state.scene = scene.as_str().to_string();
        state.last_update = Utc::now().to_rfc3339();
        state.loop_count += 1;

        match scene {
            Scene::MainCity => {
                self.update_resources(state, frame)?;
                self.update_buildings(state, frame)?;
                let quest_bar = QuestBarDetector { templates: self.templates, ocr: self.ocr }.detect(frame)?;
                apply_quest_bar(state, &quest_bar);
            }
            Scene::WorldMap => self.update_marches(state, frame)?,
            Scene::Battle => self.update_battle_result(state, frame)?,
            _ => {}
        }
        debug!(scene = %state.scene, loop_count = state.loop_count, "state updated");
        Ok(())
    }

    fn update_resources(&self, state: &mut GameState, frame: &Mat) -> anyhow::Result<()> {
        let h = frame.rows();
        let w = frame.cols();
        let region = crate::vision::BBox::new(0, 0, w, (h as f32 * 0.08) as i32);
        let results = match self.ocr.recognize_region(frame, &region) {
            Ok(r) => r,
            Err(e) => {
                warn!("OCR failed for resource bar: {e}");
                return Ok(());
            }
        };

        const RESOURCE_KEYWORDS: [(&str, &[&str]); 4] = [
            ("food", &["食物", "粮食", "food"]),
            ("wood", &["木材", "木头", "wood"]),
            ("stone", &["石头", "石材", "stone"]),
            ("gold", &["金币", "金", "gold"]),
        ];

        for result in &results {
            let Some(value) = parse_resource_number(&result.text) else { continue };
            for (resource_name, keywords) in RESOURCE_KEYWORDS {
                if keywords.iter().any(|kw| result.text.to_lowercase().contains(&kw.to_lowercase())) {
                    state.resources.insert(resource_name.to_string(), value);
                }
            }
        }

        let mut numbers: Vec<(i32, i64)> = results
            .iter()
            .filter_map(|r| parse_resource_number(&r.text).filter(|v| *v > 0).map(|v| (r.center().0, v)))
            .collect();
        if numbers.len() >= 2 {
            numbers.sort_by_key(|(x, _)| *x);
            for (i, (_, value)) in numbers.iter().enumerate() {
                if let Some(name) = RESOURCE_ORDER.get(i) {
                    state.resources.insert(name.to_string(), *value);
                }
            }
        }
        Ok(())
    }

    fn update_buildings(&self, state: &mut GameState, frame: &Mat) -> anyhow::Result<()> {
        let all_text = match self.ocr.recognize(frame) {
            Ok(r) => r,
            Err(e) => {
                warn!("OCR failed for buildings: {e}");
                return Ok(());
            }
        };

        for result in &all_text {
            let Some(level) = extract_level(&result.text) else { continue };
            for other in &all_text {
                if std::ptr::eq(other, result) {
                    continue;
                }
                let dx = (other.center().0 - result.center().0).abs();
                let dy = (other.center().1 - result.center().1).abs();
                if dx < 200 && dy < 100 {
                    let building_name = other.text.trim();
                    if building_name.chars().count() > 1 {
                        let upgrading = result.text.contains("升级中") || result.text.to_lowercase().contains("upgrading");
                        state.buildings.insert(
                            building_name.to_string(),
                            BuildingState {
                                name: building_name.to_string(),
                                level,
                                upgrading,
                                finish_time: None,
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn update_marches(&self, state: &mut GameState, frame: &Mat) -> anyhow::Result<()> {
        let all_text = match self.ocr.recognize(frame) {
            Ok(r) => r,
            Err(e) => {
                warn!("OCR failed for marches: {e}");
                return Ok(());
            }
        };
        for result in &all_text {
            if let Some(captures) = TIME_RE.captures(&result.text) {
                debug!("march timer detected: {}", &captures[1]);
            }
        }
        let _ = state;
        Ok(())
    }

    fn update_battle_result(&self, state: &mut GameState, frame: &Mat) -> anyhow::Result<()> {
        let all_text = match self.ocr.recognize(frame) {
            Ok(r) => r,
            Err(e) => {
                warn!("OCR failed for battle result: {e}");
                return Ok(());
            }
        };
        for result in &all_text {
            let text = result.text.to_lowercase();
            if text.contains("胜利") || text.contains("victory") || text.contains("win") {
                debug!("battle result: victory");
            } else if text.contains("失败") || text.contains("defeat") || text.contains("lose") {
                debug!("battle result: defeat");
            }
        }
        let _ = state;
        Ok(())
    }
}

fn extract_level(text: &str) -> Option<u32> {
    LEVEL_RE.captures(text)?.iter().skip(1).find_map(|g| g.and_then(|m| m.as_str().parse().ok()))
}

static LEVEL_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"[Ll]v\.?\s*(\d+)|等级\s*(\d+)|[Ll]evel\s*(\d+)").unwrap());
static TIME_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"(\d{1,2}:\d{2}:\d{2})").unwrap());

/// Mirrors the most recently detected quest bar into `state`.
pub fn apply_quest_bar(state: &mut GameState, info: &QuestBarInfo) {
    state.quest_bar_visible = info.visible;
    state.quest_bar_has_red_badge = info.has_red_badge;
    state.quest_bar_current_quest = info.current_quest_text.clone();
    state.quest_bar_has_green_check = info.has_green_check;
    state.quest_bar_has_tutorial_finger = info.has_tutorial_finger;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_suffixed_and_plain_numbers() {
        assert_eq!(parse_resource_number("12,345"), Some(12345));
        assert_eq!(parse_resource_number("1.2M"), Some(1_200_000));
        assert_eq!(parse_resource_number("500K"), Some(500_000));
        assert_eq!(parse_resource_number("1.5B"), Some(1_500_000_000));
        assert_eq!(parse_resource_number("no digits here"), None);
    }

    #[test]
    fn record_action_trims_at_fifty_down_to_twenty() {
        let mut state = GameState::new(HashMap::new());
        for i in 0..50 {
            state.record_action(format!("action-{i}"));
        }
        assert_eq!(state.last_actions.len(), 50);
        state.record_action("action-50");
        assert_eq!(state.last_actions.len(), 20);
        assert_eq!(state.last_actions.last().unwrap().action, "action-50");
        assert_eq!(state.last_actions.first().unwrap().action, "action-31");
    }

    #[test]
    fn recent_actions_is_independent_last_twenty_slice() {
        let mut state = GameState::new(HashMap::new());
        for i in 0..10 {
            state.record_action(format!("action-{i}"));
        }
        assert_eq!(state.recent_actions().len(), 10);
        for i in 0..15 {
            state.record_action(format!("more-{i}"));
        }
        assert_eq!(state.recent_actions().len(), 20);
    }

    #[test]
    fn round_trips_through_json() {
        let mut state = GameState::new(HashMap::new());
        state.resources.insert("food".to_string(), 1000);
        state.record_action("tap");
        let json = serde_json::to_string(&state).unwrap();
        let back: GameState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.resources.get("food"), Some(&1000));
        assert_eq!(back.last_actions.len(), 1);
    }

    #[test]
    fn extracts_building_level_from_various_patterns() {
        assert_eq!(extract_level("Lv.12"), Some(12));
        assert_eq!(extract_level("等级 8"), Some(8));
        assert_eq!(extract_level("Level 3"), Some(3));
        assert_eq!(extract_level("no level here"), None);
    }
}
