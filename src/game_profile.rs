//! C18 Game Profile: per-game JSON configuration. Grounded on
//! `original_source/SLGrobot/game_profile.py`.

use crate::quest_script::QuestScript;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

fn default_grid_cols() -> u32 {
    8
}
fn default_grid_rows() -> u32 {
    6
}
fn default_finger_ncc_threshold() -> f32 {
    0.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameProfileFile {
    pub game_id: String,
    pub name: String,
    pub display_name: String,
    pub package: String,

    #[serde(default)]
    pub default_resources: HashMap<String, i64>,
    #[serde(default)]
    pub resource_keywords: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub resource_order: Vec<String>,

    #[serde(default)]
    pub scenes: Vec<String>,
    #[serde(default)]
    pub known_tasks: Vec<String>,

    #[serde(default)]
    pub known_popups: Vec<String>,
    #[serde(default)]
    pub reward_templates: Vec<String>,
    #[serde(default)]
    pub close_text_patterns: Vec<String>,
    #[serde(default)]
    pub claim_text_patterns: Vec<String>,

    #[serde(default)]
    pub action_button_templates: Vec<String>,
    #[serde(default)]
    pub action_button_texts: Vec<String>,

    #[serde(default)]
    pub popup_close_templates: Vec<String>,
    #[serde(default)]
    pub popup_close_texts: Vec<String>,

    #[serde(default = "default_grid_cols")]
    pub grid_cols: u32,
    #[serde(default = "default_grid_rows")]
    pub grid_rows: u32,

    #[serde(default = "default_finger_ncc_threshold")]
    pub finger_ncc_threshold: f32,

    #[serde(default)]
    pub ocr_corrections: HashMap<String, String>,

    #[serde(default)]
    pub quest_scripts: Vec<QuestScript>,

    #[serde(default)]
    pub city_layout: HashMap<String, (i32, i32)>,
}

/// The loaded profile, with filesystem paths resolved relative to its
/// `game_dir` (these are never stored in the JSON itself).
#[derive(Debug, Clone)]
pub struct GameProfile {
    pub file: GameProfileFile,
    pub game_dir: PathBuf,
    pub template_dir: PathBuf,
    pub nav_paths_file: PathBuf,
    pub state_file: PathBuf,
    pub tasks_file: PathBuf,
}

impl GameProfile {
    pub fn effective_finger_ncc_threshold(&self, default: f32) -> f32 {
        if self.file.finger_ncc_threshold > 0.0 {
            self.file.finger_ncc_threshold
        } else {
            default
        }
    }
}

pub fn load_game_profile(game_id: &str, games_dir: &Path) -> anyhow::Result<GameProfile> {
    let game_dir = games_dir.join(game_id);
    let profile_path = game_dir.join("game.json");
    if !profile_path.exists() {
        anyhow::bail!("game profile not found: {}", profile_path.display());
    }
    let text = std::fs::read_to_string(&profile_path)?;
    let file: GameProfileFile = serde_json::from_str(&text)?;
    Ok(GameProfile {
        template_dir: game_dir.join("templates"),
        nav_paths_file: game_dir.join("nav_paths.json"),
        state_file: game_dir.join("state.json"),
        tasks_file: game_dir.join("tasks.json"),
        game_dir,
        file,
    })
}

/// Enumerate subdirectories of `games_dir` that contain a `game.json`.
pub fn list_games(games_dir: &Path) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    if !games_dir.exists() {
        return Ok(out);
    }
    for entry in std::fs::read_dir(games_dir)? {
        let entry = entry?;
        if entry.path().is_dir() && entry.path().join("game.json").exists() {
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_game_json_errors() {
        let dir = std::env::temp_dir().join(format!("slgrobot-gp-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let result = load_game_profile("nope", &dir);
        assert!(result.is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn list_games_finds_subdirs_with_profile() {
        let dir = std::env::temp_dir().join(format!("slgrobot-gp-list-test-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("game_a")).unwrap();
        std::fs::write(dir.join("game_a").join("game.json"), "{}").unwrap();
        std::fs::create_dir_all(dir.join("game_b")).unwrap();
        let games = list_games(&dir).unwrap();
        assert_eq!(games, vec!["game_a".to_string()]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn effective_finger_ncc_threshold_falls_back_to_default() {
        let file = GameProfileFile {
            game_id: "g".into(),
            name: "g".into(),
            display_name: "G".into(),
            package: "com.g".into(),
            default_resources: HashMap::new(),
            resource_keywords: HashMap::new(),
            resource_order: Vec::new(),
            scenes: Vec::new(),
            known_tasks: Vec::new(),
            known_popups: Vec::new(),
            reward_templates: Vec::new(),
            close_text_patterns: Vec::new(),
            claim_text_patterns: Vec::new(),
            action_button_templates: Vec::new(),
            action_button_texts: Vec::new(),
            popup_close_templates: Vec::new(),
            popup_close_texts: Vec::new(),
            grid_cols: 8,
            grid_rows: 6,
            finger_ncc_threshold: 0.0,
            ocr_corrections: HashMap::new(),
            quest_scripts: Vec::new(),
            city_layout: HashMap::new(),
        };
        let profile = GameProfile {
            file,
            game_dir: PathBuf::new(),
            template_dir: PathBuf::new(),
            nav_paths_file: PathBuf::new(),
            state_file: PathBuf::new(),
            tasks_file: PathBuf::new(),
        };
        assert_eq!(profile.effective_finger_ncc_threshold(0.45), 0.45);
    }
}
