use crate::action::ActionConfig;
use crate::stuck::StuckConfig;
use crate::workflow::QuestWorkflowConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub templates: TemplatesConfig,
    #[serde(default)]
    pub screen: ScreenConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub r#loop: LoopConfig,
    #[serde(default)]
    pub stuck: StuckConfig,
    #[serde(default)]
    pub action: ActionConfig,
    #[serde(default)]
    pub finger: FingerConfig,
    #[serde(default)]
    pub game: GameConfig,
    #[serde(default)]
    pub quest_workflow: QuestWorkflowConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading config {}: {e}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", path.display()))?;
        Ok(config)
    }
}

fn default_adb_device() -> Option<String> {
    None
}
fn default_capture_timeout_secs() -> u64 {
    15
}
fn default_op_timeout_secs() -> u64 {
    10
}
fn default_reconnect_max_tries() -> u32 {
    3
}
fn default_reconnect_base_delay_secs() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_adb_device")]
    pub adb_device: Option<String>,
    #[serde(default = "default_capture_timeout_secs")]
    pub capture_timeout_secs: u64,
    #[serde(default = "default_op_timeout_secs")]
    pub op_timeout_secs: u64,
    #[serde(default = "default_reconnect_max_tries")]
    pub reconnect_max_tries: u32,
    #[serde(default = "default_reconnect_base_delay_secs")]
    pub reconnect_base_delay_secs: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            adb_device: default_adb_device(),
            capture_timeout_secs: default_capture_timeout_secs(),
            op_timeout_secs: default_op_timeout_secs(),
            reconnect_max_tries: default_reconnect_max_tries(),
            reconnect_base_delay_secs: default_reconnect_base_delay_secs(),
        }
    }
}

fn default_templates_root_dir() -> String {
    "templates".to_string()
}
fn default_match_threshold() -> f32 {
    0.8
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplatesConfig {
    #[serde(default = "default_templates_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,
}

impl Default for TemplatesConfig {
    fn default() -> Self {
        Self {
            root_dir: default_templates_root_dir(),
            match_threshold: default_match_threshold(),
        }
    }
}

fn default_screen_width() -> u32 {
    1080
}
fn default_screen_height() -> u32 {
    1920
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScreenConfig {
    #[serde(default = "default_screen_width")]
    pub width: u32,
    #[serde(default = "default_screen_height")]
    pub height: u32,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            width: default_screen_width(),
            height: default_screen_height(),
        }
    }
}

fn default_grid_cols() -> u32 {
    8
}
fn default_grid_rows() -> u32 {
    6
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridConfig {
    #[serde(default = "default_grid_cols")]
    pub cols: u32,
    #[serde(default = "default_grid_rows")]
    pub rows: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            cols: default_grid_cols(),
            rows: default_grid_rows(),
        }
    }
}

fn default_interval_secs() -> f64 {
    2.0
}
fn default_llm_consult_interval_secs() -> u64 {
    1800
}
fn default_consecutive_error_budget() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,
    #[serde(default = "default_llm_consult_interval_secs")]
    pub llm_consult_interval_secs: u64,
    #[serde(default = "default_consecutive_error_budget")]
    pub consecutive_error_budget: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            llm_consult_interval_secs: default_llm_consult_interval_secs(),
            consecutive_error_budget: default_consecutive_error_budget(),
        }
    }
}

fn default_finger_ccorr_min() -> f32 {
    0.85
}
fn default_finger_ncc_min() -> f32 {
    0.45
}

#[derive(Debug, Clone, Deserialize)]
pub struct FingerConfig {
    #[serde(default = "default_finger_ccorr_min")]
    pub ccorr_min: f32,
    #[serde(default = "default_finger_ncc_min")]
    pub ncc_min: f32,
}

impl Default for FingerConfig {
    fn default() -> Self {
        Self {
            ccorr_min: default_finger_ccorr_min(),
            ncc_min: default_finger_ncc_min(),
        }
    }
}

fn default_games_dir() -> String {
    "games".to_string()
}
fn default_active_game() -> String {
    String::new()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GameConfig {
    #[serde(default = "default_games_dir")]
    pub games_dir: String,
    #[serde(default = "default_active_game")]
    pub active_game: String,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            games_dir: default_games_dir(),
            active_game: default_active_game(),
        }
    }
}

fn default_detection_model_path() -> String {
    "models/text-detection.rten".to_string()
}
fn default_recognition_model_path() -> String {
    "models/text-recognition.rten".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct OcrConfig {
    #[serde(default = "default_detection_model_path")]
    pub detection_model_path: String,
    #[serde(default = "default_recognition_model_path")]
    pub recognition_model_path: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            detection_model_path: default_detection_model_path(),
            recognition_model_path: default_recognition_model_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = Config {
            device: DeviceConfig::default(),
            templates: TemplatesConfig::default(),
            screen: ScreenConfig::default(),
            grid: GridConfig::default(),
            r#loop: LoopConfig::default(),
            stuck: StuckConfig::default(),
            action: ActionConfig::default(),
            finger: FingerConfig::default(),
            game: GameConfig::default(),
            quest_workflow: QuestWorkflowConfig::default(),
            ocr: OcrConfig::default(),
        };
        assert_eq!(cfg.screen.width, 1080);
        assert_eq!(cfg.screen.height, 1920);
        assert_eq!(cfg.grid.cols, 8);
        assert_eq!(cfg.grid.rows, 6);
        assert_eq!(cfg.stuck.max_same_scene, 10);
        assert_eq!(cfg.templates.match_threshold, 0.8);
        assert_eq!(cfg.r#loop.interval_secs, 2.0);
    }

    #[test]
    fn load_parses_partial_toml_with_defaults() {
        let dir = std::env::temp_dir().join(format!("slgrobot-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[device]\nadb_device = \"emulator-5554\"\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.device.adb_device.as_deref(), Some("emulator-5554"));
        assert_eq!(cfg.device.reconnect_max_tries, 3);
        std::fs::remove_dir_all(&dir).ok();
    }
}
