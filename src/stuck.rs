//! C15 Stuck Recovery: detect repeated-scene loops and escalate recovery
//! actions. Grounded on `original_source/SLGrobot/brain/stuck_recovery.py`.
//! Escalation resets fully to level 0 on any scene change rather than the
//! gradual de-escalation the teacher used for its LLM-agent loop — a stuck
//! quest workflow either broke free or it didn't, there's no partial credit.

use crate::device::DevicePort;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StuckConfig {
    /// How many consecutive identical scene classifications count as stuck.
    /// Default 10, per spec §4.11 step 4 / `config.py`'s `STUCK_MAX_SAME_SCENE`.
    #[serde(default = "default_max_same_scene")]
    pub max_same_scene: u32,

    #[serde(default)]
    pub game_package: Option<String>,
}

fn default_max_same_scene() -> u32 {
    10
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            max_same_scene: default_max_same_scene(),
            game_package: None,
        }
    }
}

pub const MAX_LEVEL: u32 = 3;

/// An escalating recovery action, in order of increasing severity.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    TapBlank,
    CenterTap,
    RestartApp,
}

impl RecoveryAction {
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryAction::TapBlank => "tap_blank",
            RecoveryAction::CenterTap => "center_tap",
            RecoveryAction::RestartApp => "restart_app",
        }
    }
}

/// Detects when the bot is stuck on the same scene for too long and drives
/// an escalating recovery: back-tap, center-tap, then a full app restart.
pub struct StuckRecovery {
    config: StuckConfig,
    level: u32,
    recovery_count: u32,
}

impl StuckRecovery {
    pub fn new(config: StuckConfig) -> Self {
        Self {
            config,
            level: 0,
            recovery_count: 0,
        }
    }

    /// True when the last `max_same_scene` entries of `scene_history` are
    /// all identical.
    pub fn check(&self, scene_history: &[String]) -> bool {
        let n = self.config.max_same_scene as usize;
        if n == 0 || scene_history.len() < n {
            return false;
        }
        let tail = &scene_history[scene_history.len() - n..];
        tail.windows(2).all(|w| w[0] == w[1])
    }

    /// Execute the next escalation level's recovery action against `device`.
    /// `screen_width`/`screen_height` locate the center tap for level 2.
    pub fn recover(&mut self, device: &DevicePort, screen_width: i32, screen_height: i32) -> anyhow::Result<RecoveryAction> {
        self.level = (self.level + 1).min(MAX_LEVEL);
        self.recovery_count += 1;

        let action = match self.level {
            1 => {
                warn!("stuck recovery level 1: tapping blank area");
                device.tap(500, 100)?;
                RecoveryAction::TapBlank
            }
            2 => {
                warn!("stuck recovery level 2: tapping screen center");
                device.tap(screen_width / 2, screen_height / 2)?;
                RecoveryAction::CenterTap
            }
            _ => {
                warn!("stuck recovery level 3: restarting app");
                self.restart_app(device)?;
                RecoveryAction::RestartApp
            }
        };
        Ok(action)
    }

    fn restart_app(&self, device: &DevicePort) -> anyhow::Result<()> {
        let Some(package) = &self.config.game_package else {
            warn!("no game_package configured, falling back to HOME key");
            device.key("KEYCODE_HOME")?;
            return Ok(());
        };

        if let Err(e) = device.force_stop(package) {
            warn!("force-stop of {package} failed: {e}");
        } else {
            info!("force-stopped {package}");
        }

        std::thread::sleep(std::time::Duration::from_secs(2));

        if let Err(e) = device.launch_app(package) {
            warn!("relaunch of {package} failed: {e}");
        } else {
            info!("relaunched {package}");
        }
        Ok(())
    }

    /// Reset escalation fully to level 0 (call whenever the scene changes).
    pub fn reset(&mut self) {
        self.level = 0;
    }

    pub fn recovery_count(&self) -> u32 {
        self.recovery_count
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StuckConfig {
        StuckConfig {
            max_same_scene: 3,
            game_package: Some("com.example.game".to_string()),
        }
    }

    fn history(scenes: &[&str]) -> Vec<String> {
        scenes.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn not_stuck_below_threshold_length() {
        let recovery = StuckRecovery::new(test_config());
        assert!(!recovery.check(&history(&["main_city", "main_city"])));
    }

    #[test]
    fn not_stuck_when_tail_varies() {
        let recovery = StuckRecovery::new(test_config());
        assert!(!recovery.check(&history(&["main_city", "world_map", "main_city"])));
    }

    #[test]
    fn stuck_when_tail_is_identical() {
        let recovery = StuckRecovery::new(test_config());
        assert!(recovery.check(&history(&["world_map", "main_city", "main_city", "main_city"])));
    }

    #[test]
    fn escalation_level_caps_at_max_level() {
        let mut recovery = StuckRecovery::new(test_config());
        recovery.level = MAX_LEVEL;
        recovery.recovery_count = 10;
        assert_eq!((recovery.level + 1).min(MAX_LEVEL), MAX_LEVEL);
    }

    #[test]
    fn reset_is_a_full_reset_not_gradual_deescalation() {
        let mut recovery = StuckRecovery::new(test_config());
        recovery.level = MAX_LEVEL;
        recovery.recovery_count = 7;
        recovery.reset();
        assert_eq!(recovery.level, 0);
        assert_eq!(recovery.recovery_count, 7, "recovery_count is a lifetime counter, not reset");
    }

    #[test]
    fn recovery_action_labels() {
        assert_eq!(RecoveryAction::TapBlank.label(), "tap_blank");
        assert_eq!(RecoveryAction::CenterTap.label(), "center_tap");
        assert_eq!(RecoveryAction::RestartApp.label(), "restart_app");
    }
}
