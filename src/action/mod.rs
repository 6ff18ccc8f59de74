//! C16 Action Pipeline: validate → execute-with-retry → record stages.
//! Grounded on `original_source/SLGrobot/executor/action_validator.py` for
//! the validate stage; the execute stage keeps the prior `do_action()`
//! string-dispatch idiom, generalized to a typed `Action` enum and
//! delegating to `DevicePort` instead of spawning `adb` directly.

use crate::device::DevicePort;
use crate::state::GameState;
use crate::vision::element_detector::{ElementDetector, LocateMethod};
use opencv::core::Mat;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Tap { x: i32, y: i32 },
    Swipe { x1: i32, y1: i32, x2: i32, y2: i32, duration_ms: u64 },
    Key { code: String },
    Wait { ms: u64 },
    TypeText { text: String },
    /// Resolved by the auto-loop (it owns the async `BuildingFinder`), never
    /// executed directly by this pipeline.
    FindBuilding { name: String },
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Action::Tap { .. } => "tap",
            Action::Swipe { .. } => "swipe",
            Action::Key { .. } => "key",
            Action::Wait { .. } => "wait",
            Action::TypeText { .. } => "type_text",
            Action::FindBuilding { .. } => "find_building",
        }
    }
}

use serde::{Deserialize, Serialize};

fn default_action_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(default = "default_action_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_action_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

pub struct ActionPipeline<'a> {
    pub device: &'a DevicePort,
    pub detector: &'a ElementDetector<'a>,
    pub config: &'a ActionConfig,
    pub screen_width: i32,
    pub screen_height: i32,
}

impl<'a> ActionPipeline<'a> {
    /// Validates the action against `frame`, then executes with up to
    /// `max_retries` attempts, recording the first successful (or final
    /// failed) attempt into `state`.
    pub fn run(&self, action: &Action, frame: &Mat, state: &mut GameState) -> anyhow::Result<bool> {
        if !self.validate(action, frame) {
            warn!("action failed validation: {action:?}");
            return Ok(false);
        }

        for attempt in 0..self.config.max_retries.max(1) {
            match self.execute(action) {
                Ok(()) => {
                    state.record_action(format!("{action:?}"));
                    return Ok(true);
                }
                Err(e) => {
                    warn!("attempt {attempt} of action {} failed: {e}", action.label());
                    std::thread::sleep(Duration::from_millis(self.config.retry_delay_ms));
                }
            }
        }
        state.record_action(format!("FAILED:{action:?}"));
        Ok(false)
    }

    fn validate(&self, action: &Action, frame: &Mat) -> bool {
        match action {
            Action::Wait { .. } | Action::Key { .. } | Action::FindBuilding { .. } | Action::TypeText { .. } => true,
            Action::Tap { x, y } => self.coords_in_bounds(*x, *y),
            Action::Swipe { x1, y1, x2, y2, .. } => {
                self.coords_in_bounds(*x1, *y1) && self.coords_in_bounds(*x2, *y2)
            }
        }
    }

    fn coords_in_bounds(&self, x: i32, y: i32) -> bool {
        (0..=self.screen_width).contains(&x) && (0..=self.screen_height).contains(&y)
    }

    fn execute(&self, action: &Action) -> anyhow::Result<()> {
        match action {
            Action::Tap { x, y } => Ok(self.device.tap(*x, *y)?),
            Action::Swipe { x1, y1, x2, y2, duration_ms } => {
                Ok(self.device.swipe(*x1, *y1, *x2, *y2, *duration_ms)?)
            }
            Action::Key { code } => Ok(self.device.key(code)?),
            Action::Wait { ms } => {
                std::thread::sleep(Duration::from_millis(*ms));
                Ok(())
            }
            Action::TypeText { text } => Ok(self.device.type_text(text)?),
            Action::FindBuilding { name } => {
                anyhow::bail!("find_building '{name}' must be handled by the auto-loop before reaching the pipeline")
            }
        }
    }

    /// Template/OCR existence check for a textual tap target, used by
    /// callers that resolve target text to coordinates before building the
    /// `Action` itself (spec's validate-before-dispatch rule).
    pub fn locate_target(&self, frame: &Mat, text: &str) -> anyhow::Result<Option<(i32, i32)>> {
        Ok(self
            .detector
            .locate(frame, text, &[LocateMethod::Template, LocateMethod::Ocr])?
            .map(|el| el.center()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_matches_variant() {
        assert_eq!(Action::Tap { x: 1, y: 2 }.label(), "tap");
        assert_eq!(Action::FindBuilding { name: "x".into() }.label(), "find_building");
    }

    #[test]
    fn bounds_check_is_inclusive_of_screen_edges() {
        let (screen_width, screen_height) = (1080, 1920);
        let in_bounds = |x: i32, y: i32| (0..=screen_width).contains(&x) && (0..=screen_height).contains(&y);
        assert!(in_bounds(0, 0));
        assert!(in_bounds(1080, 1920));
        assert!(!in_bounds(1081, 100));
        assert!(!in_bounds(-1, 100));
    }
}
