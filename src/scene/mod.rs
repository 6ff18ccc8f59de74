//! C7 Scene Classifier and C20 Popup Filter.

pub mod classifier;
pub mod popup_filter;

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scene {
    MainCity,
    WorldMap,
    Hero,
    HeroRecruit,
    HeroUpgrade,
    Battle,
    Popup,
    ExitDialog,
    Loading,
    StoryDialogue,
    Unknown,
}

impl Scene {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scene::MainCity => "main_city",
            Scene::WorldMap => "world_map",
            Scene::Hero => "hero",
            Scene::HeroRecruit => "hero_recruit",
            Scene::HeroUpgrade => "hero_upgrade",
            Scene::Battle => "battle",
            Scene::Popup => "popup",
            Scene::ExitDialog => "exit_dialog",
            Scene::Loading => "loading",
            Scene::StoryDialogue => "story_dialogue",
            Scene::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Scene {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Full classification result: the winning scene plus a confidence vector
/// for diagnostics (spec §4.4).
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub scene: Scene,
    pub scores: HashMap<Scene, f32>,
}
