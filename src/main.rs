mod action;
mod auto_loop;
mod building_finder;
mod close_x;
mod config;
mod device;
mod error;
mod finger;
mod game_profile;
mod quest_bar;
mod quest_script;
mod scene;
mod state;
mod stuck;
mod vision;
mod workflow;

use crate::auto_loop::AutoLoop;
use crate::config::Config;
use crate::device::DevicePort;
use crate::game_profile::{list_games, load_game_profile};
use crate::vision::ocr::OcrPort;
use crate::vision::template_store::TemplateStore;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "slgrobot", version, about = "Perception-and-control engine for an autonomous quest-running agent")]
struct Cli {
    #[arg(short, long, default_value_t = default_config_path())]
    config: String,
    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(Parser)]
enum SubCommand {
    /// Run the perceive-decide-act loop against a game profile (default)
    Run {
        /// Game id under `game.games_dir` (defaults to `game.active_game`)
        game: Option<String>,
    },
    /// Run a single named quest script against the current screen, once
    Script {
        game: String,
        script_name: String,
    },
    /// Show the current persisted game state for a profile
    Status { game: String },
    /// List games and the templates loaded for each
    Templates { game: Option<String> },
}

fn default_config_path() -> String {
    if Path::new("config.toml").exists() {
        return "config.toml".to_string();
    }
    if let Ok(home) = std::env::var("HOME") {
        let installed = format!("{}/.slgrobot/config.toml", home);
        if Path::new(&installed).exists() {
            return installed;
        }
    }
    "config.toml".to_string()
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    let config_path = Path::new(path);
    if config_path.exists() {
        Config::load(config_path)
    } else {
        Ok(Config {
            device: Default::default(),
            templates: Default::default(),
            screen: Default::default(),
            grid: Default::default(),
            r#loop: Default::default(),
            stuck: Default::default(),
            action: Default::default(),
            finger: Default::default(),
            game: Default::default(),
            quest_workflow: Default::default(),
            ocr: Default::default(),
        })
    }
}

struct Engine {
    device: Arc<DevicePort>,
    ocr: Arc<OcrPort>,
    config: Config,
}

fn build_engine(config: Config) -> anyhow::Result<Engine> {
    let device = Arc::new(DevicePort::new(
        config.device.adb_device.clone(),
        config.device.capture_timeout_secs,
        config.device.op_timeout_secs,
    ));
    let ocr = Arc::new(OcrPort::load(
        &config.ocr.detection_model_path,
        &config.ocr.recognition_model_path,
    )?);
    Ok(Engine { device, ocr, config })
}

fn resolve_game(config: &Config, requested: Option<String>) -> anyhow::Result<String> {
    requested
        .or_else(|| {
            if config.game.active_game.is_empty() {
                None
            } else {
                Some(config.game.active_game.clone())
            }
        })
        .ok_or_else(|| anyhow::anyhow!("no game given and `game.active_game` is unset in config"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "slgrobot=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command.unwrap_or(SubCommand::Run { game: None }) {
        SubCommand::Templates { game } => run_templates(&config, game),
        SubCommand::Status { game } => run_status(&config, &game),
        SubCommand::Script { game, script_name } => run_script(config, &game, &script_name).await,
        SubCommand::Run { game } => run_loop(config, game).await,
    }
}

async fn run_loop(config: Config, game: Option<String>) -> anyhow::Result<()> {
    let game_id = resolve_game(&config, game)?;
    let profile = load_game_profile(&game_id, Path::new(&config.game.games_dir))?;
    info!("slgrobot v{} — game {}", env!("CARGO_PKG_VERSION"), profile.file.display_name);

    let engine = build_engine(config)?;
    let templates = TemplateStore::load(&profile.template_dir)?;

    let mut auto_loop = AutoLoop::new(engine.device, templates, engine.ocr, engine.config, profile);
    auto_loop.run().await
}

async fn run_script(config: Config, game: &str, script_name: &str) -> anyhow::Result<()> {
    let profile = load_game_profile(game, Path::new(&config.game.games_dir))?;
    let script = profile
        .file
        .quest_scripts
        .iter()
        .find(|s| s.name.as_deref() == Some(script_name))
        .ok_or_else(|| anyhow::anyhow!("no quest script named '{script_name}' in profile {game}"))?
        .clone();

    let engine = build_engine(config)?;
    let templates = TemplateStore::load(&profile.template_dir)?;
    let grid = crate::vision::grid::GridOverlay::new(
        engine.config.screen.width as i32,
        engine.config.screen.height as i32,
        engine.config.grid.cols,
        engine.config.grid.rows,
    );
    let detector = crate::vision::element_detector::ElementDetector {
        templates: &templates,
        ocr: Some(&engine.ocr),
        grid,
        match_threshold: engine.config.templates.match_threshold,
    };

    let mut runner = crate::quest_script::QuestScriptRunner::new();
    runner.load(script.steps.clone());

    loop {
        let frame = engine.device.capture()?;
        let classification = crate::scene::classifier::SceneClassifier { templates: &templates }.classify(&frame.mat)?;
        let ctx = crate::quest_script::StepContext {
            detector: &detector,
            ocr: &engine.ocr,
            frame: &frame.mat,
            scene: classification.scene,
        };
        match runner.execute_one(&ctx)? {
            crate::quest_script::RunnerOutcome::Wait => {
                std::thread::sleep(std::time::Duration::from_millis(300));
            }
            crate::quest_script::RunnerOutcome::Actions(actions) => {
                for action in actions {
                    match action {
                        crate::action::Action::Tap { x, y } => engine.device.tap(x, y)?,
                        crate::action::Action::Swipe { x1, y1, x2, y2, duration_ms } => {
                            engine.device.swipe(x1, y1, x2, y2, duration_ms)?
                        }
                        other => {
                            info!("script step produced unsupported action for direct dispatch: {other:?}");
                        }
                    }
                }
            }
            crate::quest_script::RunnerOutcome::Done => {
                info!("script '{script_name}' completed");
                return Ok(());
            }
            crate::quest_script::RunnerOutcome::Aborted(reason) => {
                error!("script '{script_name}' aborted: {reason}");
                anyhow::bail!("script aborted: {reason}");
            }
        }
    }
}

fn run_status(config: &Config, game: &str) -> anyhow::Result<()> {
    let profile = load_game_profile(game, Path::new(&config.game.games_dir))?;
    let state: crate::state::GameState = std::fs::read_to_string(&profile.state_file)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_else(|| crate::state::GameState::new(profile.file.default_resources.clone()));

    println!("game:          {} ({})", profile.file.display_name, profile.file.game_id);
    println!("loop_count:    {}", state.loop_count);
    println!("current_scene: {}", state.scene);
    println!("resources:");
    for (k, v) in &state.resources {
        println!("  {k}: {v}");
    }
    if !state.cooldowns.is_empty() {
        println!("cooldowns:");
        for (quest, ts) in &state.cooldowns {
            println!("  {quest}: {ts}");
        }
    }
    Ok(())
}

fn run_templates(config: &Config, game: Option<String>) -> anyhow::Result<()> {
    let games_dir = Path::new(&config.game.games_dir);
    let games = match game {
        Some(g) => vec![g],
        None => list_games(games_dir)?,
    };
    if games.is_empty() {
        println!("no games found under {}", config.game.games_dir);
        return Ok(());
    }
    for game_id in games {
        let profile = load_game_profile(&game_id, games_dir)?;
        let store = TemplateStore::load(&profile.template_dir)?;
        let names = store.all_names();
        println!("{} ({}): {} template(s)", profile.file.display_name, game_id, names.len());
        for name in names {
            println!("  {name}");
        }
    }
    Ok(())
}
