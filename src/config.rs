use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "ARCHFEED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub ui: UIConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchiveConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            timeout: default_timeout(),
        }
    }
}

fn default_base_url() -> String {
    crate::archive::DEFAULT_BASE_URL.to_string()
}

fn default_user_agent() -> String {
    format!("archfeed/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout() -> Duration {
    Duration::from_secs(15)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Remaining rows below the viewport at which the next page is fetched.
    #[serde(default = "default_trigger_rows")]
    pub trigger_rows: usize,
    /// Extra rows around the viewport that count toward the activation
    /// region.
    #[serde(default = "default_margin_rows")]
    pub margin_rows: usize,
    /// Fraction of a slot's rows that must sit inside the activation region
    /// before a player is admitted.
    #[serde(default = "default_visible_fraction")]
    pub visible_fraction: f64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            trigger_rows: default_trigger_rows(),
            margin_rows: default_margin_rows(),
            visible_fraction: default_visible_fraction(),
        }
    }
}

fn default_page_size() -> usize {
    20
}

fn default_trigger_rows() -> usize {
    24
}

fn default_margin_rows() -> usize {
    8
}

fn default_visible_fraction() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerConfig {
    #[serde(default = "default_mpv_path")]
    pub mpv_path: String,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            mpv_path: default_mpv_path(),
        }
    }
}

fn default_mpv_path() -> String {
    "mpv".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UIConfig {
    #[serde(default = "default_theme")]
    pub theme: String,
}

impl Default for UIConfig {
    fn default() -> Self {
        Self {
            theme: default_theme(),
        }
    }
}

fn default_theme() -> String {
    "default".into()
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    // Fields absent from the file fall back through the serde defaults, so
    // the parsed file is already the file-over-defaults layer.
    let mut cfg = match options.config_file.as_ref().cloned().or_else(default_config_path) {
        Some(path) if path.exists() => read_config_file(&path)?,
        _ => Config::default(),
    };

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            apply_env_value(cfg, &normalized, value);
        }
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "archive.base_url" => cfg.archive.base_url = value,
        "archive.user_agent" => cfg.archive.user_agent = value,
        "archive.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.archive.timeout = duration;
            }
        }
        "feed.page_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.page_size = parsed;
            }
        }
        "feed.trigger_rows" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.trigger_rows = parsed;
            }
        }
        "feed.margin_rows" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.margin_rows = parsed;
            }
        }
        "feed.visible_fraction" => {
            if let Ok(parsed) = value.parse::<f64>() {
                if (0.0..=1.0).contains(&parsed) {
                    cfg.feed.visible_fraction = parsed;
                }
            }
        }
        "player.mpv_path" => cfg.player.mpv_path = value,
        "ui.theme" => cfg.ui.theme = value,
        _ => {}
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("archfeed").join("config.yaml"))
}
