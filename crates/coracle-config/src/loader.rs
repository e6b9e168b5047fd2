use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::Config;

/// Environment variable that overrides the config search path entirely.
const CONFIG_ENV: &str = "CORACLE_CONFIG";

/// Expand a leading `~` to the user's home directory.
pub fn resolve_workspace(path: &str) -> PathBuf {
    match path.strip_prefix("~/").or(if path == "~" { Some("") } else { None }) {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

fn home_config() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".coracle").join("config.json"))
}

/// Locate the config file: `$CORACLE_CONFIG`, then `./config.json`, then
/// `~/.coracle/config.json`. When none exists, the home location is
/// returned so a later `save_config` lands in the standard place.
pub fn find_config_path() -> PathBuf {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        if !explicit.is_empty() {
            return PathBuf::from(explicit);
        }
    }

    let candidates = [Some(PathBuf::from("config.json")), home_config()];
    for candidate in candidates.iter().flatten() {
        if candidate.exists() {
            return candidate.clone();
        }
    }

    home_config().unwrap_or_else(|| PathBuf::from("config.json"))
}

/// Parse the config at `path`. A missing file yields the defaults so a
/// fresh install can run before `onboard` has written anything.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config '{}'", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse config '{}'", path.display()))
}

/// Write the config as pretty JSON, creating parent directories as needed.
pub fn save_config(path: &Path, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory '{}'", parent.display()))?;
    }
    let contents = serde_json::to_string_pretty(config)?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config '{}'", path.display()))?;
    Ok(())
}
