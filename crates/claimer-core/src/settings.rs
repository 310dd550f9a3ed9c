use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::model::TaskType;

/// Values read from the settings file. Every field is optional; command-line
/// flags take precedence over anything set here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub clue_type: Option<String>,
    #[serde(default)]
    pub claim_limit: Option<u32>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub include_keywords: Vec<String>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
}

fn normalize_opt(value: &mut Option<String>) {
    *value = value
        .as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
}

impl Settings {
    fn normalize(&mut self) {
        normalize_opt(&mut self.base_url);
        normalize_opt(&mut self.cookie);
        normalize_opt(&mut self.step);
        normalize_opt(&mut self.subject);
        normalize_opt(&mut self.clue_type);
        normalize_opt(&mut self.start_time);
        normalize_opt(&mut self.end_time);
        for list in [&mut self.include_keywords, &mut self.exclude_keywords] {
            list.iter_mut().for_each(|k| *k = k.trim().to_string());
            list.retain(|k| !k.is_empty());
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

pub fn default_settings_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("clue-claimer").join("settings.json"))
}

/// Load settings from `path`. A missing file is not an error.
pub fn load_settings(path: &Path) -> anyhow::Result<Option<Settings>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut settings: Settings = serde_json::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("parse {}: {err}", path.display()))?;
    settings.normalize();
    Ok(Some(settings))
}

pub fn save_settings(path: &Path, settings: &Settings) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid settings path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut settings = settings.clone();
    settings.normalize();

    let json = serde_json::to_string_pretty(&settings)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}
