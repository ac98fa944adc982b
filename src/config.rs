use crate::linking::DEFAULT_MAX_PARALLEL_OPS;
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Folder holding one subfolder per installed mod.
    pub staging_root: PathBuf,
    pub game_root: PathBuf,
    /// Method id. Empty picks the first supported method.
    #[serde(default)]
    pub deployment_method: String,
    /// Library, manifests and the log file.
    pub data_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_profile: Option<PathBuf>,
    #[serde(default = "default_max_parallel_ops")]
    pub max_parallel_ops: usize,
}

impl AppConfig {
    pub fn load_or_create() -> Result<Self> {
        Self::load_or_create_in(&base_data_dir()?)
    }

    /// Loads `config.json` from `base_dir`, writing defaults on first use.
    pub fn load_or_create_in(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let mut config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            if config.max_parallel_ops == 0 {
                config.max_parallel_ops = DEFAULT_MAX_PARALLEL_OPS;
                config.save_in(base_dir)?;
            }
            return Ok(config);
        }

        let config = AppConfig {
            staging_root: base_dir.join("mods"),
            game_root: PathBuf::new(),
            deployment_method: String::new(),
            data_dir: base_dir.to_path_buf(),
            game_profile: None,
            max_parallel_ops: DEFAULT_MAX_PARALLEL_OPS,
        };
        config.save_in(base_dir)?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_in(&base_data_dir()?)
    }

    pub fn save_in(&self, base_dir: &Path) -> Result<()> {
        fs::create_dir_all(base_dir).context("create app data dir")?;
        let path = base_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("modstage.log")
    }
}

fn default_max_parallel_ops() -> usize {
    DEFAULT_MAX_PARALLEL_OPS
}

pub fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("modstage"))
}
