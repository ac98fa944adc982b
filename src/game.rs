use crate::error::DeployError;
use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

/// What the deployment core needs to know about a game.
pub trait GameSupport: Send + Sync {
    fn id(&self) -> &str;
    /// Files whose presence identifies a valid game install, relative to the game root.
    fn required_files(&self) -> &[String];
    /// Whether a deployed relative path is a packed archive whose contents merge.
    fn merge_archive(&self, relative_path: &Path) -> bool;
    /// Deployment destination per mod type id. The empty id is the default type.
    fn mod_paths(&self, game_root: &Path) -> HashMap<String, PathBuf>;
}

/// Game description loaded from JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameProfile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub required_files: Vec<String>,
    /// Glob patterns over relative paths, matched case-insensitively.
    #[serde(default)]
    pub mergeable_archives: Vec<String>,
    /// Mod type id to destination relative to the game root.
    #[serde(default)]
    pub mod_paths: HashMap<String, String>,
}

impl GameProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read game profile {}", path.display()))?;
        let profile = serde_json::from_str(&raw).context("parse game profile")?;
        Ok(profile)
    }

    /// Resolves derived views once so the deployment pass works on fixed data.
    pub fn resolve(&self, game_root: &Path) -> Result<ResolvedGame> {
        let mut patterns = Vec::with_capacity(self.mergeable_archives.len());
        for raw in &self.mergeable_archives {
            let pattern = Pattern::new(raw)
                .with_context(|| format!("invalid mergeable archive pattern {raw:?}"))?;
            patterns.push(pattern);
        }

        let mut mod_paths: HashMap<String, PathBuf> = self
            .mod_paths
            .iter()
            .map(|(type_id, rel)| (type_id.clone(), game_root.join(rel)))
            .collect();
        mod_paths
            .entry(String::new())
            .or_insert_with(|| game_root.to_path_buf());

        Ok(ResolvedGame {
            id: self.id.clone(),
            name: self.name.clone(),
            game_root: game_root.to_path_buf(),
            required_files: self.required_files.clone(),
            merge_patterns: patterns,
            mod_paths,
        })
    }
}

/// Immutable view of a game profile bound to one install location.
#[derive(Debug, Clone)]
pub struct ResolvedGame {
    pub id: String,
    pub name: String,
    pub game_root: PathBuf,
    required_files: Vec<String>,
    merge_patterns: Vec<Pattern>,
    mod_paths: HashMap<String, PathBuf>,
}

impl ResolvedGame {
    pub fn destination_for(&self, mod_type: &str) -> PathBuf {
        self.mod_paths
            .get(mod_type)
            .or_else(|| self.mod_paths.get(""))
            .cloned()
            .unwrap_or_else(|| self.game_root.clone())
    }

    pub fn verify_install(&self) -> std::result::Result<(), DeployError> {
        for file in &self.required_files {
            if !self.game_root.join(file).exists() {
                return Err(DeployError::GameNotFound {
                    root: self.game_root.clone(),
                    missing: file.clone(),
                });
            }
        }
        Ok(())
    }
}

impl GameSupport for ResolvedGame {
    fn id(&self) -> &str {
        &self.id
    }

    fn required_files(&self) -> &[String] {
        &self.required_files
    }

    fn merge_archive(&self, relative_path: &Path) -> bool {
        let options = MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        let rel = relative_path.to_string_lossy().replace('\\', "/");
        self.merge_patterns
            .iter()
            .any(|pattern| pattern.matches_with(&rel, options))
    }

    fn mod_paths(&self, _game_root: &Path) -> HashMap<String, PathBuf> {
        self.mod_paths.clone()
    }
}
