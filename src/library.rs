use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

/// Installed mods in ascending priority. Later entries win file conflicts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Library {
    pub mods: Vec<ModEntry>,
}

impl Library {
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let library_path = data_dir.join("library.json");
        if library_path.exists() {
            let raw = fs::read_to_string(&library_path).context("read library.json")?;
            let library: Library = serde_json::from_str(&raw).context("parse library.json")?;
            return Ok(library);
        }

        let library = Library::default();
        library.save(data_dir)?;
        Ok(library)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir).context("create data dir")?;
        let library_path = data_dir.join("library.json");
        let raw = serde_json::to_string_pretty(self).context("serialize library.json")?;
        fs::write(library_path, raw).context("write library.json")?;
        Ok(())
    }

    pub fn enabled_mods(&self) -> Vec<ModEntry> {
        self.mods.iter().filter(|m| m.enabled).cloned().collect()
    }

    pub fn index_by_id(&self) -> HashMap<String, ModEntry> {
        self.mods
            .iter()
            .cloned()
            .map(|mod_entry| (mod_entry.id.clone(), mod_entry))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModEntry {
    pub id: String,
    /// Subdirectory of the staging root holding the installed files.
    pub installation_path: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Selects the deployment sub-destination through the game's mod paths.
    #[serde(default)]
    pub mod_type: String,
    #[serde(default)]
    pub attributes: ModAttributes,
    #[serde(default)]
    pub rules: Vec<ModRule>,
}

impl ModEntry {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            installation_path: id.to_string(),
            enabled: true,
            mod_type: String::new(),
            attributes: ModAttributes::default(),
            rules: Vec::new(),
        }
    }

    pub fn with_rule(mut self, kind: RuleType, reference: ModReference) -> Self {
        self.rules.push(ModRule { kind, reference });
        self
    }

    pub fn display_name(&self) -> String {
        let attrs = &self.attributes;
        attrs
            .custom_file_name
            .as_deref()
            .or(attrs.logical_file_name.as_deref())
            .or(attrs.name.as_deref())
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.id)
            .to_string()
    }

    pub fn install_dir(&self, staging_root: &Path) -> PathBuf {
        staging_root.join(&self.installation_path)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_logical_file_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_choices: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patches: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_mod_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_file_id: Option<String>,
    /// Games this mod can be deployed to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub game_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Before,
    After,
    Requires,
    Recommends,
    Conflicts,
    Provides,
}

impl RuleType {
    pub fn affects_order(self) -> bool {
        matches!(self, RuleType::Before | RuleType::After)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModRule {
    #[serde(rename = "type")]
    pub kind: RuleType,
    pub reference: ModReference,
}

/// Partially specified predicate locating installed mods. Absent fields are not checked.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_match: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installer_choices: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patches: Option<Value>,
}

impl ModReference {
    pub fn by_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::default()
        }
    }

    /// Only `id` is set; such references match on id alone.
    pub fn is_id_only(&self) -> bool {
        self.id.is_some()
            && self.file_md5.is_none()
            && self.logical_file_name.is_none()
            && self.file_expression.is_none()
            && self.version_match.is_none()
            && self.repo.is_none()
            && self.game_id.is_none()
            && self.tag.is_none()
            && self.installer_choices.is_none()
            && self.patches.is_none()
    }

    pub fn has_identifier(&self) -> bool {
        self.id.is_some()
            || self.file_md5.is_some()
            || self.logical_file_name.is_some()
            || self.file_expression.is_some()
            || self.repo.is_some()
            || self.tag.is_some()
    }

    /// Identifying fields other than `tag`.
    pub fn has_identifier_besides_tag(&self) -> bool {
        self.id.is_some()
            || self.file_md5.is_some()
            || self.logical_file_name.is_some()
            || self.file_expression.is_some()
            || self.repo.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RepoReference {
    pub repository: String,
    pub mod_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

fn default_true() -> bool {
    true
}
