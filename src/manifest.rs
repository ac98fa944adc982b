//! Persistent record of deployed files.

use crate::error::{DeployError, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

pub const MANIFEST_VERSION: u32 = 1;

/// One file made visible in the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedFile {
    /// Path relative to the destination root, `/`-separated.
    pub rel_path: String,
    /// Staging subdirectory of the owning mod.
    pub source: String,
    /// Sub-destination the mod was activated into, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Source modification time in milliseconds since the epoch.
    pub time: i64,
}

impl DeployedFile {
    /// Path of the file inside its mod, with the sub-destination stripped.
    pub fn path_in_mod(&self) -> &str {
        match self.target.as_deref() {
            Some(target) if !target.is_empty() => self
                .rel_path
                .strip_prefix(target)
                .map(|rest| rest.trim_start_matches('/'))
                .unwrap_or(&self.rel_path),
            _ => &self.rel_path,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    #[serde(default)]
    pub deployment_method: String,
    #[serde(default)]
    pub staging_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<String>,
    #[serde(default)]
    pub files: Vec<DeployedFile>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredManifest {
    Current(Manifest),
    Legacy(Vec<DeployedFile>),
}

impl Manifest {
    pub fn new(method_id: &str, staging_root: &Path) -> Self {
        Self {
            version: MANIFEST_VERSION,
            deployment_method: method_id.to_string(),
            staging_path: staging_root.to_string_lossy().to_string(),
            deployed_at: None,
            files: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn touch(&mut self) {
        self.deployed_at = OffsetDateTime::now_utc().format(&Rfc3339).ok();
    }

    /// Entries keyed by normalized relative path. Later duplicates win.
    pub fn keyed(&self, normalizer: Normalizer) -> BTreeMap<String, DeployedFile> {
        self.files
            .iter()
            .map(|file| (normalizer.normalize(&file.rel_path), file.clone()))
            .collect()
    }

    pub fn from_keyed(&self, entries: BTreeMap<String, DeployedFile>) -> Self {
        let mut manifest = Self {
            version: MANIFEST_VERSION,
            deployment_method: self.deployment_method.clone(),
            staging_path: self.staging_path.clone(),
            deployed_at: self.deployed_at.clone(),
            files: entries.into_values().collect(),
        };
        manifest.touch();
        manifest
    }
}

pub fn manifest_path(data_dir: &Path, method_id: &str) -> PathBuf {
    data_dir.join(format!("deployment.{method_id}.json"))
}

/// Reads a manifest, migrating older layouts. A missing file is an empty manifest.
pub fn load_manifest(path: &Path) -> Result<Option<Manifest>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let stored: StoredManifest =
        serde_json::from_str(&raw).map_err(|err| DeployError::Manifest {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
    let manifest = match stored {
        StoredManifest::Current(manifest) if manifest.version > MANIFEST_VERSION => {
            return Err(DeployError::Manifest {
                path: path.to_path_buf(),
                reason: format!("unsupported manifest version {}", manifest.version),
            })
        }
        StoredManifest::Current(mut manifest) => {
            manifest.version = MANIFEST_VERSION;
            manifest
        }
        StoredManifest::Legacy(files) => Manifest {
            version: MANIFEST_VERSION,
            files,
            ..Manifest::default()
        },
    };
    Ok(Some(manifest))
}

pub fn save_manifest(path: &Path, manifest: &Manifest) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(manifest)?;
    let temp = path.with_extension("json.tmp");
    fs::write(&temp, raw)?;
    fs::rename(&temp, path)?;
    Ok(())
}

/// Maps relative paths to manifest keys for one destination filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalizer {
    CaseSensitive,
    CaseInsensitive,
}

impl Normalizer {
    /// Probes whether `root` treats differently-cased names as the same file.
    pub fn detect(root: &Path) -> Normalizer {
        let probe = root.join(format!(".modstage_Case_Probe_{}", std::process::id()));
        if fs::write(&probe, b"").is_err() {
            return Normalizer::default_for_platform();
        }
        let folded = root.join(format!(".modstage_case_probe_{}", std::process::id()));
        let insensitive = folded.exists();
        let _ = fs::remove_file(&probe);
        if insensitive {
            Normalizer::CaseInsensitive
        } else {
            Normalizer::CaseSensitive
        }
    }

    fn default_for_platform() -> Normalizer {
        if cfg!(any(windows, target_os = "macos")) {
            Normalizer::CaseInsensitive
        } else {
            Normalizer::CaseSensitive
        }
    }

    pub fn normalize(self, rel_path: &str) -> String {
        let unified = normalize_separators(rel_path);
        match self {
            Normalizer::CaseSensitive => unified,
            Normalizer::CaseInsensitive => unified.to_lowercase(),
        }
    }
}

/// `/` separators, no leading `./` or slashes, no empty segments.
pub fn normalize_separators(rel_path: &str) -> String {
    rel_path
        .replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}
