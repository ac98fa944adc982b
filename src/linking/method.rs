use crate::error::DeployError;
use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};

/// Inputs a method needs to judge whether it can deploy a game's mods.
#[derive(Debug, Clone)]
pub struct SupportContext {
    pub game_id: String,
    pub mod_type_id: String,
    pub staging_root: PathBuf,
    pub destination_root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsupported {
    pub description: String,
}

impl Unsupported {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub removed: usize,
    pub failed: usize,
}

/// OS-level primitives of one deployment strategy.
pub trait DeploymentMethod: Send + Sync {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    /// `None` when usable, otherwise the reason it is not.
    fn is_supported(&self, ctx: &SupportContext) -> Option<Unsupported>;
    fn link_file(&self, dest: &Path, source: &Path) -> io::Result<()>;
    fn unlink_file(&self, dest: &Path, source: &Path) -> io::Result<()>;
    fn is_link(&self, dest: &Path, source: &Path) -> bool;
    /// Whether deployed content survives deletion of its staging source.
    fn can_restore(&self) -> bool;
    fn purge_links(&self, staging_root: &Path, dest_root: &Path) -> io::Result<PurgeSummary>;
}

/// Methods known to the application, in order of preference.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: Vec<Arc<dyn DeploymentMethod>>,
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.methods.iter().map(|method| method.id()))
            .finish()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hardlink, symlink and move, in that order of preference.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::hardlink::HardlinkMethod));
        registry.register(Arc::new(super::symlink::SymlinkMethod));
        registry.register(Arc::new(super::moving::MoveMethod));
        registry
    }

    pub fn register(&mut self, method: Arc<dyn DeploymentMethod>) {
        self.methods.retain(|existing| existing.id() != method.id());
        self.methods.push(method);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn DeploymentMethod>, DeployError> {
        self.methods
            .iter()
            .find(|method| method.id() == id)
            .cloned()
            .ok_or_else(|| DeployError::UnknownMethod(id.to_string()))
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.methods.iter().map(|method| method.id()).collect()
    }

    /// Resolves `id` and verifies it can serve `ctx`.
    pub fn supported(
        &self,
        id: &str,
        ctx: &SupportContext,
    ) -> Result<Arc<dyn DeploymentMethod>, DeployError> {
        let method = self.get(id)?;
        match method.is_supported(ctx) {
            None => Ok(method),
            Some(reason) => Err(DeployError::UnsupportedMethod {
                id: id.to_string(),
                reason: reason.description,
            }),
        }
    }

    /// First usable method plus the reasons the preferred ones were skipped.
    pub fn best_supported(
        &self,
        ctx: &SupportContext,
    ) -> (Option<Arc<dyn DeploymentMethod>>, Vec<(&'static str, Unsupported)>) {
        let mut rejected = Vec::new();
        for method in &self.methods {
            match method.is_supported(ctx) {
                None => return (Some(method.clone()), rejected),
                Some(reason) => rejected.push((method.id(), reason)),
            }
        }
        (None, rejected)
    }
}

/// Shared check: the destination must accept new files.
pub(crate) fn check_writable(dir: &Path) -> Option<Unsupported> {
    let probe = dir.join(format!(".modstage_write_probe_{}", std::process::id()));
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            None
        }
        Err(err) => Some(Unsupported::new(format!(
            "{} is not writable: {err}",
            dir.display()
        ))),
    }
}

#[cfg(unix)]
pub(crate) fn filesystem_id(path: &Path) -> io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(std::fs::metadata(path)?.dev())
}

#[cfg(not(unix))]
pub(crate) fn filesystem_id(path: &Path) -> io::Result<u64> {
    let _ = std::fs::metadata(path)?;
    Ok(0)
}

/// Creates the parent directory of `dest`.
pub(crate) fn ensure_parent(dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}
