use super::method::{
    check_writable, ensure_parent, filesystem_id, DeploymentMethod, PurgeSummary, SupportContext,
    Unsupported,
};
use crate::backup::{self, PLACEHOLDER_TAG};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::warn;
use walkdir::WalkDir;

/// Moves staged files into the destination, leaving a placeholder that
/// records where each file went.
#[derive(Debug, Default, Clone, Copy)]
pub struct MoveMethod;

/// Destination recorded in a placeholder.
pub fn read_placeholder(placeholder: &Path) -> io::Result<PathBuf> {
    let raw = fs::read_to_string(placeholder)?;
    Ok(PathBuf::from(raw.trim_end()))
}

/// Staged file a placeholder stands in for.
pub fn placeholder_source(placeholder: &Path) -> Option<PathBuf> {
    let name = placeholder.file_name()?.to_string_lossy();
    let original = name.strip_suffix(PLACEHOLDER_TAG)?;
    if original.is_empty() {
        return None;
    }
    Some(placeholder.with_file_name(original))
}

impl DeploymentMethod for MoveMethod {
    fn id(&self) -> &'static str {
        "move"
    }

    fn name(&self) -> &'static str {
        "Move Deployment"
    }

    fn is_supported(&self, ctx: &SupportContext) -> Option<Unsupported> {
        if !ctx.destination_root.is_dir() {
            return Some(Unsupported::new(format!(
                "destination {} does not exist",
                ctx.destination_root.display()
            )));
        }
        if let Some(reason) = check_writable(&ctx.destination_root) {
            return Some(reason);
        }
        match (
            filesystem_id(&ctx.staging_root),
            filesystem_id(&ctx.destination_root),
        ) {
            (Ok(staging), Ok(dest)) if staging == dest => None,
            (Ok(_), Ok(_)) => Some(Unsupported::new(
                "staging folder and game must be on the same partition to move files",
            )),
            (Err(err), _) | (_, Err(err)) => {
                Some(Unsupported::new(format!("cannot stat filesystem: {err}")))
            }
        }
    }

    fn link_file(&self, dest: &Path, source: &Path) -> io::Result<()> {
        ensure_parent(dest)?;
        if let Ok(meta) = fs::symlink_metadata(dest) {
            if meta.is_dir() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("destination exists as directory: {}", dest.display()),
                ));
            }
            fs::remove_file(dest)?;
        }
        let placeholder = backup::placeholder_path(source);
        fs::write(&placeholder, dest.to_string_lossy().as_bytes())?;
        if let Err(err) = fs::rename(source, dest) {
            let _ = fs::remove_file(&placeholder);
            return Err(err);
        }
        Ok(())
    }

    fn unlink_file(&self, dest: &Path, source: &Path) -> io::Result<()> {
        let placeholder = backup::placeholder_path(source);
        if !placeholder.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} was not moved by this deployment", dest.display()),
            ));
        }
        ensure_parent(source)?;
        if source.exists() {
            // A newer file was staged in the meantime; the moved copy is stale.
            match fs::remove_file(dest) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
        } else {
            fs::rename(dest, source)?;
        }
        fs::remove_file(&placeholder)
    }

    fn is_link(&self, dest: &Path, source: &Path) -> bool {
        let placeholder = backup::placeholder_path(source);
        match read_placeholder(&placeholder) {
            Ok(recorded) => recorded == dest && dest.exists() && !source.exists(),
            Err(_) => false,
        }
    }

    fn can_restore(&self) -> bool {
        false
    }

    fn purge_links(&self, staging_root: &Path, _dest_root: &Path) -> io::Result<PurgeSummary> {
        let mut summary = PurgeSummary::default();
        for entry in WalkDir::new(staging_root).follow_links(false) {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(source) = placeholder_source(entry.path()) else {
                continue;
            };
            let result = read_placeholder(entry.path()).and_then(|dest| {
                if dest.exists() && !source.exists() {
                    fs::rename(&dest, &source)?;
                }
                fs::remove_file(entry.path())
            });
            match result {
                Ok(()) => summary.removed += 1,
                Err(err) => {
                    warn!(path = %source.display(), error = %err, "failed to move file back");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}
