use super::method::{
    check_writable, ensure_parent, DeploymentMethod, PurgeSummary, SupportContext, Unsupported,
};
use std::{fs, io, path::Path};
use tracing::warn;
use walkdir::WalkDir;

/// Symlinks pointing into the staging folder. Works across volumes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SymlinkMethod;

#[cfg(unix)]
fn create_symlink(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, dest)
}

#[cfg(windows)]
fn create_symlink(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(source, dest)
}

#[cfg(not(any(unix, windows)))]
fn create_symlink(_source: &Path, _dest: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Other,
        "symlink unavailable on this platform",
    ))
}

impl DeploymentMethod for SymlinkMethod {
    fn id(&self) -> &'static str {
        "symlink"
    }

    fn name(&self) -> &'static str {
        "Symlink Deployment"
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

        let probe_target = ctx.destination_root.join(".modstage_symlink_target");
        let probe_link = ctx.destination_root.join(".modstage_symlink_probe");
        let result = fs::write(&probe_target, b"")
            .and_then(|()| create_symlink(&probe_target, &probe_link));
        let _ = fs::remove_file(&probe_link);
        let _ = fs::remove_file(&probe_target);
        match result {
            Ok(()) => None,
            Err(err) => Some(Unsupported::new(format!(
                "filesystem does not allow symlinks: {err}"
            ))),
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
        match create_symlink(source, dest) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(dest);
                Err(err)
            }
        }
    }

    fn unlink_file(&self, dest: &Path, _source: &Path) -> io::Result<()> {
        fs::remove_file(dest)
    }

    fn is_link(&self, dest: &Path, source: &Path) -> bool {
        match fs::read_link(dest) {
            Ok(target) => target == source,
            Err(_) => false,
        }
    }

    fn can_restore(&self) -> bool {
        false
    }

    fn purge_links(&self, staging_root: &Path, dest_root: &Path) -> io::Result<PurgeSummary> {
        let mut summary = PurgeSummary::default();
        for entry in WalkDir::new(dest_root).follow_links(false) {
            let Ok(entry) = entry else { continue };
            if !entry.path_is_symlink() {
                continue;
            }
            let Ok(target) = fs::read_link(entry.path()) else {
                continue;
            };
            if !target.starts_with(staging_root) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => summary.removed += 1,
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "failed to purge symlink");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}
