use super::method::{
    check_writable, ensure_parent, filesystem_id, DeploymentMethod, PurgeSummary, SupportContext,
    Unsupported,
};
use crate::backup;
use std::{collections::HashSet, fs, io, path::Path};
use tracing::warn;
use walkdir::WalkDir;

/// Hardlinks staged files into the destination. Both must share a volume.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardlinkMethod;

impl DeploymentMethod for HardlinkMethod {
    fn id(&self) -> &'static str {
        "hardlink"
    }

    fn name(&self) -> &'static str {
        "Hardlink Deployment"
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
        if let Err(err) = fs::create_dir_all(&ctx.staging_root) {
            return Some(Unsupported::new(format!(
                "staging folder {} unavailable: {err}",
                ctx.staging_root.display()
            )));
        }
        match (
            filesystem_id(&ctx.staging_root),
            filesystem_id(&ctx.destination_root),
        ) {
            (Ok(staging), Ok(dest)) if staging == dest => None,
            (Ok(_), Ok(_)) => Some(Unsupported::new(
                "staging folder and game must be on the same partition for hardlinks",
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
        fs::hard_link(source, dest)
    }

    fn unlink_file(&self, dest: &Path, _source: &Path) -> io::Result<()> {
        fs::remove_file(dest)
    }

    fn is_link(&self, dest: &Path, source: &Path) -> bool {
        match (fs::symlink_metadata(dest), fs::metadata(source)) {
            (Ok(dest_meta), Ok(source_meta)) => {
                !dest_meta.file_type().is_symlink()
                    && FileIdentity::of(&dest_meta) == FileIdentity::of(&source_meta)
            }
            _ => false,
        }
    }

    fn can_restore(&self) -> bool {
        true
    }

    fn purge_links(&self, staging_root: &Path, dest_root: &Path) -> io::Result<PurgeSummary> {
        let mut staged = HashSet::new();
        for entry in WalkDir::new(staging_root).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if entry.file_type().is_file() {
                if let Ok(meta) = entry.metadata() {
                    staged.insert(FileIdentity::of(&meta));
                }
            }
        }

        let mut summary = PurgeSummary::default();
        for entry in WalkDir::new(dest_root).follow_links(false) {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().is_file() || backup::is_engine_file(entry.path()) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !staged.contains(&FileIdentity::of(&meta)) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => summary.removed += 1,
                Err(err) => {
                    warn!(path = %entry.path().display(), error = %err, "failed to purge hardlink");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    fn of(meta: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    // Hardlinks share metadata, so size and mtime stand in for the inode.
    #[cfg(not(unix))]
    fn of(meta: &fs::Metadata) -> Self {
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            dev: meta.len(),
            ino: mtime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_shares_content_and_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("staging/mod/a.txt");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"hello").unwrap();
        let dest = dir.path().join("game/a.txt");

        HardlinkMethod.link_file(&dest, &source).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"hello");
        assert!(HardlinkMethod.is_link(&dest, &source));

        let unrelated = dir.path().join("game/b.txt");
        fs::write(&unrelated, b"hello").unwrap();
        assert!(!HardlinkMethod.is_link(&unrelated, &source));

        HardlinkMethod.unlink_file(&dest, &source).unwrap();
        assert!(!dest.exists());
        assert!(source.exists());
    }

    #[test]
    fn purge_removes_only_staged_inodes() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let game = dir.path().join("game");
        let source = staging.join("mod/a.txt");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::create_dir_all(&game).unwrap();
        fs::write(&source, b"mod").unwrap();
        fs::write(game.join("user.txt"), b"user").unwrap();
        HardlinkMethod.link_file(&game.join("a.txt"), &source).unwrap();

        let summary = HardlinkMethod.purge_links(&staging, &game).unwrap();
        assert_eq!(summary.removed, 1);
        assert!(!game.join("a.txt").exists());
        assert!(game.join("user.txt").exists());
    }
}
