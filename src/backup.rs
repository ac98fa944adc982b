//! Files the engine owns inside a destination: backups of displaced originals
//! and markers on directories created during deployment.

use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Suffix appended to a real file displaced by a deployed link.
pub const BACKUP_TAG: &str = ".modstage_backup";

/// Marker placed in every directory created while linking.
pub const SENTINEL_NAME: &str = "__folder_managed_by_modstage";

/// Suffix of the marker left in staging where a moved file used to be.
pub const PLACEHOLDER_TAG: &str = ".modstage_placeholder";

/// Result of probing for a file without using errors as control flow.
#[derive(Debug)]
pub enum Presence {
    Present(fs::Metadata),
    Absent,
    Unknown(io::Error),
}

impl Presence {
    pub fn probe(path: &Path) -> Presence {
        match fs::symlink_metadata(path) {
            Ok(meta) => Presence::Present(meta),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Presence::Absent,
            Err(err) => Presence::Unknown(err),
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Presence::Present(_))
    }
}

pub fn backup_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(BACKUP_TAG);
    PathBuf::from(name)
}

pub fn is_backup_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().ends_with(BACKUP_TAG))
        .unwrap_or(false)
}

/// Original path of a backup file.
pub fn original_path(backup: &Path) -> Option<PathBuf> {
    let name = backup.file_name()?.to_string_lossy();
    let original = name.strip_suffix(BACKUP_TAG)?;
    if original.is_empty() {
        return None;
    }
    Some(backup.with_file_name(original))
}

pub fn is_engine_file(path: &Path) -> bool {
    path.file_name()
        .map(|name| {
            let name = name.to_string_lossy();
            name == SENTINEL_NAME || name.ends_with(BACKUP_TAG) || name.ends_with(PLACEHOLDER_TAG)
        })
        .unwrap_or(false)
}

pub fn placeholder_path(source: &Path) -> PathBuf {
    let mut name = OsString::from(source.as_os_str());
    name.push(PLACEHOLDER_TAG);
    PathBuf::from(name)
}

/// Moves an unrelated file out of the way of a link. Returns whether a backup was taken.
pub fn displace(dest: &Path) -> io::Result<bool> {
    match Presence::probe(dest) {
        Presence::Absent => Ok(false),
        Presence::Unknown(err) => Err(err),
        Presence::Present(meta) if meta.is_dir() => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("destination exists as directory: {}", dest.display()),
        )),
        Presence::Present(_) => {
            let backup = backup_path(dest);
            match Presence::probe(&backup) {
                Presence::Absent => {
                    debug!(path = %dest.display(), "backing up existing file");
                    fs::rename(dest, &backup)?;
                    Ok(true)
                }
                Presence::Present(_) => {
                    // The pre-deployment original is already preserved; what
                    // occupies the path now is a leftover of an earlier deployment.
                    fs::remove_file(dest)?;
                    Ok(false)
                }
                Presence::Unknown(err) => Err(err),
            }
        }
    }
}

/// Clears a stale file an earlier deployment left behind, without a backup.
pub fn remove_leftover(dest: &Path) -> io::Result<()> {
    match Presence::probe(dest) {
        Presence::Absent => Ok(()),
        Presence::Unknown(err) => Err(err),
        Presence::Present(meta) if meta.is_dir() => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("destination exists as directory: {}", dest.display()),
        )),
        Presence::Present(_) => {
            debug!(path = %dest.display(), "removing leftover of earlier deployment");
            fs::remove_file(dest)
        }
    }
}

/// Puts a displaced original back once its link is gone.
pub fn restore(dest: &Path) -> io::Result<bool> {
    let backup = backup_path(dest);
    match Presence::probe(&backup) {
        Presence::Absent => Ok(false),
        Presence::Unknown(err) => Err(err),
        Presence::Present(_) => {
            if Presence::probe(dest).is_present() {
                warn!(
                    path = %dest.display(),
                    "cannot restore backup, destination is occupied"
                );
                return Ok(false);
            }
            fs::rename(&backup, dest)?;
            debug!(path = %dest.display(), "restored backup");
            Ok(true)
        }
    }
}

/// Creates `dir` and any missing parents below `root`, marking each new directory.
pub fn create_managed_dirs(root: &Path, dir: &Path) -> io::Result<()> {
    let mut missing = Vec::new();
    let mut current = dir;
    while current != root && !current.exists() {
        missing.push(current.to_path_buf());
        match current.parent() {
            Some(parent) => current = parent,
            None => break,
        }
    }
    fs::create_dir_all(dir)?;
    for created in missing {
        let sentinel = created.join(SENTINEL_NAME);
        if !sentinel.exists() {
            fs::write(&sentinel, b"")?;
        }
    }
    Ok(())
}
