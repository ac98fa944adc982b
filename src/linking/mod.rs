//! Deployment engine: builds a manifest of files to expose, reconciles it with
//! what was deployed before and applies the difference through a
//! [`DeploymentMethod`].

pub mod hardlink;
pub mod method;
pub mod moving;
pub mod null;
pub mod queue;
pub mod symlink;

pub use method::{DeploymentMethod, MethodRegistry, PurgeSummary, SupportContext, Unsupported};
pub use queue::{DeployQueue, QueueTicket};

use crate::{
    backup::{self, Presence, SENTINEL_NAME},
    error::{self, DeployError, Result},
    manifest::{normalize_separators, DeployedFile, Manifest, Normalizer},
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread,
    time::UNIX_EPOCH,
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const DEFAULT_MAX_PARALLEL_OPS: usize = 100;

/// Archive junk and VCS folders that never belong in a game directory.
pub fn is_ignored_path(path: &Path) -> bool {
    path.components().any(|component| {
        let part = component.as_os_str().to_string_lossy();
        part.eq_ignore_ascii_case("__MACOSX")
            || part.eq_ignore_ascii_case(".ds_store")
            || part.eq_ignore_ascii_case("thumbs.db")
            || part == ".git"
            || part == ".svn"
            || part == ".vscode"
    })
}

#[derive(Clone)]
pub struct DeploymentEngine {
    method: Arc<dyn DeploymentMethod>,
    queue: DeployQueue,
    max_parallel_ops: usize,
}

impl fmt::Debug for DeploymentEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentEngine")
            .field("method", &self.method.id())
            .field("max_parallel_ops", &self.max_parallel_ops)
            .finish()
    }
}

impl DeploymentEngine {
    pub fn new(method: Arc<dyn DeploymentMethod>) -> Self {
        Self {
            method,
            queue: DeployQueue::new(),
            max_parallel_ops: DEFAULT_MAX_PARALLEL_OPS,
        }
    }

    /// Shares a queue with other engines targeting the same destination.
    pub fn with_queue(mut self, queue: DeployQueue) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_max_parallel_ops(mut self, limit: usize) -> Self {
        self.max_parallel_ops = limit.max(1);
        self
    }

    pub fn method(&self) -> &Arc<dyn DeploymentMethod> {
        &self.method
    }

    pub fn max_parallel_ops(&self) -> usize {
        self.max_parallel_ops
    }

    pub fn queue(&self) -> &DeployQueue {
        &self.queue
    }

    /// Starts a session. Blocks until earlier sessions on the queue finish.
    pub fn prepare(
        &self,
        staging_root: &Path,
        destination_root: &Path,
        reset: bool,
        previous: Manifest,
    ) -> Result<DeploymentSession> {
        let ticket = self.queue.enqueue();
        fs::create_dir_all(destination_root)?;
        let normalizer = Normalizer::detect(destination_root);
        let baseline = previous.keyed(normalizer);
        let entries = if reset {
            BTreeMap::new()
        } else {
            baseline.clone()
        };
        info!(
            method = self.method.id(),
            destination = %destination_root.display(),
            previous = baseline.len(),
            reset,
            "deployment prepared"
        );
        Ok(DeploymentSession {
            method: self.method.clone(),
            max_parallel_ops: self.max_parallel_ops,
            ticket,
            staging_root: staging_root.to_path_buf(),
            destination_root: destination_root.to_path_buf(),
            normalizer,
            template: Manifest::new(self.method.id(), staging_root),
            previous: baseline,
            entries,
            roots: HashMap::new(),
        })
    }

    /// Compares a manifest against the live filesystem.
    pub fn external_changes(
        &self,
        manifest: &Manifest,
        staging_root: &Path,
        destination_root: &Path,
    ) -> Vec<ExternalChange> {
        let mut changes = Vec::new();
        for file in &manifest.files {
            let source = staging_root.join(&file.source).join(file.path_in_mod());
            let dest = destination_root.join(&file.rel_path);
            if self.method.is_link(&dest, &source) {
                continue;
            }
            let dest_present = Presence::probe(&dest).is_present();
            let source_present = Presence::probe(&source).is_present()
                || Presence::probe(&backup::placeholder_path(&source)).is_present();
            let change = if !dest_present {
                ChangeType::Deleted
            } else if !source_present {
                if self.method.can_restore() {
                    ChangeType::SrcDeleted
                } else {
                    ChangeType::Deleted
                }
            } else {
                ChangeType::RefChange
            };
            changes.push(ExternalChange {
                rel_path: file.rel_path.clone(),
                source: file.source.clone(),
                change,
            });
        }
        changes
    }

    /// Removes every deployed artifact and restores displaced originals.
    pub fn purge(&self, staging_root: &Path, destination_root: &Path) -> Result<PurgeReport> {
        let _ticket = self.queue.enqueue();
        let links = self.method.purge_links(staging_root, destination_root)?;
        let cleanup = clean_destination(destination_root)?;
        let report = PurgeReport {
            removed: links.removed,
            failed: links.failed,
            restored: cleanup.restored,
            directories_removed: cleanup.directories_removed,
        };
        info!(
            method = self.method.id(),
            removed = report.removed,
            restored = report.restored,
            directories = report.directories_removed,
            "purge complete"
        );
        Ok(report)
    }
}

/// One deployment in progress. Holds the queue until finalized or dropped.
pub struct DeploymentSession {
    method: Arc<dyn DeploymentMethod>,
    max_parallel_ops: usize,
    ticket: QueueTicket,
    staging_root: PathBuf,
    destination_root: PathBuf,
    normalizer: Normalizer,
    template: Manifest,
    previous: BTreeMap<String, DeployedFile>,
    entries: BTreeMap<String, DeployedFile>,
    roots: HashMap<String, PathBuf>,
}

impl fmt::Debug for DeploymentSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentSession")
            .field("method", &self.method.id())
            .field("ticket", &self.ticket.number())
            .field("destination_root", &self.destination_root)
            .field("previous", &self.previous.len())
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl DeploymentSession {
    pub fn normalizer(&self) -> Normalizer {
        self.normalizer
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    /// Entries the session would deploy if finalized now.
    pub fn pending(&self) -> impl Iterator<Item = &DeployedFile> {
        self.entries.values()
    }

    /// Registers a mod's files. Later calls overwrite earlier ones on the same path.
    pub fn activate(
        &mut self,
        mod_root: &Path,
        source: &str,
        dest_subpath: &str,
        blacklist: &HashSet<PathBuf>,
    ) -> Result<usize> {
        let subpath = normalize_separators(dest_subpath);
        self.roots
            .insert(source.to_string(), mod_root.to_path_buf());
        if !mod_root.is_dir() {
            warn!(source, path = %mod_root.display(), "mod folder missing, nothing to activate");
            return Ok(0);
        }

        let mut count = 0;
        for entry in WalkDir::new(mod_root).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let Some((staged, time)) = staged_file(path)? else {
                continue;
            };
            let Ok(rel) = staged.strip_prefix(mod_root) else {
                continue;
            };
            if is_ignored_path(rel) || blacklist.contains(&staged) {
                continue;
            }

            let in_mod = normalize_separators(&rel.to_string_lossy());
            let rel_path = if subpath.is_empty() {
                in_mod
            } else {
                format!("{subpath}/{in_mod}")
            };
            let key = self.normalizer.normalize(&rel_path);
            self.entries.insert(
                key,
                DeployedFile {
                    rel_path,
                    source: source.to_string(),
                    target: (!subpath.is_empty()).then(|| subpath.clone()),
                    time,
                },
            );
            count += 1;
        }
        debug!(source, files = count, "activated");
        Ok(count)
    }

    /// Drops every pending entry owned by `source`.
    pub fn deactivate(&mut self, source: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.source != source);
        before - self.entries.len()
    }

    /// Applies the difference between the previous and the pending manifest.
    ///
    /// Individual file failures never abort the pass. Failed entries stay in
    /// whichever manifest matches the disk.
    pub fn finalize(mut self) -> FinalizeReport {
        let diff = ManifestDiff::between(&self.previous, &self.entries);
        let ctx = LinkContext {
            method: self.method.as_ref(),
            staging_root: &self.staging_root,
            destination_root: &self.destination_root,
            roots: &self.roots,
        };
        let mut failures = Vec::new();
        let mut operations = 0;

        let mut unlink_jobs = Vec::new();
        for key in &diff.removed {
            unlink_jobs.push((key.clone(), true));
        }
        for key in diff.source_changed.iter().chain(&diff.content_changed) {
            unlink_jobs.push((key.clone(), false));
        }
        let unlink_results = run_bounded(&unlink_jobs, self.max_parallel_ops, |(key, restore)| {
            match self.previous.get(key) {
                Some(entry) => ctx.unlink(entry, *restore),
                None => Ok(()),
            }
        });
        operations += unlink_jobs.len();

        let mut skip = HashSet::new();
        for ((key, removed), result) in unlink_jobs.iter().zip(unlink_results) {
            let Err(err) = result else { continue };
            let Some(old) = self.previous.get(key) else {
                continue;
            };
            warn!(path = %old.rel_path, error = %err, "failed to remove deployed file");
            failures.push(FileFailure {
                rel_path: old.rel_path.clone(),
                error: err.to_string(),
            });
            self.entries.insert(key.clone(), old.clone());
            if !removed {
                skip.insert(key.clone());
            }
        }

        let link_jobs: Vec<String> = diff
            .added
            .iter()
            .chain(&diff.source_changed)
            .chain(&diff.content_changed)
            .filter(|key| !skip.contains(*key))
            .cloned()
            .collect();
        let link_results = run_bounded(&link_jobs, self.max_parallel_ops, |key| {
            match self.entries.get(key) {
                Some(entry) => ctx.link(entry, self.previous.contains_key(key)),
                None => Ok(false),
            }
        });
        for (key, result) in link_jobs.iter().zip(link_results) {
            match result {
                Ok(true) => operations += 1,
                Ok(false) => {}
                Err(err) => {
                    operations += 1;
                    if let Some(entry) = self.entries.remove(key) {
                        warn!(path = %entry.rel_path, error = %err, "failed to deploy file");
                        failures.push(FileFailure {
                            rel_path: entry.rel_path,
                            error: err.to_string(),
                        });
                    }
                }
            }
        }

        let manifest = self.template.from_keyed(std::mem::take(&mut self.entries));
        let report = FinalizeReport {
            method: self.method.id().to_string(),
            added: diff.added.len(),
            removed: diff.removed.len(),
            source_changed: diff.source_changed.len(),
            content_changed: diff.content_changed.len(),
            operations,
            failures,
            manifest,
        };
        if let Some(notification) = report.notification() {
            warn!("{notification}");
        }
        info!(
            added = report.added,
            removed = report.removed,
            source_changed = report.source_changed,
            content_changed = report.content_changed,
            errors = report.failures.len(),
            "deployment finalized"
        );
        report
    }
}

struct LinkContext<'a> {
    method: &'a dyn DeploymentMethod,
    staging_root: &'a Path,
    destination_root: &'a Path,
    roots: &'a HashMap<String, PathBuf>,
}

impl LinkContext<'_> {
    fn source_path(&self, entry: &DeployedFile) -> PathBuf {
        let root = self
            .roots
            .get(&entry.source)
            .cloned()
            .unwrap_or_else(|| self.staging_root.join(&entry.source));
        root.join(entry.path_in_mod())
    }

    fn dest_path(&self, entry: &DeployedFile) -> PathBuf {
        self.destination_root.join(&entry.rel_path)
    }

    fn unlink(&self, entry: &DeployedFile, restore: bool) -> io::Result<()> {
        let dest = self.dest_path(entry);
        let source = self.source_path(entry);
        match self.method.unlink_file(&dest, &source) {
            Ok(()) => {}
            Err(err) if error::is_missing(&err) => {
                debug!(path = %dest.display(), "already removed");
            }
            Err(err) => return Err(err),
        }
        if restore {
            if let Err(err) = backup::restore(&dest) {
                warn!(path = %dest.display(), error = %err, "failed to restore backup");
            }
        }
        Ok(())
    }

    /// Returns whether a link had to be created. A path the previous
    /// deployment owned is never backed up: whatever is left there is ours.
    fn link(&self, entry: &DeployedFile, owned: bool) -> io::Result<bool> {
        let dest = self.dest_path(entry);
        let source = self.source_path(entry);
        if self.method.is_link(&dest, &source) {
            return Ok(false);
        }
        if let Some(parent) = dest.parent() {
            backup::create_managed_dirs(self.destination_root, parent)?;
        }
        let displaced = if owned {
            backup::remove_leftover(&dest)?;
            false
        } else {
            backup::displace(&dest)?
        };
        if let Err(err) = self.method.link_file(&dest, &source) {
            if displaced {
                if let Err(restore_err) = backup::restore(&dest) {
                    warn!(path = %dest.display(), error = %restore_err, "failed to restore backup");
                }
            }
            return Err(err);
        }
        Ok(true)
    }
}

/// Resolves a walked staging file to the file it represents. A move
/// placeholder stands for its file while that file is deployed.
fn staged_file(path: &Path) -> io::Result<Option<(PathBuf, i64)>> {
    if !backup::is_engine_file(path) {
        let meta = fs::metadata(path)?;
        return Ok(Some((path.to_path_buf(), modified_millis(&meta))));
    }
    let Some(source) = moving::placeholder_source(path) else {
        return Ok(None);
    };
    if source.exists() {
        return Ok(None);
    }
    let time = moving::read_placeholder(path)
        .and_then(fs::metadata)
        .or_else(|_| fs::metadata(path))
        .map(|meta| modified_millis(&meta))?;
    Ok(Some((source, time)))
}

fn modified_millis(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

/// Four disjoint sets of manifest keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub source_changed: Vec<String>,
    pub content_changed: Vec<String>,
}

impl ManifestDiff {
    pub fn between(
        previous: &BTreeMap<String, DeployedFile>,
        next: &BTreeMap<String, DeployedFile>,
    ) -> Self {
        let mut diff = ManifestDiff::default();
        for (key, entry) in next {
            match previous.get(key) {
                None => diff.added.push(key.clone()),
                Some(old) if old.source != entry.source => diff.source_changed.push(key.clone()),
                Some(old) if old.time != entry.time => diff.content_changed.push(key.clone()),
                Some(_) => {}
            }
        }
        for key in previous.keys() {
            if !next.contains_key(key) {
                diff.removed.push(key.clone());
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.source_changed.is_empty()
            && self.content_changed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub rel_path: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct FinalizeReport {
    pub method: String,
    pub added: usize,
    pub removed: usize,
    pub source_changed: usize,
    pub content_changed: usize,
    /// Link and unlink operations attempted on the filesystem.
    pub operations: usize,
    pub failures: Vec<FileFailure>,
    pub manifest: Manifest,
}

impl FinalizeReport {
    pub fn is_noop(&self) -> bool {
        self.added == 0
            && self.removed == 0
            && self.source_changed == 0
            && self.content_changed == 0
    }

    /// Aggregate error shown once per pass when files failed.
    pub fn notification(&self) -> Option<DeployError> {
        (!self.failures.is_empty()).then(|| DeployError::LockedFiles {
            count: self.failures.len(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// Destination no longer references the recorded source.
    RefChange,
    Deleted,
    /// Staged source is gone but the deployed copy survived.
    SrcDeleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternalChange {
    pub rel_path: String,
    pub source: String,
    pub change: ChangeType,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub removed: usize,
    pub failed: usize,
    pub restored: usize,
    pub directories_removed: usize,
}

#[derive(Debug, Default)]
struct Cleanup {
    restored: usize,
    directories_removed: usize,
}

/// Restores backups, then removes emptied directories that carry a sentinel
/// somewhere below them.
fn clean_destination(root: &Path) -> Result<Cleanup> {
    let mut cleanup = Cleanup::default();
    if !root.is_dir() {
        return Ok(cleanup);
    }

    let mut managed = HashSet::new();
    let mut sentinels = Vec::new();
    let mut backups = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.file_name().map(|name| name == SENTINEL_NAME).unwrap_or(false) {
            sentinels.push(path.to_path_buf());
            let mut dir = path.parent();
            while let Some(current) = dir {
                if current == root || !current.starts_with(root) {
                    break;
                }
                managed.insert(current.to_path_buf());
                dir = current.parent();
            }
        } else if backup::is_backup_file(path) {
            backups.push(path.to_path_buf());
        }
    }

    for backup_file in backups {
        let Some(original) = backup::original_path(&backup_file) else {
            continue;
        };
        match backup::restore(&original) {
            Ok(true) => cleanup.restored += 1,
            Ok(false) => {}
            Err(err) => warn!(path = %original.display(), error = %err, "failed to restore backup"),
        }
    }
    for sentinel in sentinels {
        if let Err(err) = fs::remove_file(&sentinel) {
            if !error::is_missing(&err) {
                warn!(path = %sentinel.display(), error = %err, "failed to remove marker");
            }
        }
    }

    let mut dirs: Vec<PathBuf> = managed.into_iter().collect();
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.components().count()));
    for dir in dirs {
        let empty = fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty && fs::remove_dir(&dir).is_ok() {
            cleanup.directories_removed += 1;
        }
    }
    Ok(cleanup)
}

/// Runs `job` over `items` on at most `limit` threads, keeping input order.
pub(crate) fn run_bounded<T, R, F>(items: &[T], limit: usize, job: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }
    let workers = limit.clamp(1, items.len());
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let next = &next;
            let job = &job;
            scope.spawn(move || loop {
                let index = next.fetch_add(1, Ordering::Relaxed);
                let Some(item) = items.get(index) else {
                    break;
                };
                if tx.send((index, job(item))).is_err() {
                    break;
                }
            });
        }
    });
    drop(tx);
    let mut results: Vec<(usize, R)> = rx.into_iter().collect();
    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linking::{hardlink::HardlinkMethod, null::NullMethod};

    struct Fixture {
        _dir: tempfile::TempDir,
        staging: PathBuf,
        game: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let game = dir.path().join("game");
        fs::create_dir_all(&staging).unwrap();
        fs::create_dir_all(&game).unwrap();
        Fixture {
            _dir: dir,
            staging,
            game,
        }
    }

    fn stage(fx: &Fixture, source: &str, rel: &str, content: &str) {
        let path = fx.staging.join(source).join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn deploy(engine: &DeploymentEngine, fx: &Fixture, mods: &[&str], previous: Manifest) -> FinalizeReport {
        let mut session = engine.prepare(&fx.staging, &fx.game, true, previous).unwrap();
        for source in mods {
            session
                .activate(&fx.staging.join(source), source, "", &HashSet::new())
                .unwrap();
        }
        session.finalize()
    }

    #[test]
    fn later_mods_win_and_rerun_is_noop() {
        let fx = fixture();
        stage(&fx, "a", "Data/shared.txt", "a");
        stage(&fx, "a", "Data/only_a.txt", "a");
        stage(&fx, "b", "Data/shared.txt", "b");
        let engine = DeploymentEngine::new(Arc::new(HardlinkMethod));

        let first = deploy(&engine, &fx, &["a", "b"], Manifest::default());
        assert_eq!(first.added, 2);
        assert!(first.failures.is_empty());
        assert_eq!(fs::read_to_string(fx.game.join("Data/shared.txt")).unwrap(), "b");

        let second = deploy(&engine, &fx, &["a", "b"], first.manifest.clone());
        assert!(second.is_noop());
        assert_eq!(second.operations, 0);
        assert_eq!(second.manifest.files, first.manifest.files);
    }

    #[test]
    fn removing_a_mod_unlinks_and_restores_backup() {
        let fx = fixture();
        fs::write(fx.game.join("config.ini"), "original").unwrap();
        stage(&fx, "a", "config.ini", "modded");
        let engine = DeploymentEngine::new(Arc::new(HardlinkMethod));

        let first = deploy(&engine, &fx, &["a"], Manifest::default());
        assert_eq!(fs::read_to_string(fx.game.join("config.ini")).unwrap(), "modded");
        assert!(backup::backup_path(&fx.game.join("config.ini")).exists());

        let second = deploy(&engine, &fx, &[], first.manifest);
        assert_eq!(second.removed, 1);
        assert_eq!(fs::read_to_string(fx.game.join("config.ini")).unwrap(), "original");
        assert!(second.manifest.is_empty());
    }

    #[test]
    fn source_change_relinks_to_new_owner() {
        let fx = fixture();
        stage(&fx, "a", "x.txt", "a");
        stage(&fx, "b", "x.txt", "b");
        let engine = DeploymentEngine::new(Arc::new(HardlinkMethod));

        let first = deploy(&engine, &fx, &["a"], Manifest::default());
        let second = deploy(&engine, &fx, &["a", "b"], first.manifest);
        assert_eq!(second.source_changed, 1);
        assert_eq!(fs::read_to_string(fx.game.join("x.txt")).unwrap(), "b");
        assert!(!backup::backup_path(&fx.game.join("x.txt")).exists());
    }

    #[test]
    fn seeded_session_supports_deactivate() {
        let fx = fixture();
        stage(&fx, "a", "x.txt", "a");
        stage(&fx, "b", "y.txt", "b");
        let engine = DeploymentEngine::new(Arc::new(NullMethod));
        let first = deploy(&engine, &fx, &["a", "b"], Manifest::default());

        let mut session = engine
            .prepare(&fx.staging, &fx.game, false, first.manifest)
            .unwrap();
        assert_eq!(session.pending().count(), 2);
        assert_eq!(session.deactivate("b"), 1);
        let report = session.finalize();
        assert_eq!(report.removed, 1);
        assert_eq!(report.manifest.files.len(), 1);
    }

    #[test]
    fn activate_applies_subpath_and_blacklist() {
        let fx = fixture();
        stage(&fx, "a", "Scripts/a.pex", "x");
        stage(&fx, "a", "textures.zip", "zip");
        stage(&fx, "a", "__MACOSX/junk", "junk");
        let engine = DeploymentEngine::new(Arc::new(NullMethod));
        let mut session = engine
            .prepare(&fx.staging, &fx.game, true, Manifest::default())
            .unwrap();
        let blacklist = HashSet::from([fx.staging.join("a/textures.zip")]);
        let count = session
            .activate(&fx.staging.join("a"), "a", "Data", &blacklist)
            .unwrap();
        assert_eq!(count, 1);
        let entry = session.pending().next().unwrap().clone();
        assert_eq!(entry.rel_path, "Data/Scripts/a.pex");
        assert_eq!(entry.target.as_deref(), Some("Data"));
        assert_eq!(entry.path_in_mod(), "Scripts/a.pex");
    }

    #[test]
    fn external_changes_are_classified() {
        let fx = fixture();
        stage(&fx, "a", "kept.txt", "k");
        stage(&fx, "a", "dest_gone.txt", "d");
        stage(&fx, "a", "src_gone.txt", "s");
        stage(&fx, "a", "replaced.txt", "r");
        let engine = DeploymentEngine::new(Arc::new(HardlinkMethod));
        let report = deploy(&engine, &fx, &["a"], Manifest::default());

        fs::remove_file(fx.game.join("dest_gone.txt")).unwrap();
        fs::remove_file(fx.staging.join("a/src_gone.txt")).unwrap();
        fs::remove_file(fx.game.join("replaced.txt")).unwrap();
        fs::write(fx.game.join("replaced.txt"), "user").unwrap();

        let mut changes = engine.external_changes(&report.manifest, &fx.staging, &fx.game);
        changes.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        let kinds: Vec<_> = changes
            .iter()
            .map(|change| (change.rel_path.as_str(), change.change))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("dest_gone.txt", ChangeType::Deleted),
                ("replaced.txt", ChangeType::RefChange),
                ("src_gone.txt", ChangeType::SrcDeleted),
            ]
        );
    }

    #[test]
    fn purge_cleans_only_managed_directories() {
        let fx = fixture();
        fs::create_dir_all(fx.game.join("Data")).unwrap();
        fs::write(fx.game.join("Data/base.esm"), "base").unwrap();
        stage(&fx, "a", "Data/base.esm", "patched");
        stage(&fx, "a", "Data/Textures/sky.dds", "sky");
        let engine = DeploymentEngine::new(Arc::new(HardlinkMethod));
        deploy(&engine, &fx, &["a"], Manifest::default());
        assert!(fx.game.join("Data/Textures").join(SENTINEL_NAME).exists());

        let report = engine.purge(&fx.staging, &fx.game).unwrap();
        assert_eq!(report.removed, 2);
        assert_eq!(report.restored, 1);
        assert_eq!(report.directories_removed, 1);
        assert!(!fx.game.join("Data/Textures").exists());
        assert_eq!(fs::read_to_string(fx.game.join("Data/base.esm")).unwrap(), "base");
    }

    #[test]
    fn diff_sets_are_disjoint() {
        let entry = |source: &str, time: i64| DeployedFile {
            rel_path: String::new(),
            source: source.to_string(),
            target: None,
            time,
        };
        let previous = BTreeMap::from([
            ("same".to_string(), entry("a", 1)),
            ("owner".to_string(), entry("a", 1)),
            ("content".to_string(), entry("a", 1)),
            ("gone".to_string(), entry("a", 1)),
        ]);
        let next = BTreeMap::from([
            ("same".to_string(), entry("a", 1)),
            ("owner".to_string(), entry("b", 1)),
            ("content".to_string(), entry("a", 2)),
            ("new".to_string(), entry("a", 1)),
        ]);
        let diff = ManifestDiff::between(&previous, &next);
        assert_eq!(diff.added, vec!["new"]);
        assert_eq!(diff.removed, vec!["gone"]);
        assert_eq!(diff.source_changed, vec!["owner"]);
        assert_eq!(diff.content_changed, vec!["content"]);
        assert!(ManifestDiff::between(&next, &next).is_empty());
    }

    #[test]
    fn run_bounded_keeps_order() {
        let items: Vec<usize> = (0..250).collect();
        let doubled = run_bounded(&items, 7, |n| n * 2);
        assert_eq!(doubled, items.iter().map(|n| n * 2).collect::<Vec<_>>());
    }

    /// Hardlinks everything except `locked.txt`, which is busy.
    struct BusyFileMethod {
        fail_unlink: bool,
        fail_link: bool,
    }

    fn is_busy(dest: &Path) -> bool {
        dest.file_name().map(|name| name == "locked.txt").unwrap_or(false)
    }

    fn busy() -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, "file in use")
    }

    impl DeploymentMethod for BusyFileMethod {
        fn id(&self) -> &'static str {
            "busy"
        }

        fn name(&self) -> &'static str {
            "Busy files"
        }

        fn is_supported(&self, _ctx: &SupportContext) -> Option<Unsupported> {
            None
        }

        fn link_file(&self, dest: &Path, source: &Path) -> io::Result<()> {
            if self.fail_link && is_busy(dest) {
                return Err(busy());
            }
            HardlinkMethod.link_file(dest, source)
        }

        fn unlink_file(&self, dest: &Path, source: &Path) -> io::Result<()> {
            if self.fail_unlink && is_busy(dest) {
                return Err(busy());
            }
            HardlinkMethod.unlink_file(dest, source)
        }

        fn is_link(&self, dest: &Path, source: &Path) -> bool {
            HardlinkMethod.is_link(dest, source)
        }

        fn can_restore(&self) -> bool {
            true
        }

        fn purge_links(&self, staging_root: &Path, dest_root: &Path) -> io::Result<PurgeSummary> {
            HardlinkMethod.purge_links(staging_root, dest_root)
        }
    }

    fn busy_engine(fail_unlink: bool, fail_link: bool) -> DeploymentEngine {
        DeploymentEngine::new(Arc::new(BusyFileMethod {
            fail_unlink,
            fail_link,
        }))
    }

    fn sources(report: &FinalizeReport) -> Vec<(String, String)> {
        report
            .manifest
            .files
            .iter()
            .map(|file| (file.rel_path.clone(), file.source.clone()))
            .collect()
    }

    #[test]
    fn failed_unlink_keeps_entry_and_counts_locked_files() {
        let fx = fixture();
        stage(&fx, "a", "locked.txt", "a");
        stage(&fx, "a", "free.txt", "a");
        let first = deploy(&busy_engine(false, false), &fx, &["a"], Manifest::default());
        assert!(first.failures.is_empty());

        let second = deploy(&busy_engine(true, false), &fx, &[], first.manifest);
        assert_eq!(second.removed, 2);
        assert_eq!(second.failures.len(), 1);
        assert_eq!(second.failures[0].rel_path, "locked.txt");
        assert_eq!(sources(&second), vec![("locked.txt".to_string(), "a".to_string())]);
        assert!(fx.game.join("locked.txt").exists());
        assert!(!fx.game.join("free.txt").exists());
        assert!(matches!(
            second.notification(),
            Some(DeployError::LockedFiles { count: 1 })
        ));
    }

    #[test]
    fn failed_unlink_skips_relink_to_new_owner() {
        let fx = fixture();
        stage(&fx, "a", "locked.txt", "a");
        stage(&fx, "b", "locked.txt", "b");
        let first = deploy(&busy_engine(false, false), &fx, &["a"], Manifest::default());

        let second = deploy(&busy_engine(true, false), &fx, &["a", "b"], first.manifest);
        assert_eq!(second.source_changed, 1);
        assert_eq!(second.operations, 1);
        assert_eq!(second.failures.len(), 1);
        assert_eq!(sources(&second), vec![("locked.txt".to_string(), "a".to_string())]);
        assert_eq!(fs::read_to_string(fx.game.join("locked.txt")).unwrap(), "a");
    }

    #[test]
    fn failed_link_drops_entry_and_restores_original() {
        let fx = fixture();
        fs::write(fx.game.join("locked.txt"), "original").unwrap();
        stage(&fx, "a", "locked.txt", "a");
        stage(&fx, "a", "free.txt", "a");

        let report = deploy(&busy_engine(false, true), &fx, &["a"], Manifest::default());
        assert_eq!(report.added, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(sources(&report), vec![("free.txt".to_string(), "a".to_string())]);
        assert_eq!(fs::read_to_string(fx.game.join("locked.txt")).unwrap(), "original");
        assert!(!backup::backup_path(&fx.game.join("locked.txt")).exists());
        assert!(report.notification().is_some());
    }

    #[test]
    fn owned_leftover_is_replaced_without_backup() {
        let fx = fixture();
        stage(&fx, "a", "x.txt", "a");
        let engine = DeploymentEngine::new(Arc::new(moving::MoveMethod));
        let first = deploy(&engine, &fx, &["a"], Manifest::default());
        assert_eq!(fs::read_to_string(fx.game.join("x.txt")).unwrap(), "a");

        // Placeholder lost and the mod re-staged: the deployed copy is still ours.
        fs::remove_file(backup::placeholder_path(&fx.staging.join("a/x.txt"))).unwrap();
        stage(&fx, "a", "x.txt", "a2");
        let mut previous = first.manifest;
        previous.files[0].time -= 1;

        let second = deploy(&engine, &fx, &["a"], previous);
        assert_eq!(second.content_changed, 1);
        assert!(second.failures.is_empty());
        assert_eq!(fs::read_to_string(fx.game.join("x.txt")).unwrap(), "a2");
        assert!(!backup::backup_path(&fx.game.join("x.txt")).exists());
    }
}
