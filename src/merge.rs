//! Content-level merging for files several mods ship a version of.
//!
//! Archives are unpacked over a baseline copy of the game's original and
//! repacked into a synthetic mod folder that deploys after every real mod.

use crate::{
    archive::{ArchiveOptions, ArchiveService},
    backup::{self, Presence, PLACEHOLDER_TAG},
    error::{DeployError, Result},
    linking::{moving, run_bounded, DEFAULT_MAX_PARALLEL_OPS},
    manifest::normalize_separators,
};
use blake3::Hasher;
use filetime::{set_file_mtime, FileTime};
use glob::{MatchOptions, Pattern};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Staging subfolder holding merge results.
pub const MERGED_SOURCE: &str = "__merged";

const SCRATCH_DIR: &str = ".modstage_merge";

/// A mod folder about to be activated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedMod {
    pub source: String,
    pub root: PathBuf,
    /// Sub-destination below the destination root, `/`-separated.
    pub subpath: String,
}

impl StagedMod {
    /// Destination-relative path of a file inside this mod.
    pub fn rel_path(&self, file: &Path) -> Option<String> {
        let in_mod = normalize_separators(&file.strip_prefix(&self.root).ok()?.to_string_lossy());
        Some(if self.subpath.is_empty() {
            in_mod
        } else {
            format!("{}/{in_mod}", self.subpath)
        })
    }

    fn files(&self) -> impl Iterator<Item = PathBuf> {
        WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && !backup::is_engine_file(entry.path()))
            .map(|entry| entry.into_path())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeContributor {
    pub source: String,
    pub archive: PathBuf,
}

/// Relative archive path to its contributors in ascending priority.
pub type MergeSet = BTreeMap<String, Vec<MergeContributor>>;

pub fn build_merge_set(mods: &[StagedMod], is_mergeable: impl Fn(&Path) -> bool) -> MergeSet {
    let mut set = MergeSet::new();
    for staged in mods {
        for file in staged.files() {
            let Some(rel) = staged.rel_path(&file) else {
                continue;
            };
            if !is_mergeable(Path::new(&rel)) {
                continue;
            }
            set.entry(rel).or_default().push(MergeContributor {
                source: staged.source.clone(),
                archive: file,
            });
        }
    }
    set
}

#[derive(Debug, Clone, Default)]
pub struct MergeOutcome {
    /// Relative paths written below the merge output folder.
    pub produced: Vec<String>,
    /// Mod files superseded by a merge result. Never activated directly.
    pub blacklist: HashSet<PathBuf>,
}

impl MergeOutcome {
    pub fn absorb(&mut self, other: MergeOutcome) {
        self.produced.extend(other.produced);
        self.blacklist.extend(other.blacklist);
    }
}

pub struct ArchiveMerger<'a> {
    archives: &'a dyn ArchiveService,
    staging_root: PathBuf,
    destination_root: PathBuf,
    previous_outputs: HashSet<String>,
    max_parallel: usize,
}

impl<'a> ArchiveMerger<'a> {
    pub fn new(archives: &'a dyn ArchiveService, staging_root: &Path, destination_root: &Path) -> Self {
        Self {
            archives,
            staging_root: staging_root.to_path_buf(),
            destination_root: destination_root.to_path_buf(),
            previous_outputs: HashSet::new(),
            max_parallel: DEFAULT_MAX_PARALLEL_OPS,
        }
    }

    /// Destination paths the last deployment served from the merge output.
    /// Live files at these paths are earlier results, never a baseline.
    pub fn with_previous_outputs(mut self, outputs: impl IntoIterator<Item = String>) -> Self {
        self.previous_outputs = outputs.into_iter().collect();
        self
    }

    pub fn with_max_parallel(mut self, limit: usize) -> Self {
        self.max_parallel = limit.max(1);
        self
    }

    pub fn output_root(&self) -> PathBuf {
        self.staging_root.join(MERGED_SOURCE)
    }

    fn scratch_root(&self) -> PathBuf {
        self.staging_root.join(SCRATCH_DIR)
    }

    /// Merges every archive in `set`, at most `max_parallel` at a time. The
    /// first failure aborts the whole pass.
    pub fn merge_all(&self, set: &MergeSet) -> Result<MergeOutcome> {
        let jobs: Vec<(usize, &String, &Vec<MergeContributor>)> = set
            .iter()
            .enumerate()
            .map(|(index, (rel, contributors))| (index, rel, contributors))
            .collect();
        let results = run_bounded(&jobs, self.max_parallel, |(index, rel, contributors)| {
            self.merge_archive(*index, rel, contributors)
        });
        let _ = fs::remove_dir(self.scratch_root());

        let mut outcome = MergeOutcome::default();
        for result in results {
            outcome.absorb(result?);
        }
        if !outcome.produced.is_empty() {
            info!(archives = outcome.produced.len(), "archives merged");
        }
        Ok(outcome)
    }

    /// Merges one archive path. Contributors apply in order; an entry only
    /// replaces the result when it differs from the baseline. An existing
    /// output with the same contents is left untouched.
    pub fn merge_archive(
        &self,
        index: usize,
        rel: &str,
        contributors: &[MergeContributor],
    ) -> Result<MergeOutcome> {
        let fail = |err: anyhow::Error| DeployError::archive_merge(rel, format!("{err:#}"));
        let scratch = self.scratch_root().join(index.to_string());
        let _guard = ScratchGuard::new(scratch.clone());
        let _ = fs::remove_dir_all(&scratch);
        let result_dir = scratch.join("result");
        fs::create_dir_all(&result_dir)?;

        let mut baseline = HashMap::new();
        if let Some(base) = self.baseline_for(rel)? {
            debug!(archive = rel, baseline = %base.display(), "extracting baseline");
            self.archives
                .open(&base, &ArchiveOptions::default())
                .and_then(|handle| handle.extract_all(&result_dir))
                .map_err(fail)?;
            baseline = fingerprint_tree(&result_dir)?;
        }

        for (position, contributor) in contributors.iter().enumerate() {
            let mod_dir = scratch.join(format!("mod_{position}"));
            self.archives
                .open(&contributor.archive, &ArchiveOptions::default())
                .and_then(|handle| handle.extract_all(&mod_dir))
                .map_err(fail)?;
            let mut changed = 0;
            for (entry_rel, path) in tree_files(&mod_dir) {
                if !differs_from(&baseline, &entry_rel, &path)? {
                    continue;
                }
                move_into(&path, &result_dir.join(&entry_rel))?;
                changed += 1;
            }
            debug!(archive = rel, source = %contributor.source, changed, "applied mod archive");
            let _ = fs::remove_dir_all(&mod_dir);
        }

        let outcome = MergeOutcome {
            produced: vec![rel.to_string()],
            blacklist: contributors
                .iter()
                .map(|contributor| contributor.archive.clone())
                .collect(),
        };
        if let Some(current) = self.current_output(rel) {
            if self.same_archive_contents(&current, &result_dir, &scratch.join("previous"))? {
                debug!(archive = rel, "merged archive unchanged");
                return Ok(outcome);
            }
        }

        self.write_output(rel, |output| {
            self.archives
                .open(output, &ArchiveOptions { create: true })
                .and_then(|handle| handle.create(&result_dir))
                .map_err(fail)
        })?;
        info!(archive = rel, contributors = contributors.len(), "merged archive");
        Ok(outcome)
    }

    /// Runs the loose-file mergers into scratch space and publishes outputs
    /// whose contents changed.
    pub fn merge_files(&self, mergers: &[FileMerger], mods: &[StagedMod]) -> Result<MergeOutcome> {
        if mergers.is_empty() {
            return Ok(MergeOutcome::default());
        }
        let build_root = self.scratch_root().join("files");
        let guard = ScratchGuard::new(build_root.clone());
        let _ = fs::remove_dir_all(&build_root);

        let outcome = run_file_mergers(mergers, mods, &build_root)?;
        for rel in &outcome.produced {
            let built = build_root.join(rel);
            if !built.is_file() {
                continue;
            }
            if let Some(current) = self.current_output(rel) {
                if hash_file(&current)? == hash_file(&built)? {
                    continue;
                }
            }
            self.write_output(rel, |output| Ok(move_into(&built, output)?))?;
            debug!(output = %rel, "merged file written");
        }

        drop(guard);
        let _ = fs::remove_dir(self.scratch_root());
        Ok(outcome)
    }

    /// Deletes outputs not produced by this pass. Outputs the move method has
    /// deployed stay behind their placeholders so the engine can return them;
    /// their paths are returned so activation can skip them.
    pub fn prune_output(&self, produced: &[String]) -> Result<HashSet<PathBuf>> {
        let root = self.output_root();
        let keep: HashSet<&str> = produced.iter().map(String::as_str).collect();
        let mut stale = HashSet::new();
        if !root.is_dir() {
            return Ok(stale);
        }
        for (rel, path) in tree_files(&root) {
            if let Some(source) = moving::placeholder_source(&path) {
                let Some(source_rel) = rel.strip_suffix(PLACEHOLDER_TAG) else {
                    continue;
                };
                if !keep.contains(source_rel) && !source.exists() {
                    stale.insert(source);
                }
                continue;
            }
            if backup::is_engine_file(&path) || keep.contains(rel.as_str()) {
                continue;
            }
            debug!(output = %rel, "removing stale merge output");
            fs::remove_file(&path)?;
        }
        Ok(stale)
    }

    /// Where the current output lives: in the output folder, or wherever the
    /// move method put it.
    fn current_output(&self, rel: &str) -> Option<PathBuf> {
        let output = self.output_root().join(rel);
        if output.is_file() {
            return Some(output);
        }
        let deployed = moving::read_placeholder(&backup::placeholder_path(&output)).ok()?;
        deployed.is_file().then_some(deployed)
    }

    /// Writes a new output through `write`. The result always carries a
    /// later mtime than the file it replaces so the engine sees the change.
    fn write_output(&self, rel: &str, write: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
        let output = self.output_root().join(rel);
        let replaced = self
            .current_output(rel)
            .and_then(|current| fs::metadata(current).ok())
            .map(|meta| FileTime::from_last_modification_time(&meta));
        write(&output)?;
        if let Some(replaced) = replaced {
            let written = FileTime::from_last_modification_time(&fs::metadata(&output)?);
            if written <= replaced {
                let bumped =
                    FileTime::from_unix_time(replaced.unix_seconds() + 1, replaced.nanoseconds());
                set_file_mtime(&output, bumped)?;
            }
        }
        Ok(())
    }

    fn same_archive_contents(&self, current: &Path, result_dir: &Path, extract_dir: &Path) -> Result<bool> {
        let extracted = self
            .archives
            .open(current, &ArchiveOptions::default())
            .and_then(|handle| handle.extract_all(extract_dir));
        if let Err(err) = extracted {
            debug!(path = %current.display(), error = %err, "previous merge result unreadable");
            return Ok(false);
        }
        Ok(fingerprint_tree(extract_dir)? == fingerprint_tree(result_dir)?)
    }

    /// Backup of the original if one exists, otherwise the live file unless it
    /// is a previous merge result.
    fn baseline_for(&self, rel: &str) -> Result<Option<PathBuf>> {
        let live = self.destination_root.join(rel);
        let backup = backup::backup_path(&live);
        if Presence::probe(&backup).is_present() {
            return Ok(Some(backup));
        }
        match Presence::probe(&live) {
            Presence::Absent => Ok(None),
            Presence::Unknown(err) => Err(err.into()),
            Presence::Present(_) => {
                if self.previous_outputs.contains(rel) {
                    return Ok(None);
                }
                match self.current_output(rel) {
                    Some(current) if hash_file(&current)? == hash_file(&live)? => Ok(None),
                    _ => Ok(Some(live)),
                }
            }
        }
    }
}

struct ScratchGuard {
    path: PathBuf,
}

impl ScratchGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for ScratchGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    size: u64,
    hash: [u8; 32],
}

fn hash_file(path: &Path) -> io::Result<[u8; 32]> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Hasher::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(*hasher.finalize().as_bytes())
}

fn tree_files(root: &Path) -> Vec<(String, PathBuf)> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(root).ok()?.to_string_lossy().to_string();
            Some((normalize_separators(&rel), entry.into_path()))
        })
        .collect()
}

fn fingerprint_tree(root: &Path) -> io::Result<HashMap<String, Fingerprint>> {
    let mut prints = HashMap::new();
    for (rel, path) in tree_files(root) {
        let size = fs::metadata(&path)?.len();
        prints.insert(
            rel,
            Fingerprint {
                size,
                hash: hash_file(&path)?,
            },
        );
    }
    Ok(prints)
}

/// Sizes are compared first; content is only hashed when they match.
fn differs_from(
    baseline: &HashMap<String, Fingerprint>,
    rel: &str,
    path: &Path,
) -> io::Result<bool> {
    let Some(base) = baseline.get(rel) else {
        return Ok(true);
    };
    if fs::metadata(path)?.len() != base.size {
        return Ok(true);
    }
    Ok(hash_file(path)? != base.hash)
}

fn move_into(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if to.exists() {
        fs::remove_file(to)?;
    }
    if fs::rename(from, to).is_err() {
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

type MergeFn = dyn Fn(&Path, &Path) -> anyhow::Result<()> + Send + Sync;

/// Merges loose files matched by pattern into one output, in mod order.
pub struct FileMerger {
    pub name: String,
    pub pattern: Pattern,
    /// Copied to their output path the first time the pattern matches.
    pub base_files: Vec<(PathBuf, String)>,
    /// Output path relative to the merge output folder.
    pub output: String,
    merge: Box<MergeFn>,
}

impl FileMerger {
    pub fn new(
        name: &str,
        pattern: Pattern,
        output: &str,
        merge: impl Fn(&Path, &Path) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            pattern,
            base_files: Vec::new(),
            output: output.to_string(),
            merge: Box::new(merge),
        }
    }

    pub fn with_base_file(mut self, input: PathBuf, output: &str) -> Self {
        self.base_files.push((input, output.to_string()));
        self
    }

    fn matches(&self, rel: &str) -> bool {
        let options = MatchOptions {
            case_sensitive: false,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        self.pattern.matches_with(rel, options)
    }
}

/// Applies `mergers` over `mods` in ascending priority.
pub fn run_file_mergers(
    mergers: &[FileMerger],
    mods: &[StagedMod],
    output_root: &Path,
) -> Result<MergeOutcome> {
    let mut outcome = MergeOutcome::default();
    let mut started = HashSet::new();
    for staged in mods {
        for file in staged.files() {
            let Some(rel) = staged.rel_path(&file) else {
                continue;
            };
            for (index, merger) in mergers.iter().enumerate() {
                if !merger.matches(&rel) {
                    continue;
                }
                let output = output_root.join(&merger.output);
                if started.insert(index) {
                    if output.exists() {
                        debug!(merger = %merger.name, "output exists, skipping base files");
                    } else {
                        for (input, out_rel) in &merger.base_files {
                            let target = output_root.join(out_rel);
                            if let Some(parent) = target.parent() {
                                fs::create_dir_all(parent)?;
                            }
                            fs::copy(input, &target)?;
                            if !outcome.produced.contains(out_rel) {
                                outcome.produced.push(out_rel.clone());
                            }
                        }
                    }
                    if !outcome.produced.contains(&merger.output) {
                        outcome.produced.push(merger.output.clone());
                    }
                }
                if let Some(parent) = output.parent() {
                    fs::create_dir_all(parent)?;
                }
                (merger.merge)(&file, &output)
                    .map_err(|err| DeployError::archive_merge(&output, format!("{err:#}")))?;
                outcome.blacklist.insert(file.clone());
            }
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::DefaultArchives;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in entries {
            let file = dir.path().join(name);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(file, content).unwrap();
        }
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        DefaultArchives
            .open(path, &ArchiveOptions { create: true })
            .unwrap()
            .create(dir.path())
            .unwrap();
    }

    fn read_zip(path: &Path) -> HashMap<String, String> {
        let dir = tempfile::tempdir().unwrap();
        DefaultArchives
            .open(path, &ArchiveOptions::default())
            .unwrap()
            .extract_all(dir.path())
            .unwrap();
        tree_files(dir.path())
            .into_iter()
            .map(|(rel, path)| (rel, fs::read_to_string(path).unwrap()))
            .collect()
    }

    fn staged(staging: &Path, source: &str) -> StagedMod {
        StagedMod {
            source: source.to_string(),
            root: staging.join(source),
            subpath: String::new(),
        }
    }

    #[test]
    fn merge_set_collects_contributors_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path();
        fs::create_dir_all(staging.join("a/Data")).unwrap();
        fs::create_dir_all(staging.join("b/Data")).unwrap();
        fs::write(staging.join("a/Data/pack.zip"), b"").unwrap();
        fs::write(staging.join("b/Data/pack.zip"), b"").unwrap();
        fs::write(staging.join("b/Data/plugin.esp"), b"").unwrap();

        let mods = vec![staged(staging, "a"), staged(staging, "b")];
        let set = build_merge_set(&mods, |rel| rel.extension().map(|e| e == "zip").unwrap_or(false));
        assert_eq!(set.len(), 1);
        let sources: Vec<_> = set["Data/pack.zip"].iter().map(|c| c.source.as_str()).collect();
        assert_eq!(sources, vec!["a", "b"]);
    }

    #[test]
    fn unchanged_later_mod_does_not_revert_earlier_change() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let game = dir.path().join("game");
        write_zip(&game.join("pack.zip"), &[("x.txt", "hash1"), ("y.txt", "base")]);
        write_zip(&staging.join("m1/pack.zip"), &[("x.txt", "hash2"), ("y.txt", "base")]);
        write_zip(&staging.join("m2/pack.zip"), &[("x.txt", "hash1"), ("y.txt", "m2")]);

        let mods = vec![staged(&staging, "m1"), staged(&staging, "m2")];
        let set = build_merge_set(&mods, |rel| rel == Path::new("pack.zip"));
        let merger = ArchiveMerger::new(&DefaultArchives, &staging, &game);
        let outcome = merger.merge_all(&set).unwrap();

        assert_eq!(outcome.produced, vec!["pack.zip"]);
        assert!(outcome.blacklist.contains(&staging.join("m1/pack.zip")));
        let merged = read_zip(&merger.output_root().join("pack.zip"));
        assert_eq!(merged["x.txt"], "hash2");
        assert_eq!(merged["y.txt"], "m2");
        assert!(!staging.join(SCRATCH_DIR).join("0").exists());
    }

    #[test]
    fn backup_is_preferred_as_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let game = dir.path().join("game");
        write_zip(&game.join("pack.zip"), &[("x.txt", "stale merge")]);
        write_zip(
            &backup::backup_path(&game.join("pack.zip")),
            &[("x.txt", "original"), ("z.txt", "kept")],
        );
        write_zip(&staging.join("m1/pack.zip"), &[("x.txt", "original")]);

        let set = build_merge_set(&[staged(&staging, "m1")], |_| true);
        let merger = ArchiveMerger::new(&DefaultArchives, &staging, &game);
        merger.merge_all(&set).unwrap();
        let merged = read_zip(&merger.output_root().join("pack.zip"));
        assert_eq!(merged["x.txt"], "original");
        assert_eq!(merged["z.txt"], "kept");
    }

    #[test]
    fn previous_result_is_not_used_as_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let game = dir.path().join("game");
        write_zip(&game.join("pack.zip"), &[("a.txt", "1"), ("b.txt", "2")]);
        write_zip(&staging.join("m1/pack.zip"), &[("a.txt", "1")]);

        let set = build_merge_set(&[staged(&staging, "m1")], |_| true);
        let merger = ArchiveMerger::new(&DefaultArchives, &staging, &game)
            .with_previous_outputs(["pack.zip".to_string()]);
        merger.merge_all(&set).unwrap();
        let merged = read_zip(&merger.output_root().join("pack.zip"));
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["a.txt"], "1");
    }

    #[test]
    fn identical_result_keeps_existing_output() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let game = dir.path().join("game");
        write_zip(&staging.join("m1/pack.zip"), &[("a.txt", "1")]);
        let set = build_merge_set(&[staged(&staging, "m1")], |_| true);
        let merger = ArchiveMerger::new(&DefaultArchives, &staging, &game).with_max_parallel(1);

        merger.merge_all(&set).unwrap();
        let output = merger.output_root().join("pack.zip");
        let old = FileTime::from_unix_time(1_000_000, 0);
        set_file_mtime(&output, old).unwrap();

        merger.merge_all(&set).unwrap();
        let meta = fs::metadata(&output).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta), old);

        write_zip(&staging.join("m1/pack.zip"), &[("a.txt", "2")]);
        merger.merge_all(&set).unwrap();
        let meta = fs::metadata(&output).unwrap();
        assert!(FileTime::from_last_modification_time(&meta) > old);
        assert_eq!(read_zip(&output)["a.txt"], "2");
    }

    #[test]
    fn prune_removes_unproduced_outputs_but_keeps_moved_ones() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let merger = ArchiveMerger::new(&DefaultArchives, &staging, &dir.path().join("game"));
        let root = merger.output_root();
        fs::create_dir_all(root.join("Data")).unwrap();
        fs::write(root.join("Data/kept.zip"), b"").unwrap();
        fs::write(root.join("Data/gone.zip"), b"").unwrap();
        fs::write(
            backup::placeholder_path(&root.join("Data/moved.zip")),
            b"/game/Data/moved.zip",
        )
        .unwrap();

        let stale = merger.prune_output(&["Data/kept.zip".to_string()]).unwrap();
        assert!(root.join("Data/kept.zip").exists());
        assert!(!root.join("Data/gone.zip").exists());
        assert!(backup::placeholder_path(&root.join("Data/moved.zip")).exists());
        assert_eq!(stale, HashSet::from([root.join("Data/moved.zip")]));
    }

    #[test]
    fn broken_archive_fails_the_merge() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        fs::create_dir_all(staging.join("m1")).unwrap();
        fs::write(staging.join("m1/pack.zip"), b"not a zip").unwrap();

        let set = build_merge_set(&[staged(&staging, "m1")], |_| true);
        let merger = ArchiveMerger::new(&DefaultArchives, &staging, &dir.path().join("game"));
        let err = merger.merge_all(&set).unwrap_err();
        assert!(matches!(err, DeployError::ArchiveMerge { .. }));
    }

    #[test]
    fn file_merger_copies_base_once_then_merges_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        let output_root = staging.join(MERGED_SOURCE);
        fs::create_dir_all(staging.join("a")).unwrap();
        fs::create_dir_all(staging.join("b")).unwrap();
        fs::write(staging.join("a/list.txt"), "a\n").unwrap();
        fs::write(staging.join("b/list.txt"), "b\n").unwrap();
        let base = dir.path().join("base.txt");
        fs::write(&base, "base\n").unwrap();

        let merger = FileMerger::new(
            "lists",
            Pattern::new("*.txt").unwrap(),
            "merged/list.txt",
            |input, output| {
                let mut existing = fs::read_to_string(output).unwrap_or_default();
                existing.push_str(&fs::read_to_string(input)?);
                fs::write(output, existing)?;
                Ok(())
            },
        )
        .with_base_file(base, "merged/list.txt");

        let mods = vec![staged(&staging, "a"), staged(&staging, "b")];
        let outcome = run_file_mergers(&[merger], &mods, &output_root).unwrap();
        assert_eq!(outcome.produced, vec!["merged/list.txt"]);
        assert_eq!(outcome.blacklist.len(), 2);
        assert_eq!(
            fs::read_to_string(output_root.join("merged/list.txt")).unwrap(),
            "base\na\nb\n"
        );
    }
}
