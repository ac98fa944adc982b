use crate::{
    archive::{ArchiveService, DefaultArchives},
    config::AppConfig,
    game::{GameProfile, GameSupport, ResolvedGame},
    library::{Library, ModEntry},
    linking::{
        DeploymentEngine, ExternalChange, FileFailure, MethodRegistry, PurgeReport, SupportContext,
    },
    manifest::{load_manifest, manifest_path, normalize_separators, save_manifest, Manifest},
    merge::{build_merge_set, ArchiveMerger, FileMerger, StagedMod, MERGED_SOURCE},
    order::{apply_order, sort_mods, NoRuleLookup, RuleLookup},
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Rebuild the manifest from scratch instead of updating the previous one.
    pub reset: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub method: String,
    pub mod_count: usize,
    pub file_count: usize,
    pub added: usize,
    pub removed: usize,
    pub source_changed: usize,
    pub content_changed: usize,
    pub operations: usize,
    pub merged: Vec<String>,
    pub cycles: Vec<Vec<String>>,
    pub failures: Vec<FileFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<String>,
}

/// Runs deployments of one library into one game install.
pub struct Deployer {
    staging_root: PathBuf,
    data_dir: PathBuf,
    game: ResolvedGame,
    engine: DeploymentEngine,
    archives: Box<dyn ArchiveService>,
    rules: Box<dyn RuleLookup>,
    file_mergers: Vec<FileMerger>,
}

impl Deployer {
    pub fn new(
        staging_root: &Path,
        data_dir: &Path,
        game: ResolvedGame,
        engine: DeploymentEngine,
    ) -> Self {
        Self {
            staging_root: staging_root.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
            game,
            engine,
            archives: Box::new(DefaultArchives),
            rules: Box::new(NoRuleLookup),
            file_mergers: Vec::new(),
        }
    }

    /// Resolves the game profile and the deployment method named in `config`.
    pub fn from_config(config: &AppConfig, registry: &MethodRegistry) -> Result<Self> {
        if config.game_root.as_os_str().is_empty() {
            bail!("game_root is not configured");
        }
        let profile = match &config.game_profile {
            Some(path) => GameProfile::load(path)?,
            None => GameProfile {
                id: "generic".to_string(),
                name: "Generic game".to_string(),
                required_files: Vec::new(),
                mergeable_archives: Vec::new(),
                mod_paths: HashMap::new(),
            },
        };
        let game = profile.resolve(&config.game_root)?;
        let ctx = SupportContext {
            game_id: game.id.clone(),
            mod_type_id: String::new(),
            staging_root: config.staging_root.clone(),
            destination_root: config.game_root.clone(),
        };

        let method = if config.deployment_method.is_empty() {
            let (method, rejected) = registry.best_supported(&ctx);
            for (id, reason) in &rejected {
                info!(method = id, reason = %reason, "deployment method unavailable");
            }
            match method {
                Some(method) => method,
                None => {
                    let reasons: Vec<String> = rejected
                        .iter()
                        .map(|(id, reason)| format!("{id}: {reason}"))
                        .collect();
                    bail!("no deployment method is supported ({})", reasons.join("; "));
                }
            }
        } else {
            registry.supported(&config.deployment_method, &ctx)?
        };

        let engine = DeploymentEngine::new(method).with_max_parallel_ops(config.max_parallel_ops);
        Ok(Self::new(
            &config.staging_root,
            &config.data_dir,
            game,
            engine,
        ))
    }

    pub fn with_archives(mut self, archives: Box<dyn ArchiveService>) -> Self {
        self.archives = archives;
        self
    }

    pub fn with_rules(mut self, rules: Box<dyn RuleLookup>) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_file_merger(mut self, merger: FileMerger) -> Self {
        self.file_mergers.push(merger);
        self
    }

    pub fn engine(&self) -> &DeploymentEngine {
        &self.engine
    }

    pub fn game(&self) -> &ResolvedGame {
        &self.game
    }

    pub fn manifest_path(&self) -> PathBuf {
        manifest_path(&self.data_dir, self.engine.method().id())
    }

    fn load_previous(&self) -> Result<Manifest> {
        let manifest = load_manifest(&self.manifest_path())?;
        Ok(manifest.unwrap_or_else(|| {
            Manifest::new(self.engine.method().id(), &self.staging_root)
        }))
    }

    /// Enabled mods in ascending priority after applying ordering rules.
    pub fn ordered_mods(&self, library: &Library) -> (Vec<ModEntry>, Vec<Vec<String>>) {
        let mods = library.enabled_mods();
        let outcome = sort_mods(&mods, self.rules.as_ref());
        (apply_order(&mods, &outcome), outcome.cycles)
    }

    fn staged(&self, mods: &[ModEntry]) -> Result<Vec<StagedMod>> {
        let mut staged = Vec::with_capacity(mods.len());
        for mod_entry in mods {
            let destination = self.game.destination_for(&mod_entry.mod_type);
            let Ok(subpath) = destination.strip_prefix(&self.game.game_root) else {
                bail!(
                    "destination {} of mod {} is outside the game folder",
                    destination.display(),
                    mod_entry.id
                );
            };
            staged.push(StagedMod {
                source: mod_entry.installation_path.clone(),
                root: mod_entry.install_dir(&self.staging_root),
                subpath: normalize_separators(&subpath.to_string_lossy()),
            });
        }
        Ok(staged)
    }

    pub fn deploy_with_options(
        &self,
        library: &Library,
        options: &DeployOptions,
    ) -> Result<DeployReport> {
        self.game.verify_install()?;
        let (mods, cycles) = self.ordered_mods(library);
        let staged = self.staged(&mods)?;

        let previous = self.load_previous()?;
        let previous_outputs = previous
            .files
            .iter()
            .filter(|file| file.source == MERGED_SOURCE)
            .map(|file| file.rel_path.clone());
        let merger = ArchiveMerger::new(
            self.archives.as_ref(),
            &self.staging_root,
            &self.game.game_root,
        )
        .with_previous_outputs(previous_outputs)
        .with_max_parallel(self.engine.max_parallel_ops());
        let merge_set = build_merge_set(&staged, |rel| self.game.merge_archive(rel));
        let mut merged = merger.merge_all(&merge_set)?;
        merged.absorb(merger.merge_files(&self.file_mergers, &staged)?);
        let stale_outputs = merger
            .prune_output(&merged.produced)
            .context("prune merge output")?;

        let mut session = self.engine.prepare(
            &self.staging_root,
            &self.game.game_root,
            options.reset,
            previous,
        )?;

        if !options.reset {
            let current: HashSet<&str> = staged
                .iter()
                .map(|staged| staged.source.as_str())
                .chain(std::iter::once(MERGED_SOURCE))
                .collect();
            let stale: HashSet<String> = session
                .pending()
                .filter(|entry| !current.contains(entry.source.as_str()))
                .map(|entry| entry.source.clone())
                .collect();
            for source in stale {
                session.deactivate(&source);
            }
        }
        for staged_mod in &staged {
            session.deactivate(&staged_mod.source);
            session.activate(
                &staged_mod.root,
                &staged_mod.source,
                &staged_mod.subpath,
                &merged.blacklist,
            )?;
        }
        session.deactivate(MERGED_SOURCE);
        if merger.output_root().is_dir() {
            session.activate(&merger.output_root(), MERGED_SOURCE, "", &stale_outputs)?;
        }

        let result = session.finalize();
        save_manifest(&self.manifest_path(), &result.manifest)
            .context("save deployment manifest")?;
        merger
            .prune_output(&merged.produced)
            .context("prune merge output")?;

        let report = DeployReport {
            method: result.method.clone(),
            mod_count: mods.len(),
            file_count: result.manifest.files.len(),
            added: result.added,
            removed: result.removed,
            source_changed: result.source_changed,
            content_changed: result.content_changed,
            operations: result.operations,
            merged: merged.produced,
            cycles,
            notification: result.notification().map(|err| err.to_string()),
            failures: result.failures,
        };
        info!(
            method = %report.method,
            mods = report.mod_count,
            files = report.file_count,
            "deploy complete"
        );
        Ok(report)
    }

    /// Removes everything deployed and records an empty manifest.
    pub fn purge(&self) -> Result<PurgeReport> {
        let report = self
            .engine
            .purge(&self.staging_root, &self.game.game_root)?;
        if report.failed > 0 {
            warn!(failed = report.failed, "some deployed files could not be removed");
        }
        let mut manifest = Manifest::new(self.engine.method().id(), &self.staging_root);
        manifest.touch();
        save_manifest(&self.manifest_path(), &manifest).context("save deployment manifest")?;
        Ok(report)
    }

    /// Deployed files changed outside the deployment engine.
    pub fn check(&self) -> Result<Vec<ExternalChange>> {
        let manifest = self.load_previous()?;
        Ok(self
            .engine
            .external_changes(&manifest, &self.staging_root, &self.game.game_root))
    }
}
