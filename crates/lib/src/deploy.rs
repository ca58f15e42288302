//! The deployment pipeline: resolve, cache and verify, materialize,
//! register, record, collect.
//!
//! Everything before the ledger update is undone by a single rollback
//! path if any step fails; prior deployments and the shared `var` are
//! never touched by it.

use crate::bootloader::{BootRegistry, Registrar};
use crate::bundle::Bundle;
use crate::cache::{self, BundleCache};
use crate::config::Config;
use crate::error::{Error, FilesystemContext, Result};
use crate::initramfs::InitramfsBuilder;
use crate::ledger::Ledger;
use crate::materialize::Materializer;
use crate::repo::{validate_target, ManifestEntry, Repository, LATEST};
use crate::retention::{CollectReport, Collector};
use crate::snapshot::SnapshotFilesystem;
use crate::store::Storage;

/// A successful deploy.
#[derive(Debug)]
pub(crate) struct Deployed {
    pub(crate) target: String,
    pub(crate) entry: ManifestEntry,
    pub(crate) collected: CollectReport,
}

/// Outcome of `update`.
#[derive(Debug)]
pub(crate) enum Update {
    /// The newest version is the current deployment.
    UpToDate { id: String },
    Deployed(Deployed),
}

/// The external systems a deploy acts on.
pub(crate) struct Deployer<'a> {
    pub(crate) config: &'a Config,
    pub(crate) storage: &'a Storage,
    pub(crate) repo: &'a Repository,
    pub(crate) fs: &'a dyn SnapshotFilesystem,
    pub(crate) registry: &'a dyn BootRegistry,
    pub(crate) initramfs: &'a dyn InitramfsBuilder,
}

impl std::fmt::Debug for Deployer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployer")
            .field("config", &self.config)
            .field("storage", &self.storage)
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

impl Deployer<'_> {
    fn target<'t>(&'t self, target: Option<&'t str>) -> Result<&'t str> {
        let target = target.unwrap_or(&self.config.repo_default_image);
        validate_target(target)?;
        Ok(target)
    }

    fn load_ledger(&self) -> Result<Ledger> {
        Ledger::load(&self.storage.root_dir).fs_context("Reading ledger")
    }

    /// Deploy `selector` (default: latest) of `target` (default: the
    /// configured image).
    pub(crate) fn deploy(&self, target: Option<&str>, selector: Option<&str>) -> Result<Deployed> {
        let target = self.target(target)?;
        let entry = self.repo.resolve(target, selector.unwrap_or(LATEST))?;
        self.deploy_entry(target, entry)
    }

    /// Deploy the newest version of `target` unless it is already current.
    pub(crate) fn update(&self, target: Option<&str>) -> Result<Update> {
        let target = self.target(target)?;
        let entry = self.repo.resolve(target, LATEST)?;
        let ledger = self.load_ledger()?;
        if ledger.head() == Some(entry.id.as_str()) {
            return Ok(Update::UpToDate { id: entry.id });
        }
        self.deploy_entry(target, entry).map(Update::Deployed)
    }

    fn deploy_entry(&self, target: &str, entry: ManifestEntry) -> Result<Deployed> {
        let id = entry.id.as_str();
        let mut ledger = self.load_ledger()?;
        if ledger.contains(id) {
            return Err(Error::AlreadyDeployed { id: id.to_owned() });
        }

        let materializer =
            Materializer::new(self.fs, self.initramfs, self.storage, self.config);
        let leftover = self
            .storage
            .deployment_dir(id)
            .try_exists()
            .fs_context("Checking for interrupted deployment")?;
        if leftover {
            tracing::warn!("Cleaning up interrupted deployment of {id}");
            self.rollback(&materializer, id);
            // Only images extracted from the bundle verified below are applied
            cache::evict_layers(&self.storage.cache_dir(), id)
                .fs_context("Discarding stale layer images")?;
        }

        tracing::info!("Deploying {id} ({target} {})", entry.version);
        if let Err(e) = self.install(&materializer, &mut ledger, target, &entry) {
            tracing::error!("Deployment of {id} failed: {e}");
            self.rollback(&materializer, id);
            return Err(e);
        }

        let collector = Collector::new(self.fs, self.registry, self.storage);
        let collected = collector.collect(&mut ledger, self.config.deploy_keep)?;
        if !collected.is_empty() {
            tracing::info!("Retention pass after {id}: {collected}");
        }
        Ok(Deployed {
            target: target.to_owned(),
            entry,
            collected,
        })
    }

    /// Every step whose failure is rolled back.
    fn install(
        &self,
        materializer: &Materializer,
        ledger: &mut Ledger,
        target: &str,
        entry: &ManifestEntry,
    ) -> Result<()> {
        let cache_dir = self.storage.cache_dir();
        let cache = BundleCache::new(&cache_dir, self.repo);
        let path = cache.ensure_cached(target, entry)?;
        let bundle = Bundle::new(path, entry, &cache_dir);
        materializer.materialize(&entry.id, target, &bundle)?;

        let registrar = Registrar::load(self.registry, &self.storage.template_path())
            .map_err(|source| Error::BootRegistration {
                id: entry.id.clone(),
                source,
            })?;
        registrar.register(&entry.id)?;

        ledger.prepend(&entry.id);
        ledger
            .save(&self.storage.root_dir)
            .fs_context("Recording deployment")?;
        Ok(())
    }

    /// Undo a partial deployment of `id`. Never fails.
    fn rollback(&self, materializer: &Materializer, id: &str) {
        if let Err(e) = self.registry.remove_entry(id) {
            tracing::warn!("Rollback of {id}: {e:#}");
        }
        materializer.rollback(id);
    }
}
