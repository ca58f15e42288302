//! Garbage collection of superseded deployments.
//!
//! Only the `deploy_keep` most recent ledger entries are retained. For
//! each deployment beyond that, all of its filesystem state is removed
//! before its ledger line; an interrupted pass leaves at worst a ledger
//! entry pointing at a partially removed deployment, which the next pass
//! finishes off.

use std::num::NonZeroUsize;

use crate::bootloader::BootRegistry;
use crate::cache;
use crate::error::{FilesystemContext, Result};
use crate::ledger::Ledger;
use crate::snapshot::{remove_tree, SnapshotFilesystem};
use crate::store::Storage;

/// What a collection pass removed.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct CollectReport {
    /// Deployments beyond the retention count.
    pub(crate) removed: Vec<String>,
    /// Ledger entries whose deployment was already gone.
    pub(crate) dangling: Vec<String>,
    /// Deployments present on disk but not in the ledger.
    pub(crate) orphans: Vec<String>,
}

impl CollectReport {
    pub(crate) fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.dangling.is_empty() && self.orphans.is_empty()
    }
}

impl std::fmt::Display for CollectReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} removed, {} dangling, {} orphaned",
            self.removed.len(),
            self.dangling.len(),
            self.orphans.len()
        )
    }
}

pub(crate) struct Collector<'a> {
    fs: &'a dyn SnapshotFilesystem,
    registry: &'a dyn BootRegistry,
    storage: &'a Storage,
}

impl std::fmt::Debug for Collector<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("storage", &self.storage)
            .finish_non_exhaustive()
    }
}

impl<'a> Collector<'a> {
    pub(crate) fn new(
        fs: &'a dyn SnapshotFilesystem,
        registry: &'a dyn BootRegistry,
        storage: &'a Storage,
    ) -> Self {
        Self {
            fs,
            registry,
            storage,
        }
    }

    /// Remove the boot entry, snapshot tree, kernel artifacts and cached
    /// bundle of `id`. The ledger is left alone. Succeeds for parts that
    /// are already gone.
    pub(crate) fn remove_deployment(&self, id: &str) -> Result<()> {
        tracing::debug!("Removing deployment {id}");
        self.registry
            .remove_entry(id)
            .with_fs_context(|| format!("Removing boot entry of {id}"))?;
        remove_tree(self.fs, &self.storage.deployment_dir(id))
            .with_fs_context(|| format!("Removing snapshots of {id}"))?;
        let kdir = self.storage.kernel_dir(id);
        if kdir.try_exists().fs_context("Checking kernel artifacts")? {
            std::fs::remove_dir_all(&kdir).with_fs_context(|| format!("Removing {kdir}"))?;
        }
        cache::evict(&self.storage.cache_dir(), id)
            .with_fs_context(|| format!("Evicting cached bundle of {id}"))?;
        Ok(())
    }

    fn drop_from_ledger(&self, ledger: &mut Ledger, id: &str) -> Result<()> {
        ledger.remove(id);
        ledger
            .save(&self.storage.root_dir)
            .with_fs_context(|| format!("Removing {id} from ledger"))
    }

    /// Bring the system in line with the retention policy. The ledger is
    /// saved after each removal.
    pub(crate) fn collect(&self, ledger: &mut Ledger, keep: NonZeroUsize) -> Result<CollectReport> {
        let mut report = CollectReport::default();

        let ids: Vec<String> = ledger.iter().map(ToOwned::to_owned).collect();
        for id in ids {
            let present = self
                .storage
                .deployment_dir(&id)
                .try_exists()
                .fs_context("Checking deployment")?;
            if present {
                continue;
            }
            tracing::warn!("Ledger entry {id} has no deployment; removing it");
            self.remove_deployment(&id)?;
            self.drop_from_ledger(ledger, &id)?;
            report.dangling.push(id);
        }

        for id in ledger.removal_set(keep) {
            tracing::info!("Removing superseded deployment {id}");
            self.remove_deployment(&id)?;
            self.drop_from_ledger(ledger, &id)?;
            report.removed.push(id);
        }

        let on_disk = self
            .storage
            .deployment_ids()
            .fs_context("Scanning deployments")?;
        for id in on_disk {
            if ledger.contains(&id) {
                continue;
            }
            tracing::info!("Removing orphaned deployment {id}");
            self.remove_deployment(&id)?;
            report.orphans.push(id);
        }

        Ok(report)
    }
}
