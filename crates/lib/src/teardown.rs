//! Removal of everything this tool manages.

use anyhow::Context;
use camino::Utf8Path;

use crate::bootloader::BootRegistry;
use crate::error::{FilesystemContext, Result};
use crate::ledger::Ledger;
use crate::retention::Collector;
use crate::snapshot::{remove_tree, SnapshotFilesystem};
use crate::store::Storage;

/// Must be typed back to confirm.
pub(crate) const CONFIRM_WORD: &str = "teardown";

/// Asks the operator.
pub(crate) trait Prompt {
    /// A yes/no question; the default is no.
    fn confirm(&self, prompt: &str) -> anyhow::Result<bool>;

    /// A line of free text.
    fn input(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Interactive prompts on the terminal.
#[derive(Debug, Default)]
pub(crate) struct Terminal;

impl Prompt for Terminal {
    fn confirm(&self, prompt: &str) -> anyhow::Result<bool> {
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .wait_for_newline(true)
            .interact()
            .context("Reading confirmation")
    }

    fn input(&self, prompt: &str) -> anyhow::Result<String> {
        dialoguer::Input::<String>::new()
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()
            .context("Reading input")
    }
}

/// Ask twice; only an explicit yes followed by the confirmation word
/// counts.
pub(crate) fn confirmed(prompt: &dyn Prompt, root: &Utf8Path) -> anyhow::Result<bool> {
    let question = format!("Remove every deployment and all state in {root}?");
    if !prompt.confirm(&question)? {
        return Ok(false);
    }
    let word = prompt.input(&format!("Type '{CONFIRM_WORD}' to proceed"))?;
    Ok(word.trim() == CONFIRM_WORD)
}

/// Remove every deployment, the shared `var` of every target, and the
/// state root itself. Returns the removed deployment ids.
pub(crate) fn teardown(
    fs: &dyn SnapshotFilesystem,
    registry: &dyn BootRegistry,
    storage: &Storage,
) -> Result<Vec<String>> {
    let ledger = Ledger::load(&storage.root_dir).fs_context("Reading ledger")?;
    let mut ids: Vec<String> = ledger.iter().map(ToOwned::to_owned).collect();
    for id in storage
        .deployment_ids()
        .fs_context("Scanning deployments")?
    {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    let collector = Collector::new(fs, registry, storage);
    for id in &ids {
        tracing::info!("Removing deployment {id}");
        collector.remove_deployment(id)?;
    }
    remove_tree(fs, &storage.shared_dir()).fs_context("Removing shared state")?;
    let root = storage.root();
    std::fs::remove_dir_all(root).with_fs_context(|| format!("Removing {root}"))?;
    Ok(ids)
}
