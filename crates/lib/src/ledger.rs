//! The record of installed deployments.
//!
//! The ledger is a plain text file in the state root holding one
//! deployment id per line, most recent first. Its head is the deployment
//! that was last installed successfully.

use std::fmt::Display;
use std::io::Read;
use std::num::NonZeroUsize;

use anyhow::Context;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

/// Filename of the ledger, relative to the state root.
pub(crate) const LEDGER: &str = "ledger";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Ledger {
    ids: Vec<String>,
}

impl Ledger {
    /// Parse the ledger format. Blank lines are ignored and only the first
    /// occurrence of a repeated id is kept.
    pub(crate) fn parse(s: &str) -> Self {
        let mut r = Self::default();
        for id in s.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if r.contains(id) {
                tracing::warn!("Ignoring duplicate ledger entry {id}");
                continue;
            }
            r.ids.push(id.to_owned());
        }
        r
    }

    /// Read the ledger from the state root; a missing file is an empty
    /// ledger.
    #[context("Loading ledger")]
    pub(crate) fn load(root: &Dir) -> anyhow::Result<Self> {
        let Some(mut f) = root.open_optional(LEDGER)? else {
            return Ok(Self::default());
        };
        let mut s = String::new();
        f.read_to_string(&mut s)?;
        Ok(Self::parse(&s))
    }

    /// Replace the ledger in the state root.
    #[context("Saving ledger")]
    pub(crate) fn save(&self, root: &Dir) -> anyhow::Result<()> {
        root.atomic_write(LEDGER, self.to_string())
            .context("Writing ledger")
    }

    /// The most recent deployment.
    pub(crate) fn head(&self) -> Option<&str> {
        self.ids.first().map(String::as_str)
    }

    pub(crate) fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|v| v == id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Record `id` as the most recent deployment.
    pub(crate) fn prepend(&mut self, id: &str) {
        self.remove(id);
        self.ids.insert(0, id.to_owned());
    }

    /// Drop `id`; returns whether it was present.
    pub(crate) fn remove(&mut self, id: &str) -> bool {
        let n = self.ids.len();
        self.ids.retain(|v| v != id);
        self.ids.len() != n
    }

    /// The deployments beyond the `keep` most recent ones, oldest last.
    pub(crate) fn removal_set(&self, keep: NonZeroUsize) -> Vec<String> {
        self.ids.iter().skip(keep.get()).cloned().collect()
    }
}

impl Display for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for id in &self.ids {
            writeln!(f, "{id}")?;
        }
        Ok(())
    }
}
