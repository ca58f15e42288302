//! The persistent configuration, stored as `config.toml` in the state root.
//!
//! It is loaded once per invocation and handed to each component by
//! reference.

use std::num::NonZeroUsize;

use anyhow::Context;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Filename of the configuration, relative to the state root.
pub(crate) const CONFIG: &str = "config.toml";

/// Used by `init` when no repository is given.
const DEFAULT_REPO_URL: &str = "https://images.example.org/rootsnap";
const DEFAULT_IMAGE: &str = "base";
/// The current deployment plus one to roll back to.
const DEFAULT_KEEP: NonZeroUsize = NonZeroUsize::MIN.saturating_add(1);

fn default_keep() -> NonZeroUsize {
    DEFAULT_KEEP
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Copy the overlay set into each new deployment.
    #[serde(default)]
    pub(crate) enable_overlay: bool,
    /// Base URL of the image repository.
    pub(crate) repo_url: String,
    /// Target used when none is given on the command line.
    pub(crate) repo_default_image: String,
    /// How many of the most recent deployments to retain.
    #[serde(default = "default_keep")]
    pub(crate) deploy_keep: NonZeroUsize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_overlay: false,
            repo_url: DEFAULT_REPO_URL.to_owned(),
            repo_default_image: DEFAULT_IMAGE.to_owned(),
            deploy_keep: DEFAULT_KEEP,
        }
    }
}

impl Config {
    pub(crate) fn parse(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)
            .context("Parsing config.toml")
            .map_err(Error::Config)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.repo_url.trim().is_empty() {
            return Err(Error::Config(anyhow::anyhow!("repo_url must not be empty")));
        }
        if self.repo_default_image.trim().is_empty() {
            return Err(Error::Config(anyhow::anyhow!(
                "repo_default_image must not be empty"
            )));
        }
        Ok(())
    }

    /// Load the configuration from the state root.
    pub(crate) fn load(root: &Dir) -> Result<Self> {
        let Some(mut f) = root
            .open_optional(CONFIG)
            .context("Opening config.toml")
            .map_err(Error::Config)?
        else {
            return Err(Error::Precondition(
                "Not initialized; run `rootsnap init` first".into(),
            ));
        };
        let mut s = String::new();
        std::io::Read::read_to_string(&mut f, &mut s)
            .context("Reading config.toml")
            .map_err(Error::Config)?;
        Self::parse(&s)
    }

    /// Serialize into the state root, replacing any existing file.
    pub(crate) fn write_to(&self, root: &Dir) -> anyhow::Result<()> {
        let s = toml::to_string_pretty(self).context("Serializing configuration")?;
        root.atomic_write(CONFIG, s).context("Writing config.toml")
    }
}

#[cfg(test)]
mod tests {
    use cap_std_ext::cap_std;
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_parse_full() -> anyhow::Result<()> {
        let c = Config::parse(indoc! {r#"
            enable_overlay = true
            repo_url = "https://example.com/repo"
            repo_default_image = "desktop"
            deploy_keep = 3
        "#})?;
        assert!(c.enable_overlay);
        assert_eq!(c.repo_url, "https://example.com/repo");
        assert_eq!(c.repo_default_image, "desktop");
        assert_eq!(c.deploy_keep.get(), 3);
        Ok(())
    }

    #[test]
    fn test_parse_defaults() -> anyhow::Result<()> {
        let c = Config::parse(indoc! {r#"
            repo_url = "https://example.com/repo"
            repo_default_image = "desktop"
        "#})?;
        assert!(!c.enable_overlay);
        assert_eq!(c.deploy_keep, DEFAULT_KEEP);
        Ok(())
    }

    #[test]
    fn test_parse_invalid() {
        let cases = [
            // keep must be at least one
            "repo_url = \"u\"\nrepo_default_image = \"i\"\ndeploy_keep = 0\n",
            // missing required key
            "repo_url = \"u\"\n",
            // unknown key
            "repo_url = \"u\"\nrepo_default_image = \"i\"\nfoo = 1\n",
            // empty url
            "repo_url = \"\"\nrepo_default_image = \"i\"\n",
        ];
        for case in cases {
            let e = Config::parse(case).unwrap_err();
            assert!(matches!(e, Error::Config(_)), "{case}: {e:?}");
        }
    }

    #[test]
    fn test_write_load() -> anyhow::Result<()> {
        let td = cap_std_ext::cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        assert!(matches!(
            Config::load(&td).unwrap_err(),
            Error::Precondition(_)
        ));
        let c = Config {
            enable_overlay: true,
            ..Default::default()
        };
        c.write_to(&td)?;
        similar_asserts::assert_eq!(Config::load(&td)?, c);
        Ok(())
    }
}
