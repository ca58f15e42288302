//! Boot entries for deployments.
//!
//! Each deployment gets a Boot Loader Specification entry rendered from
//! the template in the state root. A new entry is selected for the next
//! boot only, so that a deployment which fails to boot falls back to the
//! previous default.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rootsnap_utils::CommandRunExt;

use crate::error::Error;
use crate::parsers::bls_config::parse_bls_config;

/// Filename of the boot-entry template, relative to the state root.
pub(crate) const TEMPLATE: &str = "boot-entry.conf.in";
/// Replaced by the deployment id when rendering the template.
pub(crate) const ID_PLACEHOLDER: &str = "@DEPLOYMENT@";

/// Written by `init`.
pub(crate) const DEFAULT_TEMPLATE: &str = "\
title rootsnap @DEPLOYMENT@
linux /@DEPLOYMENT@/vmlinuz
initrd /@DEPLOYMENT@/initramfs.img
options rootflags=subvol=.rootsnap/deployments/@DEPLOYMENT@/rootfs rw
";

/// Filename of the boot entry of `id`.
pub(crate) fn entry_name(id: &str) -> String {
    format!("{id}.conf")
}

/// The bootloader's registry of boot entries.
pub(crate) trait BootRegistry {
    /// Write (or replace) the entry of `id`.
    fn write_entry(&self, id: &str, contents: &str) -> Result<()>;

    /// Boot the entry of `id` once, on the next boot.
    fn set_next_boot(&self, id: &str) -> Result<()>;

    /// Remove the entry of `id`; succeeds if there is none.
    fn remove_entry(&self, id: &str) -> Result<()>;
}

/// systemd-boot, with entries in `{boot}/loader/entries`.
#[derive(Debug)]
pub(crate) struct SystemdBoot {
    entries: Utf8PathBuf,
}

impl SystemdBoot {
    pub(crate) fn new(entries: Utf8PathBuf) -> Self {
        Self { entries }
    }

    fn open_entries(&self) -> Result<Dir> {
        std::fs::create_dir_all(&self.entries)
            .with_context(|| format!("Creating {}", self.entries))?;
        Dir::open_ambient_dir(&self.entries, cap_std::ambient_authority())
            .with_context(|| format!("Opening {}", self.entries))
    }
}

impl BootRegistry for SystemdBoot {
    #[context("Writing boot entry for {id}")]
    fn write_entry(&self, id: &str, contents: &str) -> Result<()> {
        let d = self.open_entries()?;
        d.atomic_write(entry_name(id), contents)?;
        Ok(())
    }

    #[context("Selecting {id} for the next boot")]
    fn set_next_boot(&self, id: &str) -> Result<()> {
        Command::new("bootctl")
            .arg("set-oneshot")
            .arg(entry_name(id))
            .log_debug()
            .run_capture_stderr()
    }

    #[context("Removing boot entry for {id}")]
    fn remove_entry(&self, id: &str) -> Result<()> {
        let path = self.entries.join(entry_name(id));
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::debug!("Removed {path}");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Substitute `id` into the template and check that the result is a
/// usable entry.
pub(crate) fn render_entry(template: &str, id: &str) -> Result<String> {
    if !template.contains(ID_PLACEHOLDER) {
        anyhow::bail!("Boot-entry template does not contain {ID_PLACEHOLDER}");
    }
    let rendered = template.replace(ID_PLACEHOLDER, id);
    let entry = parse_bls_config(&rendered).context("Parsing rendered boot entry")?;
    tracing::trace!("Rendered entry for {id} loading {:?}", entry.boot_files().collect::<Vec<_>>());
    Ok(rendered)
}

/// Registers deployments with a [`BootRegistry`].
pub(crate) struct Registrar<'a> {
    registry: &'a dyn BootRegistry,
    template: String,
}

impl std::fmt::Debug for Registrar<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registrar").finish_non_exhaustive()
    }
}

impl<'a> Registrar<'a> {
    pub(crate) fn new(registry: &'a dyn BootRegistry, template: String) -> Self {
        Self { registry, template }
    }

    /// Use the template stored at `path`.
    #[context("Loading boot-entry template")]
    pub(crate) fn load(registry: &'a dyn BootRegistry, path: &Utf8Path) -> Result<Self> {
        let template =
            std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
        Ok(Self::new(registry, template))
    }

    /// Write the entry of `id` and select it for the next boot.
    pub(crate) fn register(&self, id: &str) -> crate::error::Result<()> {
        let r = render_entry(&self.template, id).and_then(|entry| {
            self.registry.write_entry(id, &entry)?;
            self.registry.set_next_boot(id)
        });
        r.map_err(|source| Error::BootRegistration {
            id: id.to_owned(),
            source,
        })?;
        tracing::info!("Registered boot entry {}", entry_name(id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeBootRegistry;

    #[test]
    fn test_render() -> Result<()> {
        let r = render_entry(DEFAULT_TEMPLATE, "base-1")?;
        similar_asserts::assert_eq!(
            r,
            indoc::indoc! {"
                title rootsnap base-1
                linux /base-1/vmlinuz
                initrd /base-1/initramfs.img
                options rootflags=subvol=.rootsnap/deployments/base-1/rootfs rw
            "}
        );
        // No placeholder
        assert!(render_entry("linux /vmlinuz\n", "base-1").is_err());
        // No kernel
        assert!(render_entry("title @DEPLOYMENT@\n", "base-1").is_err());
        Ok(())
    }

    #[test]
    fn test_systemd_boot_entries() -> Result<()> {
        let td = tempfile::tempdir()?;
        let entries = Utf8PathBuf::try_from(td.path().join("loader/entries"))?;
        let sdboot = SystemdBoot::new(entries.clone());
        // Removing an absent entry is fine
        sdboot.remove_entry("base-1")?;
        sdboot.write_entry("base-1", "linux /base-1/vmlinuz\n")?;
        assert_eq!(
            std::fs::read_to_string(entries.join("base-1.conf"))?,
            "linux /base-1/vmlinuz\n"
        );
        sdboot.remove_entry("base-1")?;
        assert!(!entries.join("base-1.conf").exists());
        Ok(())
    }

    #[test]
    fn test_register() -> Result<()> {
        let registry = FakeBootRegistry::default();
        let registrar = Registrar::new(&registry, DEFAULT_TEMPLATE.to_owned());
        registrar.register("base-1")?;
        assert_eq!(registry.entries(), ["base-1"]);
        assert_eq!(registry.next_boot().as_deref(), Some("base-1"));

        registry.fail_next_boot(true);
        let e = registrar.register("base-2").unwrap_err();
        assert!(matches!(e, Error::BootRegistration { .. }), "{e:?}");
        assert_eq!(registry.next_boot().as_deref(), Some("base-1"));

        let registrar = Registrar::new(&registry, "linux /vmlinuz\n".into());
        let e = registrar.register("base-3").unwrap_err();
        assert!(matches!(e, Error::BootRegistration { .. }), "{e:?}");
        assert!(!registry.entries().contains(&"base-3".to_owned()));
        Ok(())
    }
}
