//! Materialization of a deployment's snapshot tree.
//!
//! A deployment is built from its layer images in a fixed order:
//!
//! - the root layer is received as the read-only `rootfs` subvolume
//! - the etc layer is received into `rootfs` while it is briefly
//!   writable; `rootfs` is then sealed again and `etc` made writable
//! - the var layer is received once per target into a shared location
//! - the overlay set, if enabled, is copied into `rootfs`
//! - the kernel is copied to the boot directory next to a freshly
//!   generated initramfs
//!
//! On failure the caller rolls the deployment back with
//! [`Materializer::rollback`]. The shared `var` is never part of that.

use std::fmt::Display;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::bundle::{Layer, LayerSource};
use crate::config::Config;
use crate::error::{Error, FilesystemContext, Result};
use crate::initramfs::InitramfsBuilder;
use crate::kernel;
use crate::snapshot::{remove_tree, SnapshotFilesystem};
use crate::store::Storage;

/// Directories created in `rootfs` for mounts set up at boot.
const MOUNT_POINTS: &[&str] = &["var", "root"];

/// Progress of a deployment through materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum State {
    Absent,
    RootWritten,
    EtcWritten,
    VarEnsured,
    OverlayApplied,
    BootArtifactsInstalled,
    Complete,
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            State::Absent => "absent",
            State::RootWritten => "root written",
            State::EtcWritten => "etc written",
            State::VarEnsured => "var ensured",
            State::OverlayApplied => "overlay applied",
            State::BootArtifactsInstalled => "boot artifacts installed",
            State::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// A subvolume made writable for a bounded time; it is sealed again when
/// the guard is dropped, including on error paths.
struct Unsealed<'a> {
    fs: &'a dyn SnapshotFilesystem,
    path: &'a Utf8Path,
    armed: bool,
}

impl<'a> Unsealed<'a> {
    fn new(fs: &'a dyn SnapshotFilesystem, path: &'a Utf8Path) -> anyhow::Result<Self> {
        fs.set_readonly(path, false)?;
        Ok(Self {
            fs,
            path,
            armed: true,
        })
    }

    /// Seal the subvolume, reporting failure.
    fn seal(mut self) -> anyhow::Result<()> {
        self.armed = false;
        self.fs.set_readonly(self.path, true)
    }
}

impl Drop for Unsealed<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.fs.set_readonly(self.path, true) {
            tracing::warn!("Failed to seal {}: {e:#}", self.path);
        }
    }
}

/// Paths in `overlay`, relative to it, parents before children.
#[context("Reading overlay {overlay}")]
fn overlay_entries(overlay: &Utf8Path) -> anyhow::Result<Vec<Utf8PathBuf>> {
    if !overlay.try_exists()? {
        return Ok(Vec::new());
    }
    let mut r = Vec::new();
    for ent in walkdir::WalkDir::new(overlay).min_depth(1).sort_by_file_name() {
        let ent = ent?;
        let rel = ent.path().strip_prefix(overlay)?;
        r.push(Utf8PathBuf::try_from(rel.to_path_buf())?);
    }
    Ok(r)
}

/// Copy `entries` of `src` into `dest`, replacing existing files. All
/// writes go through a handle on `dest`: symlinks found there are
/// replaced rather than followed, and paths resolving outside of `dest`
/// are refused.
#[context("Copying overlay")]
fn copy_entries(src: &Utf8Path, dest: &Utf8Path, entries: &[Utf8PathBuf]) -> anyhow::Result<()> {
    let src = Dir::open_ambient_dir(src, cap_std::ambient_authority())
        .with_context(|| format!("Opening {src}"))?;
    let dest = Dir::open_ambient_dir(dest, cap_std::ambient_authority())
        .with_context(|| format!("Opening {dest}"))?;
    for rel in entries {
        let ty = src.symlink_metadata(rel)?.file_type();
        let replace = dest
            .symlink_metadata_optional(rel)?
            .map(|m| m.file_type())
            .is_some_and(|t| t.is_symlink() || (ty.is_symlink() && !t.is_dir()));
        if replace {
            dest.remove_file(rel)
                .with_context(|| format!("Replacing {rel}"))?;
        }
        if ty.is_dir() {
            dest.create_dir_all(rel)
                .with_context(|| format!("Creating {rel}"))?;
        } else if ty.is_symlink() {
            let target = src.read_link_contents(rel)?;
            dest.symlink_contents(&target, rel)
                .with_context(|| format!("Linking {rel}"))?;
        } else {
            src.copy(rel, &dest, rel)
                .with_context(|| format!("Copying {rel}"))?;
        }
    }
    Ok(())
}

/// Builds deployments on the snapshot filesystem.
pub(crate) struct Materializer<'a> {
    fs: &'a dyn SnapshotFilesystem,
    initramfs: &'a dyn InitramfsBuilder,
    storage: &'a Storage,
    overlay: Option<Utf8PathBuf>,
}

impl std::fmt::Debug for Materializer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer")
            .field("storage", &self.storage)
            .field("overlay", &self.overlay)
            .finish_non_exhaustive()
    }
}

impl<'a> Materializer<'a> {
    pub(crate) fn new(
        fs: &'a dyn SnapshotFilesystem,
        initramfs: &'a dyn InitramfsBuilder,
        storage: &'a Storage,
        config: &Config,
    ) -> Self {
        Self {
            fs,
            initramfs,
            storage,
            overlay: config.enable_overlay.then(|| storage.overlay_dir()),
        }
    }

    fn advance(id: &str, state: &mut State, next: State) {
        debug_assert!(next > *state);
        *state = next;
        tracing::info!("Deployment {id}: {next}");
    }

    /// Drive the deployment `id` of `target` from absent to complete.
    pub(crate) fn materialize(
        &self,
        id: &str,
        target: &str,
        source: &dyn LayerSource,
    ) -> Result<()> {
        let mut state = State::Absent;
        let rootfs = self.write_root(id, source)?;
        Self::advance(id, &mut state, State::RootWritten);

        self.write_etc(&rootfs, source)?;
        Self::advance(id, &mut state, State::EtcWritten);

        if !self.ensure_var(target, source)? {
            tracing::debug!("Using existing shared var of {target}");
        }
        Self::advance(id, &mut state, State::VarEnsured);

        if let Some(overlay) = self.overlay.as_deref() {
            self.apply_overlay(overlay, &rootfs)?;
        }
        Self::advance(id, &mut state, State::OverlayApplied);

        let kernel = kernel::install_boot_artifacts(
            &rootfs,
            &self.storage.kernel_dir(id),
            self.initramfs,
        )
        .fs_context("Installing boot artifacts")?;
        tracing::debug!("Deployment {id} boots kernel {}", kernel.kver);
        Self::advance(id, &mut state, State::BootArtifactsInstalled);

        Self::advance(id, &mut state, State::Complete);
        Ok(())
    }

    fn write_root(&self, id: &str, source: &dyn LayerSource) -> Result<Utf8PathBuf> {
        let dir = self.storage.deployment_dir(id);
        std::fs::create_dir_all(&dir).with_fs_context(|| format!("Creating {dir}"))?;
        let layer = source.layer(Layer::Root)?;
        self.fs
            .receive(layer.path(), &dir, Layer::Root.subvolume())
            .fs_context("Receiving root layer")
    }

    fn write_etc(&self, rootfs: &Utf8Path, source: &dyn LayerSource) -> Result<()> {
        // Extracted up front to keep the writable window short
        let layer = source.layer(Layer::Etc)?;
        let unsealed = Unsealed::new(self.fs, rootfs).fs_context("Unsealing root")?;
        let etc = self
            .fs
            .receive(layer.path(), rootfs, Layer::Etc.subvolume())
            .fs_context("Receiving etc layer")?;
        for d in MOUNT_POINTS {
            let p = rootfs.join(d);
            std::fs::create_dir_all(&p).with_fs_context(|| format!("Creating {p}"))?;
        }
        unsealed.seal().fs_context("Sealing root")?;
        self.fs
            .set_readonly(&etc, false)
            .fs_context("Making etc writable")
    }

    /// Receive the shared var of `target` unless it exists; returns whether
    /// it was created.
    fn ensure_var(&self, target: &str, source: &dyn LayerSource) -> Result<bool> {
        let parent = self.storage.shared_target_dir(target);
        let var = parent.join(Layer::Var.subvolume());
        if var.try_exists().fs_context("Checking shared var")? {
            return Ok(false);
        }
        std::fs::create_dir_all(&parent).with_fs_context(|| format!("Creating {parent}"))?;
        let layer = source.layer(Layer::Var)?;
        let r = self
            .fs
            .receive(layer.path(), &parent, Layer::Var.subvolume())
            .and_then(|var| self.fs.set_readonly(&var, false));
        if let Err(e) = r {
            // Not shared yet; a later run must be able to retry
            if var.exists() {
                if let Err(e) = remove_tree(self.fs, &var) {
                    tracing::warn!("Failed to remove partial {var}: {e:#}");
                }
            }
            return Err(Error::Filesystem {
                context: format!("Creating shared var of {target}"),
                source: e,
            });
        }
        tracing::info!("Created shared var of {target}");
        Ok(true)
    }

    /// Copy the overlay set into `rootfs`. The root is only unsealed when
    /// the overlay has content outside of the writable `etc`.
    fn apply_overlay(&self, overlay: &Utf8Path, rootfs: &Utf8Path) -> Result<()> {
        let entries = overlay_entries(overlay).fs_context("Applying overlay")?;
        if entries.is_empty() {
            tracing::debug!("Overlay {overlay} is empty");
            return Ok(());
        }
        let etc = Layer::Etc.subvolume();
        let etc_only = entries.iter().all(|p| p.starts_with(etc));
        let unsealed = if etc_only {
            None
        } else {
            Some(Unsealed::new(self.fs, rootfs).fs_context("Unsealing root")?)
        };
        copy_entries(overlay, rootfs, &entries).fs_context("Applying overlay")?;
        if let Some(unsealed) = unsealed {
            unsealed.seal().fs_context("Sealing root")?;
        }
        tracing::debug!("Copied {} overlay entries", entries.len());
        Ok(())
    }

    /// Remove everything materialized for `id`. Failures are logged, not
    /// returned.
    pub(crate) fn rollback(&self, id: &str) {
        tracing::info!("Rolling back deployment {id}");
        let dir = self.storage.deployment_dir(id);
        if let Err(e) = remove_tree(self.fs, &dir) {
            tracing::warn!("Rollback of {id}: {e:#}");
        }
        let kdir = self.storage.kernel_dir(id);
        if kdir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&kdir) {
                tracing::warn!("Rollback of {id}: removing {kdir}: {e}");
            }
        }
    }
}
