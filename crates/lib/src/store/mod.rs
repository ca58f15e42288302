//! The [`Storage`] ties together the two directory trees this tool owns:
//!
//! # State root
//!
//! By default `/.rootsnap`, on the snapshot filesystem. It holds the
//! configuration, the ledger, the boot-entry template, the overlay set,
//! the bundle cache, every deployment's subvolumes, and the shared `var`
//! subvolume of each target.
//!
//! # Boot directory
//!
//! By default `/boot`. Each deployment gets a directory holding its
//! kernel and initramfs; boot entries live in `loader/entries`.

use std::fs::File;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use rustix::fs::FlockOperation;

use crate::bootloader::{DEFAULT_TEMPLATE, TEMPLATE};
use crate::config::{Config, CONFIG};
use crate::error::{Error, FilesystemContext};

/// The default state root.
pub(crate) const STATE_ROOT: &str = "/.rootsnap";
/// The default boot directory.
pub(crate) const BOOT_DIR: &str = "/boot";

/// Advisory lock file, relative to the state root.
const LOCK: &str = "lock";
const OVERLAY: &str = "overlay";
const CACHE: &str = "cache";
const DEPLOYMENTS: &str = "deployments";
const SHARED: &str = "shared";
/// The root subvolume of a deployment.
const ROOTFS: &str = "rootfs";

/// Boot entries, relative to the boot directory.
const LOADER_ENTRIES: &str = "loader/entries";

/// A reference to the state root and the boot directory.
#[derive(Debug)]
pub(crate) struct Storage {
    root: Utf8PathBuf,
    /// Directory holding the state root
    pub(crate) root_dir: Dir,
    boot: Utf8PathBuf,
}

/// Held for the duration of a mutating operation; dropping it releases
/// the lock.
#[derive(Debug)]
pub(crate) struct StorageLock {
    _file: File,
}

impl Storage {
    /// Open an initialized state root.
    pub(crate) fn open(root: &Utf8Path, boot: &Utf8Path) -> crate::error::Result<Self> {
        if !root.join(CONFIG).try_exists().fs_context("Checking state root")? {
            return Err(Error::Precondition(format!(
                "{root} is not initialized; run `rootsnap init` first"
            )));
        }
        let root_dir = Dir::open_ambient_dir(root, cap_std::ambient_authority())
            .with_fs_context(|| format!("Opening {root}"))?;
        Ok(Self {
            root: root.to_owned(),
            root_dir,
            boot: boot.to_owned(),
        })
    }

    /// Create the layout of a new state root, with `config` and the default
    /// boot-entry template.
    pub(crate) fn init(
        root: &Utf8Path,
        boot: &Utf8Path,
        config: &Config,
    ) -> crate::error::Result<Self> {
        if root.join(CONFIG).try_exists().fs_context("Checking state root")? {
            return Err(Error::Precondition(format!("{root} is already initialized")));
        }
        Self::init_layout(root, config).fs_context("Initializing state root")?;
        Self::open(root, boot)
    }

    #[context("Creating layout in {root}")]
    fn init_layout(root: &Utf8Path, config: &Config) -> Result<()> {
        std::fs::create_dir_all(root).with_context(|| format!("Creating {root}"))?;
        let d = Dir::open_ambient_dir(root, cap_std::ambient_authority())?;
        for p in [OVERLAY, CACHE, DEPLOYMENTS, SHARED] {
            d.create_dir_all(p).with_context(|| format!("Creating {p}"))?;
        }
        if !d.try_exists(TEMPLATE)? {
            d.atomic_write(TEMPLATE, DEFAULT_TEMPLATE)
                .with_context(|| format!("Writing {TEMPLATE}"))?;
        }
        // Written last; its presence marks the root as initialized
        config.write_to(&d)?;
        Ok(())
    }

    /// Take the advisory lock guarding mutating operations, failing
    /// immediately if another process holds it.
    pub(crate) fn lock(&self) -> crate::error::Result<StorageLock> {
        let path = self.root.join(LOCK);
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_fs_context(|| format!("Opening {path}"))?;
        match rustix::fs::flock(&file, FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {}
            Err(e) if e == rustix::io::Errno::WOULDBLOCK => {
                return Err(Error::Precondition(
                    "Another operation is in progress".into(),
                ))
            }
            Err(e) => return Err(e).with_fs_context(|| format!("Locking {path}")),
        }
        tracing::trace!("Acquired {path}");
        Ok(StorageLock { _file: file })
    }

    pub(crate) fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub(crate) fn template_path(&self) -> Utf8PathBuf {
        self.root.join(TEMPLATE)
    }

    pub(crate) fn overlay_dir(&self) -> Utf8PathBuf {
        self.root.join(OVERLAY)
    }

    pub(crate) fn cache_dir(&self) -> Utf8PathBuf {
        self.root.join(CACHE)
    }

    pub(crate) fn deployments_dir(&self) -> Utf8PathBuf {
        self.root.join(DEPLOYMENTS)
    }

    /// The directory holding every subvolume of a deployment.
    pub(crate) fn deployment_dir(&self, id: &str) -> Utf8PathBuf {
        self.deployments_dir().join(id)
    }

    pub(crate) fn rootfs(&self, id: &str) -> Utf8PathBuf {
        self.deployment_dir(id).join(ROOTFS)
    }

    pub(crate) fn shared_dir(&self) -> Utf8PathBuf {
        self.root.join(SHARED)
    }

    /// The parent of the `var` subvolume shared by all deployments of
    /// `target`.
    pub(crate) fn shared_target_dir(&self, target: &str) -> Utf8PathBuf {
        self.shared_dir().join(target)
    }

    /// Kernel and initramfs of a deployment.
    pub(crate) fn kernel_dir(&self, id: &str) -> Utf8PathBuf {
        self.boot.join(id)
    }

    pub(crate) fn loader_entries(&self) -> Utf8PathBuf {
        self.boot.join(LOADER_ENTRIES)
    }

    /// Ids of every deployment directory present, in name order.
    #[context("Listing deployments")]
    pub(crate) fn deployment_ids(&self) -> Result<Vec<String>> {
        let dir = self.deployments_dir();
        if !dir.try_exists()? {
            return Ok(Vec::new());
        }
        let mut r = Vec::new();
        for ent in dir.read_dir_utf8()? {
            let ent = ent?;
            if ent.file_type()?.is_dir() {
                r.push(ent.file_name().to_owned());
            }
        }
        r.sort();
        Ok(r)
    }
}
