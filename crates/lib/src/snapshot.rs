//! The copy-on-write filesystem holding deployments.
//!
//! All mutating work on subvolumes goes through [`SnapshotFilesystem`];
//! the production implementation drives `btrfs(8)`.

use std::os::unix::fs::MetadataExt;
use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use rootsnap_utils::CommandRunExt;

/// The root directory of every btrfs subvolume has this inode number.
const BTRFS_SUBVOLUME_INO: u64 = 256;

/// How deep below a deployment subvolumes are searched for; deployments
/// nest at most `rootfs/etc`.
const SUBVOLUME_SCAN_DEPTH: usize = 3;

/// Operations on the snapshot filesystem.
pub(crate) trait SnapshotFilesystem {
    /// Apply a snapshot stream below `parent`; the stream creates the
    /// read-only subvolume `parent/name`, whose path is returned.
    fn receive(&self, stream: &Utf8Path, parent: &Utf8Path, name: &str) -> Result<Utf8PathBuf>;

    /// Toggle the read-only property of the subvolume at `path`.
    fn set_readonly(&self, path: &Utf8Path, readonly: bool) -> Result<()>;

    /// Subvolumes at or below `path`, parents before their children.
    fn list_subvolumes(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>>;

    /// Delete the subvolume at `path`; it must not contain subvolumes.
    fn delete(&self, path: &Utf8Path) -> Result<()>;
}

/// Arguments to `btrfs` setting the read-only property of `path`.
/// Every subvolume here is received and so carries a `received_uuid`;
/// btrfs refuses to make such a subvolume writable unless forced.
pub(crate) fn readonly_property_args(path: &Utf8Path, readonly: bool) -> Vec<&str> {
    let mut r = vec!["property", "set"];
    if !readonly {
        r.push("-f");
    }
    let v = if readonly { "true" } else { "false" };
    r.extend(["-ts", path.as_str(), "ro", v]);
    r
}

/// btrfs via its command line tool.
#[derive(Debug, Default)]
pub(crate) struct Btrfs;

impl SnapshotFilesystem for Btrfs {
    #[context("Receiving {stream} into {parent}")]
    fn receive(&self, stream: &Utf8Path, parent: &Utf8Path, name: &str) -> Result<Utf8PathBuf> {
        Command::new("btrfs")
            .args(["receive", "-f", stream.as_str(), parent.as_str()])
            .log_debug()
            .run_capture_stderr()?;
        let r = parent.join(name);
        if !r.try_exists()? {
            anyhow::bail!("Stream did not create {r}");
        }
        Ok(r)
    }

    #[context("Setting {path} read-only={readonly}")]
    fn set_readonly(&self, path: &Utf8Path, readonly: bool) -> Result<()> {
        Command::new("btrfs")
            .args(readonly_property_args(path, readonly))
            .log_debug()
            .run_capture_stderr()
    }

    #[context("Listing subvolumes below {path}")]
    fn list_subvolumes(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        let mut r = Vec::new();
        // Subvolumes report distinct device numbers, so this must not
        // stop at filesystem boundaries.
        let walk = walkdir::WalkDir::new(path)
            .follow_links(false)
            .max_depth(SUBVOLUME_SCAN_DEPTH);
        for ent in walk {
            let ent = ent?;
            if !ent.file_type().is_dir() {
                continue;
            }
            if ent.metadata()?.ino() != BTRFS_SUBVOLUME_INO {
                continue;
            }
            let p = Utf8PathBuf::try_from(ent.into_path())?;
            r.push(p);
        }
        Ok(r)
    }

    #[context("Deleting subvolume {path}")]
    fn delete(&self, path: &Utf8Path) -> Result<()> {
        Command::new("btrfs")
            .args(["subvolume", "delete", path.as_str()])
            .log_debug()
            .run_capture_stderr()
    }
}

/// Remove a tree that may contain (possibly read-only) subvolumes.
/// Succeeds if `path` does not exist.
#[context("Removing {path}")]
pub(crate) fn remove_tree(fs: &dyn SnapshotFilesystem, path: &Utf8Path) -> Result<()> {
    if !path.try_exists()? {
        return Ok(());
    }
    let subvolumes = fs.list_subvolumes(path)?;
    // Unseal top-down so nested subvolumes can be unlinked from their parents,
    // then delete bottom-up.
    for sv in subvolumes.iter() {
        fs.set_readonly(sv, false)?;
    }
    for sv in subvolumes.iter().rev() {
        fs.delete(sv)?;
    }
    if path.try_exists()? {
        std::fs::remove_dir_all(path).context("Removing remaining directories")?;
    }
    Ok(())
}
