//! Local bundle cache with digest verification.
//!
//! A bundle is downloaded at most once and kept under its own name; a
//! partial download is never visible under that name. The digest is
//! recomputed on every use, so a bundle that was tampered with or
//! truncated after download is discarded before anything is extracted
//! from it.

use std::fs::File;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use sha2::{Digest, Sha256};

use crate::bundle::Layer;
use crate::error::{Error, FilesystemContext, Result};
use crate::repo::{Compression, ManifestEntry, Repository};

#[derive(Debug)]
pub(crate) struct BundleCache<'a> {
    dir: &'a Utf8Path,
    repo: &'a Repository,
}

/// Hex encoded SHA-256 of a file's content.
#[context("Computing digest of {path}")]
pub(crate) fn sha256_file(path: &Utf8Path) -> anyhow::Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut f, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

impl<'a> BundleCache<'a> {
    pub(crate) fn new(dir: &'a Utf8Path, repo: &'a Repository) -> Self {
        Self { dir, repo }
    }

    pub(crate) fn bundle_path(&self, entry: &ManifestEntry) -> Utf8PathBuf {
        self.dir.join(entry.bundle_name())
    }

    /// Return the path of the verified bundle for `entry`, downloading it
    /// first if it is not cached.
    pub(crate) fn ensure_cached(&self, target: &str, entry: &ManifestEntry) -> Result<Utf8PathBuf> {
        let path = self.bundle_path(entry);
        let exists = path
            .try_exists()
            .with_fs_context(|| format!("Checking for {path}"))?;
        if exists {
            tracing::debug!("Using cached bundle {path}");
        } else {
            println!("Downloading {}", entry.bundle_name());
            let mut tmp = tempfile::Builder::new()
                .prefix(".download-")
                .tempfile_in(self.dir)
                .fs_context("Creating download file")?;
            self.repo
                .download_bundle(target, entry, tmp.as_file_mut())?;
            tmp.persist(&path)
                .map_err(|e| e.error)
                .with_fs_context(|| format!("Renaming download to {path}"))?;
        }
        self.verify(entry, &path)?;
        Ok(path)
    }

    /// Compare the bundle's digest with the published one; a bundle that
    /// does not match is deleted.
    pub(crate) fn verify(&self, entry: &ManifestEntry, path: &Utf8Path) -> Result<()> {
        let actual = sha256_file(path).fs_context("Verifying bundle")?;
        if actual != entry.digest {
            tracing::warn!("Removing {path} after digest mismatch");
            if let Err(e) = std::fs::remove_file(path) {
                tracing::error!("Failed to remove {path}: {e}");
            }
            return Err(Error::Integrity {
                id: entry.id.clone(),
                expected: entry.digest.clone(),
                actual,
            });
        }
        tracing::debug!("Verified {path}");
        Ok(())
    }
}

fn remove_cached<'a>(dir: &Utf8Path, names: impl IntoIterator<Item = &'a String>) -> anyhow::Result<()> {
    for name in names {
        let path = dir.join(name);
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Evicted {name}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Removing {path}")),
        }
    }
    Ok(())
}

/// Drop the layer images of `id` extracted by an earlier run; the bundle
/// stays cached.
#[context("Evicting layer images of {id}")]
pub(crate) fn evict_layers(dir: &Utf8Path, id: &str) -> anyhow::Result<()> {
    remove_cached(dir, &Layer::ALL.map(|l| l.stream_name(id)))
}

/// Drop every cached file belonging to `id`: its bundle and any layer
/// images left over from an interrupted deploy.
#[context("Evicting cached files of {id}")]
pub(crate) fn evict(dir: &Utf8Path, id: &str) -> anyhow::Result<()> {
    remove_cached(dir, &Compression::ALL.map(|c| format!("{id}.tar.{c}")))?;
    evict_layers(dir, id)
}
