//! Extraction of layer images from a cached bundle.
//!
//! A bundle is a compressed tar archive holding one snapshot stream per
//! [`Layer`]. Layers are extracted lazily, one at a time, next to the
//! bundle; an extracted layer is deleted once it has been applied.

use std::fmt::Display;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{Error, FilesystemContext, Result};
use crate::repo::{Compression, ManifestEntry};

/// The snapshot streams making up a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layer {
    Root,
    Etc,
    Var,
}

impl Layer {
    pub(crate) const ALL: [Layer; 3] = [Layer::Root, Layer::Etc, Layer::Var];

    /// Suffix of the stream inside the bundle.
    fn suffix(&self) -> &'static str {
        match self {
            Layer::Root => "rootfs",
            Layer::Etc => "etc",
            Layer::Var => "var",
        }
    }

    /// Name of the stream inside the bundle.
    pub(crate) fn stream_name(&self, id: &str) -> String {
        format!("{id}-{}.img", self.suffix())
    }

    /// Name of the subvolume the stream creates when received.
    pub(crate) fn subvolume(&self) -> &'static str {
        self.suffix()
    }
}

impl Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Wrap the compressed bundle in the matching decoder.
fn decompressor(compression: Compression, src: File) -> anyhow::Result<Box<dyn Read>> {
    let src = BufReader::new(src);
    let r: Box<dyn Read> = match compression {
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(src)?),
        Compression::Gzip => Box::new(flate2::bufread::GzDecoder::new(src)),
    };
    Ok(r)
}

/// Entries may or may not carry a leading `./`.
fn entry_matches(path: &Path, name: &str) -> bool {
    path.strip_prefix(".").unwrap_or(path) == Path::new(name)
}

/// Stream `name` out of the archive into `dest`; returns false if the
/// archive has no such entry.
fn extract_entry(
    bundle: &Utf8Path,
    compression: Compression,
    name: &str,
    dest: &Utf8Path,
) -> anyhow::Result<bool> {
    let f = File::open(bundle).with_context(|| format!("Opening {bundle}"))?;
    let mut archive = tar::Archive::new(decompressor(compression, f)?);
    for entry in archive.entries().context("Reading archive")? {
        let mut entry = entry.context("Reading archive entry")?;
        if !entry_matches(&entry.path()?, name) {
            continue;
        }
        let dir = dest.parent().unwrap_or(Utf8Path::new("."));
        let mut tmp = tempfile::Builder::new()
            .prefix(".extract-")
            .tempfile_in(dir)
            .context("Creating extraction file")?;
        std::io::copy(&mut entry, tmp.as_file_mut())
            .with_context(|| format!("Extracting {name}"))?;
        tmp.persist(dest)
            .map_err(|e| e.error)
            .with_context(|| format!("Renaming to {dest}"))?;
        return Ok(true);
    }
    Ok(false)
}

/// A layer image extracted to disk; deleted when dropped.
#[derive(Debug)]
pub(crate) struct ExtractedLayer {
    layer: Layer,
    path: Utf8PathBuf,
}

impl ExtractedLayer {
    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for ExtractedLayer {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::trace!("Removed {} layer {}", self.layer, self.path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove {}: {e}", self.path),
        }
    }
}

/// Something the materializer can pull layer images from.
pub(crate) trait LayerSource {
    fn layer(&self, layer: Layer) -> Result<ExtractedLayer>;
}

/// A verified bundle in the cache.
#[derive(Debug)]
pub(crate) struct Bundle<'a> {
    path: Utf8PathBuf,
    entry: &'a ManifestEntry,
    workdir: &'a Utf8Path,
}

impl<'a> Bundle<'a> {
    pub(crate) fn new(path: Utf8PathBuf, entry: &'a ManifestEntry, workdir: &'a Utf8Path) -> Self {
        Self {
            path,
            entry,
            workdir,
        }
    }

    /// Extract one layer image, unless a previous run already did.
    pub(crate) fn extract_layer(&self, layer: Layer) -> Result<Utf8PathBuf> {
        let name = layer.stream_name(&self.entry.id);
        let dest = self.workdir.join(&name);
        let exists = dest
            .try_exists()
            .with_fs_context(|| format!("Checking for {dest}"))?;
        if exists {
            tracing::debug!("Reusing extracted {dest}");
            return Ok(dest);
        }
        tracing::debug!("Extracting {name} from {}", self.path);
        let found = extract_entry(&self.path, self.entry.compression, &name, &dest)
            .with_fs_context(|| format!("Extracting {layer} layer from {}", self.path))?;
        if !found {
            return Err(Error::CorruptBundle {
                bundle: self.path.clone(),
                stream: name,
            });
        }
        Ok(dest)
    }
}

impl LayerSource for Bundle<'_> {
    fn layer(&self, layer: Layer) -> Result<ExtractedLayer> {
        let path = self.extract_layer(layer)?;
        Ok(ExtractedLayer { layer, path })
    }
}
