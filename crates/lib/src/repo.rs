//! Access to the remote image repository.
//!
//! The repository is a static tree:
//!
//! - `{repo}/list`: available targets, one per line
//! - `{repo}/{target}/database`: the version index, newest first, one
//!   `id:compression:version:digest` entry per line
//! - `{repo}/{target}/{id}.tar.{compression}`: a bundle

use std::fmt::Display;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use fn_error_context::context;

use crate::error::{Error, Result};

/// Selects the newest entry of the version index.
pub(crate) const LATEST: &str = "latest";

/// Length of a hex encoded SHA-256 digest.
const DIGEST_HEX_LEN: usize = 64;

/// Compression applied to a bundle; also its file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Compression {
    Zstd,
    Gzip,
}

impl Compression {
    pub(crate) const ALL: [Compression; 2] = [Compression::Zstd, Compression::Gzip];

    pub(crate) fn extension(&self) -> &'static str {
        match self {
            Compression::Zstd => "zst",
            Compression::Gzip => "gz",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "zst" | "zstd" => Ok(Self::Zstd),
            "gz" | "gzip" => Ok(Self::Gzip),
            o => Err(format!("unsupported compression {o:?}")),
        }
    }
}

/// One entry of a target's version index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ManifestEntry {
    /// Unique across every version of the target; names the deployment.
    pub(crate) id: String,
    pub(crate) compression: Compression,
    pub(crate) version: String,
    /// Hex encoded SHA-256 of the compressed bundle.
    pub(crate) digest: String,
}

/// Ids and targets double as directory and file names, so each must be a
/// single path component.
fn validate_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("name is empty".into());
    }
    if name == "." || name == ".." {
        return Err(format!("{name:?} is reserved"));
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+')))
    {
        return Err(format!("invalid character {c:?}"));
    }
    Ok(())
}

/// Reject target names that are not a single safe path component.
pub(crate) fn validate_target(target: &str) -> Result<()> {
    validate_name(target)
        .map_err(|reason| Error::Precondition(format!("Invalid target {target:?}: {reason}")))
}

fn validate_digest(digest: &str) -> std::result::Result<(), String> {
    if digest.len() != DIGEST_HEX_LEN
        || !digest
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, 'a'..='f'))
    {
        return Err(format!(
            "digest must be {DIGEST_HEX_LEN} lowercase hex characters"
        ));
    }
    Ok(())
}

impl FromStr for ManifestEntry {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidManifest {
            line: line.to_owned(),
            reason,
        };
        let fields: Vec<&str> = line.trim().split(':').collect();
        let [id, compression, version, digest] = fields.as_slice() else {
            return Err(invalid(format!("expected 4 fields, found {}", fields.len())));
        };
        if let Some(i) = [id, compression, version, digest]
            .iter()
            .position(|f| f.is_empty())
        {
            return Err(invalid(format!("field {} is empty", i + 1)));
        }
        validate_name(id).map_err(|e| invalid(format!("id: {e}")))?;
        validate_digest(digest).map_err(invalid)?;
        let compression = compression.parse().map_err(invalid)?;
        Ok(Self {
            id: id.to_string(),
            compression,
            version: version.to_string(),
            digest: digest.to_string(),
        })
    }
}

impl ManifestEntry {
    /// Filename of the bundle, both remotely and in the cache.
    pub(crate) fn bundle_name(&self) -> String {
        format!("{}.tar.{}", self.id, self.compression)
    }
}

/// Parse a version index, preserving its newest-first order.
pub(crate) fn parse_database(s: &str) -> Result<Vec<ManifestEntry>> {
    s.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(ManifestEntry::from_str)
        .collect()
}

/// Pick the entry matching `selector`; `latest` is the first one.
pub(crate) fn select<'a>(
    entries: &'a [ManifestEntry],
    target: &str,
    selector: &str,
) -> Result<&'a ManifestEntry> {
    let found = if selector == LATEST {
        entries.first()
    } else {
        entries.iter().find(|e| e.version == selector)
    };
    found.ok_or_else(|| Error::NotFound {
        target: target.to_owned(),
        selector: selector.to_owned(),
    })
}

/// Transport used to read from the repository.
pub(crate) trait Fetcher {
    /// Read a small text resource.
    fn fetch_string(&self, url: &str) -> anyhow::Result<String>;

    /// Stream a resource into `dest`.
    fn fetch_to(&self, url: &str, dest: &mut dyn Write) -> anyhow::Result<u64>;
}

/// Plain HTTP(S) fetching.
#[derive(Debug, Default)]
pub(crate) struct HttpFetcher;

impl Fetcher for HttpFetcher {
    fn fetch_string(&self, url: &str) -> anyhow::Result<String> {
        let mut r = String::new();
        http_get(url)?
            .into_reader()
            .read_to_string(&mut r)
            .with_context(|| format!("Reading {url}"))?;
        Ok(r)
    }

    fn fetch_to(&self, url: &str, dest: &mut dyn Write) -> anyhow::Result<u64> {
        let mut reader = http_get(url)?.into_reader();
        std::io::copy(&mut reader, dest).with_context(|| format!("Downloading {url}"))
    }
}

fn http_get(url: &str) -> anyhow::Result<ureq::Response> {
    tracing::debug!("GET {url}");
    ureq::get(url).call().map_err(|e| match e {
        ureq::Error::Status(code, _) => anyhow::anyhow!("server returned status {code}"),
        ureq::Error::Transport(t) => anyhow::anyhow!("transport error: {t}"),
    })
}

/// A repository mirrored on the local filesystem, addressed as
/// `file:///path` or as a plain path.
#[derive(Debug, Default)]
pub(crate) struct LocalFetcher;

impl LocalFetcher {
    fn path_of(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
    }
}

impl Fetcher for LocalFetcher {
    fn fetch_string(&self, url: &str) -> anyhow::Result<String> {
        let p = Self::path_of(url);
        std::fs::read_to_string(&p).with_context(|| format!("Reading {}", p.display()))
    }

    fn fetch_to(&self, url: &str, dest: &mut dyn Write) -> anyhow::Result<u64> {
        let p = Self::path_of(url);
        let mut f = File::open(&p).with_context(|| format!("Opening {}", p.display()))?;
        std::io::copy(&mut f, dest).with_context(|| format!("Copying {}", p.display()))
    }
}

/// The image repository of this system.
pub(crate) struct Repository {
    base: String,
    fetcher: Box<dyn Fetcher>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Pick the transport from the URL scheme.
    pub(crate) fn new(base: &str) -> Self {
        let fetcher: Box<dyn Fetcher> = if base.starts_with("http://") || base.starts_with("https://")
        {
            Box::new(HttpFetcher)
        } else {
            Box::new(LocalFetcher)
        };
        Self::with_fetcher(base, fetcher)
    }

    pub(crate) fn with_fetcher(base: &str, fetcher: Box<dyn Fetcher>) -> Self {
        Self {
            base: base.trim_end_matches('/').to_owned(),
            fetcher,
        }
    }

    fn url(&self, rest: &str) -> String {
        format!("{}/{rest}", self.base)
    }

    fn fetch_string(&self, rest: &str) -> Result<String> {
        let url = self.url(rest);
        self.fetcher
            .fetch_string(&url)
            .map_err(|e| Error::network(url, e))
    }

    /// The targets the repository offers.
    pub(crate) fn list_targets(&self) -> Result<Vec<String>> {
        let s = self.fetch_string("list")?;
        Ok(s.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }

    /// The version index of `target`, newest first.
    pub(crate) fn database(&self, target: &str) -> Result<Vec<ManifestEntry>> {
        validate_target(target)?;
        let s = self.fetch_string(&format!("{target}/database"))?;
        parse_database(&s)
    }

    /// Resolve a version selector to a single entry.
    pub(crate) fn resolve(&self, target: &str, selector: &str) -> Result<ManifestEntry> {
        let entries = self.database(target)?;
        let entry = select(&entries, target, selector)?;
        tracing::debug!(
            "Resolved {target}:{selector} to {} ({})",
            entry.id,
            entry.version
        );
        Ok(entry.clone())
    }

    #[context("Downloading {}", entry.bundle_name())]
    fn download_impl(&self, entry: &ManifestEntry, url: &str, dest: &mut File) -> anyhow::Result<()> {
        let n = self.fetcher.fetch_to(url, dest)?;
        dest.flush()?;
        dest.sync_all()?;
        tracing::debug!("Fetched {n} bytes from {url}");
        Ok(())
    }

    /// Download a bundle into `dest`.
    pub(crate) fn download_bundle(
        &self,
        target: &str,
        entry: &ManifestEntry,
        dest: &mut File,
    ) -> Result<()> {
        let url = self.url(&format!("{target}/{}", entry.bundle_name()));
        self.download_impl(entry, &url, dest)
            .map_err(|e| Error::network(url, e))
    }
}
