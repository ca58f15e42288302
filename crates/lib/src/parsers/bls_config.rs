//! See <https://uapi-group.org/specifications/specs/boot_loader_specification/>
//!
//! This module parses the Type #1 entries rendered from the boot-entry
//! template.

use std::collections::BTreeMap;
use std::fmt::Display;

use anyhow::{anyhow, Result};

/// Represents a single Boot Loader Specification config file.
#[derive(Debug, Eq, PartialEq, Default)]
pub(crate) struct BLSConfig {
    /// The title of the boot entry, to be displayed in the boot menu.
    pub(crate) title: Option<String>,
    /// The version of the boot entry.
    pub(crate) version: Option<String>,
    /// The path to the linux kernel to boot.
    pub(crate) linux: String,
    /// The paths to the initrd images.
    pub(crate) initrd: Vec<String>,
    /// Kernel command line options.
    pub(crate) options: Option<String>,
    /// Any other keys, in the order of their names.
    pub(crate) extra: BTreeMap<String, String>,
}

impl Display for BLSConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(title) = &self.title {
            writeln!(f, "title {}", title)?;
        }
        if let Some(version) = &self.version {
            writeln!(f, "version {}", version)?;
        }
        writeln!(f, "linux {}", self.linux)?;
        for initrd in self.initrd.iter() {
            writeln!(f, "initrd {}", initrd)?;
        }
        if let Some(options) = self.options.as_deref() {
            writeln!(f, "options {}", options)?;
        }
        for (key, value) in &self.extra {
            writeln!(f, "{} {}", key, value)?;
        }
        Ok(())
    }
}

impl BLSConfig {
    /// The files on the boot partition this entry loads.
    pub(crate) fn boot_files(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.linux.as_str()).chain(self.initrd.iter().map(String::as_str))
    }
}

pub(crate) fn parse_bls_config(input: &str) -> Result<BLSConfig> {
    let mut title = None;
    let mut version = None;
    let mut linux = None;
    let mut initrd = Vec::new();
    let mut options = None;
    let mut extra = BTreeMap::new();

    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Keys and values may be separated by any amount of whitespace
        let Some((key, value)) = line.split_once(char::is_whitespace) else {
            return Err(anyhow!("Missing value for key '{line}'"));
        };
        let value = value.trim().to_string();
        match key {
            "title" => title = Some(value),
            "version" => version = Some(value),
            "linux" => {
                if linux.replace(value).is_some() {
                    return Err(anyhow!("Duplicate 'linux' key"));
                }
            }
            "initrd" => initrd.push(value),
            "options" => options = Some(value),
            _ => {
                extra.insert(key.to_string(), value);
            }
        }
    }

    let linux = linux.ok_or_else(|| anyhow!("Missing 'linux' value"))?;

    Ok(BLSConfig {
        title,
        version,
        linux,
        initrd,
        options,
        extra,
    })
}
