//! Kernel artifacts of a deployment.
//!
//! The kernel ships inside the root layer as
//! `usr/lib/modules/$kver/vmlinuz`; it is copied next to its generated
//! initramfs into a per-deployment directory of the boot partition, which
//! the boot entry references.

use std::cmp::Ordering;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::initramfs::InitramfsBuilder;

/// Where kernels live inside a deployment.
const MODULES_DIR: &str = "usr/lib/modules";
/// Kernel filename, both in the deployment and on the boot partition.
pub(crate) const VMLINUZ: &str = "vmlinuz";
/// Initramfs filename on the boot partition.
pub(crate) const INITRAMFS: &str = "initramfs.img";

/// A kernel found in a deployment.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Kernel {
    pub(crate) kver: String,
    pub(crate) vmlinuz: Utf8PathBuf,
}

/// Separators between the components of a kernel version.
const KVER_SEPARATORS: &[char] = &['.', '-', '_', '+'];

/// Order kernel versions component by component; components that are both
/// numbers compare numerically, so `6.10.0` is newer than `6.9.0`.
fn compare_kver(a: &str, b: &str) -> Ordering {
    let mut x = a.split(KVER_SEPARATORS);
    let mut y = b.split(KVER_SEPARATORS);
    loop {
        let o = match (x.next(), y.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => match (l.parse::<u64>(), r.parse::<u64>()) {
                (Ok(l), Ok(r)) => l.cmp(&r),
                (Ok(_), Err(_)) => Ordering::Greater,
                (Err(_), Ok(_)) => Ordering::Less,
                (Err(_), Err(_)) => l.cmp(r),
            },
        };
        if o != Ordering::Equal {
            return o;
        }
    }
}

/// Locate the kernel in `rootfs`. When several versions are present the
/// newest one wins.
#[context("Finding kernel in {rootfs}")]
pub(crate) fn find_kernel(rootfs: &Utf8Path) -> Result<Kernel> {
    let modules = rootfs.join(MODULES_DIR);
    let mut found = Vec::new();
    for ent in modules
        .read_dir_utf8()
        .with_context(|| format!("Reading {modules}"))?
    {
        let ent = ent?;
        let vmlinuz = ent.path().join(VMLINUZ);
        if vmlinuz.try_exists()? {
            found.push(Kernel {
                kver: ent.file_name().to_owned(),
                vmlinuz,
            });
        }
    }
    found.sort_by(|a, b| compare_kver(&a.kver, &b.kver));
    let Some(kernel) = found.pop() else {
        anyhow::bail!("No kernel found in {modules}");
    };
    if !found.is_empty() {
        tracing::warn!(
            "Multiple kernels in {modules}, using {} and ignoring {}",
            kernel.kver,
            found.iter().map(|k| k.kver.as_str()).collect::<Vec<_>>().join(", ")
        );
    }
    Ok(kernel)
}

/// Copy the kernel of `rootfs` into `dest` and generate its initramfs
/// there.
#[context("Installing kernel artifacts into {dest}")]
pub(crate) fn install_boot_artifacts(
    rootfs: &Utf8Path,
    dest: &Utf8Path,
    initramfs: &dyn InitramfsBuilder,
) -> Result<Kernel> {
    let kernel = find_kernel(rootfs)?;
    std::fs::create_dir_all(dest).with_context(|| format!("Creating {dest}"))?;
    std::fs::copy(&kernel.vmlinuz, dest.join(VMLINUZ)).context("Copying kernel")?;
    initramfs.generate(rootfs, &kernel.kver, &dest.join(INITRAMFS))?;
    tracing::debug!("Installed kernel {} into {dest}", kernel.kver);
    Ok(kernel)
}
