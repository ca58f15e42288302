//! Generation of the initramfs for a deployment.

use std::process::Command;

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;
use rootsnap_utils::CommandRunExt;

/// Builds an initramfs for a kernel found inside a deployment.
pub(crate) trait InitramfsBuilder {
    /// Write an initramfs for kernel `kver` of `sysroot` to `output`.
    fn generate(&self, sysroot: &Utf8Path, kver: &str, output: &Utf8Path) -> Result<()>;
}

/// `dracut(8)`, run against the deployment rather than the booted system.
#[derive(Debug, Default)]
pub(crate) struct Dracut;

impl InitramfsBuilder for Dracut {
    #[context("Generating initramfs for {kver}")]
    fn generate(&self, sysroot: &Utf8Path, kver: &str, output: &Utf8Path) -> Result<()> {
        Command::new("dracut")
            .args(["--force", "--quiet", "--sysroot", sysroot.as_str()])
            .args(["--kver", kver])
            .arg(output.as_str())
            .log_debug()
            .run_capture_stderr()
    }
}
