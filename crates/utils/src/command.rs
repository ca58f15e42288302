//! Helpers intended for [`std::process::Command`].

use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};

/// How much of a failed child's stderr we carry into the error.
const STDERR_TAIL_CHARS: usize = 1024;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process; if it fails, the tail of its stderr
    /// is included in the returned error.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// The commandline, quoted in a way a POSIX shell would parse back.
    fn to_string_pretty(&self) -> String;
}

fn stderr_tail(buf: &[u8]) -> String {
    let s = String::from_utf8_lossy(buf);
    let s = s.trim_end();
    let skip = s.chars().count().saturating_sub(STDERR_TAIL_CHARS);
    s.chars().skip(skip).collect()
}

fn check_status(cmd: &Command, status: ExitStatus, stderr: &[u8]) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let program = cmd.get_program().to_string_lossy();
    let stderr = stderr_tail(stderr);
    if stderr.is_empty() {
        anyhow::bail!("Subprocess {program} failed: {status}")
    }
    anyhow::bail!("Subprocess {program} failed: {status}\n{stderr}")
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let o = self
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {}", self.get_program().to_string_lossy()))?;
        check_status(self, o.status, &o.stderr)
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|a| {
                let a = a.to_string_lossy();
                match shlex::try_quote(&a) {
                    Ok(q) => q.into_owned(),
                    Err(_) => a.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
