//! Human readable rendering of the installed deployments.

use std::io::{Read, Write};

use anyhow::Result;

use crate::bootloader::entry_name;
use crate::ledger::Ledger;
use crate::store::Storage;

/// The role of a deployment in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// The most recent deployment.
    Current,
    /// The deployment the previous boot entry points at.
    Rollback,
    Other,
}

impl Slot {
    fn for_index(i: usize) -> Self {
        match i {
            0 => Slot::Current,
            1 => Slot::Rollback,
            _ => Slot::Other,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Slot::Current => "Current",
            Slot::Rollback => "Rollback",
            Slot::Other => "Previous",
        };
        f.write_str(s)
    }
}

/// Output a row title, prefixed by spaces
fn write_row_name(mut out: impl Write, s: &str, prefix_len: usize) -> Result<()> {
    let n = prefix_len.saturating_sub(s.chars().count());
    let mut spaces = std::io::repeat(b' ').take(n as u64);
    std::io::copy(&mut spaces, &mut out)?;
    write!(out, "{s}: ")?;
    Ok(())
}

/// Width of the row titles, up to the colon.
const ROW_WIDTH: usize = 12;

fn render_deployment(mut out: impl Write, slot: Slot, id: &str, storage: &Storage) -> Result<()> {
    let title = match slot {
        Slot::Current => format!("● {slot}"),
        _ => slot.to_string(),
    };
    write_row_name(&mut out, &title, ROW_WIDTH)?;
    writeln!(out, "{id}")?;
    write_row_name(&mut out, "Rootfs", ROW_WIDTH)?;
    writeln!(out, "{}", storage.rootfs(id))?;
    write_row_name(&mut out, "Boot entry", ROW_WIDTH)?;
    writeln!(out, "{}", storage.loader_entries().join(entry_name(id)))?;
    Ok(())
}

/// Render the ledger, most recent deployment first.
pub(crate) fn human_readable_output(
    mut out: impl Write,
    ledger: &Ledger,
    storage: &Storage,
) -> Result<()> {
    if ledger.is_empty() {
        writeln!(out, "No deployments.")?;
        return Ok(());
    }
    for (i, id) in ledger.iter().enumerate() {
        if i > 0 {
            writeln!(out)?;
        }
        render_deployment(&mut out, Slot::for_index(i), id, storage)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testutil;

    #[test]
    fn test_human_readable() -> Result<()> {
        let (_td, dir) = testutil::utf8_tempdir()?;
        let storage = Storage::init(&dir.join("state"), &dir.join("boot"), &Config::default())?;

        let mut w = Vec::new();
        human_readable_output(&mut w, &Ledger::default(), &storage)?;
        assert_eq!(String::from_utf8(w)?, "No deployments.\n");

        let ledger = Ledger::parse("base-3\nbase-2\nbase-1\n");
        let mut w = Vec::new();
        human_readable_output(&mut w, &ledger, &storage)?;
        let block = |title: &str, id: &str| {
            format!(
                "{title}: {id}\n      Rootfs: {dir}/state/deployments/{id}/rootfs\n  Boot entry: {dir}/boot/loader/entries/{id}.conf\n"
            )
        };
        let expected = [
            block("   ● Current", "base-3"),
            block("    Rollback", "base-2"),
            block("    Previous", "base-1"),
        ]
        .join("\n");
        similar_asserts::assert_eq!(String::from_utf8(w)?, expected);
        Ok(())
    }
}
