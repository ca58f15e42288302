//! # Atomic root filesystem deployments
//!
//! This crate downloads versioned images of a whole root filesystem,
//! installs each one as its own set of copy-on-write snapshots, and
//! registers it with the bootloader so the system can switch between
//! versions, or back to an older one, by rebooting.

mod bootloader;
mod bundle;
mod cache;
pub mod cli;
mod config;
pub(crate) mod deploy;
mod error;
mod initramfs;
mod kernel;
mod ledger;
mod materialize;
pub(crate) mod parsers;
mod repo;
mod retention;
mod snapshot;
mod status;
mod store;
mod teardown;

#[cfg(test)]
mod testutil;
