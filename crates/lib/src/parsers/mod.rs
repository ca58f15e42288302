//! Parsers for formats owned by other components.

pub(crate) mod bls_config;
