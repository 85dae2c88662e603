//! Embedded templates.

/// Default `burrow.toml` configuration.
pub(crate) const BURROW_TOML: &str = include_str!("burrow.toml");
