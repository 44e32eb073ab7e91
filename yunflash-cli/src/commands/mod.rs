//! Subcommand implementations.

pub(crate) mod completions;
pub(crate) mod list_ports;
pub(crate) mod update;
