//! CLI command handlers

use clap::Subcommand;

pub mod diagnostics;
pub mod root;

#[derive(Subcommand)]
pub enum Commands {
    /// Check runtime connectivity and display system information
    Diagnostics,
}
