//! CLI command handlers.

use clap::Subcommand;

pub mod root;

#[derive(Subcommand)]
pub enum Commands {
    /// Run setup.sh once against the configured pool network and exit.
    Setup,
}
