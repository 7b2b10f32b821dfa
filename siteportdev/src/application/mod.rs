pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use clap::Parser;
use siteport_core::Mode;
use siteport_core::container::meta::ArchiveKind;
use siteport_core::error::Result;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let state_dir = cli.state_dir;
    match cli.command {
        Commands::Export {
            job,
            encrypt,
            plugin,
        } => {
            let kind = if plugin {
                ArchiveKind::Plugin
            } else {
                ArchiveKind::Media
            };
            handlers::handle_migrate(state_dir, Mode::Export, job, encrypt, kind)
        }
        Commands::Import { job } => {
            handlers::handle_migrate(state_dir, Mode::Import, job, false, ArchiveKind::default())
        }
        Commands::Step { mode, db, blog } => handlers::handle_step(state_dir, mode.into(), db, blog),
        Commands::Status { mode, blog } => handlers::handle_status(state_dir, mode.into(), blog),
        Commands::Cancel { mode, blog } => handlers::handle_cancel(state_dir, mode.into(), blog),
        Commands::List { package } => handlers::handle_list(package),
        Commands::Verify { package } => handlers::handle_verify(package),
    }
}
