use std::process::ExitCode;

use clap::Parser;

mod build;
mod cli;
mod config;
mod credentials;
mod docker;
mod dockerfile;
mod manifest;
mod module;
mod progress;
mod registry;
mod validate;
mod workspace;

fn main() -> color_eyre::Result<ExitCode> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();
    env_logger::Builder::new()
        .filter_level(cli.log_level())
        .format_timestamp(None)
        .init();

    cli.execute()
}
