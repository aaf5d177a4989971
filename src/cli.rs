//! Command-line interface: declarative wiring of the pipeline components.
//!
//! No business logic lives here. Each subcommand composes the loader,
//! validator, synthesizers, builder, and registry, and maps their outcomes
//! to exit codes: `0` for success (including a voluntary abort), `1` for
//! validation or build failures.

mod build;
mod images;
mod list_tools;
mod prune;
mod run;
mod validate;

use std::{path::PathBuf, process::ExitCode};

use clap::{ArgAction, Parser, Subcommand};
use log::LevelFilter;

use crate::{module::ModuleKind, workspace::Loader};

#[derive(Parser, Debug, Clone, PartialEq)]
#[command(author, version, about, subcommand_precedence_over_arg = true)]
pub struct Cli {
    /// Path to the base config file
    ///
    /// An environment overlay (`config.<env>.yaml`, `<env>.yaml`, or
    /// `config.<env>.json`) is looked up in the same directory when
    /// `--env` is given to a command that resolves configuration.
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Workspace root containing the `tools/` and `connectors/` subtrees
    #[arg(short, long, global = true, value_name = "DIR", default_value = ".")]
    workspace: PathBuf,

    /// Override the tools directory
    #[arg(long, global = true, value_name = "DIR")]
    tools_dir: Option<PathBuf>,

    /// Override the connectors directory
    #[arg(long, global = true, value_name = "DIR")]
    connectors_dir: Option<PathBuf>,

    /// Extra directory whose files are loaded as tools; can be repeated
    #[arg(long, global = true, value_name = "DIR")]
    extra_tools_dir: Vec<PathBuf>,

    /// Extra directory whose files are loaded as connectors; can be repeated
    #[arg(long, global = true, value_name = "DIR")]
    extra_connectors_dir: Vec<PathBuf>,

    /// Do not use the engine's build cache
    #[arg(long, global = true)]
    no_cache: bool,

    /// More output; repeat for debug output
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Commands {
    /// Run the full pipeline: load, validate, synthesize, and build an image
    #[command(visible_alias = "b")]
    Build(build::Build),

    /// Start a previously built image
    #[command(visible_alias = "r")]
    Run(run::Run),

    /// List the modules discovered in the workspace
    #[command(visible_alias = "ls")]
    ListTools(list_tools::ListTools),

    /// Load and validate the workspace without building
    #[command(visible_alias = "check")]
    Validate(validate::Validate),

    /// List locally stored images, newest first
    Images(images::Images),

    /// Remove old images, keeping the newest of each repository
    Prune(prune::Prune),
}

impl Cli {
    /// Log level implied by the verbosity flags.
    #[must_use]
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                _ => LevelFilter::Debug,
            }
        }
    }

    /// Whether progress should be rendered to the terminal.
    fn show_progress(&self) -> bool {
        !self.quiet
    }

    /// Whether debug dumps (masked config) should be printed on failure.
    fn debug_output(&self) -> bool {
        self.verbose >= 2
    }

    fn loader(&self) -> Loader {
        let mut loader = Loader::new(&self.workspace);
        if let Some(tools_dir) = &self.tools_dir {
            loader = loader.tools_dir(tools_dir);
        }
        if let Some(connectors_dir) = &self.connectors_dir {
            loader = loader.connectors_dir(connectors_dir);
        }
        for dir in &self.extra_tools_dir {
            loader = loader.extra_root(dir, ModuleKind::Tool);
        }
        for dir in &self.extra_connectors_dir {
            loader = loader.extra_root(dir, ModuleKind::Connector);
        }
        loader
    }

    /// Dispatch to the selected command.
    ///
    /// # Errors
    ///
    /// Returns an error report for failures that are not expressed as an
    /// exit code (I/O problems, malformed options, engine transport).
    pub fn execute(self) -> color_eyre::Result<ExitCode> {
        match &self.command {
            Commands::Build(command) => command.clone().execute(&self),
            Commands::Run(command) => command.clone().execute(&self),
            Commands::ListTools(command) => command.clone().execute(&self),
            Commands::Validate(command) => command.clone().execute(&self),
            Commands::Images(command) => command.clone().execute(),
            Commands::Prune(command) => command.clone().execute(),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn verbosity_mapping() {
        let cli = Cli::parse_from(["mcpack", "validate"]);
        assert_eq!(cli.log_level(), LevelFilter::Warn);

        let cli = Cli::parse_from(["mcpack", "-v", "validate"]);
        assert_eq!(cli.log_level(), LevelFilter::Info);

        let cli = Cli::parse_from(["mcpack", "-vv", "validate"]);
        assert_eq!(cli.log_level(), LevelFilter::Debug);
        assert!(cli.debug_output());

        let cli = Cli::parse_from(["mcpack", "--quiet", "validate"]);
        assert_eq!(cli.log_level(), LevelFilter::Error);
        assert!(!cli.show_progress());
    }

    #[test]
    fn aliases_resolve() {
        let cli = Cli::parse_from(["mcpack", "check"]);
        assert!(matches!(cli.command, Commands::Validate(_)));

        let cli = Cli::parse_from(["mcpack", "ls"]);
        assert!(matches!(cli.command, Commands::ListTools(_)));
    }
}
