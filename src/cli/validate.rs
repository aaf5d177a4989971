//! The `mcpack validate` subcommand.

use std::process::ExitCode;

use clap::Args;
use log::warn;

use crate::validate::{Severity, validate};

use super::Cli;

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct Validate {
    /// Also report warnings as findings in the summary
    #[arg(long)]
    pub strict: bool,
}

impl Validate {
    /// Load the workspace and validate it; errors exit nonzero.
    ///
    /// # Errors
    ///
    /// Infallible in practice: load and validation failures are findings,
    /// not errors.
    pub fn execute(self, cli: &Cli) -> color_eyre::Result<ExitCode> {
        let outcome = cli.loader().load();
        for warning in &outcome.warnings {
            warn!("{warning}");
        }

        let report = validate(&outcome.modules);

        for diagnostic in &report.diagnostics {
            let prefix = match diagnostic.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
            };
            println!(
                "{prefix}: {}: {}: {}",
                diagnostic.module_path.display(),
                diagnostic.field,
                diagnostic.message,
            );
        }

        let errors = report.errors().count();
        let warnings = report.warnings().count();
        println!(
            "{} module(s), {errors} error(s), {warnings} warning(s)",
            outcome.modules.len(),
        );

        let failed = !report.is_valid() || (self.strict && warnings > 0);
        Ok(if failed {
            ExitCode::FAILURE
        } else {
            ExitCode::SUCCESS
        })
    }
}
