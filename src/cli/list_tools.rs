//! The `mcpack list-tools` subcommand.

use std::process::ExitCode;

use clap::Args;
use log::warn;

use crate::{
    credentials::{discover, group_by_service},
    module::{Metadata, Module, ModuleKind},
};

use super::Cli;

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct ListTools {
    /// Also list the aggregated credential requirements
    #[arg(long)]
    pub credentials: bool,
}

impl ListTools {
    /// Load the workspace and print a human-readable module dump.
    ///
    /// # Errors
    ///
    /// Infallible in practice; load failures degrade to warnings.
    pub fn execute(self, cli: &Cli) -> color_eyre::Result<ExitCode> {
        let outcome = cli.loader().load();
        for warning in &outcome.warnings {
            warn!("{warning}");
        }

        if outcome.modules.is_empty() {
            println!("no modules found");
            return Ok(ExitCode::SUCCESS);
        }

        print_kind(&outcome.modules, ModuleKind::Tool, "Tools");
        print_kind(&outcome.modules, ModuleKind::Connector, "Connectors");

        if self.credentials {
            let discovery = discover(&outcome.modules);
            for warning in &discovery.warnings {
                warn!("{warning}");
            }
            if !discovery.credentials.is_empty() {
                println!("\nCredentials");
                for (service, group) in group_by_service(&discovery.credentials) {
                    println!("  [{service}]");
                    for credential in group {
                        let requirement =
                            if credential.required { "required" } else { "optional" };
                        println!(
                            "    {} ({}, {requirement}) - used by {}",
                            credential.name,
                            credential.credential_type,
                            credential
                                .used_by
                                .iter()
                                .map(String::as_str)
                                .collect::<Vec<_>>()
                                .join(", "),
                        );
                    }
                }
            }
        }

        Ok(ExitCode::SUCCESS)
    }
}

fn print_kind(modules: &[Module], kind: ModuleKind, heading: &str) {
    let selected: Vec<&Module> = modules
        .iter()
        .filter(|module| module.kind == kind)
        .collect();
    if selected.is_empty() {
        return;
    }

    println!("{heading} ({})", selected.len());
    for module in selected {
        let common = module.common();
        let version = common.version.as_deref().unwrap_or("?");
        let description = common.description.as_deref().unwrap_or("");
        let type_note = match &module.metadata {
            Metadata::Connector(connector) => connector
                .connector_type
                .as_deref()
                .map(|connector_type| format!(" [{connector_type}]"))
                .unwrap_or_default(),
            Metadata::Tool(_) => String::new(),
        };
        println!(
            "  {} v{version} ({}){type_note} - {description}",
            module.name, module.language,
        );
    }
}
