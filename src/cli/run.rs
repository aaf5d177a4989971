//! The `mcpack run` subcommand: start a previously built image.

use std::{path::PathBuf, process::ExitCode};

use clap::Args;
use color_eyre::eyre::WrapErr;

use crate::{docker, manifest, registry::sanitize_tag_component};

use super::Cli;

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct Run {
    /// Image reference to run
    ///
    /// Defaults to `<manifest name>:<manifest version>` derived from the
    /// workspace.
    pub image: Option<String>,

    /// Host port published to the server port inside the container
    #[arg(short, long, value_name = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Host address the published port binds to
    #[arg(long, value_name = "ADDRESS")]
    pub host: Option<String>,

    /// Run in the background and print the container ID
    #[arg(short, long)]
    pub detach: bool,

    /// Container name
    #[arg(short, long, value_name = "NAME")]
    pub name: Option<String>,

    /// File of KEY=VALUE lines passed to the container environment
    #[arg(long, value_name = "PATH")]
    pub env_file: Option<PathBuf>,

    /// Remove the container when it exits
    #[arg(long)]
    pub rm: bool,
}

impl Run {
    /// Start the container.
    ///
    /// # Errors
    ///
    /// Returns an error when the engine cannot be driven.
    pub fn execute(self, cli: &Cli) -> color_eyre::Result<ExitCode> {
        let image = self.image.clone().unwrap_or_else(|| {
            let manifest = manifest::synthesize(&[], &cli.workspace);
            format!(
                "{}:{}",
                sanitize_tag_component(&manifest.name),
                sanitize_tag_component(&manifest.version),
            )
        });

        let mut args = vec!["run".to_owned()];
        if self.rm {
            args.push("--rm".to_owned());
        }
        if self.detach {
            args.push("--detach".to_owned());
        }
        if let Some(name) = &self.name {
            args.push("--name".to_owned());
            args.push(name.clone());
        }
        if let Some(env_file) = &self.env_file {
            args.push("--env-file".to_owned());
            args.push(env_file.display().to_string());
        }
        args.push("--publish".to_owned());
        let publish = match &self.host {
            Some(host) => format!("{host}:{}:8080", self.port),
            None => format!("{}:8080", self.port),
        };
        args.push(publish);
        args.push(image.clone());

        if self.detach {
            let container_id = docker::capture(args.iter().map(String::as_str))
                .wrap_err_with(|| format!("error starting {image}"))?;
            println!("{}", container_id.trim());
            return Ok(ExitCode::SUCCESS);
        }

        let status = docker::interactive(args.iter().map(String::as_str))
            .wrap_err_with(|| format!("error starting {image}"))?;
        Ok(if status.success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        })
    }
}
