//! The `mcpack build` subcommand: the full pipeline from workspace to
//! (optionally pushed) image.

use std::{process::ExitCode, sync::mpsc, time::Duration};

use clap::Args;
use color_eyre::{
    Section, SectionExt,
    eyre::{WrapErr, eyre},
};
use log::{debug, info, warn};

use crate::{
    build::{BuildError, BuildOptions, build},
    config::{ArrayMerge, Resolver, debug_dump, watch::watch},
    credentials::{discover, prompt_fields},
    dockerfile::{SynthesisOptions, synthesize, validate as validate_dockerfile},
    manifest::{synthesize as synthesize_manifest, validate_manifest},
    progress::{ProgressEvent, Signal},
    registry::{self, PushError, PushOptions, sanitize_tag_component},
    validate::validate,
};

use super::Cli;

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct Build {
    /// Image tag; can be repeated, the first is the primary tag
    ///
    /// Defaults to `<manifest name>:<manifest version>`. A UTC timestamp
    /// tag is always added alongside.
    #[arg(short, long, value_name = "TAG")]
    pub tag: Vec<String>,

    /// Directory the build log is written to
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<std::path::PathBuf>,

    /// Platform passed through to the engine, e.g. `linux/amd64`
    #[arg(long, value_name = "PLATFORM")]
    pub platform: Option<String>,

    /// Push the primary tag after a successful build
    #[arg(long)]
    pub push: bool,

    /// Go through the motions without contacting the engine
    #[arg(long)]
    pub dry_run: bool,

    /// Environment overlay for config resolution, e.g. `production`
    #[arg(short, long, value_name = "ENV")]
    pub env: Option<String>,

    /// Config override, `path.to.key=value`; can be repeated
    #[arg(long = "set", value_name = "PATH=VALUE")]
    pub set: Vec<String>,

    /// Build only this stage of a multi-stage Dockerfile
    #[arg(long, value_name = "STAGE")]
    pub target: Option<String>,

    /// Abort the build after this many seconds
    #[arg(long, value_name = "SECONDS", default_value_t = 1800)]
    pub timeout: u64,

    /// How config arrays merge across layers
    #[arg(long, value_name = "STRATEGY", value_parser = parse_array_merge)]
    pub array_merge: Option<ArrayMerge>,

    /// Rebuild whenever the config file changes
    ///
    /// Requires `--config`; every change produces a fresh resolution and a
    /// fresh build, never an in-place mutation.
    #[arg(long)]
    pub watch: bool,
}

fn parse_array_merge(s: &str) -> Result<ArrayMerge, String> {
    match s {
        "replace" => Ok(ArrayMerge::Replace),
        "concat" => Ok(ArrayMerge::Concat),
        "unique" => Ok(ArrayMerge::Unique),
        _ => Err(format!("unknown strategy `{s}`; expected replace, concat, or unique")),
    }
}

impl Build {
    /// Run the pipeline, optionally re-running it on config changes.
    ///
    /// # Errors
    ///
    /// Returns an error report for configuration problems and build
    /// failures (with the failed instruction, suggestions, and log pointer
    /// attached); validation failures are listed and mapped to a nonzero
    /// exit code.
    pub fn execute(self, cli: &Cli) -> color_eyre::Result<ExitCode> {
        if !self.watch {
            return self.run_once(cli);
        }

        let Some(config) = cli.config.clone() else {
            return Err(eyre!("--watch requires --config; there is no file to watch"));
        };

        let (sender, receiver) = mpsc::channel();
        let _watcher = watch(vec![config], move |changed| {
            let _ = sender.send(changed.clone());
        })
        .wrap_err("error starting the config watcher")?;

        let mut code = self.run_and_report(cli);
        loop {
            eprintln!("watching for config changes (ctrl-c to stop)");
            let Ok(changed) = receiver.recv() else {
                break;
            };
            // Editors write in bursts; let the burst settle.
            while receiver.recv_timeout(Duration::from_millis(200)).is_ok() {}
            info!("{} changed; rebuilding", changed.display());
            code = self.run_and_report(cli);
        }
        Ok(code)
    }

    /// One watched iteration: a failed run is rendered but keeps the watch
    /// alive so the next config change can fix it.
    fn run_and_report(&self, cli: &Cli) -> ExitCode {
        match self.run_once(cli) {
            Ok(code) => code,
            Err(error) => {
                eprintln!("{error:?}");
                ExitCode::FAILURE
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn run_once(&self, cli: &Cli) -> color_eyre::Result<ExitCode> {
        // Load and validate.
        let outcome = cli.loader().load();
        for warning in &outcome.warnings {
            warn!("{warning}");
        }

        let report = validate(&outcome.modules);
        for warning in report.warnings() {
            warn!(
                "{}: {}: {}",
                warning.module_path.display(),
                warning.field,
                warning.message,
            );
        }
        if !report.is_valid() {
            for error in report.errors() {
                eprintln!(
                    "error: {}: {}: {}",
                    error.module_path.display(),
                    error.field,
                    error.message,
                );
            }
            eprintln!("validation failed; not building");
            return Ok(ExitCode::FAILURE);
        }

        // Credential requirements: warn about required ones with no value
        // in the environment. The interactive prompt is outside the build
        // pipeline.
        let discovery = discover(&outcome.modules);
        for warning in &discovery.warnings {
            warn!("{warning}");
        }
        let fields = prompt_fields(&discovery.credentials);
        for (credential, field) in discovery.credentials.iter().zip(&fields) {
            if credential.required && std::env::var(&field.env_var).is_err() {
                warn!(
                    "required credential {} has no value in ${}",
                    credential.name, field.env_var,
                );
            }
        }

        // Layered config.
        let mut resolver = Resolver::new().env_vars_from_process();
        if let Some(config) = &cli.config {
            resolver = resolver.config_path(config);
        }
        if let Some(env) = &self.env {
            resolver = resolver.environment(env.as_str());
        }
        if let Some(strategy) = self.array_merge {
            resolver = resolver.array_merge(strategy);
        }
        let resolved = resolver
            .cli_args(&self.set)?
            .resolve()
            .wrap_err("error resolving configuration")?;
        debug!("resolved configuration:\n{}", debug_dump(&resolved));

        // Manifest.
        let manifest = synthesize_manifest(&outcome.modules, &cli.workspace);
        let manifest_report = validate_manifest(&manifest);
        if !manifest_report.is_valid() {
            for error in &manifest_report.errors {
                eprintln!("error: {error}");
            }
            return Ok(ExitCode::FAILURE);
        }

        // Dockerfile.
        let port = resolved
            .config
            .pointer("/server/port")
            .and_then(serde_json::Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(8080);
        let synthesis_options = SynthesisOptions {
            port,
            ..SynthesisOptions::default()
        };
        let synthesis = synthesize(
            &manifest,
            cli.config.as_deref(),
            &outcome.modules,
            &synthesis_options,
        );

        let dockerfile_report = validate_dockerfile(&synthesis.dockerfile);
        for warning in &dockerfile_report.warnings {
            warn!("Dockerfile: {warning}");
        }
        if !dockerfile_report.is_valid() {
            for error in &dockerfile_report.errors {
                eprintln!("error: Dockerfile: {error}");
            }
            return Ok(ExitCode::FAILURE);
        }

        // Tags.
        let primary_tag = self.tag.first().cloned().unwrap_or_else(|| {
            format!(
                "{}:{}",
                sanitize_tag_component(&manifest.name),
                sanitize_tag_component(&manifest.version),
            )
        });
        let repository = primary_tag
            .split_once(':')
            .map_or(primary_tag.as_str(), |(repository, _)| repository);
        let mut additional_tags: Vec<String> = self.tag.iter().skip(1).cloned().collect();
        additional_tags.push(format!("{repository}:{}", registry::timestamp_tag()));

        let options = BuildOptions {
            tag: primary_tag.clone(),
            additional_tags,
            target: self.target.clone(),
            no_cache: cli.no_cache,
            platform: self.platform.clone(),
            workdir: cli.workspace.clone(),
            log_file: self.output.as_ref().map(|output| output.join("build.log")),
            timeout: Duration::from_secs(self.timeout),
            ..BuildOptions::default()
        };

        if self.dry_run {
            println!(
                "dry run: would build {primary_tag} from {}",
                cli.workspace.display(),
            );
            println!(
                "dry run: {} tool(s), {} connector(s), {} dependency range(s)",
                manifest.tools.len(),
                manifest.connectors.len(),
                manifest.dependencies.len(),
            );
            if self.push {
                return self.push_tag(&primary_tag, cli);
            }
            return Ok(ExitCode::SUCCESS);
        }

        // Build.
        let show_progress = cli.show_progress();
        let mut handler = |event: &ProgressEvent| {
            if show_progress {
                render_progress(event);
            }
            Signal::Continue
        };

        match build(&manifest, &synthesis, &options, &mut handler) {
            Ok(artifact) => {
                info!(
                    "built {} in {}s",
                    artifact.image_id,
                    artifact.build_time.as_secs(),
                );
                println!(
                    "image {} ({}) tagged {}",
                    artifact.image_id,
                    registry::format_size(artifact.image_size),
                    artifact.tags.join(", "),
                );
                println!("build log: {}", artifact.log_file.display());

                if self.push {
                    return self.push_tag(&primary_tag, cli);
                }
                Ok(ExitCode::SUCCESS)
            }
            Err(BuildError::Failed(failure)) => {
                let mut report = eyre!("build failed: {}", failure.message);

                if let Some(instruction) = &failure.failed_instruction {
                    let failed_at = match (failure.failed_step, failure.total_steps) {
                        (Some(step), Some(total)) => {
                            format!("step {step}/{total}: {instruction}")
                        }
                        _ => instruction.clone(),
                    };
                    report = report.section(failed_at.header("Failed Instruction:"));
                }
                for suggestion in &failure.suggestions {
                    report = report.suggestion(suggestion.clone());
                }
                report = report.note(format!(
                    "the full build log is at {}",
                    failure.log_file.display(),
                ));
                if cli.debug_output() {
                    report = report.section(
                        debug_dump(&resolved)
                            .trim_end()
                            .to_owned()
                            .header("Resolved Configuration:"),
                    );
                }

                Err(report)
            }
            Err(error) => Err(error).wrap_err("error driving the container engine"),
        }
    }

    fn push_tag(&self, tag: &str, cli: &Cli) -> color_eyre::Result<ExitCode> {
        let show_progress = cli.show_progress();
        let mut handler = |event: &ProgressEvent| {
            if show_progress {
                render_progress(event);
            }
            Signal::Continue
        };

        let push_options = PushOptions {
            dry_run: self.dry_run,
        };
        match registry::push_image(tag, None, None, push_options, &mut handler) {
            Ok(()) => Ok(ExitCode::SUCCESS),
            Err(PushError::Rejected { message }) => Err(eyre!("push rejected: {message}")
                .suggestion(
                    "check that the repository exists and you are logged in to the registry",
                )
                .note("registry credentials are also read from conventional environment \
                    variables, e.g. DOCKER_USERNAME/DOCKER_PASSWORD")),
            Err(error) => Err(error).wrap_err_with(|| format!("error pushing {tag}")),
        }
    }
}

fn render_progress(event: &ProgressEvent) {
    match event {
        ProgressEvent::Step {
            step,
            total_steps,
            message,
            elapsed_secs,
        } => eprintln!("[{step}/{total_steps}] ({elapsed_secs}s) {message}"),
        ProgressEvent::Download { message, percent } => match percent {
            Some(percent) => eprintln!("  {message} ({percent:.0}%)"),
            None => eprintln!("  {message}"),
        },
        ProgressEvent::PushStatus {
            status,
            layer,
            percent,
        } => {
            let layer = layer.as_deref().unwrap_or("");
            match percent {
                Some(percent) => eprintln!("  {layer} {status} ({percent:.0}%)"),
                None => eprintln!("  {layer} {status}"),
            }
        }
        ProgressEvent::Error { message } => eprintln!("  {message}"),
        ProgressEvent::Complete { message } => eprintln!("{message}"),
    }
}
