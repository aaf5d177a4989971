//! Image construction: stages the build context, drives the engine's build,
//! streams progress, and produces structured success or failure reports.

use std::{
    fs,
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::LazyLock,
    time::{Duration, Instant},
};

use indexmap::IndexMap;
use log::warn;
use regex::Regex;
use smart_default::SmartDefault;

use crate::{
    dockerfile::Synthesis,
    docker::{self, EngineError, NextLine},
    manifest::Manifest,
    progress::{ProgressEvent, ProgressHandler, Signal, notify},
    registry,
};

static CLASSIC_STEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Step (?P<step>\d+)/(?P<total>\d+) : (?P<instruction>.*)$")
        .expect("classic step regex is valid")
});

static BUILDKIT_STEP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^#\d+ \[(?:[\w.-]+ )?(?P<step>\d+)/(?P<total>\d+)\] (?P<instruction>.*)$")
        .expect("buildkit step regex is valid")
});

static SUCCESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:Successfully built |writing image sha256:)(?P<id>[0-9a-f]+)")
        .expect("success regex is valid")
});

static DOWNLOAD_PERCENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<current>[0-9.]+)\s*(?:B|kB|KB|MB|GB)/(?P<total>[0-9.]+)\s*(?:B|kB|KB|MB|GB)")
        .expect("download percent regex is valid")
});

/// Options for one image build.
#[derive(SmartDefault, Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    /// Primary tag, applied by the engine during the build.
    #[default = "mcp-server:latest"]
    pub tag: String,

    /// Applied after a successful build, in order.
    pub additional_tags: Vec<String>,

    pub build_args: IndexMap<String, String>,

    /// Target stage for multi-stage Dockerfiles.
    pub target: Option<String>,

    pub no_cache: bool,

    pub platform: Option<String>,

    /// Build context directory; the Dockerfile and manifest are staged here.
    #[default(PathBuf::from("."))]
    pub workdir: PathBuf,

    /// Defaults to `build.log` inside the workdir.
    pub log_file: Option<PathBuf>,

    #[default = true]
    pub cleanup_on_failure: bool,

    /// Per-invocation ceiling on the whole build.
    #[default(Duration::from_secs(1800))]
    pub timeout: Duration,
}

/// A successful build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildArtifact {
    pub image_id: String,
    /// Primary tag plus every additional tag that applied cleanly.
    pub tags: Vec<String>,
    pub build_time: Duration,
    pub image_size: u64,
    pub log_file: PathBuf,
}

/// A failed build, with enough structure to render a useful report.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildFailure {
    pub message: String,
    pub failed_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub failed_instruction: Option<String>,
    pub suggestions: Vec<String>,
    pub log_file: PathBuf,
}

/// Errors from a build invocation.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("error staging build context in {path}")]
    Stage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{}", .0.message)]
    Failed(BuildFailure),
}

/// Build an image from a staged manifest and synthesized Dockerfile.
///
/// Every line of engine output is appended to the log file in arrival
/// order, independent of the progress events emitted. The progress handler
/// may cancel; cancellation and timeout both surface as a structured
/// [`BuildFailure`] with cleanup executed when enabled.
///
/// # Errors
///
/// Returns [`BuildError::Stage`] when the context cannot be written,
/// [`BuildError::Engine`] when the engine cannot be spawned, and
/// [`BuildError::Failed`] for everything the daemon reports.
pub fn build(
    manifest: &Manifest,
    synthesis: &Synthesis,
    options: &BuildOptions,
    handler: &mut ProgressHandler<'_>,
) -> Result<BuildArtifact, BuildError> {
    let log_file = options
        .log_file
        .clone()
        .unwrap_or_else(|| options.workdir.join("build.log"));

    let iidfile = stage_context(manifest, synthesis, options)?;

    let mut args = vec![
        "build".to_owned(),
        "--file".to_owned(),
        "Dockerfile".to_owned(),
        "--tag".to_owned(),
        options.tag.clone(),
        "--iidfile".to_owned(),
        iidfile.display().to_string(),
    ];
    for (key, value) in &options.build_args {
        args.push("--build-arg".to_owned());
        args.push(format!("{key}={value}"));
    }
    if let Some(target) = &options.target {
        args.push("--target".to_owned());
        args.push(target.clone());
    }
    if let Some(platform) = &options.platform {
        args.push("--platform".to_owned());
        args.push(platform.clone());
    }
    if options.no_cache {
        args.push("--no-cache".to_owned());
    }
    args.push(".".to_owned());

    let started = Instant::now();
    let mut streamed = docker::stream(args.iter().map(String::as_str), Some(&options.workdir))?;

    let mut log = fs::File::create(&log_file).map_err(|source| BuildError::Stage {
        path: log_file.clone(),
        source,
    })?;

    let mut observer = BuildObserver::default();
    let outcome = loop {
        let remaining = options
            .timeout
            .checked_sub(started.elapsed())
            .unwrap_or(Duration::ZERO);
        if remaining.is_zero() {
            streamed.kill();
            break StreamOutcome::TimedOut;
        }
        match streamed.next_line(remaining) {
            Ok(NextLine::Line(line)) => {
                // The log gets every line regardless of classification.
                if let Err(error) = writeln!(log, "{line}") {
                    warn!("could not append to {}: {error}", log_file.display());
                }
                let event = observer.observe(&line, started.elapsed());
                if let Some(event) = event {
                    if notify(handler, &event) == Signal::Cancel {
                        streamed.kill();
                        break StreamOutcome::Cancelled;
                    }
                }
            }
            Ok(NextLine::Finished) => break StreamOutcome::Finished,
            Ok(NextLine::TimedOut) => {
                streamed.kill();
                break StreamOutcome::TimedOut;
            }
            Err(error) => {
                streamed.kill();
                break StreamOutcome::Broken(error);
            }
        }
    };
    let _ = log.flush();

    let failure = |message: String, observer: &BuildObserver| {
        BuildError::Failed(observer.failure(message, &log_file, suggest))
    };

    match outcome {
        StreamOutcome::Finished => match streamed.finish() {
            Ok(_) => {}
            Err(error) => {
                cleanup(options);
                let message = observer
                    .first_error
                    .clone()
                    .unwrap_or_else(|| error.to_string());
                return Err(failure(message, &observer));
            }
        },
        StreamOutcome::Cancelled => {
            cleanup(options);
            return Err(failure("build cancelled by progress callback".to_owned(), &observer));
        }
        StreamOutcome::TimedOut => {
            cleanup(options);
            return Err(failure(
                format!("build timed out after {} seconds", options.timeout.as_secs()),
                &observer,
            ));
        }
        StreamOutcome::Broken(error) => {
            cleanup(options);
            return Err(failure(error.to_string(), &observer));
        }
    }

    let image_id = read_image_id(&iidfile, &observer)?;

    notify(handler, &ProgressEvent::Complete {
        message: format!("built {image_id}"),
    });

    let mut tags = vec![options.tag.clone()];
    if !options.additional_tags.is_empty() {
        let applied = registry::tag_image(&image_id, &options.additional_tags);
        for failed in &applied.failed_tags {
            warn!("could not apply tag {}: {}", failed.tag, failed.error);
        }
        tags.extend(applied.applied_tags);
    }

    Ok(BuildArtifact {
        image_size: image_size(&image_id),
        image_id,
        tags,
        build_time: started.elapsed(),
        log_file,
    })
}

enum StreamOutcome {
    Finished,
    Cancelled,
    TimedOut,
    Broken(EngineError),
}

/// Write Dockerfile, dockerignore, and the manifest JSON into the context.
/// Returns the path the engine writes the image ID to.
fn stage_context(
    manifest: &Manifest,
    synthesis: &Synthesis,
    options: &BuildOptions,
) -> Result<PathBuf, BuildError> {
    let workdir = &options.workdir;
    let stage = |path: PathBuf, contents: &str| -> Result<(), BuildError> {
        fs::write(&path, contents).map_err(|source| BuildError::Stage { path, source })
    };

    fs::create_dir_all(workdir).map_err(|source| BuildError::Stage {
        path: workdir.clone(),
        source,
    })?;

    stage(workdir.join("Dockerfile"), &synthesis.dockerfile)?;
    stage(workdir.join(".dockerignore"), &synthesis.dockerignore)?;

    let manifest_json =
        serde_json::to_string_pretty(manifest).unwrap_or_else(|_| "{}".to_owned());
    stage(workdir.join("manifest.json"), &manifest_json)?;

    // Outside the context so it is neither copied nor cached.
    Ok(std::env::temp_dir().join(format!(
        "mcpack-iid-{}.txt",
        registry::sanitize_tag_component(&options.tag),
    )))
}

fn read_image_id(iidfile: &Path, observer: &BuildObserver) -> Result<String, BuildError> {
    if let Ok(contents) = fs::read_to_string(iidfile) {
        let _ = fs::remove_file(iidfile);
        let id = contents.trim();
        if !id.is_empty() {
            return Ok(id.to_owned());
        }
    }
    // Fall back to what the stream announced.
    observer.image_id.clone().ok_or_else(|| {
        BuildError::Failed(BuildFailure {
            message: "build reported success but no image ID was found".to_owned(),
            ..BuildFailure::default()
        })
    })
}

fn image_size(image_id: &str) -> u64 {
    docker::capture(["image", "inspect", "--format", "{{.Size}}", image_id])
        .ok()
        .and_then(|output| output.trim().parse().ok())
        .unwrap_or(0)
}

fn cleanup(options: &BuildOptions) {
    if !options.cleanup_on_failure {
        return;
    }
    // Best effort: the partial image may not exist.
    if docker::capture(["rmi", "--force", options.tag.as_str()]).is_err() {
        warn!("no partial image to clean up for {}", options.tag);
    }
}

/// Stateful classifier for the engine's build output.
#[derive(Debug, Default)]
pub struct BuildObserver {
    pub current_step: Option<u32>,
    pub total_steps: Option<u32>,
    pub current_instruction: Option<String>,
    pub first_error: Option<String>,
    pub image_id: Option<String>,
}

impl BuildObserver {
    /// Classify one output line, updating failure-reporting state.
    pub fn observe(&mut self, line: &str, elapsed: Duration) -> Option<ProgressEvent> {
        if let Some(captures) = CLASSIC_STEP
            .captures(line)
            .or_else(|| BUILDKIT_STEP.captures(line))
        {
            let step = captures.name("step")?.as_str().parse().ok()?;
            let total_steps = captures.name("total")?.as_str().parse().ok()?;
            let instruction = captures.name("instruction")?.as_str().to_owned();
            self.current_step = Some(step);
            self.total_steps = Some(total_steps);
            self.current_instruction = Some(instruction.clone());
            return Some(ProgressEvent::Step {
                step,
                total_steps,
                message: instruction,
                elapsed_secs: elapsed.as_secs(),
            });
        }

        if let Some(captures) = SUCCESS.captures(line) {
            self.image_id = captures.name("id").map(|id| id.as_str().to_owned());
            return Some(ProgressEvent::Complete {
                message: line.trim().to_owned(),
            });
        }

        if line.contains("Downloading")
            || line.contains("Extracting")
            || line.contains("Pulling fs layer")
        {
            let percent = DOWNLOAD_PERCENT.captures(line).and_then(|captures| {
                let current: f64 = captures.name("current")?.as_str().parse().ok()?;
                let total: f64 = captures.name("total")?.as_str().parse().ok()?;
                #[allow(clippy::cast_possible_truncation)]
                (total > 0.0).then(|| ((current / total) * 100.0).clamp(0.0, 100.0) as f32)
            });
            return Some(ProgressEvent::Download {
                message: line.trim().to_owned(),
                percent,
            });
        }

        let lowered = line.to_lowercase();
        if lowered.starts_with("error")
            || lowered.contains("returned a non-zero code")
            || lowered.contains("failed to solve")
        {
            let message = line.trim().to_owned();
            self.first_error.get_or_insert_with(|| message.clone());
            return Some(ProgressEvent::Error { message });
        }

        None
    }

    fn failure(
        &self,
        message: String,
        log_file: &Path,
        suggestions_for: fn(&str) -> Vec<String>,
    ) -> BuildFailure {
        let detail = self.first_error.clone().unwrap_or_else(|| message.clone());
        BuildFailure {
            suggestions: suggestions_for(&detail),
            message,
            failed_step: self.current_step,
            total_steps: self.total_steps,
            failed_instruction: self.current_instruction.clone(),
            log_file: log_file.to_owned(),
        }
    }
}

/// Substring heuristics mapping an error message to actionable suggestions.
#[must_use]
pub fn suggest(message: &str) -> Vec<String> {
    let lowered = message.to_lowercase();
    let mut suggestions = Vec::new();

    if ["network", "timeout", "temporary failure", "could not resolve", "tls handshake"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        suggestions.push("Check network connectivity from the Docker daemon".to_owned());
        suggestions.push(
            "If you are behind a proxy, configure HTTP_PROXY/HTTPS_PROXY for the daemon"
                .to_owned(),
        );
    }

    if ["no such file", "not found", "file does not exist", "failed to compute cache key"]
        .iter()
        .any(|marker| lowered.contains(marker))
    {
        suggestions.push(
            "Check that the referenced path exists inside the build context".to_owned(),
        );
        suggestions.push(
            "COPY paths are relative to the context; `.dockerignore` may be excluding the file"
                .to_owned(),
        );
    }

    if lowered.contains("permission denied") {
        suggestions.push("Check that the Docker daemon is running and accessible".to_owned());
        suggestions
            .push("On Linux, add your user to the `docker` group or use sudo".to_owned());
    }

    if lowered.contains("returned a non-zero code") {
        suggestions.push(
            "Run the failing instruction manually in the base image to reproduce".to_owned(),
        );
    }

    if suggestions.is_empty() {
        suggestions.push("Inspect the build log for the first error".to_owned());
    }

    suggestions
}
