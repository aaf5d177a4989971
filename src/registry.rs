//! Registry operations: tag validation and sanitization, multi-tag apply,
//! streaming push, local image listing, and retention-based pruning.
//!
//! Tag grammar follows the engine's reference grammar: an optional
//! `host[:port]/` prefix, lowercase repository components, and a 1–128
//! character tag starting with a lowercase alphanumeric.

use std::{sync::LazyLock, time::Duration};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use regex::Regex;
use serde::Deserialize;

use crate::{
    docker::{self, EngineError, NextLine},
    progress::{ProgressEvent, ProgressHandler, Signal, notify},
};

const MAX_TAG_LENGTH: usize = 128;

/// How long to wait for push output before assuming the daemon hung.
const PUSH_LINE_TIMEOUT: Duration = Duration::from_secs(300);

static NAME_COMPONENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[_.-][a-z0-9]+)*$").expect("name component regex is valid")
});

static TAG_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-zA-Z0-9_.-]{0,127}$").expect("tag suffix regex is valid")
});

static REGISTRY_HOST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9.-]+(?::[0-9]+)?$").expect("registry host regex is valid")
});

static PUSH_LAYER_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<layer>[0-9a-f]{6,}): (?P<status>Preparing|Waiting|Pushing|Pushed|Layer already exists|Already exists|Mounted from \S+)",
    )
    .expect("push status regex is valid")
});

static PUSH_BYTES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<current>[0-9.]+)\s*(?P<current_unit>B|kB|KB|MB|GB)/(?P<total>[0-9.]+)\s*(?P<total_unit>B|kB|KB|MB|GB)")
        .expect("push bytes regex is valid")
});

/// A reference string that failed the tag grammar.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid tag `{tag}`: {reason}")]
pub struct TagValidationError {
    pub tag: String,
    pub reason: String,
}

/// Failures of a push operation.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error(transparent)]
    Validation(#[from] TagValidationError),

    #[error("authentication with `{registry}` failed")]
    Authentication {
        registry: String,
        #[source]
        source: EngineError,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("push rejected: {message}")]
    Rejected { message: String },

    #[error("push cancelled by progress callback")]
    Cancelled,

    #[error("no push output for {} seconds", PUSH_LINE_TIMEOUT.as_secs())]
    Stalled,
}

/// Failures of listing or pruning local images.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("unexpected `docker image inspect` output: {reason}")]
    Parse { reason: String },

    #[error("keep count must be zero or positive, got {keep_count}")]
    InvalidKeepCount { keep_count: i64 },
}

/// Validate a full reference `[host[:port]/]name[:tag]`.
///
/// # Errors
///
/// Returns [`TagValidationError`] naming the offending string and the rule
/// it broke.
pub fn validate_tag(reference: &str) -> Result<(), TagValidationError> {
    let invalid = |reason: &str| TagValidationError {
        tag: reference.to_owned(),
        reason: reason.to_owned(),
    };

    if reference.is_empty() {
        return Err(invalid("empty reference"));
    }

    let (repository, tag) = split_tag(reference);

    if let Some(tag) = tag {
        if tag.is_empty() || tag.len() > MAX_TAG_LENGTH {
            return Err(invalid("tag must be 1-128 characters"));
        }
        if !TAG_SUFFIX.is_match(tag) {
            return Err(invalid(
                "tag must start with a lowercase alphanumeric and contain only [a-zA-Z0-9_.-]",
            ));
        }
    }

    let (host, name) = split_host(repository);
    if let Some(host) = host {
        if !REGISTRY_HOST.is_match(host) {
            return Err(invalid("registry host contains invalid characters"));
        }
    }

    if name.is_empty() {
        return Err(invalid("missing repository name"));
    }
    if name.contains(':') {
        return Err(invalid("at most one colon is allowed after the registry prefix"));
    }
    for component in name.split('/') {
        if !NAME_COMPONENT.is_match(component) {
            return Err(invalid(
                "repository components must be lowercase alphanumerics separated by [_.-]",
            ));
        }
    }

    Ok(())
}

/// Split the tag suffix off a reference. A colon inside the registry prefix
/// (a port) is not a tag separator.
fn split_tag(reference: &str) -> (&str, Option<&str>) {
    match reference.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => (repository, Some(tag)),
        _ => (reference, None),
    }
}

/// Split a `host[:port]/` prefix off a repository. The first component is a
/// host when it looks like one: contains a dot or colon, or is `localhost`.
fn split_host(repository: &str) -> (Option<&str>, &str) {
    match repository.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (Some(first), rest)
        }
        _ => (None, repository),
    }
}

/// Make a string usable as a tag component: lowercase, `-` for anything the
/// grammar rejects, collapsed runs, sane boundaries, 128-character cap.
/// An empty result falls back to `latest`. Idempotent.
#[must_use]
pub fn sanitize_tag_component(component: &str) -> String {
    let lowered = component.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        let c = if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            c
        } else {
            '-'
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }

    let trimmed = out.trim_matches(|c| matches!(c, '-' | '.'));
    let mut out = if trimmed
        .chars()
        .next()
        .is_some_and(|c| !c.is_ascii_alphanumeric())
    {
        format!("x{trimmed}")
    } else {
        trimmed.to_owned()
    };

    out.truncate(MAX_TAG_LENGTH);
    let out = out.trim_end_matches(|c| matches!(c, '-' | '.')).to_owned();

    if out.is_empty() { "latest".to_owned() } else { out }
}

/// UTC timestamp tag, `YYYYMMDD-HHMMSS`.
#[must_use]
pub fn timestamp_tag() -> String {
    timestamp_tag_at(Utc::now())
}

fn timestamp_tag_at(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d-%H%M%S").to_string()
}

/// Per-tag failure inside a tag operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFailure {
    pub tag: String,
    pub error: String,
}

/// Result of applying a tag list to an image: atomic from the caller's view
/// in that every input tag lands in exactly one of the two lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagOutcome {
    pub image_id: String,
    pub applied_tags: Vec<String>,
    pub failed_tags: Vec<TagFailure>,
}

/// Apply every tag to the image, in input order.
///
/// All tags are validated first; an invalid tag is recorded as a failure and
/// never reaches the engine. Engine refusals are recorded per tag and do not
/// stop the remaining tags.
#[must_use]
pub fn tag_image(image_id: &str, tags: &[String]) -> TagOutcome {
    let mut outcome = TagOutcome {
        image_id: image_id.to_owned(),
        applied_tags: Vec::new(),
        failed_tags: Vec::new(),
    };

    for tag in tags {
        if let Err(error) = validate_tag(tag) {
            outcome.failed_tags.push(TagFailure {
                tag: tag.clone(),
                error: error.to_string(),
            });
            continue;
        }
        match docker::capture(["tag", image_id, tag.as_str()]) {
            Ok(_) => outcome.applied_tags.push(tag.clone()),
            Err(error) => outcome.failed_tags.push(TagFailure {
                tag: tag.clone(),
                error: error.to_string(),
            }),
        }
    }

    outcome
}

/// Credentials for a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// Look up registry credentials in the process environment by well-known
/// host. Returns `None` when no credential pair is present.
#[must_use]
pub fn auth_from_env(registry_host: &str) -> Option<RegistryAuth> {
    auth_from_lookup(registry_host, |name| std::env::var(name).ok())
}

fn auth_from_lookup(
    registry_host: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<RegistryAuth> {
    let pair = |username_var: &str, password_var: &str| {
        let username = lookup(username_var).filter(|username| !username.is_empty())?;
        let password = lookup(password_var).filter(|password| !password.is_empty())?;
        Some(RegistryAuth { username, password })
    };

    let host = registry_host
        .split(':')
        .next()
        .unwrap_or(registry_host)
        .to_lowercase();

    match host.as_str() {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => {
            pair("DOCKER_USERNAME", "DOCKER_PASSWORD")
                .or_else(|| pair("DOCKERHUB_USERNAME", "DOCKERHUB_TOKEN"))
        }
        "ghcr.io" => pair("GHCR_USERNAME", "GHCR_TOKEN")
            .or_else(|| pair("GITHUB_ACTOR", "GITHUB_TOKEN")),
        host if host == "gcr.io" || host.ends_with(".gcr.io") => lookup("GCLOUD_SERVICE_KEY")
            .filter(|key| !key.is_empty())
            .map(|password| RegistryAuth {
                username: "_json_key".to_owned(),
                password,
            }),
        "quay.io" => pair("QUAY_USERNAME", "QUAY_PASSWORD"),
        _ => pair("REGISTRY_USERNAME", "REGISTRY_PASSWORD"),
    }
}

/// Options for a push.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushOptions {
    pub dry_run: bool,
}

/// Push a tag, streaming per-layer status to the progress handler.
///
/// With `dry_run` the handler sees a synthetic `DRY RUN` status and the
/// engine is never contacted. Authentication uses the explicit `auth` when
/// given, otherwise the environment lookup for the registry host.
///
/// # Errors
///
/// Returns a single typed [`PushError`] per call: validation, auth, engine
/// transport, daemon rejection, cancellation, or a stalled stream.
pub fn push_image(
    tag: &str,
    registry: Option<&str>,
    auth: Option<RegistryAuth>,
    options: PushOptions,
    handler: &mut ProgressHandler<'_>,
) -> Result<(), PushError> {
    validate_tag(tag)?;

    let (host_in_tag, _) = split_host(split_tag(tag).0);
    let reference = match (host_in_tag, registry) {
        (None, Some(registry)) => format!("{registry}/{tag}"),
        _ => tag.to_owned(),
    };
    validate_tag(&reference)?;

    if options.dry_run {
        notify(handler, &ProgressEvent::PushStatus {
            status: format!("DRY RUN: would push {reference}"),
            layer: None,
            percent: None,
        });
        return Ok(());
    }

    let host = split_host(split_tag(&reference).0).0.unwrap_or("docker.io");
    let auth = auth.or_else(|| auth_from_env(host));
    if let Some(RegistryAuth { username, password }) = auth {
        debug!("logging in to {host} as {username}");
        docker::capture_with_stdin(
            ["login", host, "--username", username.as_str(), "--password-stdin"],
            &password,
        )
        .map_err(|source| PushError::Authentication {
            registry: host.to_owned(),
            source,
        })?;
    }

    let mut streamed = docker::stream(["push", reference.as_str()], None)?;
    let mut rejected: Option<String> = None;

    loop {
        match streamed.next_line(PUSH_LINE_TIMEOUT)? {
            NextLine::Line(line) => {
                let event = classify_push_line(&line);
                if let ProgressEvent::Error { message } = &event {
                    rejected.get_or_insert_with(|| message.clone());
                }
                if notify(handler, &event) == Signal::Cancel {
                    streamed.kill();
                    return Err(PushError::Cancelled);
                }
            }
            NextLine::Finished => break,
            NextLine::TimedOut => {
                streamed.kill();
                return Err(PushError::Stalled);
            }
        }
    }

    match streamed.finish() {
        Ok(_) => {
            notify(handler, &ProgressEvent::Complete {
                message: format!("pushed {reference}"),
            });
            Ok(())
        }
        Err(error) => match rejected {
            Some(message) => Err(PushError::Rejected { message }),
            None => Err(error.into()),
        },
    }
}

/// Classify one line of `docker push` output.
#[must_use]
pub fn classify_push_line(line: &str) -> ProgressEvent {
    if let Some(captures) = PUSH_LAYER_STATUS.captures(line) {
        let percent = PUSH_BYTES.captures(line).and_then(|bytes| {
            let current = parse_sized(bytes.name("current")?.as_str(), bytes.name("current_unit")?.as_str())?;
            let total = parse_sized(bytes.name("total")?.as_str(), bytes.name("total_unit")?.as_str())?;
            (total > 0.0).then(|| {
                let percent = current / total * 100.0;
                percent.clamp(0.0, 100.0)
            })
        });
        #[allow(clippy::cast_possible_truncation)]
        return ProgressEvent::PushStatus {
            status: captures.name("status").map_or_else(String::new, |status| {
                status.as_str().to_owned()
            }),
            layer: captures.name("layer").map(|layer| layer.as_str().to_owned()),
            percent: percent.map(|percent| percent as f32),
        };
    }

    let lowered = line.to_lowercase();
    if lowered.contains("denied")
        || lowered.contains("unauthorized")
        || lowered.starts_with("error")
    {
        return ProgressEvent::Error {
            message: line.trim().to_owned(),
        };
    }

    if line.contains("digest: sha256:") {
        return ProgressEvent::Complete {
            message: line.trim().to_owned(),
        };
    }

    ProgressEvent::PushStatus {
        status: line.trim().to_owned(),
        layer: None,
        percent: None,
    }
}

fn parse_sized(value: &str, unit: &str) -> Option<f64> {
    let value: f64 = value.parse().ok()?;
    let multiplier = match unit {
        "B" => 1.0,
        "kB" | "KB" => 1_000.0,
        "MB" => 1_000_000.0,
        "GB" => 1_000_000_000.0,
        _ => return None,
    };
    Some(value * multiplier)
}

/// A locally stored image.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalImage {
    /// Short (12 character) ID without the digest prefix.
    pub id: String,
    pub full_id: String,
    pub tags: Vec<String>,
    pub size: u64,
    pub size_formatted: String,
    pub created: DateTime<Utc>,
    pub created_formatted: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageInspect {
    id: String,
    #[serde(default)]
    repo_tags: Vec<String>,
    #[serde(default)]
    size: u64,
    created: DateTime<Utc>,
}

/// List local images, newest first, optionally keeping only those with a
/// tag starting with `prefix`.
///
/// # Errors
///
/// Returns [`RegistryError`] when the engine cannot be queried or its
/// output cannot be decoded.
pub fn list_local_images(prefix: Option<&str>) -> Result<Vec<LocalImage>, RegistryError> {
    let listing = docker::capture(["images", "--format", "{{.ID}}"])?;
    let mut ids: Vec<&str> = Vec::new();
    for id in listing.lines().map(str::trim).filter(|id| !id.is_empty()) {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut args = vec!["image", "inspect"];
    args.extend(ids.iter().copied());
    let inspected = docker::capture(args)?;

    let parsed: Vec<ImageInspect> =
        serde_json::from_str(&inspected).map_err(|error| RegistryError::Parse {
            reason: error.to_string(),
        })?;

    let mut images: Vec<LocalImage> = parsed
        .into_iter()
        .map(|inspect| {
            let full_id = inspect.id.clone();
            let short = full_id
                .strip_prefix("sha256:")
                .unwrap_or(&full_id)
                .chars()
                .take(12)
                .collect();
            LocalImage {
                id: short,
                full_id,
                tags: inspect.repo_tags,
                size: inspect.size,
                size_formatted: format_size(inspect.size),
                created: inspect.created,
                created_formatted: inspect
                    .created
                    .format("%Y-%m-%d %H:%M:%S UTC")
                    .to_string(),
            }
        })
        .filter(|image| match prefix {
            Some(prefix) => image.tags.iter().any(|tag| tag.starts_with(prefix)),
            None => true,
        })
        .collect();

    images.sort_by(|a, b| b.created.cmp(&a.created));
    Ok(images)
}

/// Result of a retention prune.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneOutcome {
    pub removed: Vec<String>,
    pub kept: Vec<String>,
    pub space_reclaimed: u64,
    pub space_reclaimed_formatted: String,
}

/// Remove all but the newest `keep_count` images of each repository.
///
/// With `keep_count` zero every matching image is removed; a negative count
/// is an error.
///
/// # Errors
///
/// Returns [`RegistryError::InvalidKeepCount`] for negative counts and
/// engine errors from the listing. Individual removal refusals are logged
/// and skipped.
pub fn prune_old_images(
    keep_count: i64,
    prefix: Option<&str>,
) -> Result<PruneOutcome, RegistryError> {
    let keep_count = usize::try_from(keep_count)
        .map_err(|_| RegistryError::InvalidKeepCount { keep_count })?;

    let images = list_local_images(prefix)?;
    let plan = plan_prune(&images, keep_count);

    let mut outcome = PruneOutcome {
        kept: plan.kept,
        ..PruneOutcome::default()
    };

    for image in plan.removed {
        match docker::capture(["rmi", "--force", image.full_id.as_str()]) {
            Ok(_) => {
                outcome.space_reclaimed = outcome.space_reclaimed.saturating_add(image.size);
                outcome.removed.push(image.id);
            }
            Err(error) => warn!("could not remove image {}: {error}", image.id),
        }
    }

    outcome.space_reclaimed_formatted = format_size(outcome.space_reclaimed);
    Ok(outcome)
}

struct PrunePlan {
    removed: Vec<LocalImage>,
    kept: Vec<String>,
}

/// Pure retention planning: group by normalized repository, keep the newest
/// `keep_count` of each group.
fn plan_prune(images: &[LocalImage], keep_count: usize) -> PrunePlan {
    let mut groups: indexmap::IndexMap<String, Vec<&LocalImage>> = indexmap::IndexMap::new();
    for image in images {
        let repository = image
            .tags
            .first()
            .map_or("<none>", |tag| split_tag(tag).0);
        groups
            .entry(sanitize_tag_component(repository))
            .or_default()
            .push(image);
    }

    let mut plan = PrunePlan {
        removed: Vec::new(),
        kept: Vec::new(),
    };
    for (_, mut group) in groups {
        // Input is newest-first already, but do not rely on it.
        group.sort_by(|a, b| b.created.cmp(&a.created));
        for (index, image) in group.into_iter().enumerate() {
            if index < keep_count {
                plan.kept.push(image.id.clone());
            } else {
                plan.removed.push((*image).clone());
            }
        }
    }
    plan
}

/// Human-readable byte size.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    #[allow(clippy::cast_precision_loss)]
    let bytes_f = bytes as f64;
    if bytes < 1_000 {
        format!("{bytes} B")
    } else if bytes < 1_000_000 {
        format!("{:.1} KB", bytes_f / 1_000.0)
    } else if bytes < 1_000_000_000 {
        format!("{:.1} MB", bytes_f / 1_000_000.0)
    } else {
        format!("{:.2} GB", bytes_f / 1_000_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn valid_tags() {
        for tag in [
            "app",
            "app:latest",
            "library/app:1.0.0",
            "docker.io/library/app:1.0.0",
            "localhost:5000/app:dev",
            "ghcr.io/acme/app:sha-abc123",
            "app:1.0.0-beta.1",
        ] {
            assert!(validate_tag(tag).is_ok(), "expected `{tag}` to validate");
        }
    }

    #[test]
    fn invalid_tags() {
        for tag in [
            "",
            "App:latest",
            "app:",
            "app:La test",
            "app::two",
            "app:-starts-wrong",
            "registry.example.com/UPPER/app",
            "app:_underscore-start",
        ] {
            assert!(validate_tag(tag).is_err(), "expected `{tag}` to be rejected");
        }
    }

    #[test]
    fn tag_length_boundary() {
        let body: String = "a".repeat(MAX_TAG_LENGTH);
        assert!(validate_tag(&format!("app:{body}")).is_ok());
        let too_long: String = "a".repeat(MAX_TAG_LENGTH.saturating_add(1));
        assert!(validate_tag(&format!("app:{too_long}")).is_err());
    }

    #[test]
    fn sanitize_rules() {
        assert_eq!(sanitize_tag_component("My App!!"), "my-app");
        assert_eq!(sanitize_tag_component("--weird--"), "weird");
        assert_eq!(sanitize_tag_component("feature/login"), "feature-login");
        assert_eq!(sanitize_tag_component(""), "latest");
        assert_eq!(sanitize_tag_component("...."), "latest");
        assert_eq!(sanitize_tag_component("_private"), "x_private");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for input in ["My App!!", "--weird--", "", "_private", "UPPER.case-Thing"] {
            let once = sanitize_tag_component(input);
            assert_eq!(sanitize_tag_component(&once), once, "input `{input}`");
        }
    }

    #[test]
    fn sanitized_component_validates() {
        for input in ["My App!!", "feature/login", "x", "_private"] {
            let sanitized = sanitize_tag_component(input);
            assert!(
                validate_tag(&format!("repo:{sanitized}")).is_ok(),
                "`{sanitized}` should be a valid tag",
            );
        }
    }

    #[test]
    fn timestamp_tag_shape() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 17, 5, 42).single().expect("valid timestamp");
        assert_eq!(timestamp_tag_at(at), "20240309-170542");
    }

    #[test]
    fn push_line_classification() {
        let event = classify_push_line("5f70bf18a086: Pushing [==>   ]  12.5MB/50MB");
        match event {
            ProgressEvent::PushStatus {
                status,
                layer,
                percent,
            } => {
                assert_eq!(status, "Pushing");
                assert_eq!(layer.as_deref(), Some("5f70bf18a086"));
                let percent = percent.expect("progress bytes present");
                assert!((percent - 25.0).abs() < 0.5, "{percent}");
            }
            other => panic!("unexpected event {other:?}"),
        }

        assert!(matches!(
            classify_push_line("5f70bf18a086: Layer already exists"),
            ProgressEvent::PushStatus { .. },
        ));
        assert!(matches!(
            classify_push_line("denied: requested access to the resource is denied"),
            ProgressEvent::Error { .. },
        ));
        assert!(matches!(
            classify_push_line("latest: digest: sha256:abc size: 528"),
            ProgressEvent::Complete { .. },
        ));
    }

    #[test]
    fn dry_run_never_contacts_the_engine() {
        let mut seen = Vec::new();
        let mut handler = |event: &ProgressEvent| {
            seen.push(event.clone());
            Signal::Continue
        };

        push_image(
            "app:latest",
            Some("docker.io"),
            None,
            PushOptions { dry_run: true },
            &mut handler,
        )
        .expect("dry run succeeds");

        assert!(seen.iter().any(|event| match event {
            ProgressEvent::PushStatus { status, .. } => status.contains("DRY RUN"),
            _ => false,
        }));
    }

    #[test]
    fn push_rejects_invalid_tag_before_any_work() {
        let mut handler = |_: &ProgressEvent| Signal::Continue;
        let result = push_image(
            "Bad Tag",
            None,
            None,
            PushOptions { dry_run: true },
            &mut handler,
        );
        assert!(matches!(result, Err(PushError::Validation(_))));
    }

    #[test]
    fn auth_lookup_by_host() {
        let lookup = |name: &str| match name {
            "DOCKER_USERNAME" => Some("alice".to_owned()),
            "DOCKER_PASSWORD" => Some("hunter2".to_owned()),
            "GITHUB_ACTOR" => Some("bot".to_owned()),
            "GITHUB_TOKEN" => Some("gh-token".to_owned()),
            _ => None,
        };

        let docker = auth_from_lookup("docker.io", lookup).expect("docker hub auth");
        assert_eq!(docker.username, "alice");

        let ghcr = auth_from_lookup("ghcr.io", lookup).expect("ghcr auth");
        assert_eq!(ghcr.username, "bot");
        assert_eq!(ghcr.password, "gh-token");

        assert_eq!(auth_from_lookup("quay.io", lookup), None);
        assert_eq!(auth_from_lookup("registry.example.com", lookup), None);
    }

    fn image(id: &str, tag: &str, age_secs: i64, size: u64) -> LocalImage {
        let created = Utc
            .timestamp_opt(1_700_000_000 - age_secs, 0)
            .single()
            .expect("valid timestamp");
        LocalImage {
            id: id.to_owned(),
            full_id: format!("sha256:{id}"),
            tags: vec![tag.to_owned()],
            size,
            size_formatted: format_size(size),
            created,
            created_formatted: String::new(),
        }
    }

    #[test]
    fn prune_plan_keeps_newest_per_group() {
        let images = [
            image("aaa", "app:3", 0, 100),
            image("bbb", "app:2", 10, 100),
            image("ccc", "app:1", 20, 100),
            image("ddd", "other:1", 5, 100),
        ];

        let plan = plan_prune(&images, 1);
        assert_eq!(plan.kept, ["aaa", "ddd"]);
        let removed: Vec<_> = plan.removed.iter().map(|image| image.id.as_str()).collect();
        assert_eq!(removed, ["bbb", "ccc"]);
    }

    #[test]
    fn prune_plan_with_zero_removes_everything() {
        let images = [image("aaa", "app:1", 0, 100)];
        let plan = plan_prune(&images, 0);
        assert!(plan.kept.is_empty());
        assert_eq!(plan.removed.len(), 1);
    }

    #[test]
    fn negative_keep_count_is_rejected() {
        assert!(matches!(
            prune_old_images(-1, None),
            Err(RegistryError::InvalidKeepCount { keep_count: -1 }),
        ));
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2_048), "2.0 KB");
        assert_eq!(format_size(3_500_000), "3.5 MB");
        assert_eq!(format_size(7_250_000_000), "7.25 GB");
    }
}
