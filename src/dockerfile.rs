//! Dockerfile synthesis and validation.
//!
//! The layout is chosen from the module composition: one builder per source
//! language, or a multi-stage build copying both toolchains' artifacts into
//! a unified runtime when the workspace mixes languages.

use std::{
    fmt::Write as _,
    path::Path,
    sync::LazyLock,
};

use indexmap::IndexMap;
use regex::Regex;
use smart_default::SmartDefault;

use crate::{
    manifest::Manifest,
    module::{Language, Module},
};

const NODE_BASE_IMAGE: &str = "node:20-slim";
const DEFAULT_PYTHON_VERSION: &str = "3.12";

/// npm package providing the embedded runtime loader.
const NODE_RUNTIME_PACKAGE: &str = "@mcpack/runtime";
/// pip package providing the embedded runtime loader.
const PYTHON_RUNTIME_PACKAGE: &str = "mcpack-runtime";

static APT_GET_INSTALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"apt-get\s+(?:-\S+\s+)*install").expect("apt-get install regex is valid")
});

/// Per-language module counts for a workspace.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Composition {
    pub typescript_tools: usize,
    pub typescript_connectors: usize,
    pub python_tools: usize,
    pub python_connectors: usize,
}

impl Composition {
    #[must_use]
    pub fn has_typescript(self) -> bool {
        self.typescript_tools > 0 || self.typescript_connectors > 0
    }

    #[must_use]
    pub fn has_python(self) -> bool {
        self.python_tools > 0 || self.python_connectors > 0
    }

    #[must_use]
    pub fn mode(self) -> Mode {
        match (self.has_typescript(), self.has_python()) {
            (true, true) => Mode::MultiStage,
            (false, true) => Mode::SinglePython,
            // A workspace with no modules still gets a buildable node image.
            _ => Mode::SingleTypeScript,
        }
    }
}

/// Selected Dockerfile layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    SingleTypeScript,
    SinglePython,
    MultiStage,
}

impl Mode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleTypeScript => "single-stage (typescript)",
            Self::SinglePython => "single-stage (python)",
            Self::MultiStage => "multi-stage",
        }
    }
}

/// Count modules per language and kind.
#[must_use]
pub fn analyze(modules: &[Module]) -> Composition {
    let mut composition = Composition::default();
    for module in modules {
        let counter = match (module.language, module.kind) {
            (Language::TypeScript, crate::module::ModuleKind::Tool) => {
                &mut composition.typescript_tools
            }
            (Language::TypeScript, crate::module::ModuleKind::Connector) => {
                &mut composition.typescript_connectors
            }
            (Language::Python, crate::module::ModuleKind::Tool) => &mut composition.python_tools,
            (Language::Python, crate::module::ModuleKind::Connector) => {
                &mut composition.python_connectors
            }
        };
        *counter = counter.saturating_add(1);
    }
    composition
}

/// Knobs for emission.
#[derive(SmartDefault, Debug, Clone, PartialEq, Eq)]
pub struct SynthesisOptions {
    /// Extra `ENV` entries; values are always quoted.
    pub environment_variables: IndexMap<String, String>,

    /// Extra `LABEL` entries on top of the always-present OCI labels.
    pub labels: IndexMap<String, String>,

    /// Emit the health-check block.
    #[default = true]
    pub healthcheck: bool,

    /// Port the server listens on, for `EXPOSE` and the health check.
    #[default = 8080]
    pub port: u16,
}

/// A synthesized build context pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Synthesis {
    pub dockerfile: String,
    pub dockerignore: String,
}

/// Emit the Dockerfile and dockerignore for a manifest and its modules.
#[must_use]
pub fn synthesize(
    manifest: &Manifest,
    config_path: Option<&Path>,
    modules: &[Module],
    options: &SynthesisOptions,
) -> Synthesis {
    let composition = analyze(modules);
    let mode = composition.mode();

    let mut out = String::new();
    let _ = writeln!(out, "# Generated by mcpack {}", env!("CARGO_PKG_VERSION"));
    let _ = writeln!(out, "# mode: {}", mode.as_str());
    out.push('\n');

    match mode {
        Mode::SingleTypeScript => single_typescript(&mut out, modules),
        Mode::SinglePython => single_python(&mut out, modules),
        Mode::MultiStage => multi_stage(&mut out, modules),
    }

    common_tail(&mut out, manifest, config_path, options, mode);

    Synthesis {
        dockerfile: out,
        dockerignore: dockerignore(),
    }
}

fn single_typescript(out: &mut String, modules: &[Module]) {
    let _ = writeln!(out, "FROM {NODE_BASE_IMAGE}");
    let _ = writeln!(out, "WORKDIR /app");
    let _ = writeln!(out, "RUN mkdir -p tools connectors config");
    install_npm(out, modules);
}

fn single_python(out: &mut String, modules: &[Module]) {
    let _ = writeln!(out, "FROM {}", python_base_image(modules));
    let _ = writeln!(out, "WORKDIR /app");
    let _ = writeln!(out, "RUN mkdir -p tools connectors config");
    install_pip(out, modules, None);
}

fn multi_stage(out: &mut String, modules: &[Module]) {
    let _ = writeln!(out, "FROM {NODE_BASE_IMAGE} AS typescript-builder");
    let _ = writeln!(out, "WORKDIR /build");
    install_npm(out, modules);
    out.push('\n');

    let _ = writeln!(out, "FROM {} AS python-builder", python_base_image(modules));
    let _ = writeln!(out, "WORKDIR /build");
    install_pip(out, modules, Some("/build/site-packages"));
    out.push('\n');

    let _ = writeln!(out, "FROM {NODE_BASE_IMAGE}");
    let _ = writeln!(out, "WORKDIR /app");
    let _ = writeln!(
        out,
        "RUN apt-get update \\\n    && apt-get install -y --no-install-recommends python3 \\\n    && rm -rf /var/lib/apt/lists/*",
    );
    let _ = writeln!(out, "RUN mkdir -p tools connectors config");
    let _ = writeln!(
        out,
        "COPY --from=typescript-builder /build/node_modules ./node_modules",
    );
    let _ = writeln!(
        out,
        "COPY --from=python-builder /build/site-packages ./site-packages",
    );
    let _ = writeln!(out, "ENV PYTHONPATH=\"/app/site-packages\"");
}

fn install_npm(out: &mut String, modules: &[Module]) {
    let mut packages = vec![NODE_RUNTIME_PACKAGE.to_owned()];
    packages.extend(language_dependencies(modules, Language::TypeScript));
    let _ = writeln!(
        out,
        "RUN npm install --omit=dev {}",
        packages
            .iter()
            .map(|package| quoted(package))
            .collect::<Vec<_>>()
            .join(" "),
    );
}

fn install_pip(out: &mut String, modules: &[Module], target: Option<&str>) {
    let mut packages = vec![PYTHON_RUNTIME_PACKAGE.to_owned()];
    packages.extend(language_dependencies(modules, Language::Python));
    let target = target.map(|dir| format!("--target {dir} ")).unwrap_or_default();
    let _ = writeln!(
        out,
        "RUN pip install --no-cache-dir {target}{}",
        packages
            .iter()
            .map(|package| quoted(package))
            .collect::<Vec<_>>()
            .join(" "),
    );
}

/// Resolved `package@range` / `packagerange` specifiers contributed by
/// modules of one language, deduplicated in first-seen order.
fn language_dependencies(modules: &[Module], language: Language) -> Vec<String> {
    let mut specifiers = Vec::new();
    for module in modules.iter().filter(|module| module.language == language) {
        for (package, range) in &module.common().dependencies {
            let specifier = match (language, range.is_empty()) {
                (_, true) => package.clone(),
                (Language::TypeScript, false) => format!("{package}@{range}"),
                (Language::Python, false) => format!("{package}{range}"),
            };
            if !specifiers.contains(&specifier) {
                specifiers.push(specifier);
            }
        }
    }
    specifiers
}

fn common_tail(
    out: &mut String,
    manifest: &Manifest,
    config_path: Option<&Path>,
    options: &SynthesisOptions,
    mode: Mode,
) {
    out.push('\n');
    let _ = writeln!(out, "COPY manifest.json ./manifest.json");
    if let Some(config_path) = config_path {
        if let Some(name) = config_path.file_name().and_then(|name| name.to_str()) {
            let _ = writeln!(out, "COPY {name} ./config/{name}");
        }
    }
    let _ = writeln!(out, "COPY tools/ ./tools/");
    let _ = writeln!(out, "COPY connectors/ ./connectors/");
    out.push('\n');

    for (key, value) in &options.environment_variables {
        let _ = writeln!(out, "ENV {key}={}", quoted(value));
    }

    let tool_names = manifest
        .tools
        .iter()
        .map(|tool| tool.name.as_str())
        .collect::<Vec<_>>()
        .join(",");
    let _ = writeln!(
        out,
        "LABEL org.opencontainers.image.title={}",
        quoted(&manifest.name),
    );
    let _ = writeln!(
        out,
        "LABEL org.opencontainers.image.version={}",
        quoted(&manifest.version),
    );
    let _ = writeln!(
        out,
        "LABEL org.opencontainers.image.created={}",
        quoted(&manifest.metadata.generated_at),
    );
    let _ = writeln!(out, "LABEL mcp.server.tools={}", quoted(&tool_names));
    for (key, value) in &options.labels {
        let _ = writeln!(out, "LABEL {key}={}", quoted(value));
    }
    out.push('\n');

    let port = options.port;
    let _ = writeln!(out, "EXPOSE {port}");
    if options.healthcheck {
        let probe = match mode {
            Mode::SinglePython => format!(
                "python3 -c \"import urllib.request, sys; sys.exit(0 if urllib.request.urlopen('http://127.0.0.1:{port}/health').status == 200 else 1)\"",
            ),
            Mode::SingleTypeScript | Mode::MultiStage => format!(
                "node -e \"fetch('http://127.0.0.1:{port}/health').then(r => process.exit(r.ok ? 0 : 1)).catch(() => process.exit(1))\"",
            ),
        };
        let _ = writeln!(
            out,
            "HEALTHCHECK --interval=30s --timeout=5s --start-period=10s CMD {probe}",
        );
    }

    let entrypoint = match mode {
        Mode::SinglePython => "ENTRYPOINT [\"python3\", \"-m\", \"mcpack_runtime\"]",
        Mode::SingleTypeScript | Mode::MultiStage => {
            "ENTRYPOINT [\"npx\", \"--no-install\", \"@mcpack/runtime\"]"
        }
    };
    let _ = writeln!(out, "{entrypoint}");
}

fn python_base_image(modules: &[Module]) -> String {
    let version = modules
        .iter()
        .filter_map(|module| module.python_version.as_deref())
        .max_by_key(|version| version_key(version))
        .unwrap_or(DEFAULT_PYTHON_VERSION);
    format!("python:{version}-slim")
}

/// Numeric ordering for `major.minor` interpreter versions, so `3.11`
/// outranks `3.9`.
fn version_key(version: &str) -> (u32, u32) {
    let mut parts = version.split('.');
    let mut next = || {
        parts
            .next()
            .and_then(|part| part.trim().parse().ok())
            .unwrap_or(0)
    };
    (next(), next())
}

/// Always-quote a value for `ENV`/`LABEL`/`RUN` usage.
fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Validation findings for an emitted (or hand-edited) Dockerfile.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DockerfileReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl DockerfileReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check a Dockerfile for the emission invariants.
#[must_use]
pub fn validate(dockerfile: &str) -> DockerfileReport {
    let mut report = DockerfileReport::default();

    let mut has_from = false;
    let mut has_entrypoint = false;

    for line in dockerfile.lines() {
        let line = line.trim_start();
        if line.starts_with("FROM ") {
            has_from = true;
        }
        if line.starts_with("ENTRYPOINT ") || line.starts_with("CMD ") {
            has_entrypoint = true;
        }
        if APT_GET_INSTALL.is_match(line)
            && !line.contains("-y")
            && !line.contains("--yes")
        {
            report.warnings.push(format!(
                "package install without non-interactive flag: `{}`",
                line.trim(),
            ));
        }
    }

    if !has_from {
        report
            .errors
            .push("no base image directive (FROM) found".to_owned());
    }
    if !has_entrypoint {
        report
            .errors
            .push("no ENTRYPOINT or CMD directive found".to_owned());
    }

    report
}

/// Canonical build-context exclusions, including the Dockerfile itself.
#[must_use]
pub fn dockerignore() -> String {
    [
        "# VCS",
        ".git",
        ".gitignore",
        ".hg",
        ".svn",
        "",
        "# build outputs",
        "dist",
        "build",
        "target",
        "*.tsbuildinfo",
        "build.log",
        "",
        "# editors",
        ".idea",
        ".vscode",
        "*.swp",
        ".DS_Store",
        "",
        "# language caches",
        "node_modules",
        "__pycache__",
        "*.pyc",
        ".venv",
        "venv",
        ".cache",
        "",
        "# tests and docs",
        "*.test.ts",
        "*.spec.ts",
        "test_*.py",
        "*_test.py",
        "tests/",
        "docs/",
        "*.md",
        "",
        "# build inputs that never belong in the image",
        ".env",
        "Dockerfile",
        ".dockerignore",
        "",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::DateTime;

    use super::*;
    use crate::{
        manifest::synthesize_at,
        module::{CommonMetadata, Metadata, ModuleKind, ToolMetadata},
    };

    fn module(name: &str, language: Language, kind: ModuleKind) -> Module {
        Module {
            name: name.to_owned(),
            path: PathBuf::from(format!("{}/{name}", if kind == ModuleKind::Tool { "tools" } else { "connectors" })),
            kind,
            language,
            metadata: Metadata::Tool(ToolMetadata {
                common: CommonMetadata {
                    name: Some(name.to_owned()),
                    description: Some("a module".to_owned()),
                    version: Some("1.0.0".to_owned()),
                    ..CommonMetadata::default()
                },
            }),
            annotated_credentials: Vec::new(),
            python_version: None,
        }
    }

    fn synthesis(modules: &[Module]) -> Synthesis {
        let manifest = synthesize_at(modules, "bundle", "1.0.0", DateTime::UNIX_EPOCH);
        synthesize(&manifest, None, modules, &SynthesisOptions::default())
    }

    #[test]
    fn typescript_only_is_single_stage() {
        let modules = [module("a", Language::TypeScript, ModuleKind::Tool)];
        let Synthesis { dockerfile, .. } = synthesis(&modules);
        assert!(dockerfile.contains("# mode: single-stage (typescript)"));
        assert!(dockerfile.contains("FROM node:20-slim"));
        assert!(!dockerfile.contains("AS typescript-builder"));
        assert!(validate(&dockerfile).is_valid());
    }

    #[test]
    fn python_only_is_single_stage() {
        let modules = [module("a", Language::Python, ModuleKind::Tool)];
        let Synthesis { dockerfile, .. } = synthesis(&modules);
        assert!(dockerfile.contains("FROM python:3.12-slim"));
        assert!(dockerfile.contains("ENTRYPOINT [\"python3\", \"-m\", \"mcpack_runtime\"]"));
        assert!(validate(&dockerfile).is_valid());
    }

    #[test]
    fn mixed_workspace_is_multi_stage() {
        let modules = [
            module("a", Language::TypeScript, ModuleKind::Tool),
            module("b", Language::Python, ModuleKind::Connector),
        ];
        let Synthesis { dockerfile, .. } = synthesis(&modules);
        assert!(dockerfile.contains("# mode: multi-stage"));
        assert!(dockerfile.contains("FROM node:20-slim AS typescript-builder"));
        assert!(dockerfile.contains("AS python-builder"));
        // Two builders plus the runtime stage.
        assert_eq!(dockerfile.matches("FROM ").count(), 3);
        assert!(validate(&dockerfile).is_valid());
    }

    #[test]
    fn declared_python_version_selects_the_base() {
        let mut python_module = module("a", Language::Python, ModuleKind::Tool);
        python_module.python_version = Some("3.11".to_owned());
        let Synthesis { dockerfile, .. } = synthesis(&[python_module]);
        assert!(dockerfile.contains("FROM python:3.11-slim"));
    }

    #[test]
    fn env_values_are_always_quoted() {
        let modules = [module("a", Language::TypeScript, ModuleKind::Tool)];
        let manifest = synthesize_at(&modules, "bundle", "1.0.0", DateTime::UNIX_EPOCH);
        let mut options = SynthesisOptions::default();
        options
            .environment_variables
            .insert("GREETING".to_owned(), "hello \"world\"".to_owned());

        let Synthesis { dockerfile, .. } =
            synthesize(&manifest, None, &modules, &options);
        assert!(dockerfile.contains(r#"ENV GREETING="hello \"world\"""#));
    }

    #[test]
    fn tool_label_lists_tool_names() {
        let modules = [
            module("alpha", Language::TypeScript, ModuleKind::Tool),
            module("beta", Language::TypeScript, ModuleKind::Tool),
        ];
        let Synthesis { dockerfile, .. } = synthesis(&modules);
        assert!(dockerfile.contains("LABEL mcp.server.tools=\"alpha,beta\""));
        assert!(dockerfile.contains("LABEL org.opencontainers.image.title=\"bundle\""));
    }

    #[test]
    fn healthcheck_can_be_disabled() {
        let modules = [module("a", Language::TypeScript, ModuleKind::Tool)];
        let manifest = synthesize_at(&modules, "bundle", "1.0.0", DateTime::UNIX_EPOCH);
        let options = SynthesisOptions {
            healthcheck: false,
            ..SynthesisOptions::default()
        };
        let Synthesis { dockerfile, .. } =
            synthesize(&manifest, None, &modules, &options);
        assert!(!dockerfile.contains("HEALTHCHECK"));
    }

    #[test]
    fn config_file_is_copied_when_provided() {
        let modules = [module("a", Language::TypeScript, ModuleKind::Tool)];
        let manifest = synthesize_at(&modules, "bundle", "1.0.0", DateTime::UNIX_EPOCH);
        let Synthesis { dockerfile, .. } = synthesize(
            &manifest,
            Some(Path::new("/workspace/config.yaml")),
            &modules,
            &SynthesisOptions::default(),
        );
        assert!(dockerfile.contains("COPY config.yaml ./config/config.yaml"));
    }

    #[test]
    fn validation_requires_base_image_and_entrypoint() {
        let report = validate("WORKDIR /app\n");
        assert!(!report.is_valid());
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn interactive_apt_get_is_a_warning() {
        let report = validate(
            "FROM debian:stable\nRUN apt-get update && apt-get install curl\nCMD [\"true\"]\n",
        );
        assert!(report.is_valid());
        assert_eq!(report.warnings.len(), 1);
        // The emitted multi-stage form passes the same check.
        let report = validate(
            "FROM debian:stable\nRUN apt-get install -y --no-install-recommends python3\nCMD [\"x\"]\n",
        );
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn dockerignore_excludes_the_dockerfile_itself() {
        let ignore = dockerignore();
        assert!(ignore.lines().any(|line| line == "Dockerfile"));
        assert!(ignore.lines().any(|line| line == "node_modules"));
        assert!(ignore.lines().any(|line| line == "__pycache__"));
    }
}
