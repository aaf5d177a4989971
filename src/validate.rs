//! Cross-module validation.
//!
//! Pure: takes the loaded modules, returns an accumulated [`Report`].
//! Modules are traversed in input order and never mutated.

use std::{collections::HashMap, fmt::Write as _, path::PathBuf, sync::LazyLock};

use regex::Regex;

use crate::module::{ConnectorType, Metadata, Module};

/// Metadata schema versions this toolchain understands.
pub const SUPPORTED_SCHEMA_VERSIONS: &[&str] = &["1.0"];

/// Package names: optionally scoped, starting alphanumeric, with `-`, `_`,
/// and `.` allowed inside components.
static PACKAGE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(@[a-z0-9][a-z0-9._-]*/)?[A-Za-z0-9_][A-Za-z0-9._-]*$")
        .expect("package name regex is valid")
});

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub module_path: PathBuf,
    pub field: String,
    pub message: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// Accumulated findings for a module set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Report {
    pub diagnostics: Vec<Diagnostic>,
}

impl Report {
    /// A set is valid when nothing reached error severity.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self
            .diagnostics
            .iter()
            .any(|diagnostic| diagnostic.severity == Severity::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|diagnostic| diagnostic.severity == Severity::Warning)
    }

    fn error(&mut self, module: &Module, field: &str, message: String) {
        self.diagnostics.push(Diagnostic {
            module_path: module.path.clone(),
            field: field.to_owned(),
            message,
            severity: Severity::Error,
        });
    }

    fn warning(&mut self, module: &Module, field: &str, message: String) {
        self.diagnostics.push(Diagnostic {
            module_path: module.path.clone(),
            field: field.to_owned(),
            message,
            severity: Severity::Warning,
        });
    }
}

/// Validate a loaded module set.
#[must_use]
pub fn validate(modules: &[Module]) -> Report {
    let mut report = Report::default();

    // Lowercased name -> path of the first occurrence.
    let mut seen_names: HashMap<String, &PathBuf> = HashMap::new();

    for module in modules {
        required_fields(module, &mut report);
        version_format(module, &mut report);
        connector_type(module, &mut report);
        schema_version(module, &mut report);
        dependencies(module, &mut report);
        capabilities(module, &mut report);

        match seen_names.entry(module.name.to_lowercase()) {
            std::collections::hash_map::Entry::Occupied(first) => {
                report.error(
                    module,
                    "name",
                    format!(
                        "Duplicate module name `{}`: first declared in {}, declared again in {}",
                        module.name,
                        first.get().display(),
                        module.path.display(),
                    ),
                );
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(&module.path);
            }
        }
    }

    report
}

fn required_fields(module: &Module, report: &mut Report) {
    let common = module.common();
    for (field, value) in [
        ("name", &common.name),
        ("description", &common.description),
        ("version", &common.version),
    ] {
        if value.as_deref().is_none_or(str::is_empty) {
            report.error(module, field, format!("missing required field `{field}`"));
        }
    }

    if let Metadata::Connector(connector) = &module.metadata {
        if connector
            .connector_type
            .as_deref()
            .is_none_or(str::is_empty)
        {
            report.error(module, "type", "missing required field `type`".to_owned());
        }
    }
}

fn version_format(module: &Module, report: &mut Report) {
    let Some(version) = module.common().version.as_deref() else {
        return;
    };
    if version.is_empty() {
        return;
    }
    if let Err(error) = semver::Version::parse(version) {
        report.error(
            module,
            "version",
            format!("`{version}` is not a semantic version: {error}"),
        );
    }
}

fn connector_type(module: &Module, report: &mut Report) {
    let Metadata::Connector(connector) = &module.metadata else {
        return;
    };
    let Some(declared) = connector.connector_type.as_deref() else {
        return;
    };
    if declared.is_empty() {
        return;
    }
    if declared.parse::<ConnectorType>().is_err() {
        let mut accepted = String::new();
        for connector_type in ConnectorType::ALL {
            if !accepted.is_empty() {
                accepted.push_str(", ");
            }
            let _ = write!(accepted, "{connector_type}");
        }
        report.error(
            module,
            "type",
            format!("unknown connector type `{declared}`; expected one of: {accepted}"),
        );
    }
}

fn schema_version(module: &Module, report: &mut Report) {
    match module.common().schema_version.as_deref() {
        None => report.warning(
            module,
            "schemaVersion",
            "no schema version declared; assuming 1.0".to_owned(),
        ),
        Some(version) if SUPPORTED_SCHEMA_VERSIONS.contains(&version) => {}
        Some(version) => report.error(
            module,
            "schemaVersion",
            format!(
                "unsupported schema version `{version}`; supported: {}",
                SUPPORTED_SCHEMA_VERSIONS.join(", "),
            ),
        ),
    }
}

/// Dependency declarations are advisory until manifest synthesis, so shape
/// problems are warnings rather than errors.
fn dependencies(module: &Module, report: &mut Report) {
    for (package, range) in &module.common().dependencies {
        if !PACKAGE_NAME.is_match(package) {
            report.warning(
                module,
                "dependencies",
                format!("`{package}` is not a valid package name"),
            );
        }
        if !range_is_well_formed(range) {
            report.warning(
                module,
                "dependencies",
                format!("`{package}` has an unparseable version range `{range}`"),
            );
        }
    }
}

/// Whether a declared range parses. Empty ranges and `*` mean "any", and
/// Python-style `==`/`~=` spellings are normalized before parsing.
#[must_use]
pub fn range_is_well_formed(range: &str) -> bool {
    let range = range.trim();
    if range.is_empty() || range == "*" || range == "latest" {
        return true;
    }
    let normalized = range.replace("~=", "~").replace("==", "=");
    semver::VersionReq::parse(&normalized).is_ok()
}

fn capabilities(module: &Module, report: &mut Report) {
    let Some(capabilities) = &module.common().capabilities else {
        return;
    };
    if capabilities.iter().any(String::is_empty) {
        report.error(
            module,
            "capabilities",
            "capabilities must be non-empty strings".to_owned(),
        );
    }
}
