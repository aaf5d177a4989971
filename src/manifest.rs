//! Manifest synthesis: folds validated modules into the single canonical
//! record embedded in the image.
//!
//! Dependency reconciliation deliberately picks the head of a preference
//! ordering rather than computing a semver intersection; the behavior is
//! part of the output contract and changing it would alter image contents.

use std::{cmp::Reverse, fs, path::Path, sync::LazyLock};

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::module::{Metadata, Module};

/// Probe version for ordering open-ended ranges. Every range satisfied by
/// it sorts at the top of its class, so all open-ended ranges tie there.
static SENTINEL: LazyLock<Version> =
    LazyLock::new(|| Version::new(999, 999, 999));

/// The merged, canonical record of all modules in a build.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub name: String,
    pub version: String,
    pub tools: Vec<ToolEntry>,
    pub connectors: Vec<ConnectorEntry>,

    /// Sorted union of declared capabilities plus the implicit
    /// `<type>-integration` capability of each connector.
    pub capabilities: Vec<String>,

    /// One resolved version range per package, lexicographically ordered.
    pub dependencies: IndexMap<String, String>,

    pub metadata: ManifestInfo,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolEntry {
    pub name: String,
    pub description: String,
    pub version: String,
    pub language: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorEntry {
    pub name: String,
    pub description: String,
    pub version: String,
    pub language: String,
    pub path: String,
    #[serde(rename = "type")]
    pub connector_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestInfo {
    pub generated_at: String,
    pub generator_version: String,
    pub module_count: usize,
}

/// Synthesize the manifest for a module set.
///
/// The top-level name and version come from the workspace's `package.json`
/// when one exists; everything else is derived from the modules. This reads
/// nothing else.
#[must_use]
pub fn synthesize(modules: &[Module], workspace_root: &Path) -> Manifest {
    let (name, version) = workspace_identity(workspace_root);
    synthesize_at(modules, &name, &version, Utc::now())
}

/// Pure synthesis core with every input explicit.
#[must_use]
pub fn synthesize_at(
    modules: &[Module],
    name: &str,
    version: &str,
    generated_at: DateTime<Utc>,
) -> Manifest {
    let mut tools = Vec::new();
    let mut connectors = Vec::new();
    let mut capabilities = Vec::new();

    for module in modules {
        let common = module.common();
        if let Some(declared) = &common.capabilities {
            capabilities.extend(declared.iter().cloned());
        }

        let description = common.description.clone().unwrap_or_default();
        let module_version = common.version.clone().unwrap_or_default();
        let path = module.path.display().to_string();

        match &module.metadata {
            Metadata::Tool(_) => tools.push(ToolEntry {
                name: module.name.clone(),
                description,
                version: module_version,
                language: module.language.to_string(),
                path,
                input_schema: common.input_schema.clone(),
            }),
            Metadata::Connector(connector) => {
                let connector_type = connector.connector_type.clone().unwrap_or_default();
                if !connector_type.is_empty() {
                    capabilities.push(format!("{connector_type}-integration"));
                }
                connectors.push(ConnectorEntry {
                    name: module.name.clone(),
                    description,
                    version: module_version,
                    language: module.language.to_string(),
                    path,
                    connector_type,
                    methods: connector.methods.clone(),
                });
            }
        }
    }

    capabilities.sort();
    capabilities.dedup();

    Manifest {
        name: name.to_owned(),
        version: version.to_owned(),
        tools,
        connectors,
        capabilities,
        dependencies: resolve_dependencies(modules),
        metadata: ManifestInfo {
            generated_at: generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            generator_version: env!("CARGO_PKG_VERSION").to_owned(),
            module_count: modules.len(),
        },
    }
}

/// Pick one range per package across all module declarations.
///
/// A single declaration is used verbatim (empty means any). With multiple
/// declarations, exact pins sort before ranges; within a class, ranges are
/// keyed by the highest version that could satisfy them, and the first-seen
/// declaration wins ties. No intersection is computed.
#[must_use]
pub fn resolve_dependencies(modules: &[Module]) -> IndexMap<String, String> {
    let mut declared: IndexMap<String, Vec<String>> = IndexMap::new();
    for module in modules {
        for (package, range) in &module.common().dependencies {
            declared
                .entry(package.clone())
                .or_default()
                .push(range.clone());
        }
    }

    let mut resolved: Vec<(String, String)> = declared
        .into_iter()
        .map(|(package, mut ranges)| {
            ranges.sort_by_cached_key(|range| {
                let (class, key) = preference(range);
                (class, Reverse(key))
            });
            let head = ranges.into_iter().next().unwrap_or_default();
            (package, normalize_range(head))
        })
        .collect();

    resolved.sort_by(|(a, _), (b, _)| a.cmp(b));
    resolved.into_iter().collect()
}

/// Preference ordering for a declared range: class 0 is an exact pin keyed
/// by the pinned version, class 1 a parseable range keyed by the sentinel
/// when it satisfies it and the lower bound otherwise, class 2 anything
/// unparseable.
fn preference(range: &str) -> (u8, Version) {
    let range = range.trim();
    if range.is_empty() || range == "*" || range == "latest" {
        return (1, SENTINEL.clone());
    }

    let bare = range.strip_prefix('=').unwrap_or(range);
    let bare = bare.strip_prefix('v').unwrap_or(bare);
    if let Ok(version) = Version::parse(bare.trim()) {
        return (0, version);
    }

    let normalized = range.replace("~=", "~").replace("==", "=");
    if let Ok(req) = VersionReq::parse(&normalized) {
        if req.matches(&SENTINEL) {
            return (1, SENTINEL.clone());
        }
        return (1, lower_bound(&req));
    }

    (2, Version::new(0, 0, 0))
}

fn lower_bound(req: &VersionReq) -> Version {
    req.comparators
        .first()
        .map(|comparator| {
            Version::new(
                comparator.major,
                comparator.minor.unwrap_or(0),
                comparator.patch.unwrap_or(0),
            )
        })
        .unwrap_or_else(|| Version::new(0, 0, 0))
}

fn normalize_range(range: String) -> String {
    if range.trim().is_empty() {
        "*".to_owned()
    } else {
        range
    }
}

/// Problems that make a synthesized manifest unusable.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManifestReport {
    pub errors: Vec<String>,
}

impl ManifestReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check a manifest before it is written for the image build.
#[must_use]
pub fn validate_manifest(manifest: &Manifest) -> ManifestReport {
    let mut errors = Vec::new();

    if manifest.name.is_empty() {
        errors.push("manifest has no name".to_owned());
    }
    if manifest.version.is_empty() {
        errors.push("manifest has no version".to_owned());
    }
    if manifest.tools.is_empty() && manifest.connectors.is_empty() {
        errors.push("manifest contains no tools or connectors".to_owned());
    }
    for (package, range) in &manifest.dependencies {
        if range.is_empty() {
            errors.push(format!("dependency `{package}` has no resolved range"));
        }
    }

    ManifestReport { errors }
}

/// Name and version from the workspace `package.json`, with defaults when
/// absent or unreadable.
fn workspace_identity(workspace_root: &Path) -> (String, String) {
    #[derive(Deserialize)]
    struct PackageJson {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        version: Option<String>,
    }

    let parsed: Option<PackageJson> = fs::read_to_string(workspace_root.join("package.json"))
        .ok()
        .and_then(|contents| serde_json::from_str(&contents).ok());

    match parsed {
        Some(package) => (
            package.name.unwrap_or_else(|| "mcp-server".to_owned()),
            package.version.unwrap_or_else(|| "1.0.0".to_owned()),
        ),
        None => ("mcp-server".to_owned(), "1.0.0".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::module::{
        CommonMetadata, ConnectorMetadata, Language, ModuleKind, ToolMetadata,
    };

    fn tool_with_deps(name: &str, dependencies: &[(&str, &str)]) -> Module {
        Module {
            name: name.to_owned(),
            path: Path::new("tools").join(name).with_extension("ts"),
            kind: ModuleKind::Tool,
            language: Language::TypeScript,
            metadata: Metadata::Tool(ToolMetadata {
                common: CommonMetadata {
                    name: Some(name.to_owned()),
                    description: Some("a tool".to_owned()),
                    version: Some("1.0.0".to_owned()),
                    dependencies: dependencies
                        .iter()
                        .map(|&(package, range)| (package.to_owned(), range.to_owned()))
                        .collect(),
                    ..CommonMetadata::default()
                },
            }),
            annotated_credentials: Vec::new(),
            python_version: None,
        }
    }

    fn connector(name: &str, connector_type: &str, capabilities: &[&str]) -> Module {
        Module {
            name: name.to_owned(),
            path: Path::new("connectors").join(name).with_extension("py"),
            kind: ModuleKind::Connector,
            language: Language::Python,
            metadata: Metadata::Connector(ConnectorMetadata {
                common: CommonMetadata {
                    name: Some(name.to_owned()),
                    description: Some("a connector".to_owned()),
                    version: Some("1.0.0".to_owned()),
                    capabilities: Some(
                        capabilities.iter().map(|&c| c.to_owned()).collect(),
                    ),
                    ..CommonMetadata::default()
                },
                connector_type: Some(connector_type.to_owned()),
                authentication: None,
                methods: None,
            }),
            annotated_credentials: Vec::new(),
            python_version: None,
        }
    }

    fn at_epoch(modules: &[Module]) -> Manifest {
        synthesize_at(modules, "bundle", "2.0.0", DateTime::UNIX_EPOCH)
    }

    #[test]
    fn higher_caret_range_wins() {
        let modules = [
            tool_with_deps("a", &[("express", "^4.17.0")]),
            tool_with_deps("b", &[("express", "^4.18.0")]),
        ];
        let manifest = at_epoch(&modules);
        assert_eq!(
            manifest.dependencies.get("express").map(String::as_str),
            Some("^4.18.0"),
        );
    }

    #[test]
    fn exact_pin_beats_any_range() {
        let modules = [
            tool_with_deps("a", &[("lodash", "^4.17.21")]),
            tool_with_deps("b", &[("lodash", "4.17.10")]),
        ];
        let manifest = at_epoch(&modules);
        assert_eq!(
            manifest.dependencies.get("lodash").map(String::as_str),
            Some("4.17.10"),
        );
    }

    #[test]
    fn open_ended_ranges_tie_at_the_sentinel() {
        // Both ranges admit the probe version; the first declaration wins.
        let modules = [
            tool_with_deps("a", &[("minimist", ">=1")]),
            tool_with_deps("b", &[("minimist", ">=1.2")]),
        ];
        let manifest = at_epoch(&modules);
        assert_eq!(
            manifest.dependencies.get("minimist").map(String::as_str),
            Some(">=1"),
        );
    }

    #[test]
    fn single_empty_declaration_becomes_any() {
        let manifest = at_epoch(&[tool_with_deps("a", &[("requests", "")])]);
        assert_eq!(
            manifest.dependencies.get("requests").map(String::as_str),
            Some("*"),
        );
    }

    #[test]
    fn one_resolved_range_per_package() {
        let modules = [
            tool_with_deps("a", &[("express", "^4.17.0"), ("zlib", "1.0.0")]),
            tool_with_deps("b", &[("express", "^4.18.0"), ("axios", "^1.0.0")]),
        ];
        let manifest = at_epoch(&modules);
        assert_eq!(manifest.dependencies.len(), 3);
        // Lexicographic output order.
        let packages: Vec<_> = manifest.dependencies.keys().cloned().collect();
        assert_eq!(packages, ["axios", "express", "zlib"]);
    }

    #[test]
    fn connector_capability_is_implicit_and_sorted() {
        let modules = [connector("pg", "database", &["sql-query"])];
        let manifest = at_epoch(&modules);
        assert_eq!(manifest.capabilities, ["database-integration", "sql-query"]);
    }

    #[test]
    fn entries_keep_module_input_order() {
        let modules = [
            tool_with_deps("zeta", &[]),
            tool_with_deps("alpha", &[]),
            connector("pg", "database", &[]),
        ];
        let manifest = at_epoch(&modules);
        let tool_names: Vec<_> = manifest
            .tools
            .iter()
            .map(|tool| tool.name.as_str())
            .collect();
        assert_eq!(tool_names, ["zeta", "alpha"]);
        assert_eq!(manifest.metadata.module_count, 3);
    }

    #[test]
    fn synthesized_manifest_validates() {
        let manifest = at_epoch(&[tool_with_deps("a", &[("express", "^4.18.0")])]);
        assert!(validate_manifest(&manifest).is_valid());
    }

    #[test]
    fn empty_module_set_synthesizes_but_fails_validation() {
        let manifest = at_epoch(&[]);
        let report = validate_manifest(&manifest);
        assert!(!report.is_valid());
        assert!(
            report
                .errors
                .iter()
                .any(|error| error.contains("no tools or connectors")),
        );
    }

    #[test]
    fn manifest_serializes_camel_case() {
        let manifest = at_epoch(&[tool_with_deps("a", &[])]);
        let json = serde_json::to_value(&manifest).expect("manifest serializes");
        assert!(json["metadata"]["generatedAt"].is_string());
        assert!(json["metadata"]["generatorVersion"].is_string());
        assert_eq!(json["metadata"]["moduleCount"], 1);
    }
}
