//! Workspace discovery: walks the module subtrees, classifies files, and
//! extracts declarative metadata per source convention.
//!
//! Classification is by subtree, not by content: everything under `tools/`
//! is a tool, everything under `connectors/` is a connector. Extraction
//! failures degrade to warnings; a load never aborts.

mod python;
mod typescript;

use std::{
    fmt::{self, Display, Formatter},
    fs,
    path::{Path, PathBuf},
};

use log::debug;
use path_clean::PathClean;
use walkdir::WalkDir;

use crate::module::{
    CommonMetadata, ConnectorMetadata, Language, Metadata, Module, ModuleKind, ToolMetadata,
};

/// Discovers and loads modules from a workspace.
#[derive(Debug, Clone)]
pub struct Loader {
    root: PathBuf,
    tools_dir: PathBuf,
    connectors_dir: PathBuf,
    extra_roots: Vec<(PathBuf, ModuleKind)>,
}

/// The result of a workspace load: modules in stable walk order plus any
/// warnings produced along the way.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub modules: Vec<Module>,
    pub warnings: Vec<LoadWarning>,
}

/// A non-fatal problem encountered while loading a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadWarning {
    pub path: PathBuf,
    pub message: String,
}

impl Display for LoadWarning {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

impl Loader {
    /// A loader for the standard `tools/` and `connectors/` subtrees of
    /// `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            tools_dir: root.join("tools"),
            connectors_dir: root.join("connectors"),
            extra_roots: Vec::new(),
            root,
        }
    }

    /// Override the tools subtree.
    #[must_use]
    pub fn tools_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tools_dir = dir.into();
        self
    }

    /// Override the connectors subtree.
    #[must_use]
    pub fn connectors_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.connectors_dir = dir.into();
        self
    }

    /// Add an explicit extra root whose files are classified as `kind`.
    #[must_use]
    pub fn extra_root(mut self, dir: impl AsRef<Path>, kind: ModuleKind) -> Self {
        self.extra_roots
            .push((self.root.join(dir.as_ref()).clean(), kind));
        self
    }

    /// Walk every subtree and load the modules found there.
    ///
    /// Output order is the insertion order of a stable directory walk:
    /// tools first, then connectors, then extra roots in registration order.
    #[must_use]
    pub fn load(&self) -> LoadOutcome {
        let mut outcome = LoadOutcome::default();

        let mut subtrees = vec![
            (self.tools_dir.clone(), ModuleKind::Tool),
            (self.connectors_dir.clone(), ModuleKind::Connector),
        ];
        subtrees.extend(self.extra_roots.iter().cloned());

        for (dir, kind) in subtrees {
            self.load_subtree(&dir, kind, &mut outcome);
        }

        outcome
    }

    fn load_subtree(&self, dir: &Path, kind: ModuleKind, outcome: &mut LoadOutcome) {
        if !dir.is_dir() {
            debug!("skipping absent subtree {}", dir.display());
            return;
        }

        let walk = WalkDir::new(dir)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_ignored_dir(entry));

        for entry in walk {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    outcome.warnings.push(LoadWarning {
                        path: error.path().unwrap_or(dir).to_owned(),
                        message: format!("unreadable directory entry: {error}"),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(language) = entry
                .path()
                .extension()
                .and_then(|extension| extension.to_str())
                .and_then(Language::from_extension)
            else {
                continue;
            };

            match self.load_module(entry.path(), kind, language) {
                Ok(Some(module)) => outcome.modules.push(module),
                Ok(None) => debug!("no metadata in {}", entry.path().display()),
                Err(message) => outcome.warnings.push(LoadWarning {
                    path: self.relative(entry.path()),
                    message,
                }),
            }
        }
    }

    /// Load one source file. `Ok(None)` means the file carries no metadata
    /// and is not a module; `Err` is a warning-grade extraction failure.
    fn load_module(
        &self,
        path: &Path,
        kind: ModuleKind,
        language: Language,
    ) -> Result<Option<Module>, String> {
        let source =
            fs::read_to_string(path).map_err(|error| format!("unreadable file: {error}"))?;

        let (metadata, annotated_credentials, python_version) = match language {
            Language::TypeScript => {
                let Some(tree) = typescript::extract_metadata(&source) else {
                    return Ok(None);
                };
                let tree = tree.map_err(|error| error.to_string())?;
                let metadata = decode_metadata(kind, tree)?;
                let credentials = typescript::extract_credential_annotations(&source);
                (metadata, credentials, None)
            }
            Language::Python => {
                let Some(block) = python::extract_doc_block(&source) else {
                    return Ok(None);
                };
                let block = block.map_err(|error| error.to_string())?;
                if !block_is_metadata(&block) {
                    return Ok(None);
                }
                let python_version = block.python_version.clone();
                let metadata = doc_block_into_metadata(kind, block);
                let credentials = python::extract_credential_directives(&source);
                (metadata, credentials, python_version)
            }
        };

        let name = metadata_name(&metadata)
            .or_else(|| {
                path.file_stem()
                    .and_then(|stem| stem.to_str())
                    .map(str::to_owned)
            })
            .unwrap_or_default();

        Ok(Some(Module {
            name,
            path: self.relative(path),
            kind,
            language,
            metadata,
            annotated_credentials,
            python_version,
        }))
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.root).unwrap_or(path).to_owned()
    }
}

/// Decode an extracted TypeScript metadata tree into the kind's typed record.
fn decode_metadata(kind: ModuleKind, tree: serde_json::Value) -> Result<Metadata, String> {
    let metadata = match kind {
        ModuleKind::Tool => serde_json::from_value::<ToolMetadata>(tree).map(Metadata::Tool),
        ModuleKind::Connector => {
            serde_json::from_value::<ConnectorMetadata>(tree).map(Metadata::Connector)
        }
    };
    metadata.map_err(|error| format!("malformed metadata: {error}"))
}

fn doc_block_into_metadata(kind: ModuleKind, block: python::DocBlock) -> Metadata {
    let python::DocBlock {
        name,
        description,
        version,
        schema_version,
        connector_type,
        input_schema,
        python_version: _,
        capabilities,
        dependencies,
        credentials,
    } = block;

    let common = CommonMetadata {
        name,
        description,
        version,
        schema_version,
        input_schema,
        capabilities,
        dependencies,
        credentials,
    };

    match kind {
        ModuleKind::Tool => Metadata::Tool(ToolMetadata { common }),
        ModuleKind::Connector => Metadata::Connector(ConnectorMetadata {
            common,
            connector_type,
            authentication: None,
            methods: None,
        }),
    }
}

/// A docstring counts as metadata only when it sets at least one labeled
/// field; a plain module docstring is not a module declaration.
fn block_is_metadata(block: &python::DocBlock) -> bool {
    block.name.is_some()
        || block.description.is_some()
        || block.version.is_some()
        || block.schema_version.is_some()
        || block.connector_type.is_some()
        || block.input_schema.is_some()
        || block.capabilities.is_some()
        || !block.credentials.is_empty()
}

fn metadata_name(metadata: &Metadata) -> Option<String> {
    let name = match metadata {
        Metadata::Tool(tool) => tool.common.name.as_ref(),
        Metadata::Connector(connector) => connector.common.name.as_ref(),
    };
    name.filter(|name| !name.is_empty()).cloned()
}

fn is_ignored_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| {
                name.starts_with('.') || name == "node_modules" || name == "__pycache__"
            })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().expect("file paths have parents"))
            .expect("create parent dirs");
        fs::write(path, contents).expect("write fixture");
    }

    const TS_TOOL: &str = r#"
export const metadata = {
    name: "send-email",
    description: "Send an email",
    version: "1.0.0",
    schemaVersion: "1.0",
};
"#;

    const PY_TOOL: &str = r#""""
MCP Tool: get-weather
Description: Weather lookup
Version: 0.1.0
"""
import requests
"#;

    const PY_CONNECTOR: &str = r#""""
MCP Connector: postgres
Description: Postgres access
Version: 2.0.0
Type: database
"""
import psycopg2
"#;

    #[test]
    fn loads_both_subtrees_in_walk_order() {
        let dir = tempfile::tempdir().expect("create tempdir");
        write(dir.path(), "tools/email.ts", TS_TOOL);
        write(dir.path(), "tools/weather.py", PY_TOOL);
        write(dir.path(), "connectors/postgres.py", PY_CONNECTOR);

        let outcome = Loader::new(dir.path()).load();
        assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);

        let names: Vec<_> = outcome
            .modules
            .iter()
            .map(|module| (module.name.as_str(), module.kind))
            .collect();
        assert_eq!(
            names,
            [
                ("send-email", ModuleKind::Tool),
                ("get-weather", ModuleKind::Tool),
                ("postgres", ModuleKind::Connector),
            ],
        );

        let postgres = outcome.modules.get(2).expect("three modules");
        assert_eq!(postgres.language, Language::Python);
        match &postgres.metadata {
            Metadata::Connector(connector) => {
                assert_eq!(connector.connector_type.as_deref(), Some("database"));
            }
            Metadata::Tool(_) => panic!("classified by subtree"),
        }
    }

    #[test]
    fn malformed_metadata_warns_and_skips() {
        let dir = tempfile::tempdir().expect("create tempdir");
        write(
            dir.path(),
            "tools/bad.ts",
            "export const metadata = { name: buildName() };",
        );
        write(dir.path(), "tools/good.ts", TS_TOOL);

        let outcome = Loader::new(dir.path()).load();
        assert_eq!(outcome.modules.len(), 1);
        assert_eq!(outcome.warnings.len(), 1);
        let warning = outcome.warnings.first().expect("one warning");
        assert!(warning.message.contains("live expression"), "{warning}");
    }

    #[test]
    fn helper_files_are_not_modules() {
        let dir = tempfile::tempdir().expect("create tempdir");
        write(dir.path(), "tools/util.ts", "export const helper = 1;");
        write(dir.path(), "tools/plain.py", "\"\"\"Just a docstring.\"\"\"\n");

        let outcome = Loader::new(dir.path()).load();
        assert!(outcome.modules.is_empty());
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn loaded_workspace_synthesizes_a_valid_image_recipe() {
        let dir = tempfile::tempdir().expect("create tempdir");
        write(dir.path(), "tools/email.ts", TS_TOOL);
        write(dir.path(), "connectors/postgres.py", PY_CONNECTOR);

        let outcome = Loader::new(dir.path()).load();
        let report = crate::validate::validate(&outcome.modules);
        assert!(report.is_valid(), "{:?}", report.diagnostics);

        let manifest = crate::manifest::synthesize(&outcome.modules, dir.path());
        assert!(crate::manifest::validate_manifest(&manifest).is_valid());
        assert_eq!(manifest.capabilities, ["database-integration"]);

        let synthesis = crate::dockerfile::synthesize(
            &manifest,
            None,
            &outcome.modules,
            &crate::dockerfile::SynthesisOptions::default(),
        );
        assert!(synthesis.dockerfile.contains("# mode: multi-stage"));
        assert!(crate::dockerfile::validate(&synthesis.dockerfile).is_valid());
    }

    #[test]
    fn name_falls_back_to_file_stem() {
        let dir = tempfile::tempdir().expect("create tempdir");
        write(
            dir.path(),
            "tools/unnamed.ts",
            "export const metadata = { version: \"1.0.0\" };",
        );

        let outcome = Loader::new(dir.path()).load();
        let module = outcome.modules.first().expect("one module");
        assert_eq!(module.name, "unnamed");
    }
}
