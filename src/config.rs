//! Layered configuration resolution.
//!
//! Layers are applied as successive deep merges in a fixed precedence order:
//! built-in defaults, the base config file, an environment-specific overlay
//! found next to it, `CONFIG_*` environment variables, and command-line
//! overrides. The resolver is schema-agnostic; the conventional structure
//! (`server.*`, `logging.*`, `database.*`, ...) is convention only.
//!
//! Resolution is deterministic: identical inputs produce an identical tree
//! and identical source annotations.

pub mod watch;

use std::{
    fmt::{self, Display, Formatter, Write as _},
    fs, io,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use serde_json::{Map, Value, json};

/// Errors fatal to the current command.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("error reading config file {path}")]
    Read {
        path: PathBuf,
        source: io::Error,
    },

    #[error("error parsing config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("config file {path} is not JSON or YAML")]
    UnsupportedFormat { path: PathBuf },

    #[error("malformed override `{argument}`: expected `path.to.key=value`")]
    MalformedOverride { argument: String },
}

/// Where a resolved value came from. Precedence is the declaration order,
/// lowest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Default,
    File(PathBuf),
    EnvFile(PathBuf),
    EnvVar,
    Cli,
}

impl Display for Source {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Default => f.write_str("default"),
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::EnvFile(path) => write!(f, "env-file:{}", path.display()),
            Self::EnvVar => f.write_str("env-var"),
            Self::Cli => f.write_str("cli"),
        }
    }
}

/// How arrays combine when both layers provide one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArrayMerge {
    /// Later layer wins wholesale.
    #[default]
    Replace,
    /// Later layer's items are appended.
    Concat,
    /// Concatenate, then keep the first occurrence of each value.
    Unique,
}

/// A fully resolved configuration snapshot. Immutable once produced; a
/// watcher triggers a new resolution rather than mutating this one.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub config: Value,

    /// Final source of every leaf path in the tree, keyed by dotted path.
    pub sources: IndexMap<String, Source>,
}

/// Builder for a layered resolution.
#[derive(Debug, Clone)]
pub struct Resolver {
    defaults: Value,
    config_path: Option<PathBuf>,
    environment: Option<String>,
    env_vars: Vec<(String, String)>,
    overrides: Vec<(String, String)>,
    array_merge: ArrayMerge,
}

impl Default for Resolver {
    fn default() -> Self {
        Self {
            defaults: defaults(),
            config_path: None,
            environment: None,
            env_vars: Vec::new(),
            overrides: Vec::new(),
            array_merge: ArrayMerge::default(),
        }
    }
}

impl Resolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the built-in defaults layer.
    #[must_use]
    pub fn defaults(mut self, defaults: Value) -> Self {
        self.defaults = defaults;
        self
    }

    /// Base config file. The environment overlay is searched for in its
    /// directory.
    #[must_use]
    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Environment name selecting the overlay file, e.g. `production`.
    #[must_use]
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Provide environment variables explicitly. Only `CONFIG_`-prefixed
    /// entries participate.
    #[must_use]
    pub fn env_vars(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env_vars = vars.into_iter().collect();
        self
    }

    /// Read `CONFIG_*` variables from the process environment.
    #[must_use]
    pub fn env_vars_from_process(self) -> Self {
        let vars = std::env::vars().collect::<Vec<_>>();
        self.env_vars(vars)
    }

    /// Add a command-line override in `path.to.key=value` form.
    #[must_use]
    pub fn set(mut self, path: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.push((path.into(), value.into()));
        self
    }

    /// Parse raw `--config.a.b=v` / `--a.b=v` argument forms.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MalformedOverride`] for an argument without a
    /// `=` or with an empty path.
    pub fn cli_args<S: AsRef<str>>(mut self, args: &[S]) -> Result<Self, ConfigError> {
        for argument in args {
            let argument = argument.as_ref();
            let trimmed = argument.trim_start_matches("--");
            let trimmed = trimmed.strip_prefix("config.").unwrap_or(trimmed);
            let Some((path, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::MalformedOverride {
                    argument: argument.to_owned(),
                });
            };
            if path.is_empty() {
                return Err(ConfigError::MalformedOverride {
                    argument: argument.to_owned(),
                });
            }
            self.overrides.push((path.to_owned(), value.to_owned()));
        }
        Ok(self)
    }

    #[must_use]
    pub fn array_merge(mut self, strategy: ArrayMerge) -> Self {
        self.array_merge = strategy;
        self
    }

    /// Apply every layer in precedence order.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file cannot be read or parsed; absent
    /// overlay files are not an error.
    pub fn resolve(&self) -> Result<Resolved, ConfigError> {
        let mut config = Value::Object(Map::new());
        let mut sources = IndexMap::new();

        merge(
            &mut config,
            self.defaults.clone(),
            &Source::Default,
            self.array_merge,
            &mut String::new(),
            &mut sources,
        );

        if let Some(path) = &self.config_path {
            let file = load_file(path)?;
            merge(
                &mut config,
                file,
                &Source::File(path.clone()),
                self.array_merge,
                &mut String::new(),
                &mut sources,
            );

            if let Some(environment) = &self.environment {
                if let Some(overlay_path) = find_overlay(path, environment) {
                    let overlay = load_file(&overlay_path)?;
                    merge(
                        &mut config,
                        overlay,
                        &Source::EnvFile(overlay_path),
                        self.array_merge,
                        &mut String::new(),
                        &mut sources,
                    );
                }
            }
        }

        for (key, raw) in &self.env_vars {
            let Some(suffix) = key.strip_prefix("CONFIG_") else {
                continue;
            };
            if suffix.is_empty() {
                continue;
            }
            let path = suffix
                .split('_')
                .map(str::to_lowercase)
                .collect::<Vec<_>>()
                .join(".");
            let layered = nest(&path, coerce(raw));
            merge(
                &mut config,
                layered,
                &Source::EnvVar,
                self.array_merge,
                &mut String::new(),
                &mut sources,
            );
        }

        for (path, raw) in &self.overrides {
            let layered = nest(path, coerce(raw));
            merge(
                &mut config,
                layered,
                &Source::Cli,
                self.array_merge,
                &mut String::new(),
                &mut sources,
            );
        }

        Ok(Resolved { config, sources })
    }
}

/// Built-in defaults for the conventional structure.
#[must_use]
pub fn defaults() -> Value {
    json!({
        "server": {
            "name": "mcp-server",
            "version": "1.0.0",
            "host": "0.0.0.0",
            "port": 8080,
            "cors": true,
        },
        "logging": {
            "level": "info",
            "format": "text",
            "destination": "stdout",
        },
        "database": {
            "pool": { "max": 10 },
            "timeout": 30_000,
        },
    })
}

/// Coerce a raw string from an environment variable or CLI override.
///
/// Order: booleans, the `null` clear sentinel, numbers, JSON arrays and
/// objects (falling back to the raw string when undecodable), strings.
#[must_use]
pub fn coerce(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if raw.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if raw == "null" {
        return Value::Null;
    }
    if let Ok(int) = raw.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Ok(float) = raw.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    if raw.starts_with('[') || raw.starts_with('{') {
        if let Ok(value) = serde_json::from_str(raw) {
            return value;
        }
    }
    Value::String(raw.to_owned())
}

/// Deep-merge `incoming` into `dest`, recording the layer's [`Source`] for
/// every leaf it sets.
fn merge(
    dest: &mut Value,
    incoming: Value,
    source: &Source,
    array_merge: ArrayMerge,
    path: &mut String,
    sources: &mut IndexMap<String, Source>,
) {
    match incoming {
        Value::Object(incoming_map) => {
            if !dest.is_object() {
                // Replacing a scalar with a subtree: its old annotation is
                // stale now.
                sources.shift_remove(path.as_str());
                *dest = Value::Object(Map::new());
            }
            let Some(dest_map) = dest.as_object_mut() else {
                return;
            };
            for (key, value) in incoming_map {
                let len = path.len();
                if !path.is_empty() {
                    path.push('.');
                }
                path.push_str(&key);
                merge(
                    dest_map.entry(key).or_insert(Value::Null),
                    value,
                    source,
                    array_merge,
                    path,
                    sources,
                );
                path.truncate(len);
            }
        }
        Value::Array(incoming_items) => {
            let merged = match (array_merge, dest.as_array()) {
                (ArrayMerge::Replace, _) | (_, None) => incoming_items,
                (ArrayMerge::Concat, Some(existing)) => {
                    let mut items = existing.clone();
                    items.extend(incoming_items);
                    items
                }
                (ArrayMerge::Unique, Some(existing)) => {
                    let mut items = existing.clone();
                    for item in incoming_items {
                        if !items.contains(&item) {
                            items.push(item);
                        }
                    }
                    items
                }
            };
            set_leaf(dest, Value::Array(merged), source, path, sources);
        }
        other => set_leaf(dest, other, source, path, sources),
    }
}

fn set_leaf(
    dest: &mut Value,
    value: Value,
    source: &Source,
    path: &str,
    sources: &mut IndexMap<String, Source>,
) {
    // A scalar replacing a subtree invalidates the subtree's annotations.
    if dest.is_object() {
        let prefix = format!("{path}.");
        sources.retain(|recorded, _| !recorded.starts_with(&prefix));
    }
    *dest = value;
    sources.insert(path.to_owned(), source.clone());
}

/// Build a nested single-leaf object for a dotted path.
fn nest(path: &str, value: Value) -> Value {
    path.rsplit('.').fold(value, |inner, key| {
        let mut map = Map::new();
        map.insert(key.to_owned(), inner);
        Value::Object(map)
    })
}

fn load_file(path: &Path) -> Result<Value, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;

    let extension = path.extension().and_then(|extension| extension.to_str());
    match extension {
        Some("json") => serde_json::from_str(&contents).map_err(|error| ConfigError::Parse {
            path: path.to_owned(),
            reason: error.to_string(),
        }),
        Some("yaml" | "yml") => {
            serde_yaml::from_str(&contents).map_err(|error| ConfigError::Parse {
                path: path.to_owned(),
                reason: error.to_string(),
            })
        }
        _ => Err(ConfigError::UnsupportedFormat {
            path: path.to_owned(),
        }),
    }
}

/// First matching overlay next to the base file: `config.<env>.yaml`,
/// `<env>.yaml`, `config.<env>.json`.
fn find_overlay(base: &Path, environment: &str) -> Option<PathBuf> {
    let dir = base.parent()?;
    [
        format!("config.{environment}.yaml"),
        format!("{environment}.yaml"),
        format!("config.{environment}.json"),
    ]
    .into_iter()
    .map(|name| dir.join(name))
    .find(|candidate| candidate.is_file())
}

/// Leaf keys matching any of these render as asterisks in the debug dump.
const SENSITIVE_MARKERS: &[&str] = &["key", "secret", "token", "password"];

/// Render the resolved tree for debug output, masking sensitive values and
/// annotating each leaf with its source.
#[must_use]
pub fn debug_dump(resolved: &Resolved) -> String {
    let mut out = String::new();
    dump_value(&resolved.config, resolved, &mut String::new(), 0, &mut out);
    out
}

fn dump_value(value: &Value, resolved: &Resolved, path: &mut String, depth: usize, out: &mut String) {
    let Some(map) = value.as_object() else {
        return;
    };
    for (key, child) in map {
        let len = path.len();
        if !path.is_empty() {
            path.push('.');
        }
        path.push_str(key);

        for _ in 0..depth {
            out.push_str("  ");
        }
        if child.is_object() {
            let _ = writeln!(out, "{key}:");
            dump_value(child, resolved, path, depth.saturating_add(1), out);
        } else {
            let rendered = if is_sensitive(key) {
                "********".to_owned()
            } else {
                child.to_string()
            };
            let source = resolved
                .sources
                .get(path.as_str())
                .map(ToString::to_string)
                .unwrap_or_default();
            let _ = writeln!(out, "{key}: {rendered}  [{source}]");
        }

        path.truncate(len);
    }
}

fn is_sensitive(key: &str) -> bool {
    let key = key.to_lowercase();
    SENSITIVE_MARKERS.iter().any(|marker| key.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_lowest_to_highest() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let base = dir.path().join("config.yaml");
        fs::write(&base, "server:\n  port: 3000\n").expect("write base config");

        let resolved = Resolver::new()
            .config_path(&base)
            .env_vars([("CONFIG_SERVER_PORT".to_owned(), "5000".to_owned())])
            .cli_args(&["--config.server.port=6000"])
            .expect("override parses")
            .resolve()
            .expect("resolution succeeds");

        assert_eq!(resolved.config["server"]["port"], 6000);
        assert_eq!(resolved.sources.get("server.port"), Some(&Source::Cli));
        // Untouched defaults keep their annotation.
        assert_eq!(resolved.sources.get("server.host"), Some(&Source::Default));
    }

    #[test]
    fn environment_overlay_sits_between_file_and_env_vars() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let base = dir.path().join("config.yaml");
        fs::write(&base, "server:\n  port: 3000\n  name: base\n").expect("write base config");
        fs::write(
            dir.path().join("config.production.yaml"),
            "server:\n  port: 4000\n",
        )
        .expect("write overlay");

        let resolved = Resolver::new()
            .config_path(&base)
            .environment("production")
            .resolve()
            .expect("resolution succeeds");

        assert_eq!(resolved.config["server"]["port"], 4000);
        assert_eq!(resolved.config["server"]["name"], "base");
        assert!(matches!(
            resolved.sources.get("server.port"),
            Some(Source::EnvFile(_)),
        ));
    }

    #[test]
    fn resolution_is_deterministic() {
        let resolver = Resolver::new()
            .env_vars([("CONFIG_FEATURES_FAST".to_owned(), "true".to_owned())])
            .set("server.port", "9999");
        let first = resolver.resolve().expect("resolution succeeds");
        let second = resolver.resolve().expect("resolution succeeds");
        assert_eq!(first, second);
    }

    #[test]
    fn merging_a_config_with_itself_is_identity() {
        let tree = defaults();
        let mut dest = tree.clone();
        merge(
            &mut dest,
            tree.clone(),
            &Source::Default,
            ArrayMerge::Replace,
            &mut String::new(),
            &mut IndexMap::new(),
        );
        assert_eq!(dest, tree);
    }

    #[test]
    fn coercion_rules() {
        assert_eq!(coerce("true"), Value::Bool(true));
        assert_eq!(coerce("FALSE"), Value::Bool(false));
        assert_eq!(coerce("null"), Value::Null);
        assert_eq!(coerce("5000"), json!(5000));
        assert_eq!(coerce("2.5"), json!(2.5));
        assert_eq!(coerce(r#"["a","b"]"#), json!(["a", "b"]));
        // Undecodable JSON falls back to the raw string.
        assert_eq!(coerce("[oops"), Value::String("[oops".to_owned()));
        assert_eq!(coerce("hello"), Value::String("hello".to_owned()));
    }

    #[test]
    fn array_strategies() {
        let merge_arrays = |strategy, a: Value, b: Value| {
            let mut dest = a;
            merge(
                &mut dest,
                b,
                &Source::Cli,
                strategy,
                &mut String::new(),
                &mut IndexMap::new(),
            );
            dest
        };

        assert_eq!(
            merge_arrays(ArrayMerge::Replace, json!([1, 2]), json!([3])),
            json!([3]),
        );
        assert_eq!(
            merge_arrays(ArrayMerge::Concat, json!([1, 2]), json!([2, 3])),
            json!([1, 2, 2, 3]),
        );
        assert_eq!(
            merge_arrays(ArrayMerge::Unique, json!([1, 2]), json!([2, 3])),
            json!([1, 2, 3]),
        );
    }

    #[test]
    fn scalar_replacing_subtree_drops_stale_annotations() {
        let resolved = Resolver::new()
            .defaults(json!({ "database": { "pool": { "max": 10 } } }))
            .set("database.pool", "off")
            .resolve()
            .expect("resolution succeeds");

        assert_eq!(resolved.config["database"]["pool"], "off");
        assert_eq!(resolved.sources.get("database.pool"), Some(&Source::Cli));
        assert_eq!(resolved.sources.get("database.pool.max"), None);
    }

    #[test]
    fn sensitive_values_are_masked_in_the_dump() {
        let resolved = Resolver::new()
            .defaults(json!({
                "services": { "sendgrid": { "apiKey": "sk-123", "region": "eu" } },
            }))
            .resolve()
            .expect("resolution succeeds");

        let dump = debug_dump(&resolved);
        assert!(dump.contains("apiKey: ********"));
        assert!(!dump.contains("sk-123"));
        assert!(dump.contains("region: \"eu\""));
    }

    #[test]
    fn malformed_override_is_rejected() {
        let result = Resolver::new().cli_args(&["--config.server.port"]);
        assert!(matches!(
            result,
            Err(ConfigError::MalformedOverride { .. }),
        ));
    }

    #[test]
    fn unsupported_format_is_rejected() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let base = dir.path().join("config.toml");
        fs::write(&base, "port = 1").expect("write file");

        let result = Resolver::new().config_path(&base).resolve();
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat { .. })));
    }
}
