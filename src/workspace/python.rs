//! Metadata extraction for Python modules.
//!
//! The leading triple-quoted docstring carries free-form labeled lines
//! (`MCP Tool:`, `Description:`, `Input Schema:`, ...). `:credential`
//! directives are harvested from every docstring in the file, and import
//! roots are collected for dependency inference.

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;

use crate::module::{CredentialDecl, CredentialType};

static CREDENTIAL_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^\s*:credential\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)\s+(?P<type>[a-z_]+)\s+(?P<req>required|optional)\s*:\s*(?P<desc>.*)$",
    )
    .expect("credential directive regex is valid")
});

static IMPORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:import\s+(?P<import>[A-Za-z_][\w.]*)|from\s+(?P<from>[A-Za-z_][\w.]*)\s+import\s)")
        .expect("import regex is valid")
});

/// Import roots that never imply a third-party dependency.
const STANDARD_LIBRARY: &[&str] = &[
    "abc", "argparse", "asyncio", "base64", "collections", "contextlib", "copy", "csv",
    "dataclasses", "datetime", "decimal", "enum", "functools", "glob", "gzip", "hashlib", "hmac",
    "html", "http", "importlib", "inspect", "io", "itertools", "json", "logging", "math",
    "operator", "os", "pathlib", "pickle", "queue", "random", "re", "secrets", "shutil", "signal",
    "socket", "sqlite3", "ssl", "statistics", "string", "struct", "subprocess", "sys", "tempfile",
    "textwrap", "threading", "time", "traceback", "types", "typing", "unittest", "urllib", "uuid",
    "warnings", "zipfile",
];

/// Labeled fields parsed out of the leading docstring.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DocBlock {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub schema_version: Option<String>,
    pub connector_type: Option<String>,
    pub input_schema: Option<serde_json::Value>,
    pub python_version: Option<String>,
    pub capabilities: Option<Vec<String>>,
    /// Declared `Dependencies:` entries plus inferred import roots.
    pub dependencies: IndexMap<String, String>,
    /// Declarations from a `Credentials:` JSON array.
    pub credentials: Vec<CredentialDecl>,
}

/// Parse the module's leading docstring into a [`DocBlock`].
///
/// Returns `None` when the file has no leading docstring; an `Input Schema:`
/// label whose JSON body never closes is an error so the loader can warn.
pub fn extract_doc_block(source: &str) -> Option<Result<DocBlock, DocError>> {
    let docstring = leading_docstring(source)?;
    Some(parse_doc_block(docstring, source))
}

/// Errors from parsing a leading docstring.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DocError {
    #[error("`Input Schema:` block is not balanced JSON")]
    UnbalancedSchema,

    #[error("`Input Schema:` block is not valid JSON: {reason}")]
    InvalidSchema { reason: String },

    #[error("`Credentials:` block is not a balanced JSON array")]
    UnbalancedCredentials,

    #[error("`Credentials:` block is not a credential array: {reason}")]
    InvalidCredentials { reason: String },
}

fn parse_doc_block(docstring: &str, source: &str) -> Result<DocBlock, DocError> {
    let mut block = DocBlock::default();

    let mut lines = docstring.lines();
    loop {
        let Some(line) = lines.next() else { break };
        let Some((label, rest)) = line.split_once(':') else {
            continue;
        };
        let rest = rest.trim();
        match label.trim() {
            "MCP Tool" | "MCP Connector" => block.name = non_empty(rest),
            "Description" => block.description = non_empty(rest),
            "Version" => block.version = non_empty(rest),
            "Schema Version" => block.schema_version = non_empty(rest),
            "Type" => block.connector_type = non_empty(rest),
            "Python Version" => block.python_version = non_empty(rest),
            "Capabilities" => {
                block.capabilities = Some(
                    rest.split(',')
                        .map(str::trim)
                        .filter(|capability| !capability.is_empty())
                        .map(str::to_owned)
                        .collect(),
                );
            }
            "Dependencies" => {
                for entry in rest.split(',') {
                    let entry = entry.trim();
                    if entry.is_empty() {
                        continue;
                    }
                    let (package, range) = split_requirement(entry);
                    block.dependencies.insert(package, range);
                }
            }
            "Input Schema" => {
                // The JSON object starts on the same line or the next ones;
                // consume lines until the braces balance.
                let mut body = rest.to_owned();
                while !balanced(&body, '{', '}') {
                    let Some(line) = lines.next() else {
                        return Err(DocError::UnbalancedSchema);
                    };
                    body.push('\n');
                    body.push_str(line);
                }
                let body = body.trim();
                if !body.is_empty() {
                    block.input_schema = Some(serde_json::from_str(body).map_err(|error| {
                        DocError::InvalidSchema {
                            reason: error.to_string(),
                        }
                    })?);
                }
            }
            "Credentials" => {
                let mut body = rest.to_owned();
                while !balanced(&body, '[', ']') {
                    let Some(line) = lines.next() else {
                        return Err(DocError::UnbalancedCredentials);
                    };
                    body.push('\n');
                    body.push_str(line);
                }
                let body = body.trim();
                if !body.is_empty() {
                    block.credentials = serde_json::from_str(body).map_err(|error| {
                        DocError::InvalidCredentials {
                            reason: error.to_string(),
                        }
                    })?;
                }
            }
            _ => {}
        }
    }

    // Imports imply dependencies the docstring may not declare.
    for root in import_roots(source) {
        block.dependencies.entry(root).or_default();
    }

    Ok(block)
}

/// Harvest `:credential NAME type required|optional: description` directives
/// from every docstring in the file.
pub fn extract_credential_directives(source: &str) -> Vec<CredentialDecl> {
    docstrings(source)
        .flat_map(|docstring| CREDENTIAL_DIRECTIVE.captures_iter(docstring))
        .map(|captures| CredentialDecl {
            name: captures["name"].to_owned(),
            credential_type: CredentialType::parse_lenient(&captures["type"]),
            required: &captures["req"] == "required",
            description: captures["desc"].trim().to_owned(),
            service: None,
            validation: None,
        })
        .collect()
}

/// Third-party import roots, in first-appearance order.
fn import_roots(source: &str) -> Vec<String> {
    let mut roots = Vec::new();
    for captures in IMPORT_LINE.captures_iter(source) {
        let Some(path) = captures.name("import").or_else(|| captures.name("from")) else {
            continue;
        };
        let root = path.as_str().split('.').next().unwrap_or_default();
        if root.is_empty()
            || STANDARD_LIBRARY.contains(&root)
            || roots.iter().any(|existing| existing == root)
        {
            continue;
        }
        roots.push(root.to_owned());
    }
    roots
}

/// Split a requirement entry like `requests>=2.28` into name and range.
/// A bare name gets an empty range, normalized later by manifest synthesis.
fn split_requirement(entry: &str) -> (String, String) {
    match entry.find(|c| matches!(c, '=' | '<' | '>' | '~' | '!' | '^')) {
        Some(at) => {
            let (name, range) = entry.split_at(at);
            (name.trim().to_owned(), range.trim().to_owned())
        }
        None => (entry.to_owned(), String::new()),
    }
}

/// The docstring opening the module, ignoring a shebang, encoding comments,
/// and blank lines.
fn leading_docstring(source: &str) -> Option<&str> {
    let mut rest = source;
    loop {
        rest = rest.trim_start();
        if rest.starts_with('#') {
            let (_, tail) = rest.split_once('\n')?;
            rest = tail;
        } else {
            break;
        }
    }
    let quote = ["\"\"\"", "'''"]
        .into_iter()
        .find(|quote| rest.starts_with(quote))?;
    let body = rest.get(quote.len()..)?;
    let end = body.find(quote)?;
    body.get(..end)
}

/// All triple-quoted blocks in the file, in order.
fn docstrings(source: &str) -> impl Iterator<Item = &str> {
    let mut rest = source;
    std::iter::from_fn(move || {
        let start = rest.find("\"\"\"").or_else(|| rest.find("'''"))?;
        let quote = rest.get(start..start.saturating_add(3))?;
        let body = rest.get(start.saturating_add(3)..)?;
        let end = body.find(quote)?;
        let block = body.get(..end)?;
        rest = body.get(end.saturating_add(3)..)?;
        Some(block)
    })
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_owned())
}

fn balanced(body: &str, open: char, close: char) -> bool {
    // Counting is enough here: the bodies are JSON, and JSON strings
    // containing brackets are rare enough to surface as a load warning.
    let opened = body.matches(open).count();
    opened > 0 && opened == body.matches(close).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    const WEATHER_TOOL: &str = r#"#!/usr/bin/env python3
"""
MCP Tool: get-weather
Description: Look up the current weather for a city
Version: 0.3.1
Schema Version: 1.0
Python Version: 3.12
Capabilities: weather-lookup, geocoding
Dependencies: requests>=2.28, geopy
Input Schema: {
    "type": "object",
    "properties": {"city": {"type": "string"}}
}

:credential WEATHER_API_KEY api_key required: OpenWeatherMap key
"""

import json
import requests
from geopy import distance


def run(payload):
    """Fetch weather.

    :credential WEATHER_UNITS none optional: Preferred unit system
    """
    return {}
"#;

    #[test]
    fn parses_labeled_lines() {
        let block = extract_doc_block(WEATHER_TOOL)
            .expect("docstring present")
            .expect("docstring parses");
        assert_eq!(block.name.as_deref(), Some("get-weather"));
        assert_eq!(block.version.as_deref(), Some("0.3.1"));
        assert_eq!(block.schema_version.as_deref(), Some("1.0"));
        assert_eq!(block.python_version.as_deref(), Some("3.12"));
        assert_eq!(
            block.capabilities,
            Some(vec!["weather-lookup".to_owned(), "geocoding".to_owned()]),
        );
    }

    #[test]
    fn parses_brace_matched_schema() {
        let block = extract_doc_block(WEATHER_TOOL)
            .expect("docstring present")
            .expect("docstring parses");
        let schema = block.input_schema.expect("schema present");
        assert_eq!(schema["type"], "object");
    }

    #[test]
    fn merges_declared_and_inferred_dependencies() {
        let block = extract_doc_block(WEATHER_TOOL)
            .expect("docstring present")
            .expect("docstring parses");
        assert_eq!(
            block.dependencies.get("requests").map(String::as_str),
            Some(">=2.28"),
        );
        // geopy is declared without a range and also imported; json is stdlib.
        assert_eq!(block.dependencies.get("geopy").map(String::as_str), Some(""));
        assert!(!block.dependencies.contains_key("json"));
    }

    #[test]
    fn directives_found_in_every_docstring() {
        let credentials = extract_credential_directives(WEATHER_TOOL);
        let names: Vec<_> = credentials
            .iter()
            .map(|credential| credential.name.as_str())
            .collect();
        assert_eq!(names, ["WEATHER_API_KEY", "WEATHER_UNITS"]);
        assert!(credentials.first().expect("two directives").required);
    }

    #[test]
    fn no_leading_docstring() {
        assert_eq!(extract_doc_block("import os\n"), None);
    }

    #[test]
    fn unbalanced_schema_is_an_error() {
        let source = "\"\"\"\nMCP Tool: broken\nInput Schema: {\n\"\"\"\n";
        let result = extract_doc_block(source).expect("docstring present");
        assert_eq!(result, Err(DocError::UnbalancedSchema));
    }

    #[test]
    fn credentials_array_is_decoded() {
        let source = r#""""
MCP Tool: mailer
Credentials: [
    {"name": "SENDGRID_API_KEY", "type": "api_key", "required": true,
     "description": "SendGrid key", "service": "sendgrid"}
]
"""
"#;
        let block = extract_doc_block(source)
            .expect("docstring present")
            .expect("docstring parses");
        assert_eq!(block.credentials.len(), 1);
        let credential = block.credentials.first().expect("one credential");
        assert_eq!(credential.name, "SENDGRID_API_KEY");
        assert_eq!(credential.credential_type, CredentialType::ApiKey);
        assert_eq!(credential.service.as_deref(), Some("sendgrid"));
    }
}
