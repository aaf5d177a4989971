//! Core data model for discovered workspace modules.
//!
//! A [`Module`] is a single source file found under `tools/` or `connectors/`
//! together with the declarative metadata extracted from it. Modules are only
//! ever read; nothing in this crate executes module code.

use std::{
    fmt::{self, Display, Formatter},
    path::PathBuf,
    str::FromStr,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// A discovered unit of the workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Identifier, case-preserved. Compared case-insensitively by the
    /// validator.
    pub name: String,

    /// Path relative to the workspace root.
    pub path: PathBuf,

    /// Which workspace subtree the module came from.
    pub kind: ModuleKind,

    /// Source convention the metadata was extracted with.
    pub language: Language,

    /// Kind-specific metadata.
    pub metadata: Metadata,

    /// Credentials declared in comment annotations rather than in the
    /// metadata object: `@requires-credential` blocks for TypeScript and
    /// `:credential` directives for Python.
    pub annotated_credentials: Vec<CredentialDecl>,

    /// Interpreter version declared with the `Python Version:` docstring
    /// label. Always `None` for TypeScript modules. Used to pick the runtime
    /// base image.
    pub python_version: Option<String>,
}

impl Module {
    /// The metadata common to both kinds.
    #[must_use]
    pub fn common(&self) -> &CommonMetadata {
        match &self.metadata {
            Metadata::Tool(tool) => &tool.common,
            Metadata::Connector(connector) => &connector.common,
        }
    }

    /// Credentials from every notation the module declares them in.
    pub fn credentials(&self) -> impl Iterator<Item = &CredentialDecl> {
        self.common()
            .credentials
            .iter()
            .chain(&self.annotated_credentials)
    }
}

/// Classification by workspace subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Tool,
    Connector,
}

/// Source language convention a module is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    /// Typed source; metadata is a literal `metadata` object declaration.
    TypeScript,
    /// Dynamic source; metadata is a labeled leading docstring.
    Python,
}

impl Language {
    /// Language for a source file extension, if it is one we extract from.
    #[must_use]
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "ts" | "mts" | "js" | "mjs" => Some(Self::TypeScript),
            "py" => Some(Self::Python),
            _ => None,
        }
    }
}

impl Display for Language {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::TypeScript => f.write_str("typescript"),
            Self::Python => f.write_str("python"),
        }
    }
}

/// Kind-specific metadata extracted from a module source file.
#[derive(Debug, Clone, PartialEq)]
pub enum Metadata {
    Tool(ToolMetadata),
    Connector(ConnectorMetadata),
}

/// Fields shared by tools and connectors.
///
/// Presence of `name`, `description`, and `version` is a validator concern,
/// so extraction admits records missing them.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CommonMetadata {
    pub name: Option<String>,
    pub description: Option<String>,

    /// Declared version, expected to be semver.
    pub version: Option<String>,

    /// Metadata schema version; `"1.0"` is the only supported value.
    pub schema_version: Option<String>,

    /// Opaque input schema tree; passed through to the manifest untouched.
    pub input_schema: Option<serde_json::Value>,

    pub capabilities: Option<Vec<String>>,

    /// Package name to declared version range.
    pub dependencies: IndexMap<String, String>,

    pub credentials: Vec<CredentialDecl>,
}

/// Metadata for a module discovered under `tools/`.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct ToolMetadata {
    #[serde(flatten)]
    pub common: CommonMetadata,
}

/// Metadata for a module discovered under `connectors/`.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct ConnectorMetadata {
    #[serde(flatten)]
    pub common: CommonMetadata,

    /// External-service category, restricted to [`ConnectorType`]'s
    /// vocabulary. Kept as declared so the validator can report unknown
    /// values with the original spelling.
    #[serde(rename = "type")]
    pub connector_type: Option<String>,

    /// Opaque authentication settings tree.
    #[serde(default)]
    pub authentication: Option<serde_json::Value>,

    /// Names of the methods the connector exposes.
    #[serde(default)]
    pub methods: Option<Vec<String>>,
}

/// Closed vocabulary of connector categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorType {
    Database,
    Email,
    Oauth,
    Http,
    Storage,
    Messaging,
    Search,
}

impl ConnectorType {
    /// Every accepted category, for error messages.
    pub const ALL: [Self; 7] = [
        Self::Database,
        Self::Email,
        Self::Oauth,
        Self::Http,
        Self::Storage,
        Self::Messaging,
        Self::Search,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Email => "email",
            Self::Oauth => "oauth",
            Self::Http => "http",
            Self::Storage => "storage",
            Self::Messaging => "messaging",
            Self::Search => "search",
        }
    }
}

impl FromStr for ConnectorType {
    type Err = UnknownConnectorType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|connector_type| connector_type.as_str() == s)
            .ok_or_else(|| UnknownConnectorType {
                value: s.to_owned(),
            })
    }
}

impl Display for ConnectorType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a [`ConnectorType`] from an unknown string.
#[derive(Debug, thiserror::Error)]
#[error("unknown connector type `{value}`")]
pub struct UnknownConnectorType {
    pub value: String,
}

/// A single credential requirement declared by a module.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct CredentialDecl {
    /// Env-var-style identifier, e.g. `SENDGRID_API_KEY`.
    pub name: String,

    #[serde(rename = "type")]
    pub credential_type: CredentialType,

    pub required: bool,

    pub description: String,

    /// Grouping key used when presenting requirements per service.
    pub service: Option<String>,

    /// Validation regex for the collected value.
    pub validation: Option<String>,
}

impl Default for CredentialDecl {
    fn default() -> Self {
        Self {
            name: String::new(),
            credential_type: CredentialType::None,
            required: false,
            description: String::new(),
            service: None,
            validation: None,
        }
    }
}

/// Closed vocabulary of credential types.
///
/// Unknown declared types deserialize to [`CredentialType::None`]; the
/// credential discoverer reports conflicting declarations as warnings.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CredentialType {
    ApiKey,
    Password,
    Token,
    Oauth,
    OauthClientId,
    OauthClientSecret,
    OauthRefreshToken,
    #[default]
    None,
}

impl<'de> Deserialize<'de> for CredentialType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let declared = String::deserialize(deserializer)?;
        Ok(Self::parse_lenient(&declared))
    }
}

impl CredentialType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::Password => "password",
            Self::Token => "token",
            Self::Oauth => "oauth",
            Self::OauthClientId => "oauth_client_id",
            Self::OauthClientSecret => "oauth_client_secret",
            Self::OauthRefreshToken => "oauth_refresh_token",
            Self::None => "none",
        }
    }

    /// Whether a prompt for this credential should mask the typed value.
    #[must_use]
    pub fn is_masked(self) -> bool {
        matches!(self, Self::ApiKey | Self::Password)
    }

    /// Parse a declared type, mapping unknown spellings to [`Self::None`].
    #[must_use]
    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "api_key" => Self::ApiKey,
            "password" => Self::Password,
            "token" => Self::Token,
            "oauth" => Self::Oauth,
            "oauth_client_id" => Self::OauthClientId,
            "oauth_client_secret" => Self::OauthClientSecret,
            "oauth_refresh_token" => Self::OauthRefreshToken,
            _ => Self::None,
        }
    }
}

impl Display for CredentialType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connector_type_round_trip() {
        for connector_type in ConnectorType::ALL {
            assert_eq!(
                connector_type.as_str().parse::<ConnectorType>().ok(),
                Some(connector_type),
            );
        }
        assert!("telepathy".parse::<ConnectorType>().is_err());
    }

    #[test]
    fn credential_type_unknown_is_none() {
        let decl: CredentialDecl =
            serde_json::from_str(r#"{"name": "KEY", "type": "quantum"}"#)
                .expect("valid credential JSON");
        assert_eq!(decl.credential_type, CredentialType::None);
    }

    #[test]
    fn metadata_camel_case_fields() {
        let metadata: CommonMetadata = serde_json::from_str(
            r#"{"name": "emailer", "schemaVersion": "1.0", "inputSchema": {"type": "object"}}"#,
        )
        .expect("valid metadata JSON");
        assert_eq!(metadata.schema_version.as_deref(), Some("1.0"));
        assert!(metadata.input_schema.is_some());
    }
}
