//! Credential requirement discovery and aggregation.
//!
//! Modules declare credentials in up to three notations (a `credentials`
//! metadata array, `@requires-credential` comment annotations, `:credential`
//! docstring directives); discovery merges them per credential name across
//! the whole module set. The interactive prompt that consumes the result
//! lives outside this crate; [`prompt_fields`] and [`env_var_name`] define
//! its input contract.

use indexmap::{IndexMap, IndexSet};

use crate::module::{CredentialType, Module};

/// A credential requirement merged from one or more declarations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedCredential {
    pub name: String,

    /// Pinned to the first known declaration; later conflicts only warn.
    pub credential_type: CredentialType,

    /// `true` as soon as any declaration requires it.
    pub required: bool,

    /// Longest non-empty declared description.
    pub description: String,

    pub service: Option<String>,

    pub validation: Option<String>,

    /// Names of the modules that declared this credential.
    pub used_by: IndexSet<String>,
}

/// Discovery output: aggregated credentials plus merge warnings.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Discovery {
    pub credentials: Vec<AggregatedCredential>,
    pub warnings: Vec<String>,
}

/// Merge every credential declaration in the module set.
///
/// The result is sorted by credential name; `required` is the monotone OR
/// of all declarations.
#[must_use]
pub fn discover(modules: &[Module]) -> Discovery {
    let mut merged: IndexMap<String, AggregatedCredential> = IndexMap::new();
    let mut warnings = Vec::new();

    for module in modules {
        for declaration in module.credentials() {
            if declaration.name.is_empty() {
                continue;
            }

            let entry = merged
                .entry(declaration.name.clone())
                .or_insert_with(|| AggregatedCredential {
                    name: declaration.name.clone(),
                    credential_type: declaration.credential_type,
                    required: false,
                    description: String::new(),
                    service: None,
                    validation: None,
                    used_by: IndexSet::new(),
                });

            entry.required |= declaration.required;
            entry.used_by.insert(module.name.clone());

            if entry.credential_type == CredentialType::None {
                entry.credential_type = declaration.credential_type;
            } else if declaration.credential_type != CredentialType::None
                && declaration.credential_type != entry.credential_type
            {
                warnings.push(format!(
                    "credential `{}`: module `{}` declares type `{}`, keeping `{}`",
                    declaration.name,
                    module.name,
                    declaration.credential_type,
                    entry.credential_type,
                ));
            }

            if declaration.description.len() > entry.description.len() {
                entry.description = declaration.description.clone();
            }

            if let Some(service) = declaration
                .service
                .as_deref()
                .filter(|service| !service.is_empty())
            {
                if let Some(pinned) = entry.service.as_deref() {
                    if pinned != service {
                        warnings.push(format!(
                            "credential `{}`: module `{}` assigns service `{service}`, keeping `{pinned}`",
                            declaration.name, module.name,
                        ));
                    }
                } else {
                    entry.service = Some(service.to_owned());
                }
            }

            if entry.validation.is_none() {
                entry.validation = declaration
                    .validation
                    .as_ref()
                    .filter(|validation| !validation.is_empty())
                    .cloned();
            }
        }
    }

    let mut credentials: Vec<_> = merged.into_values().collect();
    credentials.sort_by(|a, b| a.name.cmp(&b.name));

    Discovery {
        credentials,
        warnings,
    }
}

/// Bucket credentials by their service grouping key; credentials without a
/// service land under `"other"`.
#[must_use]
pub fn group_by_service(
    credentials: &[AggregatedCredential],
) -> IndexMap<String, Vec<&AggregatedCredential>> {
    let mut groups: IndexMap<String, Vec<&AggregatedCredential>> = IndexMap::new();
    for credential in credentials {
        let service = credential
            .service
            .clone()
            .unwrap_or_else(|| "other".to_owned());
        groups.entry(service).or_default().push(credential);
    }
    groups
}

/// One field of the downstream interactive prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptField {
    pub name: String,

    /// Whether the prompt should mask the typed value.
    pub masked: bool,

    /// Description with optional-ness appended in parentheses.
    pub text: String,

    /// Environment variable the prompt pre-fills the default from.
    pub env_var: String,
}

/// Adapt aggregated credentials to the prompt's field shape.
#[must_use]
pub fn prompt_fields(credentials: &[AggregatedCredential]) -> Vec<PromptField> {
    credentials
        .iter()
        .map(|credential| PromptField {
            name: credential.name.clone(),
            masked: credential.credential_type.is_masked(),
            text: if credential.required {
                credential.description.clone()
            } else {
                format!("{} (optional)", credential.description)
            },
            env_var: env_var_name(&credential.name),
        })
        .collect()
}

/// Conventional credential-name to environment-variable mapping:
/// `apiKey` becomes `API_KEY`. An underscore is inserted at each camel-case
/// boundary, `-` and whitespace become `_`, runs collapse, and the result is
/// uppercased with no leading underscore.
#[must_use]
pub fn env_var_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len().saturating_add(4));
    let mut prev_lower = false;

    for c in name.chars() {
        if c == '-' || c.is_whitespace() {
            out.push('_');
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = c.is_lowercase() || c.is_ascii_digit();
        out.push(c);
    }

    let mut collapsed = String::with_capacity(out.len());
    for c in out.chars() {
        if c == '_' && collapsed.ends_with('_') {
            continue;
        }
        collapsed.push(c);
    }

    collapsed.trim_start_matches('_').to_uppercase()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::module::{
        CommonMetadata, CredentialDecl, Language, Metadata, ModuleKind, ToolMetadata,
    };

    fn module_with(name: &str, credentials: Vec<CredentialDecl>) -> Module {
        Module {
            name: name.to_owned(),
            path: Path::new("tools").join(name).with_extension("ts"),
            kind: ModuleKind::Tool,
            language: Language::TypeScript,
            metadata: Metadata::Tool(ToolMetadata {
                common: CommonMetadata {
                    name: Some(name.to_owned()),
                    credentials,
                    ..CommonMetadata::default()
                },
            }),
            annotated_credentials: Vec::new(),
            python_version: None,
        }
    }

    fn declaration(name: &str, credential_type: CredentialType, required: bool) -> CredentialDecl {
        CredentialDecl {
            name: name.to_owned(),
            credential_type,
            required,
            ..CredentialDecl::default()
        }
    }

    #[test]
    fn required_is_the_or_of_all_declarations() {
        let modules = [
            module_with(
                "a",
                vec![declaration("SHARED_KEY", CredentialType::ApiKey, false)],
            ),
            module_with(
                "b",
                vec![declaration("SHARED_KEY", CredentialType::ApiKey, true)],
            ),
        ];

        let discovery = discover(&modules);
        assert_eq!(discovery.credentials.len(), 1);
        let credential = discovery.credentials.first().expect("one credential");
        assert!(credential.required);
        let used_by: Vec<_> = credential.used_by.iter().map(String::as_str).collect();
        assert_eq!(used_by, ["a", "b"]);
    }

    #[test]
    fn type_conflict_warns_but_keeps_the_pin() {
        let modules = [
            module_with(
                "a",
                vec![declaration("KEY", CredentialType::ApiKey, true)],
            ),
            module_with("b", vec![declaration("KEY", CredentialType::Token, true)]),
        ];

        let discovery = discover(&modules);
        let credential = discovery.credentials.first().expect("one credential");
        assert_eq!(credential.credential_type, CredentialType::ApiKey);
        assert_eq!(discovery.warnings.len(), 1);
    }

    #[test]
    fn longest_description_wins() {
        let mut short = declaration("KEY", CredentialType::ApiKey, true);
        short.description = "key".to_owned();
        let mut long = declaration("KEY", CredentialType::ApiKey, true);
        long.description = "the service API key".to_owned();

        let discovery = discover(&[module_with("a", vec![short]), module_with("b", vec![long])]);
        let credential = discovery.credentials.first().expect("one credential");
        assert_eq!(credential.description, "the service API key");
    }

    #[test]
    fn output_is_sorted_by_name() {
        let modules = [module_with(
            "a",
            vec![
                declaration("ZULU", CredentialType::Token, true),
                declaration("ALPHA", CredentialType::Token, true),
            ],
        )];
        let names: Vec<_> = discover(&modules)
            .credentials
            .into_iter()
            .map(|credential| credential.name)
            .collect();
        assert_eq!(names, ["ALPHA", "ZULU"]);
    }

    #[test]
    fn grouping_defaults_to_other() {
        let mut with_service = declaration("A", CredentialType::ApiKey, true);
        with_service.service = Some("sendgrid".to_owned());
        let without_service = declaration("B", CredentialType::Token, true);

        let discovery = discover(&[module_with("m", vec![with_service, without_service])]);
        let groups = group_by_service(&discovery.credentials);
        assert_eq!(groups.get("sendgrid").map(Vec::len), Some(1));
        assert_eq!(groups.get("other").map(Vec::len), Some(1));
    }

    #[test]
    fn masked_types_and_optionality() {
        let mut optional = declaration("API_KEY", CredentialType::ApiKey, false);
        optional.description = "service key".to_owned();
        let mut token = declaration("TOKEN", CredentialType::Token, true);
        token.description = "bearer token".to_owned();

        let discovery = discover(&[module_with("m", vec![optional, token])]);
        let fields = prompt_fields(&discovery.credentials);

        let api_key = fields.first().expect("two fields");
        assert!(api_key.masked);
        assert_eq!(api_key.text, "service key (optional)");

        let bearer = fields.get(1).expect("two fields");
        assert!(!bearer.masked);
        assert_eq!(bearer.text, "bearer token");
    }

    #[test]
    fn env_var_mapping() {
        assert_eq!(env_var_name("apiKey"), "API_KEY");
        assert_eq!(env_var_name("my-api key"), "MY_API_KEY");
        assert_eq!(env_var_name("SENDGRID_API_KEY"), "SENDGRID_API_KEY");
        assert_eq!(env_var_name("-leading"), "LEADING");
        assert_eq!(env_var_name("a--b"), "A_B");
    }
}
