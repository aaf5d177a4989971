//! Metadata extraction for TypeScript modules.
//!
//! The source is never executed. A top-level `metadata` declaration is located
//! by scanning, its object literal body is decoded into a data tree with a
//! small literal-only parser, and `@requires-credential` comment annotations
//! are harvested separately.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::module::{CredentialDecl, CredentialType};

/// Start of a top-level `metadata` declaration. The object body itself is
/// brace-matched by [`decode_object_literal`], not by regex.
static METADATA_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:export\s+)?(?:const|let|var)\s+metadata\s*(?::[^=]+)?=\s*\{")
        .expect("metadata declaration regex is valid")
});

static REQUIRES_CREDENTIAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"@requires-credential\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)\s+(?P<type>[a-z_]+)\s+(?P<req>required|optional)\s*-\s*(?P<desc>.*)",
    )
    .expect("requires-credential regex is valid")
});

/// Errors from decoding a `metadata` object literal.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LiteralError {
    /// The declaration was found but its braces never balance.
    #[error("unterminated object literal")]
    Unterminated,

    /// The literal contains something other than plain data, e.g. a function
    /// call or a template string with interpolation.
    #[error("metadata contains a live expression near `{near}`")]
    LiveExpression { near: String },

    #[error("unterminated string in object literal")]
    UnterminatedString,
}

/// Locate the `metadata` declaration and decode its object literal body.
///
/// Returns `None` when the file has no `metadata` declaration at all;
/// a found-but-undecodable body is an error so the loader can warn.
pub fn extract_metadata(source: &str) -> Option<Result<Value, LiteralError>> {
    let found = METADATA_DECL.find(source)?;
    // Back up one byte so the decoder sees the opening brace.
    let body_start = found.end().checked_sub(1)?;
    Some(source.get(body_start..).map_or(
        Err(LiteralError::Unterminated),
        decode_object_literal,
    ))
}

/// Harvest `@requires-credential NAME type required|optional - description`
/// annotations from anywhere in the source.
pub fn extract_credential_annotations(source: &str) -> Vec<CredentialDecl> {
    REQUIRES_CREDENTIAL
        .captures_iter(source)
        .map(|captures| CredentialDecl {
            name: captures["name"].to_owned(),
            credential_type: CredentialType::parse_lenient(&captures["type"]),
            required: &captures["req"] == "required",
            description: captures["desc"].trim().trim_end_matches("*/").trim().to_owned(),
            service: None,
            validation: None,
        })
        .collect()
}

/// Decode a JavaScript object literal into a [`Value`].
///
/// Accepted grammar: objects with quoted or identifier keys, arrays, single-
/// double- or backtick-quoted strings (no interpolation), numbers, `true`,
/// `false`, `null`, and trailing commas. Anything else is a live expression.
fn decode_object_literal(input: &str) -> Result<Value, LiteralError> {
    let mut parser = Parser {
        chars: input.char_indices().peekable(),
        input,
    };
    let value = parser.value()?;
    Ok(value)
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    input: &'a str,
}

impl Parser<'_> {
    fn value(&mut self) -> Result<Value, LiteralError> {
        self.skip_trivia();
        match self.peek() {
            Some('{') => self.object(),
            Some('[') => self.array(),
            Some('"' | '\'' | '`') => self.string().map(Value::String),
            Some(c) if c.is_ascii_digit() || c == '-' || c == '+' => self.number(),
            Some(_) => {
                let word = self.word();
                match word.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    "null" | "undefined" => Ok(Value::Null),
                    _ => Err(self.live(&word)),
                }
            }
            None => Err(LiteralError::Unterminated),
        }
    }

    fn object(&mut self) -> Result<Value, LiteralError> {
        self.bump(); // '{'
        let mut map = Map::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                Some('}') => {
                    self.bump();
                    return Ok(Value::Object(map));
                }
                Some(',') => {
                    self.bump();
                }
                Some(_) => {
                    let key = self.key()?;
                    self.skip_trivia();
                    if self.peek() == Some(':') {
                        self.bump();
                    } else {
                        return Err(self.live(&key));
                    }
                    let value = self.value()?;
                    map.insert(key, value);
                }
                None => return Err(LiteralError::Unterminated),
            }
        }
    }

    fn array(&mut self) -> Result<Value, LiteralError> {
        self.bump(); // '['
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                Some(']') => {
                    self.bump();
                    return Ok(Value::Array(items));
                }
                Some(',') => {
                    self.bump();
                }
                Some(_) => items.push(self.value()?),
                None => return Err(LiteralError::Unterminated),
            }
        }
    }

    fn key(&mut self) -> Result<String, LiteralError> {
        match self.peek() {
            Some('"' | '\'') => self.string(),
            Some(c) if c.is_alphabetic() || c == '_' || c == '$' => Ok(self.word()),
            _ => Err(self.live("")),
        }
    }

    fn string(&mut self) -> Result<String, LiteralError> {
        let Some(quote) = self.peek() else {
            return Err(LiteralError::UnterminatedString);
        };
        self.bump();
        let mut out = String::new();
        loop {
            match self.next_char() {
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.next_char() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(escaped) => out.push(escaped),
                    None => return Err(LiteralError::UnterminatedString),
                },
                // A template string with interpolation is a live expression.
                Some('$') if quote == '`' && self.peek() == Some('{') => {
                    return Err(self.live("${"));
                }
                Some(c) => out.push(c),
                None => return Err(LiteralError::UnterminatedString),
            }
        }
    }

    fn number(&mut self) -> Result<Value, LiteralError> {
        let word = self.word();
        if let Ok(int) = word.parse::<i64>() {
            return Ok(Value::Number(int.into()));
        }
        word.parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| LiteralError::LiveExpression { near: word })
    }

    /// Consume a run of identifier/number characters.
    fn word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || matches!(c, '_' | '$' | '.' | '-' | '+') {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        word
    }

    fn skip_trivia(&mut self) {
        loop {
            while self.peek().is_some_and(char::is_whitespace) {
                self.bump();
            }
            // Line and block comments inside the literal are trivia.
            let mut lookahead = self.chars.clone();
            let Some((_, '/')) = lookahead.next() else {
                return;
            };
            match lookahead.next() {
                Some((_, '/')) => {
                    while self.peek().is_some_and(|c| c != '\n') {
                        self.bump();
                    }
                }
                Some((_, '*')) => {
                    self.bump();
                    self.bump();
                    let mut prev = ' ';
                    while let Some(c) = self.next_char() {
                        if prev == '*' && c == '/' {
                            break;
                        }
                        prev = c;
                    }
                }
                _ => return,
            }
        }
    }

    fn live(&mut self, fallback: &str) -> LiteralError {
        let near = self
            .chars
            .peek()
            .map_or_else(
                || fallback.to_owned(),
                |&(at, _)| {
                    self.input
                        .get(at..)
                        .map(|rest| rest.chars().take(16).collect())
                        .unwrap_or_default()
                },
            );
        LiteralError::LiveExpression { near }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn next_char(&mut self) -> Option<char> {
        self.chars.next().map(|(_, c)| c)
    }

    fn bump(&mut self) {
        self.chars.next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMAIL_TOOL: &str = r#"
import { sendgrid } from "./deps";

/**
 * Sends transactional email.
 *
 * @requires-credential SENDGRID_API_KEY api_key required - SendGrid API key
 * @requires-credential REPLY_TO_ADDRESS none optional - Default reply-to
 */
export const metadata = {
    name: "send-email",
    description: 'Send an email through SendGrid',
    version: "1.2.0",
    schemaVersion: "1.0",
    capabilities: ["email-send"],
    dependencies: {
        "@sendgrid/mail": "^7.7.0",
    },
};

export async function run(input: unknown) {}
"#;

    #[test]
    fn extracts_metadata_object() {
        let value = extract_metadata(EMAIL_TOOL)
            .expect("metadata declaration present")
            .expect("literal decodes");
        assert_eq!(value["name"], "send-email");
        assert_eq!(value["version"], "1.2.0");
        assert_eq!(value["dependencies"]["@sendgrid/mail"], "^7.7.0");
    }

    #[test]
    fn extracts_credential_annotations() {
        let credentials = extract_credential_annotations(EMAIL_TOOL);
        assert_eq!(credentials.len(), 2);
        let first = credentials.first().expect("two annotations");
        assert_eq!(first.name, "SENDGRID_API_KEY");
        assert_eq!(first.credential_type, CredentialType::ApiKey);
        assert!(first.required);
        assert_eq!(first.description, "SendGrid API key");
        let second = credentials.get(1).expect("two annotations");
        assert!(!second.required);
    }

    #[test]
    fn no_metadata_declaration() {
        assert_eq!(extract_metadata("export function helper() {}"), None);
    }

    #[test]
    fn live_expression_is_rejected() {
        let source = "const metadata = { name: process.env.NAME };";
        let result = extract_metadata(source).expect("declaration present");
        assert!(matches!(result, Err(LiteralError::LiveExpression { .. })));
    }

    #[test]
    fn template_interpolation_is_rejected() {
        let source = "const metadata = { name: `tool-${suffix}` };";
        let result = extract_metadata(source).expect("declaration present");
        assert!(matches!(result, Err(LiteralError::LiveExpression { .. })));
    }

    #[test]
    fn tolerates_comments_and_trailing_commas() {
        let source = r#"
const metadata = {
    // identifier keys and comments are fine
    name: "x",
    nested: { a: [1, 2, 3,], b: null, },
};
"#;
        let value = extract_metadata(source)
            .expect("declaration present")
            .expect("literal decodes");
        assert_eq!(value["nested"]["a"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn typed_declaration_is_found() {
        let source = "export const metadata: ToolMetadata = { name: \"t\" };";
        let value = extract_metadata(source)
            .expect("declaration present")
            .expect("literal decodes");
        assert_eq!(value["name"], "t");
    }
}
