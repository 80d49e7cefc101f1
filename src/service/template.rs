//! SQL template validation and expansion.
//!
//! Validation is a lexical allow-list: comments are stripped and the leading
//! token is checked against the configured prefixes. It accepts any
//! statement beginning with an allowed keyword and is deliberately not a
//! parser. Expansion is a textual substitution pass with a blunt injection
//! guard; the [`TemplateExpander`] trait isolates it so a binding-based
//! implementation can replace it without touching the executor.

use crate::error::BisubError;
use serde_json::Value;
use std::collections::HashMap;

/// Placeholder tokens are word runs ending in this suffix.
const PLACEHOLDER_SUFFIX: &str = "_replace";

/// Substrings that reject a variable value outright.
const FORBIDDEN_FRAGMENTS: [&str; 3] = ["'", ";", "--"];

/// Expands a stored template with caller variables.
pub trait TemplateExpander: Send + Sync {
    fn expand(
        &self,
        template: &str,
        variables: &HashMap<String, Value>,
    ) -> Result<String, BisubError>;
}

/// The textual pass: every `<identifier>_replace` token is replaced by the
/// stringified variable value after the injection-fragment check.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextualExpander;

impl TemplateExpander for TextualExpander {
    fn expand(
        &self,
        template: &str,
        variables: &HashMap<String, Value>,
    ) -> Result<String, BisubError> {
        let mut result = template.to_string();

        for token in placeholder_tokens(template) {
            let value = variables
                .get(&token)
                .ok_or_else(|| BisubError::MissingVariable { name: token.clone() })?;

            let rendered = stringify(value);
            if FORBIDDEN_FRAGMENTS.iter().any(|f| rendered.contains(f)) {
                return Err(BisubError::UnsafeVariable { name: token });
            }

            result = result.replace(&token, &rendered);
        }

        Ok(result)
    }
}

/// Checks the statement's leading keyword against `allowed`, ignoring case
/// and comments. Fails with the permitted set on no match.
pub fn validate_statement(sql: &str, allowed: &[String]) -> Result<(), BisubError> {
    let cleaned = strip_comments(sql);
    let cleaned = cleaned.trim().to_uppercase();

    if allowed
        .iter()
        .any(|prefix| cleaned.starts_with(&prefix.to_uppercase()))
    {
        return Ok(());
    }

    Err(BisubError::DisallowedStatement {
        allowed: allowed.to_vec(),
    })
}

/// Removes `-- ...` line comments and `/* ... */` block comments.
fn strip_comments(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
        } else if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i += 2;
            while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                i += 1;
            }
            i = (i + 2).min(bytes.len());
        } else {
            // Comment openers are ASCII, so byte scanning never splits a
            // UTF-8 sequence here; copy the full character.
            let ch = sql[i..].chars().next().unwrap_or('\0');
            out.push(ch);
            i += ch.len_utf8();
        }
    }

    out
}

/// Collects each distinct placeholder token, in order of first appearance.
fn placeholder_tokens(template: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();

    let mut flush = |word: &mut String, tokens: &mut Vec<String>| {
        if word.len() > PLACEHOLDER_SUFFIX.len()
            && word.ends_with(PLACEHOLDER_SUFFIX)
            && !tokens.contains(word)
        {
            tokens.push(word.clone());
        }
        word.clear();
    };

    for ch in template.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            word.push(ch);
        } else {
            flush(&mut word, &mut tokens);
        }
    }
    flush(&mut word, &mut tokens);

    tokens
}

/// Renders a variable value the way it is spliced into SQL: strings without
/// surrounding quotes, every other JSON value via its literal form.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn expands_all_occurrences_of_a_token() {
        let expanded = TextualExpander
            .expand(
                "SELECT * FROM t WHERE a = id_replace OR b = id_replace",
                &vars(&[("id_replace", json!("5"))]),
            )
            .unwrap();
        assert_eq!(expanded, "SELECT * FROM t WHERE a = 5 OR b = 5");
    }

    #[test]
    fn expands_numeric_and_string_values() {
        let expanded = TextualExpander
            .expand(
                "SELECT * FROM t WHERE id = id_replace AND name = name_replace",
                &vars(&[("id_replace", json!(5)), ("name_replace", json!("alice"))]),
            )
            .unwrap();
        assert_eq!(expanded, "SELECT * FROM t WHERE id = 5 AND name = alice");
    }

    #[test]
    fn missing_variable_names_the_token() {
        let err = TextualExpander
            .expand("SELECT * FROM t WHERE id = id_replace", &vars(&[]))
            .unwrap_err();
        match err {
            BisubError::MissingVariable { name } => assert_eq!(name, "id_replace"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn injection_fragments_are_rejected() {
        for bad in ["5 OR 1=1; --", "x'y", "a;b", "c--d"] {
            let err = TextualExpander
                .expand(
                    "SELECT * FROM t WHERE id = id_replace",
                    &vars(&[("id_replace", json!(bad))]),
                )
                .unwrap_err();
            match err {
                BisubError::UnsafeVariable { name } => assert_eq!(name, "id_replace"),
                other => panic!("unexpected error for {bad:?}: {other}"),
            }
        }
    }

    #[test]
    fn clean_value_is_accepted() {
        let expanded = TextualExpander
            .expand(
                "SELECT * FROM t WHERE id = id_replace",
                &vars(&[("id_replace", json!("5"))]),
            )
            .unwrap();
        assert_eq!(expanded, "SELECT * FROM t WHERE id = 5");
    }

    #[test]
    fn template_without_placeholders_passes_through() {
        let expanded = TextualExpander
            .expand("SELECT 1", &vars(&[("unused_replace", json!("x"))]))
            .unwrap();
        assert_eq!(expanded, "SELECT 1");
    }

    #[test]
    fn validate_accepts_allowed_prefix_case_insensitively() {
        let allowed = vec!["SELECT".to_string(), "WITH".to_string()];
        assert!(validate_statement("select * from t", &allowed).is_ok());
        assert!(validate_statement("  WITH x AS (SELECT 1) SELECT * FROM x", &allowed).is_ok());
    }

    #[test]
    fn validate_strips_comments_before_checking() {
        let allowed = vec!["SELECT".to_string()];
        assert!(
            validate_statement("-- report header\nSELECT * FROM t", &allowed).is_ok()
        );
        assert!(
            validate_statement("/* multi\nline */ SELECT * FROM t", &allowed).is_ok()
        );
    }

    #[test]
    fn validate_rejects_disallowed_statement_with_permitted_set() {
        let allowed = vec!["SELECT".to_string(), "WITH".to_string()];
        let err = validate_statement("DELETE FROM t", &allowed).unwrap_err();
        match err {
            BisubError::DisallowedStatement { allowed: set } => {
                assert_eq!(set, vec!["SELECT".to_string(), "WITH".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn comment_hidden_statement_is_still_rejected() {
        let allowed = vec!["SELECT".to_string()];
        assert!(validate_statement("/* SELECT */ DROP TABLE t", &allowed).is_err());
    }
}
