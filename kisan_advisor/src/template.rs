//! `{name}` placeholder templates over session state.
//!
//! Substitution is by exact name. A referenced name that is absent is an
//! error, never an empty string. JSON braces such as `{ "disease": ... }` are
//! left alone because a placeholder must be a bare identifier.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid placeholder regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    source: String,
    keys: Vec<String>,
}

impl Template {
    pub fn parse(source: impl Into<String>) -> Self {
        let source = source.into();
        let mut keys: Vec<String> = Vec::new();
        for cap in PLACEHOLDER.captures_iter(&source) {
            let key = cap[1].to_string();
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Self { source, keys }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Distinct referenced names, in first-appearance order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Render against `state`; `Err(key)` names the first missing value.
    pub fn render(&self, state: &HashMap<String, String>) -> Result<String, String> {
        if let Some(missing) = self.keys.iter().find(|k| !state.contains_key(k.as_str())) {
            return Err(missing.clone());
        }
        Ok(PLACEHOLDER
            .replace_all(&self.source, |cap: &regex::Captures| {
                state.get(&cap[1]).cloned().unwrap_or_default()
            })
            .into_owned())
    }
}
