//! `{{ prefix:name }}` placeholder resolution
//!
//! Used for target addresses, header mappings and source enforcement. A
//! template resolves completely or not at all.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use thiserror::Error;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{\s*([a-z]+):([A-Za-z0-9_.\-]+)\s*\}\}").expect("valid placeholder regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
    #[error("Unknown placeholder '{0}'")]
    Unknown(String),
    #[error("Placeholder '{0}' has no value")]
    Unresolved(String),
}

/// Values placeholders may resolve against
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderContext<'a> {
    pub headers: Option<&'a BTreeMap<String, String>>,
    /// `namespace:name`
    pub entity_id: Option<&'a str>,
    pub source_address: Option<&'a str>,
    pub topic: Option<&'a str>,
}

impl<'a> PlaceholderContext<'a> {
    pub fn with_headers(mut self, headers: &'a BTreeMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_entity_id(mut self, entity_id: Option<&'a str>) -> Self {
        self.entity_id = entity_id;
        self
    }

    pub fn with_source_address(mut self, address: &'a str) -> Self {
        self.source_address = Some(address);
        self
    }

    pub fn with_topic(mut self, topic: &'a str) -> Self {
        self.topic = Some(topic);
        self
    }

    fn lookup(&self, prefix: &str, name: &str) -> Result<Option<String>, PlaceholderError> {
        let value = match (prefix, name) {
            ("header", header) => self
                .headers
                .and_then(|h| h.get(header).or_else(|| find_ignore_case(h, header)))
                .cloned(),
            ("entity", "id") => self.entity_id.map(str::to_string),
            ("entity", "namespace") => self
                .entity_id
                .and_then(|id| id.split_once(':'))
                .map(|(ns, _)| ns.to_string()),
            ("entity", "name") => self
                .entity_id
                .and_then(|id| id.split_once(':'))
                .map(|(_, name)| name.to_string()),
            ("source", "address") => self.source_address.map(str::to_string),
            ("topic", "action") => self
                .topic
                .and_then(|t| t.rsplit('/').next())
                .filter(|a| !a.is_empty())
                .map(str::to_string),
            _ => return Err(PlaceholderError::Unknown(format!("{prefix}:{name}"))),
        };
        Ok(value)
    }
}

fn find_ignore_case<'h>(headers: &'h BTreeMap<String, String>, name: &str) -> Option<&'h String> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v)
}

pub fn contains_placeholders(template: &str) -> bool {
    PLACEHOLDER.is_match(template)
}

/// Resolve every placeholder in `template`
pub fn resolve(template: &str, ctx: &PlaceholderContext<'_>) -> Result<String, PlaceholderError> {
    let mut failure = None;
    let resolved = PLACEHOLDER.replace_all(template, |caps: &Captures<'_>| {
        let (prefix, name) = (&caps[1], &caps[2]);
        match ctx.lookup(prefix, name) {
            Ok(Some(value)) => value,
            Ok(None) => {
                failure.get_or_insert(PlaceholderError::Unresolved(format!("{prefix}:{name}")));
                String::new()
            }
            Err(e) => {
                failure.get_or_insert(e);
                String::new()
            }
        }
    });

    match failure {
        Some(e) => Err(e),
        None => Ok(resolved.into_owned()),
    }
}

/// Apply a header mapping; entries whose template does not resolve are skipped
pub fn apply_header_mapping(
    mapping: &BTreeMap<String, String>,
    ctx: &PlaceholderContext<'_>,
) -> BTreeMap<String, String> {
    mapping
        .iter()
        .filter_map(|(name, template)| {
            resolve(template, ctx)
                .ok()
                .map(|value| (name.clone(), value))
        })
        .collect()
}
