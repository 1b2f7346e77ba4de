//! Script metadata records and the helpers that operate on a single record.

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

/// Comment given to records synthesised for script files that had no metadata.
pub const LOADED_FROM_DIRECTORY: &str = "script loaded from directory";

/// A named script parameter. On a record `value` is the default; in a request it is the
/// override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl Parameter {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Parse a `name=value` pair as given on the command line.
    pub fn parse_pair(pair: &str) -> AppResult<Self> {
        match pair.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                Ok(Self::new(name.trim(), value))
            }
            _ => Err(AppError::invalid(
                "parameter",
                format!("expected name=value, got '{}'", pair),
            )),
        }
    }
}

/// Provenance of a script imported from a remote catalog.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    #[serde(default)]
    pub catalog: String,
    #[serde(default)]
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<DateTime<Utc>>,
}

/// Persisted metadata describing a named, parameterized script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRecord {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub restricted_to_privileged_users: bool,
    #[serde(default)]
    pub only_controller_node: bool,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    /// Loaded lazily from the content store, never persisted with the record.
    #[serde(skip)]
    pub body: Option<String>,
}

fn default_true() -> bool {
    true
}

impl ScriptRecord {
    /// A fresh, available, unrestricted record whose display name is its id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            comment: String::new(),
            parameters: Vec::new(),
            restricted_to_privileged_users: false,
            only_controller_node: false,
            available: true,
            origin: None,
            body: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn restricted(mut self, restricted: bool) -> Self {
        self.restricted_to_privileged_users = restricted;
        self
    }

    pub fn controller_only(mut self, only_controller: bool) -> Self {
        self.only_controller_node = only_controller;
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Check the invariants a record must satisfy before it may enter the registry.
    pub fn validate(&self) -> AppResult<()> {
        if self.id.trim().is_empty() {
            return Err(AppError::invalid("id", "must not be blank"));
        }

        let mut seen = HashSet::new();
        for param in &self.parameters {
            if param.name.trim().is_empty() {
                return Err(AppError::invalid(
                    "parameters",
                    format!("blank parameter name in script '{}'", self.id),
                ));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(AppError::invalid(
                    "parameters",
                    format!("duplicate parameter '{}' in script '{}'", param.name, self.id),
                ));
            }
        }
        Ok(())
    }

    /// Merge an incoming update over this stored record.
    ///
    /// Text fields (display name, comment, origin fields) keep the stored value when the
    /// incoming one is blank. Flags and parameters always take the incoming value.
    pub fn merged_with(&self, incoming: &ScriptRecord) -> ScriptRecord {
        ScriptRecord {
            id: incoming.id.clone(),
            display_name: choose(&incoming.display_name, &self.display_name),
            comment: choose(&incoming.comment, &self.comment),
            parameters: incoming.parameters.clone(),
            restricted_to_privileged_users: incoming.restricted_to_privileged_users,
            only_controller_node: incoming.only_controller_node,
            available: incoming.available,
            origin: merge_origin(self.origin.as_ref(), incoming.origin.as_ref()),
            body: None,
        }
    }

    /// Copy of this record describing a script whose body has gone missing.
    pub fn as_unavailable(&self) -> ScriptRecord {
        ScriptRecord {
            available: false,
            restricted_to_privileged_users: false,
            only_controller_node: false,
            body: None,
            ..self.clone()
        }
    }
}

fn choose(preferred: &str, fallback: &str) -> String {
    if preferred.trim().is_empty() {
        fallback.to_string()
    } else {
        preferred.to_string()
    }
}

fn merge_origin(stored: Option<&Origin>, incoming: Option<&Origin>) -> Option<Origin> {
    match (stored, incoming) {
        (None, None) => None,
        (Some(old), None) => Some(old.clone()),
        (None, Some(new)) => Some(new.clone()),
        (Some(old), Some(new)) => Some(Origin {
            catalog: choose(&new.catalog, &old.catalog),
            source_id: choose(&new.source_id, &old.source_id),
            imported_at: new.imported_at.or(old.imported_at),
        }),
    }
}

/// Metadata header embedded in a script body between `BEGIN META` and `END META`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ScriptMeta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub parameters: Vec<String>,
}

fn meta_pattern() -> Option<&'static Regex> {
    static META: OnceLock<Option<Regex>> = OnceLock::new();
    META.get_or_init(|| Regex::new(r"(?s)BEGIN META(.+?)END META").ok())
        .as_ref()
}

impl ScriptMeta {
    /// Extract the header from a script body. Returns `None` when there is no header or
    /// its content is not valid JSON.
    pub fn extract(body: &str) -> Option<ScriptMeta> {
        let captures = meta_pattern()?.captures(body)?;
        let json = captures.get(1)?.as_str().trim();
        match serde_json::from_str::<ScriptMeta>(json) {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!("Ignoring malformed script meta header: {}", e);
                None
            }
        }
    }

    /// Record for a script file found in storage, described by this header.
    pub fn into_record(self, id: &str) -> ScriptRecord {
        let parameters = self
            .parameters
            .into_iter()
            .map(|name| Parameter::new(name, ""))
            .collect();
        ScriptRecord::new(id)
            .with_display_name(self.name.unwrap_or_else(|| id.to_string()))
            .with_comment(
                self.comment
                    .unwrap_or_else(|| LOADED_FROM_DIRECTORY.to_string()),
            )
            .with_parameters(parameters)
    }
}

/// Turn a user-supplied name into a script id that is safe to use as a file name.
///
/// Spaces become underscores and the extension is appended when missing; for imported
/// scripts the catalog name is inserted before the extension so ids from different catalogs
/// cannot collide. Path separators, parent references and absolute paths are rejected.
pub fn sanitize_script_id(name: &str, catalog: Option<&str>, extension: &str) -> AppResult<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid("id", "must not be blank"));
    }

    let suffix = format!(".{}", extension);
    let mut id = trimmed.to_string();
    if !id.ends_with(&suffix) {
        if let Some(catalog) = catalog.filter(|c| !c.trim().is_empty()) {
            id.push('.');
            id.push_str(catalog.trim());
        }
        id.push_str(&suffix);
    }
    let id = id.replace(' ', "_");

    if id.contains('/') || id.contains('\\') || id.contains(':') || id.contains("..") {
        warn!("Folder traversal detected, file name received: {}", name);
        return Err(AppError::invalid("id", format!("invalid file path: {}", name)));
    }

    debug!("Set script file name to: {}", id);
    Ok(id)
}
