//! Configuration validation.
//!
//! Checks a config file for syntax and type errors, flags unknown or
//! misspelled keys, and reports semantic problems with the endpoints and the
//! widget origin.

use std::path::{Path, PathBuf};

use {serde_json::Value, url::Url};

use crate::{
    env_subst::substitute_env,
    loader::{parse_config, parse_config_value},
    schema::RelayConfig,
};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "url", "security", "handshake"
    pub category: &'static str,
    /// Dotted path, e.g. "backend.ws_url"
    pub path: String,
    pub message: String,
}

impl Diagnostic {
    fn new(
        severity: Severity,
        category: &'static str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            category,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Known keys ──────────────────────────────────────────────────────────────

const SECTIONS: &[(&str, &[&str])] = &[
    ("relay", &["frame_id", "widget_origin", "dialect"]),
    ("backend", &["http_url", "ws_url", "ws_protocol", "reconnect"]),
    ("initial", &["operation", "variables", "schema"]),
];

/// Closest candidate within two edits, if any.
fn suggest<'a>(needle: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    candidates
        .into_iter()
        .map(|candidate| (candidate, edit_distance(needle, candidate)))
        .filter(|(_, distance)| *distance > 0 && *distance <= 2)
        .min_by_key(|(_, distance)| *distance)
        .map(|(candidate, _)| candidate)
}

fn edit_distance(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.chars().enumerate() {
        let mut diagonal = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = (diagonal + usize::from(ca != *cb))
                .min(above + 1)
                .min(row[j] + 1);
            diagonal = above;
        }
    }
    row[b.len()]
}

fn check_unknown_fields(tree: &Value, diagnostics: &mut Vec<Diagnostic>) {
    let Some(root) = tree.as_object() else {
        return;
    };

    for (section, value) in root {
        let Some((_, fields)) = SECTIONS.iter().find(|(name, _)| *name == section.as_str()) else {
            let hint = suggest(section, SECTIONS.iter().map(|(name, _)| *name))
                .map(|s| format!(" (did you mean \"{s}\"?)"))
                .unwrap_or_default();
            diagnostics.push(Diagnostic::new(
                Severity::Warning,
                "unknown-field",
                section.clone(),
                format!("unknown section \"{section}\"{hint}"),
            ));
            continue;
        };

        let Some(table) = value.as_object() else {
            continue;
        };
        for key in table.keys() {
            if fields.contains(&key.as_str()) {
                continue;
            }
            let hint = suggest(key, fields.iter().copied())
                .map(|s| format!(" (did you mean \"{s}\"?)"))
                .unwrap_or_default();
            diagnostics.push(Diagnostic::new(
                Severity::Warning,
                "unknown-field",
                format!("{section}.{key}"),
                format!("unknown field \"{key}\"{hint}"),
            ));
        }
    }
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file on disk: syntax, unknown keys, types, semantics.
#[must_use]
pub fn validate_file(path: &Path) -> ValidationResult {
    let mut result = ValidationResult {
        diagnostics: Vec::new(),
        config_path: Some(path.to_path_buf()),
    };

    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => substitute_env(&raw),
        Err(e) => {
            result.diagnostics.push(Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("failed to read config file: {e}"),
            ));
            return result;
        },
    };

    match parse_config_value(&raw, path) {
        Ok(tree) => check_unknown_fields(&tree, &mut result.diagnostics),
        Err(e) => {
            result.diagnostics.push(Diagnostic::new(
                Severity::Error,
                "syntax",
                "",
                format!("syntax error: {e}"),
            ));
            return result;
        },
    }

    match parse_config(&raw, path) {
        Ok(config) => result.diagnostics.extend(validate_config(&config).diagnostics),
        Err(e) => result.diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "",
            format!("type error: {e}"),
        )),
    }

    result
}

/// Semantic checks on an already-parsed config.
#[must_use]
pub fn validate_config(config: &RelayConfig) -> ValidationResult {
    let mut diagnostics = Vec::new();

    if config.relay.frame_id.trim().is_empty() {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "type-error",
            "relay.frame_id",
            "frame_id must not be empty",
        ));
    }

    match Url::parse(&config.relay.widget_origin) {
        Ok(origin) if origin.scheme() != "http" && origin.scheme() != "https" => {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "url",
                "relay.widget_origin",
                format!("unsupported origin scheme \"{}\"", origin.scheme()),
            ));
        },
        Ok(origin) => {
            let has_path = !matches!(origin.path(), "" | "/");
            if has_path || origin.query().is_some() {
                diagnostics.push(Diagnostic::new(
                    Severity::Warning,
                    "url",
                    "relay.widget_origin",
                    "only the scheme, host and port of widget_origin are significant",
                ));
            }
        },
        Err(e) => diagnostics.push(Diagnostic::new(
            Severity::Error,
            "url",
            "relay.widget_origin",
            format!("invalid origin: {e}"),
        )),
    }

    check_endpoint(
        &config.backend.http_url,
        "backend.http_url",
        ("https", "http"),
        &mut diagnostics,
    );
    check_endpoint(
        &config.backend.ws_url,
        "backend.ws_url",
        ("wss", "ws"),
        &mut diagnostics,
    );

    if config.initial.variables.is_some() && config.initial.operation.is_none() {
        diagnostics.push(Diagnostic::new(
            Severity::Warning,
            "type-error",
            "initial.variables",
            "variables are ignored without an initial operation",
        ));
    }
    if config.initial.operation.is_none() {
        diagnostics.push(Diagnostic::new(
            Severity::Info,
            "handshake",
            "initial.operation",
            "not set; ready-for-operation-state handshakes get no reply",
        ));
    }
    if config.initial.schema.is_none() {
        diagnostics.push(Diagnostic::new(
            Severity::Info,
            "handshake",
            "initial.schema",
            "not set; ready-for-schema handshakes get no reply",
        ));
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

/// `schemes` is (secure, plaintext).
fn check_endpoint(
    raw: &str,
    path: &str,
    (secure, plaintext): (&str, &str),
    diagnostics: &mut Vec<Diagnostic>,
) {
    let url = match Url::parse(raw) {
        Ok(url) => url,
        Err(e) => {
            diagnostics.push(Diagnostic::new(
                Severity::Error,
                "url",
                path,
                format!("invalid URL \"{raw}\": {e}"),
            ));
            return;
        },
    };

    if url.scheme() == plaintext {
        let local = matches!(
            url.host_str(),
            Some("localhost" | "127.0.0.1" | "[::1]" | "::1")
        );
        if !local {
            diagnostics.push(Diagnostic::new(
                Severity::Warning,
                "security",
                path,
                format!("caller headers are forwarded over plaintext {plaintext}://"),
            ));
        }
    } else if url.scheme() != secure {
        diagnostics.push(Diagnostic::new(
            Severity::Error,
            "url",
            path,
            format!(
                "unsupported scheme \"{}\" (expected {secure} or {plaintext})",
                url.scheme()
            ),
        ));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn write_config(name: &str, contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn edit_distance_basics() {
        assert_eq!(edit_distance("", "abc"), 3);
        assert_eq!(edit_distance("ws_url", "ws_url"), 0);
        assert_eq!(edit_distance("ws_ulr", "ws_url"), 2);
        assert_eq!(edit_distance("htp_url", "http_url"), 1);
    }

    #[test]
    fn default_config_is_clean() {
        let result = validate_config(&RelayConfig::default());
        assert_eq!(result.count(Severity::Error), 0, "{:?}", result.diagnostics);
        assert_eq!(result.count(Severity::Warning), 0, "{:?}", result.diagnostics);
        assert_eq!(result.count(Severity::Info), 2);
    }

    #[test]
    fn configured_handshakes_have_no_info() {
        let mut config = RelayConfig::default();
        config.initial.operation = Some("{ me { id } }".into());
        config.initial.schema = Some("type Query { me: ID }".into());
        assert!(validate_config(&config).diagnostics.is_empty());
    }

    #[test]
    fn unknown_key_gets_suggestion() {
        let (_dir, path) = write_config("embed-relay.toml", "[backend]\nhtp_url = \"http://localhost\"\n");
        let result = validate_file(&path);

        let diag = result
            .diagnostics
            .iter()
            .find(|d| d.category == "unknown-field")
            .unwrap();
        assert_eq!(diag.path, "backend.htp_url");
        assert!(diag.message.contains("did you mean \"http_url\""));
        assert!(!result.has_errors());
    }

    #[test]
    fn unknown_section_is_warned() {
        let (_dir, path) = write_config("embed-relay.toml", "[relya]\nframe_id = \"x\"\n");
        let result = validate_file(&path);
        assert_eq!(result.count(Severity::Warning), 1);
        assert!(result.diagnostics[0].message.contains("did you mean \"relay\""));
    }

    #[test]
    fn syntax_error_detected() {
        let (_dir, path) = write_config("embed-relay.toml", "[backend\n");
        let result = validate_file(&path);
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].category, "syntax");
    }

    #[test]
    fn type_error_detected() {
        let (_dir, path) = write_config("embed-relay.toml", "[backend]\nreconnect = \"yes\"\n");
        let result = validate_file(&path);
        assert!(result.has_errors());
        assert!(result.diagnostics.iter().any(|d| d.category == "type-error"));
    }

    #[test]
    fn wrong_scheme_is_error() {
        let mut config = RelayConfig::default();
        config.backend.ws_url = "https://api.example.com/graphql".into();
        let result = validate_config(&config);
        assert!(result.has_errors());
        assert_eq!(result.diagnostics[0].path, "backend.ws_url");
    }

    #[test]
    fn plaintext_to_remote_host_is_warned() {
        let mut config = RelayConfig::default();
        config.backend.http_url = "http://api.example.com/graphql".into();
        let result = validate_config(&config);
        assert!(!result.has_errors());
        assert_eq!(result.count(Severity::Warning), 1);
        assert_eq!(result.diagnostics[0].category, "security");
    }

    #[test]
    fn origin_with_path_is_warned() {
        let mut config = RelayConfig::default();
        config.relay.widget_origin =
            "https://explorer.embed.apollographql.com/?graphRef=demo@current".into();
        let result = validate_config(&config);
        assert_eq!(result.count(Severity::Warning), 1);
    }

    #[test]
    fn empty_frame_id_is_error() {
        let mut config = RelayConfig::default();
        config.relay.frame_id = "  ".into();
        assert!(validate_config(&config).has_errors());
    }
}
