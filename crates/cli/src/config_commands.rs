use std::path::Path;

use anyhow::Result;

use embed_relay_config::{
    RelayConfig, find_config_file,
    validate::{self, Severity, ValidationResult},
};

/// ANSI color codes.
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Validate the config file (explicit path, else the discovered one) and
/// print diagnostics. Exits non-zero when there are errors.
pub fn check(path: Option<&Path>, verbose: bool) -> Result<()> {
    let result = match path.map(Path::to_path_buf).or_else(find_config_file) {
        Some(path) => validate::validate_file(&path),
        None => validate::validate_config(&RelayConfig::default()),
    };

    if let Some(ref path) = result.config_path {
        eprintln!("Checking {}\n", path.display());
    } else {
        eprintln!("No config file found; checking defaults.\n");
    }

    for line in render(&result, verbose) {
        eprintln!("{line}");
    }

    if result.has_errors() {
        std::process::exit(1);
    }

    Ok(())
}

/// Print the fully resolved config as JSON on stdout.
pub fn show(config: &RelayConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

fn render(result: &ValidationResult, verbose: bool) -> Vec<String> {
    let mut lines = Vec::new();

    for d in &result.diagnostics {
        if d.severity == Severity::Info && !verbose {
            continue;
        }

        let (color, label) = match d.severity {
            Severity::Error => (RED, "error"),
            Severity::Warning => (YELLOW, "warning"),
            Severity::Info => (CYAN, "info"),
        };

        if d.path.is_empty() {
            lines.push(format!("  {BOLD}{color}{label}{RESET} {}", d.message));
        } else {
            lines.push(format!("  {BOLD}{color}{label}{RESET} {}: {}", d.path, d.message));
        }
    }

    if !lines.is_empty() {
        lines.push(String::new());
    }

    let errors = result.count(Severity::Error);
    let warnings = result.count(Severity::Warning);
    if errors == 0 && warnings == 0 {
        lines.push("No issues found.".into());
    } else {
        lines.push(format!("{errors} error(s), {warnings} warning(s)"));
    }

    lines
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn info_hidden_unless_verbose() {
        let result = validate::validate_config(&RelayConfig::default());

        let quiet = render(&result, false);
        assert_eq!(quiet, vec!["No issues found.".to_string()]);

        let verbose = render(&result, true);
        assert!(verbose.iter().any(|line| line.contains("initial.schema")));
        assert_eq!(verbose.last().map(String::as_str), Some("No issues found."));
    }

    #[test]
    fn counts_errors_and_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embed-relay.toml");
        std::fs::write(
            &path,
            "[backend]\nhttp_url = \"ftp://files.example.com\"\nws_url = \"ws://api.example.com/graphql\"\n",
        )
        .unwrap();

        let lines = render(&validate::validate_file(&path), false);
        assert_eq!(lines.last().map(String::as_str), Some("1 error(s), 1 warning(s)"));
    }
}
