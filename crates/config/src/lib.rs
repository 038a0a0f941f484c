//! Configuration loading, env substitution and validation for the relay host.
//!
//! Config files: `embed-relay.toml`, `embed-relay.yaml` or `embed-relay.json`,
//! searched in `./` then `~/.config/embed-relay/`.
//!
//! Supports `${ENV_VAR}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{apply_env_overrides, config_dir, discover_and_load, find_config_file, load_config},
    schema::{BackendConfig, ChannelConfig, InitialPayload, RelayConfig, WsProtocol},
    validate::{Diagnostic, Severity, ValidationResult, validate_config, validate_file},
};
