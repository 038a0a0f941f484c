mod config_commands;
mod stdio;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    embed_relay_config::{RelayConfig, apply_env_overrides, discover_and_load, load_config},
    tokio::io::BufReader,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(
    name = "embed-relay",
    about = "embed-relay — GraphQL relay for sandboxed embedded widgets",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file to load instead of searching the default locations.
    #[arg(long, short = 'c', global = true, env = "EMBED_RELAY_CONFIG")]
    config: Option<PathBuf>,
    /// Backend HTTP endpoint (overrides config value).
    #[arg(long, global = true)]
    http_url: Option<String>,
    /// Backend WebSocket endpoint (overrides config value).
    #[arg(long, global = true)]
    ws_url: Option<String>,
    /// Element id of the widget frame (overrides config value).
    #[arg(long, global = true)]
    frame_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay widget messages over stdin/stdout (default when no subcommand is provided).
    Serve,
    /// Validate the configuration file and report errors/warnings.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Print the resolved configuration as JSON.
    Config,
}

/// Logs go to stderr; stdout carries the channel.
fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Config file, then `EMBED_RELAY_*` env vars, then command-line flags.
fn resolve_config(cli: &Cli) -> anyhow::Result<RelayConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => discover_and_load(),
    };
    apply_env_overrides(&mut config);
    apply_cli_overrides(cli, &mut config);
    Ok(config)
}

fn apply_cli_overrides(cli: &Cli, config: &mut RelayConfig) {
    if let Some(url) = &cli.http_url {
        config.backend.http_url = url.clone();
    }
    if let Some(url) = &cli.ws_url {
        config.backend.ws_url = url.clone();
    }
    if let Some(id) = &cli.frame_id {
        config.relay.frame_id = id.clone();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "embed-relay starting");

    match &cli.command {
        None | Some(Commands::Serve) => {
            let config = resolve_config(&cli)?;
            stdio::run_host(
                config,
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await
        },
        Some(Commands::Check { verbose }) => config_commands::check(cli.config.as_deref(), *verbose),
        Some(Commands::Config) => config_commands::show(&resolve_config(&cli)?),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embed-relay.toml");
        std::fs::write(
            &path,
            "[relay]\nframe_id = \"from-file\"\n\n[backend]\nhttp_url = \"https://file.example.com/graphql\"\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "embed-relay",
            "--config",
            path.to_str().unwrap(),
            "--frame-id",
            "from-flag",
            "serve",
        ])
        .unwrap();
        let mut config = load_config(cli.config.as_deref().unwrap()).unwrap();
        apply_cli_overrides(&cli, &mut config);

        assert_eq!(config.relay.frame_id, "from-flag");
        assert_eq!(config.backend.http_url, "https://file.example.com/graphql");
        assert!(matches!(cli.command, Some(Commands::Serve)));
    }

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["embed-relay"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }
}
