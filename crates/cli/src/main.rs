mod auth_commands;

use std::path::PathBuf;

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    keyward_config::KeywardConfig,
    keyward_oauth::{ApiRequest, Session},
    tracing::{debug, info},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "keyward", about = "Keyward: OAuth2 credentials for API clients")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./keyward.toml or ~/.config/keyward/).
    #[arg(long, global = true, env = "KEYWARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Session login, status, refresh and logout.
    Auth {
        #[command(subcommand)]
        action: auth_commands::AuthAction,
    },
    /// GET a URL with the session's credentials and print the body.
    Get { url: String },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr)
                    .with_ansi(true),
            )
            .init();
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<KeywardConfig> {
    match path {
        Some(path) => keyward_config::load_config(path)
            .with_context(|| format!("failed to load {}", path.display())),
        None => Ok(keyward_config::discover_and_load()),
    }
}

async fn get(session: &Session, url: &str) -> anyhow::Result<()> {
    let request = ApiRequest::get(url).with_context(|| format!("invalid URL: {url}"))?;
    let response = session.execute(request).await?;
    debug!(status = %response.status, "response received");
    if !response.status.is_success() {
        anyhow::bail!("{url} returned {}", response.status);
    }
    println!("{}", response.text());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "keyward starting");

    let config = load_config(cli.config.as_ref())?;
    let session = Session::from_config(&config)?;

    match cli.command {
        Commands::Auth { action } => auth_commands::handle_auth(&session, action).await,
        Commands::Get { url } => get(&session, &url).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_auth_login_with_redirect() {
        let cli = Cli::parse_from([
            "keyward",
            "--log-level",
            "debug",
            "auth",
            "login",
            "--redirect",
            "keyward://oauth?code=abc",
        ]);
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(
            cli.command,
            Commands::Auth {
                action: auth_commands::AuthAction::Login { redirect: Some(ref r) }
            } if r == "keyward://oauth?code=abc"
        ));
    }

    #[test]
    fn explicit_config_path_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyward.toml");
        std::fs::write(&path, "[oauth]\nclient_id = \"app\"\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.oauth.client_id.as_deref(), Some("app"));

        assert!(load_config(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
