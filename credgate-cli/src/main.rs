//! Credgate CLI
//!
//! Operator interface for credgate credential and config storage.
//!
//! # Usage
//!
//! ```bash
//! # Show which backend is active
//! credgate status
//!
//! # List credentials (session scope, secrets hidden)
//! credgate list
//!
//! # Export everything, including secrets. The password comes from
//! # CREDGATE_PASSWORD or stdin so it stays out of the process list.
//! CREDGATE_PASSWORD=... credgate export
//! printf '%s\n' "$PANEL_PASSWORD" | credgate --password-stdin export
//!
//! # Store an unrecognized key as secret
//! credgate --password-stdin config set proxy http://user:pw@host --secret
//!
//! # Copy all records from the active backend into PostgreSQL
//! POSTGRES_DSN=postgres://... credgate migrate --to relational
//! ```

mod commands;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use credgate_core::{
    BackendEnv, BackendKind, CredgateConfig, DriverConnector, PasswordEnv, Sensitivity,
};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::commands::App;

#[derive(Parser)]
#[command(name = "credgate")]
#[command(about = "Credential and config storage for a multi-account API gateway")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to credgate.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the File backend directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Panel password; grants elevated scope for this command
    #[arg(long, global = true, env = "CREDGATE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Read the panel password from the first line of stdin
    #[arg(long, global = true, conflicts_with = "password")]
    password_stdin: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the active backend and probe results
    Status,

    /// List credentials
    List,

    /// Export all credentials and config, secrets included
    Export,

    /// Delete a credential
    Delete {
        /// Credential id
        id: String,
    },

    /// Manage config entries
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Copy every record from the active backend into another
    Migrate {
        /// Destination backend (keyvalue, relational, document, file)
        #[arg(long)]
        to: BackendKind,

        /// Directory for a File destination
        #[arg(long)]
        dest_data_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print one entry
    Get { key: String },

    /// Set an entry; the value is parsed as JSON when possible
    Set {
        key: String,
        value: String,

        /// Store as secret even if the key name looks public
        #[arg(long)]
        secret: bool,
    },

    /// Print all visible entries
    List,

    /// Remove an entry
    Delete { key: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => CredgateConfig::load_from(path)?,
        None => CredgateConfig::load()?,
    };
    if let Some(dir) = &cli.data_dir {
        settings.data_dir = dir.clone();
    }

    init_logging(&settings.log_level, cli.verbose);

    let connector =
        Arc::new(DriverConnector::new().with_operation_timeout(settings.operation_timeout()));
    let app = App::start(
        &settings,
        BackendEnv::from_env(&settings.data_dir),
        PasswordEnv::from_env(),
        connector,
    )
    .await?;

    let password = if cli.password_stdin {
        Some(read_password_line(std::io::stdin().lock())?)
    } else {
        cli.password
    };
    let scope = app.scope(password.as_deref()).await?;

    match cli.command {
        Commands::Status => {
            let status = app.status().await?;
            println!("Active backend: {}", status.backend);
            println!("Healthy: {}", status.healthy);
            println!("Probes:");
            for probe in &status.probes {
                println!("  {:<11} {}", probe.backend.to_string(), probe.outcome);
            }
            println!("Credentials: {}", status.credentials);
            for (state, count) in &status.by_status {
                println!("  {state}: {count}");
            }
            println!("By provider:");
            for (provider, counts) in &status.by_provider {
                println!("  {provider}: {} ({} active)", counts.total, counts.active);
            }
        }
        Commands::List => println!("{}", app.list(scope).await?),
        Commands::Export => println!("{}", app.export(scope).await?),
        Commands::Delete { id } => {
            app.delete(&id, scope).await?;
            println!("Deleted credential {id}");
        }
        Commands::Config { command } => match command {
            ConfigCommands::Get { key } => println!("{}", app.config_get(&key, scope).await?),
            ConfigCommands::Set { key, value, secret } => {
                let sensitivity = if secret {
                    Sensitivity::Secret
                } else {
                    Sensitivity::Public
                };
                app.config_set(&key, &value, sensitivity, scope).await?;
                println!("Set {key}");
            }
            ConfigCommands::List => println!("{}", app.config_list(scope).await?),
            ConfigCommands::Delete { key } => {
                app.config_delete(&key, scope).await?;
                println!("Deleted {key}");
            }
        },
        Commands::Migrate { to, dest_data_dir } => {
            let report = app.migrate(to, dest_data_dir).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to render report")?
            );
            if !report.is_complete() {
                anyhow::bail!("{} records failed to migrate", report.failure_count());
            }
        }
    }

    Ok(())
}

/// First line of `input`, without the line ending.
fn read_password_line(mut input: impl BufRead) -> Result<String> {
    let mut line = String::new();
    input
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        bail!("no password on stdin");
    }
    Ok(password.to_string())
}

/// `RUST_LOG` wins; otherwise the configured level, or debug with `--verbose`.
fn init_logging(level: &str, verbose: bool) {
    let default = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_from_stdin_line() {
        let password = read_password_line("s3cret pw\r\nignored\n".as_bytes()).unwrap();
        assert_eq!(password, "s3cret pw");
        assert!(read_password_line("\n".as_bytes()).is_err());
        assert!(read_password_line("".as_bytes()).is_err());
    }

    #[test]
    fn test_password_flag_conflicts_with_stdin() {
        let parsed = Cli::try_parse_from(["credgate", "--password", "x", "--password-stdin", "list"]);
        assert!(parsed.is_err());

        let parsed = Cli::try_parse_from(["credgate", "config", "set", "proxy", "v", "--secret"]).unwrap();
        assert!(matches!(
            parsed.command,
            Commands::Config {
                command: ConfigCommands::Set { secret: true, .. }
            }
        ));
    }
}
