use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "pubsync")]
#[command(
    author,
    version,
    about = "Synchronize external record sources into canonical publications"
)]
#[command(after_help = "Examples:
  pubsync sync
  pubsync sync --source openzaak
  pubsync sources
  pubsync stats")]
pub struct Config {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    pub database_url: Option<String>,

    /// Path to the sources file (defaults to ~/.config/pubsync/sources.toml)
    #[arg(short, long, env = "PUBSYNC_CONFIG", global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run synchronizations for configured sources
    #[command(after_help = "Examples:
  pubsync sync                       # Sync all enabled sources
  pubsync sync --source openzaak     # Sync one source by name
  pubsync sync --dry-run             # Run against an in-memory store
  pubsync sync --format json         # Print one JSON report per run")]
    Sync {
        /// Sync a specific source by name from the sources file
        #[arg(short, long, value_name = "NAME")]
        source: Option<String>,

        /// Maximum number of partitions synchronized at once
        #[arg(long, default_value = "4")]
        concurrency: usize,

        /// Use an in-memory store instead of PostgreSQL
        #[arg(long)]
        dry_run: bool,

        /// Report output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },
    /// List the sources declared in the sources file
    Sources,
    /// Show store statistics
    Stats,
    /// Apply database migrations
    Migrate,
}

/// Supported report formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable summary
    Text,
    /// One JSON report per line
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sync_with_options() {
        let config = Config::try_parse_from([
            "pubsync",
            "--database-url",
            "postgresql://localhost/pubsync",
            "sync",
            "--source",
            "openzaak",
            "--concurrency",
            "2",
            "--format",
            "json",
        ])
        .unwrap();

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgresql://localhost/pubsync")
        );
        match config.command {
            Command::Sync {
                source,
                concurrency,
                dry_run,
                format,
            } => {
                assert_eq!(source.as_deref(), Some("openzaak"));
                assert_eq!(concurrency, 2);
                assert!(!dry_run);
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("expected sync, got {:?}", other),
        }
    }

    #[test]
    fn test_global_config_after_subcommand() {
        let config =
            Config::try_parse_from(["pubsync", "sources", "--config", "/tmp/sources.toml"]).unwrap();
        assert_eq!(config.config, Some(PathBuf::from("/tmp/sources.toml")));
        assert!(matches!(config.command, Command::Sources));
    }

    #[test]
    fn test_sync_defaults() {
        let config = Config::try_parse_from(["pubsync", "sync", "--dry-run"]).unwrap();
        match config.command {
            Command::Sync {
                source,
                concurrency,
                dry_run,
                format,
            } => {
                assert!(source.is_none());
                assert_eq!(concurrency, 4);
                assert!(dry_run);
                assert_eq!(format, OutputFormat::Text);
            }
            other => panic!("expected sync, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(Config::try_parse_from(["pubsync", "harvest"]).is_err());
    }
}
