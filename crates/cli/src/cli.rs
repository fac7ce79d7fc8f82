use crate::tracing::{LogLevel, TracingFormat};
use clap::{Parser, Subcommand};
use miette::{Diagnostic, Report};
use std::path::PathBuf;
use thiserror::Error;

/// Exit codes for the CLI application
pub const EXIT_OK: i32 = 0;
/// CLI or configuration error exit code
pub const EXIT_CLI: i32 = 2;
/// Cache miss exit code
pub const EXIT_MISS: i32 = 1;
/// Cache or I/O failure exit code
pub const EXIT_CACHE: i32 = 3;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "BUILDCACHE_CONFIG";

/// CLI-specific error types with proper exit code mapping
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum CliError {
    /// CLI or configuration error (exit code 2)
    #[error("CLI/configuration error: {message}")]
    #[diagnostic(code(buildcache::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// The requested entry is not in any tier (exit code 1)
    #[error("Cache miss: {message}")]
    #[diagnostic(code(buildcache::cli::miss))]
    Miss {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Cache operation failed (exit code 3)
    #[error("Build cache error: {message}")]
    #[diagnostic(code(buildcache::cli::cache))]
    Cache {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
}

impl CliError {
    /// Create a new configuration error
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new configuration error with help text
    #[must_use]
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Create a new miss error
    #[must_use]
    pub fn miss(message: impl Into<String>) -> Self {
        Self::Miss {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new cache error
    #[must_use]
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            help: None,
        }
    }

    /// Create a new cache error with help text
    #[must_use]
    pub fn cache_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Add help text to an existing error, returning a new error with the help text set.
    #[must_use]
    pub fn with_help(self, help_text: impl Into<String>) -> Self {
        let help = Some(help_text.into());
        match self {
            Self::Config { message, .. } => Self::Config { message, help },
            Self::Miss { message, .. } => Self::Miss { message, help },
            Self::Cache { message, .. } => Self::Cache { message, help },
        }
    }
}

/// Convert `buildcache::Error` to the matching `CliError` variant.
///
/// Configuration and key errors are user input problems (exit code 2),
/// everything else is a cache failure (exit code 3).
impl From<buildcache::Error> for CliError {
    fn from(err: buildcache::Error) -> Self {
        match err {
            // Extract just the message to avoid "Configuration error: Configuration error:"
            buildcache::Error::Configuration { message } => Self::config(message),
            buildcache::Error::InvalidKey { message } => Self::config_with_help(
                format!("invalid cache key: {message}"),
                "Keys are 64 hex characters; pass --key or let put derive one",
            ),
            buildcache::Error::Io {
                source,
                path,
                operation,
            } => {
                let path_str = path
                    .as_ref()
                    .map_or(String::new(), |p| format!(" on {}", p.display()));
                Self::cache_with_help(
                    format!("I/O {operation} failed{path_str}: {source}"),
                    "Check file permissions and ensure the path exists",
                )
            }
            buildcache::Error::LocalCorruption { .. } => Self::cache_with_help(
                err.to_string(),
                "Delete the offending entry from the local cache directory",
            ),
            buildcache::Error::ShutdownTimeout { .. } => Self::cache_with_help(
                err.to_string(),
                "Raise close_timeout_secs or check the remote cache is reachable",
            ),
            _ => Self::cache(err.to_string()),
        }
    }
}

/// Map CLI error to appropriate exit code
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. } => EXIT_CLI,
        CliError::Miss { .. } => EXIT_MISS,
        CliError::Cache { .. } => EXIT_CACHE,
    }
}

/// Render an error to stderr using miette
#[allow(clippy::print_stderr)]
pub fn render_error(err: &CliError) {
    let report = Report::new(err.clone());
    eprintln!("{report:?}");
}

#[derive(Parser, Debug)]
#[command(name = "buildcache")]
#[command(about = "Two-tier content-addressed build cache")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    #[arg(
        short = 'L',
        long,
        global = true,
        default_value = "warn",
        value_enum,
        help = "Set logging level"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-format",
        global = true,
        default_value = "compact",
        value_enum,
        help = "Format of log output on stderr"
    )]
    pub log_format: TracingFormat,

    #[arg(
        short = 'c',
        long,
        global = true,
        env = CONFIG_ENV,
        help = "Path to buildcache.toml (defaults to ./buildcache.toml when present)"
    )]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    #[command(about = "Store a file and print its key")]
    Put {
        #[arg(help = "File to store")]
        file: PathBuf,
        #[arg(long, help = "Key to store under (defaults to the hash of the file)")]
        key: Option<String>,
    },
    #[command(about = "Fetch an entry into a file")]
    Get {
        #[arg(help = "Key to fetch")]
        key: String,
        #[arg(help = "Destination file")]
        out: PathBuf,
    },
    #[command(about = "Report which tiers hold an entry")]
    Contains {
        #[arg(help = "Key to look up")]
        key: String,
    },
    #[command(about = "Show local cache statistics")]
    Stats,
    #[command(about = "Store a directory as an artifact under a key")]
    Pack {
        #[arg(help = "Artifact key (hex, or any string to hash)")]
        key: String,
        #[arg(help = "Directory to pack")]
        dir: PathBuf,
    },
    #[command(about = "Restore an artifact into a directory")]
    Unpack {
        #[arg(help = "Artifact key (hex, or any string to hash)")]
        key: String,
        #[arg(help = "Directory to restore into; its contents are replaced")]
        dir: PathBuf,
    },
}

impl Commands {
    /// Name used for the command span
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Put { .. } => "put",
            Self::Get { .. } => "get",
            Self::Contains { .. } => "contains",
            Self::Stats => "stats",
            Self::Pack { .. } => "pack",
            Self::Unpack { .. } => "unpack",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_put_with_key() {
        let cli = Cli::try_parse_from(["buildcache", "put", "a.bin", "--key", "abc"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Put {
                file: PathBuf::from("a.bin"),
                key: Some("abc".to_string()),
            }
        );
        assert_eq!(cli.level, LogLevel::Warn);
        assert_eq!(cli.log_format, TracingFormat::Compact);
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "buildcache",
            "stats",
            "-L",
            "debug",
            "--log-format",
            "json",
            "--config",
            "cache.toml",
        ])
        .unwrap();
        assert_eq!(cli.command, Commands::Stats);
        assert_eq!(cli.level, LogLevel::Debug);
        assert_eq!(cli.log_format, TracingFormat::Json);
        assert_eq!(cli.config, Some(PathBuf::from("cache.toml")));
    }

    #[test]
    fn unpack_requires_a_directory() {
        assert!(Cli::try_parse_from(["buildcache", "unpack", "key"]).is_err());
    }

    #[test]
    fn exit_codes_by_category() {
        assert_eq!(exit_code_for(&CliError::config("x")), EXIT_CLI);
        assert_eq!(exit_code_for(&CliError::miss("x")), EXIT_MISS);
        assert_eq!(exit_code_for(&CliError::cache("x")), EXIT_CACHE);
    }

    #[test]
    fn configuration_errors_keep_their_message() {
        let err: CliError = buildcache::Error::configuration("bad url").into();
        assert!(matches!(&err, CliError::Config { message, .. } if message == "bad url"));

        let err: CliError = buildcache::Error::invalid_key("too short").into();
        assert_eq!(exit_code_for(&err), EXIT_CLI);

        let err: CliError = buildcache::Error::Closed.into();
        assert_eq!(exit_code_for(&err), EXIT_CACHE);
    }

    #[test]
    fn with_help_replaces_help() {
        let err = CliError::miss("gone").with_help("try again");
        assert!(matches!(err, CliError::Miss { help: Some(h), .. } if h == "try again"));
    }
}
