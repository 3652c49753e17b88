//! Command-line arguments of `qhub`.

use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use qhub_domain::{EngineKind, PersistenceKind};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "qhub")]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(arg_required_else_help = true)]
#[command(about = "Inspect and maintain quota-managed storage")]
pub(crate) struct Cli {
    /// Configuration file (TOML, YAML or JSON). `QHUB__` environment variables override it.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Storage root, overriding `quota.storage_dir`.
    #[arg(short, long, global = true)]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create the repositories and load usage
    Init {},
    /// Measure every origin on disk
    Usage {
        /// Include internal origins
        #[arg(short, long)]
        all: bool,
    },
    /// Measure one origin across all repositories
    OriginUsage {
        /// Origin such as `https://example.com` or `https://example.com^userContextId=1`
        origin: String,
    },
    /// Show group usage against its ceiling
    Estimate { origin: String },
    /// Remove stored data
    Clear(ClearArgs),
    /// Exempt an origin of the default repository from eviction
    Persist { origin: String },
    /// Evict least recently used temporary storage
    Evict {
        /// Minimum number of bytes to free
        bytes: u64,
    },
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("target").required(true).multiple(false)))]
pub(crate) struct ClearArgs {
    /// Clear one origin
    #[arg(long, group = "target")]
    pub origin: Option<String>,

    /// Clear every origin starting with this prefix
    #[arg(long, group = "target")]
    pub prefix: Option<String>,

    /// Clear the private repository
    #[arg(long, group = "target")]
    pub private: bool,

    /// Clear everything
    #[arg(long, group = "target")]
    pub all: bool,

    /// Restrict `--origin` to one repository
    #[arg(long, value_enum, requires = "origin")]
    pub persistence: Option<Repository>,

    /// Restrict `--origin` to one engine
    #[arg(long, value_enum, requires = "origin")]
    pub engine: Option<Engine>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum Repository {
    Persistent,
    Temporary,
    Default,
    Private,
}

impl From<Repository> for PersistenceKind {
    fn from(repository: Repository) -> Self {
        match repository {
            Repository::Persistent => Self::Persistent,
            Repository::Temporary => Self::Temporary,
            Repository::Default => Self::Default,
            Repository::Private => Self::Private,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum Engine {
    Document,
    Kv,
    Cache,
    Blob,
}

impl From<Engine> for EngineKind {
    fn from(engine: Engine) -> Self {
        match engine {
            Engine::Document => Self::Document,
            Engine::Kv => Self::KeyValue,
            Engine::Cache => Self::Cache,
            Engine::Blob => Self::Blob,
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
    fn clear_takes_exactly_one_target() {
        assert!(Cli::try_parse_from(["qhub", "clear"]).is_err());
        assert!(Cli::try_parse_from(["qhub", "clear", "--all", "--private"]).is_err());
        assert!(Cli::try_parse_from(["qhub", "clear", "--all", "--engine", "kv"]).is_err());

        let cli = Cli::try_parse_from(["qhub", "clear", "--origin", "https://a.com", "--engine", "kv"])
            .expect("valid");
        let Command::Clear(args) = cli.command else {
            panic!("expected clear");
        };
        assert_eq!(args.origin.as_deref(), Some("https://a.com"));
        assert!(matches!(args.engine, Some(Engine::Kv)));
    }
}
