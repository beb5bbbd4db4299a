//! Command line interface.
//!
//! Commands are organized into:
//!
//! - Instance lifecycle (top-level commands, including bulk `create-from-config`)
//! - Content packages (`systems ...`)
//! - Worlds and their backups (`worlds ...`)
//! - Settings (`set-base-dir`, `set-credentials`)

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::{InstanceManager, Settings};
use crate::persistence::Database;
use crate::runtime::DockerCli;

pub mod instances;
pub mod systems;
pub mod worlds;

/// fim - Manage isolated, container-backed Foundry VTT instances
#[derive(Debug, Parser)]
#[command(name = "fim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Metadata database file
    #[arg(long, global = true, env = "FIM_DATABASE")]
    pub database: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "table")]
    pub format: OutputFormat,

    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Create a new instance (does not start it)
    Create(instances::CreateArgs),

    /// Create every instance defined in a JSON config file
    CreateFromConfig(instances::CreateFromConfigArgs),

    /// List all instances with their live status
    #[command(alias = "ls")]
    List,

    /// Start an instance
    Start(instances::NameArgs),

    /// Stop an instance
    Stop(instances::NameArgs),

    /// Delete an instance, its container and its directory tree
    #[command(alias = "rm")]
    Delete(instances::DeleteArgs),

    /// Show one instance with its live status
    Status(instances::NameArgs),

    /// Move an instance to another application version
    Migrate(instances::MigrateArgs),

    /// Show lifecycle events of an instance
    History(instances::NameArgs),

    /// Set the directory holding all instances and the shared area
    SetBaseDir(instances::SetBaseDirArgs),

    /// Set the account used to download the application
    SetCredentials(instances::SetCredentialsArgs),

    /// Manage content packages of an instance
    #[command(subcommand)]
    Systems(systems::SystemsCommands),

    /// Manage worlds and world backups of an instance
    #[command(subcommand)]
    Worlds(worlds::WorldsCommands),
}

/// Everything a command needs, loaded once per invocation
pub struct Session {
    pub database: Arc<Database>,
    pub settings: Settings,
    pub format: OutputFormat,
}

impl Session {
    /// Open the metadata store and read the settings record
    pub fn open(database: Option<&Path>, format: OutputFormat) -> Result<Self> {
        let path = match database {
            Some(path) => path.to_path_buf(),
            None => Database::default_path()?,
        };
        let db = Database::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        db.initialize()?;

        let settings = db.load_settings()?.unwrap_or_default();
        match db.cleanup_history(settings.history_retention_days) {
            Ok(0) => {}
            Ok(n) => debug!("Pruned {} history entries", n),
            Err(e) => warn!("Failed to prune history: {}", e),
        }

        Ok(Self {
            database: Arc::new(db),
            settings,
            format,
        })
    }

    pub fn instances(&self) -> InstanceManager {
        InstanceManager::new(
            self.database.clone(),
            Arc::new(DockerCli::new(&self.settings.docker_binary)),
            self.settings.clone(),
        )
    }

    /// Print `value` as JSON when requested, otherwise run `table`
    pub fn render<T: Serialize>(&self, value: &T, table: impl FnOnce(&T)) -> Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Table => table(value),
        }
        Ok(())
    }
}

/// Run a parsed command line
pub fn execute(cli: Cli) -> Result<()> {
    let session = Session::open(cli.database.as_deref(), cli.format)?;
    match cli.command {
        Commands::Create(args) => instances::execute_create(&session, args),
        Commands::CreateFromConfig(args) => instances::execute_create_from_config(&session, args),
        Commands::List => instances::execute_list(&session),
        Commands::Start(args) => instances::execute_start(&session, args),
        Commands::Stop(args) => instances::execute_stop(&session, args),
        Commands::Delete(args) => instances::execute_delete(&session, args),
        Commands::Status(args) => instances::execute_status(&session, args),
        Commands::Migrate(args) => instances::execute_migrate(&session, args),
        Commands::History(args) => instances::execute_history(&session, args),
        Commands::SetBaseDir(args) => instances::execute_set_base_dir(&session, args),
        Commands::SetCredentials(args) => instances::execute_set_credentials(&session, args),
        Commands::Systems(cmd) => systems::execute(&session, cmd),
        Commands::Worlds(cmd) => worlds::execute(&session, cmd),
    }
}

/// Human-readable byte count
pub(crate) fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_create_with_options() {
        let cli = Cli::try_parse_from([
            "fim",
            "create",
            "alpha",
            "--version",
            "13.0",
            "--port",
            "30000",
            "--admin-key",
            "k",
            "--proxy-port",
            "30443",
            "--env",
            "TZ=UTC",
            "--image",
            "registry.local/foundry:dev",
        ])
        .unwrap();
        match cli.command {
            Commands::Create(args) => {
                assert_eq!(args.name, "alpha");
                assert_eq!(args.version, "13.0");
                assert_eq!(args.port, 30000);
                assert_eq!(args.proxy_port, Some(30443));
                assert_eq!(args.env, vec![("TZ".to_string(), "UTC".to_string())]);
                assert_eq!(args.image.as_deref(), Some("registry.local/foundry:dev"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn create_requires_version_and_port() {
        assert!(Cli::try_parse_from(["fim", "create", "alpha", "--port", "1"]).is_err());
        assert!(Cli::try_parse_from(["fim", "create", "alpha", "--version", "13"]).is_err());
    }

    #[test]
    fn nested_world_commands_parse() {
        let cli = Cli::try_parse_from([
            "fim",
            "--format",
            "json",
            "worlds",
            "create-world",
            "alpha",
            "w1",
            "dnd5e",
            "--description",
            "Campaign",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::Worlds(worlds::WorldsCommands::CreateWorld(_))
        ));
    }

    #[test]
    fn create_from_config_takes_a_file() {
        let cli = Cli::try_parse_from(["fim", "create-from-config", "fim.json"]).unwrap();
        match cli.command {
            Commands::CreateFromConfig(args) => assert_eq!(args.file, PathBuf::from("fim.json")),
            other => panic!("unexpected command {:?}", other),
        }
        assert!(Cli::try_parse_from(["fim", "create-from-config"]).is_err());
    }

    #[test]
    fn delete_force_flag() {
        let cli = Cli::try_parse_from(["fim", "delete", "alpha", "--force"]).unwrap();
        match cli.command {
            Commands::Delete(args) => assert!(args.force),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
