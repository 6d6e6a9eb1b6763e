/// CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "site-backup")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Config file (default: $SITE_BACKUP_CONFIG or ~/.config/site-backup/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every backup job: dump, zip, upload, verify, clean up
    Backup,

    /// Interactively restore files and a database from a backup
    Restore {
        /// Archive key on S3
        archive: Option<String>,

        /// .sql entry in the zip to import, or SKIP
        sql_entry: Option<String>,

        /// File or directory in the zip to extract, or SKIP
        files_entry: Option<String>,

        /// Where to extract to (must not exist)
        destination: Option<PathBuf>,
    },

    /// List backups on S3 with what the retention policy would do
    List {
        /// Only this job's outputs
        #[arg(short, long)]
        job: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Apply the retention policy without running a backup
    Clean {
        /// Only this job's outputs
        #[arg(short, long)]
        job: Option<String>,

        /// Report what would be deleted without deleting
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Print JSON reports
        #[arg(long)]
        json: bool,
    },

    /// Check that zip, unzip, mysqldump and mysql are installed
    Check,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// View configuration with secrets masked
    Show,

    /// Validate configuration
    Validate,

    /// Write an example configuration file
    Init,

    /// Print the config file path in use
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_restore_positionals() {
        let cli = Cli::parse_from([
            "site-backup",
            "restore",
            "2019-12-04_17-53-45-backup.zip",
            "SKIP",
            "var/www/html",
            "/var/www/html",
        ]);
        match cli.command {
            Commands::Restore {
                archive,
                sql_entry,
                files_entry,
                destination,
            } => {
                assert_eq!(archive.as_deref(), Some("2019-12-04_17-53-45-backup.zip"));
                assert_eq!(sql_entry.as_deref(), Some("SKIP"));
                assert_eq!(files_entry.as_deref(), Some("var/www/html"));
                assert_eq!(destination, Some(PathBuf::from("/var/www/html")));
            }
            _ => panic!("expected restore"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["site-backup", "clean", "-n", "--config", "/etc/site-backup.toml", "-v"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/site-backup.toml")));
        assert!(matches!(cli.command, Commands::Clean { dry_run: true, .. }));
    }
}
