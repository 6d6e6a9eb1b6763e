mod cli;

use anyhow::{Context, Result};
use chrono::{NaiveDateTime, Utc};
use clap::Parser;
use colored::Colorize;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, ConfigCommands};
use site_backup::core::backup::JobOutcome;
use site_backup::core::cleanup::{clean, CleanupReport};
use site_backup::core::command::SystemRunner;
use site_backup::core::prereq::{check_tools, require_tools, Tool, BACKUP_TOOLS, RESTORE_TOOLS};
use site_backup::core::prompt::TerminalPrompt;
use site_backup::core::retention::Action;
use site_backup::core::storage::{S3Connector, S3Store, StoreConnector};
use site_backup::core::workspace::Workspace;
use site_backup::core::{BackupRunner, Config, RestoreArgs, Restorer};
use site_backup::utils::{error_log_path, format_bytes, format_elapsed};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // AWS_* credentials may live in a .env next to the config
    dotenv::dotenv().ok();
    init_logging(cli.verbose);

    let config_flag = cli.config.as_deref();

    match cli.command {
        Commands::Backup => {
            handle_backup(config_flag).await?;
        }
        Commands::Restore {
            archive,
            sql_entry,
            files_entry,
            destination,
        } => {
            let args = RestoreArgs {
                archive,
                sql_entry,
                files_entry,
                destination,
            };
            handle_restore(config_flag, args).await?;
        }
        Commands::List { job, json } => {
            handle_list(config_flag, job, json).await?;
        }
        Commands::Clean { job, dry_run, json } => {
            handle_clean(config_flag, job, dry_run, json).await?;
        }
        Commands::Check => {
            handle_check();
        }
        Commands::Config { command } => {
            handle_config(config_flag, command)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(flag: Option<&Path>) -> Result<Config> {
    let path = Config::resolve_path(flag)?;
    Config::load(&path)
}

async fn handle_backup(config_flag: Option<&Path>) -> Result<()> {
    let started = Instant::now();
    let config = load_config(config_flag);
    // UTC if the config or its timezone is unusable, so the failure still
    // gets a timestamped log
    let now = config
        .as_ref()
        .ok()
        .and_then(|c| c.now_local().ok())
        .unwrap_or_else(|| Utc::now().naive_utc());

    println!("{} {}", "Starting at".bold(), now.format("%Y-%m-%d %H:%M:%S"));

    let work_dir = config
        .as_ref()
        .ok()
        .and_then(|c| c.work_dir().ok())
        .map_or_else(Config::default_work_dir, Ok);

    let result = match config {
        Ok(config) => run_backup(&config, now).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(outcomes) => {
            for outcome in &outcomes {
                print_job_outcome(outcome);
            }
            println!("\n{} Done in {}", "✓".green(), format_elapsed(started.elapsed()));
            Ok(())
        }
        Err(e) => {
            match work_dir.and_then(|dir| write_error_log(&dir, now, &e)) {
                Ok(path) => eprintln!("Error log written to {}", path.display()),
                Err(log_err) => tracing::warn!(error = %log_err, "could not write error log"),
            }
            eprintln!("{} Failed after {}", "✗".red(), format_elapsed(started.elapsed()));
            Err(e)
        }
    }
}

async fn run_backup(config: &Config, now: NaiveDateTime) -> Result<Vec<JobOutcome>> {
    let errors = config.validate();
    if !errors.is_empty() {
        anyhow::bail!("configuration errors:\n  - {}", errors.join("\n  - "));
    }
    let tz = config.tz()?;

    let runner = SystemRunner;
    let needs_mysql = config.jobs.iter().any(|j| !j.mysql.is_empty());
    let tools: Vec<Tool> = BACKUP_TOOLS
        .iter()
        .copied()
        .filter(|t| needs_mysql || *t != Tool::Mysqldump)
        .collect();
    require_tools(&runner, &tools)?;

    let workspace = Workspace::open(config.work_dir()?)?;
    let connector = S3Connector;

    let outcomes = BackupRunner::new(config, &runner, &connector, workspace, now)
        .with_clock(move || Utc::now().with_timezone(&tz).naive_local())
        .run()
        .await;
    outcomes
}

fn print_job_outcome(outcome: &JobOutcome) {
    println!(
        "\n{} {} ({})",
        outcome.job.cyan().bold(),
        outcome.archive_name,
        format_bytes(outcome.archive_size)
    );
    for upload in &outcome.uploads {
        println!("  {} uploaded to {}/{}", "✓".green(), upload.store, upload.key);
        if let Some(ref report) = upload.cleanup {
            println!(
                "    {} backups found, {} deleted",
                report.found,
                report.deleted.len()
            );
        }
    }
}

/// Full error chain to `out-<timestamp>.err.log` beside the work dir
fn write_error_log(work_dir: &Path, started: NaiveDateTime, error: &anyhow::Error) -> Result<PathBuf> {
    let path = error_log_path(work_dir, started);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    fs::write(&path, format!("{:?}\n", error))
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

async fn handle_restore(config_flag: Option<&Path>, args: RestoreArgs) -> Result<()> {
    let config = load_config(config_flag)?;
    let restore = config.restore_config()?;

    let runner = SystemRunner;
    require_tools(&runner, RESTORE_TOOLS)?;

    let workspace = Workspace::open(config.work_dir()?)?;
    let store = S3Store::connect(&restore.s3).await?;
    let mut prompt = TerminalPrompt::stdin();

    let outcome = Restorer::new(&mut prompt, &store, &runner, &workspace, &restore.mysql)
        .with_prefix(restore.s3.prefix.as_deref())
        .with_sudo(config.use_sudo)
        .run(args)
        .await?;

    println!("\n{} Restored from {}", "✓".green(), outcome.archive);
    if let Some(ref sql) = outcome.sql_imported {
        println!("  Imported {}", sql);
    }
    if let Some((ref entry, ref destination)) = outcome.files_restored {
        println!("  Extracted {} to {}", entry, destination.display());
    }

    Ok(())
}

#[derive(Serialize)]
struct TargetReport<'a> {
    job: &'a str,
    bucket: &'a str,
    prefix: Option<&'a str>,
    #[serde(flatten)]
    report: &'a CleanupReport,
}

async fn collect_reports(
    config: &Config,
    job: Option<&str>,
    dry_run: bool,
) -> Result<Vec<(String, String, Option<String>, CleanupReport)>> {
    let now = config.now_local()?;
    let connector = S3Connector;
    let mut reports = Vec::new();

    for (label, s3) in config.s3_targets(job)? {
        let store = connector.connect(s3).await?;
        let report = clean(store.as_ref(), s3.prefix.as_deref(), now, dry_run)
            .await
            .with_context(|| format!("cleanup of s3://{} failed", s3.bucket))?;
        reports.push((label, s3.bucket.clone(), s3.prefix.clone(), report));
    }
    Ok(reports)
}

fn print_json(reports: &[(String, String, Option<String>, CleanupReport)]) -> Result<()> {
    let rows: Vec<TargetReport> = reports
        .iter()
        .map(|(job, bucket, prefix, report)| TargetReport {
            job,
            bucket,
            prefix: prefix.as_deref(),
            report,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);
    Ok(())
}

async fn handle_list(config_flag: Option<&Path>, job: Option<String>, json: bool) -> Result<()> {
    let config = load_config(config_flag)?;
    let reports = collect_reports(&config, job.as_deref(), true).await?;

    if json {
        return print_json(&reports);
    }

    for (label, bucket, _, report) in &reports {
        println!("\n{} s3://{}\n", label.cyan().bold(), bucket);
        println!("{:<50} {:<8} {}", "Backup", "Action", "Reason");
        println!("{}", "-".repeat(100));
        for decision in &report.decisions {
            let action = match decision.action {
                Action::Keep => "keep".green(),
                Action::Delete => "delete".red(),
            };
            println!("{:<50} {:<8} {}", decision.key, action, decision.reason);
        }
        for key in &report.unrecognised {
            println!("{:<50} {:<8} {}", key, "ignore".yellow(), "not a backup file name");
        }
    }

    Ok(())
}

async fn handle_clean(config_flag: Option<&Path>, job: Option<String>, dry_run: bool, json: bool) -> Result<()> {
    let config = load_config(config_flag)?;
    let reports = collect_reports(&config, job.as_deref(), dry_run).await?;

    if json {
        return print_json(&reports);
    }

    for (label, bucket, _, report) in &reports {
        println!("\n{} s3://{}", label.cyan().bold(), bucket);
        println!("  {} backups found", report.found);
        if dry_run {
            for decision in report.planned_deletions() {
                println!("  would delete {} ({})", decision.key, decision.reason);
            }
        } else {
            for key in &report.deleted {
                println!("  {} deleted {}", "✓".green(), key);
            }
            if report.deleted.is_empty() {
                println!("  No old backups to delete");
            }
        }
    }

    Ok(())
}

fn handle_check() {
    let runner = SystemRunner;
    let tools = [Tool::Zip, Tool::Unzip, Tool::Mysqldump, Tool::Mysql];

    println!("External tools\n");
    for status in check_tools(&runner, &tools) {
        if status.available {
            println!(
                "  {} {:<10} {}",
                "✓".green(),
                status.tool.binary(),
                status.version.unwrap_or_default()
            );
        } else {
            println!(
                "  {} {:<10} install with: {}",
                "✗".red(),
                status.tool.binary(),
                status.tool.install_hint()
            );
        }
    }
}

fn handle_config(config_flag: Option<&Path>, command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = load_config(config_flag)?;
            println!("{}", config.masked().to_toml()?);
        }
        ConfigCommands::Validate => {
            let config = load_config(config_flag)?;
            let errors = config.validate();

            if errors.is_empty() {
                println!("{} Configuration is valid", "✓".green());
            } else {
                println!("{} Configuration errors:", "✗".red());
                for error in &errors {
                    println!("  - {}", error);
                }
                anyhow::bail!("{} configuration error(s)", errors.len());
            }
        }
        ConfigCommands::Init => {
            let path = Config::resolve_path(config_flag)?;
            Config::write_example(&path)?;
            println!("{} Example configuration written to {}", "✓".green(), path.display());
        }
        ConfigCommands::Path => {
            println!("{}", Config::resolve_path(config_flag)?.display());
        }
    }

    Ok(())
}
