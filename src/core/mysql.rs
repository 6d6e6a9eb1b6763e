/// mysqldump / mysql invocation

use anyhow::{Context, Result};
use std::path::Path;

use crate::core::command::{run_checked, CommandOutput, CommandRunner, CommandSpec};
use crate::core::config::{MysqlCredentials, MysqlDumpConfig, MysqlImportConfig};

fn credential_args(spec: CommandSpec, creds: &MysqlCredentials) -> CommandSpec {
    let mut spec = spec;
    if let Some(user) = creds.username.as_deref().filter(|u| !u.is_empty()) {
        spec = spec.arg("-u").arg(user);
    }
    if let Some(host) = creds.host.as_deref().filter(|h| !h.is_empty()) {
        spec = spec.arg(format!("--host={}", host));
    }
    if let Some(port) = creds.port {
        spec = spec.arg(format!("--port={}", port));
    }
    // Kept out of argv so it never shows up in the process list
    if let Some(password) = creds.password.as_deref().filter(|p| !p.is_empty()) {
        spec = spec.env("MYSQL_PWD", password);
    }
    spec
}

pub fn dump_command(conn: &MysqlDumpConfig, out_file: &Path, sudo: bool) -> CommandSpec {
    let spec = credential_args(
        CommandSpec::new("mysqldump").arg("--single-transaction"),
        &conn.credentials,
    );

    let spec = match conn.databases.as_slice() {
        [single] => spec.arg(single.clone()),
        many => spec.arg("--databases").args(many.iter().cloned()),
    };

    spec.args([
        "--events",
        "--triggers",
        "--routines",
        "--default-character-set=utf8",
    ])
    .stdout_file(out_file)
    .sudo(sudo)
}

pub fn import_command(conn: &MysqlImportConfig, sql_file: &Path, sudo: bool) -> CommandSpec {
    let mut spec = credential_args(CommandSpec::new("mysql"), &conn.credentials);
    if let Some(db) = conn.database.as_deref().filter(|d| !d.is_empty()) {
        spec = spec.arg(format!("--database={}", db));
    }
    spec.stdin_file(sql_file).sudo(sudo)
}

/// Dump one connection into `out_file`
pub fn dump(runner: &dyn CommandRunner, conn: &MysqlDumpConfig, out_file: &Path, sudo: bool) -> Result<()> {
    let spec = dump_command(conn, out_file, sudo);
    tracing::info!(databases = ?conn.databases, file = %out_file.display(), "dumping mysql");
    run_checked(runner, &spec).context("mysqldump failed")?;
    Ok(())
}

/// Run the import. The output is returned even on failure so the caller can
/// show it and ask whether to continue.
pub fn import(runner: &dyn CommandRunner, conn: &MysqlImportConfig, sql_file: &Path, sudo: bool) -> Result<CommandOutput> {
    let spec = import_command(conn, sql_file, sudo);
    tracing::info!(command = %spec.display(), "importing sql");
    runner.run(&spec)
}

/// mysql can exit 0 with `ERROR` lines when running with --force
pub fn import_reported_error(output: &CommandOutput) -> bool {
    !output.success || output.combined().contains("ERROR")
}
