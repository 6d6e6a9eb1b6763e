/// External command execution
///
/// Every subprocess (zip, unzip, mysqldump, mysql) goes through
/// [`CommandRunner`] so the orchestration code can be exercised with a mock.

use anyhow::Result;
use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::core::error::SiteBackupError;

/// A fully described invocation. Arguments are passed verbatim, no shell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin_file: Option<PathBuf>,
    pub stdout_file: Option<PathBuf>,
    pub sudo: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    pub fn sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    /// Printable form for logs. Environment values are never shown.
    pub fn display(&self) -> String {
        let mut parts = Vec::new();
        if self.sudo {
            parts.push("sudo".to_string());
        }
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        let mut line = parts.join(" ");
        if let Some(ref input) = self.stdin_file {
            line.push_str(&format!(" < {}", input.display()));
        }
        if let Some(ref output) = self.stdout_file {
            line.push_str(&format!(" > {}", output.display()));
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// stdout followed by stderr, trimmed
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is reported through
    /// [`CommandOutput::success`], not as an `Err`.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Turn a non-zero exit into [`SiteBackupError::Subprocess`]
pub fn ensure_success(spec: &CommandSpec, output: CommandOutput) -> Result<CommandOutput> {
    if output.success {
        return Ok(output);
    }
    let status = output
        .code
        .map(|c| format!("exit code {}", c))
        .unwrap_or_else(|| "a signal".to_string());
    Err(SiteBackupError::Subprocess {
        program: spec.program.clone(),
        status,
        output: output.combined(),
    }
    .into())
}

/// Run and require a zero exit status
pub fn run_checked(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput> {
    let output = runner.run(spec)?;
    ensure_success(spec, output)
}

/// Runs commands on the host with `std::process::Command`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    fn build(spec: &CommandSpec) -> Command {
        let mut command = if spec.sudo {
            let mut c = Command::new("sudo");
            if !spec.env.is_empty() {
                let names: Vec<&str> = spec.env.iter().map(|(k, _)| k.as_str()).collect();
                c.arg(format!("--preserve-env={}", names.join(",")));
            }
            c.arg(&spec.program);
            c
        } else {
            Command::new(&spec.program)
        };
        command.args(&spec.args);
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        command
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut command = Self::build(spec);

        match spec.stdin_file {
            Some(ref path) => {
                command.stdin(Stdio::from(File::open(path).map_err(|source| {
                    SiteBackupError::Spawn {
                        program: spec.program.clone(),
                        source,
                    }
                })?));
            }
            None => {
                command.stdin(Stdio::null());
            }
        }

        if let Some(ref path) = spec.stdout_file {
            command.stdout(Stdio::from(File::create(path).map_err(|source| {
                SiteBackupError::Spawn {
                    program: spec.program.clone(),
                    source,
                }
            })?));
        }

        tracing::debug!(command = %spec.display(), "running");

        let output = command.output().map_err(|source| SiteBackupError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_hides_env_values() {
        let spec = CommandSpec::new("mysqldump")
            .arg("--single-transaction")
            .env("MYSQL_PWD", "hunter2")
            .stdout_file("/tmp/out.sql")
            .sudo(true);

        let line = spec.display();
        assert_eq!(line, "sudo mysqldump --single-transaction > /tmp/out.sql");
        assert!(!line.contains("hunter2"));
    }

    #[test]
    fn test_ensure_success_maps_exit_code() {
        let spec = CommandSpec::new("zip");
        let err = ensure_success(&spec, CommandOutput::failed(12, "nothing to do"))
            .unwrap_err();

        match err.downcast_ref::<SiteBackupError>() {
            Some(SiteBackupError::Subprocess { program, status, output }) => {
                assert_eq!(program, "zip");
                assert_eq!(status, "exit code 12");
                assert_eq!(output, "nothing to do");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_combined_output() {
        let output = CommandOutput {
            success: true,
            code: Some(0),
            stdout: "a\n".to_string(),
            stderr: "b\n".to_string(),
        };
        assert_eq!(output.combined(), "a\nb");
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_redirects_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("echo.txt");
        let spec = CommandSpec::new("echo").arg("hello").stdout_file(&out);

        let output = SystemRunner.run(&spec).unwrap();
        assert!(output.success);
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "hello");
    }
}
