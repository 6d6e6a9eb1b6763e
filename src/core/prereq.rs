/// External tool checks

use anyhow::Result;

use crate::core::command::{CommandRunner, CommandSpec};
use crate::core::error::SiteBackupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    Zip,
    Unzip,
    Mysqldump,
    Mysql,
}

impl Tool {
    pub fn binary(&self) -> &'static str {
        match self {
            Tool::Zip => "zip",
            Tool::Unzip => "unzip",
            Tool::Mysqldump => "mysqldump",
            Tool::Mysql => "mysql",
        }
    }

    fn probe(&self) -> CommandSpec {
        match self {
            Tool::Zip | Tool::Unzip => CommandSpec::new(self.binary()).arg("-v"),
            Tool::Mysqldump | Tool::Mysql => CommandSpec::new(self.binary()).arg("--version"),
        }
    }

    pub fn install_hint(&self) -> &'static str {
        match self {
            Tool::Zip => "sudo apt install zip",
            Tool::Unzip => "sudo apt install unzip",
            Tool::Mysqldump | Tool::Mysql => "sudo apt install mysql-client",
        }
    }
}

/// Tools needed to create backups
pub const BACKUP_TOOLS: &[Tool] = &[Tool::Zip, Tool::Mysqldump];
/// Tools needed to restore
pub const RESTORE_TOOLS: &[Tool] = &[Tool::Unzip, Tool::Mysql];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolStatus {
    pub tool: Tool,
    pub available: bool,
    pub version: Option<String>,
}

pub fn check_tools(runner: &dyn CommandRunner, tools: &[Tool]) -> Vec<ToolStatus> {
    tools
        .iter()
        .map(|&tool| match runner.run(&tool.probe()) {
            Ok(output) if output.success => ToolStatus {
                tool,
                available: true,
                version: output.combined().lines().find(|l| !l.trim().is_empty()).map(|l| l.trim().to_string()),
            },
            Ok(_) | Err(_) => ToolStatus {
                tool,
                available: false,
                version: None,
            },
        })
        .collect()
}

/// Fail with the list of missing tools, if any
pub fn require_tools(runner: &dyn CommandRunner, tools: &[Tool]) -> Result<()> {
    let missing: Vec<String> = check_tools(runner, tools)
        .into_iter()
        .filter(|s| !s.available)
        .map(|s| format!("{} (install with: {})", s.tool.binary(), s.tool.install_hint()))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(SiteBackupError::MissingTools(missing).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::{CommandOutput, MockCommandRunner};

    #[test]
    fn test_missing_tool_reported() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|spec| {
            if spec.program == "zip" {
                Ok(CommandOutput::ok("Copyright (c) 1990-2008 Info-ZIP\nThis is Zip 3.0"))
            } else {
                Err(anyhow::anyhow!("No such file or directory"))
            }
        });

        let statuses = check_tools(&runner, BACKUP_TOOLS);
        assert!(statuses[0].available);
        assert_eq!(statuses[0].version.as_deref(), Some("Copyright (c) 1990-2008 Info-ZIP"));
        assert!(!statuses[1].available);

        let err = require_tools(&runner, BACKUP_TOOLS).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("mysqldump"), "{}", message);
        assert!(!message.contains("zip (install"), "{}", message);
    }
}
