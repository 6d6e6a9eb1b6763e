/// Configuration file management
///
/// Stored as TOML, by default in ~/.config/site-backup/config.toml

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::SiteBackupError;
use crate::utils::mask_sensitive;

pub const CONFIG_ENV_VAR: &str = "SITE_BACKUP_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// IANA timezone used for archive names and retention ages
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Scratch directory for dumps, archives and downloads
    #[serde(default)]
    pub work_dir: Option<PathBuf>,

    /// Run mysqldump/mysql through sudo
    #[serde(default)]
    pub use_sudo: bool,

    #[serde(default)]
    pub jobs: Vec<JobConfig>,

    #[serde(default)]
    pub restore: Option<RestoreConfig>,

    /// Path the config was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// One job produces one zip and uploads it to every output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub files: Vec<PathBuf>,

    /// Add the config file itself to the archive
    #[serde(default = "default_true")]
    pub include_config: bool,

    #[serde(default)]
    pub mysql: Vec<MysqlDumpConfig>,

    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

impl JobConfig {
    pub fn label(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("job #{}", index + 1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MysqlCredentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Each connection becomes its own .sql file inside the zip
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MysqlDumpConfig {
    #[serde(flatten)]
    pub credentials: MysqlCredentials,

    /// One database, or several dumped with `--databases`
    #[serde(default)]
    pub databases: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MysqlImportConfig {
    #[serde(flatten)]
    pub credentials: MysqlCredentials,

    /// Default database for the import
    #[serde(default)]
    pub database: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputConfig {
    S3(S3Output),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Output {
    pub region: String,
    pub bucket: String,

    /// Static credentials. When absent the default AWS provider chain is used.
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,

    /// For S3-compatible stores (MinIO, LocalStack, ...)
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,

    /// Key prefix ("folder") the backups live under
    #[serde(default)]
    pub prefix: Option<String>,

    /// Apply the retention policy after each upload
    #[serde(default = "default_true")]
    pub cleanup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    pub s3: S3Output,

    #[serde(default)]
    pub mysql: MysqlImportConfig,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Default config file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("site-backup");
        Ok(config_dir.join("config.toml"))
    }

    /// `--config` flag, then `SITE_BACKUP_CONFIG`, then the default path
    pub fn resolve_path(flag: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = flag {
            return Ok(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.trim().is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        Self::default_path()
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!(
                "config file not found at {}\nCreate one with: site-backup config init",
                path.display()
            ));
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let mut config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.source = Some(path.to_path_buf());

        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        Ok(config)
    }

    /// Write the example configuration, refusing to overwrite
    pub fn write_example(path: &Path) -> Result<()> {
        if path.exists() {
            return Err(anyhow!("{} already exists", path.display()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        fs::write(path, EXAMPLE_CONFIG).context("Failed to write config file")?;
        Ok(())
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| SiteBackupError::InvalidConfig(format!("timezone: {}", e)).into())
    }

    /// Current wall-clock time in the configured timezone
    pub fn now_local(&self) -> Result<NaiveDateTime> {
        let tz = self.tz()?;
        Ok(Utc::now().with_timezone(&tz).naive_local())
    }

    pub fn work_dir(&self) -> Result<PathBuf> {
        match self.work_dir {
            Some(ref dir) => Ok(dir.clone()),
            None => Self::default_work_dir(),
        }
    }

    /// Used when `work_dir` is unset, and for the error log when no config
    /// could be loaded
    pub fn default_work_dir() -> Result<PathBuf> {
        Ok(dirs::data_local_dir()
            .context("Failed to get local data directory")?
            .join("site-backup")
            .join("temp"))
    }

    pub fn restore_config(&self) -> Result<&RestoreConfig> {
        self.restore.as_ref().ok_or_else(|| {
            SiteBackupError::InvalidConfig("no [restore] section configured".to_string()).into()
        })
    }

    /// S3 locations to list or clean: the outputs of the named job, or of
    /// every job. Falls back to the `[restore]` bucket when no job has one.
    pub fn s3_targets(&self, job: Option<&str>) -> Result<Vec<(String, &S3Output)>> {
        let mut targets = Vec::new();
        for (i, j) in self.jobs.iter().enumerate() {
            let label = j.label(i);
            if job.map_or(false, |name| name != label) {
                continue;
            }
            for output in &j.outputs {
                match output {
                    OutputConfig::S3(s3) => targets.push((label.clone(), s3)),
                }
            }
        }

        if let Some(name) = job {
            if targets.is_empty() {
                return Err(anyhow!("no job named {} with S3 outputs", name));
            }
        } else if targets.is_empty() {
            if let Some(ref restore) = self.restore {
                targets.push(("restore".to_string(), &restore.s3));
            }
        }

        if targets.is_empty() {
            return Err(SiteBackupError::InvalidConfig("no S3 outputs configured".to_string()).into());
        }
        Ok(targets)
    }

    /// Validate configuration, returning every problem found
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Err(e) = self.tz() {
            errors.push(e.to_string());
        }

        for (i, job) in self.jobs.iter().enumerate() {
            let label = job.label(i);

            if job.files.is_empty() && job.mysql.is_empty() {
                errors.push(format!("{} has no files and no mysql connections", label));
            }

            if job.outputs.is_empty() {
                errors.push(format!("{} has no outputs", label));
            }

            for (j, conn) in job.mysql.iter().enumerate() {
                if conn.databases.is_empty() {
                    errors.push(format!("{} mysql #{} lists no databases", label, j + 1));
                }
            }

            for output in &job.outputs {
                match output {
                    OutputConfig::S3(s3) => validate_s3(&label, s3, &mut errors),
                }
            }
        }

        if let Some(ref restore) = self.restore {
            validate_s3("restore", &restore.s3, &mut errors);
        }

        if self.jobs.is_empty() && self.restore.is_none() {
            errors.push("no jobs and no [restore] section configured".to_string());
        }

        errors
    }

    /// Copy with every secret masked, for display
    pub fn masked(&self) -> Self {
        let mut copy = self.clone();
        let mask_s3 = |s3: &mut S3Output| {
            s3.secret_key = s3.secret_key.as_deref().map(|s| mask_sensitive(s, 2));
            s3.access_key = s3.access_key.as_deref().map(|s| mask_sensitive(s, 4));
        };
        for job in &mut copy.jobs {
            for conn in &mut job.mysql {
                if conn.credentials.password.is_some() {
                    conn.credentials.password = Some("****".to_string());
                }
            }
            for output in &mut job.outputs {
                match output {
                    OutputConfig::S3(s3) => mask_s3(s3),
                }
            }
        }
        if let Some(ref mut restore) = copy.restore {
            mask_s3(&mut restore.s3);
            if restore.mysql.credentials.password.is_some() {
                restore.mysql.credentials.password = Some("****".to_string());
            }
        }
        copy
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

fn validate_s3(label: &str, s3: &S3Output, errors: &mut Vec<String>) {
    if s3.bucket.trim().is_empty() {
        errors.push(format!("{}: s3 bucket is empty", label));
    }
    if s3.region.trim().is_empty() {
        errors.push(format!("{}: s3 region is empty", label));
    }
    if s3.access_key.is_some() != s3.secret_key.is_some() {
        errors.push(format!(
            "{}: access_key and secret_key must be set together",
            label
        ));
    }
}

pub const EXAMPLE_CONFIG: &str = r#"# site-backup configuration

# Used for archive names and to judge backup ages
timezone = "Europe/London"

# work_dir = "/var/backups/site-backup/temp"
# use_sudo = true

# Each job creates one zip file and uploads it to its outputs
[[jobs]]
name = "www"
files = ["/var/www/html"]

# Each connection gets its own .sql file inside the zip.
# mysqldump can only dump databases it has access to; leave username and
# password unset unless that account can read every database listed.
[[jobs.mysql]]
port = 3306
databases = ["my-database"]

[[jobs.outputs]]
type = "s3"
region = "ap-southeast-2"
bucket = "my-backup-bucket"
# access_key = "AKIA..."
# secret_key = "..."
# prefix = "www"

[restore.s3]
region = "ap-southeast-2"
bucket = "my-backup-bucket"

[restore.mysql]
# username = "root"
# database = "my-database"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_example_config_parses_and_validates() {
        let config = Config::from_toml(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config.timezone, "Europe/London");
        assert_eq!(config.jobs.len(), 1);
        assert_eq!(config.jobs[0].mysql[0].databases, vec!["my-database"]);
        assert!(config.jobs[0].include_config);
        match &config.jobs[0].outputs[0] {
            OutputConfig::S3(s3) => {
                assert_eq!(s3.bucket, "my-backup-bucket");
                assert!(s3.cleanup);
            }
        }
        assert!(config.validate().is_empty(), "{:?}", config.validate());
    }

    #[test]
    fn test_load_records_source() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", EXAMPLE_CONFIG).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.source.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_unknown_output_type_rejected() {
        let toml = r#"
            [[jobs]]
            files = ["/tmp"]
            [[jobs.outputs]]
            type = "ftp"
            region = "x"
            bucket = "y"
        "#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_validate_reports_problems() {
        let toml = r#"
            timezone = "Mars/Olympus"
            [[jobs]]
            name = "empty"
            [[jobs.mysql]]
            username = "root"
            [[jobs.outputs]]
            type = "s3"
            region = ""
            bucket = "b"
            access_key = "AKIA"
        "#;
        let errors = Config::from_toml(toml).unwrap().validate();
        assert!(errors.iter().any(|e| e.contains("timezone")));
        assert!(errors.iter().any(|e| e.contains("mysql #1 lists no databases")));
        assert!(errors.iter().any(|e| e.contains("region is empty")));
        assert!(errors.iter().any(|e| e.contains("must be set together")));
    }

    #[test]
    fn test_masked_hides_secrets() {
        let toml = r#"
            [[jobs]]
            files = ["/tmp"]
            [[jobs.mysql]]
            password = "hunter2"
            databases = ["db"]
            [[jobs.outputs]]
            type = "s3"
            region = "r"
            bucket = "b"
            access_key = "AKIAABCDEFGH"
            secret_key = "supersecretvalue"
        "#;
        let rendered = Config::from_toml(toml).unwrap().masked().to_toml().unwrap();
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("supersecretvalue"));
        assert!(rendered.contains("AKIA...EFGH"));
    }

    #[test]
    fn test_s3_targets() {
        let config = Config::from_toml(EXAMPLE_CONFIG).unwrap();
        let targets = config.s3_targets(None).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, "www");
        assert!(config.s3_targets(Some("www")).is_ok());
        assert!(config.s3_targets(Some("shop")).is_err());

        let restore_only = Config::from_toml(
            "[restore.s3]\nregion = \"r\"\nbucket = \"b\"\n",
        )
        .unwrap();
        assert_eq!(restore_only.s3_targets(None).unwrap()[0].0, "restore");
        assert!(Config::from_toml("").unwrap().s3_targets(None).is_err());
    }

    #[test]
    fn test_now_local_uses_timezone() {
        let config = Config::from_toml("timezone = \"Asia/Tokyo\"").unwrap();
        let tokyo = config.now_local().unwrap();
        let utc = Utc::now().naive_utc();
        let diff = (tokyo - utc).num_minutes();
        assert!((539..=541).contains(&diff), "offset was {} minutes", diff);
    }
}
