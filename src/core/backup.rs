/// Backup job orchestration
///
/// For each job: dump the MySQL connections, zip them with the configured
/// files, upload the zip to every output, verify the upload against the
/// local MD5 and apply the retention policy to the bucket.

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, NaiveDateTime, Timelike};
use std::path::PathBuf;

use crate::core::archive::create_zip;
use crate::core::checksum::verify_etag;
use crate::core::cleanup::{clean, CleanupReport};
use crate::core::command::CommandRunner;
use crate::core::config::{Config, JobConfig, OutputConfig, S3Output};
use crate::core::mysql;
use crate::core::naming::{backup_file_name, dump_file_name, object_key};
use crate::core::storage::StoreConnector;
use crate::core::workspace::{remove_quietly, Workspace};

#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub store: String,
    pub key: String,
    pub cleanup: Option<CleanupReport>,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: String,
    pub archive_name: String,
    pub archive_size: u64,
    pub uploads: Vec<UploadOutcome>,
}

pub struct BackupRunner<'a> {
    config: &'a Config,
    runner: &'a dyn CommandRunner,
    connector: &'a dyn StoreConnector,
    workspace: Workspace,
    clock: Box<dyn Fn() -> NaiveDateTime + Send + Sync + 'a>,
}

impl<'a> BackupRunner<'a> {
    /// `now` is local time in the configured timezone. Each job's archive
    /// is named after the clock reading taken when the job starts, which is
    /// also the reference point for that job's retention. The clock is fixed
    /// at `now` unless replaced with [`BackupRunner::with_clock`].
    pub fn new(
        config: &'a Config,
        runner: &'a dyn CommandRunner,
        connector: &'a dyn StoreConnector,
        workspace: Workspace,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            config,
            runner,
            connector,
            workspace,
            clock: Box::new(move || now),
        }
    }

    pub fn with_clock(mut self, clock: impl Fn() -> NaiveDateTime + Send + Sync + 'a) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Whole-second clock reading, moved past `previous` so that no two jobs
    /// in a run share an archive name
    fn next_timestamp(&self, previous: Option<NaiveDateTime>) -> NaiveDateTime {
        let reading = (self.clock)();
        let reading = reading.with_nanosecond(0).unwrap_or(reading);
        match previous {
            Some(prev) if reading <= prev => prev + Duration::seconds(1),
            _ => reading,
        }
    }

    pub async fn run(&self) -> Result<Vec<JobOutcome>> {
        if self.config.jobs.is_empty() {
            return Err(anyhow!("no backup jobs configured"));
        }

        // Check every job before creating anything
        for (i, job) in self.config.jobs.iter().enumerate() {
            validate_paths(job).with_context(|| format!("{} is misconfigured", job.label(i)))?;
        }

        let mut outcomes = Vec::new();
        let mut previous = None;
        for (i, job) in self.config.jobs.iter().enumerate() {
            let label = job.label(i);
            let taken_at = self.next_timestamp(previous);
            previous = Some(taken_at);

            tracing::info!(job = %label, "creating backup");
            let outcome = self
                .run_job(&label, job, taken_at)
                .await
                .with_context(|| format!("{} failed", label))?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn run_job(&self, label: &str, job: &JobConfig, taken_at: NaiveDateTime) -> Result<JobOutcome> {
        let zip_path = self.create_archive(job, taken_at)?;
        let archive_name = backup_file_name(taken_at);
        let archive_size = std::fs::metadata(&zip_path).map(|m| m.len()).unwrap_or(0);
        tracing::info!(path = %zip_path.display(), "backup created");

        let mut uploads = Vec::new();
        for output in &job.outputs {
            match output {
                OutputConfig::S3(s3) => {
                    uploads.push(self.upload(&zip_path, &archive_name, s3, taken_at).await?);
                }
            }
        }

        // The zip now lives in every output
        tracing::info!("deleting local copy of the backup");
        remove_quietly(&zip_path);

        Ok(JobOutcome {
            job: label.to_string(),
            archive_name,
            archive_size,
            uploads,
        })
    }

    /// Dump, zip, then drop the dumps. Returns the local zip path.
    fn create_archive(&self, job: &JobConfig, taken_at: NaiveDateTime) -> Result<PathBuf> {
        let mut inputs: Vec<PathBuf> = job.files.clone();
        let mut dumps: Vec<PathBuf> = Vec::new();

        for conn in &job.mysql {
            let dump_path = self.workspace.unique_file(&dump_file_name(taken_at));
            // Claim the name so the next connection gets `_02`
            if let Err(e) = std::fs::File::create(&dump_path) {
                dumps.iter().for_each(|d| remove_quietly(d));
                return Err(e).with_context(|| format!("Failed to create {}", dump_path.display()));
            }
            dumps.push(dump_path.clone());

            if let Err(e) = mysql::dump(self.runner, conn, &dump_path, self.config.use_sudo) {
                dumps.iter().for_each(|d| remove_quietly(d));
                return Err(e);
            }
            inputs.push(dump_path);
        }

        if job.include_config {
            if let Some(ref source) = self.config.source {
                inputs.push(source.clone());
            }
        }

        let zip_path = self.workspace.unique_file(&backup_file_name(taken_at));
        let result = create_zip(self.runner, &zip_path, &inputs);

        // The dumps are inside the zip now (or the zip failed)
        for dump in &dumps {
            remove_quietly(dump);
        }

        result.map(|_| zip_path)
    }

    async fn upload(
        &self,
        zip_path: &std::path::Path,
        archive_name: &str,
        s3: &S3Output,
        taken_at: NaiveDateTime,
    ) -> Result<UploadOutcome> {
        let store = self.connector.connect(s3).await?;
        let key = object_key(s3.prefix.as_deref(), archive_name);

        tracing::info!(store = %store.describe(), key = %key, "uploading backup");
        let etag = store
            .put_file(&key, zip_path)
            .await?
            .ok_or_else(|| anyhow!("Couldn't retrieve ETag of uploaded file {}", key))?;

        tracing::info!("validating upload");
        verify_etag(zip_path, &etag).context("upload to S3 failed")?;
        tracing::info!(key = %key, "file on S3 is valid");

        let cleanup = if s3.cleanup {
            tracing::info!("cleaning up old backups");
            Some(clean(store.as_ref(), s3.prefix.as_deref(), taken_at, false).await?)
        } else {
            None
        };

        Ok(UploadOutcome {
            store: store.describe(),
            key,
            cleanup,
        })
    }
}

/// Every configured file or directory must exist
pub fn validate_paths(job: &JobConfig) -> Result<()> {
    for file in &job.files {
        if !file.exists() {
            return Err(anyhow!("{} file/directory not found.", file.display()));
        }
    }
    if job.files.is_empty() && job.mysql.is_empty() {
        return Err(anyhow!("nothing to back up"));
    }
    if job.outputs.is_empty() {
        return Err(anyhow!("no outputs configured"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::{CommandOutput, MockCommandRunner};
    use crate::core::config::{MysqlDumpConfig, S3Output};
    use crate::core::storage::{MemoryConnector, MemoryStore};
    use std::fs;
    use std::sync::{Arc, Mutex};

    fn now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2019-12-04 17:53:45", "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn s3(cleanup: bool) -> OutputConfig {
        OutputConfig::S3(S3Output {
            region: "ap-southeast-2".to_string(),
            bucket: "test-bucket".to_string(),
            access_key: None,
            secret_key: None,
            endpoint_url: None,
            force_path_style: false,
            prefix: None,
            cleanup,
        })
    }

    fn config_with(job: JobConfig, work_dir: PathBuf) -> Config {
        let mut config = Config::from_toml("").unwrap();
        config.work_dir = Some(work_dir);
        config.jobs = vec![job];
        config
    }

    /// Mock runner that writes fake files for zip and mysqldump
    fn fake_tools(calls: Arc<Mutex<Vec<String>>>) -> MockCommandRunner {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |spec| {
            calls.lock().unwrap().push(spec.program.clone());
            match spec.program.as_str() {
                "mysqldump" => {
                    fs::write(spec.stdout_file.as_ref().unwrap(), "-- dump").unwrap();
                }
                "zip" => {
                    // zip -r -q <zip> <inputs...>
                    let inputs: Vec<String> = spec.args[3..].to_vec();
                    fs::write(&spec.args[2], inputs.join("\n")).unwrap();
                }
                _ => {}
            }
            Ok(CommandOutput::ok(""))
        });
        runner
    }

    #[tokio::test]
    async fn test_backup_uploads_verifies_and_cleans() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("html");
        fs::create_dir_all(&site).unwrap();

        let job = JobConfig {
            name: Some("www".to_string()),
            files: vec![site.clone()],
            include_config: false,
            mysql: vec![
                MysqlDumpConfig {
                    databases: vec!["a".to_string()],
                    ..Default::default()
                },
                MysqlDumpConfig {
                    databases: vec!["b".to_string()],
                    ..Default::default()
                },
            ],
            outputs: vec![s3(true)],
        };
        let work = dir.path().join("temp");
        let config = config_with(job, work.clone());

        let calls = Arc::new(Mutex::new(Vec::new()));
        let runner = fake_tools(calls.clone());
        let connector = MemoryConnector {
            store: Arc::new(MemoryStore::with_objects([
                ("2018-12-01_21-56-17-backup.zip", b"old".to_vec()),
                ("2018-01-01_21-56-17-backup.zip", b"jan".to_vec()),
            ])),
        };

        let ws = Workspace::open(&work).unwrap();
        let outcomes = BackupRunner::new(&config, &runner, &connector, ws, now())
            .run()
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].archive_name, "2019-12-04_17-53-45-backup.zip");
        assert_eq!(*calls.lock().unwrap(), vec!["mysqldump", "mysqldump", "zip"]);

        // Zip contents list the site and both dumps, the second one up-counted
        let body = String::from_utf8(connector.store.get("2019-12-04_17-53-45-backup.zip").unwrap()).unwrap();
        assert!(body.contains(&site.display().to_string()));
        assert!(body.contains("2019-12-04_17-53-45-mysql.sql"));
        assert!(body.contains("2019-12-04_17-53-45-mysql_02.sql"));

        // Retention removed the stale backup, kept Jan 1st and the new one
        assert_eq!(
            connector.store.keys(),
            vec!["2018-01-01_21-56-17-backup.zip", "2019-12-04_17-53-45-backup.zip"]
        );

        // Dumps and local zip are gone
        assert_eq!(fs::read_dir(&work).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_path_fails_before_any_command() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobConfig {
            name: None,
            files: vec![dir.path().join("does-not-exist")],
            include_config: false,
            mysql: vec![],
            outputs: vec![s3(false)],
        };
        let config = config_with(job, dir.path().join("temp"));

        let runner = MockCommandRunner::new();
        let connector = MemoryConnector::default();
        let ws = Workspace::open(dir.path().join("temp")).unwrap();

        let err = BackupRunner::new(&config, &runner, &connector, ws, now())
            .run()
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("file/directory not found"));
        assert!(connector.store.keys().is_empty());
    }

    #[tokio::test]
    async fn test_failed_dump_cleans_up_and_uploads_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobConfig {
            name: None,
            files: vec![],
            include_config: false,
            mysql: vec![MysqlDumpConfig {
                databases: vec!["a".to_string()],
                ..Default::default()
            }],
            outputs: vec![s3(false)],
        };
        let work = dir.path().join("temp");
        let config = config_with(job, work.clone());

        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(CommandOutput::failed(2, "Access denied for user")));
        let connector = MemoryConnector::default();
        let ws = Workspace::open(&work).unwrap();

        let err = BackupRunner::new(&config, &runner, &connector, ws, now())
            .run()
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Access denied"));
        assert!(connector.store.keys().is_empty());
        assert_eq!(fs::read_dir(&work).unwrap().count(), 0);
    }

    fn site_job(name: &str, site: PathBuf) -> JobConfig {
        JobConfig {
            name: Some(name.to_string()),
            files: vec![site],
            include_config: false,
            mysql: vec![],
            outputs: vec![s3(true)],
        }
    }

    #[tokio::test]
    async fn test_jobs_sharing_a_bucket_get_their_own_archive() {
        let dir = tempfile::tempdir().unwrap();
        let site_a = dir.path().join("siteA");
        let site_b = dir.path().join("siteB");
        fs::create_dir_all(&site_a).unwrap();
        fs::create_dir_all(&site_b).unwrap();

        let work = dir.path().join("temp");
        let mut config = config_with(site_job("a", site_a.clone()), work.clone());
        config.jobs.push(site_job("b", site_b.clone()));

        let runner = fake_tools(Arc::new(Mutex::new(Vec::new())));
        let connector = MemoryConnector::default();
        let ws = Workspace::open(&work).unwrap();

        // Both jobs read the same second off the clock
        let outcomes = BackupRunner::new(&config, &runner, &connector, ws, now())
            .run()
            .await
            .unwrap();

        assert_eq!(outcomes[0].archive_name, "2019-12-04_17-53-45-backup.zip");
        assert_eq!(outcomes[1].archive_name, "2019-12-04_17-53-46-backup.zip");
        assert_eq!(
            connector.store.keys(),
            vec!["2019-12-04_17-53-45-backup.zip", "2019-12-04_17-53-46-backup.zip"]
        );

        let first = String::from_utf8(connector.store.get("2019-12-04_17-53-45-backup.zip").unwrap()).unwrap();
        let second = String::from_utf8(connector.store.get("2019-12-04_17-53-46-backup.zip").unwrap()).unwrap();
        assert!(first.contains(&site_a.display().to_string()));
        assert!(!first.contains(&site_b.display().to_string()));
        assert!(second.contains(&site_b.display().to_string()));
        assert!(!second.contains(&site_a.display().to_string()));
    }

    #[tokio::test]
    async fn test_clock_is_read_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("html");
        fs::create_dir_all(&site).unwrap();

        let work = dir.path().join("temp");
        let mut job = site_job("www", site);
        job.mysql = vec![MysqlDumpConfig {
            databases: vec!["a".to_string()],
            ..Default::default()
        }];
        let mut config = config_with(job.clone(), work.clone());
        config.jobs.push(job);

        let runner = fake_tools(Arc::new(Mutex::new(Vec::new())));
        let connector = MemoryConnector::default();
        let ws = Workspace::open(&work).unwrap();

        let ticks = Mutex::new(0i64);
        let outcomes = BackupRunner::new(&config, &runner, &connector, ws, now())
            .with_clock(move || {
                let mut ticks = ticks.lock().unwrap();
                let reading = now() + Duration::seconds(90 * *ticks);
                *ticks += 1;
                reading
            })
            .run()
            .await
            .unwrap();

        assert_eq!(outcomes[0].archive_name, "2019-12-04_17-53-45-backup.zip");
        assert_eq!(outcomes[1].archive_name, "2019-12-04_17-55-15-backup.zip");

        // Each job's dump carries its own timestamp
        let second = String::from_utf8(connector.store.get("2019-12-04_17-55-15-backup.zip").unwrap()).unwrap();
        assert!(second.contains("2019-12-04_17-55-15-mysql.sql"));
        assert!(!second.contains("2019-12-04_17-53-45-mysql.sql"));
    }

    #[tokio::test]
    async fn test_include_config_adds_config_file_to_archive() {
        let dir = tempfile::tempdir().unwrap();
        let site = dir.path().join("html");
        fs::create_dir_all(&site).unwrap();
        let config_file = dir.path().join("config.toml");
        fs::write(&config_file, "timezone = \"UTC\"").unwrap();

        let work = dir.path().join("temp");
        let mut job = site_job("www", site.clone());
        job.include_config = true;
        let mut config = config_with(job, work.clone());
        config.source = Some(config_file.clone());

        let runner = fake_tools(Arc::new(Mutex::new(Vec::new())));
        let connector = MemoryConnector::default();
        let ws = Workspace::open(&work).unwrap();

        BackupRunner::new(&config, &runner, &connector, ws, now())
            .run()
            .await
            .unwrap();

        let body = String::from_utf8(connector.store.get("2019-12-04_17-53-45-backup.zip").unwrap()).unwrap();
        let inputs: Vec<&str> = body.lines().collect();
        assert_eq!(
            inputs,
            vec![site.display().to_string(), config_file.display().to_string()]
        );
    }
}
