/// Interactive restore
///
/// Walks the user through picking an archive on S3, importing one of its
/// `.sql` dumps and extracting a directory (or single file) from it to a
/// destination on disk. Each step can be pre-answered from the command
/// line; the literal `SKIP` skips the optional steps.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

use crate::core::archive::{
    extract_entry_to, extract_subtree, list_entries, rank_guesses, resolve_entry, sql_entries,
    EntryKind, GUESS_LIMIT,
};
use crate::core::checksum::verify_etag;
use crate::core::command::{run_checked, CommandRunner, CommandSpec};
use crate::core::config::MysqlImportConfig;
use crate::core::error::SiteBackupError;
use crate::core::mysql;
use crate::core::prompt::Prompt;
use crate::core::storage::ObjectStore;
use crate::core::workspace::{remove_quietly, Workspace};
use crate::utils::format_bytes;

pub const SKIP: &str = "SKIP";

/// Pre-answers from the command line, in prompt order
#[derive(Debug, Clone, Default)]
pub struct RestoreArgs {
    pub archive: Option<String>,
    pub sql_entry: Option<String>,
    pub files_entry: Option<String>,
    pub destination: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub archive: String,
    pub sql_imported: Option<String>,
    pub files_restored: Option<(String, PathBuf)>,
}

/// Free bytes on the filesystem holding `path`, if it can be determined
pub type SpaceProbe = fn(&Path) -> Option<u64>;

pub struct Restorer<'a> {
    prompt: &'a mut dyn Prompt,
    store: &'a dyn ObjectStore,
    runner: &'a dyn CommandRunner,
    workspace: &'a Workspace,
    mysql: &'a MysqlImportConfig,
    prefix: Option<String>,
    sudo: bool,
    free_space: SpaceProbe,
}

impl<'a> Restorer<'a> {
    pub fn new(
        prompt: &'a mut dyn Prompt,
        store: &'a dyn ObjectStore,
        runner: &'a dyn CommandRunner,
        workspace: &'a Workspace,
        mysql: &'a MysqlImportConfig,
    ) -> Self {
        Self {
            prompt,
            store,
            runner,
            workspace,
            mysql,
            prefix: None,
            sudo: false,
            free_space: available_space,
        }
    }

    /// Only offer archives under this key prefix
    pub fn with_prefix(mut self, prefix: Option<&str>) -> Self {
        self.prefix = prefix
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(|p| format!("{}/", p));
        self
    }

    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn with_space_probe(mut self, probe: SpaceProbe) -> Self {
        self.free_space = probe;
        self
    }

    pub async fn run(&mut self, args: RestoreArgs) -> Result<RestoreOutcome> {
        let archive = self.select_archive(args.archive).await?;
        let zip_path = self.download(&archive).await?;

        let entries = list_entries(self.runner, &zip_path)?;

        let sql_imported = self.import_sql(&zip_path, &entries, args.sql_entry)?;

        let files_restored = match self.select_files_entry(&entries, args.files_entry)? {
            Some(entry) => {
                let destination = self.select_destination(args.destination)?;
                self.prompt.say(&format!(
                    "Extracting `{}` to `{}`, this may take a while...",
                    entry.path(),
                    destination.display()
                ));
                extract_subtree(self.runner, &zip_path, &entry, &destination, self.workspace)?;
                self.prompt.say("Files successfully extracted");
                Some((entry.path().to_string(), destination))
            }
            None => {
                self.prompt.say("SKIPPED");
                None
            }
        };

        self.prompt.say(&format!("Deleting `{}`", zip_path.display()));
        remove_quietly(&zip_path);

        self.prompt.say("Restore finished. Remember to set up file permissions.");

        Ok(RestoreOutcome {
            archive,
            sql_imported,
            files_restored,
        })
    }

    async fn select_archive(&mut self, preset: Option<String>) -> Result<String> {
        let keys = self.store.list_keys(self.prefix.as_deref()).await?;

        self.prompt.say("*********** S3 download ***********");
        if keys.is_empty() {
            return Err(anyhow!("no files found in {}", self.store.describe()));
        }
        self.prompt
            .say(&format!("Files in {}:", self.store.describe()));
        for key in &keys {
            self.prompt.say(&format!(" • {}", key));
        }

        if let Some(selected) = preset {
            if keys.contains(&selected) {
                return Ok(selected);
            }
            self.prompt.say(&format!("{} is invalid, try again.", selected));
        }

        loop {
            let selected = self.prompt.ask("Enter one of the file names: ")?;
            if keys.contains(&selected) {
                return Ok(selected);
            }
            self.prompt.say(&format!("{} is invalid, try again.", selected));
        }
    }

    async fn download(&mut self, key: &str) -> Result<PathBuf> {
        let info = self.store.head(key).await?;
        self.prompt
            .say(&format!("S3 file '{}' is {}", key, format_bytes(info.size)));

        match (self.free_space)(self.workspace.root()) {
            Some(available) => {
                self.prompt
                    .say(&format!("You have {} free disk space", format_bytes(available)));
                if available < info.size {
                    return Err(SiteBackupError::InsufficientSpace {
                        needed: info.size,
                        available,
                    }
                    .into());
                }
            }
            None => {
                tracing::warn!(path = %self.workspace.root().display(), "could not determine free disk space");
            }
        }

        let local = self.workspace.unique_file(key);
        self.prompt
            .say(&format!("Downloading to {}", local.display()));
        self.store.download(key, &local).await?;

        let etag = info
            .etag
            .ok_or_else(|| anyhow!("S3 did not report an ETag for {}", key))?;
        if let Err(e) = verify_etag(&local, &etag) {
            remove_quietly(&local);
            return Err(e).context("downloaded file is corrupt");
        }
        self.prompt.say("Download validated");

        Ok(local)
    }

    fn import_sql(
        &mut self,
        zip_path: &Path,
        entries: &[String],
        preset: Option<String>,
    ) -> Result<Option<String>> {
        self.prompt.say("*********** MySQL import ***********");

        let candidates = sql_entries(entries);
        let entry = match self.pick_sql_entry(entries, &candidates, preset)? {
            Some(entry) => entry,
            None => {
                self.prompt.say("SKIPPED");
                return Ok(None);
            }
        };

        let sql_path = self.workspace.unique_file(&entry);
        self.prompt
            .say(&format!("Extracting {} to {}", entry, sql_path.display()));
        if let Err(e) = extract_entry_to(self.runner, zip_path, &entry, &sql_path) {
            remove_quietly(&sql_path);
            return Err(e);
        }

        let result = self.run_import(&sql_path);
        self.prompt
            .say(&format!("Deleting {}", sql_path.display()));
        remove_quietly(&sql_path);
        result?;

        self.prompt.say("SQL file imported into the database.");
        Ok(Some(entry))
    }

    fn pick_sql_entry(
        &mut self,
        entries: &[String],
        candidates: &[String],
        preset: Option<String>,
    ) -> Result<Option<String>> {
        if let Some(selected) = preset {
            if selected == SKIP {
                return Ok(None);
            }
            if entries.contains(&selected) {
                return Ok(Some(selected));
            }
            self.prompt.say(&format!(
                "ERROR: '{}' was passed as an argument, but it doesn't exist in the zip.",
                selected
            ));
        }

        if candidates.is_empty() {
            self.prompt.say("No .sql files found");
        } else {
            self.prompt.say("Here are all .sql files in the zip:");
            for candidate in candidates {
                self.prompt.say(&format!(" • {}", candidate));
            }
        }

        loop {
            let selected = self
                .prompt
                .ask("Enter path to the .sql file (in the zip file) OR type \"SKIP\" (no quotes): ")?;
            if selected == SKIP {
                return Ok(None);
            }
            if entries.contains(&selected) {
                return Ok(Some(selected));
            }
            self.prompt.say("Invalid path, try again.");
        }
    }

    fn run_import(&mut self, sql_path: &Path) -> Result<()> {
        self.prompt.say("Importing the sql file into the database.");
        let output = mysql::import(self.runner, self.mysql, sql_path, self.sudo)?;

        if mysql::import_reported_error(&output) {
            self.prompt.say(&output.combined());
            self.prompt.say("It looks like there was an error.");
            if !self.prompt.confirm("Continue anyway?")? {
                return Err(SiteBackupError::Aborted.into());
            }
        }
        Ok(())
    }

    fn select_files_entry(&mut self, entries: &[String], preset: Option<String>) -> Result<Option<EntryKind>> {
        self.prompt.say("*********** Extract files ***********");

        if let Some(selected) = preset {
            if selected == SKIP {
                return Ok(None);
            }
            if let Some(entry) = resolve_entry(entries, &selected) {
                return Ok(Some(entry));
            }
            self.prompt.say(&format!(
                "ERROR: '{}' was passed as an argument, but it doesn't exist in the zip.",
                selected
            ));
        }

        let guesses = rank_guesses(entries, GUESS_LIMIT);
        if !guesses.is_empty() {
            self.prompt
                .say("A few guesses at the path you want to extract:");
            for guess in &guesses {
                self.prompt.say(&format!(" • {}", guess));
            }
        }

        loop {
            let selected = self
                .prompt
                .ask("Enter a path within the zip file to extract OR type \"SKIP\" (no quotes): ")?;
            if selected == SKIP {
                return Ok(None);
            }
            if let Some(entry) = resolve_entry(entries, &selected) {
                return Ok(Some(entry));
            }
            self.prompt.say("Invalid path, try again.");
        }
    }

    fn select_destination(&mut self, preset: Option<PathBuf>) -> Result<PathBuf> {
        if let Some(path) = preset {
            if !path.exists() {
                return Ok(path);
            }
            self.prompt
                .say(&format!("{} already exists, try again.", path.display()));
        }

        loop {
            let answer = self
                .prompt
                .ask("Enter a destination path you want to extract to eg /var/www/html: ")?;
            if answer.is_empty() {
                self.prompt.say("Try again.");
                continue;
            }
            let path = PathBuf::from(answer);
            if !path.exists() {
                return Ok(path);
            }

            if !self.prompt.confirm("This path already exists, override?")? {
                self.prompt.say("Try again.");
                continue;
            }

            self.prompt.say(&format!("Deleting `{}`", path.display()));
            if let Err(e) = self.remove_destination(&path) {
                self.prompt.say(&format!("ERROR: {:#}. Try again.", e));
                continue;
            }
            if path.exists() {
                self.prompt.say("ERROR could not delete it. Try again.");
                continue;
            }
            return Ok(path);
        }
    }

    fn remove_destination(&self, path: &Path) -> Result<()> {
        check_removable(path, self.workspace.root())?;

        if self.sudo {
            let spec = CommandSpec::new("rm")
                .arg("-r")
                .arg(path.to_string_lossy())
                .sudo(true);
            run_checked(self.runner, &spec)?;
            return Ok(());
        }

        let removed = if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        removed.with_context(|| format!("Failed to delete {}", path.display()))
    }
}

/// Refuse the filesystem root, the workspace, and anything containing it
pub fn check_removable(path: &Path, workspace: &Path) -> Result<()> {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let workspace = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());

    if target.parent().is_none() || workspace.starts_with(&target) {
        return Err(SiteBackupError::UnsafeRemoval(path.to_path_buf()).into());
    }
    Ok(())
}

/// Free space on the disk whose mount point is the longest prefix of `path`
pub fn available_space(path: &Path) -> Option<u64> {
    let path = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}
