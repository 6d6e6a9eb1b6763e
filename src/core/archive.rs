/// zip/unzip wrappers and archive entry selection helpers

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::core::command::{run_checked, CommandRunner, CommandSpec};
use crate::core::workspace::Workspace;

/// How many extraction guesses the restore flow offers
pub const GUESS_LIMIT: usize = 10;

/// An entry the user picked, resolved against the archive listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    File(String),
    /// Stored without the trailing slash
    Dir(String),
}

impl EntryKind {
    pub fn path(&self) -> &str {
        match self {
            EntryKind::File(p) | EntryKind::Dir(p) => p,
        }
    }
}

/// `zip -r <zip_path> <inputs...>`
pub fn create_zip(runner: &dyn CommandRunner, zip_path: &Path, inputs: &[PathBuf]) -> Result<()> {
    if inputs.is_empty() {
        return Err(anyhow!("nothing to back up: no files or dumps to add to the zip"));
    }

    let spec = CommandSpec::new("zip")
        .arg("-r")
        .arg("-q")
        .arg(zip_path.to_string_lossy())
        .args(inputs.iter().map(|p| p.to_string_lossy().to_string()));

    tracing::info!(zip = %zip_path.display(), inputs = inputs.len(), "creating zip");
    run_checked(runner, &spec).context("Error while creating backup zip")?;

    if !zip_path.exists() {
        return Err(anyhow!("zip reported success but {} is missing", zip_path.display()));
    }
    Ok(())
}

/// Every entry name in the archive, in stored order
pub fn list_entries(runner: &dyn CommandRunner, zip_path: &Path) -> Result<Vec<String>> {
    let spec = CommandSpec::new("unzip")
        .arg("-Z1")
        .arg(zip_path.to_string_lossy());
    let output = run_checked(runner, &spec)
        .with_context(|| format!("Failed to list entries of {}", zip_path.display()))?;

    Ok(output
        .stdout
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// unzip treats member names as wildcard patterns
pub fn escape_pattern(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '[' => out.push_str("[[]"),
            '*' => out.push_str("[*]"),
            '?' => out.push_str("[?]"),
            _ => out.push(c),
        }
    }
    out
}

/// Stream a single entry into `destination` (`unzip -p`)
pub fn extract_entry_to(
    runner: &dyn CommandRunner,
    zip_path: &Path,
    entry: &str,
    destination: &Path,
) -> Result<()> {
    let spec = CommandSpec::new("unzip")
        .arg("-p")
        .arg(zip_path.to_string_lossy())
        .arg(escape_pattern(entry))
        .stdout_file(destination);

    run_checked(runner, &spec)
        .with_context(|| format!("Failed to extract {} from {}", entry, zip_path.display()))?;
    Ok(())
}

/// Match user input against the listing. A directory may be named with or
/// without its trailing slash, and need not have its own entry as long as
/// something is stored under it.
pub fn resolve_entry(entries: &[String], input: &str) -> Option<EntryKind> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    let bare = input.trim_end_matches(|c| c == '/' || c == '\\');
    if bare.is_empty() {
        return None;
    }

    if !input.ends_with('/') && entries.iter().any(|e| e == input) {
        return Some(EntryKind::File(input.to_string()));
    }

    let dir_prefix = format!("{}/", bare);
    if entries.iter().any(|e| e.starts_with(&dir_prefix)) {
        return Some(EntryKind::Dir(bare.to_string()));
    }

    None
}

/// Extract `entry` from the archive so that it ends up at `destination`
/// itself, not at `destination/<full/path/in/zip>`.
///
/// unzip cannot re-root a nested path, so the entry is extracted into a
/// fresh directory under the workspace and then moved into place.
pub fn extract_subtree(
    runner: &dyn CommandRunner,
    zip_path: &Path,
    entry: &EntryKind,
    destination: &Path,
    workspace: &Workspace,
) -> Result<()> {
    let staging = workspace.unique_dir("z");
    fs::create_dir_all(&staging)
        .with_context(|| format!("Failed to create {}", staging.display()))?;

    let pattern = match entry {
        EntryKind::Dir(dir) => format!("{}/*", escape_pattern(dir)),
        EntryKind::File(file) => escape_pattern(file),
    };

    let spec = CommandSpec::new("unzip")
        .arg("-q")
        .arg(zip_path.to_string_lossy())
        .arg(pattern)
        .arg("-d")
        .arg(staging.to_string_lossy());

    let result = run_checked(runner, &spec)
        .with_context(|| format!("Failed to extract {} from {}", entry.path(), zip_path.display()))
        .and_then(|_| {
            let extracted = staging.join(entry.path());
            if !extracted.exists() {
                return Err(anyhow!(
                    "unzip finished but {} was not extracted",
                    entry.path()
                ));
            }
            move_into_place(&extracted, destination)
        });

    if let Err(e) = fs::remove_dir_all(&staging) {
        tracing::warn!(path = %staging.display(), error = %e, "could not clean up staging directory");
    }

    result
}

/// Rename, falling back to copy + delete across filesystems
fn move_into_place(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!(error = %e, "rename failed, copying instead");
            copy_tree(from, to)?;
            if from.is_dir() {
                fs::remove_dir_all(from)?;
            } else {
                fs::remove_file(from)?;
            }
            Ok(())
        }
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    if from.is_file() {
        fs::copy(from, to)
            .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
        return Ok(());
    }

    for item in WalkDir::new(from).follow_links(false) {
        let item = item?;
        let relative = item.path().strip_prefix(from)?;
        let target = to.join(relative);
        if item.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(item.path(), &target).with_context(|| {
                format!("Failed to copy {} to {}", item.path().display(), target.display())
            })?;
        }
    }
    Ok(())
}

/// Entries ending in `.sql`, any case
pub fn sql_entries(entries: &[String]) -> Vec<String> {
    entries
        .iter()
        .filter(|e| e.to_ascii_lowercase().ends_with(".sql"))
        .cloned()
        .collect()
}

/// Path components, with files counting one extra so a directory sorts
/// before the files inside it
fn entry_depth(entry: &str) -> usize {
    let parts = entry
        .split(|c| c == '/' || c == '\\')
        .filter(|p| !p.is_empty())
        .count();
    let is_dir = entry.ends_with('/') || entry.ends_with('\\');
    parts + usize::from(!is_dir)
}

/// Entries closest to the archive root first, keeping stored order among
/// equals
pub fn rank_guesses(entries: &[String], limit: usize) -> Vec<String> {
    let mut ranked: Vec<&String> = entries.iter().collect();
    ranked.sort_by_key(|e| entry_depth(e));
    ranked.into_iter().take(limit).cloned().collect()
}
