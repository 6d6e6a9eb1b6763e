/// Scratch directory for dumps, archives and downloads

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Open the workspace, creating the directory on first use
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            tracing::info!(path = %root.display(), "creating temp directory");
            fs::create_dir_all(&root)
                .with_context(|| format!("Could not create {} directory. Check permissions.", root.display()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<name>`, or `<stem>_02.<ext>`, `<stem>_03.<ext>`... when taken
    pub fn unique_file(&self, name: &str) -> PathBuf {
        let base = Path::new(name);
        let file_name = base
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());

        let (stem, ext) = match file_name.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
            _ => (file_name.clone(), None),
        };

        self.first_free(|counter| {
            let mut candidate = stem.clone();
            if let Some(n) = counter {
                candidate.push_str(&format!("_{:02}", n));
            }
            if let Some(ref ext) = ext {
                candidate.push('.');
                candidate.push_str(ext);
            }
            candidate
        })
    }

    /// Like [`Workspace::unique_file`] for a directory name
    pub fn unique_dir(&self, name: &str) -> PathBuf {
        let name = name.trim_matches(|c| c == '/' || c == '\\').to_string();
        self.first_free(|counter| match counter {
            Some(n) => format!("{}_{:02}", name, n),
            None => name.clone(),
        })
    }

    fn first_free(&self, candidate: impl Fn(Option<u32>) -> String) -> PathBuf {
        let first = self.root.join(candidate(None));
        if !first.exists() {
            return first;
        }
        let mut n = 2;
        loop {
            let path = self.root.join(candidate(Some(n)));
            if !path.exists() {
                return path;
            }
            n += 1;
        }
    }
}

/// Remove a file, logging instead of failing
pub fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "temp file could not be deleted");
    }
}
