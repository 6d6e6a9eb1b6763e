/// Remove old backups from a store according to the retention policy

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::Serialize;

use crate::core::naming::parse_listing;
use crate::core::retention::{classify, Decision};
use crate::core::storage::ObjectStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    /// Recognised backups found on the store
    pub found: usize,
    pub unrecognised: Vec<String>,
    pub decisions: Vec<Decision>,
    /// Keys actually deleted (empty on a dry run)
    pub deleted: Vec<String>,
}

impl CleanupReport {
    pub fn planned_deletions(&self) -> impl Iterator<Item = &Decision> {
        self.decisions.iter().filter(|d| d.is_delete())
    }
}

pub async fn clean(
    store: &dyn ObjectStore,
    prefix: Option<&str>,
    now: NaiveDateTime,
    dry_run: bool,
) -> Result<CleanupReport> {
    let list_prefix = prefix
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .map(|p| format!("{}/", p));

    let keys = store.list_keys(list_prefix.as_deref()).await?;
    let (entries, unrecognised) = parse_listing(&keys, prefix);

    tracing::info!(store = %store.describe(), backups = entries.len(), "found backups");
    for key in &unrecognised {
        tracing::warn!(key = %key, "unrecognised file in bucket, leaving it alone");
    }

    let decisions = classify(now, &entries);
    let to_delete: Vec<String> = decisions
        .iter()
        .filter(|d| d.is_delete())
        .map(|d| d.key.clone())
        .collect();

    for decision in decisions.iter().filter(|d| d.is_delete()) {
        tracing::debug!(key = %decision.key, reason = %decision.reason, "marked for deletion");
    }

    let mut report = CleanupReport {
        found: entries.len(),
        unrecognised,
        decisions,
        deleted: Vec::new(),
    };

    if to_delete.is_empty() {
        tracing::info!("no old backups found");
        return Ok(report);
    }

    if dry_run {
        tracing::info!(count = to_delete.len(), "dry run, not deleting old backups");
        return Ok(report);
    }

    tracing::info!(count = to_delete.len(), "deleting old backups");
    store.delete_keys(&to_delete).await?;
    report.deleted = to_delete;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::MemoryStore;

    fn now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2019-12-04 17:53:45", "%Y-%m-%d %H:%M:%S").unwrap()
    }

    #[tokio::test]
    async fn test_clean_deletes_and_ignores_foreign_keys() {
        let store = MemoryStore::with_objects([
            ("2018-12-01_21-56-17-backup.zip", b"a".to_vec()),
            ("2018-01-01_21-56-17-backup.zip", b"b".to_vec()),
            ("notes.txt", b"c".to_vec()),
        ]);

        let report = clean(&store, None, now(), false).await.unwrap();
        assert_eq!(report.found, 2);
        assert_eq!(report.unrecognised, vec!["notes.txt"]);
        assert_eq!(report.deleted, vec!["2018-12-01_21-56-17-backup.zip"]);
        assert_eq!(
            store.keys(),
            vec!["2018-01-01_21-56-17-backup.zip", "notes.txt"]
        );
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let store = MemoryStore::with_objects([("2018-12-01_21-56-17-backup.zip", b"a".to_vec())]);

        let report = clean(&store, None, now(), true).await.unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.planned_deletions().count(), 1);
        assert_eq!(store.keys().len(), 1);
        assert!(store.delete_calls().is_empty());
    }

    #[tokio::test]
    async fn test_clean_respects_prefix() {
        let store = MemoryStore::with_objects([
            ("www/2018-12-01_21-56-17-backup.zip", b"a".to_vec()),
            ("other/2018-12-01_21-56-17-backup.zip", b"b".to_vec()),
        ]);

        let report = clean(&store, Some("www"), now(), false).await.unwrap();
        assert_eq!(report.deleted, vec!["www/2018-12-01_21-56-17-backup.zip"]);
        assert_eq!(store.keys(), vec!["other/2018-12-01_21-56-17-backup.zip"]);
    }

    #[tokio::test]
    async fn test_nothing_to_delete_skips_request() {
        let store = MemoryStore::with_objects([("2019-12-03_02-56-17-backup.zip", b"a".to_vec())]);
        let report = clean(&store, None, now(), false).await.unwrap();
        assert!(report.deleted.is_empty());
        assert!(store.delete_calls().is_empty());
    }
}
