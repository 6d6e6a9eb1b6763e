/// Backup archive naming
///
/// Archives are named `YYYY-MM-DD_HH-MM-SS-backup.zip`. The retention
/// cleanup derives each backup's age from this name, so the format must not
/// change without migrating existing buckets.

use chrono::NaiveDateTime;
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
pub const BACKUP_SUFFIX: &str = "-backup.zip";
pub const DUMP_SUFFIX: &str = "-mysql.sql";

/// A remote backup object with the timestamp embedded in its name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEntry {
    pub key: String,
    pub taken_at: NaiveDateTime,
}

impl BackupEntry {
    pub fn new(key: impl Into<String>, taken_at: NaiveDateTime) -> Self {
        Self {
            key: key.into(),
            taken_at,
        }
    }
}

fn backup_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2})-backup\.zip$")
            .expect("static regex is valid")
    })
}

pub fn backup_file_name(at: NaiveDateTime) -> String {
    format!("{}{}", at.format(TIMESTAMP_FORMAT), BACKUP_SUFFIX)
}

pub fn dump_file_name(at: NaiveDateTime) -> String {
    format!("{}{}", at.format(TIMESTAMP_FORMAT), DUMP_SUFFIX)
}

/// Join an optional key prefix ("folder") and a file name
pub fn object_key(prefix: Option<&str>, file_name: &str) -> String {
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => format!("{}/{}", p, file_name),
        None => file_name.to_string(),
    }
}

/// Parse a bucket key into a [`BackupEntry`].
///
/// Returns `None` when the key is outside `prefix`, does not follow the
/// naming scheme, or names an impossible date such as `2019-02-30`.
pub fn parse_backup_key(key: &str, prefix: Option<&str>) -> Option<BackupEntry> {
    let name = match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(p) => key.strip_prefix(p)?.strip_prefix('/')?,
        None => key,
    };

    let caps = backup_name_regex().captures(name)?;
    let taken_at = NaiveDateTime::parse_from_str(&caps[1], TIMESTAMP_FORMAT).ok()?;
    Some(BackupEntry::new(key, taken_at))
}

/// Split a listing into recognised backups (listing order kept) and
/// unrecognised keys
pub fn parse_listing<'a, I>(keys: I, prefix: Option<&str>) -> (Vec<BackupEntry>, Vec<String>)
where
    I: IntoIterator<Item = &'a String>,
{
    let mut entries = Vec::new();
    let mut unrecognised = Vec::new();

    for key in keys {
        match parse_backup_key(key, prefix) {
            Some(entry) => entries.push(entry),
            None => unrecognised.push(key.clone()),
        }
    }

    (entries, unrecognised)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn test_backup_file_name() {
        assert_eq!(
            backup_file_name(at(2019, 12, 4, 17, 53, 45)),
            "2019-12-04_17-53-45-backup.zip"
        );
        assert_eq!(
            dump_file_name(at(2020, 1, 1, 0, 0, 5)),
            "2020-01-01_00-00-05-mysql.sql"
        );
    }

    #[test]
    fn test_parse_backup_key() {
        let entry = parse_backup_key("2019-12-04_17-53-45-backup.zip", None).unwrap();
        assert_eq!(entry.taken_at, at(2019, 12, 4, 17, 53, 45));
        assert_eq!(entry.key, "2019-12-04_17-53-45-backup.zip");
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        assert!(parse_backup_key("notes.txt", None).is_none());
        assert!(parse_backup_key("2019-12-04_17-53-45-backup.zip.bak", None).is_none());
        assert!(parse_backup_key("x2019-12-04_17-53-45-backup.zip", None).is_none());
        // Matches the pattern but is not a real date
        assert!(parse_backup_key("2019-02-30_10-00-00-backup.zip", None).is_none());
    }

    #[test]
    fn test_parse_with_prefix() {
        let entry = parse_backup_key("site/2019-12-04_17-53-45-backup.zip", Some("site/")).unwrap();
        assert_eq!(entry.key, "site/2019-12-04_17-53-45-backup.zip");

        assert!(parse_backup_key("other/2019-12-04_17-53-45-backup.zip", Some("site")).is_none());
        assert!(parse_backup_key("2019-12-04_17-53-45-backup.zip", Some("site")).is_none());
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key(None, "a.zip"), "a.zip");
        assert_eq!(object_key(Some(""), "a.zip"), "a.zip");
        assert_eq!(object_key(Some("/site/"), "a.zip"), "site/a.zip");
    }

    #[test]
    fn test_parse_listing_keeps_order() {
        let keys = vec![
            "2019-12-02_00-56-17-backup.zip".to_string(),
            "readme.md".to_string(),
            "2019-11-29_02-56-17-backup.zip".to_string(),
        ];
        let (entries, unrecognised) = parse_listing(&keys, None);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, keys[0]);
        assert_eq!(entries[1].key, keys[2]);
        assert_eq!(unrecognised, vec!["readme.md".to_string()]);
    }
}
