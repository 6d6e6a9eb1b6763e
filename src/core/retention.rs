/// Retention policy for backups kept on the remote store
///
/// Tiers, judged against a fixed "now":
///
/// * older than one year: keep only backups taken on January 1st
/// * older than one month: keep only backups taken on the 1st of a month
/// * older than one week: keep only backups taken on a Monday or the 1st
/// * newer than one week: keep everything
///
/// Backups older than one week that share a calendar day with a backup
/// already kept are deleted as duplicates. "Already kept" follows the
/// iteration order of the input, so the same set in a different order can
/// keep a different copy of that day. Callers pass the bucket listing order
/// (lexicographic, which for this naming scheme is oldest first).

use chrono::{Datelike, Days, Duration, NaiveDate, NaiveDateTime, Weekday};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

use crate::core::naming::BackupEntry;

/// Age thresholds derived from "now". A backup taken exactly at a threshold
/// is not older than it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cutoffs {
    pub one_year_ago: NaiveDateTime,
    pub one_month_ago: NaiveDateTime,
    pub one_week_ago: NaiveDateTime,
}

impl Cutoffs {
    /// Month and year steps keep the day of the month and let it overflow:
    /// one month before March 31st is March 2nd in a leap year, and one
    /// year before February 29th is March 1st.
    pub fn from_now(now: NaiveDateTime) -> Self {
        Self {
            one_year_ago: months_before(now, 12),
            one_month_ago: months_before(now, 1),
            one_week_ago: now.checked_sub_signed(Duration::weeks(1)).unwrap_or(NaiveDateTime::MIN),
        }
    }
}

/// Step back whole months from the 1st, then add the day offset back on
fn months_before(now: NaiveDateTime, months: u32) -> NaiveDateTime {
    let total = now.year() * 12 + now.month0() as i32 - months as i32;
    let (year, month) = (total.div_euclid(12), total.rem_euclid(12) as u32 + 1);

    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|first| first.checked_add_days(Days::new(u64::from(now.day() - 1))))
        .map(|date| date.and_time(now.time()))
        .unwrap_or(NaiveDateTime::MIN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Keep,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    /// Newer than one week
    Recent,
    /// Older than one year, taken on January 1st
    NewYear,
    /// Older than one month, taken on the 1st
    FirstOfMonth,
    /// Older than one week, taken on a Monday or the 1st
    MondayOrFirst,
    /// Another backup of the same day is already kept
    Duplicate,
    OlderThanYear,
    OlderThanMonth,
    OlderThanWeek,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Reason::Recent => "newer than one week",
            Reason::NewYear => "older than one year, taken on Jan 1st",
            Reason::FirstOfMonth => "older than one month, taken on the 1st",
            Reason::MondayOrFirst => "older than one week, taken on a Monday or the 1st",
            Reason::Duplicate => "duplicate of a kept backup from the same day",
            Reason::OlderThanYear => "older than one year and not taken on Jan 1st",
            Reason::OlderThanMonth => "older than one month and not taken on the 1st",
            Reason::OlderThanWeek => "older than one week and not taken on a Monday or the 1st",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub key: String,
    pub taken_at: NaiveDateTime,
    pub action: Action,
    pub reason: Reason,
}

impl Decision {
    pub fn is_delete(&self) -> bool {
        self.action == Action::Delete
    }
}

fn tier_verdict(taken_at: NaiveDateTime, cutoffs: &Cutoffs) -> (Action, Reason) {
    let date = taken_at.date();

    if taken_at < cutoffs.one_year_ago {
        if date.month() == 1 && date.day() == 1 {
            (Action::Keep, Reason::NewYear)
        } else {
            (Action::Delete, Reason::OlderThanYear)
        }
    } else if taken_at < cutoffs.one_month_ago {
        if date.day() == 1 {
            (Action::Keep, Reason::FirstOfMonth)
        } else {
            (Action::Delete, Reason::OlderThanMonth)
        }
    } else if taken_at < cutoffs.one_week_ago {
        if date.weekday() == Weekday::Mon || date.day() == 1 {
            (Action::Keep, Reason::MondayOrFirst)
        } else {
            (Action::Delete, Reason::OlderThanWeek)
        }
    } else {
        (Action::Keep, Reason::Recent)
    }
}

/// Decide keep/delete for every entry, in input order
pub fn classify(now: NaiveDateTime, entries: &[BackupEntry]) -> Vec<Decision> {
    let cutoffs = Cutoffs::from_now(now);
    let mut kept_days: HashSet<NaiveDate> = HashSet::new();

    entries
        .iter()
        .map(|entry| {
            let day = entry.taken_at.date();

            let (action, reason) =
                if entry.taken_at < cutoffs.one_week_ago && kept_days.contains(&day) {
                    (Action::Delete, Reason::Duplicate)
                } else {
                    tier_verdict(entry.taken_at, &cutoffs)
                };

            if action == Action::Keep {
                kept_days.insert(day);
            }

            Decision {
                key: entry.key.clone(),
                taken_at: entry.taken_at,
                action,
                reason,
            }
        })
        .collect()
}

/// Keys of the entries the policy deletes
pub fn keys_to_delete(now: NaiveDateTime, entries: &[BackupEntry]) -> Vec<String> {
    classify(now, entries)
        .into_iter()
        .filter(Decision::is_delete)
        .map(|d| d.key)
        .collect()
}
