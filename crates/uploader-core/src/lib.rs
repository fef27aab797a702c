//! Core domain model for the daily time-tracking uploader.

use std::collections::{btree_map, BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "uploader-core";

/// Activity and duration (minutes) recorded for one `(date, group)` cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub activity: String,
    pub duration: u32,
}

/// Flattened view of one parsed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub date: NaiveDate,
    pub group: String,
    pub activity: String,
    pub duration: u32,
}

/// Canonical parse result: `date -> group -> {activity, duration}`.
///
/// Keyed by `(date, group)`; recording the same pair twice replaces the earlier
/// entry. Iteration is date-ascending, then group-name-ascending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParsedExport {
    dates: BTreeMap<NaiveDate, BTreeMap<String, ActivityEntry>>,
}

impl ParsedExport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entry, returning the one it replaced.
    pub fn record(
        &mut self,
        date: NaiveDate,
        group: impl Into<String>,
        entry: ActivityEntry,
    ) -> Option<ActivityEntry> {
        self.dates.entry(date).or_default().insert(group.into(), entry)
    }

    pub fn get(&self, date: NaiveDate, group: &str) -> Option<&ActivityEntry> {
        self.dates.get(&date).and_then(|groups| groups.get(group))
    }

    /// Distinct group names referenced anywhere in the export.
    pub fn group_names(&self) -> BTreeSet<&str> {
        self.dates
            .values()
            .flat_map(|groups| groups.keys().map(String::as_str))
            .collect()
    }

    pub fn records(&self) -> Records<'_> {
        Records {
            outer: self.dates.iter(),
            current: None,
        }
    }

    /// Number of `(date, group)` entries.
    pub fn len(&self) -> usize {
        self.dates.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.values().all(BTreeMap::is_empty)
    }
}

/// Iterator over every entry of a [`ParsedExport`] in canonical order.
pub struct Records<'a> {
    outer: btree_map::Iter<'a, NaiveDate, BTreeMap<String, ActivityEntry>>,
    current: Option<(NaiveDate, btree_map::Iter<'a, String, ActivityEntry>)>,
}

impl Iterator for Records<'_> {
    type Item = ActivityRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((date, groups)) = self.current.as_mut() {
                if let Some((group, entry)) = groups.next() {
                    return Some(ActivityRecord {
                        date: *date,
                        group: group.clone(),
                        activity: entry.activity.clone(),
                        duration: entry.duration,
                    });
                }
            }
            let (date, groups) = self.outer.next()?;
            self.current = Some((*date, groups.iter()));
        }
    }
}

/// Named bucket that durations are attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Insert payload for a group that does not exist remotely yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGroup {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Persisted time-tracking row. Matched remotely by `(date, activity)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTrackingRow {
    pub id: i64,
    pub date: NaiveDate,
    pub group_id: i64,
    pub activity: String,
    pub duration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl TimeTrackingRow {
    pub fn natural_key(&self) -> (NaiveDate, &str) {
        (self.date, self.activity.as_str())
    }
}

/// Candidate row produced by reconciliation; `id` is set only for updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeTrackingDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub date: NaiveDate,
    pub group_id: i64,
    pub activity: String,
    pub duration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Authenticated session returned by a store.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub access_token: String,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub inserted: usize,
    pub updated: usize,
    pub groups_created: usize,
}
