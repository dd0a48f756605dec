//! Filtering and annotation of assigned rows.
//!
//! Shared by the HTTP service and the local store so that both consoles
//! search, count and annotate rows the same way.

use std::convert::TryFrom;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Record, RecordStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum StatusFilter {
    All,
    Only(RecordStatus),
}

impl Default for StatusFilter {
    fn default() -> Self {
        StatusFilter::All
    }
}

impl StatusFilter {
    pub fn accepts(&self, status: RecordStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Only(wanted) => *wanted == status,
        }
    }
}

impl FromStr for StatusFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "All" => Ok(StatusFilter::All),
            "None" => Ok(StatusFilter::Only(RecordStatus::Unset)),
            "Win" | "Lose" | "Pending" => Ok(StatusFilter::Only(s.parse()?)),
            other => Err(anyhow!(
                "unknown status filter '{}', expected All, Win, Lose, Pending or None",
                other
            )),
        }
    }
}

impl TryFrom<String> for StatusFilter {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RecordQuery {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub status: StatusFilter,
}

impl RecordQuery {
    fn needle(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    }
}

pub fn matches(record: &Record, query: &RecordQuery) -> bool {
    if !query.status.accepts(record.status) {
        return false;
    }

    match query.needle() {
        None => true,
        Some(needle) => record
            .data
            .values()
            .map(String::as_str)
            .chain([record.status.as_str(), record.reason.as_str()])
            .any(|value| value.to_lowercase().contains(&needle)),
    }
}

pub fn filter_records<'a>(records: &'a [Record], query: &RecordQuery) -> Vec<&'a Record> {
    records.iter().filter(|r| matches(r, query)).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordStats {
    pub total: usize,
    pub win: usize,
    pub lose: usize,
    pub pending: usize,
}

impl RecordStats {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a Record>,
    {
        records
            .into_iter()
            .fold(RecordStats::default(), |mut stats, record| {
                stats.total += 1;
                match record.status {
                    RecordStatus::Win => stats.win += 1,
                    RecordStatus::Lose => stats.lose += 1,
                    RecordStatus::Pending => stats.pending += 1,
                    RecordStatus::Unset => {}
                }
                stats
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: RecordStatus,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChangeError {
    #[error("Choose Win, Lose or Pending")]
    MissingStatus,
    #[error("Reason is required")]
    MissingReason,
}

impl StatusChange {
    pub fn validate(&self) -> Result<(), ChangeError> {
        if self.status == RecordStatus::Unset {
            return Err(ChangeError::MissingStatus);
        }
        if self.reason.trim().is_empty() {
            return Err(ChangeError::MissingReason);
        }
        Ok(())
    }
}

/// Validates `change` and writes it onto `record`. The reason is kept as typed.
pub fn apply_status(
    record: &mut Record,
    change: &StatusChange,
    now: DateTime<Utc>,
) -> Result<(), ChangeError> {
    change.validate()?;
    record.status = change.status;
    record.reason = change.reason.clone();
    record.updated_at = Some(now.to_rfc3339());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Row;

    fn record(id: i64, cells: &[(&str, &str)], status: RecordStatus, reason: &str) -> Record {
        let data: Row = cells
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Record {
            id,
            file_id: 1,
            data,
            status,
            reason: reason.to_string(),
            updated_at: None,
        }
    }

    fn sample() -> Vec<Record> {
        vec![
            record(1, &[("Company", "Acme Corp"), ("City", "Lyon")], RecordStatus::Win, "signed"),
            record(2, &[("Company", "Globex"), ("City", "Paris")], RecordStatus::Lose, "price"),
            record(3, &[("Company", "Initech"), ("City", "Lyon")], RecordStatus::Pending, "call back"),
            record(4, &[("Company", "Umbrella"), ("City", "Nice")], RecordStatus::Unset, ""),
        ]
    }

    fn query(search: Option<&str>, status: StatusFilter) -> RecordQuery {
        RecordQuery {
            search: search.map(String::from),
            status,
        }
    }

    #[test]
    fn test_empty_query_keeps_everything_in_order() {
        let records = sample();
        let ids: Vec<i64> = filter_records(&records, &RecordQuery::default())
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_search_is_trimmed_and_case_insensitive() {
        let records = sample();
        let ids: Vec<i64> = filter_records(&records, &query(Some("  LYON "), StatusFilter::All))
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_search_covers_status_and_reason() {
        let records = sample();
        let by_reason = filter_records(&records, &query(Some("price"), StatusFilter::All));
        assert_eq!(by_reason.len(), 1);
        assert_eq!(by_reason[0].id, 2);

        let by_status = filter_records(&records, &query(Some("pend"), StatusFilter::All));
        assert_eq!(by_status.len(), 1);
        assert_eq!(by_status[0].id, 3);
    }

    #[test]
    fn test_status_filter_combines_with_search() {
        let records = sample();
        let only_win = StatusFilter::Only(RecordStatus::Win);

        assert_eq!(filter_records(&records, &query(Some("lyon"), only_win)).len(), 1);
        assert!(filter_records(&records, &query(Some("globex"), only_win)).is_empty());

        let unset = filter_records(&records, &query(None, "None".parse().unwrap()));
        assert_eq!(unset.len(), 1);
        assert_eq!(unset[0].id, 4);
    }

    #[test]
    fn test_status_filter_parsing() {
        assert_eq!("All".parse::<StatusFilter>().unwrap(), StatusFilter::All);
        assert_eq!("".parse::<StatusFilter>().unwrap(), StatusFilter::All);
        assert_eq!(
            "Lose".parse::<StatusFilter>().unwrap(),
            StatusFilter::Only(RecordStatus::Lose)
        );
        assert!("Maybe".parse::<StatusFilter>().is_err());
    }

    #[test]
    fn test_stats_count_each_status() {
        let stats = RecordStats::from_records(&sample());
        assert_eq!(
            stats,
            RecordStats {
                total: 4,
                win: 1,
                lose: 1,
                pending: 1
            }
        );
    }

    #[test]
    fn test_apply_status_requires_reason() {
        let mut rec = sample().remove(3);
        let change = StatusChange {
            status: RecordStatus::Win,
            reason: "   ".to_string(),
        };

        assert_eq!(
            apply_status(&mut rec, &change, Utc::now()),
            Err(ChangeError::MissingReason)
        );
        assert_eq!(rec.status, RecordStatus::Unset);
        assert!(rec.updated_at.is_none());
    }

    #[test]
    fn test_apply_status_rejects_unset() {
        let mut rec = sample().remove(0);
        let change = StatusChange {
            status: RecordStatus::Unset,
            reason: "undo".to_string(),
        };
        assert_eq!(
            apply_status(&mut rec, &change, Utc::now()),
            Err(ChangeError::MissingStatus)
        );
    }

    #[test]
    fn test_apply_status_keeps_reason_as_typed() {
        let mut rec = sample().remove(3);
        let change = StatusChange {
            status: RecordStatus::Pending,
            reason: " follow up next week ".to_string(),
        };

        apply_status(&mut rec, &change, Utc::now()).unwrap();

        assert_eq!(rec.status, RecordStatus::Pending);
        assert_eq!(rec.reason, " follow up next week ");
        assert!(rec.updated_at.is_some());
    }
}
