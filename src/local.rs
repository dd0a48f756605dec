//! Offline variant of the consoles: a JSON key/value file standing in for
//! browser local storage. The admin assigns a parsed sheet to an employee key
//! and the employee annotates it in place.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::models::{Record, Row};
use crate::records::{self, RecordQuery, RecordStats, StatusChange};

pub const ROLE_KEY: &str = "role";
pub const CURRENT_EMPLOYEE_KEY: &str = "currentEmployee";

pub fn dataset_key(username: &str) -> String {
    format!("excelData_{}", username)
}

#[derive(Debug)]
pub struct LocalStore {
    path: PathBuf,
    entries: BTreeMap<String, Value>,
}

impl LocalStore {
    /// Opens the store at `path`. A missing file is an empty store.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading local store {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("local store {} is not a JSON object", path.display()))?
        } else {
            BTreeMap::new()
        };

        Ok(LocalStore { path, entries })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        self.entries
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    /// Writes through a sibling temp file so a crash never leaves half a store.
    pub fn save(&self) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        let text = serde_json::to_string_pretty(&self.entries)?;
        fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        debug!(path = %self.path.display(), keys = self.entries.len(), "local store saved");
        Ok(())
    }

    /// Replaces an employee's dataset with freshly parsed rows.
    pub fn assign_dataset(&mut self, username: &str, rows: Vec<Row>) -> Result<usize> {
        let records: Vec<Record> = rows
            .into_iter()
            .enumerate()
            .map(|(i, data)| Record {
                id: i as i64 + 1,
                file_id: 0,
                data,
                status: Default::default(),
                reason: String::new(),
                updated_at: None,
            })
            .collect();
        let count = records.len();
        self.set(&dataset_key(username), &records)?;
        Ok(count)
    }

    pub fn dataset(&self, username: &str) -> Result<Vec<Record>> {
        match self.get(&dataset_key(username)) {
            Some(value) => Ok(serde_json::from_value(value.clone())
                .with_context(|| format!("dataset for {} is malformed", username))?),
            None => Ok(Vec::new()),
        }
    }

    pub fn clear_dataset(&mut self, username: &str) -> bool {
        self.remove(&dataset_key(username)).is_some()
    }

    pub fn query(&self, username: &str, query: &RecordQuery) -> Result<(Vec<Record>, RecordStats)> {
        let all = self.dataset(username)?;
        let stats = RecordStats::from_records(&all);
        let filtered = records::filter_records(&all, query)
            .into_iter()
            .cloned()
            .collect();
        Ok((filtered, stats))
    }

    /// Annotates the row with record id `id` (1-based position in the dataset).
    pub fn apply_status(&mut self, username: &str, id: i64, change: &StatusChange) -> Result<Record> {
        let mut dataset = self.dataset(username)?;
        let record = dataset
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow!("{} has no row {}", username, id))?;

        records::apply_status(record, change, Utc::now())?;
        let updated = record.clone();

        self.set(&dataset_key(username), &dataset)?;
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordStatus;
    use crate::records::StatusFilter;
    use tempfile::TempDir;

    fn rows() -> Vec<Row> {
        vec![
            [("Company", "Acme"), ("City", "Lyon")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            [("Company", "Globex"), ("City", "Paris")]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ]
    }

    #[test]
    fn test_missing_file_is_empty_store() -> Result<()> {
        let dir = TempDir::new()?;
        let store = LocalStore::open(dir.path().join("store.json"))?;

        assert!(store.get(ROLE_KEY).is_none());
        assert!(store.dataset("alice")?.is_empty());

        Ok(())
    }

    #[test]
    fn test_assign_and_reload() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("store.json");

        let mut store = LocalStore::open(&path)?;
        assert_eq!(store.assign_dataset("alice", rows())?, 2);
        store.set(ROLE_KEY, &"admin")?;
        store.save()?;

        let reopened = LocalStore::open(&path)?;
        let dataset = reopened.dataset("alice")?;
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset[1].id, 2);
        assert_eq!(dataset[1].data["Company"], "Globex");
        assert_eq!(reopened.get(ROLE_KEY), Some(&Value::from("admin")));
        assert!(reopened.get(&dataset_key("alice")).is_some());

        Ok(())
    }

    #[test]
    fn test_apply_status_and_query() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = LocalStore::open(dir.path().join("store.json"))?;
        store.assign_dataset("alice", rows())?;

        let change = StatusChange {
            status: RecordStatus::Win,
            reason: "signed".to_string(),
        };
        let updated = store.apply_status("alice", 2, &change)?;
        assert_eq!(updated.status, RecordStatus::Win);

        let query = RecordQuery {
            search: None,
            status: StatusFilter::Only(RecordStatus::Win),
        };
        let (filtered, stats) = store.query("alice", &query)?;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].data["Company"], "Globex");
        assert_eq!(stats.total, 2);
        assert_eq!(stats.win, 1);

        assert!(store.apply_status("alice", 9, &change).is_err());

        let no_reason = StatusChange {
            status: RecordStatus::Lose,
            reason: String::new(),
        };
        assert!(store.apply_status("alice", 1, &no_reason).is_err());
        assert_eq!(store.dataset("alice")?[0].status, RecordStatus::Unset);

        Ok(())
    }

    #[test]
    fn test_clear_dataset() -> Result<()> {
        let dir = TempDir::new()?;
        let mut store = LocalStore::open(dir.path().join("store.json"))?;
        store.assign_dataset("alice", rows())?;

        assert!(store.clear_dataset("alice"));
        assert!(!store.clear_dataset("alice"));
        assert!(store.dataset("alice")?.is_empty());

        Ok(())
    }
}
