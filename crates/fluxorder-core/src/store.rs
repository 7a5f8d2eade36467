//! Persistent unit bookkeeping using redb.
//!
//! A single `UNITS` table maps unit name to its JSON-encoded [`UnitRecord`].
//! The engine writes the whole registry in one transaction after each batch
//! of transitions, so a reader never sees half of a tick.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{FluxError, Result};
use crate::unit::{UnitRecord, UnitStatus};

const UNITS: TableDefinition<&str, &[u8]> = TableDefinition::new("units");

fn store_err(e: impl std::fmt::Display) -> FluxError {
    FluxError::Store(e.to_string())
}

/// Persistent store for unit runtime records.
pub struct StatusStore {
    db: Database,
}

impl StatusStore {
    /// Open or create the database at `path`, creating the table if needed.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(UNITS).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    pub fn put(&self, record: &UnitRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(UNITS).map_err(store_err)?;
            table
                .insert(record.name.as_str(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    /// Replace the stored registry with `records`. Units absent from
    /// `records` are removed.
    pub fn save_all<'a, I>(&self, records: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a UnitRecord>,
    {
        let mut encoded = BTreeMap::new();
        for record in records {
            encoded.insert(record.name.clone(), serde_json::to_vec(record)?);
        }

        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(UNITS).map_err(store_err)?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(store_err)? {
                let (k, _) = entry.map_err(store_err)?;
                let name = k.value().to_string();
                if !encoded.contains_key(&name) {
                    stale.push(name);
                }
            }
            for name in &stale {
                table.remove(name.as_str()).map_err(store_err)?;
            }
            for (name, value) in &encoded {
                table
                    .insert(name.as_str(), value.as_slice())
                    .map_err(store_err)?;
            }
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<UnitRecord>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(UNITS).map_err(store_err)?;
        match table.get(name).map_err(store_err)? {
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
            None => Ok(None),
        }
    }

    /// All records, sorted by unit name.
    pub fn load_all(&self) -> Result<Vec<UnitRecord>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(UNITS).map_err(store_err)?;

        let mut result = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            let record: UnitRecord = serde_json::from_slice(v.value())?;
            result.push(record);
        }
        Ok(result)
    }

    /// Records left in `Applying` belong to an apply the previous process
    /// never finished. Mark them `Failed`.
    ///
    /// Returns the number of records recovered.
    pub fn startup_recovery(&self) -> Result<u32> {
        let mut count = 0u32;
        for mut record in self.load_all()? {
            if record.status == UnitStatus::Applying {
                record.status = UnitStatus::Failed;
                record.last_error = Some("interrupted before completion".to_string());
                record.last_transition_time = Utc::now();
                self.put(&record)?;
                count += 1;
            }
        }
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_tmp() -> (TempDir, StatusStore) {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::open(&dir.path().join("state.redb")).unwrap();
        (dir, store)
    }

    fn record(name: &str, status: UnitStatus) -> UnitRecord {
        let mut r = UnitRecord::new(name, Utc::now());
        r.status = status;
        r
    }

    #[test]
    fn put_and_get() {
        let (_dir, store) = open_tmp();
        let mut r = record("infra", UnitStatus::Ready);
        r.last_applied_revision = Some("sha256:abc".to_string());
        store.put(&r).unwrap();

        let loaded = store.get("infra").unwrap().unwrap();
        assert_eq!(loaded, r);
        assert!(store.get("apps").unwrap().is_none());
    }

    #[test]
    fn save_all_removes_dropped_units() {
        let (_dir, store) = open_tmp();
        let infra = record("infra", UnitStatus::Ready);
        let apps = record("apps", UnitStatus::Pending);
        store.save_all([&infra, &apps]).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 2);

        store.save_all([&infra]).unwrap();
        let names: Vec<String> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["infra"]);
    }

    #[test]
    fn load_all_is_sorted_by_name() {
        let (_dir, store) = open_tmp();
        store.put(&record("infra", UnitStatus::Ready)).unwrap();
        store.put(&record("apps", UnitStatus::Ready)).unwrap();
        store.put(&record("image-auto", UnitStatus::Ready)).unwrap();
        let names: Vec<String> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["apps", "image-auto", "infra"]);
    }

    #[test]
    fn startup_recovery_fails_interrupted_applies() {
        let (_dir, store) = open_tmp();
        let mut interrupted = record("apps", UnitStatus::Applying);
        interrupted.last_applied_revision = Some("sha256:old".to_string());
        store.put(&interrupted).unwrap();
        store.put(&record("infra", UnitStatus::Ready)).unwrap();

        assert_eq!(store.startup_recovery().unwrap(), 1);

        let apps = store.get("apps").unwrap().unwrap();
        assert_eq!(apps.status, UnitStatus::Failed);
        assert_eq!(
            apps.last_error.as_deref(),
            Some("interrupted before completion")
        );
        assert_eq!(apps.last_applied_revision.as_deref(), Some("sha256:old"));
        assert_eq!(
            store.get("infra").unwrap().unwrap().status,
            UnitStatus::Ready
        );
    }

    #[test]
    fn reopen_keeps_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StatusStore::open(&path).unwrap();
            store.put(&record("infra", UnitStatus::Ready)).unwrap();
        }
        let store = StatusStore::open(&path).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn startup_recovery_on_empty_store_returns_zero() {
        let (_dir, store) = open_tmp();
        assert_eq!(store.startup_recovery().unwrap(), 0);
    }
}
