use std::path::PathBuf;

use record_ledger_core::{now_unix, AttributeDelta, LedgerError, Record, RecordId};
use record_ledger_store_sqlite::{SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// The single entry point the transport layer talks to. Each call opens its
/// own store handle and migrates it, so concurrent calls never share a
/// connection and a freshly created database is always usable.
#[derive(Debug, Clone)]
pub struct RecordLedgerApi {
    db_path: PathBuf,
}

impl RecordLedgerApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore, LedgerError> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the database cannot be opened or
    /// queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, LedgerError> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when migration planning or execution
    /// fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, LedgerError> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Create-or-update: create version 1 from the delta when the record does
    /// not exist (deletion markers dropped), otherwise apply the delta as an
    /// update at `effective_at`. Errors from the underlying call pass through
    /// untranslated.
    ///
    /// # Errors
    /// Returns [`LedgerError::EmptyUpdate`], [`LedgerError::DuplicateTimestamp`],
    /// or [`LedgerError::Storage`] from the update path.
    pub fn upsert(
        &self,
        id: RecordId,
        effective_at: Option<i64>,
        delta: &AttributeDelta,
    ) -> Result<Record, LedgerError> {
        let mut store = self.open_store()?;
        let effective_at = effective_at.unwrap_or_else(now_unix);

        match store.get_latest(id) {
            Err(LedgerError::NotFound { .. }) => {
                tracing::debug!(record_id = id.get(), "record does not exist yet, creating");
                store.create_record(id, delta.initial_attributes(), effective_at)
            }
            Err(err) => Err(err),
            Ok(_) => store.apply_update(id, effective_at, delta),
        }
    }

    /// The latest version of a record.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the record does not exist.
    pub fn get_record(&self, id: RecordId) -> Result<Record, LedgerError> {
        self.open_store()?.get_latest(id)
    }

    /// The version in force just before `effective_at`.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no version precedes the instant.
    pub fn get_record_at(&self, id: RecordId, effective_at: i64) -> Result<Record, LedgerError> {
        self.open_store()?.get_as_of(id, effective_at)
    }

    /// All versions of a record, ranks ascending.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the record does not exist.
    pub fn get_versions(&self, id: RecordId) -> Result<Vec<Record>, LedgerError> {
        self.open_store()?.get_versions(id)
    }

    /// The version at rank `version`.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidVersion`] when `version < 1`,
    /// [`LedgerError::NotFound`] when the rank exceeds the chain length.
    pub fn get_version(&self, id: RecordId, version: i64) -> Result<Record, LedgerError> {
        self.open_store()?.get_version(id, version)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    use record_ledger_core::AttributeMap;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("record-ledger-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn rid(raw: i64) -> RecordId {
        RecordId::new(raw).unwrap_or_else(|err| panic!("invalid test record id: {err}"))
    }

    fn attrs(pairs: &[(&str, &str)]) -> AttributeMap {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    fn delta(pairs: &[(&str, Option<&str>)]) -> AttributeDelta {
        AttributeDelta(
            pairs.iter().map(|(k, v)| ((*k).to_string(), v.map(ToString::to_string))).collect(),
        )
    }

    #[test]
    fn upsert_creates_then_updates() -> Result<(), LedgerError> {
        let db_path = unique_temp_db_path();
        let api = RecordLedgerApi::new(db_path.clone());
        let id = rid(1);

        let created = api.upsert(id, Some(100), &delta(&[("hello", Some("world"))]))?;
        assert_eq!(created.version, 1);
        assert_eq!(created.attributes, attrs(&[("hello", "world")]));

        let updated = api.upsert(id, Some(200), &delta(&[("status", Some("ok"))]))?;
        assert_eq!(updated.version, 2);
        assert_eq!(updated.attributes, attrs(&[("hello", "world"), ("status", "ok")]));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn upsert_create_drops_deletion_markers() -> Result<(), LedgerError> {
        let db_path = unique_temp_db_path();
        let api = RecordLedgerApi::new(db_path.clone());
        let id = rid(2);

        let created =
            api.upsert(id, Some(100), &delta(&[("keep", Some("v")), ("drop", None)]))?;
        assert_eq!(created.attributes, attrs(&[("keep", "v")]));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn upsert_supports_retroactive_effective_time() -> Result<(), LedgerError> {
        let db_path = unique_temp_db_path();
        let api = RecordLedgerApi::new(db_path.clone());
        let id = rid(3);

        api.upsert(id, Some(100), &delta(&[("hello", Some("world"))]))?;
        api.upsert(id, Some(200), &delta(&[("status", Some("ok"))]))?;
        let retro = api.upsert(id, Some(150), &delta(&[("hello", Some("world2"))]))?;
        assert_eq!(retro.version, 2);

        let latest = api.get_record(id)?;
        assert_eq!(latest.version, 3);
        assert_eq!(latest.attributes, attrs(&[("hello", "world2"), ("status", "ok")]));

        let as_of = api.get_record_at(id, 180)?;
        assert_eq!(as_of.effective_at, 150);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn upsert_defaults_effective_time_to_now() -> Result<(), LedgerError> {
        let db_path = unique_temp_db_path();
        let api = RecordLedgerApi::new(db_path.clone());
        let id = rid(4);

        let before = now_unix();
        let created = api.upsert(id, None, &delta(&[("a", Some("1"))]))?;
        assert!(created.effective_at >= before);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn read_errors_pass_through_untranslated() -> Result<(), LedgerError> {
        let db_path = unique_temp_db_path();
        let api = RecordLedgerApi::new(db_path.clone());
        let id = rid(5);

        assert_eq!(api.get_record(id), Err(LedgerError::NotFound { id }));
        assert_eq!(api.get_versions(id), Err(LedgerError::NotFound { id }));
        assert_eq!(api.get_version(id, 0), Err(LedgerError::InvalidVersion { version: 0 }));

        let empty = BTreeMap::new();
        api.upsert(id, Some(100), &delta(&[("a", Some("1"))]))?;
        assert_eq!(
            api.upsert(id, Some(100), &AttributeDelta(empty)),
            Err(LedgerError::EmptyUpdate)
        );

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn migrate_dry_run_reports_without_applying() -> Result<(), LedgerError> {
        let db_path = unique_temp_db_path();
        let api = RecordLedgerApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.current_version, 0);
        assert_eq!(planned.would_apply_versions, vec![1, 2]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(planned.target_version));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
