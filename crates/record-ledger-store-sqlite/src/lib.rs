use std::collections::BTreeMap;
use std::fmt::Display;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use record_ledger_core::{
    now_unix, AttributeDelta, AttributeMap, LedgerError, Record, RecordId, VersionEntry,
};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS records (
  id INTEGER PRIMARY KEY CHECK (id > 0),
  created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS record_versions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  record_id INTEGER NOT NULL,
  effective_at INTEGER NOT NULL,
  reported_at INTEGER NOT NULL,
  attributes_json TEXT NOT NULL,
  FOREIGN KEY (record_id) REFERENCES records(id)
);

CREATE INDEX IF NOT EXISTS idx_record_versions_record ON record_versions(record_id);
";

// v2 adds the one-version-per-effective-instant guarantee; earlier databases
// relied on insertion order to break ties.
const MIGRATION_002_SQL: &str = r"
CREATE UNIQUE INDEX IF NOT EXISTS idx_record_versions_effective
  ON record_versions(record_id, effective_at);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_records: usize,
    pub skipped_existing_records: usize,
    pub imported_versions: usize,
    pub skipped_existing_versions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Serialize, Deserialize)]
struct IdentityRow {
    id: i64,
    created_at: i64,
}

impl SqliteStore {
    /// Open a SQLite-backed version store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the database cannot be opened or
    /// pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)
            .map_err(storage(format!("failed to open sqlite database at {}", path.display())))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(storage("failed to configure sqlite pragmas"))?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus, LedgerError> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_err(storage("failed to apply schema_migrations table"))?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when migration bootstrapping or any
    /// migration step fails.
    pub fn migrate(&mut self) -> Result<(), LedgerError> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_err(storage("failed to apply schema_migrations table"))?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.conn
                .execute_batch(MIGRATION_002_SQL)
                .map_err(storage("failed to apply migration v2"))?;
            record_schema_version(&self.conn, 2)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(LedgerError::storage(format!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            )));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64, LedgerError> {
        if !table_exists(&self.conn, "record_versions")? {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .map_err(storage("failed to apply migration v1"))?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if index_exists(&self.conn, "idx_record_versions_effective")? {
            // Tables already in v2 shape but missing migration rows.
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        record_schema_version(&self.conn, 1)?;
        Ok(1)
    }

    /// The latest version of a record: its entry with the greatest effective
    /// timestamp, at its derived rank.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no versions exist for the id,
    /// [`LedgerError::Storage`] on any underlying store failure.
    pub fn get_latest(&self, id: RecordId) -> Result<Record, LedgerError> {
        let entry = self.latest_entry(id)?.ok_or(LedgerError::NotFound { id })?;
        self.materialize(entry)
    }

    /// The version in force just before `effective_at`: the entry with the
    /// greatest effective timestamp strictly less than the query instant.
    /// This is the baseline every update builds on.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when no version precedes the instant,
    /// [`LedgerError::Storage`] on any underlying store failure.
    pub fn get_as_of(&self, id: RecordId, effective_at: i64) -> Result<Record, LedgerError> {
        let entry = self.entry_before(id, effective_at)?.ok_or(LedgerError::NotFound { id })?;
        self.materialize(entry)
    }

    /// All versions of a record ascending by effective timestamp, each
    /// annotated with its derived rank 1..=N.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the record has no versions,
    /// [`LedgerError::Storage`] on any underlying store failure.
    pub fn get_versions(&self, id: RecordId) -> Result<Vec<Record>, LedgerError> {
        let entries = self.entries_ascending(id)?;
        if entries.is_empty() {
            return Err(LedgerError::NotFound { id });
        }

        Ok(entries
            .into_iter()
            .enumerate()
            .map(|(index, entry)| entry.into_record(rank_from_index(index)))
            .collect())
    }

    /// The version at ascending rank `version` (1-based).
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidVersion`] when `version < 1`,
    /// [`LedgerError::NotFound`] when the rank exceeds the chain length,
    /// [`LedgerError::Storage`] on any underlying store failure.
    pub fn get_version(&self, id: RecordId, version: i64) -> Result<Record, LedgerError> {
        if version < 1 {
            return Err(LedgerError::InvalidVersion { version });
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT effective_at, reported_at, attributes_json FROM record_versions
                 WHERE record_id = ?1
                 ORDER BY effective_at ASC
                 LIMIT 1 OFFSET ?2",
            )
            .map_err(storage("failed to prepare versioned read"))?;
        let row = stmt
            .query_row(params![id.get(), version - 1], version_row)
            .optional()
            .map_err(storage("failed to read versioned row"))?;

        let Some((effective_at, reported_at, attributes_json)) = row else {
            return Err(LedgerError::NotFound { id });
        };

        Ok(Record {
            id,
            version: u32::try_from(version).unwrap_or(u32::MAX),
            effective_at,
            reported_at,
            attributes: decode_attributes(&attributes_json)?,
        })
    }

    /// Create a record: atomically insert its identity row and its rank-1
    /// version entry.
    ///
    /// # Errors
    /// Returns [`LedgerError::AlreadyExists`] when any version exists for the
    /// id, [`LedgerError::Storage`] on any underlying store failure.
    pub fn create_record(
        &mut self,
        id: RecordId,
        attributes: AttributeMap,
        effective_at: i64,
    ) -> Result<Record, LedgerError> {
        if self.identity_exists(id)? {
            return Err(LedgerError::AlreadyExists { id });
        }

        let reported_at = now_unix();
        let attributes_json = encode_attributes(&attributes)?;

        let tx = self
            .conn
            .transaction()
            .map_err(storage("failed to start create transaction"))?;
        tx.execute(
            "INSERT INTO records(id, created_at) VALUES (?1, ?2)",
            params![id.get(), reported_at],
        )
        .map_err(|err| match err {
            rusqlite::Error::SqliteFailure(ffi_err, _)
                if ffi_err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                LedgerError::AlreadyExists { id }
            }
            err => LedgerError::storage(format!("failed to insert identity row: {err}")),
        })?;
        tx.execute(
            "INSERT INTO record_versions(record_id, effective_at, reported_at, attributes_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![id.get(), effective_at, reported_at, attributes_json],
        )
        .map_err(storage("failed to insert initial version row"))?;
        tx.commit().map_err(storage("failed to commit create transaction"))?;

        tracing::info!(record_id = id.get(), effective_at, "created record");
        Ok(Record { id, version: 1, effective_at, reported_at, attributes })
    }

    /// Apply an update at `effective_at`: insert one new version entry whose
    /// attributes are the delta applied to the state in force just before
    /// that instant, then rewrite every strictly-later entry by applying the
    /// same delta to its stored attributes. Insert and cascade commit as one
    /// transaction; on failure nothing changes.
    ///
    /// # Errors
    /// Returns [`LedgerError::EmptyUpdate`] for a delta with no keys,
    /// [`LedgerError::NotFound`] when the record has no versions,
    /// [`LedgerError::DuplicateTimestamp`] when a version already exists at
    /// exactly this effective timestamp, [`LedgerError::Storage`] on any
    /// underlying store failure (after rollback).
    pub fn apply_update(
        &mut self,
        id: RecordId,
        effective_at: i64,
        delta: &AttributeDelta,
    ) -> Result<Record, LedgerError> {
        if delta.is_empty() {
            return Err(LedgerError::EmptyUpdate);
        }
        if !self.has_versions(id)? {
            return Err(LedgerError::NotFound { id });
        }
        if self.entry_exists_at(id, effective_at)? {
            return Err(LedgerError::DuplicateTimestamp { id, effective_at });
        }

        // Base is the state just before this effective instant, not the
        // current latest; a retroactive update earlier than the whole chain
        // starts from an empty map.
        let base =
            self.entry_before(id, effective_at)?.map(|entry| entry.attributes).unwrap_or_default();
        let attributes = delta.apply(&base);
        let attributes_json = encode_attributes(&attributes)?;
        let reported_at = now_unix();

        let tx = self
            .conn
            .transaction()
            .map_err(storage("failed to start update transaction"))?;
        tx.execute(
            "INSERT INTO record_versions(record_id, effective_at, reported_at, attributes_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![id.get(), effective_at, reported_at, attributes_json],
        )
        .map_err(|err| match err {
            rusqlite::Error::SqliteFailure(ffi_err, _)
                if ffi_err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                LedgerError::DuplicateTimestamp { id, effective_at }
            }
            err => LedgerError::storage(format!("failed to insert version row: {err}")),
        })?;
        let rewritten = cascade_later_entries(&tx, id, effective_at, delta)?;
        tx.commit().map_err(storage("failed to commit update transaction"))?;

        tracing::info!(record_id = id.get(), effective_at, rewritten, "applied update");

        let version = self.rank_of(id, effective_at)?;
        Ok(Record { id, version, effective_at, reported_at, attributes })
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, LedgerError> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .map_err(storage("failed to run PRAGMA quick_check"))?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .map_err(storage("failed to prepare PRAGMA foreign_key_check"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })
            .map_err(storage("failed to run PRAGMA foreign_key_check"))?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row.map_err(storage("failed to read violation row"))?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when backup directories cannot be
    /// created or the backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<(), LedgerError> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).map_err(storage(format!(
                "failed to create parent directory for backup file {}",
                out_file.display()
            )))?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .map_err(storage(format!("failed to create sqlite backup at {}", out_file.display())))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when the backup file is missing,
    /// restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<(), LedgerError> {
        if !in_file.exists() {
            return Err(LedgerError::storage(format!(
                "backup file does not exist: {}",
                in_file.display()
            )));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .map_err(storage(format!(
                "failed to restore sqlite backup from {}",
                in_file.display()
            )))?;

        self.migrate()
    }

    /// Export identity rows and version entries as deterministic NDJSON plus
    /// a manifest carrying per-file sha256 digests.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when export files cannot be created,
    /// written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest, LedgerError> {
        fs::create_dir_all(out_dir).map_err(storage(format!(
            "failed to create export directory {}",
            out_dir.display()
        )))?;

        let identities = self.list_identity_rows()?;
        let entries = self.list_all_entries()?;

        let records_path = out_dir.join("records.ndjson");
        let record_digest = write_ndjson_file(&records_path, &identities)?;

        let versions_path = out_dir.join("record_versions.ndjson");
        let version_digest = write_ndjson_file(&versions_path, &entries)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: "records.ndjson".to_string(),
                    sha256: record_digest.0,
                    records: record_digest.1,
                },
                ExportFileDigest {
                    path: "record_versions.ndjson".to_string(),
                    sha256: version_digest.0,
                    records: version_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json = serde_json::to_vec_pretty(&manifest)
            .map_err(storage("failed to serialize export manifest"))?;
        fs::write(&manifest_path, manifest_json).map_err(storage(format!(
            "failed to write export manifest {}",
            manifest_path.display()
        )))?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database. Rows are
    /// inserted verbatim; recorded history is restored, never re-cascaded.
    ///
    /// # Errors
    /// Returns [`LedgerError::Storage`] when migration, manifest validation,
    /// duplicate handling, or writes fail.
    pub fn import_snapshot(
        &mut self,
        in_dir: &Path,
        skip_existing: bool,
    ) -> Result<ImportSummary, LedgerError> {
        self.migrate()?;
        let manifest_path = in_dir.join("manifest.json");
        let manifest = read_export_manifest(&manifest_path)?;
        validate_import_manifest(in_dir, &manifest)?;

        let records_path = in_dir.join("records.ndjson");
        let versions_path = in_dir.join("record_versions.ndjson");

        let mut summary = ImportSummary {
            imported_records: 0,
            skipped_existing_records: 0,
            imported_versions: 0,
            skipped_existing_versions: 0,
        };

        for identity in read_ndjson_file::<IdentityRow>(&records_path)? {
            let id = RecordId::new(identity.id)
                .map_err(|err| LedgerError::storage(format!("invalid identity row: {err}")))?;
            if self.identity_exists(id)? {
                if skip_existing {
                    summary.skipped_existing_records += 1;
                    continue;
                }
                return Err(LedgerError::storage(format!("record already exists for id {id}")));
            }
            self.conn
                .execute(
                    "INSERT INTO records(id, created_at) VALUES (?1, ?2)",
                    params![identity.id, identity.created_at],
                )
                .map_err(storage("failed to import identity row"))?;
            summary.imported_records += 1;
        }

        for entry in read_ndjson_file::<VersionEntry>(&versions_path)? {
            if self.entry_exists_at(entry.record_id, entry.effective_at)? {
                if skip_existing {
                    summary.skipped_existing_versions += 1;
                    continue;
                }
                return Err(LedgerError::storage(format!(
                    "version already exists for record {} at {}",
                    entry.record_id, entry.effective_at
                )));
            }
            let attributes_json = encode_attributes(&entry.attributes)?;
            self.conn
                .execute(
                    "INSERT INTO record_versions(record_id, effective_at, reported_at, attributes_json)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        entry.record_id.get(),
                        entry.effective_at,
                        entry.reported_at,
                        attributes_json
                    ],
                )
                .map_err(storage("failed to import version row"))?;
            summary.imported_versions += 1;
        }

        Ok(summary)
    }

    fn materialize(&self, entry: VersionEntry) -> Result<Record, LedgerError> {
        let version = self.rank_of(entry.record_id, entry.effective_at)?;
        Ok(entry.into_record(version))
    }

    // Rank = count of strictly earlier effective timestamps + 1. Never
    // stored, so retroactive inserts shift later ranks automatically.
    fn rank_of(&self, id: RecordId, effective_at: i64) -> Result<u32, LedgerError> {
        let earlier: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM record_versions
                 WHERE record_id = ?1 AND effective_at < ?2",
                params![id.get(), effective_at],
                |row| row.get(0),
            )
            .map_err(storage("failed to derive version rank"))?;
        Ok(u32::try_from(earlier + 1).unwrap_or(u32::MAX))
    }

    fn latest_entry(&self, id: RecordId) -> Result<Option<VersionEntry>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT effective_at, reported_at, attributes_json FROM record_versions
                 WHERE record_id = ?1
                 ORDER BY effective_at DESC
                 LIMIT 1",
            )
            .map_err(storage("failed to prepare latest read"))?;
        let row = stmt
            .query_row(params![id.get()], version_row)
            .optional()
            .map_err(storage("failed to read latest row"))?;
        row.map(|raw| entry_from_row(id, raw)).transpose()
    }

    fn entry_before(
        &self,
        id: RecordId,
        effective_at: i64,
    ) -> Result<Option<VersionEntry>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT effective_at, reported_at, attributes_json FROM record_versions
                 WHERE record_id = ?1 AND effective_at < ?2
                 ORDER BY effective_at DESC
                 LIMIT 1",
            )
            .map_err(storage("failed to prepare as-of read"))?;
        let row = stmt
            .query_row(params![id.get(), effective_at], version_row)
            .optional()
            .map_err(storage("failed to read as-of row"))?;
        row.map(|raw| entry_from_row(id, raw)).transpose()
    }

    fn entries_ascending(&self, id: RecordId) -> Result<Vec<VersionEntry>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT effective_at, reported_at, attributes_json FROM record_versions
                 WHERE record_id = ?1
                 ORDER BY effective_at ASC",
            )
            .map_err(storage("failed to prepare versions read"))?;
        let rows = stmt
            .query_map(params![id.get()], version_row)
            .map_err(storage("failed to query versions"))?;

        let mut entries = Vec::new();
        for row in rows {
            let raw = row.map_err(storage("failed to read version row"))?;
            entries.push(entry_from_row(id, raw)?);
        }
        Ok(entries)
    }

    fn identity_exists(&self, id: RecordId) -> Result<bool, LedgerError> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM records WHERE id = ?1)",
                params![id.get()],
                |row| row.get::<_, i64>(0),
            )
            .map_err(storage("failed to check record identity"))?;
        Ok(exists == 1)
    }

    fn has_versions(&self, id: RecordId) -> Result<bool, LedgerError> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM record_versions WHERE record_id = ?1)",
                params![id.get()],
                |row| row.get::<_, i64>(0),
            )
            .map_err(storage("failed to check record versions"))?;
        Ok(exists == 1)
    }

    fn entry_exists_at(&self, id: RecordId, effective_at: i64) -> Result<bool, LedgerError> {
        let exists = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM record_versions
                 WHERE record_id = ?1 AND effective_at = ?2)",
                params![id.get(), effective_at],
                |row| row.get::<_, i64>(0),
            )
            .map_err(storage("failed to check effective timestamp"))?;
        Ok(exists == 1)
    }

    fn list_identity_rows(&self) -> Result<Vec<IdentityRow>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, created_at FROM records ORDER BY id ASC")
            .map_err(storage("failed to prepare identity export"))?;
        let rows = stmt
            .query_map([], |row| Ok(IdentityRow { id: row.get(0)?, created_at: row.get(1)? }))
            .map_err(storage("failed to query identity rows"))?;

        let mut identities = Vec::new();
        for row in rows {
            identities.push(row.map_err(storage("failed to read identity row"))?);
        }
        Ok(identities)
    }

    fn list_all_entries(&self) -> Result<Vec<VersionEntry>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT record_id, effective_at, reported_at, attributes_json
                 FROM record_versions
                 ORDER BY record_id ASC, effective_at ASC",
            )
            .map_err(storage("failed to prepare version export"))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(storage("failed to query version rows"))?;

        let mut entries = Vec::new();
        for row in rows {
            let (record_id, effective_at, reported_at, attributes_json) =
                row.map_err(storage("failed to read version row"))?;
            let record_id = RecordId::new(record_id)
                .map_err(|err| LedgerError::storage(format!("invalid stored record id: {err}")))?;
            entries.push(VersionEntry {
                record_id,
                effective_at,
                reported_at,
                attributes: decode_attributes(&attributes_json)?,
            });
        }
        Ok(entries)
    }
}

type RawVersionRow = (i64, i64, String);

fn version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawVersionRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn entry_from_row(id: RecordId, raw: RawVersionRow) -> Result<VersionEntry, LedgerError> {
    let (effective_at, reported_at, attributes_json) = raw;
    Ok(VersionEntry { record_id: id, effective_at, reported_at, attributes: decode_attributes(&attributes_json)? })
}

fn cascade_later_entries(
    tx: &rusqlite::Transaction<'_>,
    id: RecordId,
    effective_at: i64,
    delta: &AttributeDelta,
) -> Result<usize, LedgerError> {
    let mut stmt = tx
        .prepare(
            "SELECT id, attributes_json FROM record_versions
             WHERE record_id = ?1 AND effective_at > ?2",
        )
        .map_err(storage("failed to prepare cascade query"))?;
    let rows = stmt
        .query_map(params![id.get(), effective_at], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(storage("failed to query later versions"))?;

    // Each later version is rewritten from its own stored attributes, so the
    // edits layered on top of it stay observable.
    let mut rewrites = Vec::new();
    for row in rows {
        let (row_id, attributes_json) = row.map_err(storage("failed to read later version"))?;
        let stored = decode_attributes(&attributes_json)?;
        rewrites.push((row_id, encode_attributes(&delta.apply(&stored))?));
    }
    drop(stmt);

    for (row_id, attributes_json) in &rewrites {
        tx.execute(
            "UPDATE record_versions SET attributes_json = ?1 WHERE id = ?2",
            params![attributes_json, row_id],
        )
        .map_err(storage("failed to rewrite later version"))?;
    }

    tracing::debug!(record_id = id.get(), effective_at, count = rewrites.len(), "cascade");
    Ok(rewrites.len())
}

fn storage<E: Display>(what: impl Into<String>) -> impl FnOnce(E) -> LedgerError {
    let what = what.into();
    move |err| LedgerError::Storage(format!("{what}: {err}"))
}

fn encode_attributes(attributes: &AttributeMap) -> Result<String, LedgerError> {
    serde_json::to_string(attributes).map_err(storage("failed to serialize attributes"))
}

fn decode_attributes(attributes_json: &str) -> Result<AttributeMap, LedgerError> {
    serde_json::from_str(attributes_json).map_err(storage("failed to parse stored attributes"))
}

fn current_schema_version(conn: &Connection) -> Result<i64, LedgerError> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get(0)
    })
    .map_err(storage("failed to read schema version"))
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool), LedgerError> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }
    if !table_exists(conn, "record_versions")? {
        return Ok((0, false));
    }
    if index_exists(conn, "idx_record_versions_effective")? {
        return Ok((2, true));
    }
    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .map_err(storage("failed to record schema version"))?;
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, LedgerError> {
    object_exists(conn, "table", name)
}

fn index_exists(conn: &Connection, name: &str) -> Result<bool, LedgerError> {
    object_exists(conn, "index", name)
}

fn object_exists(conn: &Connection, object_type: &str, name: &str) -> Result<bool, LedgerError> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2)",
            params![object_type, name],
            |row| row.get::<_, i64>(0),
        )
        .map_err(storage("failed to inspect sqlite_master"))?;
    Ok(exists == 1)
}

fn now_rfc3339() -> Result<String, LedgerError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(storage("failed to format current timestamp"))
}

fn rank_from_index(index: usize) -> u32 {
    u32::try_from(index + 1).unwrap_or(u32::MAX)
}

fn write_ndjson_file<T: Serialize>(
    path: &Path,
    items: &[T],
) -> Result<(String, usize), LedgerError> {
    let file = File::create(path)
        .map_err(storage(format!("failed to create NDJSON file {}", path.display())))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for item in items {
        let line = serde_json::to_string(item).map_err(storage("failed to serialize NDJSON row"))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .map_err(storage(format!("failed to write NDJSON file {}", path.display())))?;
    }

    writer
        .flush()
        .map_err(storage(format!("failed to flush NDJSON file {}", path.display())))?;
    Ok((format!("{:x}", hasher.finalize()), items.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, LedgerError> {
    let file = File::open(path)
        .map_err(storage(format!("failed to open NDJSON file {}", path.display())))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(storage(format!(
            "failed to read line {} from {}",
            index + 1,
            path.display()
        )))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).map_err(storage(format!(
            "failed to parse NDJSON row {} from {}",
            index + 1,
            path.display()
        )))?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest, LedgerError> {
    let bytes = fs::read(path)
        .map_err(storage(format!("failed to read manifest file {}", path.display())))?;
    serde_json::from_slice(&bytes)
        .map_err(storage(format!("failed to parse manifest JSON {}", path.display())))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize), LedgerError> {
    let file = File::open(path)
        .map_err(storage(format!("failed to open NDJSON file {}", path.display())))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(storage(format!(
            "failed to read line {} from {}",
            index + 1,
            path.display()
        )))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<(), LedgerError> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(LedgerError::storage(format!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version, LATEST_SCHEMA_VERSION
        )));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(LedgerError::storage(format!(
                "manifest contains duplicate file entry: {}",
                file.path
            )));
        }
    }

    for required in ["records.ndjson", "record_versions.ndjson"] {
        let Some(expected) = by_path.get(required) else {
            return Err(LedgerError::storage(format!(
                "manifest is missing required file entry: {required}"
            )));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(LedgerError::storage(format!(
                "manifest references missing file {}",
                file_path.display()
            )));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(LedgerError::storage(format!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256, actual_sha256
            )));
        }
        if actual_records != expected.records {
            return Err(LedgerError::storage(format!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records, actual_records
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn open_memory_store() -> Result<SqliteStore, LedgerError> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
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

    fn unique_temp_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("record-ledger-{label}-{}", ulid::Ulid::new()))
    }

    #[test]
    fn migrate_initializes_fresh_database_to_latest_schema() -> Result<(), LedgerError> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 0);
        assert_eq!(status.pending_versions, vec![1, 2]);

        let mut store = store;
        store.migrate()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(status.pending_versions.is_empty());
        assert!(!status.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn migrate_infers_schema_version_from_legacy_tables() -> Result<(), LedgerError> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(MIGRATION_001_SQL).map_err(storage("legacy table setup"))?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert!(status.inferred_from_legacy);
        assert_eq!(status.pending_versions, vec![2]);

        store.migrate()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, LATEST_SCHEMA_VERSION);
        assert!(!status.inferred_from_legacy);
        Ok(())
    }

    #[test]
    fn create_and_get_latest_round_trip() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(1);
        let created = store.create_record(id, attrs(&[("hello", "world")]), 100)?;
        assert_eq!(created.version, 1);
        assert_eq!(created.effective_at, 100);

        let latest = store.get_latest(id)?;
        assert_eq!(latest.version, 1);
        assert_eq!(latest.attributes, attrs(&[("hello", "world")]));
        assert_eq!(latest.reported_at, created.reported_at);
        Ok(())
    }

    #[test]
    fn create_on_existing_record_is_rejected() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(1);
        store.create_record(id, attrs(&[("a", "1")]), 100)?;
        assert_eq!(
            store.create_record(id, attrs(&[("b", "2")]), 200),
            Err(LedgerError::AlreadyExists { id })
        );
        Ok(())
    }

    #[test]
    fn reads_on_missing_record_fail_with_not_found() -> Result<(), LedgerError> {
        let store = open_memory_store()?;
        let id = rid(42);
        assert_eq!(store.get_latest(id), Err(LedgerError::NotFound { id }));
        assert_eq!(store.get_as_of(id, 500), Err(LedgerError::NotFound { id }));
        assert_eq!(store.get_versions(id), Err(LedgerError::NotFound { id }));
        assert_eq!(store.get_version(id, 1), Err(LedgerError::NotFound { id }));
        Ok(())
    }

    #[test]
    fn reads_are_idempotent_without_intervening_writes() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(1);
        store.create_record(id, attrs(&[("hello", "world")]), 100)?;
        store.apply_update(id, 200, &delta(&[("status", Some("ok"))]))?;

        assert_eq!(store.get_latest(id)?, store.get_latest(id)?);
        assert_eq!(store.get_as_of(id, 150)?, store.get_as_of(id, 150)?);
        Ok(())
    }

    #[test]
    fn retroactive_update_cascades_into_later_versions() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(1);

        let created = store.create_record(id, attrs(&[("hello", "world")]), 100)?;
        assert_eq!(created.version, 1);

        let updated = store.apply_update(id, 200, &delta(&[("status", Some("ok"))]))?;
        assert_eq!(updated.version, 2);
        assert_eq!(updated.attributes, attrs(&[("hello", "world"), ("status", "ok")]));

        let retro = store.apply_update(id, 150, &delta(&[("hello", Some("world2"))]))?;
        assert_eq!(retro.version, 2);
        assert_eq!(retro.attributes, attrs(&[("hello", "world2")]));

        let versions = store.get_versions(id)?;
        assert_eq!(versions.iter().map(|record| record.version).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(versions[0].attributes, attrs(&[("hello", "world")]));
        assert_eq!(versions[1].attributes, attrs(&[("hello", "world2")]));
        assert_eq!(versions[2].attributes, attrs(&[("hello", "world2"), ("status", "ok")]));

        let as_of = store.get_as_of(id, 180)?;
        assert_eq!(as_of.effective_at, 150);
        assert_eq!(as_of.version, 2);

        let latest = store.get_latest(id)?;
        assert_eq!(latest.effective_at, 200);
        assert_eq!(latest.version, 3);
        Ok(())
    }

    #[test]
    fn retroactive_update_before_first_version_starts_from_empty() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(1);
        store.create_record(id, attrs(&[("a", "1")]), 100)?;

        let retro = store.apply_update(id, 50, &delta(&[("b", Some("2"))]))?;
        assert_eq!(retro.version, 1);
        assert_eq!(retro.attributes, attrs(&[("b", "2")]));

        let versions = store.get_versions(id)?;
        assert_eq!(versions[0].attributes, attrs(&[("b", "2")]));
        assert_eq!(versions[1].attributes, attrs(&[("a", "1"), ("b", "2")]));
        Ok(())
    }

    #[test]
    fn retroactive_insert_shifts_only_later_ranks() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(1);
        store.create_record(id, attrs(&[("v", "1")]), 100)?;
        store.apply_update(id, 200, &delta(&[("v", Some("2"))]))?;
        store.apply_update(id, 300, &delta(&[("v", Some("3"))]))?;

        let before = store.get_versions(id)?;
        store.apply_update(id, 150, &delta(&[("w", Some("x"))]))?;
        let after = store.get_versions(id)?;

        assert_eq!(after.len(), before.len() + 1);
        assert_eq!(after[0].effective_at, 100);
        assert_eq!(after[0].version, 1);
        for record in &after {
            let earlier = after.iter().filter(|r| r.effective_at < record.effective_at).count();
            assert_eq!(record.version, rank_from_index(earlier));
        }
        Ok(())
    }

    #[test]
    fn cascade_applies_deletion_markers_to_later_versions() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(1);
        store.create_record(id, attrs(&[("a", "1"), ("b", "2")]), 100)?;
        store.apply_update(id, 300, &delta(&[("c", Some("3"))]))?;

        store.apply_update(id, 200, &delta(&[("a", None)]))?;

        let versions = store.get_versions(id)?;
        assert_eq!(versions[0].attributes, attrs(&[("a", "1"), ("b", "2")]));
        assert_eq!(versions[1].attributes, attrs(&[("b", "2")]));
        assert_eq!(versions[2].attributes, attrs(&[("b", "2"), ("c", "3")]));
        Ok(())
    }

    #[test]
    fn deleting_a_missing_key_is_not_an_error() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(1);
        store.create_record(id, attrs(&[("a", "1")]), 100)?;

        let updated = store.apply_update(id, 200, &delta(&[("ghost", None)]))?;
        assert_eq!(updated.attributes, attrs(&[("a", "1")]));
        Ok(())
    }

    #[test]
    fn empty_delta_is_rejected() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(1);
        store.create_record(id, attrs(&[("a", "1")]), 100)?;
        assert_eq!(
            store.apply_update(id, 200, &AttributeDelta::default()),
            Err(LedgerError::EmptyUpdate)
        );
        Ok(())
    }

    #[test]
    fn update_on_missing_record_fails_with_not_found() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(9);
        assert_eq!(
            store.apply_update(id, 100, &delta(&[("a", Some("1"))])),
            Err(LedgerError::NotFound { id })
        );
        Ok(())
    }

    #[test]
    fn duplicate_effective_timestamp_is_rejected() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(1);
        store.create_record(id, attrs(&[("a", "1")]), 100)?;
        store.apply_update(id, 200, &delta(&[("b", Some("2"))]))?;

        assert_eq!(
            store.apply_update(id, 200, &delta(&[("c", Some("3"))])),
            Err(LedgerError::DuplicateTimestamp { id, effective_at: 200 })
        );
        // The rejected write must not have touched the chain.
        assert_eq!(store.get_versions(id)?.len(), 2);
        Ok(())
    }

    #[test]
    fn get_version_by_rank_matches_chain_order() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(1);
        store.create_record(id, attrs(&[("v", "1")]), 100)?;
        store.apply_update(id, 200, &delta(&[("v", Some("2"))]))?;
        store.apply_update(id, 300, &delta(&[("v", Some("3"))]))?;

        let versions = store.get_versions(id)?;
        for expected in &versions {
            let fetched = store.get_version(id, i64::from(expected.version))?;
            assert_eq!(&fetched, expected);
        }

        assert_eq!(store.get_version(id, 0), Err(LedgerError::InvalidVersion { version: 0 }));
        assert_eq!(store.get_version(id, -1), Err(LedgerError::InvalidVersion { version: -1 }));
        assert_eq!(store.get_version(id, 4), Err(LedgerError::NotFound { id }));
        Ok(())
    }

    #[test]
    fn as_of_before_first_version_fails_with_not_found() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(1);
        store.create_record(id, attrs(&[("a", "1")]), 100)?;
        assert_eq!(store.get_as_of(id, 100), Err(LedgerError::NotFound { id }));
        assert_eq!(store.get_as_of(id, 101)?.effective_at, 100);
        Ok(())
    }

    #[test]
    fn malformed_stored_attributes_surface_as_storage_error() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let id = rid(1);
        store.create_record(id, attrs(&[("a", "1")]), 100)?;
        store
            .conn
            .execute("UPDATE record_versions SET attributes_json = '{'", [])
            .map_err(storage("test corruption"))?;

        assert!(matches!(store.get_latest(id), Err(LedgerError::Storage(_))));
        Ok(())
    }

    #[test]
    fn updates_to_different_records_are_independent() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        let first = rid(1);
        let second = rid(2);
        store.create_record(first, attrs(&[("who", "first")]), 100)?;
        store.create_record(second, attrs(&[("who", "second")]), 100)?;

        store.apply_update(first, 200, &delta(&[("who", Some("first-v2"))]))?;

        assert_eq!(store.get_latest(second)?.attributes, attrs(&[("who", "second")]));
        assert_eq!(store.get_versions(second)?.len(), 1);
        Ok(())
    }

    #[test]
    fn backup_and_restore_round_trip() -> Result<(), LedgerError> {
        let mut source = open_memory_store()?;
        let id = rid(3);
        source.create_record(id, attrs(&[("k", "v")]), 10)?;

        let backup_file = unique_temp_path("backup");
        source.backup_database(&backup_file)?;

        let mut restored = SqliteStore::open(Path::new(":memory:"))?;
        restored.restore_database(&backup_file)?;
        assert_eq!(restored.get_latest(id)?.attributes, attrs(&[("k", "v")]));

        let _ = fs::remove_file(&backup_file);
        Ok(())
    }

    #[test]
    fn export_and_import_round_trip() -> Result<(), LedgerError> {
        let mut source = open_memory_store()?;
        let id = rid(7);
        source.create_record(id, attrs(&[("hello", "world")]), 100)?;
        source.apply_update(id, 200, &delta(&[("status", Some("ok"))]))?;

        let out_dir = unique_temp_path("export");
        let manifest = source.export_snapshot(&out_dir)?;
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.schema_version, LATEST_SCHEMA_VERSION);

        let mut target = open_memory_store()?;
        let summary = target.import_snapshot(&out_dir, true)?;
        assert_eq!(summary.imported_records, 1);
        assert_eq!(summary.imported_versions, 2);
        assert_eq!(target.get_versions(id)?, source.get_versions(id)?);

        let again = target.import_snapshot(&out_dir, true)?;
        assert_eq!(again.imported_versions, 0);
        assert_eq!(again.skipped_existing_versions, 2);

        let _ = fs::remove_dir_all(&out_dir);
        Ok(())
    }

    #[test]
    fn import_rejects_tampered_snapshot() -> Result<(), LedgerError> {
        let mut source = open_memory_store()?;
        let id = rid(7);
        source.create_record(id, attrs(&[("hello", "world")]), 100)?;

        let out_dir = unique_temp_path("tampered");
        source.export_snapshot(&out_dir)?;

        let versions_file = out_dir.join("record_versions.ndjson");
        let mut contents = fs::read_to_string(&versions_file)
            .map_err(storage("failed to read exported versions"))?;
        contents.push_str("{\"record_id\":7,\"effective_at\":999,\"reported_at\":999,\"attributes\":{}}\n");
        fs::write(&versions_file, contents).map_err(storage("failed to tamper snapshot"))?;

        let mut target = open_memory_store()?;
        assert!(matches!(target.import_snapshot(&out_dir, true), Err(LedgerError::Storage(_))));

        let _ = fs::remove_dir_all(&out_dir);
        Ok(())
    }

    #[test]
    fn integrity_check_reports_healthy_database() -> Result<(), LedgerError> {
        let mut store = open_memory_store()?;
        store.create_record(rid(1), attrs(&[("a", "1")]), 100)?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }
}
