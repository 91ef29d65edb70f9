use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use blacklist_psi_core::{
    BehaviorEvent, BehaviorType, IdentityRecord, IdentityWithEvents, RiskLevel, ToolType,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS blacklist_identities (
  owner_key INTEGER PRIMARY KEY,
  identity TEXT NOT NULL CHECK (length(trim(identity)) > 0),
  risk_level INTEGER NOT NULL CHECK (risk_level IN (1, 2, 3)),
  behavior_count INTEGER NOT NULL CHECK (behavior_count BETWEEN 0 AND 15)
);

CREATE TABLE IF NOT EXISTS blacklist_behaviors (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  owner_key INTEGER NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  behavior_type INTEGER NOT NULL CHECK (behavior_type IN (1, 2, 3)),
  tool_type INTEGER NOT NULL CHECK (tool_type IN (1, 2, 3)),
  UNIQUE(owner_key, position),
  FOREIGN KEY (owner_key) REFERENCES blacklist_identities(owner_key)
);

CREATE TABLE IF NOT EXISTS population_state (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  population_version INTEGER NOT NULL CHECK (population_version >= 0),
  replaced_at TEXT
);

INSERT OR IGNORE INTO population_state(id, population_version, replaced_at) VALUES (1, 0, NULL);

CREATE INDEX IF NOT EXISTS idx_blacklist_behaviors_owner ON blacklist_behaviors(owner_key, position);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
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
    /// Identities whose stored `behavior_count` disagrees with their behavior rows.
    pub behavior_count_mismatches: u64,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PopulationStatus {
    pub size: u64,
    pub population_version: i64,
    pub replaced_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub replaced: usize,
    pub behavior_events: usize,
    pub population_version: i64,
}

/// Identities read inside one transaction, tagged with the population they belong to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistSnapshot {
    pub population_version: i64,
    pub identities: Vec<IdentityWithEvents>,
}

impl SqliteStore {
    /// Open a SQLite-backed blacklist store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.apply_migration_1()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        if table_exists(&self.conn, "blacklist_identities")?
            && !table_exists(&self.conn, "population_state")?
        {
            return Err(anyhow!(
                "database schema is invalid: blacklist_identities exists without population_state"
            ));
        }

        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(())
    }

    /// Replace the whole blacklist population in one write transaction.
    ///
    /// Every identity is validated before anything is written. Concurrent
    /// snapshot readers see either the old population or the new one.
    ///
    /// # Errors
    /// Returns an error when validation fails or any write in the transaction fails;
    /// the previous population is left untouched in both cases.
    pub fn replace_all(&mut self, identities: &[IdentityWithEvents]) -> Result<ReplaceSummary> {
        for identity in identities {
            identity.validate().with_context(|| {
                format!("identity {} failed validation", identity.record.owner_key)
            })?;
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start replace transaction")?;

        tx.execute("DELETE FROM blacklist_behaviors", [])
            .context("failed to clear blacklist_behaviors")?;
        tx.execute("DELETE FROM blacklist_identities", [])
            .context("failed to clear blacklist_identities")?;

        let mut behavior_events = 0_usize;
        {
            let mut insert_identity = tx
                .prepare(
                    "INSERT INTO blacklist_identities(owner_key, identity, risk_level, behavior_count)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .context("failed to prepare identity insert")?;
            let mut insert_behavior = tx
                .prepare(
                    "INSERT INTO blacklist_behaviors(owner_key, position, behavior_type, tool_type)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .context("failed to prepare behavior insert")?;

            for identity in identities {
                let record = &identity.record;
                insert_identity
                    .execute(params![
                        record.owner_key,
                        record.identity,
                        record.risk_level.code(),
                        record.behavior_count,
                    ])
                    .with_context(|| {
                        format!("failed to insert blacklist identity {}", record.owner_key)
                    })?;

                for (position, event) in identity.events.iter().enumerate() {
                    insert_behavior
                        .execute(params![
                            record.owner_key,
                            i64::try_from(position).context("behavior position overflow")?,
                            event.behavior_type.code(),
                            event.tool.code(),
                        ])
                        .with_context(|| {
                            format!("failed to insert behavior event for {}", record.owner_key)
                        })?;
                    behavior_events += 1;
                }
            }
        }

        let now = now_rfc3339()?;
        tx.execute(
            "UPDATE population_state
             SET population_version = population_version + 1, replaced_at = ?1
             WHERE id = 1",
            params![now],
        )
        .context("failed to bump population_version")?;
        let population_version = read_population_version(&tx)?;

        tx.commit().context("failed to commit replace transaction")?;

        tracing::info!(
            replaced = identities.len(),
            behavior_events,
            population_version,
            "blacklist population replaced"
        );

        Ok(ReplaceSummary { replaced: identities.len(), behavior_events, population_version })
    }

    /// Read every identity with its ordered events inside one read transaction.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or hold codes outside the closed sets.
    pub fn load_snapshot(&mut self) -> Result<BlacklistSnapshot> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .context("failed to start snapshot transaction")?;

        let population_version = read_population_version(&tx)?;

        let mut identities = Vec::new();
        let mut index_by_owner = HashMap::new();
        {
            let mut stmt = tx
                .prepare(
                    "SELECT owner_key, identity, risk_level, behavior_count
                     FROM blacklist_identities
                     ORDER BY owner_key ASC",
                )
                .context("failed to prepare identity snapshot query")?;
            let mut rows = stmt.query([])?;

            while let Some(row) = rows.next()? {
                let owner_key: i64 = row.get(0)?;
                let risk_code: i64 = row.get(2)?;
                let behavior_count: i64 = row.get(3)?;
                let record = IdentityRecord {
                    owner_key,
                    identity: row.get(1)?,
                    risk_level: RiskLevel::from_code(small_code(risk_code)?)
                        .ok_or_else(|| anyhow!("unknown risk_level code: {risk_code}"))?,
                    behavior_count: small_code(behavior_count)?,
                };
                index_by_owner.insert(owner_key, identities.len());
                identities.push(IdentityWithEvents { record, events: Vec::new() });
            }
        }

        {
            let mut stmt = tx
                .prepare(
                    "SELECT owner_key, behavior_type, tool_type
                     FROM blacklist_behaviors
                     ORDER BY owner_key ASC, position ASC",
                )
                .context("failed to prepare behavior snapshot query")?;
            let mut rows = stmt.query([])?;

            while let Some(row) = rows.next()? {
                let owner_key: i64 = row.get(0)?;
                let behavior_code: i64 = row.get(1)?;
                let tool_code: i64 = row.get(2)?;
                let Some(&index) = index_by_owner.get(&owner_key) else {
                    return Err(anyhow!("behavior row references missing identity {owner_key}"));
                };
                identities[index].events.push(BehaviorEvent {
                    owner_key,
                    behavior_type: BehaviorType::from_code(small_code(behavior_code)?)
                        .ok_or_else(|| anyhow!("unknown behavior_type code: {behavior_code}"))?,
                    tool: ToolType::from_code(small_code(tool_code)?)
                        .ok_or_else(|| anyhow!("unknown tool_type code: {tool_code}"))?,
                });
            }
        }

        tx.commit().context("failed to close snapshot transaction")?;

        Ok(BlacklistSnapshot { population_version, identities })
    }

    /// Report the population size and version.
    ///
    /// # Errors
    /// Returns an error when the population tables cannot be read.
    pub fn population_status(&self) -> Result<PopulationStatus> {
        let size: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM blacklist_identities", [], |row| row.get(0))
            .context("failed to count blacklist identities")?;
        let (population_version, replaced_at) = self
            .conn
            .query_row(
                "SELECT population_version, replaced_at FROM population_state WHERE id = 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
            .context("failed to read population_state")?
            .unwrap_or((0, None));

        Ok(PopulationStatus {
            size: u64::try_from(size).context("negative identity count")?,
            population_version,
            replaced_at,
        })
    }

    /// Run quick-check, foreign-key-check, behavior-count, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let behavior_count_mismatches = if table_exists(&self.conn, "blacklist_identities")? {
            let mismatches: i64 = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM blacklist_identities i
                     WHERE i.behavior_count != (
                       SELECT COUNT(*) FROM blacklist_behaviors b WHERE b.owner_key = i.owner_key
                     )",
                    [],
                    |row| row.get(0),
                )
                .context("failed to count behavior_count mismatches")?;
            u64::try_from(mismatches).context("negative mismatch count")?
        } else {
            0
        };

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            behavior_count_mismatches,
            schema_status,
        })
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn read_population_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT population_version FROM population_state WHERE id = 1", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read population_version")
}

fn small_code(value: i64) -> Result<u8> {
    u8::try_from(value).with_context(|| format!("stored code out of range: {value}"))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::thread;

    use super::*;
    use ulid::Ulid;

    fn mk_identity(
        owner_key: i64,
        identity: &str,
        risk_level: RiskLevel,
        events: &[(BehaviorType, ToolType)],
    ) -> IdentityWithEvents {
        IdentityWithEvents {
            record: IdentityRecord {
                owner_key,
                identity: identity.to_string(),
                risk_level,
                behavior_count: u8::try_from(events.len()).unwrap_or(u8::MAX),
            },
            events: events
                .iter()
                .map(|&(behavior_type, tool)| BehaviorEvent { owner_key, behavior_type, tool })
                .collect(),
        }
    }

    fn mk_population(size: i64, events_per_identity: usize) -> Vec<IdentityWithEvents> {
        (1..=size)
            .map(|owner_key| {
                let events = vec![(BehaviorType::Complain, ToolType::Lighter); events_per_identity];
                mk_identity(owner_key, &format!("5101{owner_key:014}"), RiskLevel::B, &events)
            })
            .collect()
    }

    fn migrated_memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn cleanup_db(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = if suffix.is_empty() {
                db_path.to_path_buf()
            } else {
                PathBuf::from(format!("{}{}", db_path.display(), suffix))
            };
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    // Test IDs: TSTORE-001
    #[test]
    fn schema_status_reports_pending_then_applied_migration() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;

        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());

        Ok(())
    }

    // Test IDs: TSTORE-002
    #[test]
    fn sqlite_checks_reject_codes_outside_closed_sets() -> Result<()> {
        let store = migrated_memory_store()?;

        let bad_risk = store.conn.execute(
            "INSERT INTO blacklist_identities(owner_key, identity, risk_level, behavior_count)
             VALUES (1, 'x', 4, 0)",
            [],
        );
        assert!(bad_risk.is_err());

        let blank_identity = store.conn.execute(
            "INSERT INTO blacklist_identities(owner_key, identity, risk_level, behavior_count)
             VALUES (2, '   ', 1, 0)",
            [],
        );
        assert!(blank_identity.is_err());

        let orphan_behavior = store.conn.execute(
            "INSERT INTO blacklist_behaviors(owner_key, position, behavior_type, tool_type)
             VALUES (99, 0, 1, 1)",
            [],
        );
        assert!(orphan_behavior.is_err());

        Ok(())
    }

    // Test IDs: TSTORE-003
    #[test]
    fn replace_and_snapshot_preserve_event_order() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let first = mk_identity(
            10,
            "110105194912310021",
            RiskLevel::B,
            &[
                (BehaviorType::Hide, ToolType::Other),
                (BehaviorType::Complain, ToolType::Knife),
                (BehaviorType::Other, ToolType::Lighter),
            ],
        );
        let second = mk_identity(11, "110105194912310022", RiskLevel::C, &[]);

        let summary = store.replace_all(&[first.clone(), second.clone()])?;
        assert_eq!(summary.replaced, 2);
        assert_eq!(summary.behavior_events, 3);
        assert_eq!(summary.population_version, 1);

        let snapshot = store.load_snapshot()?;
        assert_eq!(snapshot.population_version, 1);
        assert_eq!(snapshot.identities, vec![first.clone(), second]);
        assert_eq!(snapshot.identities[0].labels(), first.labels());

        Ok(())
    }

    // Test IDs: TSTORE-004
    #[test]
    fn replace_all_swaps_population_and_bumps_version() -> Result<()> {
        let mut store = migrated_memory_store()?;
        assert_eq!(store.population_status()?.population_version, 0);

        store.replace_all(&mk_population(5, 1))?;
        let summary = store.replace_all(&mk_population(3, 2))?;
        assert_eq!(summary.population_version, 2);

        let status = store.population_status()?;
        assert_eq!(status.size, 3);
        assert_eq!(status.population_version, 2);
        assert!(status.replaced_at.is_some());

        let snapshot = store.load_snapshot()?;
        assert_eq!(snapshot.identities.len(), 3);
        assert!(snapshot.identities.iter().all(|identity| identity.events.len() == 2));

        store.replace_all(&[])?;
        assert_eq!(store.population_status()?.size, 0);
        assert_eq!(store.population_status()?.population_version, 3);

        Ok(())
    }

    // Test IDs: TSTORE-005
    #[test]
    fn invalid_population_leaves_previous_one_untouched() -> Result<()> {
        let mut store = migrated_memory_store()?;
        store.replace_all(&mk_population(4, 1))?;

        let mut invalid = mk_population(2, 1);
        invalid[1].record.behavior_count = 3;
        let Err(err) = store.replace_all(&invalid) else {
            return Err(anyhow!("count mismatch should be rejected"));
        };
        assert!(err.to_string().contains("failed validation"));

        let duplicate_owner = vec![
            mk_identity(1, "a", RiskLevel::A, &[]),
            mk_identity(1, "b", RiskLevel::A, &[]),
        ];
        assert!(store.replace_all(&duplicate_owner).is_err());

        let status = store.population_status()?;
        assert_eq!(status.size, 4);
        assert_eq!(status.population_version, 1);

        Ok(())
    }

    // Test IDs: TSTORE-006
    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let mut store = migrated_memory_store()?;
        store.replace_all(&mk_population(3, 2))?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.behavior_count_mismatches, 0);
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);

        store.conn.execute("UPDATE blacklist_identities SET behavior_count = 1 WHERE owner_key = 1", [])?;
        assert_eq!(store.integrity_check()?.behavior_count_mismatches, 1);

        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_replace_and_snapshot_never_observe_partial_population() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("blacklist-psi-concurrency-{}.sqlite3", Ulid::new()));
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            init.replace_all(&mk_population(10, 1))?;
        }

        let mut handles = Vec::new();

        let writer_path = db_path.clone();
        handles.push(thread::spawn(move || -> Result<()> {
            let mut store = SqliteStore::open(&writer_path)?;
            for round in 0..20 {
                let population =
                    if round % 2 == 0 { mk_population(25, 2) } else { mk_population(10, 1) };
                store.replace_all(&population)?;
            }
            Ok(())
        }));

        for _ in 0..2 {
            let reader_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                let mut store = SqliteStore::open(&reader_path)?;
                for _ in 0..30 {
                    let snapshot = store.load_snapshot()?;
                    let size = snapshot.identities.len();
                    if size != 10 && size != 25 {
                        return Err(anyhow!("observed partial population of {size} identities"));
                    }
                    let expected_events = if size == 25 { 2 } else { 1 };
                    if snapshot.identities.iter().any(|identity| identity.events.len() != expected_events)
                    {
                        return Err(anyhow!("observed events from a different population"));
                    }
                }
                Ok(())
            }));
        }

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteStore::open(&db_path)?;
        let status = store.population_status()?;
        assert_eq!(status.population_version, 21);
        assert_eq!(status.size, 10);
        assert!(store.integrity_check()?.quick_check_ok);

        cleanup_db(&db_path)
    }
}
