#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use study_record_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, Record, RecordId, RecordStore, StoreError,
    RECORD_TABLE,
};

const STUDY_RECORD_MIGRATION_VERSION: i64 = 1;
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

// created_at is assigned by the table itself as fixed-width UTC milliseconds.
const SCHEMA_STUDY_RECORD_V1: &str = r"
CREATE TABLE IF NOT EXISTS study_record (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  title TEXT NOT NULL,
  time INTEGER NOT NULL,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
";

const REQUIRED_COLUMNS: [&str; 4] = ["id", "title", "time", "created_at"];

pub struct SqliteRecordStore {
    conn: Connection,
    busy_timeout: Duration,
}

impl SqliteRecordStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .context("failed to configure sqlite pragmas")?;
        conn.busy_timeout(busy_timeout)
            .context("failed to configure sqlite busy timeout")?;

        tracing::debug!(
            path = %path.display(),
            busy_timeout_ms = duration_millis(busy_timeout),
            "opened record store"
        );
        Ok(Self { conn, busy_timeout })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        if table_exists(&self.conn, RECORD_TABLE)? {
            ensure_table_has_columns(&self.conn, RECORD_TABLE, &REQUIRED_COLUMNS)?;
        }

        self.conn
            .execute_batch(SCHEMA_STUDY_RECORD_V1)
            .context("failed to apply study_record schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        let applied = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STUDY_RECORD_MIGRATION_VERSION, now],
            )
            .context("failed to register study_record schema migration")?;

        if applied > 0 {
            tracing::info!(
                version = STUDY_RECORD_MIGRATION_VERSION,
                "applied study_record schema migration"
            );
        }

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        let version = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()
            .context("failed to read schema_migrations")?
            .flatten();
        Ok(version)
    }

    pub fn record_count(&self) -> Result<usize, StoreError> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM study_record", [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(|err| self.store_error("record_count", &err))?;
        usize::try_from(count)
            .map_err(|_| StoreError::backend(format!("invalid study_record count: {count}")))
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    fn store_error(&self, operation: &str, err: &rusqlite::Error) -> StoreError {
        if err.sqlite_error_code() == Some(ErrorCode::DatabaseBusy) {
            let timeout_ms = duration_millis(self.busy_timeout);
            tracing::warn!(operation, timeout_ms, "study_record table stayed locked");
            return StoreError::timeout(operation, timeout_ms);
        }

        tracing::warn!(operation, error = %err, "study_record operation failed");
        StoreError::backend(err.to_string())
    }
}

impl RecordStore for SqliteRecordStore {
    fn get_all_records(&self) -> Result<Vec<Record>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, title, time, created_at
                 FROM study_record
                 ORDER BY julianday(created_at) ASC, id ASC",
            )
            .map_err(|err| self.store_error("get_all_records", &err))?;

        let mut rows = stmt
            .query([])
            .map_err(|err| self.store_error("get_all_records", &err))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|err| self.store_error("get_all_records", &err))?
        {
            let raw = read_row(row).map_err(|err| self.store_error("get_all_records", &err))?;
            records.push(raw.into_record()?);
        }

        Ok(records)
    }

    fn insert_record(&mut self, title: &str, time: u32) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO study_record(title, time) VALUES (?1, ?2)",
                params![title, i64::from(time)],
            )
            .map_err(|err| self.store_error("insert_record", &err))?;

        tracing::debug!(
            id = self.conn.last_insert_rowid(),
            "inserted study_record row"
        );
        Ok(())
    }

    fn update_record(&mut self, id: RecordId, title: &str, time: u32) -> Result<(), StoreError> {
        let affected = self
            .conn
            .execute(
                "UPDATE study_record SET title = ?1, time = ?2 WHERE id = ?3",
                params![title, i64::from(time), id.0],
            )
            .map_err(|err| self.store_error("update_record", &err))?;

        tracing::debug!(%id, affected, "updated study_record row");
        Ok(())
    }

    fn delete_record(&mut self, id: RecordId) -> Result<(), StoreError> {
        let affected = self
            .conn
            .execute("DELETE FROM study_record WHERE id = ?1", params![id.0])
            .map_err(|err| self.store_error("delete_record", &err))?;

        tracing::debug!(%id, affected, "deleted study_record row");
        Ok(())
    }
}

struct RawRecordRow {
    id: i64,
    title: String,
    time: i64,
    created_at: String,
}

impl RawRecordRow {
    fn into_record(self) -> Result<Record, StoreError> {
        let time = u32::try_from(self.time).map_err(|_| {
            StoreError::backend(format!(
                "invalid time value {} for study_record {}",
                self.time, self.id
            ))
        })?;
        let created_at = parse_rfc3339_utc(&self.created_at)
            .map_err(|err| StoreError::backend(err.to_string()))?;

        Ok(Record {
            id: RecordId(self.id),
            title: self.title,
            time,
            created_at,
        })
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRecordRow> {
    Ok(RawRecordRow {
        id: row.get(0)?,
        title: row.get(1)?,
        time: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn duration_millis(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn ensure_table_has_columns(conn: &Connection, table_name: &str, columns: &[&str]) -> Result<()> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table_name})"))
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?;
    let mut rows = stmt.query([])?;

    let mut available = Vec::new();
    while let Some(row) = rows.next()? {
        available.push(row.get::<_, String>(1)?);
    }

    for required in columns {
        if !available.iter().any(|candidate| candidate == required) {
            return Err(anyhow!(
                "existing {table_name} table is missing column {required}"
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use study_record_core::{
        is_retrieval_ordered, total_time, NewRecord, RecordList, TOTAL_TIME_GOAL_HOURS,
    };
    use ulid::Ulid;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteRecordStore {
        let store = must(SqliteRecordStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn seed_row(store: &SqliteRecordStore, id: i64, title: &str, time: u32, created_at: &str) {
        let inserted = store.connection().execute(
            "INSERT INTO study_record(id, title, time, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, title, i64::from(time), created_at],
        );
        if let Err(err) = inserted {
            panic!("failed to seed study_record fixture: {err}");
        }
    }

    fn seeded_store() -> SqliteRecordStore {
        let store = fixture_store();
        for (id, time) in [(1_i64, 1_u32), (2, 2), (3, 3), (4, 4)] {
            seed_row(
                &store,
                id,
                &format!("test{id}"),
                time,
                "2023-10-01T00:00:00Z",
            );
        }
        store
    }

    fn unique_temp_db_path(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("study-record-{label}-{}.sqlite3", Ulid::new()))
    }

    #[test]
    fn schema_contract_contains_expected_table_and_columns() {
        let store = fixture_store();
        assert!(must(table_exists(store.connection(), RECORD_TABLE)));
        must(ensure_table_has_columns(
            store.connection(),
            RECORD_TABLE,
            &REQUIRED_COLUMNS,
        ));
        assert_eq!(
            must(store.schema_version()),
            Some(STUDY_RECORD_MIGRATION_VERSION)
        );
    }

    #[test]
    fn migrate_rejects_existing_table_without_required_columns() {
        let store = must(SqliteRecordStore::open(Path::new(":memory:")));
        if let Err(err) = store
            .connection()
            .execute_batch("CREATE TABLE study_record (id INTEGER PRIMARY KEY, title TEXT);")
        {
            panic!("failed to create legacy table: {err}");
        }

        let err = match store.migrate() {
            Ok(()) => panic!("expected migrate to reject incompatible table"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("missing column time"), "{err}");
    }

    #[test]
    fn migration_is_idempotent_and_preserves_existing_data() {
        let store = seeded_store();
        must(store.migrate());
        must(store.migrate());
        assert_eq!(must(store.record_count()), 4);
    }

    #[test]
    fn insert_then_get_all_yields_one_new_record_with_fresh_id() {
        let mut store = seeded_store();
        must(store.insert_record("React", 3));

        let records = must(store.get_all_records());
        assert_eq!(records.len(), 5);
        let inserted: Vec<&Record> = records
            .iter()
            .filter(|record| record.title == "React")
            .collect();
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0].time, 3);
        assert_eq!(inserted[0].id, RecordId(5));
        assert!(inserted[0].created_at > records[0].created_at);
    }

    #[test]
    fn retrieval_orders_by_created_at_then_id_across_precisions() {
        let store = fixture_store();
        seed_row(&store, 10, "late", 1, "2023-10-02T00:00:00Z");
        seed_row(&store, 7, "tie-b", 1, "2023-10-01T12:00:00.000Z");
        seed_row(&store, 3, "tie-a", 1, "2023-10-01T12:00:00Z");
        seed_row(&store, 8, "fraction", 1, "2023-10-01T12:00:00.500Z");
        seed_row(&store, 9, "early", 1, "2023-09-30T00:00:00Z");

        let records = must(store.get_all_records());
        let ids: Vec<i64> = records.iter().map(|record| record.id.0).collect();
        assert_eq!(ids, vec![9, 3, 7, 8, 10]);
        assert!(is_retrieval_ordered(&records));
    }

    #[test]
    fn update_replaces_title_and_time_only() {
        let mut store = seeded_store();
        let before = must(store.get_all_records());

        must(store.update_record(RecordId(4), "Test444", 10));
        let after = must(store.get_all_records());

        assert_eq!(after.len(), 4);
        assert_eq!(after[3].id, RecordId(4));
        assert_eq!(after[3].title, "Test444");
        assert_eq!(after[3].time, 10);
        assert_eq!(after[3].created_at, before[3].created_at);
        assert_eq!(after[..3], before[..3]);
    }

    #[test]
    fn update_and_delete_of_missing_id_are_silent_no_ops() {
        let mut store = seeded_store();
        let before = must(store.get_all_records());

        must(store.update_record(RecordId(999), "x", 1));
        must(store.delete_record(RecordId(999)));

        assert_eq!(must(store.get_all_records()), before);
    }

    #[test]
    fn delete_removes_exactly_one_row() {
        let mut store = seeded_store();
        must(store.delete_record(RecordId(2)));

        let records = must(store.get_all_records());
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|record| record.id != RecordId(2)));
    }

    #[test]
    fn record_list_scenarios_track_total_against_goal() {
        let mut list = must(RecordList::load(seeded_store()));
        assert_eq!(list.total().hours, 10);
        assert_eq!(list.total().goal_hours, TOTAL_TIME_GOAL_HOURS);

        let inserted = must(list.insert(&NewRecord::new("React", 3)));
        assert_eq!((inserted.records.len(), inserted.total_hours), (5, 13));

        let updated = must(list.update(RecordId(1), &NewRecord::new("React(edit)", 5)));
        assert_eq!((updated.records.len(), updated.total_hours), (5, 17));

        let deleted = must(list.delete(RecordId(1)));
        assert_eq!((deleted.records.len(), deleted.total_hours), (4, 12));
        assert_eq!(list.total().to_string(), "12/1000(h)");
    }

    #[test]
    fn backend_errors_are_passed_through_verbatim() {
        let mut store = seeded_store();
        if let Err(err) = store.connection().execute_batch(
            "CREATE TRIGGER trg_study_record_reject_blocked
             BEFORE INSERT ON study_record
             WHEN NEW.title = 'blocked'
             BEGIN
               SELECT RAISE(ABORT, 'title blocked by policy');
             END;",
        ) {
            panic!("failed to install rejection trigger: {err}");
        }

        let err = match store.insert_record("blocked", 1) {
            Ok(()) => panic!("expected insert rejection"),
            Err(err) => err,
        };
        assert_eq!(err, StoreError::backend("title blocked by policy"));

        if let Err(err) = store.connection().execute_batch("DROP TABLE study_record;") {
            panic!("failed to drop table: {err}");
        }
        let err = match store.get_all_records() {
            Ok(_) => panic!("expected missing table failure"),
            Err(err) => err,
        };
        assert_eq!(err.to_string(), "no such table: study_record");
    }

    #[test]
    fn invalid_stored_timestamp_is_reported_clearly() {
        let store = fixture_store();
        seed_row(&store, 1, "bad", 1, "not-a-timestamp");

        let err = match store.get_all_records() {
            Ok(_) => panic!("expected timestamp failure"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("invalid RFC3339 timestamp"), "{err}");
    }

    #[test]
    fn locked_table_surfaces_as_timeout() {
        let db_path = unique_temp_db_path("lock");
        let setup = must(SqliteRecordStore::open(&db_path));
        must(setup.migrate());
        drop(setup);

        let lock_conn = match Connection::open(&db_path) {
            Ok(value) => value,
            Err(err) => panic!("failed to open lock connection: {err}"),
        };
        if let Err(err) = lock_conn.execute_batch("BEGIN IMMEDIATE;") {
            panic!("failed to acquire write lock: {err}");
        }

        let mut store = must(SqliteRecordStore::open_with_busy_timeout(
            &db_path,
            Duration::from_millis(50),
        ));
        assert_eq!(store.busy_timeout(), Duration::from_millis(50));
        let err = match store.insert_record("locked", 1) {
            Ok(()) => panic!("expected busy timeout"),
            Err(err) => err,
        };
        assert_eq!(err, StoreError::timeout("insert_record", 50));

        if let Err(err) = lock_conn.execute_batch("COMMIT;") {
            panic!("failed to release write lock: {err}");
        }
        must(store.insert_record("unlocked", 1));
        assert_eq!(must(store.record_count()), 1);

        drop(store);
        drop(lock_conn);
        let _ = std::fs::remove_file(&db_path);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn retrieval_is_ordered_and_totals_match(
            rows in proptest::collection::vec((1_u32..500, 0_u8..4), 0..24),
        ) {
            let store = fixture_store();
            let mut expected_total = 0_u64;
            for (index, (time, day)) in rows.iter().enumerate() {
                let id = i64::try_from(index).unwrap_or(i64::MAX) + 1;
                seed_row(&store, id, "p", *time, &format!("2024-01-0{}T00:00:00Z", day + 1));
                expected_total += u64::from(*time);
            }

            let records = match store.get_all_records() {
                Ok(records) => records,
                Err(err) => panic!("get_all_records failed: {err}"),
            };
            prop_assert_eq!(records.len(), rows.len());
            prop_assert!(is_retrieval_ordered(&records));
            prop_assert_eq!(total_time(&records), expected_total);
        }
    }
}
