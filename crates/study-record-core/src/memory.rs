//! In-process backing table.
//!
//! Behaves like the hosted table as far as [`RecordStore`] callers can see:
//! ids come from a monotonically increasing sequence, `created_at` from the
//! clock, and update/delete of an unknown id touch zero rows.

use time::OffsetDateTime;

use crate::{now_utc, sort_records, Record, RecordId, RecordStore, StoreError};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum FailureScope {
    All,
    Reads,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    rows: Vec<Record>,
    last_id: i64,
    fixed_clock: Option<OffsetDateTime>,
    failure: Option<(FailureScope, String)>,
}

impl MemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the table with existing rows; the id sequence continues after
    /// the largest seeded id.
    #[must_use]
    pub fn with_records(records: Vec<Record>) -> Self {
        let last_id = records.iter().map(|record| record.id.0).max().unwrap_or(0);
        Self {
            rows: records,
            last_id,
            ..Self::default()
        }
    }

    /// Stamps every later insert with `at` instead of the wall clock.
    #[must_use]
    pub fn with_fixed_clock(mut self, at: OffsetDateTime) -> Self {
        self.fixed_clock = Some(at);
        self
    }

    /// Makes every operation fail with `message` until cleared.
    pub fn fail_with(&mut self, message: impl Into<String>) {
        self.failure = Some((FailureScope::All, message.into()));
    }

    /// Makes only retrieval fail with `message` until cleared.
    pub fn fail_reads_with(&mut self, message: impl Into<String>) {
        self.failure = Some((FailureScope::Reads, message.into()));
    }

    pub fn clear_failure(&mut self) {
        self.failure = None;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn check(&self, read: bool) -> Result<(), StoreError> {
        match &self.failure {
            Some((FailureScope::All, message)) => Err(StoreError::backend(message.clone())),
            Some((FailureScope::Reads, message)) if read => {
                Err(StoreError::backend(message.clone()))
            }
            _ => Ok(()),
        }
    }
}

impl RecordStore for MemoryRecordStore {
    fn get_all_records(&self) -> Result<Vec<Record>, StoreError> {
        self.check(true)?;
        let mut records = self.rows.clone();
        sort_records(&mut records);
        Ok(records)
    }

    fn insert_record(&mut self, title: &str, time: u32) -> Result<(), StoreError> {
        self.check(false)?;
        self.last_id += 1;
        let record = Record {
            id: RecordId(self.last_id),
            title: title.to_string(),
            time,
            created_at: self.fixed_clock.unwrap_or_else(now_utc),
        };
        tracing::debug!(id = %record.id, "memory store inserted record");
        self.rows.push(record);
        Ok(())
    }

    fn update_record(&mut self, id: RecordId, title: &str, time: u32) -> Result<(), StoreError> {
        self.check(false)?;
        let mut affected = 0_usize;
        for row in self.rows.iter_mut().filter(|row| row.id == id) {
            row.title = title.to_string();
            row.time = time;
            affected += 1;
        }
        tracing::debug!(%id, affected, "memory store updated record");
        Ok(())
    }

    fn delete_record(&mut self, id: RecordId) -> Result<(), StoreError> {
        self.check(false)?;
        let before = self.rows.len();
        self.rows.retain(|row| row.id != id);
        tracing::debug!(%id, affected = before - self.rows.len(), "memory store deleted record");
        Ok(())
    }
}
