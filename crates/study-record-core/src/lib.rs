//! Study session records, the store boundary they persist through, and the
//! list projection shown to presentation layers.
//!
//! The backing table is the only source of truth. [`RecordList`] never
//! patches its snapshot in place: every successful mutation is followed by a
//! full [`RecordStore::get_all_records`] call whose result replaces the
//! previous [`Projection`] wholesale, and [`total_time`] is recomputed from
//! that new snapshot.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

pub mod memory;

/// Logical name of the backing table.
pub const RECORD_TABLE: &str = "study_record";

/// Display ceiling shown next to the running total. Not enforced anywhere.
pub const TOTAL_TIME_GOAL_HOURS: u64 = 1000;

/// Failure reported by the backing table during a CRUD call.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    /// The backing table rejected the call. `message` is passed through
    /// exactly as the table reported it.
    #[error("{message}")]
    Backend { message: String },
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout { operation: String, timeout_ms: u64 },
}

impl StoreError {
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ValidationError {
    #[error("validation failed: title MUST be provided")]
    MissingTitle,
    #[error("validation failed: time MUST be >= 1 hour")]
    TimeBelowMinimum,
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("invalid RFC3339 timestamp: {0}")]
pub struct TimestampError(String);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// One study session as stored in the backing table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    pub id: RecordId,
    pub title: String,
    /// Whole hours studied.
    pub time: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Record {
    /// Retrieval order: `created_at` ascending, then `id` ascending.
    #[must_use]
    pub fn retrieval_order(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

/// Sorts records into retrieval order.
pub fn sort_records(records: &mut [Record]) {
    records.sort_by(Record::retrieval_order);
}

#[must_use]
pub fn is_retrieval_ordered(records: &[Record]) -> bool {
    records
        .windows(2)
        .all(|pair| pair[0].retrieval_order(&pair[1]) != Ordering::Greater)
}

/// Title and hours submitted by a presentation layer for insert or update.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewRecord {
    pub title: String,
    pub time: u32,
}

impl NewRecord {
    #[must_use]
    pub fn new(title: impl Into<String>, time: u32) -> Self {
        Self {
            title: title.into(),
            time,
        }
    }

    /// Checks the input rules presentation layers apply before submitting.
    ///
    /// Stores never call this; they persist whatever they are given.
    ///
    /// # Errors
    /// Returns [`ValidationError`] when the title is blank or `time` is 0.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::MissingTitle);
        }

        if self.time < 1 {
            return Err(ValidationError::TimeBelowMinimum);
        }

        Ok(())
    }
}

/// Ordered CRUD over [`Record`]s backed by an opaque table.
///
/// Every call is a single round trip with no retry. Update and delete of an
/// id that matches no row succeed without effect.
pub trait RecordStore {
    /// Returns every record in retrieval order.
    ///
    /// # Errors
    /// Returns [`StoreError`] carrying the backing table's message.
    fn get_all_records(&self) -> Result<Vec<Record>, StoreError>;

    /// Persists a new record; the table assigns `id` and `created_at`.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the backing table rejects the row.
    fn insert_record(&mut self, title: &str, time: u32) -> Result<(), StoreError>;

    /// Replaces `title` and `time` of the record matching `id`.
    ///
    /// # Errors
    /// Returns [`StoreError`] only for backing-table failures, never for a
    /// missing id.
    fn update_record(&mut self, id: RecordId, title: &str, time: u32) -> Result<(), StoreError>;

    /// Hard-deletes the record matching `id`.
    ///
    /// # Errors
    /// Returns [`StoreError`] only for backing-table failures, never for a
    /// missing id.
    fn delete_record(&mut self, id: RecordId) -> Result<(), StoreError>;
}

impl<S: RecordStore + ?Sized> RecordStore for &mut S {
    fn get_all_records(&self) -> Result<Vec<Record>, StoreError> {
        (**self).get_all_records()
    }

    fn insert_record(&mut self, title: &str, time: u32) -> Result<(), StoreError> {
        (**self).insert_record(title, time)
    }

    fn update_record(&mut self, id: RecordId, title: &str, time: u32) -> Result<(), StoreError> {
        (**self).update_record(id, title, time)
    }

    fn delete_record(&mut self, id: RecordId) -> Result<(), StoreError> {
        (**self).delete_record(id)
    }
}

/// Sum of `time` across `records`.
#[must_use]
pub fn total_time(records: &[Record]) -> u64 {
    records.iter().map(|record| u64::from(record.time)).sum()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct TotalTime {
    pub hours: u64,
    pub goal_hours: u64,
}

impl TotalTime {
    #[must_use]
    pub fn of(records: &[Record]) -> Self {
        Self {
            hours: total_time(records),
            goal_hours: TOTAL_TIME_GOAL_HOURS,
        }
    }
}

impl Display for TotalTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}(h)", self.hours, self.goal_hours)
    }
}

/// Snapshot of the full table taken right after a refresh.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Projection {
    pub records: Vec<Record>,
    pub total_hours: u64,
    pub goal_hours: u64,
}

impl Projection {
    #[must_use]
    pub fn from_records(records: Vec<Record>) -> Self {
        let total = TotalTime::of(&records);
        Self {
            records,
            total_hours: total.hours,
            goal_hours: total.goal_hours,
        }
    }

    #[must_use]
    pub fn total(&self) -> TotalTime {
        TotalTime {
            hours: self.total_hours,
            goal_hours: self.goal_hours,
        }
    }
}

/// The presentation-facing list, kept consistent by invalidate-then-refetch.
///
/// A failed mutation leaves the current snapshot untouched. A successful
/// mutation whose refetch fails leaves the list invalidated
/// ([`RecordList::projection`] returns `None`) rather than showing rows the
/// table may no longer hold.
#[derive(Debug)]
pub struct RecordList<S> {
    store: S,
    projection: Option<Projection>,
}

impl<S: RecordStore> RecordList<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            store,
            projection: None,
        }
    }

    /// Builds a list and performs the initial fetch.
    ///
    /// # Errors
    /// Returns [`StoreError`] when the initial retrieval fails.
    pub fn load(store: S) -> Result<Self, StoreError> {
        let mut list = Self::new(store);
        list.refresh()?;
        Ok(list)
    }

    /// Drops the current snapshot and replaces it with a full re-fetch.
    ///
    /// # Errors
    /// Returns [`StoreError`] from retrieval; the list stays invalidated.
    pub fn refresh(&mut self) -> Result<&Projection, StoreError> {
        self.projection = None;
        let records = self.store.get_all_records()?;
        let projection = Projection::from_records(records);
        tracing::debug!(
            records = projection.records.len(),
            total_hours = projection.total_hours,
            "record list refreshed"
        );
        Ok(self.projection.insert(projection))
    }

    /// # Errors
    /// Returns [`StoreError`] from the insert or the follow-up refresh.
    pub fn insert(&mut self, input: &NewRecord) -> Result<&Projection, StoreError> {
        self.store.insert_record(&input.title, input.time)?;
        self.refresh()
    }

    /// # Errors
    /// Returns [`StoreError`] from the update or the follow-up refresh.
    pub fn update(&mut self, id: RecordId, input: &NewRecord) -> Result<&Projection, StoreError> {
        self.store.update_record(id, &input.title, input.time)?;
        self.refresh()
    }

    /// # Errors
    /// Returns [`StoreError`] from the delete or the follow-up refresh.
    pub fn delete(&mut self, id: RecordId) -> Result<&Projection, StoreError> {
        self.store.delete_record(id)?;
        self.refresh()
    }

    #[must_use]
    pub fn projection(&self) -> Option<&Projection> {
        self.projection.as_ref()
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.projection.is_some()
    }

    /// Records of the current snapshot; empty while invalidated.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        self.projection
            .as_ref()
            .map(|projection| projection.records.as_slice())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn total(&self) -> TotalTime {
        TotalTime::of(self.records())
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Releases the store, dropping the current snapshot.
    #[must_use]
    pub fn into_store(self) -> S {
        self.store
    }
}

/// Parses an RFC3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns [`TimestampError`] when `value` is not RFC3339.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, TimestampError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| TimestampError(format!("{value:?}: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`TimestampError`] when the value cannot be represented.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, TimestampError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| TimestampError(format!("failed to format: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
