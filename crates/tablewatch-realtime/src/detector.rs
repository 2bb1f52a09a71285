//! Change detection
//!
//! Issues one bounded query per poll and turns the returned rows into
//! [`ChangeEvent`]s. Detection and commit are separate steps: [`ChangeDetector::detect`]
//! never touches the cursor, [`ChangeDetector::commit`] advances it once the
//! batch has been handed off.
//!
//! Detection runs over the whole table. Per-view filters only shape the
//! snapshot a job publishes, so a row leaving a view is still seen as a change.

use std::sync::Arc;

use tracing::debug;

use tablewatch_common::config::EntityConfig;
use tablewatch_common::{
    ChangeEvent, Error, Operation, Result, Row, TableSchema, TriggerMode, Watermark,
};

use crate::cleanup::{strategy_for, CleanupStrategy};
use crate::cursor::CursorTracker;
use crate::source::{RowPredicate, RowQuery, RowSource};

const UPDATE_HINTS: &[&str] = &[
    "updated_at",
    "modified_at",
    "last_modified",
    "last_modified_at",
    "last_updated",
    "updated_on",
    "modified_date",
];

const CREATE_HINTS: &[&str] = &[
    "created_at",
    "inserted_at",
    "created_on",
    "creation_date",
    "created_date",
    "date_created",
];

const GENERIC_HINTS: &[&str] = &["timestamp", "event_time", "ts"];

const SUFFIX_HINTS: &[&str] = &["_at", "_timestamp", "_date", "_time", "_on"];

/// Pick the change-tracking column for an entity: the configured one if set,
/// otherwise the first schema column matching a timestamp naming pattern.
pub fn resolve_column(entity: &EntityConfig, schema: &TableSchema) -> Result<String> {
    let qualified = format!("{}.{}", entity.service, entity.entity);

    if let Some(column) = entity.explicit_column() {
        return if schema.has_column(column) {
            Ok(column.to_string())
        } else {
            Err(Error::UnresolvableColumn(format!(
                "{qualified}: configured column '{column}' not found"
            )))
        };
    }

    let (preferred, secondary) = match entity.trigger_mode {
        TriggerMode::NewRow => (CREATE_HINTS, UPDATE_HINTS),
        TriggerMode::UpdatedRow => (UPDATE_HINTS, CREATE_HINTS),
    };

    let by_name = |hints: &[&str]| {
        schema
            .columns
            .iter()
            .find(|c| hints.iter().any(|h| c.name.eq_ignore_ascii_case(h)))
    };
    let by_suffix = || {
        schema.columns.iter().find(|c| {
            let name = c.name.to_ascii_lowercase();
            SUFFIX_HINTS.iter().any(|s| name.ends_with(s))
        })
    };

    by_name(preferred)
        .or_else(|| by_name(secondary))
        .or_else(|| by_name(GENERIC_HINTS))
        .or_else(by_suffix)
        .or_else(|| schema.columns.iter().find(|c| c.is_temporal()))
        .map(|c| c.name.clone())
        .ok_or(Error::UnresolvableColumn(qualified))
}

/// Output of one detection query
#[derive(Debug, Clone, Default)]
pub struct DetectedBatch {
    pub events: Vec<ChangeEvent>,
    /// Cursor value to commit with this batch
    pub high_watermark: Option<Watermark>,
    /// Primary keys of the returned rows
    pub row_ids: Vec<serde_json::Value>,
    /// The batch only establishes the starting cursor
    pub baseline: bool,
}

impl DetectedBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Produces change events for one job without double-reporting
#[derive(Debug)]
pub struct ChangeDetector {
    table: String,
    id_field: String,
    operation: Operation,
    tracker: CursorTracker,
    /// Set once a baseline has been committed, even one over an empty table
    baselined: bool,
    batch_size: usize,
    cleanup: Arc<dyn CleanupStrategy>,
}

impl ChangeDetector {
    /// Build a detector for an entity whose change column is already resolved
    pub fn new(entity: &EntityConfig, column: &str, default_batch_size: usize) -> Self {
        let operation = match entity.trigger_mode {
            TriggerMode::NewRow => Operation::Insert,
            TriggerMode::UpdatedRow => Operation::Update,
        };
        Self {
            table: entity.table_name(),
            id_field: entity.id_field.clone(),
            operation,
            tracker: CursorTracker::new(column, entity.timezone_offset_minutes),
            baselined: false,
            batch_size: entity.batch_size.unwrap_or(default_batch_size).max(1),
            cleanup: strategy_for(entity),
        }
    }

    /// Swap the cleanup strategy
    #[must_use]
    pub fn with_cleanup(mut self, cleanup: Arc<dyn CleanupStrategy>) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn column(&self) -> &str {
        self.tracker.column()
    }

    pub fn cursor(&self) -> Option<&Watermark> {
        self.tracker.current()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether the next detection only establishes a baseline
    pub fn needs_baseline(&self) -> bool {
        self.cleanup.uses_cursor() && !self.baselined
    }

    /// Establish the starting cursor from the newest existing row
    pub async fn prime(&mut self, source: &dyn RowSource) -> Result<()> {
        if !self.needs_baseline() {
            return Ok(());
        }
        let batch = self.baseline(source).await?;
        self.commit(&batch);
        Ok(())
    }

    async fn baseline(&self, source: &dyn RowSource) -> Result<DetectedBatch> {
        let query = RowQuery::new(RowPredicate::All)
            .order_by(self.tracker.column(), true)
            .limit(1);
        let rows = source.query_rows(&self.table, &query).await?;
        let high_watermark = self.tracker.max_of(&rows);
        debug!(table = %self.table, cursor = ?high_watermark, "Baseline cursor established");
        Ok(DetectedBatch {
            high_watermark,
            baseline: true,
            ..DetectedBatch::default()
        })
    }

    /// Query the next batch of changes. Does not move the cursor.
    pub async fn detect(&self, source: &dyn RowSource) -> Result<DetectedBatch> {
        if self.needs_baseline() {
            return self.baseline(source).await;
        }

        let query = RowQuery::new(self.cleanup.predicate(&self.tracker))
            .order_by(self.tracker.column(), false)
            .limit(self.batch_size);
        let mut rows = source.query_rows(&self.table, &query).await?;

        if rows.len() >= self.batch_size && self.cleanup.uses_cursor() {
            self.trim_boundary_ties(&mut rows);
        }

        let high_watermark = self.tracker.max_of(&rows);
        let row_ids = rows
            .iter()
            .filter_map(|r| r.get(&self.id_field).cloned())
            .collect();
        let events = rows
            .into_iter()
            .map(|row| {
                let cursor = self.tracker.observe(&row);
                ChangeEvent::new(self.operation, row, cursor)
            })
            .collect();

        Ok(DetectedBatch {
            events,
            high_watermark,
            row_ids,
            baseline: false,
        })
    }

    /// A full batch may cut through rows sharing the last watermark. The `>`
    /// predicate would skip the remainder, so those rows are left for the next
    /// poll unless the whole batch shares one watermark.
    fn trim_boundary_ties(&self, rows: &mut Vec<Row>) {
        let Some(last) = rows.last().and_then(|r| self.tracker.observe(r)) else {
            return;
        };
        let keep = rows
            .iter()
            .rposition(|r| self.tracker.observe(r).as_ref() != Some(&last))
            .map_or(0, |idx| idx + 1);
        if keep > 0 {
            rows.truncate(keep);
        }
    }

    /// Advance the cursor past a delivered batch; returns whether it moved
    pub fn commit(&mut self, batch: &DetectedBatch) -> bool {
        if batch.baseline {
            self.baselined = true;
        }
        match &batch.high_watermark {
            Some(wm) => self.tracker.advance(wm.clone()),
            None => false,
        }
    }

    /// Run the cleanup strategy for a delivered batch
    pub async fn cleanup(&self, source: &dyn RowSource, batch: &DetectedBatch) -> Result<()> {
        self.cleanup
            .after_batch(source, &self.table, &batch.row_ids)
            .await
    }
}
