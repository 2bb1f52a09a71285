//! Post-batch cleanup strategies for CDC mode

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use tablewatch_common::config::EntityConfig;
use tablewatch_common::{CleanupKind, Result};

use crate::cursor::CursorTracker;
use crate::source::{RowPredicate, RowSource};

/// Decides which rows a poll may return and what happens to them afterwards
#[async_trait]
pub trait CleanupStrategy: Send + Sync + fmt::Debug {
    fn kind(&self) -> CleanupKind;

    /// Selection predicate for the next poll
    fn predicate(&self, cursor: &CursorTracker) -> RowPredicate;

    /// Whether selection depends on the cursor (and so needs a baseline)
    fn uses_cursor(&self) -> bool;

    /// Runs after a batch has been delivered
    async fn after_batch(
        &self,
        source: &dyn RowSource,
        table: &str,
        row_ids: &[serde_json::Value],
    ) -> Result<()>;
}

/// Rows already delivered are excluded by the cursor predicate alone
#[derive(Debug, Default)]
pub struct TimeBasedCleanup;

#[async_trait]
impl CleanupStrategy for TimeBasedCleanup {
    fn kind(&self) -> CleanupKind {
        CleanupKind::TimeBased
    }

    fn predicate(&self, cursor: &CursorTracker) -> RowPredicate {
        cursor.predicate()
    }

    fn uses_cursor(&self) -> bool {
        true
    }

    async fn after_batch(
        &self,
        _source: &dyn RowSource,
        _table: &str,
        _row_ids: &[serde_json::Value],
    ) -> Result<()> {
        Ok(())
    }
}

/// Delivered rows are flagged in `marker_column` and excluded from then on,
/// so late rows carrying older timestamps are still picked up.
#[derive(Debug)]
pub struct ProcessedMarkerCleanup {
    marker_column: String,
}

impl ProcessedMarkerCleanup {
    pub fn new(marker_column: &str) -> Self {
        Self {
            marker_column: marker_column.to_string(),
        }
    }
}

#[async_trait]
impl CleanupStrategy for ProcessedMarkerCleanup {
    fn kind(&self) -> CleanupKind {
        CleanupKind::ProcessedMarker
    }

    fn predicate(&self, _cursor: &CursorTracker) -> RowPredicate {
        RowPredicate::Unprocessed {
            marker_column: self.marker_column.clone(),
        }
    }

    fn uses_cursor(&self) -> bool {
        false
    }

    async fn after_batch(
        &self,
        source: &dyn RowSource,
        table: &str,
        row_ids: &[serde_json::Value],
    ) -> Result<()> {
        if row_ids.is_empty() {
            return Ok(());
        }
        let marked = source
            .mark_processed(table, &self.marker_column, row_ids)
            .await?;
        tracing::debug!(table, marked, "Marked rows processed");
        Ok(())
    }
}

/// Strategy configured for an entity; outside CDC mode only the cursor applies
pub fn strategy_for(entity: &EntityConfig) -> Arc<dyn CleanupStrategy> {
    match (entity.cdc_mode, entity.cleanup) {
        (true, CleanupKind::ProcessedMarker) => {
            Arc::new(ProcessedMarkerCleanup::new(&entity.processed_column))
        }
        _ => Arc::new(TimeBasedCleanup),
    }
}
