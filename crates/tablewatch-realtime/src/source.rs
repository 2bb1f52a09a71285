//! Row-source collaborator interface
//!
//! The database-connectivity layer is external to TableWatch. Anything that can
//! answer these queries against a table (a SQL driver, a warehouse client, the
//! in-memory [`MemorySource`](crate::memory::MemorySource)) can be monitored.

use async_trait::async_trait;
use tokio::sync::broadcast;

use tablewatch_common::{ChangeEvent, Result, Row, SortSpec, TableFilters, TableSchema, Watermark};

/// Row selection for one change-detection query
#[derive(Debug, Clone, PartialEq)]
pub enum RowPredicate {
    /// Every row (used to establish a baseline cursor)
    All,
    /// Rows whose `column` is strictly newer than `bound`
    After {
        column: String,
        /// UTC-normalized bound
        bound: Watermark,
        /// Source clock offset used to read naive column values
        timezone_offset_minutes: i32,
    },
    /// Rows not yet flagged by the processed-marker strategy
    Unprocessed { marker_column: String },
}

impl RowPredicate {
    /// The bound re-expressed in the source clock, for SQL drivers
    pub fn source_bound(&self) -> Option<serde_json::Value> {
        match self {
            Self::After {
                bound,
                timezone_offset_minutes,
                ..
            } => Some(bound.to_source_value(*timezone_offset_minutes)),
            _ => None,
        }
    }

    /// Whether a row satisfies the predicate
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Self::All => true,
            Self::After {
                column,
                bound,
                timezone_offset_minutes,
            } => row
                .get(column)
                .and_then(|v| Watermark::from_value(v, *timezone_offset_minutes))
                .is_some_and(|w| w.same_kind(bound) && w > *bound),
            Self::Unprocessed { marker_column } => !row
                .get(marker_column)
                .is_some_and(|v| v.as_bool() == Some(true)),
        }
    }
}

/// A bounded change-detection query: `queryRows(table, predicate, orderBy, limit)`
#[derive(Debug, Clone, PartialEq)]
pub struct RowQuery {
    pub predicate: RowPredicate,
    pub order_by: Option<SortSpec>,
    pub limit: Option<usize>,
}

impl RowQuery {
    pub fn new(predicate: RowPredicate) -> Self {
        Self {
            predicate,
            order_by: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn order_by(mut self, column: &str, descending: bool) -> Self {
        self.order_by = Some(SortSpec {
            column: column.to_string(),
            descending,
        });
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.predicate.matches(row)
    }
}

/// Capabilities TableWatch consumes from a database-connectivity layer
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Schema of a table, or `None` if the table does not exist
    async fn describe(&self, table: &str) -> Result<Option<TableSchema>>;

    /// Rows matching a change-detection query
    async fn query_rows(&self, table: &str, query: &RowQuery) -> Result<Vec<Row>>;

    /// The page of rows a subscriber with `filters` currently sees
    async fn fetch_page(&self, table: &str, filters: &TableFilters) -> Result<Vec<Row>>;

    /// Flag rows as processed; returns how many rows were marked
    async fn mark_processed(
        &self,
        table: &str,
        marker_column: &str,
        row_ids: &[serde_json::Value],
    ) -> Result<usize>;

    /// Source-side trigger events for a table, when the source can push them
    fn trigger_feed(&self, _table: &str) -> Option<broadcast::Receiver<ChangeEvent>> {
        None
    }
}
