//! Per-table change cursor
//!
//! The cursor stores the last delivered watermark normalized to UTC. Source
//! values are read through the configured clock-skew offset, so the cursor is
//! comparable across ticks regardless of the source's clock.

use tracing::warn;

use tablewatch_common::{Row, Watermark};

use crate::source::RowPredicate;

/// Last-seen watermark of one monitored column
#[derive(Debug, Clone)]
pub struct CursorTracker {
    column: String,
    timezone_offset_minutes: i32,
    cursor: Option<Watermark>,
}

impl CursorTracker {
    pub fn new(column: &str, timezone_offset_minutes: i32) -> Self {
        Self {
            column: column.to_string(),
            timezone_offset_minutes,
            cursor: None,
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn timezone_offset_minutes(&self) -> i32 {
        self.timezone_offset_minutes
    }

    pub fn current(&self) -> Option<&Watermark> {
        self.cursor.as_ref()
    }

    /// Watermark carried by a row, if its column holds a usable value
    pub fn observe(&self, row: &Row) -> Option<Watermark> {
        row.get(&self.column)
            .and_then(|v| Watermark::from_value(v, self.timezone_offset_minutes))
    }

    /// Highest watermark among `rows`
    pub fn max_of<'a>(&self, rows: impl IntoIterator<Item = &'a Row>) -> Option<Watermark> {
        rows.into_iter().filter_map(|r| self.observe(r)).max()
    }

    /// Predicate selecting rows newer than the cursor
    pub fn predicate(&self) -> RowPredicate {
        match &self.cursor {
            Some(bound) => RowPredicate::After {
                column: self.column.clone(),
                bound: bound.clone(),
                timezone_offset_minutes: self.timezone_offset_minutes,
            },
            None => RowPredicate::All,
        }
    }

    /// Move the cursor forward. Never moves it backwards; returns whether it moved.
    pub fn advance(&mut self, candidate: Watermark) -> bool {
        match &self.cursor {
            Some(current) if !current.same_kind(&candidate) => {
                warn!(
                    column = %self.column,
                    current = %current,
                    candidate = %candidate,
                    "Ignoring watermark of a different kind"
                );
                false
            }
            Some(current) if candidate <= *current => false,
            _ => {
                self.cursor = Some(candidate);
                true
            }
        }
    }
}
