//! In-memory row source
//!
//! Backs the demo server (tables seeded from configuration) and the test
//! suites. Every mutation is also published on the table's trigger feed, the
//! way a source with database triggers would push changes.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use tablewatch_common::config::SeedTable;
use tablewatch_common::{
    compare_values, ChangeEvent, ColumnInfo, Error, Result, Row, SortSpec, TableFilters,
    TableSchema, Watermark, DEFAULT_ID_FIELD, MAX_PAGE_SIZE,
};

use crate::source::{RowQuery, RowSource};

const TRIGGER_FEED_CAPACITY: usize = 1024;
const DEFAULT_PAGE_SIZE: u32 = 100;

struct MemoryTable {
    schema: TableSchema,
    id_field: String,
    rows: Vec<Row>,
}

/// A [`RowSource`] holding tables in memory
pub struct MemorySource {
    tables: RwLock<HashMap<String, MemoryTable>>,
    triggers: Mutex<HashMap<String, broadcast::Sender<ChangeEvent>>>,
    /// Errors returned by the next queries, oldest first
    injected_failures: Mutex<VecDeque<Error>>,
    queries: AtomicU64,
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            triggers: Mutex::new(HashMap::new()),
            injected_failures: Mutex::new(VecDeque::new()),
            queries: AtomicU64::new(0),
        }
    }

    /// Build a source from `[[seed]]` configuration tables
    pub fn from_seed(seed: &[SeedTable]) -> Result<Self> {
        let source = Self::new();
        for table in seed {
            let columns: Vec<(&str, &str)> = table
                .columns
                .iter()
                .map(|c| (c.name.as_str(), c.type_name.as_str()))
                .collect();
            source.create_table(&table.entity, &columns, DEFAULT_ID_FIELD);
            for row in &table.rows {
                let row = row.as_object().cloned().ok_or_else(|| {
                    Error::Config(format!("seed rows of '{}' must be objects", table.entity))
                })?;
                source.insert(&table.entity, row)?;
            }
        }
        Ok(source)
    }

    /// Create (or replace) a table
    pub fn create_table(&self, name: &str, columns: &[(&str, &str)], id_field: &str) {
        let schema = TableSchema {
            name: name.to_string(),
            columns: columns
                .iter()
                .map(|(name, ty)| ColumnInfo::new(name, ty))
                .collect(),
        };
        self.tables.write().insert(
            name.to_string(),
            MemoryTable {
                schema,
                id_field: id_field.to_string(),
                rows: Vec::new(),
            },
        );
    }

    /// Insert a row and publish an INSERT trigger event
    pub fn insert(&self, table: &str, row: Row) -> Result<()> {
        {
            let mut tables = self.tables.write();
            let t = tables.get_mut(table).ok_or_else(|| missing(table))?;
            t.rows.push(row.clone());
        }
        self.publish(table, ChangeEvent::insert(row, None));
        Ok(())
    }

    /// Shallow-merge `patch` into the row with the given id and publish an UPDATE
    pub fn update(&self, table: &str, id: &serde_json::Value, patch: Row) -> Result<bool> {
        let updated = {
            let mut tables = self.tables.write();
            let t = tables.get_mut(table).ok_or_else(|| missing(table))?;
            let id_field = t.id_field.clone();
            match t.rows.iter_mut().find(|r| r.get(&id_field) == Some(id)) {
                Some(row) => {
                    row.extend(patch);
                    Some(row.clone())
                }
                None => None,
            }
        };
        match updated {
            Some(row) => {
                self.publish(table, ChangeEvent::update(row, None));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove the row with the given id and publish a DELETE
    pub fn delete(&self, table: &str, id: &serde_json::Value) -> Result<bool> {
        let removed = {
            let mut tables = self.tables.write();
            let t = tables.get_mut(table).ok_or_else(|| missing(table))?;
            let id_field = t.id_field.clone();
            t.rows
                .iter()
                .position(|r| r.get(&id_field) == Some(id))
                .map(|idx| t.rows.remove(idx))
        };
        match removed {
            Some(row) => {
                self.publish(table, ChangeEvent::delete(row));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// All rows of a table in insertion order
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Make the next query fail with `error`
    pub fn fail_next(&self, error: Error) {
        self.injected_failures.lock().push_back(error);
    }

    /// Number of `query_rows` / `fetch_page` calls served
    pub fn query_count(&self) -> u64 {
        self.queries.load(AtomicOrdering::SeqCst)
    }

    fn publish(&self, table: &str, event: ChangeEvent) {
        if let Some(tx) = self.triggers.lock().get(table) {
            // No receivers simply means nobody enabled triggers
            let _ = tx.send(event);
        }
    }

    fn begin_query(&self) -> Result<()> {
        self.queries.fetch_add(1, AtomicOrdering::SeqCst);
        match self.injected_failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

fn missing(table: &str) -> Error {
    Error::Query(format!("relation \"{table}\" does not exist"))
}

/// Order by a column, comparing parsed watermarks where both sides parse
fn compare_by(sort: &SortSpec, a: &Row, b: &Row) -> Ordering {
    let (va, vb) = (a.get(&sort.column), b.get(&sort.column));
    let parsed = va
        .and_then(|v| Watermark::from_value(v, 0))
        .zip(vb.and_then(|v| Watermark::from_value(v, 0)))
        .filter(|(x, y)| x.same_kind(y));
    let ord = match parsed {
        Some((x, y)) => x.cmp(&y),
        None => compare_values(va, vb),
    };
    if sort.descending {
        ord.reverse()
    } else {
        ord
    }
}

#[async_trait]
impl RowSource for MemorySource {
    async fn describe(&self, table: &str) -> Result<Option<TableSchema>> {
        Ok(self.tables.read().get(table).map(|t| t.schema.clone()))
    }

    async fn query_rows(&self, table: &str, query: &RowQuery) -> Result<Vec<Row>> {
        self.begin_query()?;
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| missing(table))?;

        let mut rows: Vec<Row> = t.rows.iter().filter(|r| query.matches(r)).cloned().collect();
        if let Some(sort) = &query.order_by {
            rows.sort_by(|a, b| compare_by(sort, a, b));
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn fetch_page(&self, table: &str, filters: &TableFilters) -> Result<Vec<Row>> {
        self.begin_query()?;
        let tables = self.tables.read();
        let t = tables.get(table).ok_or_else(|| missing(table))?;

        let mut rows: Vec<&Row> = t.rows.iter().filter(|r| filters.matches(r)).collect();
        let sort = filters.sort_spec()?.unwrap_or(SortSpec {
            column: t.id_field.clone(),
            descending: false,
        });
        rows.sort_by(|a, b| compare_by(&sort, a, b));

        let (skip, take) = match (filters.page, filters.page_size) {
            (None, None) => (0, MAX_PAGE_SIZE as usize),
            (page, size) => {
                let size = size.unwrap_or(DEFAULT_PAGE_SIZE) as usize;
                let page = page.unwrap_or(1).max(1) as usize;
                ((page - 1) * size, size)
            }
        };

        Ok(rows
            .into_iter()
            .skip(skip)
            .take(take)
            .map(|r| filters.project(r, &t.id_field))
            .collect())
    }

    async fn mark_processed(
        &self,
        table: &str,
        marker_column: &str,
        row_ids: &[serde_json::Value],
    ) -> Result<usize> {
        self.begin_query()?;
        let mut tables = self.tables.write();
        let t = tables.get_mut(table).ok_or_else(|| missing(table))?;
        let id_field = t.id_field.clone();

        let mut marked = 0;
        for row in &mut t.rows {
            if row.get(&id_field).is_some_and(|id| row_ids.contains(id)) {
                row.insert(marker_column.to_string(), serde_json::Value::Bool(true));
                marked += 1;
            }
        }
        Ok(marked)
    }

    fn trigger_feed(&self, table: &str) -> Option<broadcast::Receiver<ChangeEvent>> {
        if !self.tables.read().contains_key(table) {
            return None;
        }
        let mut triggers = self.triggers.lock();
        let tx = triggers
            .entry(table.to_string())
            .or_insert_with(|| broadcast::channel(TRIGGER_FEED_CAPACITY).0);
        Some(tx.subscribe())
    }
}
