//! Common types for TableWatch

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Error, Result};

/// A source row: an opaque JSON object keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Default primary key field of a record
pub const DEFAULT_ID_FIELD: &str = "id";

/// Largest page a snapshot query may request
pub const MAX_PAGE_SIZE: u32 = 10_000;

// ============================================================================
// Change Types
// ============================================================================

/// Type of row-level change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    /// Any operation this build does not understand
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// How a job detects changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerMode {
    /// New rows, tracked by a date column
    #[default]
    NewRow,
    /// Modified rows, tracked by a monitored column
    UpdatedRow,
}

/// Cleanup strategy applied after a CDC batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupKind {
    #[default]
    TimeBased,
    ProcessedMarker,
}

/// A detected row-level change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub operation: Operation,
    pub record: Row,
    pub source_cursor_value: Option<Watermark>,
    pub detected_at: DateTime<Utc>,
}

impl ChangeEvent {
    /// Create an event stamped with the current time
    pub fn new(operation: Operation, record: Row, source_cursor_value: Option<Watermark>) -> Self {
        Self {
            operation,
            record,
            source_cursor_value,
            detected_at: Utc::now(),
        }
    }

    /// Create an INSERT event
    pub fn insert(record: Row, cursor: Option<Watermark>) -> Self {
        Self::new(Operation::Insert, record, cursor)
    }

    /// Create an UPDATE event
    pub fn update(record: Row, cursor: Option<Watermark>) -> Self {
        Self::new(Operation::Update, record, cursor)
    }

    /// Create a DELETE event
    pub fn delete(record: Row) -> Self {
        Self::new(Operation::Delete, record, None)
    }

    /// The record's primary key value
    pub fn record_id(&self, id_field: &str) -> Option<&serde_json::Value> {
        self.record.get(id_field).filter(|v| !v.is_null())
    }
}

// ============================================================================
// Watermarks
// ============================================================================

/// A totally ordered change-detection position
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Watermark {
    Integer(i64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

impl Watermark {
    /// Parse a source column value.
    ///
    /// Naive timestamps and dates are read in the source clock and shifted to
    /// UTC by `offset_minutes`. Values with an explicit offset ignore it.
    /// Returns `None` for nulls and non-integral numbers.
    pub fn from_value(value: &serde_json::Value, offset_minutes: i32) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(Self::Integer),
            serde_json::Value::String(s) => Some(Self::parse_str(s, offset_minutes)),
            _ => None,
        }
    }

    fn parse_str(s: &str, offset_minutes: i32) -> Self {
        let trimmed = s.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(trimmed) {
            return Self::Timestamp(ts.with_timezone(&Utc));
        }
        let shift = Duration::minutes(i64::from(offset_minutes));
        for fmt in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
                return Self::Timestamp(Utc.from_utc_datetime(&(naive - shift)));
            }
        }
        if let Some(naive) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
        {
            return Self::Timestamp(Utc.from_utc_datetime(&(naive - shift)));
        }
        Self::Text(trimmed.to_string())
    }

    /// Express this watermark in the source's clock, for use as a query bound
    pub fn to_source_value(&self, offset_minutes: i32) -> serde_json::Value {
        match self {
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Timestamp(ts) => {
                let local = ts.naive_utc() + Duration::minutes(i64::from(offset_minutes));
                serde_json::Value::String(local.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            }
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Whether two watermarks are of the same kind and therefore comparable
    pub fn same_kind(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{i}"),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Self::Text(s) => f.write_str(s),
        }
    }
}

// ============================================================================
// Table Metadata
// ============================================================================

/// Column metadata reported by a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_name: String,
}

impl ColumnInfo {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
        }
    }

    /// Whether the declared type is a date or time type
    pub fn is_temporal(&self) -> bool {
        let t = self.type_name.to_ascii_lowercase();
        t.contains("timestamp") || t.contains("date") || t.contains("time")
    }
}

/// Schema of a monitored table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

// ============================================================================
// Filters and Job Keys
// ============================================================================

/// Sort direction parsed from a filter's `sort` string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortSpec {
    pub column: String,
    pub descending: bool,
}

impl SortSpec {
    /// Accepts `col`, `-col`, `col:asc` and `col:desc`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let (column, descending) = if let Some(col) = raw.strip_prefix('-') {
            (col, true)
        } else if let Some((col, dir)) = raw.split_once(':') {
            match dir.to_ascii_lowercase().as_str() {
                "asc" => (col, false),
                "desc" => (col, true),
                other => {
                    return Err(Error::InvalidFilter(format!(
                        "unknown sort direction '{other}'"
                    )))
                }
            }
        } else {
            (raw, false)
        };

        if column.is_empty() {
            return Err(Error::InvalidFilter("empty sort column".to_string()));
        }
        Ok(Self {
            column: column.to_string(),
            descending,
        })
    }

    /// Compare two rows by this column; nulls sort first
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        let ord = compare_values(a.get(&self.column), b.get(&self.column));
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

/// Ordering of JSON scalars used by sorting and cursor comparison
pub fn compare_values(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    use serde_json::Value;
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}

/// Subscriber-supplied view filters. Channels with differing filters never
/// share a polling job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TableFilters {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    #[serde(deserialize_with = "deserialize_fields")]
    pub fields: Vec<String>,
    pub sort: Option<String>,
    pub filter: Option<serde_json::Value>,
}

fn deserialize_fields<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Fields {
        List(Vec<String>),
        Csv(String),
        Null(()),
    }

    Ok(match Fields::deserialize(deserializer)? {
        Fields::List(list) => list,
        Fields::Csv(csv) => csv
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Fields::Null(()) => Vec::new(),
    })
}

impl TableFilters {
    /// Normalize so that equivalent filter sets compare equal
    #[must_use]
    pub fn canonical(&self) -> Self {
        let mut fields: Vec<String> = self
            .fields
            .iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        fields.sort();
        fields.dedup();

        let filter = match &self.filter {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::Object(map)) if map.is_empty() => None,
            Some(other) => Some(other.clone()),
        };

        Self {
            page: self.page,
            page_size: self.page_size,
            fields,
            sort: self
                .sort
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string),
            filter,
        }
    }

    /// Parsed sort specification, if any
    pub fn sort_spec(&self) -> Result<Option<SortSpec>> {
        match self.sort.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => SortSpec::parse(raw).map(Some),
        }
    }

    /// Equality predicates from the `filter` object
    pub fn equality_predicates(&self) -> Result<Vec<(String, serde_json::Value)>> {
        match &self.filter {
            None | Some(serde_json::Value::Null) => Ok(Vec::new()),
            Some(serde_json::Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    if v.is_object() || v.is_array() {
                        Err(Error::InvalidFilter(format!(
                            "filter value for '{k}' must be a scalar"
                        )))
                    } else {
                        Ok((k.clone(), v.clone()))
                    }
                })
                .collect(),
            Some(other) => Err(Error::InvalidFilter(format!(
                "filter must be an object, got {other}"
            ))),
        }
    }

    /// Whether a row satisfies every equality predicate
    pub fn matches(&self, row: &Row) -> bool {
        self.equality_predicates()
            .map(|preds| {
                preds
                    .iter()
                    .all(|(col, expected)| row.get(col).map_or(expected.is_null(), |v| v == expected))
            })
            .unwrap_or(false)
    }

    /// Check the filters against a table schema
    pub fn validate(&self, schema: &TableSchema) -> Result<()> {
        if self.page == Some(0) {
            return Err(Error::InvalidFilter("page numbers start at 1".to_string()));
        }
        if let Some(size) = self.page_size {
            if size == 0 || size > MAX_PAGE_SIZE {
                return Err(Error::InvalidFilter(format!(
                    "pageSize must be between 1 and {MAX_PAGE_SIZE}"
                )));
            }
        }
        for field in &self.fields {
            if !schema.has_column(field) {
                return Err(Error::InvalidFilter(format!("unknown field '{field}'")));
            }
        }
        if let Some(sort) = self.sort_spec()? {
            if !schema.has_column(&sort.column) {
                return Err(Error::InvalidFilter(format!(
                    "unknown sort column '{}'",
                    sort.column
                )));
            }
        }
        for (column, _) in self.equality_predicates()? {
            if !schema.has_column(&column) {
                return Err(Error::InvalidFilter(format!(
                    "unknown filter column '{column}'"
                )));
            }
        }
        Ok(())
    }

    /// Keep only the requested fields (plus the id field); empty keeps all
    pub fn project(&self, row: &Row, id_field: &str) -> Row {
        if self.fields.is_empty() {
            return row.clone();
        }
        row.iter()
            .filter(|(k, _)| k.as_str() == id_field || self.fields.iter().any(|f| f == *k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Identifies a deduplicated unit of polling work
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobKey {
    pub service: String,
    pub entity: String,
    /// Canonical JSON rendering of the filter set
    pub filters: String,
}

impl JobKey {
    /// Build a key from a service, entity and filter set
    pub fn new(service: &str, entity: &str, filters: &TableFilters) -> Self {
        let canonical = filters.canonical();
        // serde_json object keys are ordered, so this rendering is stable
        let filters = serde_json::to_string(&canonical).unwrap_or_default();
        Self {
            service: service.to_string(),
            entity: entity.to_string(),
            filters,
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}{}", self.service, self.entity, self.filters)
    }
}
