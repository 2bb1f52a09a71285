//! Configuration types for TableWatch

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{CleanupKind, TriggerMode, DEFAULT_ID_FIELD};

/// Main configuration for the TableWatch service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TableWatchConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Real-time transport configuration
    pub realtime: RealtimeConfig,
    /// Adaptive polling defaults
    pub polling: PollingConfig,
    /// Monitored entities
    pub entities: Vec<EntityConfig>,
    /// Demo tables loaded into the in-memory source
    pub seed: Vec<SeedTable>,
}

impl TableWatchConfig {
    /// Load configuration from a TOML or JSON file (chosen by extension)
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

        let config: Self = if path.as_ref().extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {e}")))?
        } else {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML config: {e}")))?
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would break scheduling invariants
    pub fn validate(&self) -> Result<()> {
        self.polling.validate()?;
        for entity in &self.entities {
            entity.validate()?;
        }
        Ok(())
    }

    /// Look up the configuration of a monitored entity
    pub fn entity(&self, service: &str, entity: &str) -> Option<&EntityConfig> {
        self.entities
            .iter()
            .find(|e| e.service == service && e.entity == entity)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port for HTTP and WebSocket traffic (default: 4100)
    pub port: u16,
    /// Number of HTTP worker threads (0 = actix default)
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4100,
            workers: 0,
        }
    }
}

/// Real-time transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// When false, snapshot responses tell clients to poll manually
    pub enabled: bool,
    /// WebSocket path
    pub socket_path: String,
    /// Public WebSocket URL advertised to clients (derived from the request when unset)
    pub public_url: Option<String>,
    /// Per-channel outbound queue capacity
    pub outbox_capacity: usize,
    /// Largest inbound WebSocket text frame accepted
    pub max_message_size: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_path: "/ws".to_string(),
            public_url: None,
            outbox_capacity: 256,
            max_message_size: 64 * 1024,
        }
    }
}

/// Adaptive polling defaults shared by every job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Lower bound for the inter-poll delay (ms)
    pub min_interval_ms: u64,
    /// Initial delay for a new job (ms)
    pub base_interval_ms: u64,
    /// Upper bound for the inter-poll delay (ms)
    pub max_interval_ms: u64,
    /// Multiplier applied after a poll that detected changes
    pub shrink_factor: f64,
    /// Multiplier applied once the empty-poll threshold is reached
    pub growth_factor: f64,
    /// Consecutive empty polls before the delay grows
    pub empty_poll_threshold: u32,
    /// Row cap per CDC batch
    pub default_batch_size: usize,
    /// Per-query timeout against the source (ms)
    pub query_timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 5_000,
            base_interval_ms: 30_000,
            max_interval_ms: 300_000,
            shrink_factor: 0.5,
            growth_factor: 1.5,
            empty_poll_threshold: 3,
            default_batch_size: 5_000,
            query_timeout_ms: 10_000,
        }
    }
}

impl PollingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_interval_ms == 0 {
            return Err(Error::Config("polling.min_interval_ms must be > 0".into()));
        }
        if self.min_interval_ms > self.max_interval_ms {
            return Err(Error::Config(format!(
                "polling.min_interval_ms ({}) exceeds max_interval_ms ({})",
                self.min_interval_ms, self.max_interval_ms
            )));
        }
        if !(self.min_interval_ms..=self.max_interval_ms).contains(&self.base_interval_ms) {
            return Err(Error::Config(
                "polling.base_interval_ms must lie within [min, max]".into(),
            ));
        }
        if !(self.shrink_factor > 0.0 && self.shrink_factor <= 1.0) {
            return Err(Error::Config("polling.shrink_factor must be in (0, 1]".into()));
        }
        if self.growth_factor < 1.0 {
            return Err(Error::Config("polling.growth_factor must be >= 1".into()));
        }
        if self.default_batch_size == 0 {
            return Err(Error::Config("polling.default_batch_size must be > 0".into()));
        }
        Ok(())
    }
}

/// A monitored entity (table) of a service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityConfig {
    /// Service (connection) name
    pub service: String,
    /// Entity (table) name
    pub entity: String,
    /// Optional schema qualifier
    pub schema: Option<String>,
    /// Primary key field of each record
    pub id_field: String,
    /// `newRow` tracks `date_column`, `updatedRow` tracks `monitor_column`
    pub trigger_mode: TriggerMode,
    /// Creation timestamp column (auto-detected when unset)
    pub date_column: Option<String>,
    /// Modification column (auto-detected when unset)
    pub monitor_column: Option<String>,
    /// Source clock offset from UTC in minutes
    pub timezone_offset_minutes: i32,
    /// Batch mode: cap each poll at `batch_size` and run the cleanup strategy
    pub cdc_mode: bool,
    /// Row cap per batch (falls back to `polling.default_batch_size`)
    pub batch_size: Option<usize>,
    /// Cleanup strategy for CDC mode
    pub cleanup: CleanupKind,
    /// Column set by the processed-marker strategy
    pub processed_column: String,
}

impl Default for EntityConfig {
    fn default() -> Self {
        Self {
            service: String::new(),
            entity: String::new(),
            schema: None,
            id_field: DEFAULT_ID_FIELD.to_string(),
            trigger_mode: TriggerMode::NewRow,
            date_column: None,
            monitor_column: None,
            timezone_offset_minutes: 0,
            cdc_mode: false,
            batch_size: None,
            cleanup: CleanupKind::TimeBased,
            processed_column: "processed".to_string(),
        }
    }
}

impl EntityConfig {
    pub fn new(service: &str, entity: &str) -> Self {
        Self {
            service: service.to_string(),
            entity: entity.to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.is_empty() || self.entity.is_empty() {
            return Err(Error::Config(
                "entities need both a service and an entity name".into(),
            ));
        }
        if self.batch_size == Some(0) {
            return Err(Error::Config(format!(
                "{}.{}: batch_size must be > 0",
                self.service, self.entity
            )));
        }
        // 14 hours covers every real-world UTC offset
        if self.timezone_offset_minutes.abs() > 14 * 60 {
            return Err(Error::Config(format!(
                "{}.{}: timezone_offset_minutes out of range",
                self.service, self.entity
            )));
        }
        Ok(())
    }

    /// Explicitly configured change column for the trigger mode
    pub fn explicit_column(&self) -> Option<&str> {
        match self.trigger_mode {
            TriggerMode::NewRow => self.date_column.as_deref(),
            TriggerMode::UpdatedRow => self.monitor_column.as_deref(),
        }
    }

    /// Qualified table name
    pub fn table_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.entity),
            None => self.entity.clone(),
        }
    }
}

/// Seed data for the in-memory source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedTable {
    pub service: String,
    pub entity: String,
    /// Column name -> type name
    pub columns: Vec<SeedColumn>,
    pub rows: Vec<serde_json::Value>,
}

/// A seeded column definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedColumn {
    pub name: String,
    #[serde(rename = "type", default)]
    pub type_name: String,
}
