//! Service catalog
//!
//! Maps service names to row sources and (service, entity) pairs to entity
//! configuration, and validates a subscription before any job exists.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use tablewatch_common::config::EntityConfig;
use tablewatch_common::{Error, Result, TableFilters, TableSchema};

use crate::detector::resolve_column;
use crate::source::RowSource;

/// A validated subscription target
#[derive(Clone)]
pub struct EntityPlan {
    pub entity: EntityConfig,
    pub schema: TableSchema,
    /// Change-tracking column
    pub column: String,
    pub source: Arc<dyn RowSource>,
}

/// Entity resolution without a change column requirement
#[derive(Clone)]
pub struct EntityTarget {
    pub entity: EntityConfig,
    pub schema: TableSchema,
    pub source: Arc<dyn RowSource>,
}

impl EntityTarget {
    /// Change-tracking column, if one can be resolved
    pub fn change_column(&self) -> Result<String> {
        resolve_column(&self.entity, &self.schema)
    }
}

#[derive(Default)]
pub struct SourceCatalog {
    services: HashMap<String, Arc<dyn RowSource>>,
    entities: HashMap<(String, String), EntityConfig>,
}

impl SourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the source backing a service
    #[must_use]
    pub fn with_service(mut self, name: &str, source: Arc<dyn RowSource>) -> Self {
        self.services.insert(name.to_string(), source);
        self
    }

    /// Register entity configuration
    #[must_use]
    pub fn with_entity(mut self, entity: EntityConfig) -> Self {
        self.entities
            .insert((entity.service.clone(), entity.entity.clone()), entity);
        self
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn source(&self, service: &str) -> Result<Arc<dyn RowSource>> {
        self.services
            .get(service)
            .cloned()
            .ok_or_else(|| Error::UnknownService(service.to_string()))
    }

    /// Configured entity, or the defaults for an unconfigured one
    pub fn entity_config(&self, service: &str, entity: &str) -> EntityConfig {
        self.entities
            .get(&(service.to_string(), entity.to_string()))
            .cloned()
            .unwrap_or_else(|| EntityConfig::new(service, entity))
    }

    /// Resolve the service and table and check the filters against its schema
    pub async fn target(
        &self,
        service: &str,
        entity: &str,
        filters: &TableFilters,
    ) -> Result<EntityTarget> {
        let source = self.source(service)?;
        let config = self.entity_config(service, entity);
        let schema = source
            .describe(&config.table_name())
            .await?
            .ok_or_else(|| Error::UnknownEntity {
                service: service.to_string(),
                entity: entity.to_string(),
            })?;
        filters.validate(&schema)?;
        Ok(EntityTarget {
            entity: config,
            schema,
            source,
        })
    }

    /// Everything needed to start a polling job
    pub async fn plan(
        &self,
        service: &str,
        entity: &str,
        filters: &TableFilters,
    ) -> Result<EntityPlan> {
        let target = self.target(service, entity, filters).await?;
        let column = target.change_column()?;
        debug!(service, entity, column = %column, "Resolved change column");
        Ok(EntityPlan {
            entity: target.entity,
            schema: target.schema,
            column,
            source: target.source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySource;
    use serde_json::json;

    fn catalog() -> SourceCatalog {
        let source = MemorySource::new();
        source.create_table(
            "orders",
            &[("id", "int"), ("status", "text"), ("created_at", "timestamp")],
            "id",
        );
        source.create_table("tags", &[("id", "int"), ("label", "text")], "id");

        let mut configured = EntityConfig::new("crm", "audit");
        configured.schema = Some("ops".into());
        SourceCatalog::new()
            .with_service("crm", Arc::new(source))
            .with_entity(configured)
    }

    #[tokio::test]
    async fn test_plan_resolves_column() {
        let plan = catalog()
            .plan("crm", "orders", &TableFilters::default())
            .await
            .unwrap();
        assert_eq!(plan.column, "created_at");
        assert_eq!(plan.entity.id_field, "id");
    }

    #[tokio::test]
    async fn test_plan_errors() {
        let catalog = catalog();
        let filters = TableFilters::default();

        assert!(matches!(
            catalog.plan("billing", "orders", &filters).await,
            Err(Error::UnknownService(_))
        ));
        assert!(matches!(
            catalog.plan("crm", "nope", &filters).await,
            Err(Error::UnknownEntity { .. })
        ));
        // Configured with a schema the source does not have
        assert!(matches!(
            catalog.plan("crm", "audit", &filters).await,
            Err(Error::UnknownEntity { .. })
        ));
        assert!(matches!(
            catalog.plan("crm", "tags", &filters).await,
            Err(Error::UnresolvableColumn(_))
        ));

        let bad = TableFilters {
            filter: Some(json!({"missing": 1})),
            ..Default::default()
        };
        assert!(matches!(
            catalog.plan("crm", "orders", &bad).await,
            Err(Error::InvalidFilter(_))
        ));
    }

    #[tokio::test]
    async fn test_target_without_change_column() {
        let target = catalog()
            .target("crm", "tags", &TableFilters::default())
            .await
            .unwrap();
        assert!(target.change_column().is_err());
    }
}
