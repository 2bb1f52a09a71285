//! TableWatch Server
//!
//! Serves the snapshot endpoint and the realtime WebSocket over actix-web:
//! - `GET /api/v1/{service}/{entity}`: current page plus realtime info
//! - `GET /ws` (configurable): subscription gateway
//! - `GET /api/v1/jobs`, `GET /health`, `GET /metrics`

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod http;
pub mod ws;

use std::collections::BTreeMap;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::info;

use tablewatch_common::config::SeedTable;
use tablewatch_common::{Result, TableWatchConfig};
use tablewatch_realtime::{MemorySource, RealtimeServer, SourceCatalog, SubscriptionRegistry};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<TableWatchConfig>,
    pub realtime: Arc<RealtimeServer>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn catalog(&self) -> &Arc<SourceCatalog> {
        self.realtime.registry().catalog()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.realtime.registry()
    }
}

/// Build the service catalog: one in-memory source per seeded service plus
/// the configured entities
pub fn build_catalog(config: &TableWatchConfig) -> Result<SourceCatalog> {
    let mut by_service: BTreeMap<&str, Vec<SeedTable>> = BTreeMap::new();
    for table in &config.seed {
        by_service
            .entry(table.service.as_str())
            .or_default()
            .push(table.clone());
    }

    let mut catalog = SourceCatalog::new();
    for (service, tables) in by_service {
        let source = MemorySource::from_seed(&tables)?;
        info!(service, tables = tables.len(), "Seeded in-memory source");
        catalog = catalog.with_service(service, Arc::new(source));
    }
    for entity in &config.entities {
        catalog = catalog.with_entity(entity.clone());
    }
    Ok(catalog)
}

/// Main TableWatch server
pub struct TableWatchServer {
    state: AppState,
}

impl TableWatchServer {
    /// Build the server from configuration, with sources from `[[seed]]`
    pub fn new(config: TableWatchConfig) -> Result<Self> {
        let catalog = build_catalog(&config)?;
        Ok(Self::with_catalog(config, catalog))
    }

    /// Build the server over an existing catalog
    pub fn with_catalog(config: TableWatchConfig, catalog: SourceCatalog) -> Self {
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::new(catalog),
            config.polling.clone(),
            config.realtime.outbox_capacity,
        ));
        let realtime = Arc::new(RealtimeServer::new(&config.realtime, registry));
        Self {
            state: AppState {
                config: Arc::new(config),
                realtime,
                metrics: None,
            },
        }
    }

    /// Serve `/metrics` from this Prometheus recorder
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the HTTP and WebSocket server until it stops
    pub async fn run(&self) -> Result<()> {
        let state = self.state.clone();
        let server_config = &self.state.config.server;
        let socket_path = self.state.config.realtime.socket_path.clone();

        info!(
            host = %server_config.host,
            port = server_config.port,
            socket = %socket_path,
            realtime = self.state.config.realtime.enabled,
            "Starting TableWatch server"
        );

        let mut server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(Cors::permissive())
                .wrap(middleware::Logger::default())
                .route(&socket_path, web::get().to(ws::websocket_handler))
                .configure(http::configure)
        });
        if server_config.workers > 0 {
            server = server.workers(server_config.workers);
        }

        server
            .bind((server_config.host.as_str(), server_config.port))?
            .run()
            .await?;

        Ok(())
    }

    /// Close every connection and stop every polling job
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down TableWatch server");
        self.state.realtime.shutdown();
        Ok(())
    }
}
