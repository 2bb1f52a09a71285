//! HTTP handlers

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use tablewatch_common::{Error, Result, TableFilters};
use tablewatch_realtime::client::{RealtimeInfo, SnapshotResponse};

use crate::AppState;

/// Register the HTTP routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_handler))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/api/v1/jobs", web::get().to(jobs_handler))
        .route("/api/v1/{service}/{entity}", web::get().to(snapshot_handler));
}

/// Query string of the snapshot endpoint
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotQuery {
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    /// Comma separated projection
    pub fields: Option<String>,
    /// `col` or `-col`
    pub sort: Option<String>,
    /// JSON object of equality predicates
    pub filter: Option<String>,
}

impl SnapshotQuery {
    pub fn into_filters(self) -> Result<TableFilters> {
        let filter = match self.filter.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                serde_json::from_str(raw)
                    .map_err(|e| Error::InvalidFilter(format!("filter is not valid JSON: {e}")))?,
            ),
        };
        Ok(TableFilters {
            page: self.page,
            page_size: self.page_size,
            fields: self
                .fields
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(ToString::to_string)
                .collect(),
            sort: self.sort,
            filter,
        })
    }
}

/// Current page of an entity plus the realtime subscription info
pub async fn snapshot(
    state: &AppState,
    service: &str,
    entity: &str,
    filters: &TableFilters,
    request_host: &str,
) -> Result<SnapshotResponse> {
    let target = state.catalog().target(service, entity, filters).await?;
    let data = target
        .source
        .fetch_page(&target.entity.table_name(), filters)
        .await?;

    let realtime_config = &state.config.realtime;
    let enabled = realtime_config.enabled
        && match target.change_column() {
            Ok(_) => true,
            Err(e) => {
                debug!(service, entity, error = %e, "Realtime unavailable for entity");
                false
            }
        };

    let realtime = if enabled {
        let socket_url = realtime_config.public_url.clone().unwrap_or_else(|| {
            format!("ws://{request_host}{}", realtime_config.socket_path)
        });
        RealtimeInfo {
            enabled: true,
            socket_url: Some(socket_url),
            channel_id: Some(Uuid::new_v4().to_string()),
        }
    } else {
        RealtimeInfo::default()
    };

    Ok(SnapshotResponse { data, realtime })
}

/// Render an error as `{error, code}` with its HTTP status
pub fn error_response(err: &Error) -> HttpResponse {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(serde_json::json!({
        "error": err.to_string(),
        "code": err.error_code(),
    }))
}

async fn snapshot_handler(
    state: web::Data<AppState>,
    path: web::Path<(String, String)>,
    query: web::Query<SnapshotQuery>,
    req: HttpRequest,
) -> HttpResponse {
    let (service, entity) = path.into_inner();
    let filters = match query.into_inner().into_filters() {
        Ok(filters) => filters,
        Err(e) => return error_response(&e),
    };
    let host = req.connection_info().host().to_string();

    match snapshot(&state, &service, &entity, &filters, &host).await {
        Ok(body) => HttpResponse::Ok().json(body),
        Err(e) => {
            warn!(service = %service, entity = %entity, error = %e, "Snapshot failed");
            error_response(&e)
        }
    }
}

async fn health_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.realtime.connection_count(),
        "jobs": state.registry().job_count(),
        "channels": state.registry().channel_count(),
    }))
}

async fn metrics_handler(state: web::Data<AppState>) -> HttpResponse {
    match &state.metrics {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().body("metrics recorder not installed"),
    }
}

async fn jobs_handler(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.registry().jobs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};
    use serde_json::json;
    use tablewatch_common::config::{EntityConfig, SeedColumn, SeedTable};
    use tablewatch_common::TableWatchConfig;

    use crate::TableWatchServer;

    fn config() -> TableWatchConfig {
        let mut config = TableWatchConfig::default();
        config.seed = vec![
            SeedTable {
                service: "crm".into(),
                entity: "orders".into(),
                columns: vec![
                    SeedColumn { name: "id".into(), type_name: "int".into() },
                    SeedColumn { name: "status".into(), type_name: "text".into() },
                    SeedColumn { name: "created_at".into(), type_name: "timestamp".into() },
                ],
                rows: vec![
                    json!({"id": 1, "status": "open", "created_at": "2024-01-01T00:00:00Z"}),
                    json!({"id": 2, "status": "closed", "created_at": "2024-01-02T00:00:00Z"}),
                ],
            },
            SeedTable {
                service: "crm".into(),
                entity: "notes".into(),
                columns: vec![
                    SeedColumn { name: "id".into(), type_name: "int".into() },
                    SeedColumn { name: "body".into(), type_name: "text".into() },
                ],
                rows: vec![json!({"id": 1, "body": "hi"})],
            },
        ];
        config.entities = vec![EntityConfig::new("crm", "orders")];
        config
    }

    fn state(config: TableWatchConfig) -> AppState {
        TableWatchServer::new(config).unwrap().state().clone()
    }

    #[::core::prelude::v1::test]
    fn test_query_into_filters() {
        let query = SnapshotQuery {
            page: Some(2),
            page_size: Some(10),
            fields: Some("status, id,".into()),
            sort: Some("-created_at".into()),
            filter: Some(r#"{"status":"open"}"#.into()),
        };
        let filters = query.into_filters().unwrap();
        assert_eq!(filters.fields, vec!["status", "id"]);
        assert_eq!(filters.filter, Some(json!({"status": "open"})));

        let bad = SnapshotQuery {
            filter: Some("{not json".into()),
            ..Default::default()
        };
        assert!(matches!(bad.into_filters(), Err(Error::InvalidFilter(_))));
    }

    #[tokio::test]
    async fn test_snapshot_advertises_realtime() {
        let state = state(config());
        let filters = TableFilters {
            filter: Some(json!({"status": "open"})),
            ..Default::default()
        };
        let body = snapshot(&state, "crm", "orders", &filters, "localhost:4100")
            .await
            .unwrap();
        assert_eq!(body.data.len(), 1);
        assert!(body.realtime.enabled);
        assert_eq!(body.realtime.socket_url.as_deref(), Some("ws://localhost:4100/ws"));
        assert!(body.realtime.channel_id.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_without_change_column_is_manual() {
        let state = state(config());
        let body = snapshot(&state, "crm", "notes", &TableFilters::default(), "h")
            .await
            .unwrap();
        assert_eq!(body.data.len(), 1);
        assert!(!body.realtime.enabled);
        assert!(body.realtime.channel_id.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_respects_disabled_realtime() {
        let mut config = config();
        config.realtime.enabled = false;
        config.realtime.public_url = Some("wss://example.test/ws".into());
        let body = snapshot(&state(config), "crm", "orders", &TableFilters::default(), "h")
            .await
            .unwrap();
        assert!(!body.realtime.enabled);
        assert!(body.realtime.socket_url.is_none());
    }

    #[actix_web::test]
    async fn test_snapshot_endpoint_status_codes() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(config())))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/api/v1/crm/orders?fields=status&sort=-created_at")
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"][0], json!({"id": 2, "status": "closed"}));
        assert_eq!(body["realtime"]["enabled"], json!(true));

        let req = test::TestRequest::get().uri("/api/v1/erp/orders").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get()
            .uri("/api/v1/crm/orders?fields=nope")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["code"], "invalid_filter");
    }

    #[actix_web::test]
    async fn test_health_and_jobs() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state(config())))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["jobs"], 0);

        let req = test::TestRequest::get().uri("/api/v1/jobs").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!([]));

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
