//! Client library
//!
//! A [`LiveTable`] starts from the snapshot returned by the HTTP endpoint. When
//! the response says realtime is enabled it subscribes through a
//! [`RealtimeClient`]; otherwise it stays in manual mode and the caller
//! refetches through a [`SnapshotFetcher`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tablewatch_common::{Result, Row, TableFilters, DEFAULT_ID_FIELD};

use crate::channel::{ChannelState, ClientChannel};
use crate::protocol::{ClientMessage, ServerMessage, SubscribeRequest};
use crate::reconciler::ClientRecordSet;
use crate::transport::Duplex;

/// Body of `GET /api/v1/{service}/{entity}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub data: Vec<Row>,
    pub realtime: RealtimeInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInfo {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// Fetches snapshots, usually over HTTP
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(
        &self,
        service: &str,
        entity: &str,
        filters: &TableFilters,
    ) -> Result<SnapshotResponse>;
}

/// Subscription preferences of a live table
#[derive(Debug, Clone, Default)]
pub struct LiveOptions {
    pub id_field: Option<String>,
    /// Requested polling interval in milliseconds; 0 means no preference
    pub polling_interval: u64,
    pub enable_database_triggers: bool,
}

#[derive(Debug, Clone)]
enum Mode {
    Realtime(ClientChannel),
    Manual(ClientRecordSet),
}

/// A locally maintained view of one table
#[derive(Debug, Clone)]
pub struct LiveTable {
    service: String,
    entity: String,
    filters: TableFilters,
    mode: Mode,
}

impl LiveTable {
    pub fn from_snapshot(
        service: &str,
        entity: &str,
        filters: TableFilters,
        snapshot: SnapshotResponse,
        options: &LiveOptions,
    ) -> Self {
        let id_field = options.id_field.as_deref().unwrap_or(DEFAULT_ID_FIELD);
        let mode = if snapshot.realtime.enabled {
            let request = SubscribeRequest {
                service_name: service.to_string(),
                entity_name: entity.to_string(),
                channel_id: snapshot.realtime.channel_id.unwrap_or_default(),
                filters: filters.clone(),
                polling_interval: options.polling_interval,
                enable_database_triggers: options.enable_database_triggers,
            };
            Mode::Realtime(ClientChannel::new(request, id_field, snapshot.data))
        } else {
            debug!(service, entity, "Realtime disabled, manual refresh only");
            Mode::Manual(ClientRecordSet::from_rows(id_field, snapshot.data))
        };
        Self {
            service: service.to_string(),
            entity: entity.to_string(),
            filters,
            mode,
        }
    }

    /// Fetch the initial snapshot and build the table
    pub async fn load(
        fetcher: &dyn SnapshotFetcher,
        service: &str,
        entity: &str,
        filters: TableFilters,
        options: &LiveOptions,
    ) -> Result<Self> {
        let snapshot = fetcher.fetch(service, entity, &filters).await?;
        Ok(Self::from_snapshot(service, entity, filters, snapshot, options))
    }

    pub fn is_realtime(&self) -> bool {
        matches!(self.mode, Mode::Realtime(_))
    }

    pub fn channel(&self) -> Option<&ClientChannel> {
        match &self.mode {
            Mode::Realtime(channel) => Some(channel),
            Mode::Manual(_) => None,
        }
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel().map(ClientChannel::channel_id)
    }

    pub fn state(&self) -> Option<ChannelState> {
        self.channel().map(ClientChannel::state)
    }

    pub fn records(&self) -> &ClientRecordSet {
        match &self.mode {
            Mode::Realtime(channel) => channel.records(),
            Mode::Manual(records) => records,
        }
    }

    /// Apply a server message; returns whether the records changed
    pub fn handle(&mut self, msg: &ServerMessage) -> bool {
        match &mut self.mode {
            Mode::Realtime(channel) => channel.handle(msg),
            Mode::Manual(_) => false,
        }
    }

    /// Replace the records with a fresh snapshot
    pub async fn refetch(&mut self, fetcher: &dyn SnapshotFetcher) -> Result<bool> {
        let snapshot = fetcher
            .fetch(&self.service, &self.entity, &self.filters)
            .await?;
        let rows = serde_json::Value::Array(
            snapshot
                .data
                .into_iter()
                .map(serde_json::Value::Object)
                .collect(),
        );
        Ok(match &mut self.mode {
            Mode::Realtime(channel) => channel.records_mut().replace(&rows),
            Mode::Manual(records) => records.replace(&rows),
        })
    }

    fn subscribe_message(&self) -> Option<ClientMessage> {
        self.channel().map(ClientChannel::subscribe_message)
    }

    fn unsubscribe(&mut self) -> Option<ClientMessage> {
        match &mut self.mode {
            Mode::Realtime(channel) => channel.unsubscribe(),
            Mode::Manual(_) => None,
        }
    }

    fn disconnect(&mut self) {
        if let Mode::Realtime(channel) = &mut self.mode {
            channel.disconnect();
        }
    }
}

/// Multiplexes live tables over one connection
pub struct RealtimeClient {
    link: Arc<dyn Duplex<ClientMessage>>,
    tables: HashMap<String, LiveTable>,
}

impl RealtimeClient {
    pub fn new(link: Arc<dyn Duplex<ClientMessage>>) -> Self {
        Self {
            link,
            tables: HashMap::new(),
        }
    }

    /// Subscribe a live table; returns its channel id. Manual tables are kept
    /// but never subscribed.
    pub async fn attach(&mut self, table: LiveTable) -> Result<Option<String>> {
        let Some(msg) = table.subscribe_message() else {
            return Ok(None);
        };
        let channel_id = table.channel_id().unwrap_or_default().to_string();
        self.link.send(msg).await?;
        info!(channel = %channel_id, service = %table.service, entity = %table.entity, "Subscribing");
        self.tables.insert(channel_id.clone(), table);
        Ok(Some(channel_id))
    }

    /// Route a server message to its table; returns whether records changed
    pub fn dispatch(&mut self, msg: &ServerMessage) -> bool {
        match self.tables.get_mut(msg.channel_id()) {
            Some(table) => table.handle(msg),
            None => {
                debug!(channel = %msg.channel_id(), "Message for unknown channel");
                false
            }
        }
    }

    /// Unsubscribe and hand the table back
    pub async fn detach(&mut self, channel_id: &str) -> Result<Option<LiveTable>> {
        let Some(mut table) = self.tables.remove(channel_id) else {
            return Ok(None);
        };
        if let Some(msg) = table.unsubscribe() {
            self.link.send(msg).await?;
        }
        Ok(Some(table))
    }

    pub fn table(&self, channel_id: &str) -> Option<&LiveTable> {
        self.tables.get(channel_id)
    }

    /// Mark every table disconnected and close the link
    pub async fn disconnect(&mut self) {
        for table in self.tables.values_mut() {
            table.disconnect();
        }
        self.link.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::duplex_pair;
    use parking_lot::Mutex;
    use serde_json::json;
    use tablewatch_common::Operation;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn snapshot(enabled: bool, ids: &[i64]) -> SnapshotResponse {
        SnapshotResponse {
            data: ids.iter().map(|id| row(json!({"id": id}))).collect(),
            realtime: RealtimeInfo {
                enabled,
                socket_url: enabled.then(|| "ws://localhost:4100/ws".to_string()),
                channel_id: enabled.then(|| "ch-1".to_string()),
            },
        }
    }

    struct StaticFetcher(Mutex<Vec<i64>>);

    #[async_trait]
    impl SnapshotFetcher for StaticFetcher {
        async fn fetch(&self, _: &str, _: &str, _: &TableFilters) -> Result<SnapshotResponse> {
            Ok(snapshot(false, &self.0.lock()))
        }
    }

    #[test]
    fn test_snapshot_response_wire_format() {
        let value = serde_json::to_value(snapshot(true, &[1])).unwrap();
        assert_eq!(value["realtime"]["socketUrl"], "ws://localhost:4100/ws");
        assert_eq!(value["realtime"]["channelId"], "ch-1");
        let disabled = serde_json::to_value(snapshot(false, &[])).unwrap();
        assert!(disabled["realtime"].get("channelId").is_none());
    }

    #[tokio::test]
    async fn test_manual_mode_refetches() {
        let fetcher = StaticFetcher(Mutex::new(vec![1]));
        let mut table = LiveTable::load(
            &fetcher,
            "crm",
            "orders",
            TableFilters::default(),
            &LiveOptions::default(),
        )
        .await
        .unwrap();
        assert!(!table.is_realtime());
        assert!(table.state().is_none());

        fetcher.0.lock().push(2);
        assert!(table.refetch(&fetcher).await.unwrap());
        assert_eq!(table.records().len(), 2);
        assert!(!table.handle(&ServerMessage::trigger("ch-1", Operation::Insert, json!({"id": 3}))));
    }

    #[tokio::test]
    async fn test_client_attach_dispatch_detach() {
        let (client_end, server_end) = duplex_pair::<ClientMessage, ServerMessage>(8);
        let mut client = RealtimeClient::new(Arc::new(client_end));

        let table = LiveTable::from_snapshot(
            "crm",
            "orders",
            TableFilters::default(),
            snapshot(true, &[1]),
            &LiveOptions {
                enable_database_triggers: true,
                ..Default::default()
            },
        );
        let channel = client.attach(table).await.unwrap().unwrap();
        assert_eq!(channel, "ch-1");

        let Some(ClientMessage::SubscribeTable(req)) = server_end.recv().await else {
            panic!("expected subscribe_table");
        };
        assert_eq!(req.channel_id, "ch-1");
        assert!(req.enable_database_triggers);

        client.dispatch(&ServerMessage::confirmed("ch-1"));
        assert!(client.dispatch(&ServerMessage::trigger("ch-1", Operation::Insert, json!({"id": 2}))));
        assert_eq!(client.table("ch-1").unwrap().records().len(), 2);

        let table = client.detach("ch-1").await.unwrap().unwrap();
        assert_eq!(table.state(), Some(ChannelState::Unsubscribed));
        assert!(matches!(
            server_end.recv().await,
            Some(ClientMessage::UnsubscribeTable(_))
        ));
    }
}
