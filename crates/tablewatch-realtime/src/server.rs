//! Realtime gateway
//!
//! Owns the connections and dispatches their inbound messages:
//! - `subscribe_table` binds a channel and answers `subscription_confirmed`
//!   or `subscription_error`
//! - `unsubscribe_table` unbinds it
//! - malformed frames are answered with `subscription_error`
//!
//! A channel's writer starts only after its confirmation has been sent, so the
//! confirmation always precedes the channel's first update.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tablewatch_common::config::RealtimeConfig;
use tablewatch_common::{metrics, Error};

use crate::protocol::{
    parse_client_message, salvage_channel_id, ClientMessage, ServerMessage, SubscribeRequest,
};
use crate::registry::{ChannelKey, ConnectionId, SubscriptionRegistry};
use crate::transport::{duplex_pair, spawn_writer, InProcessEndpoint, MessageHandler, ServerSink};

pub struct RealtimeServer {
    config: RealtimeConfig,
    registry: Arc<SubscriptionRegistry>,
    connections: DashMap<ConnectionId, ServerSink>,
}

impl RealtimeServer {
    pub fn new(config: &RealtimeConfig, registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            config: config.clone(),
            registry,
            connections: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Register a connection's outbound half
    pub fn register_connection(&self, sink: ServerSink) -> ConnectionId {
        let id = ConnectionId::new();
        self.connections.insert(id, sink);
        metrics::set_connections(self.connections.len());
        debug!(connection = %id, "Connection registered");
        id
    }

    /// Forget a connection and unbind all of its channels
    pub fn unregister_connection(&self, id: ConnectionId) -> usize {
        self.connections.remove(&id);
        let unbound = self.registry.unsubscribe_connection(id);
        metrics::set_connections(self.connections.len());
        info!(connection = %id, unbound, "Connection closed");
        unbound
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn sink(&self, id: ConnectionId) -> Option<ServerSink> {
        self.connections.get(&id).map(|s| s.clone())
    }

    /// Handle one raw text frame
    pub async fn handle_text(&self, id: ConnectionId, text: &str) {
        if text.len() > self.config.max_message_size {
            let err = Error::InvalidMessage(format!(
                "message of {} bytes exceeds the {} byte limit",
                text.len(),
                self.config.max_message_size
            ));
            self.reject(id, "", &err).await;
            return;
        }
        match parse_client_message(text) {
            Ok(msg) => self.handle_message(id, msg).await,
            Err(err) => {
                let channel = salvage_channel_id(text);
                warn!(connection = %id, channel = %channel, error = %err, "Malformed message");
                self.reject(id, &channel, &err).await;
            }
        }
    }

    /// Handle one decoded message
    pub async fn handle_message(&self, id: ConnectionId, msg: ClientMessage) {
        match msg {
            ClientMessage::SubscribeTable(request) => self.subscribe(id, request).await,
            ClientMessage::UnsubscribeTable(request) => {
                let channel = ChannelKey::new(id, &request.channel_id);
                if !self.registry.unsubscribe(&channel) {
                    debug!(channel = %channel, "Unsubscribe for unknown channel");
                }
            }
        }
    }

    async fn subscribe(&self, id: ConnectionId, mut request: SubscribeRequest) {
        let Some(sink) = self.sink(id) else {
            warn!(connection = %id, "Subscribe on unknown connection");
            return;
        };
        if request.channel_id.is_empty() {
            request.channel_id = Uuid::new_v4().to_string();
        }

        match self.registry.subscribe(id, &request).await {
            Ok(binding) => {
                let confirmed = ServerMessage::confirmed(&request.channel_id);
                if let Err(e) = sink.send(confirmed).await {
                    debug!(channel = %binding.channel, error = %e, "Connection gone before confirmation");
                    self.registry.unsubscribe(&binding.channel);
                    return;
                }
                spawn_writer(binding.outbox, sink);
                metrics::record_subscription("confirmed");
            }
            Err(err) => {
                warn!(
                    connection = %id,
                    channel = %request.channel_id,
                    service = %request.service_name,
                    entity = %request.entity_name,
                    error = %err,
                    "Subscription rejected"
                );
                metrics::record_subscription("rejected");
                if let Err(e) = sink
                    .send(ServerMessage::subscription_error(&request.channel_id, &err))
                    .await
                {
                    debug!(connection = %id, error = %e, "Failed to send subscription error");
                }
            }
        }
    }

    async fn reject(&self, id: ConnectionId, channel: &str, err: &Error) {
        if let Some(sink) = self.sink(id) {
            if let Err(e) = sink.send(ServerMessage::subscription_error(channel, err)).await {
                debug!(connection = %id, error = %e, "Failed to send rejection");
            }
        }
    }

    /// Open an in-process connection; returns the client's end
    pub fn connect_in_process(
        self: &Arc<Self>,
        capacity: usize,
    ) -> InProcessEndpoint<ClientMessage, ServerMessage> {
        let (server_end, client_end) = duplex_pair::<ServerMessage, ClientMessage>(capacity);
        let server_end = Arc::new(server_end);
        let id = self.register_connection(server_end.clone());
        let handler = ConnectionHandler {
            server: Arc::clone(self),
            id,
        };
        tokio::spawn(async move {
            server_end.pump(&handler).await;
        });
        client_end
    }

    /// Drop every connection and job
    pub fn shutdown(&self) {
        self.connections.clear();
        self.registry.shutdown();
        metrics::set_connections(0);
    }
}

/// Routes one connection's inbound messages to the gateway
pub struct ConnectionHandler {
    server: Arc<RealtimeServer>,
    id: ConnectionId,
}

impl ConnectionHandler {
    pub fn new(server: Arc<RealtimeServer>, id: ConnectionId) -> Self {
        Self { server, id }
    }
}

#[async_trait]
impl MessageHandler<ClientMessage> for ConnectionHandler {
    async fn on_message(&self, msg: ClientMessage) {
        self.server.handle_message(self.id, msg).await;
    }

    async fn on_close(&self) {
        self.server.unregister_connection(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SourceCatalog;
    use crate::memory::MemorySource;
    use crate::protocol::UnsubscribeRequest;
    use crate::transport::Duplex;
    use tablewatch_common::config::PollingConfig;
    use tablewatch_common::TableFilters;

    fn server() -> Arc<RealtimeServer> {
        let source = MemorySource::new();
        source.create_table("orders", &[("id", "int"), ("created_at", "timestamp")], "id");
        let catalog = SourceCatalog::new().with_service("crm", Arc::new(source));
        let registry = SubscriptionRegistry::new(Arc::new(catalog), PollingConfig::default(), 16);
        Arc::new(RealtimeServer::new(&RealtimeConfig::default(), Arc::new(registry)))
    }

    fn subscribe(channel: &str, entity: &str) -> ClientMessage {
        ClientMessage::SubscribeTable(SubscribeRequest {
            service_name: "crm".into(),
            entity_name: entity.into(),
            channel_id: channel.into(),
            filters: TableFilters::default(),
            polling_interval: 0,
            enable_database_triggers: false,
        })
    }

    #[tokio::test]
    async fn test_subscribe_confirms_and_unsubscribe_tears_down() {
        let server = server();
        let client = server.connect_in_process(16);

        client.send(subscribe("c1", "orders")).await.unwrap();
        assert_eq!(client.recv().await, Some(ServerMessage::confirmed("c1")));
        assert_eq!(server.registry().job_count(), 1);

        client
            .send(ClientMessage::UnsubscribeTable(UnsubscribeRequest {
                channel_id: "c1".into(),
            }))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(server.registry().job_count(), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_subscribe_error_for_unknown_entity() {
        let server = server();
        let client = server.connect_in_process(16);

        client.send(subscribe("c1", "missing")).await.unwrap();
        let Some(ServerMessage::SubscriptionError(err)) = client.recv().await else {
            panic!("expected subscription_error");
        };
        assert_eq!(err.channel_id, "c1");
        assert_eq!(err.code.as_deref(), Some("unknown_entity"));
        assert_eq!(server.registry().job_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_channel_id_is_generated() {
        let server = server();
        let client = server.connect_in_process(16);

        client.send(subscribe("", "orders")).await.unwrap();
        let Some(ServerMessage::SubscriptionConfirmed(ack)) = client.recv().await else {
            panic!("expected subscription_confirmed");
        };
        assert!(Uuid::parse_str(&ack.channel_id).is_ok());
        server.shutdown();
    }

    #[tokio::test]
    async fn test_malformed_text_is_rejected() {
        let server = server();
        let (server_end, client_end) = duplex_pair::<ServerMessage, ClientMessage>(16);
        let id = server.register_connection(Arc::new(server_end));

        server
            .handle_text(id, r#"{"type":"subscribe_table","channelId":"c7"}"#)
            .await;
        let Some(ServerMessage::SubscriptionError(err)) = client_end.recv().await else {
            panic!("expected subscription_error");
        };
        assert_eq!(err.channel_id, "c7");
        assert_eq!(err.code.as_deref(), Some("invalid_message"));
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_connection_loss_unbinds_channels() {
        let server = server();
        let client = server.connect_in_process(16);
        client.send(subscribe("a", "orders")).await.unwrap();
        client.recv().await;
        assert_eq!(server.registry().channel_count(), 1);

        drop(client);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.registry().channel_count(), 0);
        assert_eq!(server.registry().job_count(), 0);
    }
}
