//! Client channel state machine
//!
//! `Pending → Subscribed → (Unsubscribed | Disconnected)`, with `Failed` as the
//! terminal state after a `subscription_error`.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use tablewatch_common::Row;

use crate::protocol::{ClientMessage, ServerMessage, SubscribeRequest, UnsubscribeRequest};
use crate::reconciler::ClientRecordSet;

/// Channel lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Pending,
    Subscribed,
    Failed,
    Unsubscribed,
    Disconnected,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Unsubscribed | Self::Disconnected)
    }
}

/// One subscribed table as seen by a client
#[derive(Debug, Clone)]
pub struct ClientChannel {
    request: SubscribeRequest,
    state: ChannelState,
    records: ClientRecordSet,
    last_error: Option<String>,
    polling_errors: u32,
}

impl ClientChannel {
    /// A pending channel seeded with `rows`. An empty channel id is replaced
    /// with a generated one so replies can be matched.
    pub fn new(mut request: SubscribeRequest, id_field: &str, rows: Vec<Row>) -> Self {
        if request.channel_id.is_empty() {
            request.channel_id = Uuid::new_v4().to_string();
        }
        Self {
            request,
            state: ChannelState::Pending,
            records: ClientRecordSet::from_rows(id_field, rows),
            last_error: None,
            polling_errors: 0,
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.request.channel_id
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn records(&self) -> &ClientRecordSet {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut ClientRecordSet {
        &mut self.records
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn polling_errors(&self) -> u32 {
        self.polling_errors
    }

    pub fn subscribe_message(&self) -> ClientMessage {
        ClientMessage::SubscribeTable(self.request.clone())
    }

    /// Apply a server message addressed to this channel; returns whether the
    /// records changed
    pub fn handle(&mut self, msg: &ServerMessage) -> bool {
        if msg.channel_id() != self.channel_id() {
            return false;
        }
        if self.state.is_terminal() {
            debug!(channel = %self.channel_id(), state = ?self.state, "Ignoring message for closed channel");
            return false;
        }

        match msg {
            ServerMessage::SubscriptionConfirmed(_) => {
                self.state = ChannelState::Subscribed;
                false
            }
            ServerMessage::SubscriptionError(err) => {
                warn!(channel = %self.channel_id(), error = %err.error, "Subscription failed");
                self.state = ChannelState::Failed;
                self.last_error = Some(err.error.clone());
                false
            }
            ServerMessage::PollingError(err) => {
                self.polling_errors += 1;
                self.last_error = Some(err.error.clone());
                false
            }
            ServerMessage::TableUpdate(update) => {
                if self.state != ChannelState::Subscribed {
                    debug!(channel = %self.channel_id(), "Update before confirmation");
                }
                self.records.apply(update)
            }
        }
    }

    /// Leave the channel; returns the message to send if it was still open
    pub fn unsubscribe(&mut self) -> Option<ClientMessage> {
        if self.state.is_terminal() {
            return None;
        }
        self.state = ChannelState::Unsubscribed;
        Some(ClientMessage::UnsubscribeTable(UnsubscribeRequest {
            channel_id: self.request.channel_id.clone(),
        }))
    }

    /// The connection dropped
    pub fn disconnect(&mut self) {
        if !self.state.is_terminal() {
            self.state = ChannelState::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tablewatch_common::{Error, Operation, TableFilters};

    fn channel() -> ClientChannel {
        ClientChannel::new(
            SubscribeRequest {
                service_name: "crm".into(),
                entity_name: "orders".into(),
                channel_id: "c1".into(),
                filters: TableFilters::default(),
                polling_interval: 0,
                enable_database_triggers: true,
            },
            "id",
            Vec::new(),
        )
    }

    #[test]
    fn test_confirm_then_updates() {
        let mut ch = channel();
        assert_eq!(ch.state(), ChannelState::Pending);
        ch.handle(&ServerMessage::confirmed("c1"));
        assert_eq!(ch.state(), ChannelState::Subscribed);

        assert!(ch.handle(&ServerMessage::trigger("c1", Operation::Insert, json!({"id": 1}))));
        assert!(!ch.handle(&ServerMessage::trigger("other", Operation::Insert, json!({"id": 2}))));
        assert_eq!(ch.records().len(), 1);
    }

    #[test]
    fn test_subscription_error_is_terminal() {
        let mut ch = channel();
        ch.handle(&ServerMessage::subscription_error(
            "c1",
            &Error::UnknownService("crm".into()),
        ));
        assert_eq!(ch.state(), ChannelState::Failed);
        assert!(ch.last_error().is_some());
        assert!(ch.unsubscribe().is_none());
        assert!(!ch.handle(&ServerMessage::trigger("c1", Operation::Insert, json!({"id": 1}))));
    }

    #[test]
    fn test_polling_error_keeps_subscription() {
        let mut ch = channel();
        ch.handle(&ServerMessage::confirmed("c1"));
        ch.handle(&ServerMessage::polling_error("c1", &Error::Timeout(10)));
        assert_eq!(ch.state(), ChannelState::Subscribed);
        assert_eq!(ch.polling_errors(), 1);
    }

    #[test]
    fn test_unsubscribe_and_disconnect() {
        let mut ch = channel();
        ch.handle(&ServerMessage::confirmed("c1"));
        assert!(matches!(
            ch.unsubscribe(),
            Some(ClientMessage::UnsubscribeTable(UnsubscribeRequest { channel_id })) if channel_id == "c1"
        ));
        ch.disconnect();
        assert_eq!(ch.state(), ChannelState::Unsubscribed);

        let mut other = channel();
        other.disconnect();
        assert_eq!(other.state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_generated_channel_id() {
        let mut request = channel().request;
        request.channel_id = String::new();
        let ch = ClientChannel::new(request, "id", Vec::new());
        assert!(!ch.channel_id().is_empty());
        let ClientMessage::SubscribeTable(sent) = ch.subscribe_message() else {
            panic!("expected subscribe_table");
        };
        assert_eq!(sent.channel_id, ch.channel_id());
    }
}
