//! Wire protocol
//!
//! Every message is a JSON object tagged by `type`; payload fields are
//! camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tablewatch_common::{Error, Operation, TableFilters};

/// Client → server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    SubscribeTable(SubscribeRequest),
    UnsubscribeTable(UnsubscribeRequest),
}

/// Server → client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TableUpdate(TableUpdate),
    SubscriptionConfirmed(ChannelAck),
    SubscriptionError(ChannelError),
    PollingError(ChannelError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub service_name: String,
    pub entity_name: String,
    /// Empty asks the server to generate one
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub filters: TableFilters,
    /// Requested polling interval in milliseconds; 0 means no preference
    #[serde(default)]
    pub polling_interval: u64,
    #[serde(default)]
    pub enable_database_triggers: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    pub channel_id: String,
}

/// Kind of table update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    /// Full snapshot of the subscribed view
    PollingRefresh,
    /// A single row-level change
    DatabaseTrigger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableUpdate {
    pub channel_id: String,
    pub update_type: UpdateType,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAck {
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelError {
    pub channel_id: String,
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ChannelError {
    pub fn from_error(channel_id: &str, err: &Error) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            error: err.to_string(),
            code: Some(err.error_code().to_string()),
        }
    }
}

impl ServerMessage {
    /// A snapshot of the subscribed view
    pub fn refresh(channel_id: &str, rows: Vec<serde_json::Value>) -> Self {
        Self::TableUpdate(TableUpdate {
            channel_id: channel_id.to_string(),
            update_type: UpdateType::PollingRefresh,
            data: serde_json::Value::Array(rows),
            operation: None,
            timestamp: Utc::now(),
        })
    }

    /// A single row change pushed by a source trigger
    pub fn trigger(channel_id: &str, operation: Operation, record: serde_json::Value) -> Self {
        Self::TableUpdate(TableUpdate {
            channel_id: channel_id.to_string(),
            update_type: UpdateType::DatabaseTrigger,
            data: record,
            operation: Some(operation),
            timestamp: Utc::now(),
        })
    }

    pub fn confirmed(channel_id: &str) -> Self {
        Self::SubscriptionConfirmed(ChannelAck {
            channel_id: channel_id.to_string(),
        })
    }

    pub fn subscription_error(channel_id: &str, err: &Error) -> Self {
        Self::SubscriptionError(ChannelError::from_error(channel_id, err))
    }

    pub fn polling_error(channel_id: &str, err: &Error) -> Self {
        Self::PollingError(ChannelError::from_error(channel_id, err))
    }

    /// Channel the message is addressed to
    pub fn channel_id(&self) -> &str {
        match self {
            Self::TableUpdate(u) => &u.channel_id,
            Self::SubscriptionConfirmed(a) => &a.channel_id,
            Self::SubscriptionError(e) | Self::PollingError(e) => &e.channel_id,
        }
    }

    pub fn update_type(&self) -> Option<UpdateType> {
        match self {
            Self::TableUpdate(u) => Some(u.update_type),
            _ => None,
        }
    }
}

/// Parse an inbound text frame
pub fn parse_client_message(text: &str) -> Result<ClientMessage, Error> {
    serde_json::from_str(text).map_err(|e| Error::InvalidMessage(e.to_string()))
}

/// Best-effort channel id of a frame that failed to parse
pub fn salvage_channel_id(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("channelId").and_then(|c| c.as_str()).map(String::from))
        .unwrap_or_default()
}
