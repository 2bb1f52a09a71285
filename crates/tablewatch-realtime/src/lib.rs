//! TableWatch Realtime Engine
//!
//! Adaptive polling of database tables with subscription fan-out:
//! - Change detection by cursor column or processed marker
//! - Polling jobs deduplicated by (service, entity, filters)
//! - Adaptive intervals between a configured minimum and maximum
//! - Per-channel bounded outboxes over a duplex transport
//! - Client-side reconciliation of refreshes and trigger events

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod channel;
pub mod cleanup;
pub mod client;
pub mod cursor;
pub mod detector;
pub mod job;
pub mod memory;
pub mod protocol;
pub mod reconciler;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod source;
pub mod transport;

pub use catalog::SourceCatalog;
pub use channel::{ChannelState, ClientChannel};
pub use client::{LiveOptions, LiveTable, RealtimeClient, SnapshotFetcher, SnapshotResponse};
pub use detector::ChangeDetector;
pub use job::{ChangeBatch, ChangeBatchHandler, PollingJob};
pub use memory::MemorySource;
pub use protocol::{ClientMessage, ServerMessage};
pub use reconciler::ClientRecordSet;
pub use registry::{ChannelKey, ConnectionId, SubscriptionRegistry};
pub use scheduler::{AdaptiveInterval, IntervalPolicy};
pub use server::RealtimeServer;
pub use source::{RowQuery, RowSource};
pub use transport::{Duplex, Outbox};
