//! Subscription registry
//!
//! Jobs live in a `DashMap` keyed by [`JobKey`]; binding and unbinding happen
//! inside that key's entry, so mutations for one key are serialized while
//! other keys proceed. Lock order is always jobs before routes.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use tablewatch_common::config::PollingConfig;
use tablewatch_common::{metrics, Error, JobKey, Result};

use crate::catalog::SourceCatalog;
use crate::job::{BatchOrigin, ChangeBatch, ChangeBatchHandler, JobParams, PollingJob};
use crate::protocol::{ServerMessage, SubscribeRequest};
use crate::transport::Outbox;

/// Identifies one client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Channel ids are scoped to their connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelKey {
    pub connection: ConnectionId,
    pub channel: String,
}

impl ChannelKey {
    pub fn new(connection: ConnectionId, channel: &str) -> Self {
        Self {
            connection,
            channel: channel.to_string(),
        }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.connection, self.channel)
    }
}

struct ChannelRoute {
    job_key: JobKey,
    outbox: Arc<Outbox>,
    requested_interval: u64,
    triggers: bool,
}

/// Channel bindings of every job
#[derive(Default)]
pub struct RouteTable {
    job_channels: DashMap<JobKey, HashSet<ChannelKey>>,
    channels: DashMap<ChannelKey, ChannelRoute>,
}

impl RouteTable {
    /// Channels bound to a job
    pub fn route_update(&self, key: &JobKey) -> Vec<ChannelKey> {
        self.job_channels
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn job_of(&self, channel: &ChannelKey) -> Option<JobKey> {
        self.channels.get(channel).map(|r| r.job_key.clone())
    }

    fn bind(&self, channel: ChannelKey, route: ChannelRoute) {
        let job_key = route.job_key.clone();
        self.channels.insert(channel.clone(), route);
        self.job_channels.entry(job_key).or_default().insert(channel);
    }

    /// Remove a channel from its job's set; returns whether the set is now empty
    fn unbind(&self, key: &JobKey, channel: &ChannelKey) -> bool {
        match self.job_channels.entry(key.clone()) {
            Entry::Occupied(mut set) => {
                set.get_mut().remove(channel);
                if set.get().is_empty() {
                    set.remove();
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(_) => true,
        }
    }

    fn requested_intervals(&self, key: &JobKey) -> Vec<u64> {
        self.route_update(key)
            .iter()
            .filter_map(|c| self.channels.get(c).map(|r| r.requested_interval))
            .collect()
    }

    fn awaiting_resync(&self, key: &JobKey) -> bool {
        self.route_update(key)
            .iter()
            .any(|c| self.channels.get(c).is_some_and(|r| r.outbox.needs_resync()))
    }

    fn wants_triggers(&self, key: &JobKey) -> bool {
        self.route_update(key)
            .iter()
            .any(|c| self.channels.get(c).is_some_and(|r| r.triggers))
    }

    fn deliver(&self, key: &JobKey, build: impl Fn(&str) -> ServerMessage, triggers_only: bool) {
        for channel in self.route_update(key) {
            let Some(route) = self.channels.get(&channel) else {
                continue;
            };
            if triggers_only && !route.triggers {
                continue;
            }
            route.outbox.push(build(&channel.channel));
        }
    }
}

/// Turns job output into per-channel messages
pub struct FanOut {
    routes: Arc<RouteTable>,
}

impl FanOut {
    pub fn new(routes: Arc<RouteTable>) -> Self {
        Self { routes }
    }
}

impl ChangeBatchHandler for FanOut {
    fn on_change_batch(&self, key: &JobKey, batch: &ChangeBatch) {
        match batch.origin {
            BatchOrigin::Poll => {
                let rows: Vec<serde_json::Value> = batch
                    .snapshot
                    .iter()
                    .flatten()
                    .cloned()
                    .map(serde_json::Value::Object)
                    .collect();
                self.routes
                    .deliver(key, |channel| ServerMessage::refresh(channel, rows.clone()), false);
            }
            BatchOrigin::Trigger => {
                for event in &batch.events {
                    let record = serde_json::Value::Object(event.record.clone());
                    self.routes.deliver(
                        key,
                        |channel| ServerMessage::trigger(channel, event.operation, record.clone()),
                        true,
                    );
                }
            }
        }
    }

    fn on_polling_error(&self, key: &JobKey, error: &Error) {
        self.routes
            .deliver(key, |channel| ServerMessage::polling_error(channel, error), false);
    }

    fn needs_resync(&self, key: &JobKey) -> bool {
        self.routes.awaiting_resync(key)
    }
}

/// A channel bound to a job
pub struct Binding {
    pub channel: ChannelKey,
    pub job_key: JobKey,
    pub outbox: Arc<Outbox>,
    /// Whether this subscription started the job
    pub created_job: bool,
}

/// Job summary for the admin endpoint
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub service: String,
    pub entity: String,
    pub filters: serde_json::Value,
    pub interval_ms: u64,
    pub channels: usize,
    pub ticks: u64,
    pub triggers: bool,
}

/// Deduplicates subscriptions into polling jobs
pub struct SubscriptionRegistry {
    catalog: Arc<SourceCatalog>,
    polling: PollingConfig,
    outbox_capacity: usize,
    jobs: DashMap<JobKey, Arc<PollingJob>>,
    routes: Arc<RouteTable>,
    fan_out: Arc<FanOut>,
}

impl SubscriptionRegistry {
    pub fn new(catalog: Arc<SourceCatalog>, polling: PollingConfig, outbox_capacity: usize) -> Self {
        let routes = Arc::new(RouteTable::default());
        Self {
            catalog,
            polling,
            outbox_capacity,
            jobs: DashMap::new(),
            fan_out: Arc::new(FanOut::new(routes.clone())),
            routes,
        }
    }

    pub fn catalog(&self) -> &Arc<SourceCatalog> {
        &self.catalog
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Bind a channel to the job for its key, creating and starting the job
    /// when absent. Validation failures never create a job and leave an
    /// existing binding of the channel in place.
    pub async fn subscribe(
        &self,
        connection: ConnectionId,
        request: &SubscribeRequest,
    ) -> Result<Binding> {
        let channel = ChannelKey::new(connection, &request.channel_id);
        let job_key = JobKey::new(&request.service_name, &request.entity_name, &request.filters);

        let plan = self
            .catalog
            .plan(&request.service_name, &request.entity_name, &request.filters)
            .await?;
        let params = JobParams {
            key: job_key.clone(),
            entity: plan.entity,
            column: plan.column,
            filters: request.filters.canonical(),
            source: plan.source,
            handler: self.fan_out.clone(),
            polling: self.polling.clone(),
        };
        // Not started; dropped if the key already has a job
        let candidate = PollingJob::new(params)?;

        if self.routes.job_of(&channel).is_some() {
            debug!(channel = %channel, "Rebinding channel");
            self.unsubscribe(&channel);
        }

        let outbox = Arc::new(Outbox::new(&request.channel_id, self.outbox_capacity));
        let route = ChannelRoute {
            job_key: job_key.clone(),
            outbox: outbox.clone(),
            requested_interval: request.polling_interval,
            triggers: request.enable_database_triggers,
        };

        let (job, created_job) = match self.jobs.entry(job_key.clone()) {
            Entry::Occupied(entry) => {
                let job = entry.get().clone();
                self.routes.bind(channel.clone(), route);
                job.rebind(self.routes.requested_intervals(&job_key));
                (job, false)
            }
            Entry::Vacant(entry) => {
                let job = Arc::new(candidate);
                self.routes.bind(channel.clone(), route);
                job.rebind(self.routes.requested_intervals(&job_key));
                entry.insert(job.clone());
                (job, true)
            }
        };

        if request.enable_database_triggers {
            job.enable_triggers();
        }
        if created_job {
            job.spawn();
            info!(job = %job_key, interval_ms = job.interval_ms(), "Created polling job");
        }

        self.update_gauges();
        info!(channel = %channel, job = %job_key, created_job, "Channel subscribed");
        Ok(Binding {
            channel,
            job_key,
            outbox,
            created_job,
        })
    }

    /// Unbind a channel; the last channel leaving tears its job down
    pub fn unsubscribe(&self, channel: &ChannelKey) -> bool {
        let Some((_, route)) = self.routes.channels.remove(channel) else {
            return false;
        };
        route.outbox.close();
        let key = route.job_key;

        let removed = self.jobs.remove_if(&key, |_, job| {
            let empty = self.routes.unbind(&key, channel);
            if empty {
                job.cancel();
            } else {
                job.rebind(self.routes.requested_intervals(&key));
            }
            empty
        });
        if removed.is_none() {
            self.routes.unbind(&key, channel);
        } else {
            info!(job = %key, "Polling job torn down");
        }

        self.update_gauges();
        debug!(channel = %channel, job = %key, "Channel unsubscribed");
        true
    }

    /// Unbind every channel of a connection
    pub fn unsubscribe_connection(&self, connection: ConnectionId) -> usize {
        let channels: Vec<ChannelKey> = self
            .routes
            .channels
            .iter()
            .filter(|entry| entry.key().connection == connection)
            .map(|entry| entry.key().clone())
            .collect();
        channels.iter().filter(|c| self.unsubscribe(c)).count()
    }

    pub fn job(&self, key: &JobKey) -> Option<Arc<PollingJob>> {
        self.jobs.get(key).map(|j| j.clone())
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn channel_count(&self) -> usize {
        self.routes.channel_count()
    }

    /// Channels currently bound to a job
    pub fn route_update(&self, key: &JobKey) -> Vec<ChannelKey> {
        self.routes.route_update(key)
    }

    /// Whether any channel of a job asked for trigger events
    pub fn triggers_requested(&self, key: &JobKey) -> bool {
        self.routes.wants_triggers(key)
    }

    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut infos: Vec<JobInfo> = self
            .jobs
            .iter()
            .map(|entry| {
                let (key, job) = (entry.key(), entry.value());
                JobInfo {
                    service: key.service.clone(),
                    entity: key.entity.clone(),
                    filters: serde_json::from_str(&key.filters).unwrap_or_default(),
                    interval_ms: job.interval_ms(),
                    channels: self.routes.route_update(key).len(),
                    ticks: job.tick_count(),
                    triggers: job.triggers_enabled(),
                }
            })
            .collect();
        infos.sort_by(|a, b| (&a.service, &a.entity).cmp(&(&b.service, &b.entity)));
        infos
    }

    /// Cancel every job and close every outbox
    pub fn shutdown(&self) {
        let channels: Vec<ChannelKey> = self
            .routes
            .channels
            .iter()
            .map(|e| e.key().clone())
            .collect();
        for channel in &channels {
            self.unsubscribe(channel);
        }
        for job in &self.jobs {
            job.cancel();
        }
        self.jobs.clear();
        info!(channels = channels.len(), "Registry shut down");
    }

    fn update_gauges(&self) {
        metrics::set_active_jobs(self.jobs.len());
        metrics::set_active_channels(self.routes.channel_count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySource;
    use serde_json::json;
    use tablewatch_common::{Row, TableFilters};

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn registry() -> (SubscriptionRegistry, Arc<MemorySource>) {
        let source = Arc::new(MemorySource::new());
        source.create_table(
            "orders",
            &[("id", "int"), ("status", "text"), ("created_at", "timestamp")],
            "id",
        );
        let catalog = SourceCatalog::new().with_service("crm", source.clone());
        (
            SubscriptionRegistry::new(Arc::new(catalog), PollingConfig::default(), 16),
            source,
        )
    }

    fn request(channel: &str, filters: TableFilters) -> SubscribeRequest {
        SubscribeRequest {
            service_name: "crm".into(),
            entity_name: "orders".into(),
            channel_id: channel.into(),
            filters,
            polling_interval: 0,
            enable_database_triggers: false,
        }
    }

    fn open_filter() -> TableFilters {
        TableFilters {
            filter: Some(json!({"status": "open"})),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_same_key_shares_job() {
        let (registry, _) = registry();
        let conn = ConnectionId::new();
        let a = registry.subscribe(conn, &request("a", TableFilters::default())).await.unwrap();
        let b = registry.subscribe(conn, &request("b", TableFilters::default())).await.unwrap();
        assert!(a.created_job);
        assert!(!b.created_job);
        assert_eq!(a.job_key, b.job_key);
        assert_eq!(registry.job_count(), 1);
        assert_eq!(registry.route_update(&a.job_key).len(), 2);

        let c = registry.subscribe(conn, &request("c", open_filter())).await.unwrap();
        assert!(c.created_job);
        assert_eq!(registry.job_count(), 2);
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_failed_subscribe_creates_nothing() {
        let (registry, _) = registry();
        let mut bad = request("a", TableFilters::default());
        bad.entity_name = "nope".into();
        let err = registry.subscribe(ConnectionId::new(), &bad).await.err().unwrap();
        assert!(err.is_configuration());
        assert_eq!(registry.job_count(), 0);
        assert_eq!(registry.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_tears_down_job() {
        let (registry, _) = registry();
        let conn = ConnectionId::new();
        let a = registry.subscribe(conn, &request("a", TableFilters::default())).await.unwrap();
        registry.subscribe(conn, &request("b", TableFilters::default())).await.unwrap();
        let job = registry.job(&a.job_key).unwrap();

        assert!(registry.unsubscribe(&ChannelKey::new(conn, "a")));
        assert!(!job.is_cancelled());
        assert!(a.outbox.is_closed());

        assert!(registry.unsubscribe(&ChannelKey::new(conn, "b")));
        assert!(job.is_cancelled());
        assert_eq!(registry.job_count(), 0);
        assert!(!registry.unsubscribe(&ChannelKey::new(conn, "b")));
    }

    #[tokio::test]
    async fn test_resubscribe_rebinds_channel() {
        let (registry, _) = registry();
        let conn = ConnectionId::new();
        let first = registry.subscribe(conn, &request("a", TableFilters::default())).await.unwrap();
        let second = registry.subscribe(conn, &request("a", open_filter())).await.unwrap();

        assert_ne!(first.job_key, second.job_key);
        assert!(first.outbox.is_closed());
        assert_eq!(registry.job_count(), 1);
        assert_eq!(registry.channel_count(), 1);
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_channel_ids_are_scoped_per_connection() {
        let (registry, _) = registry();
        let (c1, c2) = (ConnectionId::new(), ConnectionId::new());
        registry.subscribe(c1, &request("a", TableFilters::default())).await.unwrap();
        registry.subscribe(c2, &request("a", TableFilters::default())).await.unwrap();
        assert_eq!(registry.channel_count(), 2);

        assert_eq!(registry.unsubscribe_connection(c1), 1);
        assert_eq!(registry.job_count(), 1);
        assert_eq!(registry.unsubscribe_connection(c2), 1);
        assert_eq!(registry.job_count(), 0);
    }

    #[tokio::test]
    async fn test_requested_interval_lowers_job_interval() {
        let (registry, _) = registry();
        let conn = ConnectionId::new();
        let a = registry.subscribe(conn, &request("a", TableFilters::default())).await.unwrap();
        let mut fast = request("b", TableFilters::default());
        fast.polling_interval = 6_000;
        registry.subscribe(conn, &fast).await.unwrap();

        assert_eq!(registry.job(&a.job_key).unwrap().interval_ms(), 6_000);
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_new_job_starts_no_slower_than_base() {
        let (registry, _) = registry();
        let conn = ConnectionId::new();
        let mut slow = request("a", TableFilters::default());
        slow.polling_interval = 120_000;
        let a = registry.subscribe(conn, &slow).await.unwrap();
        assert_eq!(registry.job(&a.job_key).unwrap().interval_ms(), 30_000);

        let mut fast = request("b", open_filter());
        fast.polling_interval = 10_000;
        let b = registry.subscribe(conn, &fast).await.unwrap();
        assert_eq!(registry.job(&b.job_key).unwrap().interval_ms(), 10_000);
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_failed_resubscribe_keeps_binding() {
        let (registry, _) = registry();
        let conn = ConnectionId::new();
        let first = registry.subscribe(conn, &request("a", TableFilters::default())).await.unwrap();
        let job = registry.job(&first.job_key).unwrap();

        let mut unknown = request("a", TableFilters::default());
        unknown.entity_name = "nope".into();
        assert!(registry.subscribe(conn, &unknown).await.is_err());

        let bad_filter = TableFilters {
            filter: Some(json!({"status": ["open"]})),
            ..Default::default()
        };
        assert!(registry.subscribe(conn, &request("a", bad_filter)).await.is_err());

        let channel = ChannelKey::new(conn, "a");
        assert_eq!(registry.routes().job_of(&channel), Some(first.job_key.clone()));
        assert!(!first.outbox.is_closed());
        assert!(!job.is_cancelled());
        assert_eq!(registry.job_count(), 1);
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_overflowed_outbox_asks_for_resync() {
        let (registry, _) = registry();
        let conn = ConnectionId::new();
        let a = registry.subscribe(conn, &request("a", TableFilters::default())).await.unwrap();
        let handler = FanOut::new(registry.routes().clone());
        assert!(!handler.needs_resync(&a.job_key));

        for id in 0..17 {
            a.outbox
                .push(ServerMessage::polling_error("a", &Error::Timeout(id)));
        }
        assert!(handler.needs_resync(&a.job_key));

        handler.on_change_batch(
            &a.job_key,
            &ChangeBatch {
                origin: BatchOrigin::Poll,
                events: Vec::new(),
                snapshot: Some(Vec::new()),
            },
        );
        assert!(!handler.needs_resync(&a.job_key));
        registry.shutdown();
    }

    #[tokio::test]
    async fn test_fan_out_routes_by_kind() {
        let (registry, _) = registry();
        let conn = ConnectionId::new();
        let plain = registry.subscribe(conn, &request("plain", TableFilters::default())).await.unwrap();
        let mut with_triggers = request("live", TableFilters::default());
        with_triggers.enable_database_triggers = true;
        let live = registry.subscribe(conn, &with_triggers).await.unwrap();
        assert!(registry.triggers_requested(&plain.job_key));

        let handler = FanOut::new(registry.routes().clone());
        handler.on_change_batch(
            &plain.job_key,
            &ChangeBatch {
                origin: BatchOrigin::Trigger,
                events: vec![tablewatch_common::ChangeEvent::insert(row(json!({"id": 9})), None)],
                snapshot: None,
            },
        );
        assert_eq!(plain.outbox.len(), 0);
        assert_eq!(live.outbox.len(), 1);

        handler.on_change_batch(
            &plain.job_key,
            &ChangeBatch {
                origin: BatchOrigin::Poll,
                events: Vec::new(),
                snapshot: Some(vec![row(json!({"id": 9}))]),
            },
        );
        handler.on_polling_error(&plain.job_key, &Error::Timeout(10));
        assert_eq!(plain.outbox.len(), 2);
        assert_eq!(live.outbox.len(), 3);
        registry.shutdown();
    }
}
