//! Fan-out transport
//!
//! A [`Duplex`] carries messages one way and dispatches inbound messages to a
//! [`MessageHandler`]. Each subscribed channel owns an [`Outbox`] drained by
//! its own writer task, so a slow channel only ever stalls itself.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tablewatch_common::{metrics, Error, Result};

use crate::protocol::{ServerMessage, UpdateType};

/// Outbound half of a connection
#[async_trait]
pub trait Duplex<M: Send + 'static>: Send + Sync {
    async fn send(&self, msg: M) -> Result<()>;

    async fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Inbound dispatch target
#[async_trait]
pub trait MessageHandler<M: Send + 'static>: Send + Sync {
    async fn on_message(&self, msg: M);

    /// Called once when the inbound side ends
    async fn on_close(&self) {}
}

/// Shared handle to the server-to-client half of a connection
pub type ServerSink = Arc<dyn Duplex<ServerMessage>>;

/// One end of an in-process connection built on tokio channels
pub struct InProcessEndpoint<Out, In> {
    tx: mpsc::Sender<Out>,
    rx: tokio::sync::Mutex<mpsc::Receiver<In>>,
    closed: CancellationToken,
}

/// Two connected endpoints; closing either closes both
pub fn duplex_pair<A, B>(capacity: usize) -> (InProcessEndpoint<A, B>, InProcessEndpoint<B, A>) {
    let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
    let closed = CancellationToken::new();
    (
        InProcessEndpoint {
            tx: a_tx,
            rx: tokio::sync::Mutex::new(b_rx),
            closed: closed.clone(),
        },
        InProcessEndpoint {
            tx: b_tx,
            rx: tokio::sync::Mutex::new(a_rx),
            closed,
        },
    )
}

impl<Out: Send + 'static, In: Send + 'static> InProcessEndpoint<Out, In> {
    /// Next inbound message; `None` once the connection is closed
    pub async fn recv(&self) -> Option<In> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            () = self.closed.cancelled() => None,
            msg = rx.recv() => msg,
        }
    }

    /// Feed inbound messages to `handler` until the connection closes
    pub async fn pump(&self, handler: &dyn MessageHandler<In>) {
        while let Some(msg) = self.recv().await {
            handler.on_message(msg).await;
        }
        handler.on_close().await;
    }
}

#[async_trait]
impl<Out: Send + 'static, In: Send + 'static> Duplex<Out> for InProcessEndpoint<Out, In> {
    async fn send(&self, msg: Out) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::ChannelClosed("connection closed".to_string()));
        }
        self.tx
            .send(msg)
            .await
            .map_err(|_| Error::ChannelClosed("peer dropped".to_string()))
    }

    async fn close(&self) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }
}

/// Result of queueing a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest message
    Overflowed,
    /// Not queued (outbox closed, or trigger while awaiting resync)
    Discarded,
}

#[derive(Debug, Default)]
struct OutboxState {
    queue: VecDeque<ServerMessage>,
    needs_resync: bool,
}

/// Bounded per-channel delivery queue
#[derive(Debug)]
pub struct Outbox {
    channel_id: String,
    capacity: usize,
    state: Mutex<OutboxState>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Outbox {
    pub fn new(channel_id: &str, capacity: usize) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            capacity: capacity.max(1),
            state: Mutex::new(OutboxState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Queue a message for delivery.
    ///
    /// When full, the oldest message is evicted and the channel waits for a
    /// resync: queued and future trigger updates are discarded until the next
    /// `polling_refresh` arrives. A refresh also supersedes older queued
    /// refreshes.
    pub fn push(&self, msg: ServerMessage) -> PushOutcome {
        if self.is_closed() {
            return PushOutcome::Discarded;
        }
        let update_type = msg.update_type();
        let mut outcome = PushOutcome::Queued;
        {
            let mut state = self.state.lock();
            match update_type {
                Some(UpdateType::DatabaseTrigger) if state.needs_resync => {
                    return PushOutcome::Discarded;
                }
                Some(UpdateType::PollingRefresh) => {
                    state.needs_resync = false;
                    state
                        .queue
                        .retain(|m| m.update_type() != Some(UpdateType::PollingRefresh));
                }
                _ => {}
            }

            if state.queue.len() >= self.capacity {
                state.queue.pop_front();
                state
                    .queue
                    .retain(|m| m.update_type() != Some(UpdateType::DatabaseTrigger));
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::record_outbox_drop();
                outcome = PushOutcome::Overflowed;

                if update_type == Some(UpdateType::PollingRefresh) {
                    state.needs_resync = false;
                } else {
                    state.needs_resync = true;
                    warn!(channel = %self.channel_id, "Outbox overflow, awaiting resync");
                    if update_type == Some(UpdateType::DatabaseTrigger) {
                        drop(state);
                        self.notify.notify_one();
                        return PushOutcome::Discarded;
                    }
                }
            }
            state.queue.push_back(msg);
        }
        self.notify.notify_one();
        outcome
    }

    pub fn needs_resync(&self) -> bool {
        self.state.lock().needs_resync
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages evicted on overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting and delivering messages
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.lock().queue.clear();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait for the next message; `None` once closed
    pub async fn next(&self) -> Option<ServerMessage> {
        loop {
            if self.is_closed() {
                return None;
            }
            let popped = self.state.lock().queue.pop_front();
            if let Some(msg) = popped {
                return Some(msg);
            }
            self.notify.notified().await;
        }
    }
}

/// Drain an outbox into a connection until either side closes
pub fn spawn_writer(outbox: Arc<Outbox>, sink: ServerSink) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sent = 0u64;
        while let Some(msg) = outbox.next().await {
            if let Err(e) = sink.send(msg).await {
                debug!(channel = %outbox.channel_id(), error = %e, "Writer stopped");
                outbox.close();
                break;
            }
            sent += 1;
            metrics::record_messages_sent(1);
        }
        debug!(channel = %outbox.channel_id(), sent, "Writer finished");
    })
}
