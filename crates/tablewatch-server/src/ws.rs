//! WebSocket endpoint
//!
//! Each socket becomes one gateway connection. Text frames are handed to the
//! gateway; outbound messages go through a [`WsSink`] shared by the channel
//! writers of that connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::{Message, MessageStream, Session};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tablewatch_common::{Error, Result};
use tablewatch_realtime::protocol::ServerMessage;
use tablewatch_realtime::registry::ConnectionId;
use tablewatch_realtime::transport::Duplex;
use tablewatch_realtime::RealtimeServer;

use crate::AppState;

/// Outbound half of a WebSocket connection
pub struct WsSink {
    session: Mutex<Option<Session>>,
    closed: AtomicBool,
}

impl WsSink {
    pub fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Duplex<ServerMessage> for WsSink {
    async fn send(&self, msg: ServerMessage) -> Result<()> {
        let text = serde_json::to_string(&msg)?;
        let mut guard = self.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(Error::ChannelClosed("socket closed".into()));
        };
        if session.text(text).await.is_err() {
            guard.take();
            self.closed.store(true, Ordering::Release);
            return Err(Error::ChannelClosed("socket closed".into()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(session) = self.session.lock().await.take() {
            if let Err(e) = session.close(None).await {
                debug!(error = ?e, "WebSocket already closed by peer");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Upgrade to a WebSocket and attach it to the gateway
pub async fn websocket_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> std::result::Result<HttpResponse, actix_web::Error> {
    if !state.config.realtime.enabled {
        return Ok(HttpResponse::ServiceUnavailable().body("Realtime is disabled"));
    }

    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;

    let sink = Arc::new(WsSink::new(session.clone()));
    let realtime = Arc::clone(&state.realtime);
    let id = realtime.register_connection(sink.clone());
    info!(connection = %id, peer = ?req.peer_addr(), "WebSocket connected");

    actix_web::rt::spawn(handle_websocket(realtime, id, sink, session, msg_stream));

    Ok(response)
}

async fn handle_websocket(
    realtime: Arc<RealtimeServer>,
    id: ConnectionId,
    sink: Arc<WsSink>,
    mut session: Session,
    mut msg_stream: MessageStream,
) {
    while let Some(msg) = msg_stream.next().await {
        match msg {
            Ok(Message::Text(text)) => realtime.handle_text(id, &text).await,
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => realtime.handle_text(id, text).await,
                Err(_) => warn!(connection = %id, "Ignoring non UTF-8 binary frame"),
            },
            Ok(Message::Ping(bytes)) => {
                if session.pong(&bytes).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(reason)) => {
                debug!(connection = %id, ?reason, "Client requested close");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(connection = %id, error = %e, "WebSocket protocol error");
                break;
            }
        }
    }

    sink.close().await;
    realtime.unregister_connection(id);
}
