//! One participant's socket: a reader task and a writer task.
//!
//! The reader decodes frames and routes them in its own task. The writer
//! drains the connection's mailbox and keeps the peer alive with pings. The
//! two share nothing but the socket halves and the mailbox.

use std::{fmt::Display, time::Duration};

use axum::extract::ws::{Message, Utf8Bytes};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tabmate_core::{
    ConnectionId, Principal, Store,
    mailbox::{self, MailboxReceiver},
};
use tabmate_session::{Flow, HubError, MessageRouter, Payload, Registration};
use tokio::{
    task::JoinHandle,
    time::{Instant, interval_at, timeout, timeout_at},
};
use tracing::{debug, info, warn};

/// Per-connection limits and timers.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest inbound frame accepted; anything bigger ends the connection.
    pub max_frame_bytes: usize,
    /// How long the reader waits without a pong before giving up.
    pub pong_wait: Duration,
    /// Ping interval. Must be shorter than `pong_wait`.
    pub ping_period: Duration,
    /// Deadline for a single socket write.
    pub write_wait: Duration,
    /// Outbound frames buffered before the hub evicts the connection.
    pub mailbox_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::with_pong_wait(Duration::from_secs(60))
    }
}

impl ConnectionConfig {
    /// Defaults with the given pong wait and a ping period of 9/10 of it.
    #[must_use]
    pub fn with_pong_wait(pong_wait: Duration) -> Self {
        Self {
            max_frame_bytes: 512,
            pong_wait,
            ping_period: pong_wait.mul_f64(0.9),
            write_wait: Duration::from_secs(10),
            mailbox_capacity: mailbox::DEFAULT_CAPACITY,
        }
    }
}

/// A registered connection and its running pumps.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    /// Wait for both pumps to finish.
    pub async fn closed(self) {
        let _ = self.reader.await;
        let _ = self.writer.await;
    }
}

/// Register a connection for `principal` with the router's hub and start
/// its reader and writer.
///
/// # Errors
/// Returns error if the hub has stopped.
pub async fn attach<S, W, R>(
    router: MessageRouter<S>,
    principal: Principal,
    sink: W,
    stream: R,
    config: &ConnectionConfig,
) -> Result<Connection, HubError>
where
    S: Store,
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let id = ConnectionId::new();
    let (sender, outbox) = mailbox::mailbox(config.mailbox_capacity);
    router
        .hub()
        .register(Registration {
            id,
            principal: principal.clone(),
            mailbox: sender,
        })
        .await?;

    let writer = tokio::spawn(write_pump(id, outbox, sink, config.clone()));
    let reader = tokio::spawn(read_pump(id, principal, router, stream, config.clone()));

    Ok(Connection { id, reader, writer })
}

async fn read_pump<S, R>(
    id: ConnectionId,
    principal: Principal,
    router: MessageRouter<S>,
    mut stream: R,
    config: ConnectionConfig,
) where
    S: Store,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let message = match timeout_at(deadline, stream.next()).await {
            Err(_) => {
                info!(connection_id = %id, "No pong before deadline, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(connection_id = %id, error = %e, "WebSocket read failed");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => Utf8Bytes::from(text),
                Err(_) => {
                    warn!(connection_id = %id, "Dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Message::Pong(_) => {
                deadline = Instant::now() + config.pong_wait;
                continue;
            }
            Message::Ping(_) => continue,
            Message::Close(_) => break,
        };

        let text = text.as_str();
        if text.len() > config.max_frame_bytes {
            warn!(
                connection_id = %id,
                size = text.len(),
                limit = config.max_frame_bytes,
                "Frame too large, closing"
            );
            break;
        }

        if router.handle_text(id, &principal, text).await == Flow::Disconnect {
            break;
        }
    }

    if let Err(e) = router.hub().unregister(id).await {
        debug!(connection_id = %id, error = %e, "Unregister after hub stop");
    }
}

async fn write_pump<W>(
    id: ConnectionId,
    mut outbox: MailboxReceiver<Payload>,
    mut sink: W,
    config: ConnectionConfig,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    let mut ping = interval_at(Instant::now() + config.ping_period, config.ping_period);

    loop {
        let message = tokio::select! {
            payload = outbox.recv() => match payload {
                Some(payload) => Message::Text(Utf8Bytes::from(&*payload)),
                None => {
                    let _ = write(&mut sink, Message::Close(None), config.write_wait).await;
                    debug!(connection_id = %id, "Mailbox closed, writer done");
                    break;
                }
            },
            _ = ping.tick() => Message::Ping(Bytes::new()),
        };

        if let Err(e) = write(&mut sink, message, config.write_wait).await {
            debug!(connection_id = %id, error = %e, "WebSocket write failed");
            break;
        }
    }
}

async fn write<W>(sink: &mut W, message: Message, wait: Duration) -> Result<(), String>
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    match timeout(wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write deadline exceeded".to_string()),
    }
}
