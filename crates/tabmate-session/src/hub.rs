//! Per-table hub.
//!
//! A hub owns the set of live connections for one table. Everything that
//! touches that set (joins, departures, fan-out, roster reads) goes through
//! one of three bounded queues and is applied by a single task, so the set is
//! never shared and never locked.

use std::{collections::HashMap, sync::Arc};

use tabmate_core::{ConnectionId, Principal, ServerFrame, TableCode, TableId, mailbox::MailboxSender};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Serialized frame as queued in a connection's mailbox.
pub type Payload = Arc<str>;

/// Hub tunables.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each of the register, unregister and outbound queues.
    pub queue_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self { queue_capacity: 64 }
    }
}

/// Which connections a frame is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    AllExcept(ConnectionId),
    Only(ConnectionId),
}

impl Scope {
    fn includes(self, id: ConnectionId) -> bool {
        match self {
            Self::All => true,
            Self::AllExcept(skip) => skip != id,
            Self::Only(only) => only == id,
        }
    }
}

/// A connection asking to join the hub.
#[derive(Debug)]
pub struct Registration {
    pub id: ConnectionId,
    pub principal: Principal,
    /// Sending half of the connection's mailbox; the hub becomes its owner.
    pub mailbox: MailboxSender<Payload>,
}

/// Point-in-time view of a hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSnapshot {
    pub connections: Vec<ConnectionId>,
    pub roster: Vec<String>,
}

/// Hub error.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Hub for table {0} has stopped")]
    Stopped(TableCode),
}

#[derive(Debug)]
enum Departure {
    /// Transport-level end of a connection.
    Disconnect(ConnectionId),
    /// Explicit leave; the remaining clients get a fresh roster.
    Leave(ConnectionId),
}

#[derive(Debug)]
enum Outbound {
    Frame { frame: ServerFrame, scope: Scope },
    Roster { scope: Scope },
    Snapshot { reply: oneshot::Sender<HubSnapshot> },
}

/// Handle to a running hub (cheap to Clone).
#[derive(Debug, Clone)]
pub struct HubHandle {
    code: TableCode,
    table_id: TableId,
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<Departure>,
    outbound_tx: mpsc::Sender<Outbound>,
}

impl HubHandle {
    /// Start a hub with an empty client set.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(code: TableCode, table_id: TableId, config: &HubConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (register_tx, register_rx) = mpsc::channel(capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);

        let hub = Hub {
            code: code.clone(),
            clients: HashMap::new(),
            register_rx,
            unregister_rx,
            outbound_rx,
        };
        tokio::spawn(hub.run());

        Self {
            code,
            table_id,
            register_tx,
            unregister_tx,
            outbound_tx,
        }
    }

    /// Code of the table this hub serves.
    #[must_use]
    pub const fn code(&self) -> &TableCode {
        &self.code
    }

    /// Durable id of the table this hub serves.
    #[must_use]
    pub const fn table_id(&self) -> TableId {
        self.table_id
    }

    fn stopped(&self) -> HubError {
        HubError::Stopped(self.code.clone())
    }

    /// Add a connection to the client set.
    ///
    /// # Errors
    /// Returns error if the hub has stopped.
    pub async fn register(&self, registration: Registration) -> Result<(), HubError> {
        self.register_tx
            .send(registration)
            .await
            .map_err(|_| self.stopped())
    }

    /// Remove a connection and close its mailbox. No-op for unknown ids.
    ///
    /// # Errors
    /// Returns error if the hub has stopped.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.unregister_tx
            .send(Departure::Disconnect(id))
            .await
            .map_err(|_| self.stopped())
    }

    /// Remove a connection right away and send the remaining clients the
    /// updated roster.
    ///
    /// # Errors
    /// Returns error if the hub has stopped.
    pub async fn leave(&self, id: ConnectionId) -> Result<(), HubError> {
        self.unregister_tx
            .send(Departure::Leave(id))
            .await
            .map_err(|_| self.stopped())
    }

    /// Fan a frame out to `scope`.
    ///
    /// # Errors
    /// Returns error if the hub has stopped.
    pub async fn broadcast(&self, frame: ServerFrame, scope: Scope) -> Result<(), HubError> {
        self.outbound_tx
            .send(Outbound::Frame { frame, scope })
            .await
            .map_err(|_| self.stopped())
    }

    /// Deliver the roster, computed when the hub processes the request.
    ///
    /// # Errors
    /// Returns error if the hub has stopped.
    pub async fn send_roster(&self, scope: Scope) -> Result<(), HubError> {
        self.outbound_tx
            .send(Outbound::Roster { scope })
            .await
            .map_err(|_| self.stopped())
    }

    /// Read the current client set.
    ///
    /// # Errors
    /// Returns error if the hub has stopped.
    pub async fn snapshot(&self) -> Result<HubSnapshot, HubError> {
        let (reply, rx) = oneshot::channel();
        self.outbound_tx
            .send(Outbound::Snapshot { reply })
            .await
            .map_err(|_| self.stopped())?;
        rx.await.map_err(|_| self.stopped())
    }

    /// Display names of everyone connected.
    ///
    /// # Errors
    /// Returns error if the hub has stopped.
    pub async fn roster(&self) -> Result<Vec<String>, HubError> {
        Ok(self.snapshot().await?.roster)
    }
}

struct Client {
    principal: Principal,
    mailbox: MailboxSender<Payload>,
}

struct Hub {
    code: TableCode,
    clients: HashMap<ConnectionId, Client>,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<Departure>,
    outbound_rx: mpsc::Receiver<Outbound>,
}

impl Hub {
    async fn run(mut self) {
        debug!(table_code = %self.code, "Hub started");
        loop {
            tokio::select! {
                biased;
                Some(registration) = self.register_rx.recv() => self.register(registration),
                Some(departure) = self.unregister_rx.recv() => self.depart(departure),
                Some(outbound) = self.outbound_rx.recv() => self.dispatch(outbound),
                else => break,
            }
        }
        debug!(table_code = %self.code, "Hub stopped");
    }

    fn register(&mut self, registration: Registration) {
        let Registration {
            id,
            principal,
            mailbox,
        } = registration;

        if self.clients.contains_key(&id) {
            // Dropping the duplicate's mailbox closes it.
            warn!(
                table_code = %self.code,
                connection_id = %id,
                "Connection registered twice, rejecting duplicate"
            );
            return;
        }

        info!(
            table_code = %self.code,
            connection_id = %id,
            user = %principal.display_name,
            "Client registered"
        );
        self.clients.insert(id, Client { principal, mailbox });
        debug!(table_code = %self.code, roster = ?self.roster(), "Current roster");
    }

    fn depart(&mut self, departure: Departure) {
        let (id, announce) = match departure {
            Departure::Disconnect(id) => (id, false),
            Departure::Leave(id) => (id, true),
        };

        let Some(mut client) = self.clients.remove(&id) else {
            return;
        };
        client.mailbox.close();
        info!(
            table_code = %self.code,
            connection_id = %id,
            user = %client.principal.display_name,
            "Client unregistered"
        );

        if announce {
            self.deliver_frame(&ServerFrame::roster(self.roster()), Scope::All);
        }
    }

    fn dispatch(&mut self, outbound: Outbound) {
        match outbound {
            Outbound::Frame { frame, scope } => self.deliver_frame(&frame, scope),
            Outbound::Roster { scope } => {
                self.deliver_frame(&ServerFrame::roster(self.roster()), scope);
            }
            Outbound::Snapshot { reply } => {
                let _ = reply.send(HubSnapshot {
                    connections: self.clients.keys().copied().collect(),
                    roster: self.roster(),
                });
            }
        }
    }

    fn deliver_frame(&mut self, frame: &ServerFrame, scope: Scope) {
        match frame.encode() {
            Ok(json) => self.deliver(&Payload::from(json), scope),
            Err(e) => error!(table_code = %self.code, "Failed to serialize frame: {e}"),
        }
    }

    /// Non-blocking fan-out. A connection whose mailbox refuses the frame is
    /// dropped on the spot.
    fn deliver(&mut self, payload: &Payload, scope: Scope) {
        let mut dead = Vec::new();
        for (id, client) in &self.clients {
            if !scope.includes(*id) {
                continue;
            }
            if let Err(e) = client.mailbox.try_deliver(Arc::clone(payload)) {
                warn!(
                    table_code = %self.code,
                    connection_id = %id,
                    reason = %e,
                    "Dropping client that cannot keep up"
                );
                dead.push(*id);
            }
        }

        for id in dead {
            if let Some(mut client) = self.clients.remove(&id) {
                client.mailbox.close();
            }
        }
    }

    fn roster(&self) -> Vec<String> {
        self.clients
            .values()
            .filter(|c| c.principal.has_display_name())
            .map(|c| c.principal.display_name.clone())
            .collect()
    }
}
