//! Bounded outbound mailbox for one connection.
//!
//! The sending half is owned by exactly one party (the hub) and is the only
//! thing that can close the mailbox. The receiving half is drained by the
//! connection's writer. Both halves observe a shared tagged state:
//!
//! - `Open`: deliveries are accepted.
//! - `Closing`: the sender closed; the receiver may still hold buffered frames.
//! - `Closed`: the receiver has drained everything and observed the end.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use thiserror::Error;
use tokio::sync::mpsc;

/// Default number of frames a mailbox buffers before it counts as full.
pub const DEFAULT_CAPACITY: usize = 256;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Observable state of a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxState {
    Open,
    Closing,
    Closed,
}

impl MailboxState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            OPEN => Self::Open,
            CLOSING => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a delivery was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("mailbox is full")]
    Full,
    #[error("mailbox is closed")]
    Closed,
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
}

impl Shared {
    fn state(&self) -> MailboxState {
        MailboxState::from_raw(self.state.load(Ordering::Acquire))
    }
}

/// Create a mailbox holding at most `capacity` undelivered frames.
#[must_use]
pub fn mailbox<T>(capacity: usize) -> (MailboxSender<T>, MailboxReceiver<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(Shared {
        state: AtomicU8::new(OPEN),
    });
    (
        MailboxSender {
            tx: Some(tx),
            shared: Arc::clone(&shared),
        },
        MailboxReceiver { rx, shared },
    )
}

/// Sending half. Not `Clone`: whoever holds it is the sole closer.
#[derive(Debug)]
pub struct MailboxSender<T> {
    tx: Option<mpsc::Sender<T>>,
    shared: Arc<Shared>,
}

impl<T> MailboxSender<T> {
    /// Enqueue without waiting.
    ///
    /// # Errors
    /// `Full` when the buffer is at capacity, `Closed` when either half has
    /// gone away.
    pub fn try_deliver(&self, item: T) -> Result<(), DeliveryError> {
        let Some(tx) = &self.tx else {
            return Err(DeliveryError::Closed);
        };
        tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Close the mailbox. Returns `false` if it was already closed.
    pub fn close(&mut self) -> bool {
        let Some(tx) = self.tx.take() else {
            return false;
        };
        drop(tx);
        let _ = self
            .shared
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire);
        true
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MailboxState {
        self.shared.state()
    }
}

impl<T> Drop for MailboxSender<T> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Receiving half, drained by the connection writer.
#[derive(Debug)]
pub struct MailboxReceiver<T> {
    rx: mpsc::Receiver<T>,
    shared: Arc<Shared>,
}

impl<T> MailboxReceiver<T> {
    /// Wait for the next frame. `None` once the sender closed and the buffer
    /// is drained.
    pub async fn recv(&mut self) -> Option<T> {
        let item = self.rx.recv().await;
        if item.is_none() {
            self.shared.state.store(CLOSED, Ordering::Release);
        }
        item
    }

    /// Take a buffered frame without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.shared.state.store(CLOSED, Ordering::Release);
                None
            }
            Err(mpsc::error::TryRecvError::Empty) => None,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MailboxState {
        self.shared.state()
    }

    /// Whether the sender has closed the mailbox (buffered frames may remain).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() != MailboxState::Open
    }
}
