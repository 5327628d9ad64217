//! Wire protocol for table sessions.
//!
//! Every frame is a JSON object discriminated by `type`, except the chat
//! frame sent to clients, which keeps its historical `SenderID`/`Content`
//! shape.

use serde::{Deserialize, Serialize};

use crate::model::ItemDelta;

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Chat line for everyone else at the table.
    Chat {
        #[serde(default)]
        content: String,
    },
    /// Announces a newly joined diner.
    UserJoined {
        #[serde(default)]
        username: String,
    },
    /// Explicit leave.
    UserDisconnected {
        #[serde(default)]
        username: String,
    },
    /// An item was added to the shared menu view.
    MenuAdd {
        #[serde(default)]
        username: String,
        #[serde(default)]
        item: String,
    },
    /// An item was removed from the shared menu view.
    MenuRemove {
        #[serde(default)]
        username: String,
        #[serde(default)]
        item: String,
    },
    /// Ask for the current roster.
    RequestUsernames,
    /// Persist quantity changes to the shared order.
    OrderSync {
        #[serde(default)]
        updates: Vec<ItemDelta>,
    },
    /// Any `type` this server does not understand.
    #[serde(other)]
    Unknown,
}

impl ClientFrame {
    /// Parse a text frame.
    ///
    /// # Errors
    /// Returns the JSON error for anything that is not a well-formed frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Chat line as delivered to other clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFrame {
    #[serde(rename = "SenderID")]
    pub sender_id: String,
    #[serde(rename = "Content")]
    pub content: String,
}

/// Typed server event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    UserJoined {
        username: String,
    },
    UserList {
        usernames: Vec<String>,
    },
    MenuAdd {
        username: String,
        item: String,
    },
    MenuRemove {
        username: String,
        item: String,
    },
    OrderSynced {
        username: String,
        updates: Vec<ItemDelta>,
    },
    Error {
        message: String,
    },
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Chat(ChatFrame),
    Event(ServerEvent),
}

impl ServerFrame {
    /// Chat line from `sender`.
    #[must_use]
    pub fn chat(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Chat(ChatFrame {
            sender_id: sender.into(),
            content: content.into(),
        })
    }

    /// Current roster of display names.
    #[must_use]
    pub const fn roster(usernames: Vec<String>) -> Self {
        Self::Event(ServerEvent::UserList { usernames })
    }

    /// Error notice for a single client.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Event(ServerEvent::Error {
            message: message.into(),
        })
    }

    /// Serialize to the text payload written to the socket.
    ///
    /// # Errors
    /// Only fails if serde_json cannot serialize the frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ServerEvent> for ServerFrame {
    fn from(event: ServerEvent) -> Self {
        Self::Event(event)
    }
}
