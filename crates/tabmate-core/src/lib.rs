//! Core abstractions for shared table sessions.
//!
//! This crate provides the fundamental building blocks:
//! - Table, membership and order-line model (`TableRecord`, `TableMember`, `OrderLine`,
//!   `ItemDelta`, `Price`)
//! - `Principal` - the authenticated user behind a connection
//! - `mailbox` - bounded per-connection outbound queue with a tagged close state
//! - `protocol` - JSON wire frames
//! - `Store` and `Identity` collaborator traits

pub mod mailbox;
pub mod model;
pub mod principal;
pub mod protocol;
pub mod traits;

pub use model::{
    ConnectionId, ItemDelta, LineId, MemberRole, MergeKey, NewItem, NewTable, OrderLine, Price,
    TableCode, TableId, TableMember, TableRecord, TableStatus, UserId,
};
pub use principal::Principal;
pub use protocol::{ClientFrame, ServerEvent, ServerFrame};
pub use traits::{Identity, IdentityError, StorageError, Store, StoreTx};
