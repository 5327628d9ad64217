//! Table sessions: hubs, registry, routing and order reconciliation.
//!
//! Provides:
//! - `HubHandle` - serialized owner of one table's live connections
//! - `SessionRegistry` - table code to hub directory with warm start
//! - `MessageRouter` - inbound frame handling
//! - `Reconciler` - transactional order delta merge
//! - `StaticIdentity` - token-table identity provider
//! - Storage implementations (memory, SQLite)

pub mod hub;
pub mod identity;
pub mod reconciler;
pub mod registry;
pub mod router;
pub mod storage;

pub use hub::{HubConfig, HubError, HubHandle, HubSnapshot, Payload, Registration, Scope};
pub use identity::{IdentityEntry, StaticIdentity};
pub use reconciler::{ReconcileError, ReconcileSummary, Reconciler};
pub use registry::{RegistryError, SessionRegistry, TableSession};
pub use router::{Flow, Instruction, MessageRouter, route};
