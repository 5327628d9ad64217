//! Collaborator traits: durable storage and identity.

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    Principal,
    model::{
        LineId, MemberRole, NewTable, OrderLine, TableCode, TableId, TableMember, TableRecord,
        UserId,
    },
};

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Table not found: {0}")]
    TableNotFound(TableCode),
    #[error("Order line not found: {0}")]
    LineNotFound(LineId),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Durable store for tables and their order lines.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Create a table. Fails with `Conflict` if the code is taken.
    async fn create_table(&self, table: NewTable) -> Result<TableRecord, StorageError>;

    /// Look a table up by its public code.
    async fn get_table_by_code(&self, code: &TableCode)
    -> Result<Option<TableRecord>, StorageError>;

    /// All tables whose status is open.
    async fn list_open_tables(&self) -> Result<Vec<TableRecord>, StorageError>;

    /// Record `user` as a member of the table unless already present.
    ///
    /// Returns `true` if a membership row was added. An existing membership
    /// keeps its original role.
    async fn add_member(
        &self,
        table_id: TableId,
        user: UserId,
        role: MemberRole,
    ) -> Result<bool, StorageError>;

    /// Members of a table in join order.
    async fn list_members(&self, table_id: TableId) -> Result<Vec<TableMember>, StorageError>;

    /// Read the current order lines outside of any transaction.
    async fn list_order_lines(&self, code: &TableCode) -> Result<Vec<OrderLine>, StorageError>;

    /// Start a transaction over order lines.
    async fn begin(&self) -> Result<Box<dyn StoreTx>, StorageError>;
}

/// Transaction over order lines.
///
/// Dropping a transaction without calling [`StoreTx::commit`] rolls it back.
#[async_trait]
pub trait StoreTx: Send {
    /// Lines of a table as seen by this transaction.
    async fn list_order_lines(&mut self, code: &TableCode)
    -> Result<Vec<OrderLine>, StorageError>;

    /// Insert the line, or replace the stored line with the same id.
    async fn upsert_order_line(&mut self, line: &OrderLine) -> Result<(), StorageError>;

    /// Delete a line by id.
    async fn delete_order_line(&mut self, id: LineId) -> Result<(), StorageError>;

    /// Make every change in this transaction visible at once.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Identity error.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Missing credential")]
    MissingCredential,
    #[error("Invalid credential")]
    InvalidCredential,
    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a bearer credential to the user behind it.
#[async_trait]
pub trait Identity: Send + Sync + 'static {
    async fn authenticate(&self, credential: &str) -> Result<Principal, IdentityError>;
}
