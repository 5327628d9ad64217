//! In-memory table storage.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use tabmate_core::{
    LineId, MemberRole, NewTable, OrderLine, StorageError, Store, StoreTx, TableCode, TableId,
    TableMember, TableRecord, TableStatus, UserId,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

type Lines = HashMap<TableId, Vec<OrderLine>>;
type Tables = Arc<RwLock<HashMap<TableCode, TableRecord>>>;
type Members = RwLock<HashMap<TableId, Vec<TableMember>>>;

/// In-memory storage implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart. Transactions are serialized: a transaction holds
/// the order-line lock from `begin` until it is committed or dropped.
pub struct MemoryStore {
    tables: Tables,
    members: Members,
    lines: Arc<Mutex<Lines>>,
}

impl MemoryStore {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(HashMap::new())),
            members: RwLock::new(HashMap::new()),
            lines: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Change a table's status.
    ///
    /// # Errors
    /// Returns error if the table does not exist.
    pub fn set_status(&self, code: &TableCode, status: TableStatus) -> Result<(), StorageError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let table = tables
            .get_mut(code)
            .ok_or_else(|| StorageError::TableNotFound(code.clone()))?;
        table.status = status;
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn table_id(tables: &Tables, code: &TableCode) -> Result<TableId, StorageError> {
    tables
        .read()
        .map_err(|e| StorageError::Internal(e.to_string()))?
        .get(code)
        .map(|t| t.id)
        .ok_or_else(|| StorageError::TableNotFound(code.clone()))
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_table(&self, table: NewTable) -> Result<TableRecord, StorageError> {
        let mut tables = self
            .tables
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        if tables.contains_key(&table.code) {
            return Err(StorageError::Conflict(format!(
                "table code {} already exists",
                table.code
            )));
        }

        let record = TableRecord {
            id: TableId::new(),
            code: table.code,
            name: table.name,
            restaurant: table.restaurant,
            status: TableStatus::Open,
            created_by: table.created_by,
            created_at: now(),
        };
        tables.insert(record.code.clone(), record.clone());

        Ok(record)
    }

    async fn get_table_by_code(
        &self,
        code: &TableCode,
    ) -> Result<Option<TableRecord>, StorageError> {
        Ok(self
            .tables
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(code)
            .cloned())
    }

    async fn list_open_tables(&self) -> Result<Vec<TableRecord>, StorageError> {
        let tables = self
            .tables
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        let mut result: Vec<TableRecord> = tables
            .values()
            .filter(|t| t.status == TableStatus::Open)
            .cloned()
            .collect();

        // Oldest first
        result.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.code.cmp(&b.code))
        });

        Ok(result)
    }

    async fn add_member(
        &self,
        table_id: TableId,
        user: UserId,
        role: MemberRole,
    ) -> Result<bool, StorageError> {
        let mut members = self
            .members
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let table = members.entry(table_id).or_default();
        if table.iter().any(|m| m.user_id == user) {
            return Ok(false);
        }
        table.push(TableMember {
            table_id,
            user_id: user,
            role,
            joined_at: now(),
        });
        Ok(true)
    }

    async fn list_members(&self, table_id: TableId) -> Result<Vec<TableMember>, StorageError> {
        Ok(self
            .members
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(&table_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_order_lines(&self, code: &TableCode) -> Result<Vec<OrderLine>, StorageError> {
        let id = table_id(&self.tables, code)?;
        Ok(self.lines.lock().await.get(&id).cloned().unwrap_or_default())
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StorageError> {
        let guard = Arc::clone(&self.lines).lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTx {
            tables: Arc::clone(&self.tables),
            guard,
            staged,
        }))
    }
}

/// Transaction over a private copy of the order lines. Commit swaps the copy
/// in; dropping discards it.
struct MemoryTx {
    tables: Tables,
    guard: OwnedMutexGuard<Lines>,
    staged: Lines,
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn list_order_lines(
        &mut self,
        code: &TableCode,
    ) -> Result<Vec<OrderLine>, StorageError> {
        let id = table_id(&self.tables, code)?;
        Ok(self.staged.get(&id).cloned().unwrap_or_default())
    }

    async fn upsert_order_line(&mut self, line: &OrderLine) -> Result<(), StorageError> {
        if line.quantity <= 0 {
            return Err(StorageError::Internal(format!(
                "refusing to store line {} with quantity {}",
                line.id, line.quantity
            )));
        }

        let lines = self.staged.entry(line.table_id).or_default();
        match lines.iter_mut().find(|l| l.id == line.id) {
            Some(existing) => *existing = line.clone(),
            None => lines.push(line.clone()),
        }
        Ok(())
    }

    async fn delete_order_line(&mut self, id: LineId) -> Result<(), StorageError> {
        for lines in self.staged.values_mut() {
            if let Some(pos) = lines.iter().position(|l| l.id == id) {
                lines.remove(pos);
                return Ok(());
            }
        }
        Err(StorageError::LineNotFound(id))
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let Self {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }
}
