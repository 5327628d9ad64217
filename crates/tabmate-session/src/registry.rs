//! Process-wide directory of live table sessions.

use std::{collections::HashMap, sync::Arc};

use tabmate_core::{
    MemberRole, NewTable, StorageError, Store, TableCode, TableId, TableMember, TableRecord,
    UserId,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    hub::{HubConfig, HubHandle},
    reconciler::Reconciler,
    router::MessageRouter,
};

/// How many fresh codes `create_new` tries before giving up.
pub const MAX_CODE_ATTEMPTS: usize = 8;

/// Registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Table not found: {0}")]
    NotFound(TableCode),
    #[error("No free table code after {0} attempts")]
    CodeExhausted(usize),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Live state for one open table.
#[derive(Debug, Clone)]
pub struct TableSession {
    pub code: TableCode,
    pub table_id: TableId,
    pub hub: HubHandle,
}

type CodeGenerator = Box<dyn Fn() -> TableCode + Send + Sync>;

/// Maps table codes to their hubs.
///
/// Sessions are only ever added; a hub lives until the process exits.
pub struct SessionRegistry<S: Store> {
    store: Arc<S>,
    hub_config: HubConfig,
    sessions: RwLock<HashMap<TableCode, TableSession>>,
    generate_code: CodeGenerator,
}

impl<S: Store> SessionRegistry<S> {
    /// Create an empty registry.
    #[must_use]
    pub fn new(store: Arc<S>, hub_config: HubConfig) -> Self {
        Self {
            store,
            hub_config,
            sessions: RwLock::new(HashMap::new()),
            generate_code: Box::new(TableCode::generate),
        }
    }

    /// Replace the source of fresh table codes.
    #[must_use]
    pub fn with_code_generator(
        mut self,
        generate: impl Fn() -> TableCode + Send + Sync + 'static,
    ) -> Self {
        self.generate_code = Box::new(generate);
        self
    }

    /// Backing store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Reconciler over the backing store.
    #[must_use]
    pub fn reconciler(&self) -> Reconciler<S> {
        Reconciler::new(Arc::clone(&self.store))
    }

    /// Router bound to the hub of `session`.
    #[must_use]
    pub fn router(&self, session: &TableSession) -> MessageRouter<S> {
        MessageRouter::new(session.hub.clone(), self.reconciler())
    }

    /// Look up a live session.
    ///
    /// # Errors
    /// Returns `NotFound` if no hub is running for `code`.
    pub async fn resolve(&self, code: &TableCode) -> Result<TableSession, RegistryError> {
        self.sessions
            .read()
            .await
            .get(code)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(code.clone()))
    }

    /// Return the session for `code`, starting an empty hub if there is none.
    pub async fn get_or_create(&self, code: &TableCode, table_id: TableId) -> TableSession {
        if let Some(session) = self.sessions.read().await.get(code) {
            return session.clone();
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions.entry(code.clone()).or_insert_with(|| {
            info!(table_code = %code, table_id = %table_id, "Starting table hub");
            TableSession {
                code: code.clone(),
                table_id,
                hub: HubHandle::spawn(code.clone(), table_id, &self.hub_config),
            }
        });
        if session.table_id != table_id {
            warn!(
                table_code = %code,
                expected = %table_id,
                actual = %session.table_id,
                "Table code already bound to another table id"
            );
        }
        session.clone()
    }

    /// Load the durable table for `code` and make sure its hub is running.
    ///
    /// # Errors
    /// Returns `NotFound` if the store has no such table.
    pub async fn open(
        &self,
        code: &TableCode,
    ) -> Result<(TableRecord, TableSession), RegistryError> {
        let record = self
            .store
            .get_table_by_code(code)
            .await?
            .ok_or_else(|| RegistryError::NotFound(code.clone()))?;
        let session = self.get_or_create(&record.code, record.id).await;
        Ok((record, session))
    }

    /// Live session for `code`, falling back to the store.
    ///
    /// # Errors
    /// Returns `NotFound` if the table exists neither live nor durably.
    pub async fn resolve_or_open(&self, code: &TableCode) -> Result<TableSession, RegistryError> {
        match self.resolve(code).await {
            Ok(session) => Ok(session),
            Err(RegistryError::NotFound(_)) => Ok(self.open(code).await?.1),
            Err(e) => Err(e),
        }
    }

    /// Create a durable table under a fresh code and start its hub.
    ///
    /// # Errors
    /// Returns `CodeExhausted` if every candidate code was taken, or a
    /// storage error.
    pub async fn create_new(
        &self,
        name: impl Into<String>,
        restaurant: impl Into<String>,
        created_by: UserId,
    ) -> Result<(TableRecord, TableSession), RegistryError> {
        let name = name.into();
        let restaurant = restaurant.into();

        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code = (self.generate_code)();
            if self.sessions.read().await.contains_key(&code)
                || self.store.get_table_by_code(&code).await?.is_some()
            {
                debug!(table_code = %code, attempt, "Table code taken, retrying");
                continue;
            }

            let created = self
                .store
                .create_table(NewTable {
                    code: code.clone(),
                    name: name.clone(),
                    restaurant: restaurant.clone(),
                    created_by,
                })
                .await;
            let record = match created {
                Ok(record) => record,
                Err(StorageError::Conflict(_)) => {
                    debug!(table_code = %code, attempt, "Table code claimed concurrently");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.store
                .add_member(record.id, created_by, MemberRole::Host)
                .await?;

            info!(
                table_code = %record.code,
                table_id = %record.id,
                restaurant = %record.restaurant,
                "Table created"
            );
            let session = self.get_or_create(&record.code, record.id).await;
            return Ok((record, session));
        }

        Err(RegistryError::CodeExhausted(MAX_CODE_ATTEMPTS))
    }

    /// Add `user` to the table's members as a guest if not already a member.
    ///
    /// # Errors
    /// Returns error if the store write fails.
    pub async fn enroll(
        &self,
        session: &TableSession,
        user: UserId,
    ) -> Result<bool, RegistryError> {
        let added = self
            .store
            .add_member(session.table_id, user, MemberRole::Guest)
            .await?;
        if added {
            info!(table_code = %session.code, user_id = %user, "Member joined table");
        }
        Ok(added)
    }

    /// Open the table for `code` and enroll `user` in it.
    ///
    /// # Errors
    /// Returns `NotFound` if the store has no such table.
    pub async fn join(
        &self,
        code: &TableCode,
        user: UserId,
    ) -> Result<(TableRecord, TableSession), RegistryError> {
        let (record, session) = self.open(code).await?;
        self.enroll(&session, user).await?;
        Ok((record, session))
    }

    /// Members of the table for `code`.
    ///
    /// # Errors
    /// Returns `NotFound` if the store has no such table.
    pub async fn members(&self, code: &TableCode) -> Result<Vec<TableMember>, RegistryError> {
        let record = self
            .store
            .get_table_by_code(code)
            .await?
            .ok_or_else(|| RegistryError::NotFound(code.clone()))?;
        Ok(self.store.list_members(record.id).await?)
    }

    /// Start a hub for every open table in the store.
    ///
    /// # Errors
    /// Returns error if the store cannot list tables.
    pub async fn warm_start(&self) -> Result<usize, RegistryError> {
        let tables = self.store.list_open_tables().await?;
        let count = tables.len();
        for table in tables {
            self.get_or_create(&table.code, table.id).await;
        }
        info!(count, "Restored open tables");
        Ok(count)
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no session is live.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
