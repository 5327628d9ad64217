//! Transactional writes to a table's order: delta merges and direct item
//! edits.

use std::{collections::HashMap, sync::Arc};

use serde::Serialize;
use tabmate_core::{
    ItemDelta, LineId, MergeKey, NewItem, OrderLine, StorageError, Store, StoreTx, TableCode,
    TableRecord, UserId,
};
use thiserror::Error;
use tracing::{debug, warn};

/// Reconcile error.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Table not found: {0}")]
    TableNotFound(TableCode),
    #[error("Order line not found: {0}")]
    LineNotFound(LineId),
    #[error("Invalid item: {0}")]
    InvalidItem(String),
    #[error("Quantity overflow for item {0:?}")]
    QuantityOverflow(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What one reconcile call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub ignored: usize,
}

/// Merges deltas into the durable order, one transaction per call.
pub struct Reconciler<S> {
    store: Arc<S>,
}

impl<S> Clone for Reconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

enum Pending {
    Stored(OrderLine),
    Absent,
}

impl<S: Store> Reconciler<S> {
    /// Reconciler writing to `store`.
    #[must_use]
    pub const fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn table(&self, code: &TableCode) -> Result<TableRecord, ReconcileError> {
        self.store
            .get_table_by_code(code)
            .await?
            .ok_or_else(|| ReconcileError::TableNotFound(code.clone()))
    }

    async fn lines_by_key(
        tx: &mut dyn StoreTx,
        code: &TableCode,
    ) -> Result<HashMap<MergeKey, OrderLine>, ReconcileError> {
        Ok(tx
            .list_order_lines(code)
            .await?
            .into_iter()
            .map(|line| (line.merge_key(), line))
            .collect())
    }

    async fn find_line(
        tx: &mut dyn StoreTx,
        code: &TableCode,
        id: LineId,
    ) -> Result<OrderLine, ReconcileError> {
        tx.list_order_lines(code)
            .await?
            .into_iter()
            .find(|line| line.id == id)
            .ok_or(ReconcileError::LineNotFound(id))
    }

    /// Apply `deltas` in order to the lines of `code`.
    ///
    /// Lines are keyed by lower-cased item name and contributor. A delta for
    /// an unknown key inserts when positive and is ignored otherwise; a delta
    /// for a known key adjusts its quantity, deleting the line once it drops
    /// to zero or below and otherwise taking the delta's price. Repeated keys
    /// accumulate within the batch.
    ///
    /// # Errors
    /// Returns error if the table is unknown, a quantity overflows, or any
    /// storage call fails. Nothing is committed in that case.
    pub async fn reconcile(
        &self,
        code: &TableCode,
        deltas: &[ItemDelta],
    ) -> Result<ReconcileSummary, ReconcileError> {
        let table = self.table(code).await?;
        let mut tx = self.store.begin().await?;
        let mut lines = Self::lines_by_key(tx.as_mut(), code).await?;

        let mut summary = ReconcileSummary::default();
        for delta in deltas {
            let key = delta.merge_key();
            let next = match lines.get(&key) {
                None if delta.quantity_delta <= 0 => {
                    debug!(item = %delta.item_name, "Ignoring removal of absent line");
                    summary.ignored += 1;
                    continue;
                }
                None => {
                    summary.inserted += 1;
                    Pending::Stored(OrderLine {
                        id: LineId::new(),
                        table_id: table.id,
                        name: delta.item_name.clone(),
                        price: delta.price,
                        quantity: delta.quantity_delta,
                        added_by: delta.added_by_user_id,
                        description: None,
                    })
                }
                Some(existing) => {
                    let quantity = existing
                        .quantity
                        .checked_add(delta.quantity_delta)
                        .ok_or_else(|| {
                            ReconcileError::QuantityOverflow(delta.item_name.clone())
                        })?;
                    if quantity <= 0 {
                        summary.deleted += 1;
                        Pending::Absent
                    } else {
                        summary.updated += 1;
                        Pending::Stored(OrderLine {
                            quantity,
                            price: delta.price,
                            ..existing.clone()
                        })
                    }
                }
            };

            match next {
                Pending::Stored(line) => {
                    tx.upsert_order_line(&line).await?;
                    lines.insert(key, line);
                }
                Pending::Absent => {
                    if let Some(line) = lines.remove(&key) {
                        tx.delete_order_line(line.id).await?;
                    }
                }
            }
        }

        tx.commit().await.inspect_err(|e| {
            warn!(table_code = %code, error = %e, "Order reconcile commit failed");
        })?;

        debug!(
            table_code = %code,
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            ignored = summary.ignored,
            "Order reconciled"
        );
        Ok(summary)
    }

    /// Add items on behalf of `added_by`, all in one transaction.
    ///
    /// An item matching an existing line of the same contributor adds to its
    /// quantity; otherwise a new line is stored with the item's origin text.
    /// Returns the resulting lines in the order they were first touched.
    ///
    /// # Errors
    /// Returns `InvalidItem` for a blank name or a quantity below one, plus
    /// the errors of [`Reconciler::reconcile`].
    pub async fn add_items(
        &self,
        code: &TableCode,
        added_by: UserId,
        items: &[NewItem],
    ) -> Result<Vec<OrderLine>, ReconcileError> {
        let table = self.table(code).await?;
        let mut tx = self.store.begin().await?;
        let mut lines = Self::lines_by_key(tx.as_mut(), code).await?;
        let mut touched: Vec<MergeKey> = Vec::with_capacity(items.len());

        for item in items {
            if item.name.trim().is_empty() {
                return Err(ReconcileError::InvalidItem("item name is empty".into()));
            }
            if item.quantity <= 0 {
                return Err(ReconcileError::InvalidItem(format!(
                    "quantity {} for {:?}",
                    item.quantity, item.name
                )));
            }

            let key = MergeKey::new(&item.name, added_by);
            let line = match lines.get(&key) {
                Some(existing) => OrderLine {
                    quantity: existing.quantity.checked_add(item.quantity).ok_or_else(|| {
                        ReconcileError::QuantityOverflow(item.name.clone())
                    })?,
                    price: item.price,
                    description: existing
                        .description
                        .clone()
                        .or_else(|| Some(item.origin_text())),
                    ..existing.clone()
                },
                None => OrderLine {
                    id: LineId::new(),
                    table_id: table.id,
                    name: item.name.clone(),
                    price: item.price,
                    quantity: item.quantity,
                    added_by,
                    description: Some(item.origin_text()),
                },
            };

            tx.upsert_order_line(&line).await?;
            if !touched.contains(&key) {
                touched.push(key.clone());
            }
            lines.insert(key, line);
        }

        tx.commit().await?;
        debug!(table_code = %code, items = items.len(), "Items added");
        Ok(touched
            .iter()
            .filter_map(|key| lines.get(key).cloned())
            .collect())
    }

    /// Set the quantity of one line. Zero or less removes it.
    ///
    /// # Errors
    /// Returns `LineNotFound` if the line is not part of the table's order.
    pub async fn set_quantity(
        &self,
        code: &TableCode,
        id: LineId,
        quantity: i64,
    ) -> Result<Option<OrderLine>, ReconcileError> {
        self.table(code).await?;
        let mut tx = self.store.begin().await?;
        let current = Self::find_line(tx.as_mut(), code, id).await?;

        let result = if quantity <= 0 {
            tx.delete_order_line(id).await?;
            None
        } else {
            let line = OrderLine {
                quantity,
                ..current
            };
            tx.upsert_order_line(&line).await?;
            Some(line)
        };

        tx.commit().await?;
        Ok(result)
    }

    /// Delete one line and return it.
    ///
    /// # Errors
    /// Returns `LineNotFound` if the line is not part of the table's order.
    pub async fn remove_line(
        &self,
        code: &TableCode,
        id: LineId,
    ) -> Result<OrderLine, ReconcileError> {
        self.table(code).await?;
        let mut tx = self.store.begin().await?;
        let line = Self::find_line(tx.as_mut(), code, id).await?;
        tx.delete_order_line(id).await?;
        tx.commit().await?;
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tabmate_core::{MemberRole, NewTable, Price, TableId, TableMember};
    use uuid::Uuid;

    use super::*;
    use crate::storage::MemoryStore;

    fn delta(name: &str, cents: i64, quantity_delta: i64, user: UserId) -> ItemDelta {
        ItemDelta {
            item_name: name.into(),
            price: Price::from_cents(cents),
            quantity_delta,
            username: None,
            added_by_user_id: user,
        }
    }

    async fn table(store: &MemoryStore, code: &str) -> TableRecord {
        store
            .create_table(NewTable {
                code: TableCode::new(code),
                name: "Team lunch".into(),
                restaurant: "Burger Shack".into(),
                created_by: UserId(Uuid::new_v4()),
            })
            .await
            .unwrap()
    }

    async fn seed(store: &MemoryStore, line: OrderLine) {
        let mut tx = store.begin().await.unwrap();
        tx.upsert_order_line(&line).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn delta_merges_case_insensitively() {
        let store = Arc::new(MemoryStore::new());
        let table = table(&store, "fries001").await;
        let u1 = UserId(Uuid::new_v4());
        seed(
            &store,
            OrderLine {
                id: LineId::new(),
                table_id: table.id,
                name: "Fries".into(),
                price: Price::from_cents(350),
                quantity: 2,
                added_by: u1,
                description: Some("Fries ... 3.50".into()),
            },
        )
        .await;

        let summary = Reconciler::new(Arc::clone(&store))
            .reconcile(&table.code, &[delta("fries", 350, 1, u1)])
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);

        let lines = store.list_order_lines(&table.code).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].quantity, 3);
        assert_eq!(lines[0].name, "Fries");
        assert_eq!(lines[0].description.as_deref(), Some("Fries ... 3.50"));
    }

    #[tokio::test]
    async fn add_then_remove_in_one_batch_leaves_nothing() {
        let store = Arc::new(MemoryStore::new());
        let table = table(&store, "pair0001").await;
        let u1 = UserId(Uuid::new_v4());

        let summary = Reconciler::new(Arc::clone(&store))
            .reconcile(
                &table.code,
                &[delta("Shake", 500, 2, u1), delta("shake", 500, -2, u1)],
            )
            .await
            .unwrap();

        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.deleted, 1);
        assert!(store.list_order_lines(&table.code).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn removal_of_unknown_line_is_ignored() {
        let store = Arc::new(MemoryStore::new());
        let table = table(&store, "ignr0001").await;

        let summary = Reconciler::new(Arc::clone(&store))
            .reconcile(&table.code, &[delta("Soup", 400, -1, UserId(Uuid::new_v4()))])
            .await
            .unwrap();

        assert_eq!(summary.ignored, 1);
        assert!(store.list_order_lines(&table.code).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repeated_keys_accumulate_and_take_latest_price() {
        let store = Arc::new(MemoryStore::new());
        let table = table(&store, "accu0001").await;
        let u1 = UserId(Uuid::new_v4());

        Reconciler::new(Arc::clone(&store))
            .reconcile(
                &table.code,
                &[delta("Taco", 300, 1, u1), delta("TACO", 325, 2, u1)],
            )
            .await
            .unwrap();

        let lines = store.list_order_lines(&table.code).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].quantity, 3);
        assert_eq!(lines[0].price, Price::from_cents(325));
    }

    #[tokio::test]
    async fn contributors_keep_separate_lines() {
        let store = Arc::new(MemoryStore::new());
        let table = table(&store, "split001").await;

        Reconciler::new(Arc::clone(&store))
            .reconcile(
                &table.code,
                &[
                    delta("Nachos", 900, 1, UserId(Uuid::new_v4())),
                    delta("nachos", 900, 1, UserId(Uuid::new_v4())),
                ],
            )
            .await
            .unwrap();

        assert_eq!(store.list_order_lines(&table.code).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_table_is_reported() {
        let store = Arc::new(MemoryStore::new());
        let err = Reconciler::new(store)
            .reconcile(&TableCode::new("nope0000"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::TableNotFound(_)));
    }

    #[tokio::test]
    async fn overflow_rolls_back() {
        let store = Arc::new(MemoryStore::new());
        let table = table(&store, "ovfl0001").await;
        let u1 = UserId(Uuid::new_v4());

        let err = Reconciler::new(Arc::clone(&store))
            .reconcile(
                &table.code,
                &[delta("Water", 0, 1, u1), delta("Water", 0, i64::MAX, u1)],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::QuantityOverflow(_)));
        assert!(store.list_order_lines(&table.code).await.unwrap().is_empty());
    }

    fn item(name: &str, cents: i64, quantity: i64, description: Option<&str>) -> NewItem {
        NewItem {
            name: name.into(),
            price: Price::from_cents(cents),
            quantity,
            description: description.map(Into::into),
        }
    }

    #[tokio::test]
    async fn added_items_carry_origin_text_and_merge_with_deltas() {
        let store = Arc::new(MemoryStore::new());
        let table = table(&store, "item0001").await;
        let u1 = UserId(Uuid::new_v4());
        let reconciler = Reconciler::new(Arc::clone(&store));

        let added = reconciler
            .add_items(
                &table.code,
                u1,
                &[
                    item("Fries", 350, 1, Some("FRIES ..... 3.50")),
                    item("Cola", 250, 2, None),
                    item("fries", 350, 1, None),
                ],
            )
            .await
            .unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].quantity, 2);
        assert_eq!(added[0].description.as_deref(), Some("FRIES ..... 3.50"));
        assert_eq!(added[1].description.as_deref(), Some("Cola"));

        reconciler
            .reconcile(&table.code, &[delta("FRIES", 350, 1, u1)])
            .await
            .unwrap();
        let lines = store.list_order_lines(&table.code).await.unwrap();
        let fries = lines.iter().find(|l| l.name == "Fries").unwrap();
        assert_eq!(fries.quantity, 3);
        assert_eq!(fries.description.as_deref(), Some("FRIES ..... 3.50"));
    }

    #[tokio::test]
    async fn invalid_item_adds_nothing() {
        let store = Arc::new(MemoryStore::new());
        let table = table(&store, "item0002").await;

        let err = Reconciler::new(Arc::clone(&store))
            .add_items(
                &table.code,
                UserId(Uuid::new_v4()),
                &[item("Soup", 400, 1, None), item("Bread", 100, 0, None)],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::InvalidItem(_)));
        assert!(store.list_order_lines(&table.code).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_quantity_updates_then_removes() {
        let store = Arc::new(MemoryStore::new());
        let table = table(&store, "qty00001").await;
        let reconciler = Reconciler::new(Arc::clone(&store));
        let added = reconciler
            .add_items(
                &table.code,
                UserId(Uuid::new_v4()),
                &[item("Wings", 900, 1, None)],
            )
            .await
            .unwrap();
        let id = added[0].id;

        let updated = reconciler.set_quantity(&table.code, id, 4).await.unwrap();
        assert_eq!(updated.map(|l| l.quantity), Some(4));

        assert_eq!(reconciler.set_quantity(&table.code, id, 0).await.unwrap(), None);
        assert!(store.list_order_lines(&table.code).await.unwrap().is_empty());

        let err = reconciler.set_quantity(&table.code, id, 1).await.unwrap_err();
        assert!(matches!(err, ReconcileError::LineNotFound(_)));
    }

    #[tokio::test]
    async fn remove_line_is_scoped_to_its_table() {
        let store = Arc::new(MemoryStore::new());
        let first = table(&store, "rmv00001").await;
        let second = table(&store, "rmv00002").await;
        let reconciler = Reconciler::new(Arc::clone(&store));
        let added = reconciler
            .add_items(&first.code, UserId(Uuid::new_v4()), &[item("Pho", 1300, 1, None)])
            .await
            .unwrap();

        let err = reconciler
            .remove_line(&second.code, added[0].id)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::LineNotFound(_)));

        let removed = reconciler.remove_line(&first.code, added[0].id).await.unwrap();
        assert_eq!(removed.name, "Pho");
        assert!(store.list_order_lines(&first.code).await.unwrap().is_empty());
    }

    /// Store whose transactions fail on the write after `fail_after` writes.
    struct FlakyStore {
        inner: MemoryStore,
        fail_after: usize,
    }

    struct FlakyTx {
        inner: Box<dyn StoreTx>,
        writes: usize,
        fail_after: usize,
    }

    impl FlakyTx {
        fn tick(&mut self) -> Result<(), StorageError> {
            if self.writes >= self.fail_after {
                return Err(StorageError::Internal("injected failure".into()));
            }
            self.writes += 1;
            Ok(())
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn create_table(&self, table: NewTable) -> Result<TableRecord, StorageError> {
            self.inner.create_table(table).await
        }

        async fn get_table_by_code(
            &self,
            code: &TableCode,
        ) -> Result<Option<TableRecord>, StorageError> {
            self.inner.get_table_by_code(code).await
        }

        async fn list_open_tables(&self) -> Result<Vec<TableRecord>, StorageError> {
            self.inner.list_open_tables().await
        }

        async fn add_member(
            &self,
            table_id: TableId,
            user: UserId,
            role: MemberRole,
        ) -> Result<bool, StorageError> {
            self.inner.add_member(table_id, user, role).await
        }

        async fn list_members(
            &self,
            table_id: TableId,
        ) -> Result<Vec<TableMember>, StorageError> {
            self.inner.list_members(table_id).await
        }

        async fn list_order_lines(
            &self,
            code: &TableCode,
        ) -> Result<Vec<OrderLine>, StorageError> {
            self.inner.list_order_lines(code).await
        }

        async fn begin(&self) -> Result<Box<dyn StoreTx>, StorageError> {
            Ok(Box::new(FlakyTx {
                inner: self.inner.begin().await?,
                writes: 0,
                fail_after: self.fail_after,
            }))
        }
    }

    #[async_trait]
    impl StoreTx for FlakyTx {
        async fn list_order_lines(
            &mut self,
            code: &TableCode,
        ) -> Result<Vec<OrderLine>, StorageError> {
            self.inner.list_order_lines(code).await
        }

        async fn upsert_order_line(&mut self, line: &OrderLine) -> Result<(), StorageError> {
            self.tick()?;
            self.inner.upsert_order_line(line).await
        }

        async fn delete_order_line(&mut self, id: LineId) -> Result<(), StorageError> {
            self.tick()?;
            self.inner.delete_order_line(id).await
        }

        async fn commit(self: Box<Self>) -> Result<(), StorageError> {
            self.inner.commit().await
        }
    }

    #[tokio::test]
    async fn failure_mid_batch_leaves_lines_unchanged() {
        let inner = MemoryStore::new();
        let table = table(&inner, "flky0001").await;
        let u1 = UserId(Uuid::new_v4());
        let original = OrderLine {
            id: LineId::new(),
            table_id: table.id,
            name: "Pizza".into(),
            price: Price::from_cents(1200),
            quantity: 1,
            added_by: u1,
            description: None,
        };
        seed(&inner, original.clone()).await;

        let store = Arc::new(FlakyStore {
            inner,
            fail_after: 2,
        });
        let err = Reconciler::new(Arc::clone(&store))
            .reconcile(
                &table.code,
                &[
                    delta("pizza", 1200, 1, u1),
                    delta("Salad", 800, 1, u1),
                    delta("Soda", 250, 3, u1),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Storage(_)));
        assert_eq!(
            store.list_order_lines(&table.code).await.unwrap(),
            vec![original]
        );
    }
}
