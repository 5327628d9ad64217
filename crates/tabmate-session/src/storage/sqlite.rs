//! SQLite table storage (feature-gated).

use std::{
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use sqlx::{
    Row, Sqlite, SqlitePool, Transaction,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use tabmate_core::{
    LineId, MemberRole, NewTable, OrderLine, Price, StorageError, Store, StoreTx, TableCode,
    TableId, TableMember, TableRecord, TableStatus, UserId,
};
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS tables (
        id TEXT PRIMARY KEY,
        code TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        restaurant TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'open',
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS order_lines (
        id TEXT PRIMARY KEY,
        table_id TEXT NOT NULL REFERENCES tables(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        price_cents INTEGER NOT NULL,
        quantity INTEGER NOT NULL CHECK (quantity > 0),
        added_by TEXT NOT NULL,
        description TEXT
    )",
    "CREATE INDEX IF NOT EXISTS order_lines_by_table ON order_lines (table_id)",
    "CREATE TABLE IF NOT EXISTS table_members (
        table_id TEXT NOT NULL REFERENCES tables(id) ON DELETE CASCADE,
        user_id TEXT NOT NULL,
        role TEXT NOT NULL,
        joined_at INTEGER NOT NULL,
        PRIMARY KEY (table_id, user_id)
    )",
];

const SELECT_TABLE: &str =
    "SELECT id, code, name, restaurant, status, created_by, created_at FROM tables";

const SELECT_LINES: &str = "SELECT l.id, l.table_id, l.name, l.price_cents, l.quantity, \
     l.added_by, l.description \
     FROM order_lines l JOIN tables t ON t.id = l.table_id \
     WHERE t.code = ? ORDER BY l.rowid";

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and apply the schema.
    ///
    /// An in-memory URL (`sqlite::memory:`) gets a single connection so every
    /// caller sees the same database.
    ///
    /// # Errors
    /// Returns error if database connection or migration fails.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(internal)?
            .create_if_missing(true)
            .foreign_keys(true);
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(internal)?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(internal)?;
        }

        Ok(Self { pool })
    }

    /// Change a table's status.
    ///
    /// # Errors
    /// Returns error if the table does not exist or the update fails.
    pub async fn set_status(
        &self,
        code: &TableCode,
        status: TableStatus,
    ) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE tables SET status = ? WHERE code = ?")
            .bind(status.as_str())
            .bind(code.as_str())
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::TableNotFound(code.clone()));
        }
        Ok(())
    }
}

#[allow(clippy::needless_pass_by_value)]
fn internal(e: impl ToString) -> StorageError {
    StorageError::Internal(e.to_string())
}

fn map_write_error(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::Conflict(db.message().to_string())
        }
        _ => internal(e),
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn uuid_column(row: &SqliteRow, column: &str) -> Result<Uuid, StorageError> {
    let raw: String = row.try_get(column).map_err(internal)?;
    Uuid::parse_str(&raw).map_err(internal)
}

fn table_from_row(row: &SqliteRow) -> Result<TableRecord, StorageError> {
    let status: String = row.try_get("status").map_err(internal)?;
    Ok(TableRecord {
        id: TableId(uuid_column(row, "id")?),
        code: TableCode::new(row.try_get::<String, _>("code").map_err(internal)?),
        name: row.try_get("name").map_err(internal)?,
        restaurant: row.try_get("restaurant").map_err(internal)?,
        status: TableStatus::parse(&status)
            .ok_or_else(|| StorageError::Internal(format!("unknown table status {status:?}")))?,
        created_by: UserId(uuid_column(row, "created_by")?),
        created_at: row.try_get("created_at").map_err(internal)?,
    })
}

fn member_from_row(row: &SqliteRow) -> Result<TableMember, StorageError> {
    let role: String = row.try_get("role").map_err(internal)?;
    Ok(TableMember {
        table_id: TableId(uuid_column(row, "table_id")?),
        user_id: UserId(uuid_column(row, "user_id")?),
        role: MemberRole::parse(&role)
            .ok_or_else(|| StorageError::Internal(format!("unknown member role {role:?}")))?,
        joined_at: row.try_get("joined_at").map_err(internal)?,
    })
}

fn line_from_row(row: &SqliteRow) -> Result<OrderLine, StorageError> {
    Ok(OrderLine {
        id: LineId(uuid_column(row, "id")?),
        table_id: TableId(uuid_column(row, "table_id")?),
        name: row.try_get("name").map_err(internal)?,
        price: Price::from_cents(row.try_get("price_cents").map_err(internal)?),
        quantity: row.try_get("quantity").map_err(internal)?,
        added_by: UserId(uuid_column(row, "added_by")?),
        description: row.try_get("description").map_err(internal)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_table(&self, table: NewTable) -> Result<TableRecord, StorageError> {
        let record = TableRecord {
            id: TableId::new(),
            code: table.code,
            name: table.name,
            restaurant: table.restaurant,
            status: TableStatus::Open,
            created_by: table.created_by,
            created_at: now(),
        };

        sqlx::query(
            "INSERT INTO tables (id, code, name, restaurant, status, created_by, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.id.to_string())
        .bind(record.code.as_str())
        .bind(&record.name)
        .bind(&record.restaurant)
        .bind(record.status.as_str())
        .bind(record.created_by.to_string())
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;

        Ok(record)
    }

    async fn get_table_by_code(
        &self,
        code: &TableCode,
    ) -> Result<Option<TableRecord>, StorageError> {
        let row = sqlx::query(&format!("{SELECT_TABLE} WHERE code = ?"))
            .bind(code.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.as_ref().map(table_from_row).transpose()
    }

    async fn list_open_tables(&self) -> Result<Vec<TableRecord>, StorageError> {
        let rows = sqlx::query(&format!(
            "{SELECT_TABLE} WHERE status = 'open' ORDER BY created_at, code"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(table_from_row).collect()
    }

    async fn add_member(
        &self,
        table_id: TableId,
        user: UserId,
        role: MemberRole,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "INSERT INTO table_members (table_id, user_id, role, joined_at) \
             VALUES (?, ?, ?, ?) ON CONFLICT (table_id, user_id) DO NOTHING",
        )
        .bind(table_id.to_string())
        .bind(user.to_string())
        .bind(role.as_str())
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(map_write_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_members(&self, table_id: TableId) -> Result<Vec<TableMember>, StorageError> {
        let rows = sqlx::query(
            "SELECT table_id, user_id, role, joined_at FROM table_members \
             WHERE table_id = ? ORDER BY rowid",
        )
        .bind(table_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(internal)?;
        rows.iter().map(member_from_row).collect()
    }

    async fn list_order_lines(&self, code: &TableCode) -> Result<Vec<OrderLine>, StorageError> {
        let rows = sqlx::query(SELECT_LINES)
            .bind(code.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        rows.iter().map(line_from_row).collect()
    }

    async fn begin(&self) -> Result<Box<dyn StoreTx>, StorageError> {
        let tx = self.pool.begin().await.map_err(internal)?;
        Ok(Box::new(SqliteTx { tx }))
    }
}

/// Transaction backed by a pooled connection. sqlx rolls back on drop.
struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreTx for SqliteTx {
    async fn list_order_lines(
        &mut self,
        code: &TableCode,
    ) -> Result<Vec<OrderLine>, StorageError> {
        let rows = sqlx::query(SELECT_LINES)
            .bind(code.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(internal)?;
        rows.iter().map(line_from_row).collect()
    }

    async fn upsert_order_line(&mut self, line: &OrderLine) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO order_lines \
             (id, table_id, name, price_cents, quantity, added_by, description) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET \
             name = excluded.name, \
             price_cents = excluded.price_cents, \
             quantity = excluded.quantity, \
             description = excluded.description",
        )
        .bind(line.id.to_string())
        .bind(line.table_id.to_string())
        .bind(&line.name)
        .bind(line.price.cents())
        .bind(line.quantity)
        .bind(line.added_by.to_string())
        .bind(line.description.as_deref())
        .execute(&mut *self.tx)
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn delete_order_line(&mut self, id: LineId) -> Result<(), StorageError> {
        let result = sqlx::query("DELETE FROM order_lines WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(internal)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::LineNotFound(id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(internal)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tabmate_core::{ItemDelta, NewItem};

    use super::*;
    use crate::{ReconcileError, Reconciler};

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:", 1).await.unwrap()
    }

    fn new_table(code: &str) -> NewTable {
        NewTable {
            code: TableCode::new(code),
            name: "Lunch".into(),
            restaurant: "Noodle Bar".into(),
            created_by: UserId(Uuid::new_v4()),
        }
    }

    fn delta(name: &str, cents: i64, quantity_delta: i64, user: UserId) -> ItemDelta {
        ItemDelta {
            item_name: name.into(),
            price: Price::from_cents(cents),
            quantity_delta,
            username: None,
            added_by_user_id: user,
        }
    }

    fn quantities(lines: &[OrderLine]) -> Vec<(&str, i64)> {
        lines.iter().map(|l| (l.name.as_str(), l.quantity)).collect()
    }

    #[tokio::test]
    async fn tables_round_trip_through_sqlite() {
        let store = store().await;
        let created = store.create_table(new_table("sql00001")).await.unwrap();

        let fetched = store
            .get_table_by_code(&created.code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, created);

        let err = store.create_table(new_table("sql00001")).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));

        store.set_status(&created.code, TableStatus::Closed).await.unwrap();
        assert!(store.list_open_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let store = store().await;
        let table = store.create_table(new_table("sql00002")).await.unwrap();
        let line = OrderLine {
            id: LineId::new(),
            table_id: table.id,
            name: "Dumplings".into(),
            price: Price::from_cents(799),
            quantity: 2,
            added_by: UserId(Uuid::new_v4()),
            description: Some("6 pcs".into()),
        };

        let mut tx = store.begin().await.unwrap();
        tx.upsert_order_line(&line).await.unwrap();
        drop(tx);
        assert!(store.list_order_lines(&table.code).await.unwrap().is_empty());

        let mut tx = store.begin().await.unwrap();
        tx.upsert_order_line(&line).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.list_order_lines(&table.code).await.unwrap(), vec![line]);
    }

    #[tokio::test]
    async fn deleting_missing_line_is_not_found() {
        let store = store().await;
        let mut tx = store.begin().await.unwrap();
        let id = LineId::new();
        let err = tx.delete_order_line(id).await.unwrap_err();
        assert!(matches!(err, StorageError::LineNotFound(missing) if missing == id));
    }

    #[tokio::test]
    async fn members_are_added_once_in_join_order() {
        let store = store().await;
        let table = store.create_table(new_table("sql00003")).await.unwrap();
        let guest = UserId(Uuid::new_v4());

        assert!(
            store
                .add_member(table.id, table.created_by, MemberRole::Host)
                .await
                .unwrap()
        );
        assert!(store.add_member(table.id, guest, MemberRole::Guest).await.unwrap());
        assert!(
            !store
                .add_member(table.id, table.created_by, MemberRole::Guest)
                .await
                .unwrap()
        );

        let members = store.list_members(table.id).await.unwrap();
        let roles: Vec<_> = members.iter().map(|m| (m.user_id, m.role)).collect();
        assert_eq!(
            roles,
            vec![(table.created_by, MemberRole::Host), (guest, MemberRole::Guest)]
        );
    }

    #[tokio::test]
    async fn reconcile_merges_case_insensitively() {
        let store = Arc::new(store().await);
        let table = store.create_table(new_table("sql00004")).await.unwrap();
        let user = UserId(Uuid::new_v4());
        let reconciler = Reconciler::new(Arc::clone(&store));

        reconciler
            .reconcile(&table.code, &[delta("Fries", 350, 2, user)])
            .await
            .unwrap();
        let summary = reconciler
            .reconcile(&table.code, &[delta("fries", 350, 1, user)])
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);

        let lines = store.list_order_lines(&table.code).await.unwrap();
        assert_eq!(quantities(&lines), vec![("Fries", 3)]);
    }

    #[tokio::test]
    async fn reconcile_add_then_remove_leaves_nothing() {
        let store = Arc::new(store().await);
        let table = store.create_table(new_table("sql00005")).await.unwrap();
        let user = UserId(Uuid::new_v4());
        let reconciler = Reconciler::new(Arc::clone(&store));

        reconciler
            .reconcile(
                &table.code,
                &[delta("Shake", 500, 2, user), delta("SHAKE", 500, -2, user)],
            )
            .await
            .unwrap();
        assert!(store.list_order_lines(&table.code).await.unwrap().is_empty());

        reconciler
            .reconcile(&table.code, &[delta("Shake", 500, 2, user)])
            .await
            .unwrap();
        let summary = reconciler
            .reconcile(&table.code, &[delta("shake", 500, -3, user)])
            .await
            .unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(store.list_order_lines(&table.code).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_failure_rolls_back_earlier_writes() {
        let store = Arc::new(store().await);
        let table = store.create_table(new_table("sql00006")).await.unwrap();
        let user = UserId(Uuid::new_v4());

        let err = Reconciler::new(Arc::clone(&store))
            .reconcile(
                &table.code,
                &[
                    delta("Tea", 200, 1, user),
                    delta("Water", 0, 1, user),
                    delta("water", 0, i64::MAX, user),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::QuantityOverflow(_)));
        assert!(store.list_order_lines(&table.code).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn added_items_keep_their_origin_text() {
        let store = Arc::new(store().await);
        let table = store.create_table(new_table("sql00007")).await.unwrap();
        let user = UserId(Uuid::new_v4());

        Reconciler::new(Arc::clone(&store))
            .add_items(
                &table.code,
                user,
                &[NewItem {
                    name: "Ramen".into(),
                    price: Price::from_cents(1450),
                    quantity: 1,
                    description: None,
                }],
            )
            .await
            .unwrap();

        let lines = store.list_order_lines(&table.code).await.unwrap();
        assert_eq!(lines[0].description.as_deref(), Some("Ramen"));
    }
}
