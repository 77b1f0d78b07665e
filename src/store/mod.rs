//! Embedded persistence layer.
//!
//! Rows are serde_json documents in redb tables, with multimap tables as
//! secondary indexes. redb write transactions are exclusive and atomic:
//! every state transition happens inside one write transaction, which is
//! what serializes concurrent transitions on the same order or payment.

pub mod models;

use std::borrow::Borrow;
use std::path::Path;

use redb::{
    Database, MultimapTableDefinition, ReadTransaction, ReadableMultimapTable, ReadableTable,
    Table, TableDefinition, WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub mod tables {
    use super::{MultimapTableDefinition, TableDefinition};

    /// Monotonic id sequences, keyed by sequence name.
    pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

    pub const USERS: TableDefinition<u64, &[u8]> = TableDefinition::new("users");
    pub const USERS_BY_EMAIL: TableDefinition<&str, u64> = TableDefinition::new("users_by_email");

    pub const MERCHANTS: TableDefinition<u64, &[u8]> = TableDefinition::new("merchants");
    pub const MERCHANTS_BY_USER: TableDefinition<u64, u64> =
        TableDefinition::new("merchants_by_user");
    pub const MERCHANTS_BY_EMAIL: TableDefinition<&str, u64> =
        TableDefinition::new("merchants_by_email");

    pub const API_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("api_keys");
    pub const API_KEYS_BY_MERCHANT: MultimapTableDefinition<u64, &str> =
        MultimapTableDefinition::new("api_keys_by_merchant");

    pub const ORDERS: TableDefinition<&str, &[u8]> = TableDefinition::new("orders");
    pub const ORDERS_BY_MERCHANT: MultimapTableDefinition<u64, &str> =
        MultimapTableDefinition::new("orders_by_merchant");
    /// `"{merchant_id}:{idempotency_key}"` -> IdempotencyRecord.
    pub const ORDER_IDEMPOTENCY: TableDefinition<&str, &[u8]> =
        TableDefinition::new("order_idempotency");

    pub const PAYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("payments");
    pub const PAYMENTS_BY_ORDER: MultimapTableDefinition<&str, &str> =
        MultimapTableDefinition::new("payments_by_order");
    pub const PAYMENTS_BY_PAYER: MultimapTableDefinition<&str, &str> =
        MultimapTableDefinition::new("payments_by_payer");

    pub const REFUNDS: TableDefinition<&str, &[u8]> = TableDefinition::new("refunds");
    pub const REFUNDS_BY_PAYMENT: MultimapTableDefinition<&str, &str> =
        MultimapTableDefinition::new("refunds_by_payment");
    /// `"{payment_ref}:{idempotency_key}"` -> refund_ref.
    pub const REFUND_IDEMPOTENCY: TableDefinition<&str, &str> =
        TableDefinition::new("refund_idempotency");

    pub const OUTBOX: TableDefinition<u64, &[u8]> = TableDefinition::new("webhook_outbox");
    pub const WEBHOOK_LOGS: TableDefinition<u64, &[u8]> = TableDefinition::new("webhook_logs");
    pub const WEBHOOK_LOGS_BY_MERCHANT: MultimapTableDefinition<u64, u64> =
        MultimapTableDefinition::new("webhook_logs_by_merchant");

    pub const TRANSACTIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("transactions");
    pub const TRANSACTIONS_BY_USER: MultimapTableDefinition<u64, u64> =
        MultimapTableDefinition::new("transactions_by_user");
    pub const TXN_IDEMPOTENCY: TableDefinition<&str, u64> =
        TableDefinition::new("txn_idempotency");
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub struct Store {
    db: Database,
}

impl Store {
    /// Open (or create) the store file and ensure all tables exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        let db = Database::create(path)?;
        let store = Self { db };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())?;
        let store = Self { db };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let wtx = self.db.begin_write()?;
        {
            wtx.open_table(tables::COUNTERS)?;
            wtx.open_table(tables::USERS)?;
            wtx.open_table(tables::USERS_BY_EMAIL)?;
            wtx.open_table(tables::MERCHANTS)?;
            wtx.open_table(tables::MERCHANTS_BY_USER)?;
            wtx.open_table(tables::MERCHANTS_BY_EMAIL)?;
            wtx.open_table(tables::API_KEYS)?;
            wtx.open_multimap_table(tables::API_KEYS_BY_MERCHANT)?;
            wtx.open_table(tables::ORDERS)?;
            wtx.open_multimap_table(tables::ORDERS_BY_MERCHANT)?;
            wtx.open_table(tables::ORDER_IDEMPOTENCY)?;
            wtx.open_table(tables::PAYMENTS)?;
            wtx.open_multimap_table(tables::PAYMENTS_BY_ORDER)?;
            wtx.open_multimap_table(tables::PAYMENTS_BY_PAYER)?;
            wtx.open_table(tables::REFUNDS)?;
            wtx.open_multimap_table(tables::REFUNDS_BY_PAYMENT)?;
            wtx.open_table(tables::REFUND_IDEMPOTENCY)?;
            wtx.open_table(tables::OUTBOX)?;
            wtx.open_table(tables::WEBHOOK_LOGS)?;
            wtx.open_multimap_table(tables::WEBHOOK_LOGS_BY_MERCHANT)?;
            wtx.open_table(tables::TRANSACTIONS)?;
            wtx.open_multimap_table(tables::TRANSACTIONS_BY_USER)?;
            wtx.open_table(tables::TXN_IDEMPOTENCY)?;
        }
        wtx.commit()?;
        tracing::info!("store opened, tables ready");
        Ok(())
    }

    pub fn begin_read(&self) -> Result<ReadTransaction, StoreError> {
        Ok(self.db.begin_read()?)
    }

    pub fn begin_write(&self) -> Result<WriteTransaction, StoreError> {
        Ok(self.db.begin_write()?)
    }
}

/// Draw the next value from a named sequence.
pub fn next_id(wtx: &WriteTransaction, sequence: &str) -> Result<u64, StoreError> {
    let mut counters = wtx.open_table(tables::COUNTERS)?;
    let next = counters.get(sequence)?.map(|g| g.value()).unwrap_or(0) + 1;
    counters.insert(sequence, next)?;
    Ok(next)
}

/// Read a JSON document out of any readable table.
pub fn get_doc<'a, K, T>(
    table: &impl ReadableTable<K, &'static [u8]>,
    key: impl Borrow<K::SelfType<'a>>,
) -> Result<Option<T>, StoreError>
where
    K: redb::Key + 'static,
    T: DeserializeOwned,
{
    match table.get(key)? {
        Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
        None => Ok(None),
    }
}

/// Insert or replace a JSON document under a string reference.
pub fn put_doc<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

/// Insert or replace a JSON document under a numeric id.
pub fn put_doc_id<T: Serialize>(
    table: &mut Table<'_, u64, &'static [u8]>,
    key: u64,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value)?;
    table.insert(key, bytes.as_slice())?;
    Ok(())
}

/// Collect the string refs under a multimap key.
pub fn str_refs<'a, K>(
    table: &impl ReadableMultimapTable<K, &'static str>,
    key: impl Borrow<K::SelfType<'a>>,
) -> Result<Vec<String>, StoreError>
where
    K: redb::Key + 'static,
{
    let mut out = Vec::new();
    for guard in table.get(key)? {
        out.push(guard?.value().to_string());
    }
    Ok(out)
}

/// Collect the numeric ids under a multimap key.
pub fn id_refs<'a, K>(
    table: &impl ReadableMultimapTable<K, u64>,
    key: impl Borrow<K::SelfType<'a>>,
) -> Result<Vec<u64>, StoreError>
where
    K: redb::Key + 'static,
{
    let mut out = Vec::new();
    for guard in table.get(key)? {
        out.push(guard?.value());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::models::{Order, OrderStatus};
    use super::*;
    use chrono::Utc;

    fn sample_order(order_ref: &str) -> Order {
        Order {
            order_ref: order_ref.to_string(),
            merchant_id: 1,
            amount: 49_900,
            currency: "INR".to_string(),
            receipt: Some("rcpt-1".to_string()),
            notes: None,
            status: OrderStatus::Created,
            attempts: 0,
            auto_capture: true,
            expires_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn round_trips_documents() {
        let store = Store::in_memory().unwrap();
        let order = sample_order("pf_order_abc");

        let wtx = store.begin_write().unwrap();
        {
            let mut orders = wtx.open_table(tables::ORDERS).unwrap();
            put_doc(&mut orders, order.order_ref.as_str(), &order).unwrap();
        }
        wtx.commit().unwrap();

        let rtx = store.begin_read().unwrap();
        let orders = rtx.open_table(tables::ORDERS).unwrap();
        let loaded: Option<Order> = get_doc(&orders, "pf_order_abc").unwrap();
        let loaded = loaded.unwrap();
        assert_eq!(loaded.amount, 49_900);
        assert_eq!(loaded.status, OrderStatus::Created);

        let missing: Option<Order> = get_doc(&orders, "pf_order_nope").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn sequences_are_monotonic() {
        let store = Store::in_memory().unwrap();
        for expected in 1..=3u64 {
            let wtx = store.begin_write().unwrap();
            let id = next_id(&wtx, "outbox").unwrap();
            wtx.commit().unwrap();
            assert_eq!(id, expected);
        }
        // Independent sequences do not interfere.
        let wtx = store.begin_write().unwrap();
        assert_eq!(next_id(&wtx, "users").unwrap(), 1);
        wtx.commit().unwrap();
    }

    #[test]
    fn multimap_indexes_collect_refs() {
        let store = Store::in_memory().unwrap();
        let wtx = store.begin_write().unwrap();
        {
            let mut by_merchant = wtx
                .open_multimap_table(tables::ORDERS_BY_MERCHANT)
                .unwrap();
            by_merchant.insert(7, "pf_order_a").unwrap();
            by_merchant.insert(7, "pf_order_b").unwrap();
            by_merchant.insert(8, "pf_order_c").unwrap();
        }
        wtx.commit().unwrap();

        let rtx = store.begin_read().unwrap();
        let by_merchant = rtx
            .open_multimap_table(tables::ORDERS_BY_MERCHANT)
            .unwrap();
        let mut refs = str_refs(&by_merchant, 7).unwrap();
        refs.sort();
        assert_eq!(refs, vec!["pf_order_a", "pf_order_b"]);
        assert!(str_refs(&by_merchant, 9).unwrap().is_empty());
    }
}
