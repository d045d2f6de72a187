use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::datasource::{Stmt, TxDataSource};

use super::context::PrepareSnapshot;

/// Concurrent key-value store behind the session table
///
/// Every operation is atomic for its key only; nothing here holds a
/// store-wide lock across an await point.
pub trait KvStore<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    /// Insert only if the key is vacant; hands the value back otherwise
    fn insert_new(&self, key: K, value: V) -> Result<(), V>;

    /// Insert or replace, returning the previous value
    fn put(&self, key: K, value: V) -> Option<V>;

    fn remove(&self, key: &K) -> Option<V>;

    /// Point-in-time copy of all entries
    fn entries(&self) -> Vec<(K, V)>;

    fn len(&self) -> usize;

    fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sharded store used in production
pub struct DashStore<K, V> {
    map: DashMap<K, V>,
}

impl<K: Eq + Hash, V> DashStore<K, V> {
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }
}

impl<K: Eq + Hash, V> Default for DashStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KvStore<K, V> for DashStore<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn get(&self, key: &K) -> Option<V> {
        self.map.get(key).map(|r| r.value().clone())
    }

    fn insert_new(&self, key: K, value: V) -> Result<(), V> {
        match self.map.entry(key) {
            Entry::Occupied(_) => Err(value),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    fn put(&self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.map.remove(key).map(|(_, v)| v)
    }

    fn entries(&self) -> Vec<(K, V)> {
        self.map
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Single-mutex store; every operation is totally ordered
///
/// Useful in tests that need deterministic interleavings.
pub struct LockedStore<K, V> {
    map: Mutex<HashMap<K, V>>,
}

impl<K: Eq + Hash, V> LockedStore<K, V> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash, V> Default for LockedStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KvStore<K, V> for LockedStore<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        self.map.lock().get(key).cloned()
    }

    fn insert_new(&self, key: K, value: V) -> Result<(), V> {
        let mut map = self.map.lock();
        if map.contains_key(&key) {
            return Err(value);
        }
        map.insert(key, value);
        Ok(())
    }

    fn put(&self, key: K, value: V) -> Option<V> {
        self.map.lock().insert(key, value)
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.map.lock().remove(key)
    }

    fn entries(&self) -> Vec<(K, V)> {
        self.map
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.map.lock().len()
    }
}

/// Backend statement handle plus where it was prepared
pub struct PreparedStatement {
    stmt: Box<dyn Stmt>,
    origin: Option<u64>,
}

impl PreparedStatement {
    /// `origin` is the id of the transaction the statement was prepared in
    pub fn new(stmt: Box<dyn Stmt>, origin: Option<u64>) -> Self {
        Self { stmt, origin }
    }

    pub fn stmt(&self) -> &dyn Stmt {
        self.stmt.as_ref()
    }

    pub fn origin(&self) -> Option<u64> {
        self.origin
    }
}

/// A registered transaction pinned to one connection
pub struct PinnedTx {
    id: u64,
    source: Arc<TxDataSource>,
}

impl PinnedTx {
    pub fn new(source: TxDataSource) -> Self {
        static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);
        Self {
            id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
            source: Arc::new(source),
        }
    }

    /// Process-unique id of this transaction
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn source(&self) -> &Arc<TxDataSource> {
        &self.source
    }
}

/// Statement ids are scoped to their connection: (conn_id, stmt_id)
pub type StmtKey = (u32, u32);

pub type TxStore = dyn KvStore<u32, Arc<PinnedTx>>;
pub type StmtStore = dyn KvStore<StmtKey, Arc<PreparedStatement>>;
pub type SnapshotStore = dyn KvStore<StmtKey, Arc<PrepareSnapshot>>;

/// Connection and statement state shared by all connection flows
///
/// - connection id -> pinned transaction (present iff in a transaction)
/// - (connection id, statement id) -> backend statement
/// - (connection id, statement id) -> prepare snapshot
///
/// Statement entries are added and removed in pairs. Two connections may
/// hold the same statement id.
#[derive(Clone)]
pub struct SessionTable {
    transactions: Arc<TxStore>,
    statements: Arc<StmtStore>,
    snapshots: Arc<SnapshotStore>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::with_stores(
            Arc::new(DashStore::<u32, Arc<PinnedTx>>::new()),
            Arc::new(DashStore::<StmtKey, Arc<PreparedStatement>>::new()),
            Arc::new(DashStore::<StmtKey, Arc<PrepareSnapshot>>::new()),
        )
    }

    /// Table backed by mutex-guarded maps
    pub fn locked() -> Self {
        Self::with_stores(
            Arc::new(LockedStore::<u32, Arc<PinnedTx>>::new()),
            Arc::new(LockedStore::<StmtKey, Arc<PreparedStatement>>::new()),
            Arc::new(LockedStore::<StmtKey, Arc<PrepareSnapshot>>::new()),
        )
    }

    pub fn with_stores(
        transactions: Arc<TxStore>,
        statements: Arc<StmtStore>,
        snapshots: Arc<SnapshotStore>,
    ) -> Self {
        Self {
            transactions,
            statements,
            snapshots,
        }
    }

    pub fn transaction(&self, conn_id: u32) -> Option<Arc<PinnedTx>> {
        self.transactions.get(&conn_id)
    }

    pub fn in_transaction(&self, conn_id: u32) -> bool {
        self.transactions.contains(&conn_id)
    }

    /// Pin a transaction to a connection; fails if one is already pinned
    pub fn register_transaction(&self, conn_id: u32, tx: Arc<PinnedTx>) -> Result<(), Arc<PinnedTx>> {
        self.transactions.insert_new(conn_id, tx)
    }

    pub fn remove_transaction(&self, conn_id: u32) -> Option<Arc<PinnedTx>> {
        self.transactions.remove(&conn_id)
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn has_statement(&self, conn_id: u32, stmt_id: u32) -> bool {
        self.statements.contains(&(conn_id, stmt_id))
    }

    /// Statement handle and snapshot; `None` unless both are present
    pub fn statement(
        &self,
        conn_id: u32,
        stmt_id: u32,
    ) -> Option<(Arc<PreparedStatement>, Arc<PrepareSnapshot>)> {
        let key = (conn_id, stmt_id);
        let stmt = self.statements.get(&key)?;
        let snapshot = self.snapshots.get(&key)?;
        Some((stmt, snapshot))
    }

    /// Register a freshly prepared statement under its snapshot's connection
    ///
    /// Fails, handing the statement back, if the id is still live on that
    /// connection.
    pub fn register_statement(
        &self,
        stmt_id: u32,
        stmt: Arc<PreparedStatement>,
        snapshot: Arc<PrepareSnapshot>,
    ) -> Result<(), Arc<PreparedStatement>> {
        let key = (snapshot.conn_id(), stmt_id);
        self.statements.insert_new(key, stmt)?;
        self.snapshots.put(key, snapshot);
        Ok(())
    }

    /// Drop both entries of a statement, returning the handle if it was live
    pub fn remove_statement(&self, conn_id: u32, stmt_id: u32) -> Option<Arc<PreparedStatement>> {
        let key = (conn_id, stmt_id);
        let stmt = self.statements.remove(&key);
        self.snapshots.remove(&key);
        stmt
    }

    /// Ids of the statements prepared on a connection
    pub fn statements_of(&self, conn_id: u32) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .statements
            .entries()
            .into_iter()
            .filter(|((conn, _), _)| *conn == conn_id)
            .map(|((_, id), _)| id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
