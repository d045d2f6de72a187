//! Backend executor contract consumed by the session layer
//!
//! A data source may be a single database or a router across physical
//! shards; the session layer only relies on the operations below.

#[cfg(feature = "mysql-backend")]
mod mysql;
mod transaction;

#[cfg(feature = "mysql-backend")]
pub use self::mysql::MySqlDataSource;
pub use transaction::TxDataSource;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::parser::QueryAnalysis;
use crate::session::QueryContext;

/// A single SQL value, either a bound parameter or a result cell
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    Text(String),
    Bytes(Bytes),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// A query handed to a data source
#[derive(Debug, Clone)]
pub struct Query {
    /// SQL text as the client sent it (markers unescaped)
    pub sql: String,
    /// Positional parameter values
    pub args: Vec<Value>,
    /// Routing-relevant analysis, if the caller has one
    pub analysis: Option<Arc<QueryAnalysis>>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
            analysis: None,
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_analysis(mut self, analysis: Arc<QueryAnalysis>) -> Self {
        self.analysis = Some(analysis);
        self
    }
}

/// Rows returned by a read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Outcome of a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub affected_rows: u64,
    pub last_insert_id: u64,
}

/// Output of a statement, whichever way it ran
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Rows(ResultSet),
    Affected(ExecOutcome),
}

impl QueryOutput {
    pub fn rows(&self) -> Option<&ResultSet> {
        match self {
            QueryOutput::Rows(rs) => Some(rs),
            QueryOutput::Affected(_) => None,
        }
    }

    pub fn affected(&self) -> Option<ExecOutcome> {
        match self {
            QueryOutput::Rows(_) => None,
            QueryOutput::Affected(outcome) => Some(*outcome),
        }
    }
}

/// How a sharded source opens its transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxKind {
    /// One backend transaction, opened at BEGIN
    #[default]
    Single,
    /// Per-shard transactions opened lazily on first use
    Delay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options passed to `DataSource::begin_tx`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub kind: TxKind,
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
    pub consistent_snapshot: bool,
}

impl TxOptions {
    pub fn with_kind(mut self, kind: TxKind) -> Self {
        self.kind = kind;
        self
    }

    /// `START TRANSACTION` text carrying these options
    pub fn start_sql(&self) -> String {
        let mut modes = Vec::new();
        if self.consistent_snapshot {
            modes.push("WITH CONSISTENT SNAPSHOT");
        }
        if self.read_only {
            modes.push("READ ONLY");
        }
        if modes.is_empty() {
            "START TRANSACTION".to_string()
        } else {
            format!("START TRANSACTION {}", modes.join(", "))
        }
    }
}

/// Data source errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataSourceError {
    #[error("Backend error {code}: {message}")]
    Backend { code: u16, message: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Handle already closed")]
    Closed,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DataSourceError {
    pub fn backend(code: u16, message: impl Into<String>) -> Self {
        DataSourceError::Backend {
            code,
            message: message.into(),
        }
    }
}

/// A backend-prepared statement
#[async_trait]
pub trait Stmt: Send + Sync {
    async fn query(&self, ctx: &QueryContext, args: &[Value]) -> Result<ResultSet, DataSourceError>;

    async fn exec(&self, ctx: &QueryContext, args: &[Value]) -> Result<ExecOutcome, DataSourceError>;

    /// Release the backend statement. Later calls fail with `Closed`.
    async fn close(&self) -> Result<(), DataSourceError>;
}

/// Anything that can prepare statements
#[async_trait]
pub trait StmtPreparer: Send + Sync {
    async fn prepare(&self, ctx: &QueryContext, query: &Query) -> Result<Box<dyn Stmt>, DataSourceError>;
}

/// An open backend transaction
///
/// `commit` and `rollback` take `&self` so a failed attempt leaves the
/// handle usable for a retry or an explicit rollback.
#[async_trait]
pub trait Tx: StmtPreparer {
    async fn query(&self, ctx: &QueryContext, query: &Query) -> Result<ResultSet, DataSourceError>;

    async fn exec(&self, ctx: &QueryContext, query: &Query) -> Result<ExecOutcome, DataSourceError>;

    async fn commit(&self) -> Result<(), DataSourceError>;

    async fn rollback(&self) -> Result<(), DataSourceError>;
}

/// A backend executor: direct, or a transaction wrapped by `TxDataSource`
#[async_trait]
pub trait DataSource: StmtPreparer {
    async fn query(&self, ctx: &QueryContext, query: &Query) -> Result<ResultSet, DataSourceError>;

    async fn exec(&self, ctx: &QueryContext, query: &Query) -> Result<ExecOutcome, DataSourceError>;

    async fn begin_tx(&self, ctx: &QueryContext, opts: &TxOptions) -> Result<Box<dyn Tx>, DataSourceError>;
}
