//! `DataSource` over a single MySQL server
//!
//! The `mysql` driver is blocking, so every call runs on the tokio blocking
//! pool. Transactions and prepared statements each hold a dedicated
//! connection for their lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use mysql::prelude::Queryable;
use mysql::{OptsBuilder, Params, Pool, PooledConn, Row};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::BackendConfig;
use crate::session::QueryContext;

use super::{
    DataSource, DataSourceError, ExecOutcome, Query, ResultSet, Stmt, StmtPreparer, Tx, TxKind,
    TxOptions, Value,
};

type SharedConn = Arc<Mutex<PooledConn>>;

/// Run a driver call on the blocking pool with exclusive use of `conn`
async fn blocking<F, T>(conn: SharedConn, f: F) -> Result<T, DataSourceError>
where
    F: FnOnce(&mut PooledConn) -> Result<T, mysql::Error> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = conn.lock();
        f(&mut *conn)
    })
    .await
    .map_err(|e| DataSourceError::Internal(format!("blocking task failed: {}", e)))?
    .map_err(backend_error)
}

fn backend_error(err: mysql::Error) -> DataSourceError {
    match err {
        mysql::Error::MySqlError(e) => DataSourceError::backend(e.code, e.message),
        other => DataSourceError::Internal(other.to_string()),
    }
}

fn to_params(args: &[Value]) -> Params {
    if args.is_empty() {
        Params::Empty
    } else {
        Params::Positional(args.iter().map(to_mysql).collect())
    }
}

fn to_mysql(value: &Value) -> mysql::Value {
    match value {
        Value::Null => mysql::Value::NULL,
        Value::Int(v) => mysql::Value::Int(*v),
        Value::UInt(v) => mysql::Value::UInt(*v),
        Value::Double(v) => mysql::Value::Double(*v),
        Value::Text(v) => mysql::Value::Bytes(v.as_bytes().to_vec()),
        Value::Bytes(v) => mysql::Value::Bytes(v.to_vec()),
    }
}

fn from_mysql(value: &mysql::Value) -> Value {
    match value {
        mysql::Value::NULL => Value::Null,
        mysql::Value::Int(v) => Value::Int(*v),
        mysql::Value::UInt(v) => Value::UInt(*v),
        mysql::Value::Float(v) => Value::Double(*v as f64),
        mysql::Value::Double(v) => Value::Double(*v),
        mysql::Value::Bytes(b) => match std::str::from_utf8(b) {
            Ok(s) => Value::Text(s.to_string()),
            Err(_) => Value::Bytes(bytes::Bytes::copy_from_slice(b)),
        },
        // Temporal values come back as their SQL literal
        other => Value::Text(other.as_sql(true).trim_matches('\'').to_string()),
    }
}

fn to_result_set(rows: Vec<Row>) -> ResultSet {
    let columns = rows
        .first()
        .map(|row| {
            row.columns_ref()
                .iter()
                .map(|c| c.name_str().into_owned())
                .collect()
        })
        .unwrap_or_default();

    let rows = rows
        .iter()
        .map(|row| {
            (0..row.len())
                .map(|i| row.as_ref(i).map(from_mysql).unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    ResultSet::new(columns, rows)
}

fn run_query(conn: &mut PooledConn, sql: &str, args: &[Value]) -> Result<ResultSet, mysql::Error> {
    let rows: Vec<Row> = if args.is_empty() {
        conn.query(sql)?
    } else {
        conn.exec(sql, to_params(args))?
    };
    Ok(to_result_set(rows))
}

fn run_exec(conn: &mut PooledConn, sql: &str, args: &[Value]) -> Result<ExecOutcome, mysql::Error> {
    if args.is_empty() {
        conn.query_drop(sql)?;
    } else {
        conn.exec_drop(sql, to_params(args))?;
    }
    Ok(ExecOutcome {
        affected_rows: conn.affected_rows(),
        last_insert_id: conn.last_insert_id(),
    })
}

/// Direct executor backed by a connection pool
pub struct MySqlDataSource {
    pool: Pool,
}

impl MySqlDataSource {
    /// Build the pool; blocks while the initial connections are opened
    pub fn new(config: &BackendConfig) -> Result<Self, DataSourceError> {
        let opts = OptsBuilder::new()
            .ip_or_hostname(Some(config.host.clone()))
            .tcp_port(config.port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .db_name(config.database.clone());
        let pool = Pool::new(opts).map_err(backend_error)?;
        Ok(Self { pool })
    }

    async fn checkout(&self) -> Result<SharedConn, DataSourceError> {
        let pool = self.pool.clone();
        let conn = tokio::task::spawn_blocking(move || pool.get_conn())
            .await
            .map_err(|e| DataSourceError::Internal(format!("blocking task failed: {}", e)))?
            .map_err(backend_error)?;
        Ok(Arc::new(Mutex::new(conn)))
    }
}

#[async_trait]
impl StmtPreparer for MySqlDataSource {
    async fn prepare(&self, ctx: &QueryContext, query: &Query) -> Result<Box<dyn Stmt>, DataSourceError> {
        let conn = ctx.guard(self.checkout()).await?;
        prepare_on(ctx, conn, query).await
    }
}

#[async_trait]
impl DataSource for MySqlDataSource {
    async fn query(&self, ctx: &QueryContext, query: &Query) -> Result<ResultSet, DataSourceError> {
        let conn = ctx.guard(self.checkout()).await?;
        let (sql, args) = (query.sql.clone(), query.args.clone());
        ctx.guard(blocking(conn, move |c| run_query(c, &sql, &args)))
            .await
    }

    async fn exec(&self, ctx: &QueryContext, query: &Query) -> Result<ExecOutcome, DataSourceError> {
        let conn = ctx.guard(self.checkout()).await?;
        let (sql, args) = (query.sql.clone(), query.args.clone());
        ctx.guard(blocking(conn, move |c| run_exec(c, &sql, &args)))
            .await
    }

    async fn begin_tx(&self, ctx: &QueryContext, opts: &TxOptions) -> Result<Box<dyn Tx>, DataSourceError> {
        if opts.kind == TxKind::Delay {
            debug!(conn_id = ctx.conn_id, "Single backend, delayed transaction starts eagerly");
        }

        let conn = ctx.guard(self.checkout()).await?;
        let isolation = opts
            .isolation
            .map(|level| format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()));
        let start = opts.start_sql();

        ctx.guard(blocking(conn.clone(), move |c| {
            if let Some(sql) = isolation {
                c.query_drop(sql)?;
            }
            c.query_drop(start)
        }))
        .await?;

        Ok(Box::new(MySqlTx {
            conn,
            finished: Arc::new(AtomicBool::new(false)),
        }))
    }
}

async fn prepare_on(ctx: &QueryContext, conn: SharedConn, query: &Query) -> Result<Box<dyn Stmt>, DataSourceError> {
    let sql = query.sql.clone();
    let stmt = ctx.guard(blocking(conn.clone(), move |c| c.prep(sql))).await?;
    Ok(Box::new(MySqlStmt {
        conn,
        stmt,
        closed: AtomicBool::new(false),
    }))
}

/// Transaction on a dedicated connection
pub struct MySqlTx {
    conn: SharedConn,
    /// Set by the blocking task itself, so a COMMIT that outlives its
    /// caller still marks the transaction finished
    finished: Arc<AtomicBool>,
}

impl MySqlTx {
    fn live(&self) -> Result<SharedConn, DataSourceError> {
        if self.finished.load(Ordering::Acquire) {
            return Err(DataSourceError::Closed);
        }
        Ok(self.conn.clone())
    }

    async fn finish(&self, sql: &'static str) -> Result<(), DataSourceError> {
        let conn = self.live()?;
        let finished = self.finished.clone();
        let ended = blocking(conn, move |c| {
            // Checked again under the connection lock: an abandoned end may have run first
            if finished.load(Ordering::Acquire) {
                return Ok(false);
            }
            c.query_drop(sql)?;
            finished.store(true, Ordering::Release);
            Ok(true)
        })
        .await?;

        if !ended {
            return Err(DataSourceError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl StmtPreparer for MySqlTx {
    async fn prepare(&self, ctx: &QueryContext, query: &Query) -> Result<Box<dyn Stmt>, DataSourceError> {
        prepare_on(ctx, self.live()?, query).await
    }
}

#[async_trait]
impl Tx for MySqlTx {
    async fn query(&self, ctx: &QueryContext, query: &Query) -> Result<ResultSet, DataSourceError> {
        let (sql, args) = (query.sql.clone(), query.args.clone());
        ctx.guard(blocking(self.live()?, move |c| run_query(c, &sql, &args)))
            .await
    }

    async fn exec(&self, ctx: &QueryContext, query: &Query) -> Result<ExecOutcome, DataSourceError> {
        let (sql, args) = (query.sql.clone(), query.args.clone());
        ctx.guard(blocking(self.live()?, move |c| run_exec(c, &sql, &args)))
            .await
    }

    async fn commit(&self) -> Result<(), DataSourceError> {
        self.finish("COMMIT").await
    }

    async fn rollback(&self) -> Result<(), DataSourceError> {
        self.finish("ROLLBACK").await
    }
}

/// Server-side prepared statement and the connection it lives on
pub struct MySqlStmt {
    conn: SharedConn,
    stmt: mysql::Statement,
    closed: AtomicBool,
}

impl MySqlStmt {
    fn live(&self) -> Result<(SharedConn, mysql::Statement), DataSourceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DataSourceError::Closed);
        }
        Ok((self.conn.clone(), self.stmt.clone()))
    }
}

#[async_trait]
impl Stmt for MySqlStmt {
    async fn query(&self, ctx: &QueryContext, args: &[Value]) -> Result<ResultSet, DataSourceError> {
        let (conn, stmt) = self.live()?;
        let params = to_params(args);
        ctx.guard(blocking(conn, move |c| {
            let rows: Vec<Row> = c.exec(&stmt, params)?;
            Ok(to_result_set(rows))
        }))
        .await
    }

    async fn exec(&self, ctx: &QueryContext, args: &[Value]) -> Result<ExecOutcome, DataSourceError> {
        let (conn, stmt) = self.live()?;
        let params = to_params(args);
        ctx.guard(blocking(conn, move |c| {
            c.exec_drop(&stmt, params)?;
            Ok(ExecOutcome {
                affected_rows: c.affected_rows(),
                last_insert_id: c.last_insert_id(),
            })
        }))
        .await
    }

    async fn close(&self) -> Result<(), DataSourceError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(DataSourceError::Closed);
        }
        let stmt = self.stmt.clone();
        let result = blocking(self.conn.clone(), move |c| c.close(stmt)).await;
        if let Err(ref e) = result {
            warn!(error = %e, "Failed to close backend statement");
        }
        result
    }
}
