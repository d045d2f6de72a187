//! Integration test entry point
//!
//! Run with: cargo test --test integration
//!
//! The session tests drive `SessionHandler` against the in-memory data
//! source below. The MySQL tests additionally need:
//! - the `mysql-backend` feature
//! - PROXY_SESSION_RUN_MYSQL_TESTS: Set to "1" to enable them
//! - PROXY_SESSION_TEST_MYSQL_HOST / _PORT / _USER / _PASS / _DB

#[cfg(feature = "mysql-backend")]
mod mysql;

use std::collections::HashSet;
use std::env;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use proxy_session::datasource::{
    DataSource, DataSourceError, ExecOutcome, Query, ResultSet, Stmt, StmtPreparer, Tx,
    TxOptions, Value,
};
use proxy_session::{QueryContext, SessionConfig, SessionHandler};

/// Check if the live MySQL tests should run
pub fn should_run_mysql_tests() -> bool {
    env::var("PROXY_SESSION_RUN_MYSQL_TESTS")
        .map(|v| v == "1")
        .unwrap_or(false)
}

/// Skip test if the live MySQL tests are not enabled
#[macro_export]
macro_rules! skip_if_not_enabled {
    () => {
        if !crate::should_run_mysql_tests() {
            eprintln!("Skipping MySQL test (set PROXY_SESSION_RUN_MYSQL_TESTS=1 to run)");
            return;
        }
    };
}

/// Install a test subscriber once; RUST_LOG controls the output
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One call seen by the fake backend
#[derive(Debug, Clone)]
pub struct Call {
    /// "default" or "tx#N"
    pub executor: String,
    pub op: &'static str,
    pub sql: String,
    pub args: Vec<Value>,
}

/// State shared by the fake source, its transactions and statements
#[derive(Default)]
pub struct FakeBackend {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<&'static str>>,
    paused: Mutex<HashSet<&'static str>>,
    entered: Notify,
    release: Notify,
    next_tx: AtomicU32,
    last_tx_opts: Mutex<Option<TxOptions>>,
}

impl FakeBackend {
    /// Make every later `op` fail with a backend error
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    pub fn heal(&self, op: &'static str) {
        self.failing.lock().remove(op);
    }

    /// Make later `op` calls wait for `resume`
    pub fn pause(&self, op: &'static str) {
        self.paused.lock().insert(op);
    }

    pub fn unpause(&self, op: &'static str) {
        self.paused.lock().remove(op);
    }

    /// Wait until a paused call has been entered
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    /// Let one paused call continue
    pub fn resume(&self) {
        self.release.notify_one();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Calls rendered as "executor:op"
    pub fn ops(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|c| format!("{}:{}", c.executor, c.op))
            .collect()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.op == op).count()
    }

    pub fn last_tx_opts(&self) -> Option<TxOptions> {
        self.last_tx_opts.lock().clone()
    }

    async fn enter(
        &self,
        executor: &str,
        op: &'static str,
        sql: &str,
        args: &[Value],
    ) -> Result<(), DataSourceError> {
        let paused = self.paused.lock().contains(op);
        if paused {
            self.entered.notify_one();
            self.release.notified().await;
        }

        self.calls.lock().push(Call {
            executor: executor.to_string(),
            op,
            sql: sql.to_string(),
            args: args.to_vec(),
        });

        if self.failing.lock().contains(op) {
            return Err(DataSourceError::backend(1105, format!("injected {} failure", op)));
        }
        Ok(())
    }
}

fn rows_from(executor: &str, args: &[Value]) -> ResultSet {
    let mut row = vec![Value::from(executor)];
    row.extend(args.iter().cloned());
    ResultSet::new(vec!["executor".into()], vec![row])
}

/// In-memory default data source
pub struct FakeSource {
    backend: Arc<FakeBackend>,
}

impl FakeSource {
    pub fn new() -> (Arc<Self>, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::default());
        (
            Arc::new(Self {
                backend: backend.clone(),
            }),
            backend,
        )
    }
}

async fn prepare_fake(
    backend: &Arc<FakeBackend>,
    executor: &str,
    query: &Query,
) -> Result<Box<dyn Stmt>, DataSourceError> {
    backend.enter(executor, "prepare", &query.sql, &[]).await?;
    Ok(Box::new(FakeStmt {
        backend: backend.clone(),
        executor: executor.to_string(),
        sql: query.sql.clone(),
    }))
}

#[async_trait]
impl StmtPreparer for FakeSource {
    async fn prepare(&self, _ctx: &QueryContext, query: &Query) -> Result<Box<dyn Stmt>, DataSourceError> {
        prepare_fake(&self.backend, "default", query).await
    }
}

#[async_trait]
impl DataSource for FakeSource {
    async fn query(&self, _ctx: &QueryContext, query: &Query) -> Result<ResultSet, DataSourceError> {
        self.backend
            .enter("default", "query", &query.sql, &query.args)
            .await?;
        Ok(rows_from("default", &query.args))
    }

    async fn exec(&self, _ctx: &QueryContext, query: &Query) -> Result<ExecOutcome, DataSourceError> {
        self.backend
            .enter("default", "exec", &query.sql, &query.args)
            .await?;
        Ok(ExecOutcome {
            affected_rows: 1,
            last_insert_id: 0,
        })
    }

    async fn begin_tx(&self, _ctx: &QueryContext, opts: &TxOptions) -> Result<Box<dyn Tx>, DataSourceError> {
        self.backend
            .enter("default", "begin", &opts.start_sql(), &[])
            .await?;
        *self.backend.last_tx_opts.lock() = Some(opts.clone());
        let n = self.backend.next_tx.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(FakeTx {
            backend: self.backend.clone(),
            label: format!("tx#{}", n),
        }))
    }
}

pub struct FakeTx {
    backend: Arc<FakeBackend>,
    label: String,
}

#[async_trait]
impl StmtPreparer for FakeTx {
    async fn prepare(&self, _ctx: &QueryContext, query: &Query) -> Result<Box<dyn Stmt>, DataSourceError> {
        prepare_fake(&self.backend, &self.label, query).await
    }
}

#[async_trait]
impl Tx for FakeTx {
    async fn query(&self, _ctx: &QueryContext, query: &Query) -> Result<ResultSet, DataSourceError> {
        self.backend
            .enter(&self.label, "query", &query.sql, &query.args)
            .await?;
        Ok(rows_from(&self.label, &query.args))
    }

    async fn exec(&self, _ctx: &QueryContext, query: &Query) -> Result<ExecOutcome, DataSourceError> {
        self.backend
            .enter(&self.label, "exec", &query.sql, &query.args)
            .await?;
        Ok(ExecOutcome {
            affected_rows: 1,
            last_insert_id: 0,
        })
    }

    async fn commit(&self) -> Result<(), DataSourceError> {
        self.backend.enter(&self.label, "commit", "", &[]).await
    }

    async fn rollback(&self) -> Result<(), DataSourceError> {
        self.backend.enter(&self.label, "rollback", "", &[]).await
    }
}

pub struct FakeStmt {
    backend: Arc<FakeBackend>,
    executor: String,
    sql: String,
}

#[async_trait]
impl Stmt for FakeStmt {
    async fn query(&self, _ctx: &QueryContext, args: &[Value]) -> Result<ResultSet, DataSourceError> {
        self.backend
            .enter(&self.executor, "stmt_query", &self.sql, args)
            .await?;
        Ok(rows_from(&self.executor, args))
    }

    async fn exec(&self, _ctx: &QueryContext, args: &[Value]) -> Result<ExecOutcome, DataSourceError> {
        self.backend
            .enter(&self.executor, "stmt_exec", &self.sql, args)
            .await?;
        Ok(ExecOutcome {
            affected_rows: 1,
            last_insert_id: 0,
        })
    }

    async fn close(&self) -> Result<(), DataSourceError> {
        self.backend.enter(&self.executor, "close", &self.sql, &[]).await
    }
}

/// Handler over a fresh fake backend
pub fn handler_with(config: SessionConfig) -> (Arc<SessionHandler>, Arc<FakeBackend>) {
    init_tracing();
    let (source, backend) = FakeSource::new();
    (Arc::new(SessionHandler::new(source, config)), backend)
}

pub fn handler() -> (Arc<SessionHandler>, Arc<FakeBackend>) {
    handler_with(SessionConfig::default())
}

/// Context for a text query on `conn_id`
pub fn query_ctx(conn_id: u32, sql: &str) -> QueryContext {
    QueryContext::new(conn_id).with_query(sql)
}

/// Context for a statement command on `conn_id`
pub fn stmt_ctx(conn_id: u32, stmt_id: u32) -> QueryContext {
    QueryContext::new(conn_id).with_stmt_id(stmt_id)
}
