mod context;
mod state;

pub use context::{PrepareSnapshot, QueryContext, RequestMeta};
pub use state::{
    DashStore, KvStore, LockedStore, PinnedTx, PreparedStatement, SessionTable, SnapshotStore,
    StmtKey, StmtStore, TxStore,
};

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::config::{NestedBeginPolicy, SessionConfig};
use crate::datasource::{
    DataSource, DataSourceError, Query, QueryOutput, TxDataSource, TxOptions, Value,
};
use crate::metrics::metrics;
use crate::parser::{begin_options, classify, CommandKind, SqlAnalyzer};

/// A decoded client command
///
/// Statement commands are keyed by `QueryContext::stmt_id`.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// COM_QUERY
    Query { sql: String },
    /// COM_STMT_PREPARE
    Prepare { sql: String },
    /// COM_STMT_EXECUTE
    Execute { params: Vec<Value> },
    /// COM_STMT_CLOSE
    Deallocate,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Query { .. } => "query",
            Command::Prepare { .. } => "prepare",
            Command::Execute { .. } => "execute",
            Command::Deallocate => "deallocate",
        }
    }
}

/// Session state reported back to the front end after a command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionResult {
    /// Whether the connection is inside a transaction after the command
    pub in_transaction: bool,
    /// Set on prepare, echoed on execute
    pub stmt_id: u32,
    /// Rows or affected counts for queries and executes
    pub output: Option<QueryOutput>,
}

/// What connection teardown released
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// A pinned transaction was rolled back successfully
    pub rolled_back: bool,
    /// Statements removed from the table
    pub closed_statements: usize,
    /// Backend failures met along the way
    pub errors: Vec<SessionError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Session errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    DataSource(#[from] DataSourceError),

    #[error("Unknown prepared statement handler ({0})")]
    UnknownStatement(u32),

    #[error("Prepared statement {0} already exists")]
    StatementExists(u32),

    #[error("Incorrect arguments to EXECUTE: expected {expected}, got {got}")]
    ParameterCount { expected: usize, got: usize },

    #[error("Connection {0} already has an active transaction")]
    TransactionActive(u32),

    #[error("Connection {0} is already running a command")]
    ConcurrentCommand(u32),

    #[error("Connection {0} was closed while the command ran")]
    ConnectionClosed(u32),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl SessionError {
    /// MySQL error code and SQLSTATE for the error packet
    pub fn mysql_code(&self) -> (u16, &'static str) {
        match self {
            SessionError::DataSource(DataSourceError::Backend { code, .. }) => (*code, "HY000"),
            SessionError::DataSource(DataSourceError::Cancelled) => (1317, "70100"),
            SessionError::DataSource(DataSourceError::DeadlineExceeded) => (3024, "HY000"),
            SessionError::UnknownStatement(_) => (1243, "HY000"),
            SessionError::ParameterCount { .. } => (1210, "HY000"),
            SessionError::TransactionActive(_) => (1105, "25000"),
            SessionError::Unsupported(_) => (1235, "42000"),
            _ => (1105, "HY000"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TxEnd {
    Commit,
    Rollback,
}

impl TxEnd {
    fn outcome(&self) -> &'static str {
        match self {
            TxEnd::Commit => "committed",
            TxEnd::Rollback => "rolled_back",
        }
    }
}

/// Marks a connection as busy until dropped
struct InFlight<'a> {
    set: &'a DashSet<u32>,
    conn_id: u32,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.conn_id);
    }
}

/// Per-connection transaction and prepared statement handling
///
/// One handler serves every connection of the proxy. Commands from
/// different connections run concurrently; commands of one connection
/// must not overlap (see `QueryContext`).
pub struct SessionHandler {
    /// Default data source, used outside transactions
    ds: Arc<dyn DataSource>,
    table: SessionTable,
    config: SessionConfig,
    analyzer: SqlAnalyzer,
    /// Connections with a command in progress
    in_flight: DashSet<u32>,
    /// Connections torn down while a command was in progress
    closing: DashSet<u32>,
    next_stmt_id: AtomicU32,
}

impl SessionHandler {
    pub fn new(ds: Arc<dyn DataSource>, config: SessionConfig) -> Self {
        Self::with_table(ds, config, SessionTable::new())
    }

    /// Create a handler over an existing session table
    pub fn with_table(ds: Arc<dyn DataSource>, config: SessionConfig, table: SessionTable) -> Self {
        Self {
            ds,
            table,
            config,
            analyzer: SqlAnalyzer::new(),
            in_flight: DashSet::new(),
            closing: DashSet::new(),
            next_stmt_id: AtomicU32::new(1),
        }
    }

    pub fn table(&self) -> &SessionTable {
        &self.table
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Mint a statement id; never returns 0
    pub fn next_stmt_id(&self) -> u32 {
        loop {
            let id = self.next_stmt_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    pub fn in_transaction(&self, conn_id: u32) -> bool {
        self.table.in_transaction(conn_id)
    }

    /// The pinned transaction if the connection has one, the default source otherwise
    pub fn select_executor(&self, conn_id: u32) -> Arc<dyn DataSource> {
        self.executor(conn_id).0
    }

    fn executor(&self, conn_id: u32) -> (Arc<dyn DataSource>, Option<u64>) {
        match self.table.transaction(conn_id) {
            Some(pinned) => {
                let source: Arc<dyn DataSource> = pinned.source().clone();
                (source, Some(pinned.id()))
            }
            None => (self.ds.clone(), None),
        }
    }

    /// Single entry point for the front end
    #[instrument(skip(self, ctx, cmd), fields(conn_id = ctx.conn_id, stmt_id = ctx.stmt_id, command = cmd.name()))]
    pub async fn dispatch(&self, ctx: &QueryContext, cmd: Command) -> Result<SessionResult, SessionError> {
        match cmd {
            Command::Query { sql } => self.query(&ctx.clone().with_query(sql)).await,
            Command::Prepare { sql } => self.prepare(&ctx.clone().with_query(sql)).await,
            Command::Execute { params } => self.execute(ctx, params).await,
            Command::Deallocate => self.deallocate(ctx).await,
        }
    }

    /// Run a text-protocol query, routing transaction control to the handlers below
    pub async fn query(&self, ctx: &QueryContext) -> Result<SessionResult, SessionError> {
        let kind = classify(&ctx.query);
        self.guarded(ctx, kind, async {
            match kind {
                CommandKind::BeginTransaction => {
                    self.handle_begin(ctx, begin_options(&ctx.query)).await
                }
                CommandKind::Commit => self.handle_end(ctx, TxEnd::Commit).await,
                CommandKind::Rollback => self.handle_end(ctx, TxEnd::Rollback).await,
                CommandKind::Prepare | CommandKind::Execute | CommandKind::Deallocate => {
                    Err(SessionError::Unsupported(format!(
                        "text protocol {} statement",
                        kind.as_str()
                    )))
                }
                CommandKind::PlainQuery => self.handle_plain(ctx).await,
            }
        })
        .await
    }

    pub async fn begin_transaction(
        &self,
        ctx: &QueryContext,
        opts: TxOptions,
    ) -> Result<SessionResult, SessionError> {
        self.guarded(ctx, CommandKind::BeginTransaction, self.handle_begin(ctx, opts))
            .await
    }

    /// Commit the pinned transaction; a no-op without one
    pub async fn commit(&self, ctx: &QueryContext) -> Result<SessionResult, SessionError> {
        self.guarded(ctx, CommandKind::Commit, self.handle_end(ctx, TxEnd::Commit))
            .await
    }

    /// Roll back the pinned transaction; a no-op without one
    pub async fn rollback(&self, ctx: &QueryContext) -> Result<SessionResult, SessionError> {
        self.guarded(ctx, CommandKind::Rollback, self.handle_end(ctx, TxEnd::Rollback))
            .await
    }

    /// Prepare `ctx.query` under `ctx.stmt_id`, or a minted id when that is 0
    pub async fn prepare(&self, ctx: &QueryContext) -> Result<SessionResult, SessionError> {
        self.guarded(ctx, CommandKind::Prepare, self.handle_prepare(ctx))
            .await
    }

    pub async fn execute(
        &self,
        ctx: &QueryContext,
        params: Vec<Value>,
    ) -> Result<SessionResult, SessionError> {
        self.guarded(ctx, CommandKind::Execute, self.handle_execute(ctx, params))
            .await
    }

    pub async fn deallocate(&self, ctx: &QueryContext) -> Result<SessionResult, SessionError> {
        self.guarded(ctx, CommandKind::Deallocate, self.handle_deallocate(ctx))
            .await
    }

    /// Release everything a closed connection left behind
    ///
    /// Statements are closed first, then the pinned transaction is rolled
    /// back. Entries are removed whatever the backend says.
    ///
    /// Meant to run once the connection's flow has stopped. With
    /// `enforce_single_flight`, commands arriving during teardown are
    /// rejected, and a command still in flight releases whatever it
    /// registered when it completes, failing with `ConnectionClosed`.
    pub async fn close_connection(&self, conn_id: u32) -> TeardownReport {
        let _flight = if self.config.enforce_single_flight {
            self.closing.insert(conn_id);
            if self.in_flight.insert(conn_id) {
                self.closing.remove(&conn_id);
                Some(InFlight {
                    set: &self.in_flight,
                    conn_id,
                })
            } else {
                warn!(conn_id, "Connection closed with a command in flight");
                None
            }
        } else {
            None
        };

        self.release(conn_id).await
    }

    async fn release(&self, conn_id: u32) -> TeardownReport {
        let mut report = TeardownReport::default();

        let statements: Vec<_> = self
            .table
            .statements_of(conn_id)
            .into_iter()
            .filter_map(|id| self.table.remove_statement(conn_id, id).map(|stmt| (id, stmt)))
            .collect();

        let closed = join_all(
            statements
                .iter()
                .map(|(id, stmt)| async move { (*id, stmt.stmt().close().await) }),
        )
        .await;

        for (stmt_id, result) in closed {
            metrics().record_statement_released();
            report.closed_statements += 1;
            if let Err(e) = result {
                warn!(conn_id, stmt_id, error = %e, "Failed to close statement on teardown");
                report.errors.push(e.into());
            }
        }

        if let Some(pinned) = self.table.remove_transaction(conn_id) {
            metrics().record_transaction_finished("abandoned");
            match pinned.source().rollback().await {
                Ok(()) => report.rolled_back = true,
                Err(e) => {
                    warn!(conn_id, tx_id = pinned.id(), error = %e, "Failed to roll back transaction on teardown");
                    report.errors.push(e.into());
                }
            }
        }

        debug!(
            conn_id,
            rolled_back = report.rolled_back,
            closed_statements = report.closed_statements,
            errors = report.errors.len(),
            "Connection state released"
        );
        report
    }

    async fn guarded<T, F>(&self, ctx: &QueryContext, kind: CommandKind, fut: F) -> Result<T, SessionError>
    where
        F: Future<Output = Result<T, SessionError>>,
    {
        metrics().record_command(kind.as_str());

        let result = match self.enter(ctx.conn_id) {
            Ok(flight) => {
                let result = fut.await;
                drop(flight);
                self.settle(ctx.conn_id, result).await
            }
            Err(e) => Err(e),
        };

        if let Err(ref e) = result {
            metrics().record_command_error(kind.as_str());
            debug!(conn_id = ctx.conn_id, command = kind.as_str(), error = %e, "Command failed");
        }
        result
    }

    /// Undo a finished command's registrations if its connection was torn down meanwhile
    async fn settle<T>(&self, conn_id: u32, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if self.closing.remove(&conn_id).is_none() {
            return result;
        }
        let report = self.release(conn_id).await;
        warn!(
            conn_id,
            closed_statements = report.closed_statements,
            rolled_back = report.rolled_back,
            "Released state registered after teardown"
        );
        Err(SessionError::ConnectionClosed(conn_id))
    }

    fn enter(&self, conn_id: u32) -> Result<Option<InFlight<'_>>, SessionError> {
        if !self.config.enforce_single_flight {
            return Ok(None);
        }
        if !self.in_flight.insert(conn_id) {
            warn!(conn_id, "Overlapping commands on one connection");
            return Err(SessionError::ConcurrentCommand(conn_id));
        }
        Ok(Some(InFlight {
            set: &self.in_flight,
            conn_id,
        }))
    }

    async fn handle_begin(&self, ctx: &QueryContext, opts: TxOptions) -> Result<SessionResult, SessionError> {
        let conn_id = ctx.conn_id;

        if let Some(existing) = self.table.transaction(conn_id) {
            let end = match self.config.nested_begin {
                NestedBeginPolicy::Reject => return Err(SessionError::TransactionActive(conn_id)),
                NestedBeginPolicy::CommitPrevious => TxEnd::Commit,
                NestedBeginPolicy::RollbackPrevious => TxEnd::Rollback,
            };
            debug!(conn_id, tx_id = existing.id(), end = ?end, "Ending open transaction before BEGIN");
            self.end_transaction(ctx, &existing, end).await?;
        }

        let opts = opts.with_kind(self.config.tx_kind);
        let tx = ctx.guard(self.ds.begin_tx(ctx, &opts)).await?;
        let pinned = Arc::new(PinnedTx::new(TxDataSource::new(tx)));

        if let Err(pinned) = self.table.register_transaction(conn_id, pinned) {
            if let Err(e) = pinned.source().rollback().await {
                warn!(conn_id, error = %e, "Failed to roll back unregistered transaction");
            }
            return Err(SessionError::TransactionActive(conn_id));
        }

        metrics().record_transaction_started();
        info!(conn_id, kind = ?opts.kind, read_only = opts.read_only, "Transaction started");

        Ok(SessionResult {
            in_transaction: true,
            ..Default::default()
        })
    }

    async fn handle_end(&self, ctx: &QueryContext, end: TxEnd) -> Result<SessionResult, SessionError> {
        match self.table.transaction(ctx.conn_id) {
            Some(pinned) => self.end_transaction(ctx, &pinned, end).await?,
            None => debug!(conn_id = ctx.conn_id, end = ?end, "No active transaction"),
        }
        Ok(SessionResult::default())
    }

    /// Commit or roll back
    ///
    /// A backend failure keeps the transaction pinned. A cancelled or
    /// expired end has an unknown outcome: the transaction is unpinned and
    /// a rollback is sent behind whatever the backend is still running.
    async fn end_transaction(&self, ctx: &QueryContext, pinned: &PinnedTx, end: TxEnd) -> Result<(), SessionError> {
        let source = pinned.source();
        let result = match end {
            TxEnd::Commit => ctx.guard(source.commit()).await,
            TxEnd::Rollback => ctx.guard(source.rollback()).await,
        };

        match result {
            Ok(()) => {}
            Err(e @ (DataSourceError::Cancelled | DataSourceError::DeadlineExceeded)) => {
                self.table.remove_transaction(ctx.conn_id);
                metrics().record_transaction_finished("abandoned");
                warn!(conn_id = ctx.conn_id, tx_id = pinned.id(), end = ?end, error = %e, "Transaction end interrupted, outcome unknown");

                let (source, conn_id, tx_id) = (source.clone(), ctx.conn_id, pinned.id());
                tokio::spawn(async move {
                    if let Err(e) = source.rollback().await {
                        debug!(conn_id, tx_id, error = %e, "Rollback after interrupted end failed");
                    }
                });
                return Err(e.into());
            }
            Err(e) => {
                warn!(conn_id = ctx.conn_id, tx_id = pinned.id(), end = ?end, error = %e, "Transaction end failed, keeping it registered");
                return Err(e.into());
            }
        }

        self.table.remove_transaction(ctx.conn_id);
        metrics().record_transaction_finished(end.outcome());
        info!(conn_id = ctx.conn_id, tx_id = pinned.id(), outcome = end.outcome(), "Transaction finished");
        Ok(())
    }

    async fn handle_plain(&self, ctx: &QueryContext) -> Result<SessionResult, SessionError> {
        let analysis = Arc::new(self.analyzer.analyze_or_fallback(&ctx.query));
        let executor = self.select_executor(ctx.conn_id);

        debug!(
            conn_id = ctx.conn_id,
            stmt_type = ?analysis.stmt_type,
            tables = ?analysis.tables,
            sql = %truncate_sql(&ctx.query, 100),
            "Running query"
        );

        let returns_rows = analysis.returns_rows;
        let query = Query::new(ctx.query.clone()).with_analysis(analysis);
        let output = if returns_rows {
            QueryOutput::Rows(ctx.guard(executor.query(ctx, &query)).await?)
        } else {
            QueryOutput::Affected(ctx.guard(executor.exec(ctx, &query)).await?)
        };

        Ok(SessionResult {
            in_transaction: self.table.in_transaction(ctx.conn_id),
            stmt_id: 0,
            output: Some(output),
        })
    }

    async fn handle_prepare(&self, ctx: &QueryContext) -> Result<SessionResult, SessionError> {
        let minted;
        let ctx = if ctx.stmt_id == 0 {
            minted = ctx.clone().with_stmt_id(self.next_stmt_id());
            &minted
        } else {
            ctx
        };
        let stmt_id = ctx.stmt_id;

        if self.table.has_statement(ctx.conn_id, stmt_id) {
            return Err(SessionError::StatementExists(stmt_id));
        }

        let snapshot = Arc::new(PrepareSnapshot::capture(ctx, &self.analyzer));
        let (executor, origin) = self.executor(ctx.conn_id);
        let query = Query::new(ctx.query.clone()).with_analysis(snapshot.analysis().clone());
        let stmt = ctx.guard(executor.prepare(ctx, &query)).await?;

        let prepared = Arc::new(PreparedStatement::new(stmt, origin));
        if let Err(prepared) = self.table.register_statement(stmt_id, prepared, snapshot.clone()) {
            if let Err(e) = prepared.stmt().close().await {
                warn!(conn_id = ctx.conn_id, stmt_id, error = %e, "Failed to close duplicate statement");
            }
            return Err(SessionError::StatementExists(stmt_id));
        }

        metrics().record_statement_prepared();
        debug!(
            conn_id = ctx.conn_id,
            stmt_id,
            params = snapshot.param_count(),
            in_tx = origin.is_some(),
            sql = %truncate_sql(snapshot.query(), 100),
            "Statement prepared"
        );

        Ok(SessionResult {
            in_transaction: origin.is_some(),
            stmt_id,
            output: None,
        })
    }

    async fn handle_execute(&self, ctx: &QueryContext, params: Vec<Value>) -> Result<SessionResult, SessionError> {
        let (prepared, snapshot) = self.owned_statement(ctx)?;

        if params.len() != snapshot.param_count() {
            return Err(SessionError::ParameterCount {
                expected: snapshot.param_count(),
                got: params.len(),
            });
        }

        let exec_ctx = snapshot.execution_context(ctx);
        let returns_rows = snapshot.analysis().returns_rows;
        let (executor, current) = self.executor(ctx.conn_id);

        // The backend handle belongs to the executor that prepared it. If the
        // connection has entered or left a transaction since, re-run the
        // captured query through the current executor instead.
        let output = if current == prepared.origin() {
            let stmt = prepared.stmt();
            if returns_rows {
                QueryOutput::Rows(ctx.guard(stmt.query(&exec_ctx, &params)).await?)
            } else {
                QueryOutput::Affected(ctx.guard(stmt.exec(&exec_ctx, &params)).await?)
            }
        } else {
            debug!(
                conn_id = ctx.conn_id,
                stmt_id = ctx.stmt_id,
                "Statement prepared under another executor, binding captured query"
            );
            let query = snapshot.bind(params);
            if returns_rows {
                QueryOutput::Rows(ctx.guard(executor.query(&exec_ctx, &query)).await?)
            } else {
                QueryOutput::Affected(ctx.guard(executor.exec(&exec_ctx, &query)).await?)
            }
        };

        Ok(SessionResult {
            in_transaction: current.is_some(),
            stmt_id: ctx.stmt_id,
            output: Some(output),
        })
    }

    async fn handle_deallocate(&self, ctx: &QueryContext) -> Result<SessionResult, SessionError> {
        let (prepared, _) = self.owned_statement(ctx)?;

        // Removed before closing: a statement that fails to close is gone too
        self.table.remove_statement(ctx.conn_id, ctx.stmt_id);
        metrics().record_statement_released();

        let closed = prepared.stmt().close().await;
        debug!(conn_id = ctx.conn_id, stmt_id = ctx.stmt_id, ok = closed.is_ok(), "Statement deallocated");
        closed?;

        Ok(SessionResult {
            in_transaction: self.table.in_transaction(ctx.conn_id),
            ..Default::default()
        })
    }

    /// Statement registered under `ctx.stmt_id` by this connection
    fn owned_statement(
        &self,
        ctx: &QueryContext,
    ) -> Result<(Arc<PreparedStatement>, Arc<PrepareSnapshot>), SessionError> {
        self.table
            .statement(ctx.conn_id, ctx.stmt_id)
            .ok_or(SessionError::UnknownStatement(ctx.stmt_id))
    }
}

/// Truncate SQL for logging (avoid huge log entries)
///
/// Cuts on a char boundary at or below `max_len` bytes.
fn truncate_sql(sql: &str, max_len: usize) -> std::borrow::Cow<'_, str> {
    if sql.len() <= max_len {
        return std::borrow::Cow::Borrowed(sql);
    }
    let mut end = max_len;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    std::borrow::Cow::Owned(format!("{}...", &sql[..end]))
}
