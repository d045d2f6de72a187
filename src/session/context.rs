use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::datasource::{DataSourceError, Query, Value};
use crate::parser::{escape_placeholders, placeholder_positions, QueryAnalysis, SqlAnalyzer};

/// Request metadata that travels with a connection's commands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub user: Option<String>,
    pub database: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

/// Per-command context supplied by the front end
///
/// Carries the connection and statement identifiers, the raw query text,
/// request metadata, and the cancellation token / deadline every backend
/// call is raced against.
///
/// A connection issues one command at a time and awaits its result before
/// sending the next. The session handler relies on that and only detects
/// violations; it does not serialise commands of one connection.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub conn_id: u32,
    pub stmt_id: u32,
    pub query: String,
    pub meta: RequestMeta,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl QueryContext {
    pub fn new(conn_id: u32) -> Self {
        Self {
            conn_id,
            stmt_id: 0,
            query: String::new(),
            meta: RequestMeta::default(),
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_stmt_id(mut self, stmt_id: u32) -> Self {
        self.stmt_id = stmt_id;
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_meta(mut self, meta: RequestMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.meta.user = Some(user.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.meta.database = Some(database.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Race a backend call against cancellation and the deadline
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, DataSourceError>
    where
        F: Future<Output = Result<T, DataSourceError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(DataSourceError::Cancelled);
        }
        if matches!(self.deadline, Some(d) if d <= Instant::now()) {
            return Err(DataSourceError::DeadlineExceeded);
        }

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DataSourceError::Cancelled),
            _ = expired => Err(DataSourceError::DeadlineExceeded),
            res = fut => res,
        }
    }
}

/// Prepare-time capture of a statement
///
/// Built once when PREPARE succeeds and never mutated. EXECUTE reads the
/// query shape and routing fields from here, not from the live context.
#[derive(Debug)]
pub struct PrepareSnapshot {
    conn_id: u32,
    stmt_id: u32,
    meta: RequestMeta,
    query: String,
    escaped_query: String,
    param_count: usize,
    analysis: Arc<QueryAnalysis>,
}

impl PrepareSnapshot {
    pub fn capture(ctx: &QueryContext, analyzer: &SqlAnalyzer) -> Self {
        let escaped_query = escape_placeholders(&ctx.query);
        let analysis = Arc::new(analyzer.analyze_or_fallback(&escaped_query));
        Self {
            conn_id: ctx.conn_id,
            stmt_id: ctx.stmt_id,
            meta: ctx.meta.clone(),
            param_count: placeholder_positions(&ctx.query).len(),
            query: ctx.query.clone(),
            escaped_query,
            analysis,
        }
    }

    pub fn conn_id(&self) -> u32 {
        self.conn_id
    }

    pub fn stmt_id(&self) -> u32 {
        self.stmt_id
    }

    pub fn meta(&self) -> &RequestMeta {
        &self.meta
    }

    /// Query text as prepared
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Query text with every bare `?` quoted as `'?'`
    pub fn escaped_query(&self) -> &str {
        &self.escaped_query
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    pub fn analysis(&self) -> &Arc<QueryAnalysis> {
        &self.analysis
    }

    /// Context for executing this statement
    ///
    /// Identifiers, metadata and query text come from the snapshot;
    /// cancellation and deadline come from the live call.
    pub fn execution_context(&self, live: &QueryContext) -> QueryContext {
        QueryContext {
            conn_id: self.conn_id,
            stmt_id: self.stmt_id,
            query: self.query.clone(),
            meta: self.meta.clone(),
            cancel: live.cancel.clone(),
            deadline: live.deadline,
        }
    }

    /// Query to run with the given live parameters
    pub fn bind(&self, args: Vec<Value>) -> Query {
        Query::new(self.query.clone())
            .with_args(args)
            .with_analysis(self.analysis.clone())
    }
}
