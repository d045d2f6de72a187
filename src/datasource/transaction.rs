use async_trait::async_trait;
use tracing::debug;

use crate::session::QueryContext;

use super::{
    DataSource, DataSourceError, ExecOutcome, Query, ResultSet, Stmt, StmtPreparer, Tx, TxOptions,
};

/// Exposes an open transaction through the `DataSource` interface
///
/// Once a connection is pinned, every read, write and prepare on it goes
/// through this adapter instead of the default source. Starting another
/// transaction from inside one is refused.
pub struct TxDataSource {
    tx: Box<dyn Tx>,
}

impl TxDataSource {
    pub fn new(tx: Box<dyn Tx>) -> Self {
        Self { tx }
    }

    pub async fn commit(&self) -> Result<(), DataSourceError> {
        self.tx.commit().await
    }

    pub async fn rollback(&self) -> Result<(), DataSourceError> {
        self.tx.rollback().await
    }
}

#[async_trait]
impl StmtPreparer for TxDataSource {
    async fn prepare(&self, ctx: &QueryContext, query: &Query) -> Result<Box<dyn Stmt>, DataSourceError> {
        self.tx.prepare(ctx, query).await
    }
}

#[async_trait]
impl DataSource for TxDataSource {
    async fn query(&self, ctx: &QueryContext, query: &Query) -> Result<ResultSet, DataSourceError> {
        self.tx.query(ctx, query).await
    }

    async fn exec(&self, ctx: &QueryContext, query: &Query) -> Result<ExecOutcome, DataSourceError> {
        self.tx.exec(ctx, query).await
    }

    async fn begin_tx(&self, ctx: &QueryContext, _opts: &TxOptions) -> Result<Box<dyn Tx>, DataSourceError> {
        debug!(conn_id = ctx.conn_id, "Refusing nested transaction");
        Err(DataSourceError::Unsupported(
            "cannot begin a transaction inside a transaction".into(),
        ))
    }
}
