//! Session layer of a MySQL protocol proxy
//!
//! Sits between the wire front end and the backend data sources. For every
//! client connection it tracks the pinned transaction and the prepared
//! statements, and routes each command to the right executor.

pub mod config;
pub mod datasource;
pub mod metrics;
pub mod parser;
pub mod session;

pub use config::{load_config, Config, ConfigError, NestedBeginPolicy, SessionConfig};
pub use datasource::{DataSource, DataSourceError, Query, QueryOutput, TxOptions, Value};
pub use session::{
    Command, QueryContext, SessionError, SessionHandler, SessionResult, SessionTable,
    TeardownReport,
};
