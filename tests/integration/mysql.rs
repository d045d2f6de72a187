//! Session handler against a live MySQL server

use std::env;
use std::sync::Arc;

use proxy_session::config::BackendConfig;
use proxy_session::datasource::{MySqlDataSource, Value};
use proxy_session::{QueryContext, SessionConfig, SessionHandler};

use crate::{init_tracing, skip_if_not_enabled};

const TABLE: &str = "it_session_orders";

fn backend_config() -> BackendConfig {
    BackendConfig {
        host: env::var("PROXY_SESSION_TEST_MYSQL_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
        port: env::var("PROXY_SESSION_TEST_MYSQL_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3306),
        user: env::var("PROXY_SESSION_TEST_MYSQL_USER").unwrap_or_else(|_| "root".to_string()),
        password: env::var("PROXY_SESSION_TEST_MYSQL_PASS").unwrap_or_default(),
        database: Some(env::var("PROXY_SESSION_TEST_MYSQL_DB").unwrap_or_else(|_| "test".to_string())),
    }
}

fn handler() -> SessionHandler {
    init_tracing();
    let source = MySqlDataSource::new(&backend_config()).expect("Failed to create MySQL pool");
    SessionHandler::new(Arc::new(source), SessionConfig::default())
}

async fn run(handler: &SessionHandler, conn_id: u32, sql: &str) {
    handler
        .query(&QueryContext::new(conn_id).with_query(sql))
        .await
        .unwrap_or_else(|e| panic!("{} failed: {}", sql, e));
}

async fn count_rows(handler: &SessionHandler, conn_id: u32, user: &str) -> usize {
    let sql = format!("SELECT id FROM {} WHERE user_id = '{}'", TABLE, user);
    let result = handler
        .query(&QueryContext::new(conn_id).with_query(sql))
        .await
        .expect("SELECT should succeed");
    result.output.and_then(|o| o.rows().map(|r| r.rows.len())).unwrap_or(0)
}

async fn setup(handler: &SessionHandler) {
    run(
        handler,
        900,
        &format!(
            "CREATE TABLE IF NOT EXISTS {} (id BIGINT AUTO_INCREMENT PRIMARY KEY, user_id VARCHAR(64), amount BIGINT)",
            TABLE
        ),
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mysql_rollback_discards_writes() {
    skip_if_not_enabled!();

    let handler = handler();
    setup(&handler).await;
    run(&handler, 1, &format!("DELETE FROM {} WHERE user_id = 'rb'", TABLE)).await;

    run(&handler, 1, "BEGIN").await;
    run(&handler, 1, &format!("INSERT INTO {} (user_id, amount) VALUES ('rb', 100)", TABLE)).await;
    assert_eq!(count_rows(&handler, 1, "rb").await, 1);
    // not visible outside the transaction
    assert_eq!(count_rows(&handler, 2, "rb").await, 0);

    run(&handler, 1, "ROLLBACK").await;
    assert_eq!(count_rows(&handler, 1, "rb").await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mysql_prepared_statement_in_transaction() {
    skip_if_not_enabled!();

    let handler = handler();
    setup(&handler).await;
    run(&handler, 3, &format!("DELETE FROM {} WHERE user_id = 'ps'", TABLE)).await;

    run(&handler, 3, "BEGIN").await;
    let prepared = handler
        .prepare(
            &QueryContext::new(3)
                .with_query(format!("INSERT INTO {} (user_id, amount) VALUES (?, ?)", TABLE)),
        )
        .await
        .expect("PREPARE should succeed");

    let ctx = QueryContext::new(3).with_stmt_id(prepared.stmt_id);
    let result = handler
        .execute(&ctx, vec![Value::from("ps"), Value::from(7)])
        .await
        .expect("EXECUTE should succeed");
    assert_eq!(result.output.and_then(|o| o.affected()).map(|o| o.affected_rows), Some(1));

    run(&handler, 3, "COMMIT").await;
    assert_eq!(count_rows(&handler, 4, "ps").await, 1);

    handler.deallocate(&ctx).await.expect("DEALLOCATE should succeed");
    run(&handler, 3, &format!("DELETE FROM {} WHERE user_id = 'ps'", TABLE)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mysql_teardown_rolls_back() {
    skip_if_not_enabled!();

    let handler = handler();
    setup(&handler).await;
    run(&handler, 5, &format!("DELETE FROM {} WHERE user_id = 'td'", TABLE)).await;

    run(&handler, 5, "BEGIN").await;
    run(&handler, 5, &format!("INSERT INTO {} (user_id, amount) VALUES ('td', 1)", TABLE)).await;

    let report = handler.close_connection(5).await;
    assert!(report.rolled_back);
    assert!(report.is_clean());
    assert_eq!(count_rows(&handler, 6, "td").await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mysql_backend_error_code() {
    skip_if_not_enabled!();

    let handler = handler();
    let err = handler
        .query(&QueryContext::new(7).with_query("SELECT * FROM it_session_missing_table"))
        .await
        .unwrap_err();
    // ER_NO_SUCH_TABLE
    assert_eq!(err.mysql_code().0, 1146);
}
