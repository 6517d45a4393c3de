//! Common test utilities and helpers
//!
//! Shared test infrastructure for the integration tests.

use mapgres::config::{ConnectionConfig, SslMode};
use mapgres::db::Mapper;

/// Get test database connection config
pub fn test_connection_config() -> ConnectionConfig {
    ConnectionConfig {
        name: "integration-test".to_string(),
        host: std::env::var("TEST_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: std::env::var("TEST_DB_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5433),
        database: std::env::var("TEST_DB_NAME").unwrap_or_else(|_| "test_db".to_string()),
        username: std::env::var("TEST_DB_USER").unwrap_or_else(|_| "test_user".to_string()),
        password: Some(
            std::env::var("TEST_DB_PASSWORD").unwrap_or_else(|_| "test_password".to_string()),
        ),
        ssl_mode: SslMode::Disable,
    }
}

/// Build a mapper for `source` and probe the server, returning None (so the
/// caller can skip) when the test database is not reachable.
pub async fn mapper_or_skip(source: &str) -> Option<Mapper> {
    let config = test_connection_config();
    let mut mapper = Mapper::new(config.clone(), source);
    match mapper.execute("SELECT 1").await {
        Ok(_) => Some(mapper),
        Err(e) => {
            eprintln!(
                "Skipping test: Database not available at {}:{} - {}",
                config.host, config.port, e
            );
            None
        }
    }
}

/// Drop and recreate a two-column test table (`id INT PRIMARY KEY, name TEXT`)
pub async fn reset_table(mapper: &mut Mapper, table: &str) {
    mapper
        .execute(&format!("DROP TABLE IF EXISTS {}", table))
        .await
        .expect("drop table");
    mapper
        .execute(&format!(
            "CREATE TABLE {} (id INT PRIMARY KEY, name TEXT)",
            table
        ))
        .await
        .expect("create table");
}
