//! Integration tests against PostgreSQL and MySQL servers.
//!
//! Set `TEST_POSTGRES_URL` or `TEST_MYSQL_URL` to run them; otherwise each test
//! skips. Every test uses a unique service name so lock ids and tables don't
//! collide between runs.

use db_bootstrap::config::{InitConfig, PoolSpec};
use db_bootstrap::db::{
    DatabaseManager, InitConnection, LockCoordinator, PoolName, SchemaBootstrapper, SchemaDefinition,
};
use db_bootstrap::error::DbError;
use db_bootstrap::models::DbState;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;

fn server_url(var: &str) -> Option<String> {
    match std::env::var(var) {
        Ok(url) if !url.is_empty() => Some(url),
        _ => {
            eprintln!("Skipping: {var} not set");
            None
        }
    }
}

fn unique_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn schema(table: &str) -> SchemaDefinition {
    SchemaDefinition::new().table(
        table,
        format!("CREATE TABLE IF NOT EXISTS {table} (id INTEGER PRIMARY KEY, label VARCHAR(64))"),
    )
}

fn config(url: &str, service: &str) -> InitConfig {
    InitConfig {
        service_name: service.to_string(),
        backoff_base_ms: 50,
        waiter_poll_interval_ms: 50,
        waiter_timeout_ms: 10_000,
        ..InitConfig::new(url)
    }
}

async fn drop_table(url: &str, table: &str) {
    let mut conn = InitConnection::connect(url, &PoolSpec::init(), Duration::from_secs(5))
        .await
        .unwrap();
    let sql = format!("DROP TABLE IF EXISTS {table}");
    match &mut conn {
        InitConnection::Postgres(c) => {
            sqlx::query(&sql).execute(&mut *c).await.unwrap();
        }
        InitConnection::MySql(c) => {
            sqlx::query(&sql).execute(&mut *c).await.unwrap();
        }
        InitConnection::SQLite(c) => {
            sqlx::query(&sql).execute(&mut *c).await.unwrap();
        }
    }
    conn.close().await;
}

async fn instances_bootstrap_once(url: &str) {
    let suffix = unique_suffix();
    let table = format!("bootstrap_it_{suffix}");
    let service = format!("it_{suffix}");

    let managers: Vec<Arc<DatabaseManager>> = (0..4)
        .map(|_| Arc::new(DatabaseManager::new(config(url, &service), schema(&table)).unwrap()))
        .collect();

    let results = join_all(managers.iter().map(|m| {
        let m = Arc::clone(m);
        tokio::spawn(async move { m.initialize().await })
    }))
    .await;

    for result in results {
        assert!(result.unwrap());
    }
    let total: usize = managers.iter().map(|m| m.bootstrap_runs()).sum();
    assert_eq!(total, 1);

    for manager in &managers {
        assert_eq!(manager.state(), DbState::Ready);
        let mut conn = manager.get_connection(PoolName::App).await.unwrap();
        conn.ping().await.unwrap();
        drop(conn);
        manager.close().await;
    }
    drop_table(url, &table).await;
}

async fn session_lock_released_on_disconnect(url: &str) {
    let namespace = format!("db_init:it_{}", unique_suffix());
    let first = LockCoordinator::new(namespace.clone(), Duration::from_secs(300));
    let second = LockCoordinator::new(namespace, Duration::from_secs(300));

    let mut a = InitConnection::connect(url, &PoolSpec::init(), Duration::from_secs(5))
        .await
        .unwrap();
    let mut b = InitConnection::connect(url, &PoolSpec::init(), Duration::from_secs(5))
        .await
        .unwrap();

    assert!(first.try_become_initializer(&mut a).await.unwrap());
    assert!(!second.try_become_initializer(&mut b).await.unwrap());

    // Ending the session frees the lock without an explicit release.
    a.close().await;
    let mut won = false;
    for _ in 0..50 {
        if second.try_become_initializer(&mut b).await.unwrap() {
            won = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(won);
    second.release(&mut b).await.unwrap();
    b.close().await;
}

async fn unknown_database_is_fatal(url: &str) {
    let mut dsn = url::Url::parse(url).unwrap();
    dsn.set_path(&format!("/nonexistent_{}", unique_suffix()));
    let dsn = dsn.to_string();

    let err = InitConnection::connect(&dsn, &PoolSpec::init(), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::FatalConnection { .. }), "got {err:?}");

    let config = InitConfig {
        max_connect_attempts: 5,
        ..config(&dsn, &format!("it_{}", unique_suffix()))
    };
    let manager = DatabaseManager::new(config, schema("never_created")).unwrap();
    assert!(!manager.initialize().await);
    assert_eq!(manager.state(), DbState::Error);
    assert!(!manager.is_degraded());
    assert!(manager.last_backoff_delays().is_empty());
    assert!(manager.health_check().await.error.is_some());
}

// =========================================================================
// PostgreSQL
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_instances_bootstrap_once() {
    let Some(url) = server_url("TEST_POSTGRES_URL") else {
        return;
    };
    instances_bootstrap_once(&url).await;
}

#[tokio::test]
async fn test_postgres_advisory_lock_released_on_disconnect() {
    let Some(url) = server_url("TEST_POSTGRES_URL") else {
        return;
    };
    session_lock_released_on_disconnect(&url).await;
}

#[tokio::test]
async fn test_postgres_unknown_database_is_fatal() {
    let Some(url) = server_url("TEST_POSTGRES_URL") else {
        return;
    };
    unknown_database_is_fatal(&url).await;
}

#[tokio::test]
async fn test_postgres_mixed_case_table_bootstraps_once() {
    let Some(url) = server_url("TEST_POSTGRES_URL") else {
        return;
    };
    let suffix = unique_suffix();
    // Unquoted, so the server folds the name to lowercase.
    let table = format!("Orders_{suffix}");
    let service = format!("it_{suffix}");
    let schema = || {
        SchemaDefinition::new().table(
            &table,
            format!("CREATE TABLE IF NOT EXISTS {table} (id INTEGER PRIMARY KEY)"),
        )
    };

    let first = DatabaseManager::new(config(&url, &service), schema()).unwrap();
    assert!(first.initialize().await);
    assert_eq!(first.state(), DbState::Ready);
    assert_eq!(first.bootstrap_runs(), 1);
    first.close().await;

    // A restart finds the table and skips DDL.
    let second = DatabaseManager::new(config(&url, &service), schema()).unwrap();
    assert!(second.initialize().await);
    assert_eq!(second.state(), DbState::Ready);
    assert_eq!(second.bootstrap_runs(), 0);
    second.close().await;

    drop_table(&url, &table.to_lowercase()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_postgres_waiter_reconnects_after_session_killed() {
    let Some(url) = server_url("TEST_POSTGRES_URL") else {
        return;
    };
    let suffix = unique_suffix();
    let table = format!("waiter_it_{suffix}");
    let app_name = format!("waiter_{suffix}");

    let mut dsn = url::Url::parse(&url).unwrap();
    dsn.query_pairs_mut().append_pair("application_name", &app_name);
    let config = config(dsn.as_str(), &format!("it_{suffix}"));

    // Another instance holds the lock and has not bootstrapped yet.
    let mut holder = InitConnection::connect(&url, &PoolSpec::init(), Duration::from_secs(5))
        .await
        .unwrap();
    let foreign = LockCoordinator::new(config.lock_namespace(), Duration::from_secs(300));
    assert!(foreign.try_become_initializer(&mut holder).await.unwrap());

    let manager = DatabaseManager::new(config, schema(&table)).unwrap();
    let waiter = manager.initialize();

    let killer = async {
        let mut terminated = 0;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let InitConnection::Postgres(c) = &mut holder else {
                unreachable!("postgres url");
            };
            terminated = sqlx::query(
                "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE application_name = $1",
            )
            .bind(&app_name)
            .fetch_all(&mut *c)
            .await
            .unwrap()
            .len();
            if terminated > 0 {
                break;
            }
        }
        assert!(terminated > 0, "waiter session never showed up");

        // Give the waiter time to notice and reconnect before finishing.
        tokio::time::sleep(Duration::from_millis(300)).await;
        SchemaBootstrapper::new(schema(&table))
            .bootstrap(&mut holder)
            .await
            .unwrap();
        foreign.release(&mut holder).await.unwrap();
    };

    let (ok, ()) = tokio::join!(waiter, killer);
    assert!(ok);
    assert_eq!(manager.state(), DbState::Ready);
    assert_eq!(manager.bootstrap_runs(), 0);
    assert!(
        manager
            .history()
            .iter()
            .any(|p| p.message.starts_with("Contending for lock again")),
        "waiter should have contended again after reconnecting"
    );

    holder.close().await;
    manager.close().await;
    drop_table(&url, &table).await;
}

// =========================================================================
// MySQL
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mysql_instances_bootstrap_once() {
    let Some(url) = server_url("TEST_MYSQL_URL") else {
        return;
    };
    instances_bootstrap_once(&url).await;
}

#[tokio::test]
async fn test_mysql_named_lock_released_on_disconnect() {
    let Some(url) = server_url("TEST_MYSQL_URL") else {
        return;
    };
    session_lock_released_on_disconnect(&url).await;
}

#[tokio::test]
async fn test_mysql_unknown_database_is_fatal() {
    let Some(url) = server_url("TEST_MYSQL_URL") else {
        return;
    };
    unknown_database_is_fatal(&url).await;
}
