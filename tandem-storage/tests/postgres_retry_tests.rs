//! Connection retry behavior against an unreachable database.

use std::time::Duration;

use tandem_core::{Backend, RepoError};
use tandem_storage::{fetch_key_value, DbConfig, PostgresRepository, RetryConfig};

fn unreachable_repo(tries: u32) -> PostgresRepository {
    let config = DbConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        timeout: Duration::from_secs(2),
        ..DbConfig::default()
    };
    let retry = RetryConfig {
        tries,
        increase: 1,
        unit: Duration::from_millis(1),
    };
    PostgresRepository::new(config.create_pool().unwrap(), retry)
}

#[tokio::test]
async fn test_acquire_is_retried_until_tries_exhausted() {
    let repo = unreachable_repo(3);
    let err = fetch_key_value(&repo, "k").await.unwrap_err();
    match err {
        RepoError::Connect {
            backend, attempts, ..
        } => {
            assert_eq!(backend, Backend::Postgres);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected connect error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_single_try_does_not_retry() {
    let repo = unreachable_repo(1);
    let err = fetch_key_value(&repo, "k").await.unwrap_err();
    assert!(matches!(err, RepoError::Connect { attempts: 1, .. }));
    assert!(!err.is_not_found());
}

#[tokio::test]
async fn test_without_pool_fails_immediately() {
    let repo = PostgresRepository::without_pool();
    let started = std::time::Instant::now();
    let err = fetch_key_value(&repo, "k").await.unwrap_err();
    assert_eq!(err, RepoError::BadPool);
    assert!(started.elapsed() < Duration::from_millis(500));
}
