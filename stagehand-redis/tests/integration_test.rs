//! Integration tests for stagehand-redis
//!
//! Tests that talk to a server read `REDIS_URL` (default
//! `redis://localhost:6379`) and are ignored by default.

use stagehand_redis::*;
use std::time::Duration;

fn live_config() -> RedisConfig {
    RedisConfig::from_env()
        .connection_timeout(Duration::from_secs(2))
        .connection_name("stagehand-redis-tests")
        .build()
}

#[test]
fn test_builder_defaults() {
    let config = RedisConfig::builder().build();

    assert_eq!(config.url, "redis://localhost:6379");
    assert_eq!(config.connection_timeout, Duration::from_secs(5));
    assert_eq!(config.command_timeout, Duration::from_secs(30));
    assert!(!config.cluster);
    assert!(config.validate().is_ok());
}

#[tokio::test]
async fn test_unreachable_server_times_out_or_fails() {
    let config = RedisConfig::builder()
        .url("redis://127.0.0.1:1")
        .connection_timeout(Duration::from_millis(500))
        .build();

    let err = RedisConnection::connect("queue", config).await.unwrap_err();
    assert!(err.is_retryable() || matches!(err, RedisError::Redis(_)));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_commands_round_trip() {
    let conn = RedisConnection::connect("queue", live_config()).await.unwrap();
    let key = "stagehand-redis-tests:round-trip";

    let _: () = conn
        .query(redis::cmd("SET").arg(key).arg("ready"))
        .await
        .unwrap();
    let value: String = conn.query(redis::cmd("GET").arg(key)).await.unwrap();
    assert_eq!(value, "ready");

    let mut pipe = redis::pipe();
    pipe.cmd("DEL").arg(key).cmd("EXISTS").arg(key);
    let (deleted, exists): (u32, u32) = conn.query_pipeline(&pipe).await.unwrap();
    assert_eq!((deleted, exists), (1, 0));

    conn.close().await.unwrap();
    conn.close().await.unwrap();
    assert!(conn.is_closed());
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_closed_connection_rejects_commands() {
    let conn = RedisConnection::connect("worker", live_config()).await.unwrap();
    conn.close().await.unwrap();

    let err = conn.health_check().await.unwrap_err();
    assert!(err.is_connection_error());
}
