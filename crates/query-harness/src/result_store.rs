//! Result Store: a key/value cache with TTL. Holds terminal `QueryResult`s
//! under `query_search_result:{job_id}` / `recommendation_result:{job_id}`.
//! Values are opaque JSON bytes; a miss is distinct from an error.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

pub fn query_result_key(job_id: uuid::Uuid) -> String {
    format!("query_search_result:{job_id}")
}

pub fn recommendation_result_key(job_id: uuid::Uuid) -> String {
    format!("recommendation_result:{job_id}")
}

// --- Redis implementation --------------------------------------------------

pub struct RedisResultStore {
    conn: ConnectionManager,
}

impl RedisResultStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .with_context(|| format!("invalid redis url: {redis_url}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl ResultStore for RedisResultStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs())
            .await
            .with_context(|| format!("failed to write result store key {key}"))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn
            .get(key)
            .await
            .with_context(|| format!("failed to read result store key {key}"))?;
        Ok(value)
    }
}

// --- in-memory fake, for tests ----------------------------------------------

#[derive(Default)]
pub struct InMemoryResultStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
