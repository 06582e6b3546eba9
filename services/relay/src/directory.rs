//! Shared directory: the coordination store that locates the replica owning
//! each client.
//!
//! Two implementations behind one trait: `RedisDirectory` for shared mode
//! and `MemoryDirectory` for disabled (single-replica) mode.  Callers treat
//! every result as best-effort -- a record may expire or be overwritten
//! between any two calls, and an outage degrades routing to local-only, it
//! never takes the relay down.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

const RETRY_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory transient failure: {0}")]
    Transient(String),
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, DirectoryError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DirectoryError>;
    async fn delete(&self, key: &str) -> Result<(), DirectoryError>;
    async fn set_add(&self, key: &str, member: &str) -> Result<(), DirectoryError>;
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), DirectoryError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, DirectoryError>;
    async fn healthy(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Key shapes
// ---------------------------------------------------------------------------

pub fn owner_key(client_id: &str) -> String {
    format!("owner:{client_id}")
}

pub fn key_clients_key(api_key_hash: &str) -> String {
    format!("key-clients:{api_key_hash}")
}

pub fn replica_addr_key(replica_id: &str) -> String {
    format!("replica-addr:{replica_id}")
}

// ---------------------------------------------------------------------------
// Redis-backed shared mode
// ---------------------------------------------------------------------------

pub struct RedisDirectory {
    manager: ConnectionManager,
}

impl RedisDirectory {
    pub async fn connect(url: &str) -> Result<Self, DirectoryError> {
        let client = redis::Client::open(url).map_err(transient)?;
        let manager = ConnectionManager::new(client).await.map_err(transient)?;
        Ok(Self { manager })
    }

    /// One bounded re-attempt per call site, per the transient-failure
    /// contract.
    async fn retry_once<T, F, Fut>(&self, op: F) -> Result<T, DirectoryError>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: std::future::Future<Output = Result<T, redis::RedisError>>,
    {
        match op(self.manager.clone()).await {
            Ok(value) => Ok(value),
            Err(first) => {
                warn!(error = %first, "directory call failed, retrying once");
                tokio::time::sleep(RETRY_BACKOFF).await;
                op(self.manager.clone()).await.map_err(transient)
            }
        }
    }
}

fn transient(e: impl std::fmt::Display) -> DirectoryError {
    DirectoryError::Transient(e.to_string())
}

#[async_trait]
impl Directory for RedisDirectory {
    async fn get(&self, key: &str) -> Result<Option<String>, DirectoryError> {
        self.retry_once(|mut conn| {
            let key = key.to_owned();
            async move { conn.get::<_, Option<String>>(key).await }
        })
        .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DirectoryError> {
        let seconds = ttl.as_secs().max(1);
        self.retry_once(|mut conn| {
            let key = key.to_owned();
            let value = value.to_owned();
            async move { conn.set_ex::<_, _, ()>(key, value, seconds).await }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), DirectoryError> {
        self.retry_once(|mut conn| {
            let key = key.to_owned();
            async move { conn.del::<_, ()>(key).await }
        })
        .await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), DirectoryError> {
        self.retry_once(|mut conn| {
            let key = key.to_owned();
            let member = member.to_owned();
            async move { conn.sadd::<_, _, ()>(key, member).await }
        })
        .await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), DirectoryError> {
        self.retry_once(|mut conn| {
            let key = key.to_owned();
            let member = member.to_owned();
            async move { conn.srem::<_, _, ()>(key, member).await }
        })
        .await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, DirectoryError> {
        self.retry_once(|mut conn| {
            let key = key.to_owned();
            async move { conn.smembers::<_, Vec<String>>(key).await }
        })
        .await
    }

    async fn healthy(&self) -> bool {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// Process-local disabled mode
// ---------------------------------------------------------------------------

/// Identical semantics to the shared store, including TTL expiry, without
/// cross-replica visibility.  Integration tests hand one instance to several
/// `AppState`s to stand in for the shared service.
#[derive(Default)]
pub struct MemoryDirectory {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    values: HashMap<String, (String, Instant)>,
    sets: HashMap<String, HashSet<String>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn get(&self, key: &str) -> Result<Option<String>, DirectoryError> {
        let mut inner = self.inner.lock().await;
        match inner.values.get(key) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                inner.values.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), DirectoryError> {
        self.inner
            .lock()
            .await
            .values
            .insert(key.to_owned(), (value.to_owned(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), DirectoryError> {
        self.inner.lock().await.values.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), DirectoryError> {
        self.inner
            .lock()
            .await
            .sets
            .entry(key.to_owned())
            .or_default()
            .insert(member.to_owned());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), DirectoryError> {
        let mut inner = self.inner.lock().await;
        if let Some(members) = inner.sets.get_mut(key) {
            members.remove(member);
            if members.is_empty() {
                inner.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, DirectoryError> {
        Ok(self
            .inner
            .lock()
            .await
            .sets
            .get(key)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn healthy(&self) -> bool {
        true
    }
}
