//! Broker backends for the coordination bus
//!
//! The bus needs a small slice of broker behavior: keys with expiry and
//! fire-and-forget pub/sub. [`Broker`] captures exactly that slice so the
//! production Redis client and the in-process test broker are
//! interchangeable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt as _;
use tokio::sync::mpsc;

use crate::{Error, Result};

/// Key/value store with expiry plus pub/sub.
///
/// Every method returns [`crate::Error::Coordination`] on backend failure.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Store `value` under `key` with a time-to-live.
    ///
    /// # Errors
    ///
    /// Returns error on backend failure.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// Fetch the value under `key`, if present and unexpired.
    ///
    /// # Errors
    ///
    /// Returns error on backend failure.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key`.
    ///
    /// # Errors
    ///
    /// Returns error on backend failure.
    async fn del(&self, key: &str) -> Result<()>;

    /// Publish `payload` to everyone subscribed to `channel`.
    ///
    /// # Errors
    ///
    /// Returns error on backend failure.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to `channel`, receiving payloads until the receiver is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns error on backend failure.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>>;
}

/// Redis-backed broker
pub struct RedisBroker {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisBroker {
    /// Connect to Redis at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] if the connection cannot be
    /// established.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Coordination(format!("invalid broker url: {e}")))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Coordination(format!("broker connect: {e}")))?;
        Ok(Self { client, conn })
    }
}

fn broker_err(op: &str, e: &redis::RedisError) -> Error {
    Error::Coordination(format!("broker {op}: {e}"))
}

#[async_trait]
impl Broker for RedisBroker {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::AsyncCommands::set_ex::<_, _, ()>(&mut conn, key, value, ttl_secs)
            .await
            .map_err(|e| broker_err("set", &e))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::AsyncCommands::get(&mut conn, key)
            .await
            .map_err(|e| broker_err("get", &e))
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::AsyncCommands::del::<_, ()>(&mut conn, key)
            .await
            .map_err(|e| broker_err("del", &e))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::AsyncCommands::publish::<_, _, ()>(&mut conn, channel, payload)
            .await
            .map_err(|e| broker_err("publish", &e))
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| broker_err("pubsub connect", &e))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| broker_err("subscribe", &e))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload) = msg.get_payload::<String>() else {
                    continue;
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// In-process broker used by tests and single-binary demos.
///
/// Clones share state, so two bus instances handed clones of one
/// `MemoryBroker` behave like two nodes on one Redis.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    keys: Mutex<HashMap<String, (String, Instant)>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl MemoryBroker {
    /// Create an empty broker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_keys(&self) -> std::sync::MutexGuard<'_, HashMap<String, (String, Instant)>> {
        self.inner
            .keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let expiry = Instant::now() + Duration::from_secs(ttl_secs);
        self.lock_keys()
            .insert(key.to_string(), (value.to_string(), expiry));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut keys = self.lock_keys();
        match keys.get(key) {
            Some((value, expiry)) if *expiry > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                keys.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.lock_keys().remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let targets: Vec<mpsc::Sender<String>> = {
            let subscribers = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            subscribers.get(channel).cloned().unwrap_or_default()
        };
        for tx in targets {
            // Gone subscribers are pruned on the next subscribe
            let _ = tx.send(payload.to_string()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(64);
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = subscribers.entry(channel.to_string()).or_default();
        entry.retain(|s| !s.is_closed());
        entry.push(tx);
        Ok(rx)
    }
}
