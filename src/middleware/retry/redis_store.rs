use async_trait::async_trait;
use redis::AsyncCommands;
use redis::Client;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use crate::config::RedisSettings;
use crate::middleware::retry::CounterStore;
use crate::utils::Result;

/// Counters kept in redis, each key expiring `key_expire_ttl_secs` after
/// its last increment.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    key_format: String,
    key_expire_ttl_secs: u64,
}

impl RedisStore {
    pub async fn connect(settings: &RedisSettings) -> Result<Self> {
        let url = redis_url(settings);
        info!(host = %settings.host, port = settings.port, "Connecting retry store to redis");
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn, settings))
    }

    pub fn with_connection(conn: ConnectionManager, settings: &RedisSettings) -> Self {
        Self {
            conn,
            key_format: settings.key_format.clone(),
            key_expire_ttl_secs: settings.key_expire_ttl_secs,
        }
    }

    fn key(&self, id: &str) -> String {
        format_key(&self.key_format, id)
    }
}

/// Connection URL for the configured redis server.
pub fn redis_url(settings: &RedisSettings) -> String {
    match &settings.password {
        Some(password) => format!(
            "redis://:{}@{}:{}",
            urlencoding::encode(password),
            settings.host,
            settings.port
        ),
        None => format!("redis://{}:{}", settings.host, settings.port),
    }
}

/// Substitutes `id` for the first `{}` in `key_format`, appending it when
/// the format has no placeholder.
pub fn format_key(key_format: &str, id: &str) -> String {
    if key_format.contains("{}") {
        key_format.replacen("{}", id, 1)
    } else {
        format!("{}{}", key_format, id)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> Result<u64> {
        let key = self.key(key);
        debug!(key = %key, "getting retry count");
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn.get(&key).await?;
        Ok(count.unwrap_or(0))
    }

    async fn increment(&self, key: &str) -> Result<u64> {
        let key = self.key(key);
        debug!(key = %key, "incrementing retry count");
        let mut conn = self.conn.clone();
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(&key, 1)
            .expire(&key, self.key_expire_ttl_secs as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let key = self.key(key);
        debug!(key = %key, "clearing retry count");
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&key).await?;
        Ok(())
    }
}
