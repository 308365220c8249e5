use ::redis::{aio::ConnectionManager, Client};

use crate::errors::Result;

const DEFAULT_KEY_PREFIX: &str = "qdeli";

#[derive(Clone)]
pub struct RedisService {
    connection_manager: ConnectionManager,
    key_prefix: String,
}

impl RedisService {
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_prefix(redis_url, DEFAULT_KEY_PREFIX).await
    }

    /// Connects with every key namespaced under `key_prefix`, so several
    /// deployments (or test runs) can share one Redis.
    pub async fn with_prefix(redis_url: &str, key_prefix: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let connection_manager = ConnectionManager::new(client).await?;

        Ok(Self {
            connection_manager,
            key_prefix: key_prefix.to_string(),
        })
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }

    pub fn key(&self, kind: &str, id: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, kind, id)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        ::redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
