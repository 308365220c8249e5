use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    config::{Config, StoreBackend},
    database::Database,
    errors::Result,
    models::{Account, Balance},
    services::redis::RedisService,
};

pub mod memory;
pub mod postgres;
pub mod redis;

/// Durable home of accounts and their balances.
///
/// Writes are conditional on the stored `version`, which is what keeps
/// concurrent requests for the same user from double-spending even when
/// several server instances share one store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Inserts a new account together with its opening balance.
    /// Fails with `AccountExists` if the user is already registered.
    async fn create(&self, account: &Account, balance: &Balance) -> Result<()>;

    async fn load_account(&self, user_id: &str) -> Result<Option<Account>>;

    async fn load(&self, user_id: &str) -> Result<Option<Balance>>;

    /// Replaces the stored balance with `next` if its version is still
    /// `expected_version`, otherwise fails with `StoreConflict`.
    async fn compare_and_swap(&self, expected_version: u64, next: &Balance) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

pub async fn create_store(config: &Config) -> Result<Arc<dyn BalanceStore>> {
    match config.store_backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory balance store; balances are lost on restart");
            Ok(Arc::new(memory::MemoryBalanceStore::new()))
        }
        StoreBackend::Postgres => {
            let database = Database::new(&config.database_url).await?;
            database.migrate().await?;
            Ok(Arc::new(postgres::PgBalanceStore::new(database)))
        }
        StoreBackend::Redis => {
            let service = RedisService::new(&config.redis_url).await?;
            Ok(Arc::new(self::redis::RedisBalanceStore::new(service)))
        }
    }
}
