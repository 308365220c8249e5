use async_trait::async_trait;

use crate::{
    database::{queries::BalanceQueries, Database},
    errors::{AppError, Result},
    models::{Account, Balance},
    storage::BalanceStore,
};

pub struct PgBalanceStore {
    database: Database,
}

impl PgBalanceStore {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

#[async_trait]
impl BalanceStore for PgBalanceStore {
    async fn create(&self, account: &Account, balance: &Balance) -> Result<()> {
        let created = BalanceQueries::create_account(self.database.pool(), account, balance).await?;
        if !created {
            return Err(AppError::AccountExists(account.user_id.clone()));
        }
        Ok(())
    }

    async fn load_account(&self, user_id: &str) -> Result<Option<Account>> {
        BalanceQueries::find_account(self.database.pool(), user_id).await
    }

    async fn load(&self, user_id: &str) -> Result<Option<Balance>> {
        BalanceQueries::find_balance(self.database.pool(), user_id).await
    }

    async fn compare_and_swap(&self, expected_version: u64, next: &Balance) -> Result<()> {
        let pool = self.database.pool();
        if BalanceQueries::update_balance_if_version(pool, expected_version, next).await? {
            return Ok(());
        }

        // Nothing matched: either the version moved on or the row is gone
        if BalanceQueries::balance_exists(pool, &next.user_id).await? {
            Err(AppError::StoreConflict(next.user_id.clone()))
        } else {
            Err(AppError::AccountNotFound(next.user_id.clone()))
        }
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.database.pool()).await?;
        Ok(())
    }
}
