use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    errors::{AppError, Result},
    models::{Account, Balance},
    storage::BalanceStore,
};

/// Process-local store for tests and single-instance development.
#[derive(Default)]
pub struct MemoryBalanceStore {
    records: RwLock<HashMap<String, (Account, Balance)>>,
}

impl MemoryBalanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrites a record unconditionally. Test fixtures use this to set up
    /// balances and stamps directly.
    pub async fn put(&self, account: Account, balance: Balance) {
        self.records
            .write()
            .await
            .insert(account.user_id.clone(), (account, balance));
    }
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    async fn create(&self, account: &Account, balance: &Balance) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&account.user_id) {
            return Err(AppError::AccountExists(account.user_id.clone()));
        }

        records.insert(account.user_id.clone(), (account.clone(), balance.clone()));
        Ok(())
    }

    async fn load_account(&self, user_id: &str) -> Result<Option<Account>> {
        let records = self.records.read().await;
        Ok(records.get(user_id).map(|(account, _)| account.clone()))
    }

    async fn load(&self, user_id: &str) -> Result<Option<Balance>> {
        let records = self.records.read().await;
        Ok(records.get(user_id).map(|(_, balance)| balance.clone()))
    }

    async fn compare_and_swap(&self, expected_version: u64, next: &Balance) -> Result<()> {
        let mut records = self.records.write().await;
        let (_, stored) = records
            .get_mut(&next.user_id)
            .ok_or_else(|| AppError::AccountNotFound(next.user_id.clone()))?;

        if stored.version != expected_version {
            return Err(AppError::StoreConflict(next.user_id.clone()));
        }

        *stored = next.clone();
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GradeLevel, BALANCE_SCHEMA_VERSION};
    use chrono::{NaiveDate, Utc};
    use chrono_tz::Tz;

    fn fixture(user_id: &str) -> (Account, Balance) {
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        (
            Account {
                user_id: user_id.to_string(),
                display_name: "Hana".to_string(),
                grade_level: GradeLevel::SeniorHigh1,
                timezone: Tz::UTC,
                created_at: Utc::now(),
            },
            Balance {
                user_id: user_id.to_string(),
                tickets: 15,
                diamonds: 5,
                last_ticket_replenish_at: day,
                last_diamond_replenish_at: day,
                timezone: Tz::UTC,
                schema_version: BALANCE_SCHEMA_VERSION,
                version: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let store = MemoryBalanceStore::new();
        let (account, balance) = fixture("u1");

        store.create(&account, &balance).await.unwrap();
        let err = store.create(&account, &balance).await.unwrap_err();
        assert!(matches!(err, AppError::AccountExists(_)));

        assert_eq!(store.load_account("u1").await.unwrap(), Some(account));
        assert_eq!(store.load("u1").await.unwrap(), Some(balance));
        assert_eq!(store.load("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_swap_checks_version() {
        let store = MemoryBalanceStore::new();
        let (account, balance) = fixture("u1");
        store.create(&account, &balance).await.unwrap();

        let mut next = balance.clone();
        next.tickets = 14;
        next.version = 1;
        store.compare_and_swap(0, &next).await.unwrap();

        // a writer that still holds version 0 loses
        let mut stale = balance.clone();
        stale.tickets = 10;
        stale.version = 1;
        let err = store.compare_and_swap(0, &stale).await.unwrap_err();
        assert!(matches!(err, AppError::StoreConflict(_)));

        assert_eq!(store.load("u1").await.unwrap().unwrap().tickets, 14);
    }

    #[test]
    fn test_compare_and_swap_on_missing_account() {
        let store = MemoryBalanceStore::new();
        let (_, balance) = fixture("ghost");

        let result = tokio_test::block_on(store.compare_and_swap(0, &balance));
        let err = tokio_test::assert_err!(result);
        assert!(matches!(err, AppError::AccountNotFound(_)));
    }
}
