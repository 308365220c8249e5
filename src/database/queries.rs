use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};

use crate::errors::{AppError, Result};
use crate::models::{Account, Balance, GradeLevel};

#[derive(Debug, Clone, FromRow)]
pub struct AccountRow {
    pub user_id: String,
    pub display_name: String,
    pub grade_level: String,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<AccountRow> for Account {
    type Error = AppError;

    fn try_from(row: AccountRow) -> Result<Self> {
        Ok(Account {
            grade_level: row
                .grade_level
                .parse::<GradeLevel>()
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?,
            timezone: row
                .timezone
                .parse()
                .map_err(|e| AppError::Internal(anyhow::anyhow!("Bad timezone in accounts: {}", e)))?,
            user_id: row.user_id,
            display_name: row.display_name,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct BalanceRow {
    pub user_id: String,
    pub tickets: i64,
    pub diamonds: i64,
    pub last_ticket_replenish_at: NaiveDate,
    pub last_diamond_replenish_at: NaiveDate,
    pub timezone: String,
    pub schema_version: i16,
    pub version: i64,
}

impl TryFrom<BalanceRow> for Balance {
    type Error = AppError;

    fn try_from(row: BalanceRow) -> Result<Self> {
        let corrupt = |what: &str| AppError::Internal(anyhow::anyhow!("Corrupt balance row for {}: {}", row.user_id, what));

        Ok(Balance {
            tickets: u32::try_from(row.tickets).map_err(|_| corrupt("tickets"))?,
            diamonds: u32::try_from(row.diamonds).map_err(|_| corrupt("diamonds"))?,
            last_ticket_replenish_at: row.last_ticket_replenish_at,
            last_diamond_replenish_at: row.last_diamond_replenish_at,
            timezone: row.timezone.parse().map_err(|_| corrupt("timezone"))?,
            schema_version: u16::try_from(row.schema_version).map_err(|_| corrupt("schema_version"))?,
            version: u64::try_from(row.version).map_err(|_| corrupt("version"))?,
            user_id: row.user_id.clone(),
        })
    }
}

pub struct BalanceQueries;

impl BalanceQueries {
    /// Inserts the account and its opening balance in one transaction.
    /// Returns `false` when the user already exists.
    pub async fn create_account(pool: &PgPool, account: &Account, balance: &Balance) -> Result<bool> {
        let mut tx = pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (user_id, display_name, grade_level, timezone, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(&account.user_id)
        .bind(&account.display_name)
        .bind(account.grade_level.as_str())
        .bind(account.timezone.name())
        .bind(account.created_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO balances (
                user_id, tickets, diamonds, last_ticket_replenish_at,
                last_diamond_replenish_at, timezone, schema_version, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&balance.user_id)
        .bind(i64::from(balance.tickets))
        .bind(i64::from(balance.diamonds))
        .bind(balance.last_ticket_replenish_at)
        .bind(balance.last_diamond_replenish_at)
        .bind(balance.timezone.name())
        .bind(balance.schema_version as i16)
        .bind(to_db_version(balance.version)?)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn find_account(pool: &PgPool, user_id: &str) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT user_id, display_name, grade_level, timezone, created_at FROM accounts WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        row.map(Account::try_from).transpose()
    }

    pub async fn find_balance(pool: &PgPool, user_id: &str) -> Result<Option<Balance>> {
        let row = sqlx::query_as::<_, BalanceRow>(
            r#"
            SELECT user_id, tickets, diamonds, last_ticket_replenish_at,
                   last_diamond_replenish_at, timezone, schema_version, version
            FROM balances
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        row.map(Balance::try_from).transpose()
    }

    /// Conditional write keyed on the version the caller read.
    /// Returns `false` when another writer got there first.
    pub async fn update_balance_if_version(
        pool: &PgPool,
        expected_version: u64,
        next: &Balance,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE balances
            SET tickets = $1,
                diamonds = $2,
                last_ticket_replenish_at = $3,
                last_diamond_replenish_at = $4,
                schema_version = $5,
                version = $6,
                updated_at = NOW()
            WHERE user_id = $7 AND version = $8
            "#,
        )
        .bind(i64::from(next.tickets))
        .bind(i64::from(next.diamonds))
        .bind(next.last_ticket_replenish_at)
        .bind(next.last_diamond_replenish_at)
        .bind(next.schema_version as i16)
        .bind(to_db_version(next.version)?)
        .bind(&next.user_id)
        .bind(to_db_version(expected_version)?)
        .execute(pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn balance_exists(pool: &PgPool, user_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM balances WHERE user_id = $1)")
            .bind(user_id)
            .fetch_one(pool)
            .await?;

        Ok(exists)
    }
}

fn to_db_version(version: u64) -> Result<i64> {
    i64::try_from(version).map_err(|_| AppError::Internal(anyhow::anyhow!("Balance version out of range")))
}
