use std::collections::HashMap;
use std::str::FromStr;

use ::redis::{AsyncCommands, Script};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::{
    errors::{AppError, Result},
    models::{Account, Balance, GradeLevel},
    services::redis::RedisService,
    storage::BalanceStore,
};

// KEYS[1] = account hash, ARGV = field/value pairs
const CREATE_SCRIPT: &str = r#"
    if redis.call('EXISTS', KEYS[1]) == 1 then
        return 0
    end
    redis.call('HSET', KEYS[1], unpack(ARGV))
    return 1
"#;

// KEYS[1] = account hash, ARGV[1] = expected version, ARGV[2..] = field/value pairs
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
    local current = redis.call('HGET', KEYS[1], 'version')
    if not current then
        return -1
    end
    if current ~= ARGV[1] then
        return 0
    end
    local fields = {}
    for i = 2, #ARGV do
        fields[#fields + 1] = ARGV[i]
    end
    redis.call('HSET', KEYS[1], unpack(fields))
    return 1
"#;

/// One hash per user holding the account and its balance. Scripts run
/// atomically on the server, which gives the conditional write.
pub struct RedisBalanceStore {
    redis: RedisService,
}

impl RedisBalanceStore {
    pub fn new(redis: RedisService) -> Self {
        Self { redis }
    }

    fn account_key(&self, user_id: &str) -> String {
        self.redis.key("account", user_id)
    }
}

fn balance_fields(balance: &Balance) -> Vec<String> {
    vec![
        "tickets".to_string(),
        balance.tickets.to_string(),
        "diamonds".to_string(),
        balance.diamonds.to_string(),
        "last_ticket_replenish_at".to_string(),
        balance.last_ticket_replenish_at.to_string(),
        "last_diamond_replenish_at".to_string(),
        balance.last_diamond_replenish_at.to_string(),
        "timezone".to_string(),
        balance.timezone.name().to_string(),
        "schema_version".to_string(),
        balance.schema_version.to_string(),
        "version".to_string(),
        balance.version.to_string(),
    ]
}

fn field<T: FromStr>(record: &HashMap<String, String>, name: &str) -> Result<T> {
    record
        .get(name)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| AppError::Internal(anyhow!("Corrupt ledger record: bad field '{}'", name)))
}

fn parse_balance(user_id: &str, record: &HashMap<String, String>) -> Result<Balance> {
    Ok(Balance {
        user_id: user_id.to_string(),
        tickets: field(record, "tickets")?,
        diamonds: field(record, "diamonds")?,
        last_ticket_replenish_at: field::<NaiveDate>(record, "last_ticket_replenish_at")?,
        last_diamond_replenish_at: field::<NaiveDate>(record, "last_diamond_replenish_at")?,
        timezone: field::<Tz>(record, "timezone")?,
        schema_version: field(record, "schema_version")?,
        version: field(record, "version")?,
    })
}

fn parse_account(user_id: &str, record: &HashMap<String, String>) -> Result<Account> {
    Ok(Account {
        user_id: user_id.to_string(),
        display_name: record.get("display_name").cloned().unwrap_or_default(),
        grade_level: field::<GradeLevel>(record, "grade_level")?,
        timezone: field::<Tz>(record, "timezone")?,
        created_at: field::<DateTime<Utc>>(record, "created_at")?,
    })
}

#[async_trait]
impl BalanceStore for RedisBalanceStore {
    async fn create(&self, account: &Account, balance: &Balance) -> Result<()> {
        let mut fields = vec![
            "display_name".to_string(),
            account.display_name.clone(),
            "grade_level".to_string(),
            account.grade_level.as_str().to_string(),
            "created_at".to_string(),
            account.created_at.to_rfc3339(),
        ];
        fields.extend(balance_fields(balance));

        let mut conn = self.redis.connection();
        let created: i64 = Script::new(CREATE_SCRIPT)
            .key(self.account_key(&account.user_id))
            .arg(fields)
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            return Err(AppError::AccountExists(account.user_id.clone()));
        }

        Ok(())
    }

    async fn load_account(&self, user_id: &str) -> Result<Option<Account>> {
        let mut conn = self.redis.connection();
        let record: HashMap<String, String> = conn.hgetall(self.account_key(user_id)).await?;
        if record.is_empty() {
            return Ok(None);
        }

        parse_account(user_id, &record).map(Some)
    }

    async fn load(&self, user_id: &str) -> Result<Option<Balance>> {
        let mut conn = self.redis.connection();
        let record: HashMap<String, String> = conn.hgetall(self.account_key(user_id)).await?;
        if record.is_empty() {
            return Ok(None);
        }

        parse_balance(user_id, &record).map(Some)
    }

    async fn compare_and_swap(&self, expected_version: u64, next: &Balance) -> Result<()> {
        let mut conn = self.redis.connection();
        let swapped: i64 = Script::new(COMPARE_AND_SWAP_SCRIPT)
            .key(self.account_key(&next.user_id))
            .arg(expected_version.to_string())
            .arg(balance_fields(next))
            .invoke_async(&mut conn)
            .await?;

        match swapped {
            1 => Ok(()),
            0 => Err(AppError::StoreConflict(next.user_id.clone())),
            _ => Err(AppError::AccountNotFound(next.user_id.clone())),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.redis.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BALANCE_SCHEMA_VERSION;

    fn sample_balance() -> Balance {
        Balance {
            user_id: "u1".to_string(),
            tickets: 12,
            diamonds: 7,
            last_ticket_replenish_at: NaiveDate::from_ymd_opt(2026, 10, 17).unwrap(),
            last_diamond_replenish_at: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
            timezone: chrono_tz::Asia::Tokyo,
            schema_version: BALANCE_SCHEMA_VERSION,
            version: 42,
        }
    }

    #[test]
    fn test_balance_fields_parse_back() {
        let balance = sample_balance();
        let flat = balance_fields(&balance);
        let record: HashMap<String, String> = flat
            .chunks(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();

        assert_eq!(record.get("timezone").map(String::as_str), Some("Asia/Tokyo"));
        assert_eq!(parse_balance("u1", &record).unwrap(), balance);
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let mut record = HashMap::new();
        record.insert("tickets".to_string(), "-3".to_string());
        let err = parse_balance("u1", &record).unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));
    }
}
