//! Per-user point ledger.
//!
//! Every mutation is a read-modify-write against the [`BalanceStore`] with a
//! conditional write on the version that was read. A lost race re-reads and
//! re-applies the whole step (replenish, check, debit), so two requests for
//! the same user never both spend the same points. Different users never
//! contend with each other.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::{
    errors::{AppError, Result},
    models::{
        Account, Balance, GateDenied, LedgerTransaction, PointType, Points, TransactionOutcome,
        BALANCE_SCHEMA_VERSION,
    },
    services::{
        clock::Clock,
        metrics::MetricsService,
        replenishment::{local_date, month_start, Replenished, ReplenishmentPolicy},
    },
    storage::BalanceStore,
};

/// Longest single backoff between conflicting writes, before jitter.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Bounded retry for conflicting writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with up to one `base_delay` of jitter.
    fn delay(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponential = self
            .base_delay
            .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1).min(10)))
            .unwrap_or(MAX_RETRY_DELAY)
            .min(MAX_RETRY_DELAY);
        let jitter_cap = self.base_delay.min(MAX_RETRY_DELAY).as_millis() as u64;
        let jitter_ms = rand::thread_rng().gen_range(0..=jitter_cap);
        exponential + Duration::from_millis(jitter_ms)
    }
}

#[derive(Debug, Clone)]
pub enum ConsumeOutcome {
    Granted {
        balance: Balance,
        transaction: LedgerTransaction,
    },
    Denied(GateDenied),
}

impl ConsumeOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, ConsumeOutcome::Granted { .. })
    }

    pub fn points(&self) -> Points {
        match self {
            ConsumeOutcome::Granted { balance, .. } => balance.points(),
            ConsumeOutcome::Denied(denied) => denied.current_balance,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Decision {
    Granted,
    Denied,
}

pub struct QuotaLedger {
    store: Arc<dyn BalanceStore>,
    clock: Arc<dyn Clock>,
    policy: ReplenishmentPolicy,
    retry: RetryPolicy,
    initial_points: Points,
    metrics: Option<Arc<MetricsService>>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn BalanceStore>, clock: Arc<dyn Clock>, policy: ReplenishmentPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
            retry: RetryPolicy::default(),
            initial_points: Points {
                tickets: 15,
                diamonds: 5,
            },
            metrics: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = RetryPolicy {
            max_attempts: retry.max_attempts.max(1),
            ..retry
        };
        self
    }

    pub fn with_initial_points(mut self, initial_points: Points) -> Self {
        self.initial_points = initial_points;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsService>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn BalanceStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// When the next top-up of `point_type` lands for this balance's timezone.
    pub fn next_replenish_at(&self, point_type: PointType, balance: &Balance) -> DateTime<Utc> {
        self.policy
            .next_replenish_at(point_type, self.clock.now(), balance.timezone)
    }

    /// Registers a user with the opening grant. Both replenishment stamps are
    /// set to the current period so the first request does not top up again.
    pub async fn open_account(&self, account: Account) -> Result<Balance> {
        let today = local_date(self.clock.now(), account.timezone);
        let balance = Balance {
            user_id: account.user_id.clone(),
            tickets: self.initial_points.tickets,
            diamonds: self.initial_points.diamonds,
            last_ticket_replenish_at: today,
            last_diamond_replenish_at: month_start(today),
            timezone: account.timezone,
            schema_version: BALANCE_SCHEMA_VERSION,
            version: 0,
        };

        self.store.create(&account, &balance).await?;
        tracing::info!(user_id = %account.user_id, tickets = balance.tickets, diamonds = balance.diamonds, "Account opened");

        Ok(balance)
    }

    /// Profile plus current balance, for the account page.
    pub async fn account(&self, user_id: &str) -> Result<(Account, Balance)> {
        let account = self
            .store
            .load_account(user_id)
            .await?
            .ok_or_else(|| AppError::AccountNotFound(user_id.to_string()))?;
        let balance = self.current_balance(user_id).await?;
        Ok((account, balance))
    }

    /// Balance with any due replenishment applied and committed.
    pub async fn current_balance(&self, user_id: &str) -> Result<Balance> {
        let policy = self.policy;
        let (replenished, balance, _) = self
            .update(user_id, |balance, now| Ok(policy.apply(balance, now)))
            .await?;
        self.record_replenishment(replenished);
        Ok(balance)
    }

    /// Replenishes if due, then takes `cost` points if the user has them.
    ///
    /// A denial is an `Ok` outcome; only missing accounts and store failures
    /// are errors. Replenishment is committed even when the debit is denied.
    pub async fn try_consume(&self, user_id: &str, point_type: PointType, cost: u32) -> Result<ConsumeOutcome> {
        self.consume(user_id, None, point_type, cost).await
    }

    pub(crate) async fn consume(
        &self,
        user_id: &str,
        feature_id: Option<&str>,
        point_type: PointType,
        cost: u32,
    ) -> Result<ConsumeOutcome> {
        if cost == 0 {
            return Err(AppError::Validation("Cost must be at least 1 point".to_string()));
        }

        let policy = self.policy;
        let ((replenished, decision), balance, now) = self
            .update(user_id, |balance, now| {
                let replenished = policy.apply(balance, now);
                let decision = if balance.try_debit(point_type, cost) {
                    Decision::Granted
                } else {
                    Decision::Denied
                };
                Ok((replenished, decision))
            })
            .await?;
        self.record_replenishment(replenished);

        let outcome = match decision {
            Decision::Granted => TransactionOutcome::Granted,
            Decision::Denied => TransactionOutcome::DeniedInsufficientBalance,
        };
        let mut transaction = LedgerTransaction::new(user_id, point_type, cost, outcome, now);
        if let Some(feature_id) = feature_id {
            transaction = transaction.for_feature(feature_id);
        }
        transaction.emit();

        match decision {
            Decision::Granted => Ok(ConsumeOutcome::Granted { balance, transaction }),
            Decision::Denied => Ok(ConsumeOutcome::Denied(GateDenied {
                point_type,
                cost,
                current_balance: balance.points(),
                next_replenish_at: self.policy.next_replenish_at(point_type, now, balance.timezone),
                next_replenish_amount: self.policy.rule(point_type).amount,
            })),
        }
    }

    /// Gives back points taken by an earlier grant. No replenishment is
    /// applied, so consume followed by refund restores the balance exactly.
    pub async fn refund(&self, user_id: &str, point_type: PointType, cost: u32) -> Result<Balance> {
        self.refund_for(user_id, None, point_type, cost).await
    }

    pub(crate) async fn refund_for(
        &self,
        user_id: &str,
        feature_id: Option<&str>,
        point_type: PointType,
        cost: u32,
    ) -> Result<Balance> {
        if cost == 0 {
            return Err(AppError::Validation("Cost must be at least 1 point".to_string()));
        }

        let (_, balance, now) = self
            .update(user_id, |balance, _| {
                if balance.try_credit(point_type, cost) {
                    Ok(())
                } else {
                    Err(AppError::BalanceOverflow(balance.user_id.clone()))
                }
            })
            .await?;

        let mut transaction =
            LedgerTransaction::new(user_id, point_type, cost, TransactionOutcome::Refunded, now);
        if let Some(feature_id) = feature_id {
            transaction = transaction.for_feature(feature_id);
        }
        transaction.emit();

        if let Some(metrics) = &self.metrics {
            metrics.record_refund(point_type.as_str());
        }

        Ok(balance)
    }

    /// Read, mutate, conditionally write; retried on conflict.
    ///
    /// `apply` must be a pure function of the balance and time, since it runs
    /// again from scratch on every attempt. Nothing is written when it leaves
    /// the balance unchanged.
    async fn update<T, F>(&self, user_id: &str, mut apply: F) -> Result<(T, Balance, DateTime<Utc>)>
    where
        F: FnMut(&mut Balance, DateTime<Utc>) -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let current = self
                .store
                .load(user_id)
                .await?
                .ok_or_else(|| AppError::AccountNotFound(user_id.to_string()))?;

            let now = self.clock.now();
            let mut next = current.clone();
            let value = apply(&mut next, now)?;

            if next == current {
                return Ok((value, current, now));
            }

            next.version = current.version + 1;
            next.schema_version = BALANCE_SCHEMA_VERSION;

            match self.store.compare_and_swap(current.version, &next).await {
                Ok(()) => return Ok((value, next, now)),
                Err(AppError::StoreConflict(_)) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_store_conflict();
                    }
                    if attempt >= self.retry.max_attempts {
                        tracing::warn!(user_id, attempt, "Giving up after repeated write conflicts");
                        return Err(AppError::Transient(format!(
                            "Balance of {} is under heavy contention",
                            user_id
                        )));
                    }
                    tracing::debug!(user_id, attempt, "Write conflict, retrying");
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_replenishment(&self, replenished: Replenished) {
        if replenished.tickets {
            tracing::debug!("Daily tickets replenished");
        }
        if replenished.diamonds {
            tracing::debug!("Monthly diamonds replenished");
        }

        if let Some(metrics) = &self.metrics {
            if replenished.tickets {
                metrics.record_replenishment(PointType::Ticket.as_str());
            }
            if replenished.diamonds {
                metrics.record_replenishment(PointType::Diamond.as_str());
            }
        }
    }
}
