use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tokio::{runtime::Handle, task::JoinHandle};

use crate::{
    errors::AppError,
    models::{FeatureCatalog, FeatureCost, PointType, Points},
    services::{
        metrics::MetricsService,
        quota_ledger::{ConsumeOutcome, QuotaLedger},
    },
};

/// Handler output together with the balance left after the charge.
#[derive(Debug, Clone)]
pub struct Gated<T> {
    pub value: T,
    pub points_remaining: Points,
}

#[derive(Error, Debug)]
pub enum GateError<E> {
    /// The gate refused to run the handler. Denials arrive here as
    /// `AppError::InsufficientBalance`.
    #[error(transparent)]
    Rejected(#[from] AppError),

    #[error("Feature handler failed: {0}")]
    Handler(E),

    #[error("Feature handler timed out after {0:?}")]
    TimedOut(Duration),
}

/// Check-and-charge in front of every paid feature.
pub struct FeatureGate {
    ledger: Arc<QuotaLedger>,
    catalog: FeatureCatalog,
    refund_on_failure: bool,
    handler_timeout: Option<Duration>,
    metrics: Option<Arc<MetricsService>>,
}

impl FeatureGate {
    pub fn new(ledger: Arc<QuotaLedger>, catalog: FeatureCatalog) -> Self {
        Self {
            ledger,
            catalog,
            refund_on_failure: true,
            handler_timeout: None,
            metrics: None,
        }
    }

    pub fn with_refund_on_failure(mut self, refund_on_failure: bool) -> Self {
        self.refund_on_failure = refund_on_failure;
        self
    }

    pub fn with_handler_timeout(mut self, handler_timeout: Option<Duration>) -> Self {
        self.handler_timeout = handler_timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsService>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn catalog(&self) -> &FeatureCatalog {
        &self.catalog
    }

    pub fn resolve(&self, feature_id: &str) -> Result<FeatureCost, AppError> {
        self.catalog
            .resolve(feature_id)
            .ok_or_else(|| AppError::UnknownFeature(feature_id.to_string()))
    }

    /// Charges the feature's cost, then runs `handler(user_id)`.
    ///
    /// The charge is only final when the handler succeeds. A handler error,
    /// a timeout, or the returned future being dropped mid-run all give the
    /// points back.
    pub async fn invoke<F, Fut, T, E>(
        &self,
        feature_id: &str,
        user_id: &str,
        handler: F,
    ) -> Result<Gated<T>, GateError<E>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let FeatureCost { point_type, cost } = self.resolve(feature_id)?;
        let feature_id = crate::models::normalize_feature_id(feature_id);

        let balance = match self
            .ledger
            .consume(user_id, Some(&feature_id), point_type, cost)
            .await?
        {
            ConsumeOutcome::Granted { balance, .. } => balance,
            ConsumeOutcome::Denied(denied) => {
                self.record(&feature_id, "denied");
                return Err(AppError::InsufficientBalance(denied).into());
            }
        };

        let guard = RefundGuard {
            ledger: self.ledger.clone(),
            user_id: user_id.to_string(),
            feature_id: feature_id.clone(),
            point_type,
            cost,
            armed: self.refund_on_failure,
        };

        let result = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, handler(user_id.to_string())).await {
                Ok(result) => result.map_err(GateError::Handler),
                Err(_) => Err(GateError::TimedOut(limit)),
            },
            None => handler(user_id.to_string()).await.map_err(GateError::Handler),
        };

        match result {
            Ok(value) => {
                guard.disarm();
                self.record(&feature_id, "granted");
                Ok(Gated {
                    value,
                    points_remaining: balance.points(),
                })
            }
            Err(e) => {
                tracing::warn!(user_id, feature = %feature_id, "Feature run failed after charge");
                self.record(&feature_id, "failed");
                guard.refund().await;
                Err(e)
            }
        }
    }

    fn record(&self, feature_id: &str, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_gate_decision(feature_id, outcome);
        }
    }
}

/// Owes a refund until disarmed. Dropping it while armed (the request was
/// cancelled mid-handler) hands the refund to the runtime.
struct RefundGuard {
    ledger: Arc<QuotaLedger>,
    user_id: String,
    feature_id: String,
    point_type: PointType,
    cost: u32,
    armed: bool,
}

impl RefundGuard {
    fn disarm(mut self) {
        self.armed = false;
    }

    /// Runs the refund as its own task and waits for it. The task outlives
    /// the caller, so cancelling the request mid-refund does not lose it.
    async fn refund(mut self) {
        if let Some(task) = self.spawn_refund() {
            if let Err(e) = task.await {
                tracing::error!(user_id = %self.user_id, "Refund task failed: {}", e);
            }
        }
    }

    fn spawn_refund(&mut self) -> Option<JoinHandle<()>> {
        if !self.armed {
            return None;
        }
        self.armed = false;

        let ledger = self.ledger.clone();
        let user_id = self.user_id.clone();
        let feature_id = std::mem::take(&mut self.feature_id);
        let (point_type, cost) = (self.point_type, self.cost);

        match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(async move {
                refund_logged(&ledger, &user_id, &feature_id, point_type, cost).await;
            })),
            Err(_) => {
                tracing::error!(user_id = %user_id, feature = %feature_id, cost, "No runtime to refund feature run");
                None
            }
        }
    }
}

impl Drop for RefundGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::info!(user_id = %self.user_id, feature = %self.feature_id, "Feature run cancelled, refunding");
            let _ = self.spawn_refund();
        }
    }
}

async fn refund_logged(
    ledger: &QuotaLedger,
    user_id: &str,
    feature_id: &str,
    point_type: PointType,
    cost: u32,
) {
    if let Err(e) = ledger
        .refund_for(user_id, Some(feature_id), point_type, cost)
        .await
    {
        tracing::error!(user_id, feature = %feature_id, %point_type, cost, "Refund failed: {}", e);
    }
}

impl IntoResponse for GateError<anyhow::Error> {
    fn into_response(self) -> Response {
        match self {
            GateError::Rejected(e) => e.into_response(),
            GateError::Handler(e) => {
                tracing::error!("Feature handler error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "success": false,
                        "error": "Feature failed",
                        "message": e.to_string(),
                    })),
                )
                    .into_response()
            }
            GateError::TimedOut(limit) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "success": false,
                    "error": "Feature failed",
                    "message": format!("Feature did not finish within {} seconds", limit.as_secs()),
                })),
            )
                .into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Account, Balance, GradeLevel, BALANCE_SCHEMA_VERSION};
    use crate::services::clock::ManualClock;
    use crate::services::replenishment::ReplenishmentPolicy;
    use crate::storage::{memory::MemoryBalanceStore, BalanceStore};
    use chrono::{DateTime, NaiveDate, TimeZone, Utc};
    use chrono_tz::Tz;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 15, 10, 0, 0).unwrap()
    }

    async fn seeded_store(tickets: u32, diamonds: u32) -> Arc<MemoryBalanceStore> {
        let store = Arc::new(MemoryBalanceStore::new());
        store
            .put(
                Account {
                    user_id: "u1".to_string(),
                    display_name: "Hina".to_string(),
                    grade_level: GradeLevel::default(),
                    timezone: Tz::UTC,
                    created_at: now(),
                },
                Balance {
                    user_id: "u1".to_string(),
                    tickets,
                    diamonds,
                    last_ticket_replenish_at: NaiveDate::from_ymd_opt(2026, 6, 15).unwrap(),
                    last_diamond_replenish_at: NaiveDate::from_ymd_opt(2026, 6, 1).unwrap(),
                    timezone: Tz::UTC,
                    schema_version: BALANCE_SCHEMA_VERSION,
                    version: 1,
                },
            )
            .await;
        store
    }

    fn gate_over(store: Arc<dyn BalanceStore>) -> FeatureGate {
        let ledger = Arc::new(QuotaLedger::new(
            store,
            Arc::new(ManualClock::new(now())),
            ReplenishmentPolicy::default(),
        ));
        FeatureGate::new(ledger, FeatureCatalog::default())
    }

    async fn gate_with(tickets: u32, diamonds: u32) -> (FeatureGate, Arc<MemoryBalanceStore>) {
        let store = seeded_store(tickets, diamonds).await;
        (gate_over(store.clone()), store)
    }

    /// Memory store whose second write stalls, to hold a refund in flight.
    struct SlowRefundStore {
        inner: Arc<MemoryBalanceStore>,
        writes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl BalanceStore for SlowRefundStore {
        async fn create(&self, account: &Account, balance: &Balance) -> crate::errors::Result<()> {
            self.inner.create(account, balance).await
        }

        async fn load_account(&self, user_id: &str) -> crate::errors::Result<Option<Account>> {
            self.inner.load_account(user_id).await
        }

        async fn load(&self, user_id: &str) -> crate::errors::Result<Option<Balance>> {
            self.inner.load(user_id).await
        }

        async fn compare_and_swap(&self, expected_version: u64, next: &Balance) -> crate::errors::Result<()> {
            if self.writes.fetch_add(1, Ordering::SeqCst) == 1 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            self.inner.compare_and_swap(expected_version, next).await
        }

        async fn ping(&self) -> crate::errors::Result<()> {
            self.inner.ping().await
        }
    }

    async fn points(store: &MemoryBalanceStore) -> Points {
        store.load("u1").await.unwrap().unwrap().points()
    }

    #[tokio::test]
    async fn test_successful_run_keeps_the_charge() {
        let (gate, store) = gate_with(3, 1).await;

        let gated = gate
            .invoke("grade-essay", "u1", |user_id| async move {
                Ok::<_, anyhow::Error>(format!("graded for {}", user_id))
            })
            .await
            .unwrap();

        assert_eq!(gated.value, "graded for u1");
        assert_eq!(gated.points_remaining, Points { tickets: 2, diamonds: 1 });
        assert_eq!(points(&store).await, Points { tickets: 2, diamonds: 1 });
    }

    #[tokio::test]
    async fn test_failing_handler_is_refunded() {
        let (gate, store) = gate_with(3, 1).await;

        let err = gate
            .invoke("grade_essay", "u1", |_| async {
                Err::<(), _>(anyhow::anyhow!("model unavailable"))
            })
            .await
            .unwrap_err();

        match err {
            GateError::Handler(e) => assert_eq!(e.to_string(), "model unavailable"),
            other => panic!("expected handler error, got {:?}", other),
        }
        assert_eq!(points(&store).await, Points { tickets: 3, diamonds: 1 });
    }

    #[tokio::test]
    async fn test_refund_can_be_disabled() {
        let (gate, store) = gate_with(3, 1).await;
        let gate = gate.with_refund_on_failure(false);

        let _ = gate
            .invoke("deeply_research", "u1", |_| async {
                Err::<(), _>(anyhow::anyhow!("boom"))
            })
            .await;

        assert_eq!(points(&store).await, Points { tickets: 3, diamonds: 0 });
    }

    #[tokio::test]
    async fn test_denial_does_not_run_handler() {
        let (gate, store) = gate_with(3, 0).await;
        let mut ran = false;

        let err = gate
            .invoke("predicted_test", "u1", |_| {
                ran = true;
                async { Ok::<_, anyhow::Error>(()) }
            })
            .await
            .unwrap_err();

        assert!(!ran);
        match err {
            GateError::Rejected(AppError::InsufficientBalance(denied)) => {
                assert_eq!(denied.point_type, PointType::Diamond);
                assert_eq!(denied.cost, 1);
                assert_eq!(denied.current_balance, Points { tickets: 3, diamonds: 0 });
            }
            other => panic!("expected denial, got {:?}", other),
        }
        assert_eq!(points(&store).await, Points { tickets: 3, diamonds: 0 });
    }

    #[tokio::test]
    async fn test_unknown_feature() {
        let (gate, _) = gate_with(3, 1).await;
        let err = gate
            .invoke("summon_dragon", "u1", |_| async { Ok::<_, anyhow::Error>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Rejected(AppError::UnknownFeature(_))));
    }

    #[tokio::test]
    async fn test_timeout_is_refunded() {
        let (gate, store) = gate_with(1, 0).await;
        let gate = gate.with_handler_timeout(Some(Duration::from_millis(20)));

        let err = gate
            .invoke("find_video", "u1", |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, anyhow::Error>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, GateError::TimedOut(_)));
        assert_eq!(points(&store).await, Points { tickets: 1, diamonds: 0 });
    }

    #[tokio::test]
    async fn test_cancelled_request_is_refunded() {
        let (gate, store) = gate_with(2, 0).await;
        let gate = Arc::new(gate);
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let task = tokio::spawn({
            let gate = gate.clone();
            async move {
                gate.invoke("teach_me_this", "u1", |_| async move {
                    let _ = started_tx.send(());
                    std::future::pending::<Result<(), anyhow::Error>>().await
                })
                .await
            }
        });

        started_rx.await.unwrap();
        assert_eq!(points(&store).await.tickets, 1);

        task.abort();
        let _ = task.await;

        for _ in 0..50 {
            if points(&store).await.tickets == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cancelled run was not refunded");
    }

    #[tokio::test]
    async fn test_request_cancelled_during_refund_is_still_refunded() {
        let inner = seeded_store(3, 0).await;
        let gate = gate_over(Arc::new(SlowRefundStore {
            inner: inner.clone(),
            writes: AtomicUsize::new(0),
        }));

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            gate.invoke("teach_me_this", "u1", |_| async {
                Err::<(), _>(anyhow::anyhow!("model unavailable"))
            }),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(points(&inner).await.tickets, 2);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(points(&inner).await, Points { tickets: 3, diamonds: 0 });
    }
}
