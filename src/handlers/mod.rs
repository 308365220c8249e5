use std::sync::Arc;

use crate::{
    auth::JwtService,
    config::Config,
    errors::Result,
    models::Points,
    services::{
        clock::{Clock, SystemClock},
        feature_gate::FeatureGate,
        feature_handler::{FeatureHandler, UnavailableFeatureHandler, UpstreamFeatureHandler},
        metrics::MetricsService,
        quota_ledger::{QuotaLedger, RetryPolicy},
    },
    storage::{create_store, BalanceStore},
};

pub mod accounts;
pub mod features;
pub mod health;
pub mod metrics;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: Arc<QuotaLedger>,
    pub gate: Arc<FeatureGate>,
    pub features: Arc<dyn FeatureHandler>,
    pub metrics: Arc<MetricsService>,
    pub jwt: JwtService,
}

impl AppState {
    /// Connects the configured store and wires everything on the wall clock.
    pub async fn from_config(config: Config) -> Result<Self> {
        let store = create_store(&config).await?;

        let features: Arc<dyn FeatureHandler> = match &config.feature_upstream_url {
            Some(url) => {
                tracing::info!(%url, "Forwarding features to upstream service");
                Arc::new(UpstreamFeatureHandler::new(url, config.handler_timeout)?)
            }
            None => {
                tracing::warn!("FEATURE_UPSTREAM_URL not set; every feature call will be refunded and fail");
                Arc::new(UnavailableFeatureHandler)
            }
        };

        Self::new(config, store, Arc::new(SystemClock), features)
    }

    pub fn new(
        config: Config,
        store: Arc<dyn BalanceStore>,
        clock: Arc<dyn Clock>,
        features: Arc<dyn FeatureHandler>,
    ) -> Result<Self> {
        let metrics = Arc::new(MetricsService::new()?);

        let ledger = Arc::new(
            QuotaLedger::new(store, clock, config.replenishment_policy())
                .with_retry(RetryPolicy {
                    max_attempts: config.store_max_attempts,
                    base_delay: config.store_retry_base,
                })
                .with_initial_points(Points {
                    tickets: config.initial_tickets,
                    diamonds: config.initial_diamonds,
                })
                .with_metrics(metrics.clone()),
        );

        let gate = Arc::new(
            FeatureGate::new(ledger.clone(), config.feature_catalog.clone())
                .with_refund_on_failure(config.refund_on_failure)
                .with_handler_timeout(config.handler_timeout)
                .with_metrics(metrics.clone()),
        );

        let jwt = JwtService::new(&config.jwt_secret);

        Ok(Self {
            config: Arc::new(config),
            ledger,
            gate,
            features,
            metrics,
            jwt,
        })
    }
}
