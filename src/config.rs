use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use serde::Deserialize;

use crate::{
    errors::{AppError, Result},
    models::{FeatureCatalog, FeatureCost},
    services::replenishment::{ReplenishMode, ReplenishmentPolicy, ReplenishmentRule},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
    Redis,
}

impl FromStr for StoreBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(AppError::Config(format!("Unsupported store backend: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub store_backend: StoreBackend,
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub allowed_origins: Vec<String>,
    pub default_timezone: Tz,
    pub initial_tickets: u32,
    pub initial_diamonds: u32,
    pub daily_ticket_grant: u32,
    pub monthly_diamond_grant: u32,
    pub ticket_replenish_mode: ReplenishMode,
    pub diamond_replenish_mode: ReplenishMode,
    pub diamond_rollover_cap: Option<u32>,
    pub store_max_attempts: u32,
    pub store_retry_base: Duration,
    pub refund_on_failure: bool,
    pub handler_timeout: Option<Duration>,
    pub feature_upstream_url: Option<String>,
    pub feature_catalog: FeatureCatalog,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3000,
            store_backend: StoreBackend::Memory,
            database_url: "postgresql://localhost/qdeli".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            jwt_secret: "your-secret-key".to_string(),
            allowed_origins: vec!["http://localhost:3000".to_string()],
            default_timezone: Tz::UTC,
            initial_tickets: 15,
            initial_diamonds: 5,
            daily_ticket_grant: 15,
            monthly_diamond_grant: 5,
            ticket_replenish_mode: ReplenishMode::Additive,
            diamond_replenish_mode: ReplenishMode::Additive,
            diamond_rollover_cap: None,
            store_max_attempts: 3,
            store_retry_base: Duration::from_millis(10),
            refund_on_failure: true,
            handler_timeout: Some(Duration::from_secs(60)),
            feature_upstream_url: None,
            feature_catalog: FeatureCatalog::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let feature_catalog = match env::var("FEATURE_CATALOG_PATH") {
            Ok(path) => load_feature_catalog(&path)?,
            Err(_) => defaults.feature_catalog.clone(),
        };

        let handler_timeout_secs: u64 = parse_var("HANDLER_TIMEOUT_SECS", 60)?;

        Ok(Config {
            port: parse_var("PORT", defaults.port)?,
            store_backend: env::var("STORE_BACKEND")
                .unwrap_or_else(|_| "memory".to_string())
                .parse()?,
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            jwt_secret: env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            default_timezone: parse_timezone(
                &env::var("DEFAULT_TIMEZONE").unwrap_or_else(|_| "UTC".to_string()),
            )?,
            initial_tickets: parse_var("INITIAL_TICKETS", defaults.initial_tickets)?,
            initial_diamonds: parse_var("INITIAL_DIAMONDS", defaults.initial_diamonds)?,
            daily_ticket_grant: parse_var("DAILY_TICKET_GRANT", defaults.daily_ticket_grant)?,
            monthly_diamond_grant: parse_var(
                "MONTHLY_DIAMOND_GRANT",
                defaults.monthly_diamond_grant,
            )?,
            ticket_replenish_mode: parse_var("TICKET_REPLENISH_MODE", ReplenishMode::Additive)?,
            diamond_replenish_mode: parse_var("DIAMOND_REPLENISH_MODE", ReplenishMode::Additive)?,
            diamond_rollover_cap: match env::var("DIAMOND_ROLLOVER_CAP") {
                Ok(raw) => Some(raw.trim().parse().map_err(|_| {
                    AppError::Config(format!("Invalid DIAMOND_ROLLOVER_CAP: {}", raw))
                })?),
                Err(_) => None,
            },
            store_max_attempts: parse_var("STORE_MAX_ATTEMPTS", defaults.store_max_attempts)?
                .max(1),
            store_retry_base: Duration::from_millis(parse_var("STORE_RETRY_BASE_MS", 10)?),
            refund_on_failure: parse_var("REFUND_ON_FAILURE", true)?,
            // 0 disables the timeout
            handler_timeout: (handler_timeout_secs > 0)
                .then(|| Duration::from_secs(handler_timeout_secs)),
            feature_upstream_url: env::var("FEATURE_UPSTREAM_URL").ok(),
            feature_catalog,
        })
    }

    pub fn replenishment_policy(&self) -> ReplenishmentPolicy {
        ReplenishmentPolicy::new(
            ReplenishmentRule::daily_tickets(self.daily_ticket_grant)
                .with_mode(self.ticket_replenish_mode),
            ReplenishmentRule::monthly_diamonds(self.monthly_diamond_grant)
                .with_mode(self.diamond_replenish_mode)
                .with_cap(self.diamond_rollover_cap),
        )
    }
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("Invalid value for {}: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| AppError::Config(format!("Unknown timezone: {}", name)))
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    features: HashMap<String, FeatureCost>,
}

/// Reads a feature cost table from a TOML, YAML or JSON file:
///
/// ```toml
/// [features.grade_essay]
/// point_type = "ticket"
/// cost = 1
/// ```
pub fn load_feature_catalog(path: &str) -> Result<FeatureCatalog> {
    let file: CatalogFile = ::config::Config::builder()
        .add_source(::config::File::from(std::path::Path::new(path)))
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| AppError::Config(format!("Failed to load feature catalog {}: {}", path, e)))?;

    FeatureCatalog::new(file.features).map_err(AppError::Config)
}
