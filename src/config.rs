use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use tracing::info;
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_DB_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_TOP_DRIFT_LIMIT: u64 = 25;
const DEFAULT_MAX_AUDIT_ROWS: u64 = 10_000;
const DEFAULT_RECONCILE_BATCH_LIMIT: u64 = 200;
const DEFAULT_CURRENCY_SCALE: u32 = 2;

/// Thresholds consumed by the integrity auditor and the reconciler.
///
/// This is deliberately a closed set of typed fields rather than an open
/// key/value bag: the only consumers need specific numeric knobs.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct EngineThresholds {
    /// Absolute value drift (per position) tolerated before the auditor
    /// reports an inventory_value_mismatch finding.
    #[serde(default = "default_value_drift_tolerance")]
    pub value_drift_tolerance: Decimal,

    /// Per-position drift above which soft drift stops being amber and the
    /// whole summary grades red.
    #[serde(default = "default_amber_drift_ceiling")]
    pub amber_drift_ceiling: Decimal,

    /// Number of worst-drifted positions the audit summary lists.
    #[serde(default = "default_top_drift_limit")]
    pub top_drift_limit: u64,

    /// Hard cap on positions scanned by one audit call. Audits over larger
    /// datasets page through repeated calls instead of one unbounded scan.
    #[serde(default = "default_max_audit_rows")]
    pub max_audit_rows: u64,

    /// Maximum flagged positions one reconcile pass will touch.
    #[serde(default = "default_reconcile_batch_limit")]
    pub reconcile_batch_limit: u64,

    /// Minor-unit scale of the ledger currency (2 for cents).
    #[serde(default = "default_currency_scale")]
    pub currency_scale: u32,
}

impl Default for EngineThresholds {
    fn default() -> Self {
        Self {
            value_drift_tolerance: default_value_drift_tolerance(),
            amber_drift_ceiling: default_amber_drift_ceiling(),
            top_drift_limit: DEFAULT_TOP_DRIFT_LIMIT,
            max_audit_rows: DEFAULT_MAX_AUDIT_ROWS,
            reconcile_batch_limit: DEFAULT_RECONCILE_BATCH_LIMIT,
            currency_scale: DEFAULT_CURRENCY_SCALE,
        }
    }
}

fn default_value_drift_tolerance() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_amber_drift_ceiling() -> Decimal {
    Decimal::new(10_000, 2) // 100.00
}

fn default_top_drift_limit() -> u64 {
    DEFAULT_TOP_DRIFT_LIMIT
}

fn default_max_audit_rows() -> u64 {
    DEFAULT_MAX_AUDIT_ROWS
}

fn default_reconcile_batch_limit() -> u64 {
    DEFAULT_RECONCILE_BATCH_LIMIT
}

fn default_currency_scale() -> u32 {
    DEFAULT_CURRENCY_SCALE
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Application environment
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB pool: connect timeout in seconds
    #[serde(default = "default_db_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    /// DB pool: acquire timeout in seconds
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// DB pool: idle timeout in seconds
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    /// Auditor / reconciler thresholds
    #[serde(default)]
    #[validate]
    pub thresholds: EngineThresholds,
}

fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    DEFAULT_DB_MAX_CONNECTIONS
}

fn default_db_min_connections() -> u32 {
    DEFAULT_DB_MIN_CONNECTIONS
}

fn default_db_timeout_secs() -> u64 {
    30
}

fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_db_idle_timeout_secs() -> u64 {
    600
}

impl AppConfig {
    /// Programmatic constructor used by tests and embedding applications.
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            db_min_connections: DEFAULT_DB_MIN_CONNECTIONS,
            db_connect_timeout_secs: default_db_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            thresholds: EngineThresholds::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}

/// Loads configuration from layered sources.
///
/// Order of precedence (later wins): `config/default.toml`, then
/// `config/{environment}.toml` if present, then `APP__`-prefixed environment
/// variables (e.g. `APP__DATABASE_URL`, `APP__THRESHOLDS__TOP_DRIFT_LIMIT`).
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let mut builder = Config::builder();

    let default_path = Path::new(CONFIG_DIR).join("default.toml");
    if default_path.exists() {
        builder = builder.add_source(File::from(default_path));
    }

    let env_path = Path::new(CONFIG_DIR).join(format!("{environment}.toml"));
    if env_path.exists() {
        builder = builder.add_source(File::from(env_path));
    }

    let settings = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .set_default("environment", environment.clone())?
        .build()?;

    let config: AppConfig = settings.try_deserialize()?;

    config
        .validate()
        .map_err(|e| ConfigError::Message(format!("invalid configuration: {e}")))?;

    info!(
        environment = %config.environment,
        max_connections = config.db_max_connections,
        "configuration loaded"
    );

    Ok(config)
}

/// Initializes the global tracing subscriber. `RUST_LOG` overrides the
/// configured level; `json` switches the fmt layer to structured output.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_directive = format!("costledger={level}");
    let filter_directive = std::env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);
    let filter = EnvFilter::try_new(filter_directive)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn thresholds_default_to_documented_values() {
        let t = EngineThresholds::default();
        assert_eq!(t.value_drift_tolerance, dec!(0.01));
        assert_eq!(t.amber_drift_ceiling, dec!(100.00));
        assert_eq!(t.top_drift_limit, 25);
        assert_eq!(t.currency_scale, 2);
    }

    #[test]
    fn programmatic_config_is_valid() {
        let cfg = AppConfig::new("sqlite::memory:".into(), "test".into());
        assert!(cfg.validate().is_ok());
        assert!(!cfg.is_production());
    }
}
