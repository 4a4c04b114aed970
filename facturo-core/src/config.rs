use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;

/// Issuer data and tunables for the fiscal authorization pipeline.
#[derive(Debug, Clone)]
pub struct SriConfig {
    /// 1 = test environment, 2 = production
    pub environment: u8,
    /// Issuer RUC (13 digits)
    pub ruc: String,
    pub legal_name: String,
    pub establishment: String,
    pub emission_point: String,
    pub address: String,
    pub authority_url: String,
    pub timeout: Duration,
    /// Signing key location; absence is reported when the pipeline signs
    pub cert_path: Option<PathBuf>,
    pub cert_valid_until: Option<NaiveDate>,
    /// Delay between authorization polls
    pub poll_delay: Duration,
    pub max_polls: u32,
}

/// Application configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub server_host: String,
    pub server_port: u16,
    /// Prefix of invoice numbers, e.g. `FAC` in `FAC-2026-000042`
    pub invoice_prefix: String,
    pub sequence_lock_timeout: Duration,
    pub default_due_days: i64,
    /// Local hour at which the recurring billing run fires
    pub billing_hour: u32,
    /// Recipient used when a client has no email on file
    pub fallback_recipient: String,
    pub worker_count: usize,
    pub worker_poll_interval: Duration,
    pub job_max_attempts: i32,
    pub job_backoff_base: Duration,
    /// How long a claimed job stays invisible to other workers
    pub job_lease: Duration,
    pub sri: SriConfig,
}

impl Config {
    /// Reads configuration from environment variables, applying defaults.
    ///
    /// Call `dotenv().ok()` first to pick up a local `.env` file.
    pub fn from_env() -> Result<Self, anyhow::Error> {
        let database_url = required("DATABASE_URL")?;
        let fallback_recipient = required("FALLBACK_RECIPIENT")?;

        let billing_hour: u32 = parsed("BILLING_HOUR", 8)?;
        if billing_hour > 23 {
            anyhow::bail!("BILLING_HOUR must be between 0 and 23, got {}", billing_hour);
        }

        let environment: u8 = parsed("SRI_ENVIRONMENT", 1)?;
        if !matches!(environment, 1 | 2) {
            anyhow::bail!("SRI_ENVIRONMENT must be 1 (test) or 2 (production)");
        }

        let cert_valid_until = match std::env::var("SRI_CERT_VALID_UNTIL") {
            Ok(raw) => Some(
                NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
                    .map_err(|e| anyhow::anyhow!("Invalid SRI_CERT_VALID_UNTIL: {}", e))?,
            ),
            Err(_) => None,
        };

        let sri = SriConfig {
            environment,
            ruc: optional("SRI_RUC", ""),
            legal_name: optional("SRI_LEGAL_NAME", ""),
            establishment: optional("SRI_ESTABLISHMENT", "001"),
            emission_point: optional("SRI_EMISSION_POINT", "001"),
            address: optional("SRI_ADDRESS", ""),
            authority_url: optional("SRI_AUTHORITY_URL", "http://localhost:8089"),
            timeout: Duration::from_secs(parsed("SRI_TIMEOUT_SECONDS", 30)?),
            cert_path: std::env::var("SRI_CERT_PATH").ok().map(PathBuf::from),
            cert_valid_until,
            poll_delay: Duration::from_secs(parsed("SRI_POLL_DELAY_SECONDS", 60)?),
            max_polls: parsed("SRI_MAX_POLLS", 10)?,
        };

        Ok(Config {
            database_url,
            database_max_connections: parsed("DATABASE_MAX_CONNECTIONS", 10)?,
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: parsed("SERVER_PORT", 3000)?,
            invoice_prefix: optional("INVOICE_PREFIX", "FAC"),
            sequence_lock_timeout: Duration::from_millis(parsed("SEQUENCE_LOCK_TIMEOUT_MS", 5000)?),
            default_due_days: parsed("DEFAULT_DUE_DAYS", 15)?,
            billing_hour,
            fallback_recipient,
            worker_count: parsed("WORKER_COUNT", 4)?,
            worker_poll_interval: Duration::from_secs(parsed("WORKER_POLL_INTERVAL_SECONDS", 5)?),
            job_max_attempts: parsed("JOB_MAX_ATTEMPTS", 5)?,
            job_backoff_base: Duration::from_secs(parsed("JOB_BACKOFF_BASE_SECONDS", 30)?),
            job_lease: Duration::from_secs(parsed("JOB_LEASE_SECONDS", 300)?),
            sri,
        })
    }
}

fn required(key: &str) -> Result<String, anyhow::Error> {
    std::env::var(key).map_err(|_| anyhow::anyhow!("{} must be set", key))
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parsed<T: FromStr>(key: &str, default: T) -> Result<T, anyhow::Error> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| anyhow::anyhow!("Invalid {}: {}", key, raw)),
        Err(_) => Ok(default),
    }
}
