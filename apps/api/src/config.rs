use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::matcher::MatchWeights;
use crate::queue::{QueueConfig, ScalingConfig};

/// Application configuration loaded from environment variables.
/// Required variables fail fast at startup; tuning knobs have defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub qdrant_url: String,
    pub s3_bucket: String,
    pub s3_endpoint: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub anthropic_api_key: String,
    pub embedder_url: String,
    pub embedder_model: String,
    pub embedder_api_key: Option<String>,
    pub port: u16,
    pub rust_log: String,
    /// Holds the poller lock and the processed-message set.
    pub data_dir: PathBuf,
    pub match_weights: MatchWeights,
    /// Raw JSON override for the category incompatibility table.
    pub category_incompatible: Option<String>,
    pub match_timeout: Duration,
    pub queue: QueueConfig,
    pub scaling: ScalingConfig,
    pub mail: Option<MailSettings>,
}

/// Mailbox polling settings; the poller is disabled when IMAP_HOST is
/// unset.
#[derive(Debug, Clone)]
pub struct MailSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub folder: String,
    pub poll_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let match_weights = MatchWeights {
            skills: parse_env("MATCH_WEIGHT_SKILLS", 0.50)?,
            responsibilities: parse_env("MATCH_WEIGHT_RESPONSIBILITIES", 0.20)?,
            title: parse_env("MATCH_WEIGHT_TITLE", 0.20)?,
            experience: parse_env("MATCH_WEIGHT_EXPERIENCE", 0.10)?,
            version: std::env::var("WEIGHTS_VERSION").unwrap_or_else(|_| "w1".to_string()),
        };
        validate_weights(&match_weights)?;

        let queue = QueueConfig {
            qmax: parse_env("QUEUE_QMAX", 5000)?,
            idem_window: Duration::from_secs(parse_env("QUEUE_IDEM_WINDOW_SECS", 86_400u64)?),
            max_attempts: parse_env("QUEUE_MAX_ATTEMPTS", 3)?,
            aging_step: Duration::from_secs(parse_env("QUEUE_AGING_STEP_SECS", 60u64)?),
        };

        let scaling = ScalingConfig {
            wmin: parse_env("WORKERS_MIN", 8)?,
            wmax: parse_env("WORKERS_MAX", 64)?,
            qhi: parse_env("QUEUE_DEPTH_HIGH", 2000)?,
            qlo: parse_env("QUEUE_DEPTH_LOW", 200)?,
            mhi_pct: parse_env("MEMORY_HIGH_PCT", 80.0)?,
            chi_pct: parse_env("CPU_HIGH_PCT", 85.0)?,
            sample_period: Duration::from_secs(parse_env("SUPERVISOR_SAMPLE_SECS", 2u64)?),
            idle_scale_down: Duration::from_secs(parse_env("IDLE_SCALE_DOWN_SECS", 30u64)?),
        };

        let mail = match std::env::var("IMAP_HOST") {
            Ok(host) => Some(MailSettings {
                host,
                port: parse_env("IMAP_PORT", 993)?,
                username: require_env("IMAP_USERNAME")?,
                password: require_env("IMAP_PASSWORD")?,
                folder: std::env::var("IMAP_FOLDER").unwrap_or_else(|_| "INBOX".to_string()),
                poll_interval: Duration::from_secs(parse_env(
                    "MAIL_POLL_INTERVAL_SECS",
                    300u64,
                )?),
            }),
            Err(_) => None,
        };

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            qdrant_url: require_env("QDRANT_URL")?,
            s3_bucket: require_env("S3_BUCKET")?,
            s3_endpoint: require_env("S3_ENDPOINT")?,
            aws_access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            anthropic_api_key: require_env("ANTHROPIC_API_KEY")?,
            embedder_url: require_env("EMBEDDER_URL")?,
            embedder_model: std::env::var("EMBEDDER_MODEL")
                .unwrap_or_else(|_| "text-embedding-3-small-768".to_string()),
            embedder_api_key: std::env::var("EMBEDDER_API_KEY").ok(),
            port: parse_env("PORT", 8080u16)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            data_dir: PathBuf::from(
                std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
            ),
            match_weights,
            category_incompatible: std::env::var("CATEGORY_INCOMPATIBLE").ok(),
            match_timeout: Duration::from_secs(parse_env("MATCH_TIMEOUT_SECS", 5u64)?),
            queue,
            scaling,
            mail,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("'{key}' must parse as {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

fn validate_weights(weights: &MatchWeights) -> Result<()> {
    let sum = weights.skills + weights.responsibilities + weights.title + weights.experience;
    anyhow::ensure!(
        sum > 0.0,
        "match weights must sum to a positive value, got {sum}"
    );
    for (name, w) in [
        ("skills", weights.skills),
        ("responsibilities", weights.responsibilities),
        ("title", weights.title),
        ("experience", weights.experience),
    ] {
        anyhow::ensure!(w >= 0.0, "match weight '{name}' must be non-negative");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_pass_validation() {
        assert!(validate_weights(&MatchWeights::default()).is_ok());
    }

    #[test]
    fn test_zero_sum_weights_rejected() {
        let weights = MatchWeights {
            skills: 0.0,
            responsibilities: 0.0,
            title: 0.0,
            experience: 0.0,
            version: "w0".into(),
        };
        assert!(validate_weights(&weights).is_err());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let weights = MatchWeights {
            skills: -0.1,
            responsibilities: 0.5,
            title: 0.4,
            experience: 0.2,
            version: "w0".into(),
        };
        assert!(validate_weights(&weights).is_err());
    }
}
