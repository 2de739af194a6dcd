use anyhow::Result;
use std::path::PathBuf;

/// Runtime configuration for the scheduled assessment command. Everything is
/// environment-driven; `.env` files are loaded by the binary before this runs.
#[derive(Debug, Clone)]
pub struct AssessorConfig {
    pub database_url: String,
    /// Absolute directory holding the assessment program and its inputs.
    pub root: PathBuf,
    /// Executable path relative to `root`.
    pub command: String,
    /// Parameters file path relative to `root`.
    pub parameters: String,
    pub algorithm: String,
    pub version: String,
    /// Assessed duration per diagnosis, in seconds.
    pub duration_seconds: i64,
    /// Minimum spacing from a measurement's previous diagnosis, in seconds.
    pub interval_seconds: i64,
    /// Margin discarded at each edge of the fetch window, in seconds.
    pub cutoff_seconds: i64,
    /// Default lag of the reference time behind wall-clock now, in seconds.
    pub delay_seconds: i64,
    /// Per-assessment deadline in seconds; 0 disables the deadline.
    pub timeout_seconds: u64,
}

impl AssessorConfig {
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database_url: env_required("CTG_DATABASE_URL")?,
            root: PathBuf::from(env_required("CTG_ASSESSMENT_ROOT")?),
            command: env_string("CTG_ASSESSMENT_COMMAND", "CTGRiskAssessmentor"),
            parameters: env_string("CTG_ASSESSMENT_PARAMETERS", "parameter.txt"),
            algorithm: env_required("CTG_ASSESSMENT_ALGORITHM")?,
            version: env_required("CTG_ASSESSMENT_VERSION")?,
            duration_seconds: env_i64("CTG_ASSESSMENT_DURATION_SECONDS", 1800),
            interval_seconds: env_i64("CTG_ASSESSMENT_INTERVAL_SECONDS", 600),
            cutoff_seconds: env_i64("CTG_ASSESSMENT_CUTOFF_SECONDS", 120),
            delay_seconds: env_i64("CTG_ASSESSMENT_DELAY_SECONDS", 60),
            timeout_seconds: env_u64("CTG_ASSESSMENT_TIMEOUT_SECONDS", 600),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.root.is_absolute() {
            anyhow::bail!(
                "CTG_ASSESSMENT_ROOT must be an absolute path: {}",
                self.root.display()
            );
        }
        if self.command.trim().is_empty() {
            anyhow::bail!("CTG_ASSESSMENT_COMMAND resolved to an empty value");
        }
        if self.duration_seconds <= 0 {
            anyhow::bail!(
                "CTG_ASSESSMENT_DURATION_SECONDS must be positive: {}",
                self.duration_seconds
            );
        }
        if self.interval_seconds < 0 || self.cutoff_seconds < 0 || self.delay_seconds < 0 {
            anyhow::bail!("assessment interval, cutoff and delay must not be negative");
        }
        Ok(())
    }
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow::anyhow!("{key} must be set"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
