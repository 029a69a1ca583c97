use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result, bail};
use schema::DEFAULT_TICKET_PREFIX;
use store::{CodecKind, HostedConfig, StoreOptions};

const DEFAULT_BIND: &str = "127.0.0.1:3000";
const DEFAULT_DATA_DIR: &str = "./data";

/// Service configuration sourced from environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViabilityConfig {
    pub bind_addr: SocketAddr,
    pub data_dir: PathBuf,
    pub backup_retention: usize,
    pub lock_timeout: Duration,
    pub session_timeout: Duration,
    pub session_sweep_interval: Duration,
    pub codec: CodecKind,
    pub ticket_prefix: String,
    pub hosted: Option<HostedConfig>,
    pub workers: usize,
}

impl Default for ViabilityConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            backup_retention: store::DEFAULT_BACKUP_RETENTION,
            lock_timeout: store::DEFAULT_LOCK_TIMEOUT,
            session_timeout: auth::DEFAULT_INACTIVITY_WINDOW,
            session_sweep_interval: auth::DEFAULT_SWEEP_INTERVAL,
            codec: CodecKind::default(),
            ticket_prefix: DEFAULT_TICKET_PREFIX.to_string(),
            hosted: None,
            workers: 4,
        }
    }
}

impl ViabilityConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let with_fallback = |primary: &str, fallback: &str| lookup(primary).or_else(|| lookup(fallback));

        let bind_addr = lookup("VIABILITY_BIND")
            .unwrap_or_else(|| DEFAULT_BIND.to_string())
            .parse()
            .with_context(|| "parse VIABILITY_BIND")?;
        let data_dir = with_fallback("VIABILITY_DATA_DIR", "DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let backup_retention = positive(
            lookup("VIABILITY_BACKUP_RETENTION"),
            "VIABILITY_BACKUP_RETENTION",
            store::DEFAULT_BACKUP_RETENTION,
        )?;
        let lock_timeout = Duration::from_millis(positive(
            lookup("VIABILITY_LOCK_TIMEOUT_MS"),
            "VIABILITY_LOCK_TIMEOUT_MS",
            store::DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
        )?);
        let session_timeout = Duration::from_secs(positive(
            lookup("VIABILITY_SESSION_TIMEOUT_SECS"),
            "VIABILITY_SESSION_TIMEOUT_SECS",
            auth::DEFAULT_INACTIVITY_WINDOW.as_secs(),
        )?);
        let session_sweep_interval = Duration::from_secs(positive(
            lookup("VIABILITY_SESSION_SWEEP_SECS"),
            "VIABILITY_SESSION_SWEEP_SECS",
            auth::DEFAULT_SWEEP_INTERVAL.as_secs(),
        )?);
        let codec = match lookup("VIABILITY_CODEC") {
            Some(raw) => CodecKind::parse(&raw)
                .with_context(|| format!("parse VIABILITY_CODEC: `{raw}` (expected xlsx or tsv)"))?,
            None => CodecKind::default(),
        };
        let ticket_prefix =
            lookup("VIABILITY_TICKET_PREFIX").unwrap_or_else(|| DEFAULT_TICKET_PREFIX.to_string());
        let workers = positive(lookup("VIABILITY_WORKERS"), "VIABILITY_WORKERS", 4)?;

        let hosted = match (
            with_fallback("VIABILITY_HOSTED_URL", "SUPABASE_URL"),
            with_fallback("VIABILITY_HOSTED_KEY", "SUPABASE_KEY"),
        ) {
            (Some(base_url), Some(api_key)) => Some(HostedConfig {
                base_url,
                api_key,
                timeout: Duration::from_millis(positive(
                    lookup("VIABILITY_HOSTED_TIMEOUT_MS"),
                    "VIABILITY_HOSTED_TIMEOUT_MS",
                    10_000,
                )?),
            }),
            (Some(_), None) => bail!("VIABILITY_HOSTED_KEY is required when VIABILITY_HOSTED_URL is set"),
            (None, Some(_)) => bail!("VIABILITY_HOSTED_URL is required when VIABILITY_HOSTED_KEY is set"),
            (None, None) => None,
        };

        Ok(Self {
            bind_addr,
            data_dir,
            backup_retention,
            lock_timeout,
            session_timeout,
            session_sweep_interval,
            codec,
            ticket_prefix,
            hosted,
            workers,
        })
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            backup_retention: self.backup_retention,
            lock_timeout: self.lock_timeout,
        }
    }
}

fn positive<T>(raw: Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(raw) = raw else {
        return Ok(default);
    };
    let value: T = raw.parse().with_context(|| format!("parse {key}: `{raw}`"))?;
    if value <= T::default() {
        bail!("{key} must be greater than zero");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<ViabilityConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        ViabilityConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config, ViabilityConfig::default());
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.session_timeout, Duration::from_secs(300));
        assert_eq!(config.ticket_prefix, "VI ALA");
        assert!(config.hosted.is_none());
    }

    #[test]
    fn fallback_variables_are_honoured() {
        let config = config_from(&[
            ("DATA_DIR", "/srv/planilhas"),
            ("SUPABASE_URL", "https://example.supabase.co"),
            ("SUPABASE_KEY", "anon"),
            ("VIABILITY_CODEC", "tsv"),
            ("VIABILITY_BACKUP_RETENTION", "3"),
        ])
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/planilhas"));
        assert_eq!(config.codec, CodecKind::Delimited);
        assert_eq!(config.backup_retention, 3);
        let hosted = config.hosted.unwrap();
        assert_eq!(hosted.base_url, "https://example.supabase.co");
        assert_eq!(hosted.timeout, Duration::from_secs(10));

        let config = config_from(&[("DATA_DIR", "/a"), ("VIABILITY_DATA_DIR", "/b")]).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/b"));
    }

    #[test]
    fn invalid_values_are_rejected_with_context() {
        let err = config_from(&[("VIABILITY_LOCK_TIMEOUT_MS", "soon")]).unwrap_err();
        assert!(format!("{err:#}").contains("VIABILITY_LOCK_TIMEOUT_MS"));

        let err = config_from(&[("VIABILITY_BACKUP_RETENTION", "0")]).unwrap_err();
        assert!(err.to_string().contains("greater than zero"));

        assert!(config_from(&[("VIABILITY_CODEC", "csv")]).is_err());
        assert!(config_from(&[("VIABILITY_BIND", "not-an-addr")]).is_err());
        assert!(config_from(&[("VIABILITY_HOSTED_URL", "https://x")]).is_err());
    }
}
