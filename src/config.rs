//! Process configuration, read once from `LABDESK_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::model::{DAY_MS, Ms};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between background compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Lifetime of system-generated notifications.
    pub notification_ttl_days: u32,
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "labdesk".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            notification_ttl_days: 30,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset variables keep their defaults; set but unparsable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        fn parsed<T: std::str::FromStr>(
            var: &'static str,
            raw: Option<String>,
        ) -> Result<Option<T>, ConfigError> {
            match raw {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError { var, value }),
            }
        }

        if let Some(bind) = lookup("LABDESK_BIND") {
            cfg.bind = bind;
        }
        if let Some(port) = parsed("LABDESK_PORT", lookup("LABDESK_PORT"))? {
            cfg.port = port;
        }
        if let Some(dir) = lookup("LABDESK_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Some(password) = lookup("LABDESK_PASSWORD") {
            cfg.password = password;
        }
        if let Some(max) =
            parsed("LABDESK_MAX_CONNECTIONS", lookup("LABDESK_MAX_CONNECTIONS"))?
        {
            cfg.max_connections = max;
        }
        if let Some(threshold) =
            parsed("LABDESK_COMPACT_THRESHOLD", lookup("LABDESK_COMPACT_THRESHOLD"))?
        {
            cfg.compact_threshold = threshold;
        }
        cfg.metrics_port = parsed("LABDESK_METRICS_PORT", lookup("LABDESK_METRICS_PORT"))?;
        cfg.tls_cert = lookup("LABDESK_TLS_CERT").map(PathBuf::from);
        cfg.tls_key = lookup("LABDESK_TLS_KEY").map(PathBuf::from);
        if let Some(days) = parsed(
            "LABDESK_NOTIFICATION_TTL_DAYS",
            lookup("LABDESK_NOTIFICATION_TTL_DAYS"),
        )? {
            cfg.notification_ttl_days = days;
        }
        if let Some(secs) = parsed::<u64>(
            "LABDESK_SWEEP_INTERVAL_SECS",
            lookup("LABDESK_SWEEP_INTERVAL_SECS"),
        )? {
            cfg.sweep_interval = Duration::from_secs(secs.max(1));
        }

        Ok(cfg)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("labdesk.wal")
    }

    pub fn notification_ttl_ms(&self) -> Ms {
        Ms::from(self.notification_ttl_days) * DAY_MS
    }
}
