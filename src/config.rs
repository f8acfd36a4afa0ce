//! Process configuration, read once from `SAMAY_*` environment variables.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// Login name that maps to the built-in admin actor.
    pub admin_user: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    /// The single zone every stored instant is local to.
    pub utc_offset: FixedOffset,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    var: &'static str,
    value: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "samay".into(),
            admin_user: "samay".into(),
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
            utc_offset: Utc.fix(),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Unset variables keep their
    /// defaults; set but unparseable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = lookup("SAMAY_PORT") {
            config.port = parse("SAMAY_PORT", v)?;
        }
        if let Some(v) = lookup("SAMAY_BIND") {
            config.bind = v;
        }
        if let Some(v) = lookup("SAMAY_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SAMAY_PASSWORD") {
            config.password = v;
        }
        if let Some(v) = lookup("SAMAY_ADMIN_USER") {
            config.admin_user = v;
        }
        if let Some(v) = lookup("SAMAY_MAX_CONNECTIONS") {
            config.max_connections = parse("SAMAY_MAX_CONNECTIONS", v)?;
        }
        if let Some(v) = lookup("SAMAY_COMPACT_THRESHOLD") {
            config.compact_threshold = parse("SAMAY_COMPACT_THRESHOLD", v)?;
        }
        if let Some(v) = lookup("SAMAY_SWEEP_INTERVAL_SECS") {
            let secs: u64 = parse("SAMAY_SWEEP_INTERVAL_SECS", v)?;
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(v) = lookup("SAMAY_UTC_OFFSET") {
            config.utc_offset = parse("SAMAY_UTC_OFFSET", v)?;
        }
        if let Some(v) = lookup("SAMAY_METRICS_PORT") {
            config.metrics_port = Some(parse("SAMAY_METRICS_PORT", v)?);
        }
        config.tls_cert = lookup("SAMAY_TLS_CERT");
        config.tls_key = lookup("SAMAY_TLS_KEY");
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError { var, value })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = from(&[]).unwrap();
        assert_eq!(c.port, 5433);
        assert_eq!(c.listen_addr(), "0.0.0.0:5433");
        assert_eq!(c.admin_user, "samay");
        assert_eq!(c.sweep_interval, Duration::from_secs(60));
        assert_eq!(c.utc_offset.local_minus_utc(), 0);
        assert!(c.metrics_port.is_none());
    }

    #[test]
    fn overrides_apply() {
        let c = from(&[
            ("SAMAY_PORT", "6000"),
            ("SAMAY_UTC_OFFSET", "+05:30"),
            ("SAMAY_SWEEP_INTERVAL_SECS", "5"),
            ("SAMAY_METRICS_PORT", "9090"),
        ])
        .unwrap();
        assert_eq!(c.port, 6000);
        assert_eq!(c.utc_offset.local_minus_utc(), 5 * 3600 + 30 * 60);
        assert_eq!(c.sweep_interval, Duration::from_secs(5));
        assert_eq!(c.metrics_port, Some(9090));
    }

    #[test]
    fn garbage_is_an_error() {
        let err = from(&[("SAMAY_PORT", "lots")]).unwrap_err();
        assert!(err.to_string().contains("SAMAY_PORT"));
        assert!(from(&[("SAMAY_UTC_OFFSET", "Mars/Olympus")]).is_err());
    }
}
