use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::config::Config;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;
use crate::reaper;

/// Knobs for the background jobs every tenant gets.
#[derive(Debug, Clone, Copy)]
pub struct TenantSettings {
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    pub utc_offset: FixedOffset,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
            utc_offset: Utc.fix(),
        }
    }
}

impl From<&Config> for TenantSettings {
    fn from(config: &Config) -> Self {
        Self {
            compact_threshold: config.compact_threshold,
            sweep_interval: config.sweep_interval,
            utc_offset: config.utc_offset,
        }
    }
}

/// Manages per-tenant engines. Each tenant gets its own Engine, WAL, absent
/// sweep and compactor. Tenant = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    settings: TenantSettings,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, settings: TenantSettings) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            settings,
        }
    }

    /// Zone that "now" is read in for every tenant.
    pub fn utc_offset(&self) -> FixedOffset {
        self.settings.utc_offset
    }

    /// Get or lazily create an engine for the given tenant.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if let Some(engine) = self.engines.get(tenant) {
            return Ok(engine.value().clone());
        }
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Path traversal guard: the name becomes a file name.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        // Two first connections may race here; the entry API keeps one engine.
        let entry = self.engines.entry(tenant.to_string());
        if let Entry::Occupied(existing) = &entry {
            return Ok(existing.get().clone());
        }

        let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
        let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()))?);

        let settings = self.settings;
        tokio::spawn(reaper::run_absent_sweep(
            engine.clone(),
            settings.sweep_interval,
            settings.utc_offset,
        ));
        tokio::spawn(reaper::run_compactor(engine.clone(), settings.compact_threshold));

        entry.or_insert(engine.clone());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        tracing::info!("tenant {tenant} loaded");
        Ok(engine)
    }
}
