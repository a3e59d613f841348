//! Build the daemon's state from loaded configuration.

use std::sync::Arc;

use anyhow::{Context, Result};
use caseflow_config::secrets::{resolve_store_secrets, StoreBackend};
use caseflow_config::{
    report_unused_keys, ConfigConsumer, EngineSettings, LoadedConfig, UnusedKeyPolicy,
};
use caseflow_ledger::LedgerJournal;
use caseflow_store::{MemoryStore, RemoteStore, SystemClock};
use caseflow_sync::{SyncCoordinator, SyncSettings};
use tracing::{info, warn};

use crate::state::AppState;

/// Default layers when `CASEFLOW_CONFIG` is unset.
pub const DEFAULT_CONFIG_LAYERS: &[&str] = &["config/base.yaml", "config/tenant-my.yaml"];

/// `CASEFLOW_CONFIG`: comma-separated YAML layers, later ones override.
pub fn config_paths_from_env() -> Vec<String> {
    match std::env::var("CASEFLOW_CONFIG") {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => DEFAULT_CONFIG_LAYERS.iter().map(|s| s.to_string()).collect(),
    }
}

pub fn sync_settings(settings: &EngineSettings) -> SyncSettings {
    SyncSettings {
        write_timeout: settings.write_timeout,
        reconcile_delay: settings.reconcile_delay,
    }
}

/// Resolve settings and the store backend, then wire the coordinator.
pub async fn state_from_config(loaded: &LoadedConfig) -> Result<AppState> {
    let report = report_unused_keys(
        ConfigConsumer::Daemon,
        &loaded.config_json,
        UnusedKeyPolicy::Warn,
    )?;
    if !report.is_clean() {
        warn!(unused = ?report.unused_leaf_pointers, "config carries keys the daemon never reads");
    }

    let settings = EngineSettings::from_config_json(&loaded.config_json)?;
    let resolved = resolve_store_secrets(&loaded.config_json)?;

    let store: Arc<dyn RemoteStore> = match resolved.backend {
        StoreBackend::Memory => {
            let mut store = MemoryStore::with_clock(Arc::new(SystemClock), settings.dedupe_window);
            if let Some(path) = &settings.journal_path {
                let journal = LedgerJournal::resume(path, settings.journal_hash_chain)
                    .with_context(|| format!("open ledger journal {}", path.display()))?;
                store = store.with_journal(journal);
            }
            Arc::new(store)
        }
        StoreBackend::Postgres => {
            let url = resolved
                .database_url
                .as_deref()
                .context("SECRETS_MISSING: postgres backend without a database url")?;
            let pool = caseflow_db::connect(url).await?;
            Arc::new(caseflow_db::PgStore::connect(pool, settings.dedupe_window).await?)
        }
    };

    let coordinator = SyncCoordinator::new(
        store,
        Arc::new(settings.permissions.clone()),
        settings.tenant.clone(),
        sync_settings(&settings),
    );

    info!(
        country = %settings.tenant.country(),
        backend = resolved.backend.as_str(),
        config_hash = %loaded.config_hash,
        "engine configured"
    );
    Ok(AppState::new(
        coordinator,
        resolved.backend.as_str(),
        Some(loaded.config_hash.clone()),
    ))
}
