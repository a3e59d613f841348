//! Typed view over the canonical config JSON.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use caseflow_isolation::TenantScope;
use caseflow_workflow::{Capability, CapabilityTable};
use serde_json::Value;

pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 3_000;
pub const WRITE_TIMEOUT_RANGE_MS: std::ops::RangeInclusive<u64> = 100..=60_000;
pub const DEFAULT_RECONCILE_DELAY_MS: u64 = 250;
const DEFAULT_DEDUPE_WINDOW_MS: u64 = 5_000;

/// Everything the coordinator and the stores need at construction time.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub tenant: TenantScope,
    /// Upper bound on a single write-through round trip.
    pub write_timeout: Duration,
    /// Delay before the background read that settles an unknown outcome.
    pub reconcile_delay: Duration,
    pub dedupe_window: chrono::Duration,
    pub permissions: CapabilityTable,
    /// `None` when no journal is configured.
    pub journal_path: Option<PathBuf>,
    pub journal_hash_chain: bool,
}

impl EngineSettings {
    /// Required: `/tenant/country`. Everything else has a default; an absent
    /// `/permissions` section yields a deny-all table.
    pub fn from_config_json(cfg: &Value) -> Result<Self> {
        let tenant = TenantScope::from_config_json(cfg)?;

        let write_timeout_ms = read_u64(cfg, "/sync/write_timeout_ms")?
            .unwrap_or(DEFAULT_WRITE_TIMEOUT_MS);
        if !WRITE_TIMEOUT_RANGE_MS.contains(&write_timeout_ms) {
            bail!(
                "CONFIG_INVALID sync.write_timeout_ms={} outside {}..={}",
                write_timeout_ms,
                WRITE_TIMEOUT_RANGE_MS.start(),
                WRITE_TIMEOUT_RANGE_MS.end()
            );
        }

        let reconcile_delay_ms = read_u64(cfg, "/sync/reconcile_delay_ms")?
            .unwrap_or(DEFAULT_RECONCILE_DELAY_MS);

        let dedupe_window_ms = read_u64(cfg, "/ledger/dedupe_window_ms")?
            .unwrap_or(DEFAULT_DEDUPE_WINDOW_MS);
        if dedupe_window_ms == 0 {
            bail!("CONFIG_INVALID ledger.dedupe_window_ms must be > 0");
        }
        let dedupe_window = chrono::Duration::milliseconds(
            i64::try_from(dedupe_window_ms).context("ledger.dedupe_window_ms too large")?,
        );

        let permissions = parse_permissions(cfg)?;

        let journal_path = cfg
            .pointer("/ledger/journal_path")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);
        let journal_hash_chain = match cfg.pointer("/ledger/hash_chain") {
            None | Some(Value::Null) => true,
            Some(v) => v
                .as_bool()
                .context("CONFIG_INVALID ledger.hash_chain must be a boolean")?,
        };

        Ok(Self {
            tenant,
            write_timeout: Duration::from_millis(write_timeout_ms),
            reconcile_delay: Duration::from_millis(reconcile_delay_ms),
            dedupe_window,
            permissions,
            journal_path,
            journal_hash_chain,
        })
    }
}

fn read_u64(cfg: &Value, pointer: &str) -> Result<Option<u64>> {
    match cfg.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .with_context(|| format!("CONFIG_INVALID {pointer} must be a non-negative integer")),
    }
}

/// `/permissions/<role>: [capability, ...]`
fn parse_permissions(cfg: &Value) -> Result<CapabilityTable> {
    let mut table = CapabilityTable::new();
    let section = match cfg.pointer("/permissions") {
        None | Some(Value::Null) => return Ok(table),
        Some(Value::Object(map)) => map,
        Some(_) => bail!("CONFIG_INVALID permissions must be a map of role -> [capability]"),
    };

    for (role, caps) in section {
        let list = caps
            .as_array()
            .with_context(|| format!("CONFIG_INVALID permissions.{role} must be a list"))?;
        let mut granted = Vec::with_capacity(list.len());
        for c in list {
            let name = c
                .as_str()
                .with_context(|| format!("CONFIG_INVALID permissions.{role} entries must be strings"))?;
            let cap = Capability::parse(name).with_context(|| {
                format!("CONFIG_UNKNOWN_CAPABILITY permissions.{role}: '{name}'")
            })?;
            granted.push(cap);
        }
        table.insert(caseflow_workflow::Role::new(role.clone()), granted);
    }

    Ok(table)
}
