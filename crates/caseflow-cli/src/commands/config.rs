//! `caseflow config-check`: everything the daemon would refuse at startup,
//! without starting it.

use anyhow::{bail, Result};
use caseflow_config::secrets::resolve_store_secrets;
use caseflow_config::{report_unused_keys, ConfigConsumer, EngineSettings, UnusedKeyPolicy};

pub fn check(paths: &[String], strict: bool) -> Result<()> {
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = caseflow_config::load_layered_yaml(&path_refs)?;

    let settings = EngineSettings::from_config_json(&loaded.config_json)?;
    let store = resolve_store_secrets(&loaded.config_json)?;

    println!("config_hash={}", loaded.config_hash);
    println!("country={}", settings.tenant.country());
    println!("store_backend={}", store.backend.as_str());
    println!("write_timeout_ms={}", settings.write_timeout.as_millis());
    println!("reconcile_delay_ms={}", settings.reconcile_delay.as_millis());
    println!(
        "journal_path={}",
        settings
            .journal_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    );
    for role in settings.permissions.roles() {
        let caps: Vec<&str> = settings
            .permissions
            .capabilities_of(role)
            .iter()
            .map(|c| c.as_str())
            .collect();
        println!("role {}={}", role, caps.join(","));
    }

    let report = report_unused_keys(
        ConfigConsumer::Cli,
        &loaded.config_json,
        UnusedKeyPolicy::Warn,
    )?;
    for p in &report.unused_leaf_pointers {
        println!("unused_key={p}");
    }
    if strict && !report.is_clean() {
        bail!(
            "CONFIG_UNUSED_KEYS: {} key(s) nothing reads",
            report.unused_leaf_pointers.len()
        );
    }
    println!("config_ok=true");
    Ok(())
}
