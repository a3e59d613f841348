//! caseflow-config
//!
//! Layered YAML configuration.
//!
//! - Documents are merged in order; later documents override earlier ones.
//! - The merged tree is canonicalised (sorted keys, compact JSON) and hashed
//!   with SHA-256 so two processes can prove they run the same config.
//! - Literal secrets are refused (`CONFIG_SECRET_DETECTED`); config stores env
//!   var NAMES only, see [`secrets`].
//! - Each consumer (daemon, CLI) declares which pointers it reads; anything else
//!   is reported by [`report_unused_keys`].

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;

pub mod secrets;
mod settings;

pub use settings::{
    EngineSettings, DEFAULT_RECONCILE_DELAY_MS, DEFAULT_WRITE_TIMEOUT_MS, WRITE_TIMEOUT_RANGE_MS,
};

/// If any leaf string value starts with one of these we abort with
/// CONFIG_SECRET_DETECTED.
const SECRET_PREFIXES: &[&str] = &[
    "sk-",        // Stripe / OpenAI style
    "sk_live",    // Stripe live
    "sk_test",    // Stripe test
    "AKIA",       // AWS access key ID
    "-----BEGIN", // PEM private keys
    "ghp_",       // GitHub PAT
    "glpat-",     // GitLab PAT
    "xoxb-",      // Slack bot token
    "postgres://",
    "postgresql://",
];

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
}

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let raw =
            fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}"))?;
        docs.push(raw);
    }

    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = serde_json::json!({});
    for (i, raw) in yaml_docs.iter().enumerate() {
        let v_yaml: serde_yaml::Value =
            serde_yaml::from_str(raw).with_context(|| format!("invalid yaml in layer {i}"))?;
        let v_json = serde_json::to_value(v_yaml).context("yaml->json conversion failed")?;
        merged = deep_merge(merged, v_json);
    }

    enforce_no_secret_literals(&merged)?;

    let canonical_json = canonicalize_json(&merged)?;
    let config_hash = sha256_hex(canonical_json.as_bytes());
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
    })
}

/// Objects merge key by key; anything else in `b` replaces `a` wholesale
/// (including arrays, so a later layer can shrink a role's capability list).
fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

fn canonicalize_json(v: &Value) -> Result<String> {
    serde_json::to_string(&sort_keys(v)).context("canonical json serialize failed")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for k in keys {
                out.insert(k.clone(), sort_keys(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn enforce_no_secret_literals(v: &Value) -> Result<()> {
    let mut leaves = Vec::new();
    collect_leaf_pointers(v, "", &mut leaves);

    for ptr in leaves {
        if let Some(s) = v.pointer(&ptr).and_then(Value::as_str) {
            if looks_like_secret(s) {
                bail!("CONFIG_SECRET_DETECTED leaf={} value=REDACTED", ptr);
            }
        }
    }
    Ok(())
}

fn looks_like_secret(s: &str) -> bool {
    let t = s.trim();
    if t.len() < 8 {
        return false;
    }
    SECRET_PREFIXES.iter().any(|p| t.starts_with(p))
}

// ---------------------------------------------------------------------------
// Unused-key guard
// ---------------------------------------------------------------------------

/// Who is reading the config. Each consumer has its own registry of consumed
/// JSON-pointer prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigConsumer {
    Daemon,
    Cli,
}

impl ConfigConsumer {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigConsumer::Daemon => "DAEMON",
            ConfigConsumer::Cli => "CLI",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnusedKeyPolicy {
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnusedKeyReport {
    pub consumer: String,
    /// Consumed prefixes used for this analysis (sorted, unique).
    pub consumed_prefixes: Vec<String>,
    /// Unused leaf pointers (sorted).
    pub unused_leaf_pointers: Vec<String>,
}

impl UnusedKeyReport {
    pub fn is_clean(&self) -> bool {
        self.unused_leaf_pointers.is_empty()
    }
}

/// Pointers each consumer actually reads. Keep this in step with
/// `EngineSettings::from_config_json` and `secrets::resolve_store_secrets`.
pub fn consumed_pointers(consumer: ConfigConsumer) -> &'static [&'static str] {
    match consumer {
        ConfigConsumer::Daemon => &[
            "/tenant/country",
            "/sync/write_timeout_ms",
            "/sync/reconcile_delay_ms",
            "/ledger/dedupe_window_ms",
            "/ledger/journal_path",
            "/ledger/hash_chain",
            "/permissions",
            "/store/backend",
            "/store/database_url_env",
        ],
        // The CLI validates settings and talks to the database; it never runs
        // the coordinator, so /sync is not consumed.
        ConfigConsumer::Cli => &[
            "/tenant/country",
            "/ledger/dedupe_window_ms",
            "/ledger/journal_path",
            "/ledger/hash_chain",
            "/permissions",
            "/store/backend",
            "/store/database_url_env",
        ],
    }
}

/// Produce an unused-key report. With `UnusedKeyPolicy::Fail` an unclean
/// report is an error.
pub fn report_unused_keys(
    consumer: ConfigConsumer,
    config_json: &Value,
    policy: UnusedKeyPolicy,
) -> Result<UnusedKeyReport> {
    let consumed: BTreeSet<String> = consumed_pointers(consumer)
        .iter()
        .map(|p| normalize_pointer(p))
        .collect();
    let consumed_prefixes: Vec<String> = consumed.into_iter().collect();

    let mut leaves: Vec<String> = Vec::new();
    collect_leaf_pointers(config_json, "", &mut leaves);

    let mut unused: Vec<String> = leaves
        .into_iter()
        .filter(|lp| !consumed_prefixes.iter().any(|cp| is_prefix_pointer(cp, lp)))
        .collect();
    unused.sort();
    unused.dedup();

    let report = UnusedKeyReport {
        consumer: consumer.as_str().to_string(),
        consumed_prefixes,
        unused_leaf_pointers: unused,
    };

    if policy == UnusedKeyPolicy::Fail && !report.is_clean() {
        bail!(
            "CONFIG_UNUSED_KEYS (consumer={}): {} unused config leaf key(s) detected. \
            Remove them or update the consumed registry. First few: {}",
            report.consumer,
            report.unused_leaf_pointers.len(),
            preview_list(&report.unused_leaf_pointers, 12)
        );
    }

    Ok(report)
}

fn normalize_pointer(p: &str) -> String {
    let mut s = p.trim().to_string();
    if s.is_empty() {
        return "/".to_string();
    }
    if !s.starts_with('/') {
        s.insert(0, '/');
    }
    while s.ends_with('/') && s.len() > 1 {
        s.pop();
    }
    s
}

/// "/a/b" consumes "/a/b" and "/a/b/c" but NOT "/a/bc"; "/" consumes everything.
fn is_prefix_pointer(prefix: &str, leaf: &str) -> bool {
    if prefix == "/" || leaf == prefix {
        return true;
    }
    leaf.strip_prefix(prefix)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

fn collect_leaf_pointers(v: &Value, prefix: &str, out: &mut Vec<String>) {
    match v {
        Value::Object(map) => {
            for (k, vv) in map.iter() {
                let next = format!("{}/{}", prefix, escape_pointer_token(k));
                collect_leaf_pointers(vv, &next, out);
            }
        }
        Value::Array(arr) => {
            for (i, vv) in arr.iter().enumerate() {
                let next = format!("{}/{}", prefix, i);
                collect_leaf_pointers(vv, &next, out);
            }
        }
        _ => {
            let p = if prefix.is_empty() {
                "/".to_string()
            } else {
                prefix.to_string()
            };
            out.push(p);
        }
    }
}

fn escape_pointer_token(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

fn preview_list(items: &[String], n: usize) -> String {
    let take = items.iter().take(n).cloned().collect::<Vec<_>>();
    format!("{:?}", take)
}
