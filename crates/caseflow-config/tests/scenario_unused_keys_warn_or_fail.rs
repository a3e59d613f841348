//! Scenario: unused keys warn or fail
//!
//! GREEN when:
//! - Unused keys are reported under Warn without an error.
//! - Unused keys are an error under Fail (CONFIG_UNUSED_KEYS).
//! - Keys under a consumed prefix (e.g. any role under /permissions) are not flagged.
//! - /sync is consumed by the daemon but not by the CLI.

use caseflow_config::{
    load_layered_yaml_from_strings, report_unused_keys, ConfigConsumer, UnusedKeyPolicy,
};

const YAML: &str = r#"
tenant:
  country: "MY"
sync:
  write_timeout_ms: 3000
permissions:
  sales: [complete_case]
  some_new_role: [cancel_case]
legacy:
  b: 2
  a: 1
"#;

#[test]
fn warn_reports_sorted_unused_leaves() {
    let loaded = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let report =
        report_unused_keys(ConfigConsumer::Daemon, &loaded.config_json, UnusedKeyPolicy::Warn)
            .unwrap();

    assert_eq!(
        report.unused_leaf_pointers,
        vec!["/legacy/a".to_string(), "/legacy/b".to_string()]
    );
}

#[test]
fn fail_policy_errors() {
    let loaded = load_layered_yaml_from_strings(&[YAML]).unwrap();
    let err =
        report_unused_keys(ConfigConsumer::Daemon, &loaded.config_json, UnusedKeyPolicy::Fail)
            .unwrap_err();
    assert!(format!("{err:?}").contains("CONFIG_UNUSED_KEYS"));
}

#[test]
fn cli_does_not_consume_sync() {
    let yaml = "tenant:\n  country: MY\nsync:\n  write_timeout_ms: 3000\n";
    let loaded = load_layered_yaml_from_strings(&[yaml]).unwrap();

    let daemon =
        report_unused_keys(ConfigConsumer::Daemon, &loaded.config_json, UnusedKeyPolicy::Warn)
            .unwrap();
    assert!(daemon.is_clean());

    let cli = report_unused_keys(ConfigConsumer::Cli, &loaded.config_json, UnusedKeyPolicy::Warn)
        .unwrap();
    assert_eq!(cli.unused_leaf_pointers, vec!["/sync/write_timeout_ms".to_string()]);
}
