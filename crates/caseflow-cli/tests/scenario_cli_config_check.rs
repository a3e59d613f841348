//! Scenario: config-check catches what the daemon would refuse
//!
//! GREEN when:
//! - The shipped base + tenant layers validate and print the resolved tenant.
//! - Keys the CLI never reads are listed; `--strict` turns them into a failure.
//! - A postgres tenant layer without its URL variable fails naming the variable.
//! - `config-hash` is stable across invocations.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::PathBuf;

fn config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
        .join("config")
}

fn layer(name: &str) -> String {
    config_dir().join(name).to_string_lossy().to_string()
}

#[test]
fn shipped_layers_validate() {
    Command::cargo_bin("caseflow")
        .unwrap()
        .env_remove("CASEFLOW_DATABASE_URL")
        .args(["config-check", &layer("base.yaml"), &layer("tenant-my.yaml")])
        .assert()
        .success()
        .stdout(predicate::str::contains("country=MY"))
        .stdout(predicate::str::contains("store_backend=memory"))
        .stdout(predicate::str::contains("role operations=prepare_order,dispatch_order,return_to_office"))
        .stdout(predicate::str::contains("unused_key=/sync/write_timeout_ms"))
        .stdout(predicate::str::contains("config_ok=true"));
}

#[test]
fn strict_fails_on_unused_keys() {
    Command::cargo_bin("caseflow")
        .unwrap()
        .env_remove("CASEFLOW_DATABASE_URL")
        .args([
            "config-check",
            "--strict",
            &layer("base.yaml"),
            &layer("tenant-my.yaml"),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("CONFIG_UNUSED_KEYS"));
}

#[test]
fn postgres_tenant_without_url_names_the_variable() {
    Command::cargo_bin("caseflow")
        .unwrap()
        .env_remove("CASEFLOW_DATABASE_URL")
        .args(["config-check", &layer("base.yaml"), &layer("tenant-sg.yaml")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("SECRETS_MISSING"))
        .stderr(predicate::str::contains("CASEFLOW_DATABASE_URL"));
}

#[test]
fn config_hash_is_stable() {
    let run = || {
        let out = Command::cargo_bin("caseflow")
            .unwrap()
            .args(["config-hash", &layer("base.yaml"), &layer("tenant-my.yaml")])
            .output()
            .unwrap();
        assert!(out.status.success());
        String::from_utf8(out.stdout).unwrap()
    };
    let first = run();
    assert!(first.starts_with("config_hash="));
    assert_eq!(first, run());
}
