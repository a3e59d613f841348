//! Command handler modules for caseflow-cli.
//!
//! Shared utilities used by multiple command paths live here.
//! Command-specific logic lives in the submodules.

pub mod config;
pub mod graph;
pub mod journal;

use anyhow::Result;
use caseflow_schemas::CaseStatus;

/// Parse an operator status label, listing the accepted labels on failure.
pub fn parse_status(label: &str) -> Result<CaseStatus> {
    CaseStatus::parse(label.trim()).ok_or_else(|| {
        let known: Vec<&str> = CaseStatus::ALL.iter().map(|s| s.label()).collect();
        anyhow::anyhow!(
            "unknown status '{}'. expected one of: {}",
            label,
            known.join(" | ")
        )
    })
}
