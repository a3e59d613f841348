use anyhow::{Context, Result};
use caseflow_workflow::{all_transitions, successors, Transition};

use super::parse_status;

pub fn edges(from: Option<&str>) -> Result<Vec<Transition>> {
    match from {
        Some(label) => Ok(successors(parse_status(label)?)),
        None => Ok(all_transitions()),
    }
}

pub fn print_graph(from: Option<&str>, json: bool) -> Result<()> {
    let edges = edges(from)?;
    if json {
        let out = serde_json::to_string_pretty(&edges).context("serialize graph")?;
        println!("{out}");
        return Ok(());
    }
    for t in &edges {
        println!("{t}");
    }
    println!("edges={}", edges.len());
    Ok(())
}
