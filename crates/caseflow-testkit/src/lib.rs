//! caseflow-testkit
//!
//! Fault injection and fixtures for end-to-end scenarios. Nothing here is
//! linked into the daemon or the CLI.

pub mod faulty;
pub mod fixtures;

pub use faulty::{Fault, FaultyStore, Hold, StoreOp};
pub use fixtures::{
    actor, amendment, client, fast_settings, path_to, seed_case, standard_permissions, tenant,
    transition,
};
