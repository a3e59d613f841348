//! Permission gate: consumed interface
//!
//! The engine does not own role definitions. It asks an injected
//! [`PermissionGate`] whether a role may take an edge, synchronously and
//! without side effects. [`CapabilityTable`] is the stock implementation,
//! built from configuration at startup; there is no global lookup.
//!
//! # Contract
//! Fail-closed: any role or capability absent from the table is denied.

use std::collections::{BTreeMap, BTreeSet};

use caseflow_schemas::Role;

use crate::graph::{Capability, Transition};

/// Decides whether a role may perform a transition or amend a case.
///
/// Implementations MUST be pure: same inputs, same answer, no I/O.
pub trait PermissionGate: Send + Sync {
    fn can_perform(&self, role: &Role, transition: &Transition) -> bool;

    /// Amendments are not graph edges; denied unless an implementation says otherwise.
    fn can_amend(&self, _role: &Role) -> bool {
        false
    }
}

impl<G: PermissionGate + ?Sized> PermissionGate for std::sync::Arc<G> {
    fn can_perform(&self, role: &Role, transition: &Transition) -> bool {
        (**self).can_perform(role, transition)
    }

    fn can_amend(&self, role: &Role) -> bool {
        (**self).can_amend(role)
    }
}

/// Role → granted capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityTable {
    grants: BTreeMap<Role, BTreeSet<Capability>>,
}

impl CapabilityTable {
    /// Empty table: denies everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style grant.
    pub fn grant<I>(mut self, role: impl Into<String>, caps: I) -> Self
    where
        I: IntoIterator<Item = Capability>,
    {
        self.insert(Role::new(role), caps);
        self
    }

    pub fn insert<I>(&mut self, role: Role, caps: I)
    where
        I: IntoIterator<Item = Capability>,
    {
        self.grants.entry(role).or_default().extend(caps);
    }

    pub fn allows(&self, role: &Role, cap: Capability) -> bool {
        self.grants
            .get(role)
            .map(|caps| caps.contains(&cap))
            .unwrap_or(false)
    }

    pub fn roles(&self) -> impl Iterator<Item = &Role> {
        self.grants.keys()
    }

    pub fn capabilities_of(&self, role: &Role) -> Vec<Capability> {
        self.grants
            .get(role)
            .map(|caps| caps.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl PermissionGate for CapabilityTable {
    fn can_perform(&self, role: &Role, transition: &Transition) -> bool {
        self.allows(role, transition.required)
    }

    fn can_amend(&self, role: &Role) -> bool {
        self.allows(role, Capability::AmendCase)
    }
}
