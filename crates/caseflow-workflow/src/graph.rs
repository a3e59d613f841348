//! Transition graph
//!
//! # Design
//!
//! A pure lookup table over [`CaseStatus`]. There is no hidden state and no
//! runtime mutation: every edge is spelled out in [`successors`], and the
//! match is exhaustive so adding a status without wiring its edges does not
//! compile.
//!
//! ```text
//!  Case Booked ─► Order Preparation ─► Order Prepared ─► Pending Delivery (Hospital)
//!                                                              │
//!  Case Completed ◄──────────────── Delivered (Hospital) ◄─────┘
//!       │
//!       ▼
//!  Pending Delivery (Office) ─► Delivered (Office) ─► To Be Billed ─► Case Closed (term.)
//!
//!  any non-terminal ─► Case Cancelled (term.)
//! ```

use caseflow_schemas::CaseStatus;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// What a role must be allowed to do for an edge (or an amendment) to pass the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    PrepareOrder,
    DispatchOrder,
    ConfirmDelivery,
    CompleteCase,
    ReturnToOffice,
    ReleaseForBilling,
    CloseCase,
    CancelCase,
    AmendCase,
}

impl Capability {
    pub const ALL: [Capability; 9] = [
        Capability::PrepareOrder,
        Capability::DispatchOrder,
        Capability::ConfirmDelivery,
        Capability::CompleteCase,
        Capability::ReturnToOffice,
        Capability::ReleaseForBilling,
        Capability::CloseCase,
        Capability::CancelCase,
        Capability::AmendCase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::PrepareOrder => "prepare_order",
            Capability::DispatchOrder => "dispatch_order",
            Capability::ConfirmDelivery => "confirm_delivery",
            Capability::CompleteCase => "complete_case",
            Capability::ReturnToOffice => "return_to_office",
            Capability::ReleaseForBilling => "release_for_billing",
            Capability::CloseCase => "close_case",
            Capability::CancelCase => "cancel_case",
            Capability::AmendCase => "amend_case",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let wanted = s.trim();
        Self::ALL.into_iter().find(|c| c.as_str() == wanted)
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// One edge of the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transition {
    pub from: CaseStatus,
    pub to: CaseStatus,
    pub required: Capability,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {} ({})", self.from, self.to, self.required)
    }
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Forward successors of `from` (cancellation excluded), paired with the
/// capability each edge requires.
fn forward(from: CaseStatus) -> Option<(CaseStatus, Capability)> {
    use CaseStatus::*;

    match from {
        CaseBooked => Some((OrderPreparation, Capability::PrepareOrder)),
        OrderPreparation => Some((OrderPrepared, Capability::PrepareOrder)),
        OrderPrepared => Some((PendingDeliveryHospital, Capability::DispatchOrder)),
        PendingDeliveryHospital => Some((DeliveredHospital, Capability::ConfirmDelivery)),
        DeliveredHospital => Some((CaseCompleted, Capability::CompleteCase)),
        CaseCompleted => Some((PendingDeliveryOffice, Capability::ReturnToOffice)),
        PendingDeliveryOffice => Some((DeliveredOffice, Capability::ConfirmDelivery)),
        DeliveredOffice => Some((ToBeBilled, Capability::ReleaseForBilling)),
        ToBeBilled => Some((CaseClosed, Capability::CloseCase)),
        CaseClosed | CaseCancelled => None,
    }
}

/// All outgoing edges of `from`. Empty for terminal states.
pub fn successors(from: CaseStatus) -> Vec<Transition> {
    if from.is_terminal() {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(2);
    if let Some((to, required)) = forward(from) {
        out.push(Transition { from, to, required });
    }
    out.push(Transition {
        from,
        to: CaseStatus::CaseCancelled,
        required: Capability::CancelCase,
    });
    out
}

/// The edge `from -> to`, if it literally exists.
pub fn edge(from: CaseStatus, to: CaseStatus) -> Option<Transition> {
    successors(from).into_iter().find(|t| t.to == to)
}

/// `true` only for edges present in the graph. Self-transitions and anything
/// leaving a terminal state are invalid.
pub fn is_valid_transition(from: CaseStatus, to: CaseStatus) -> bool {
    edge(from, to).is_some()
}

/// Every edge in the graph, in lifecycle order.
pub fn all_transitions() -> Vec<Transition> {
    CaseStatus::ALL.into_iter().flat_map(successors).collect()
}
