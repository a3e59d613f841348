//! Closed set of case lifecycle states.
//!
//! The transition graph over these states lives in `caseflow-workflow`; this
//! module only owns the values, their wire labels and terminal-ness so every
//! crate that stores a `Case` shares one definition.

use serde::{Deserialize, Serialize};

/// Every state a case can occupy.
///
/// Serialized with the exact labels shown to operators, e.g.
/// `"Pending Delivery (Hospital)"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CaseStatus {
    #[serde(rename = "Case Booked")]
    CaseBooked,
    #[serde(rename = "Order Preparation")]
    OrderPreparation,
    #[serde(rename = "Order Prepared")]
    OrderPrepared,
    #[serde(rename = "Pending Delivery (Hospital)")]
    PendingDeliveryHospital,
    #[serde(rename = "Delivered (Hospital)")]
    DeliveredHospital,
    #[serde(rename = "Case Completed")]
    CaseCompleted,
    #[serde(rename = "Pending Delivery (Office)")]
    PendingDeliveryOffice,
    #[serde(rename = "Delivered (Office)")]
    DeliveredOffice,
    #[serde(rename = "To Be Billed")]
    ToBeBilled,
    /// **Terminal.**
    #[serde(rename = "Case Closed")]
    CaseClosed,
    /// **Terminal.** Side branch reachable from every non-terminal state.
    #[serde(rename = "Case Cancelled")]
    CaseCancelled,
}

impl CaseStatus {
    /// All states in lifecycle order, cancellation last.
    pub const ALL: [CaseStatus; 11] = [
        CaseStatus::CaseBooked,
        CaseStatus::OrderPreparation,
        CaseStatus::OrderPrepared,
        CaseStatus::PendingDeliveryHospital,
        CaseStatus::DeliveredHospital,
        CaseStatus::CaseCompleted,
        CaseStatus::PendingDeliveryOffice,
        CaseStatus::DeliveredOffice,
        CaseStatus::ToBeBilled,
        CaseStatus::CaseClosed,
        CaseStatus::CaseCancelled,
    ];

    /// The unique initial state of every new case.
    pub const INITIAL: CaseStatus = CaseStatus::CaseBooked;

    pub fn label(&self) -> &'static str {
        match self {
            CaseStatus::CaseBooked => "Case Booked",
            CaseStatus::OrderPreparation => "Order Preparation",
            CaseStatus::OrderPrepared => "Order Prepared",
            CaseStatus::PendingDeliveryHospital => "Pending Delivery (Hospital)",
            CaseStatus::DeliveredHospital => "Delivered (Hospital)",
            CaseStatus::CaseCompleted => "Case Completed",
            CaseStatus::PendingDeliveryOffice => "Pending Delivery (Office)",
            CaseStatus::DeliveredOffice => "Delivered (Office)",
            CaseStatus::ToBeBilled => "To Be Billed",
            CaseStatus::CaseClosed => "Case Closed",
            CaseStatus::CaseCancelled => "Case Cancelled",
        }
    }

    /// Parse an operator label. Returns `None` for anything outside the taxonomy;
    /// there is no fallback status.
    pub fn parse(label: &str) -> Option<Self> {
        let wanted = label.trim();
        Self::ALL.into_iter().find(|s| s.label() == wanted)
    }

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CaseStatus::CaseClosed | CaseStatus::CaseCancelled)
    }

    /// States in which business fields may be amended (before dispatch).
    pub fn is_amendable(&self) -> bool {
        matches!(
            self,
            CaseStatus::CaseBooked | CaseStatus::OrderPreparation | CaseStatus::OrderPrepared
        )
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
