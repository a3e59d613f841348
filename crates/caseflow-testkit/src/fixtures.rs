use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use caseflow_isolation::TenantScope;
use caseflow_schemas::{Actor, BusinessFields, Case, CaseId, CaseStatus, NewCase};
use caseflow_store::{RemoteStore, StatusWrite, StoreError};
use caseflow_sync::{SyncCoordinator, SyncSettings};
use caseflow_workflow::{
    successors, AmendmentRequest, Capability, CapabilityTable, TransitionRequest,
};
use uuid::Uuid;

/// The role table shipped in `config/base.yaml`.
pub fn standard_permissions() -> CapabilityTable {
    use Capability::*;
    CapabilityTable::new()
        .grant("booking", [CancelCase, AmendCase])
        .grant("operations", [PrepareOrder, DispatchOrder, ReturnToOffice])
        .grant("driver", [ConfirmDelivery])
        .grant("sales", [CompleteCase, AmendCase])
        .grant("manager", Capability::ALL)
}

/// Short timeouts so fault scenarios settle quickly (or instantly under a
/// paused clock).
pub fn fast_settings() -> SyncSettings {
    SyncSettings {
        write_timeout: Duration::from_millis(200),
        reconcile_delay: Duration::from_millis(20),
    }
}

pub fn tenant(country: &str) -> Result<TenantScope> {
    TenantScope::new(country).with_context(|| format!("tenant {country}"))
}

pub fn actor(role: &str) -> Actor {
    Actor::new(format!("{role}-1"), role)
}

pub fn transition(to: CaseStatus, role: &str) -> TransitionRequest {
    TransitionRequest::new(to, actor(role))
}

pub fn amendment(role: &str, reason: &str, fields: BusinessFields) -> AmendmentRequest {
    AmendmentRequest::new(actor(role), reason, fields)
}

/// A coordinator for `country` over `store` with the standard table and
/// [`fast_settings`].
pub fn client(store: Arc<dyn RemoteStore>, country: &str) -> Result<SyncCoordinator> {
    Ok(SyncCoordinator::new(
        store,
        Arc::new(standard_permissions()),
        tenant(country)?,
        fast_settings(),
    ))
}

/// Statuses to walk through from the initial one to reach `target`,
/// excluding the initial status itself.
pub fn path_to(target: CaseStatus) -> Vec<CaseStatus> {
    if target == CaseStatus::CaseCancelled {
        return vec![CaseStatus::CaseCancelled];
    }
    let mut path = Vec::new();
    let mut at = CaseStatus::INITIAL;
    while at != target {
        let next = successors(at)
            .into_iter()
            .map(|t| t.to)
            .find(|s| *s != CaseStatus::CaseCancelled);
        match next {
            Some(s) => {
                path.push(s);
                at = s;
            }
            None => break,
        }
    }
    path
}

/// Create `case_id` directly in the store and move it to `status` without
/// writing history.
pub async fn seed_case(
    store: &dyn RemoteStore,
    tenant: &TenantScope,
    case_id: &str,
    status: CaseStatus,
) -> Result<Case, StoreError> {
    let mut case = store
        .create_case(tenant.scope(NewCase {
            case_id: CaseId::new(case_id),
            fields: BusinessFields::new(),
        }))
        .await?;
    for to in path_to(status) {
        case = store
            .write_case_status(tenant.scope(StatusWrite {
                write_id: Uuid::new_v4(),
                case_id: case.case_id.clone(),
                expected: case.status,
                to,
            }))
            .await?;
    }
    Ok(case)
}
