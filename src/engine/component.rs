use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::chain::{decide, initial_stage, Step};
use super::{check_len, now_ms, Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemSpec {
    pub component_id: Ulid,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRequestSpec {
    pub id: Ulid,
    pub requester: Actor,
    pub supervisor: Option<String>,
    pub lab_id: Ulid,
    pub items: Vec<ItemSpec>,
    pub purpose: String,
    pub due_on: Option<NaiveDate>,
}

/// A component the lab cannot currently cover. Advisory at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shortfall {
    pub component_id: Ulid,
    pub requested: u32,
    pub available: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentReceipt {
    pub id: Ulid,
    pub status: ComponentStatus,
    pub shortfalls: Vec<Shortfall>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActComponentRequest {
    pub request_id: Ulid,
    pub actor: Actor,
    pub decision: Decision,
    pub remarks: Option<String>,
    pub idempotency_key: Option<Ulid>,
}

impl ActComponentRequest {
    pub fn approve(request_id: Ulid, actor: Actor) -> Self {
        Self {
            request_id,
            actor,
            decision: Decision::Approve,
            remarks: None,
            idempotency_key: None,
        }
    }

    pub fn reject(request_id: Ulid, actor: Actor, remarks: impl Into<String>) -> Self {
        Self {
            decision: Decision::Reject,
            remarks: Some(remarks.into()),
            ..Self::approve(request_id, actor)
        }
    }

    pub fn with_key(mut self, key: Ulid) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

type LockedComponents = Vec<(Ulid, OwnedMutexGuard<Component>)>;

fn shortfalls(demand: &BTreeMap<Ulid, u32>, locked: &LockedComponents) -> Vec<Shortfall> {
    locked
        .iter()
        .filter_map(|(id, c)| {
            let requested = demand.get(id).copied().unwrap_or(0);
            (requested > c.quantity_available).then_some(Shortfall {
                component_id: *id,
                requested,
                available: c.quantity_available,
            })
        })
        .collect()
}

/// Fails on the first component (in id order) that cannot cover its demand.
fn check_inventory(demand: &BTreeMap<Ulid, u32>, locked: &LockedComponents) -> Result<(), EngineError> {
    match shortfalls(demand, locked).into_iter().next() {
        Some(s) => Err(EngineError::InsufficientInventory {
            component_id: s.component_id,
            requested: s.requested,
            available: s.available,
        }),
        None => Ok(()),
    }
}

fn wrong_status(status: ComponentStatus, id: Ulid, detail: &str) -> EngineError {
    if status.is_terminal() {
        EngineError::AlreadyTerminal(id)
    } else {
        EngineError::InvalidTransition {
            status: status.as_str(),
            detail: detail.to_string(),
        }
    }
}

fn require_role(status: ComponentStatus, actor: &Actor, role: Role) -> Result<(), EngineError> {
    if actor.role != role {
        return Err(EngineError::InvalidTransition {
            status: status.as_str(),
            detail: format!("requires {}, got {}", role.as_str(), actor.role.as_str()),
        });
    }
    Ok(())
}

impl Engine {
    /// Component rows locked in id order.
    async fn lock_components(
        &self,
        ids: impl IntoIterator<Item = Ulid>,
    ) -> Result<LockedComponents, EngineError> {
        let ids: BTreeSet<Ulid> = ids.into_iter().collect();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let c = self.get_component_state(&id).ok_or(EngineError::NotFound(id))?;
            guards.push((id, c.lock_owned().await));
        }
        Ok(guards)
    }

    /// Log and apply a status change, moving stock on the locked components.
    async fn commit_component(
        &self,
        request: &mut ComponentRequest,
        to: ComponentStatus,
        decision: StageDecision,
        idempotency_key: Option<Ulid>,
        locked: &mut LockedComponents,
    ) -> Result<(), EngineError> {
        self.wal_append(&Event::ComponentTransitioned {
            request_id: request.id,
            to,
            decision: decision.clone(),
            idempotency_key,
        })
        .await?;
        let from = request.status;
        for (component_id, delta) in request.apply_transition(to, &decision, idempotency_key) {
            if let Some((_, c)) = locked.iter_mut().find(|(id, _)| *id == component_id)
                && !c.apply_delta(delta)
            {
                warn!(
                    "stock of component {component_id} clamped to {} after {delta:+} from request {}",
                    c.quantity_available, request.id
                );
            }
        }
        metrics::counter!(observability::TRANSITIONS_TOTAL, "kind" => "component", "to" => to.as_str())
            .increment(1);
        info!(
            "component request {} {} -> {} by {}",
            request.id,
            from,
            to,
            decision.actor.role.as_str()
        );
        Ok(())
    }

    pub async fn create_component_request(
        &self,
        spec: ComponentRequestSpec,
    ) -> Result<ComponentReceipt, EngineError> {
        check_len(&spec.purpose, MAX_PURPOSE_LEN, "purpose too long")?;
        if spec.items.is_empty() {
            return Err(EngineError::LimitExceeded("component request names no item"));
        }
        if spec.items.len() > MAX_ITEMS_PER_REQUEST {
            return Err(EngineError::LimitExceeded("too many items in one request"));
        }
        if spec.items.iter().any(|i| i.quantity == 0) {
            return Err(EngineError::LimitExceeded("item quantity must be positive"));
        }
        if spec.items.iter().any(|i| i.quantity > MAX_ITEM_QUANTITY) {
            return Err(EngineError::LimitExceeded("item quantity too large"));
        }
        let distinct: BTreeSet<&Ulid> = spec.items.iter().map(|i| &i.component_id).collect();
        if distinct.len() != spec.items.len() {
            return Err(EngineError::LimitExceeded("component listed twice"));
        }

        let _gate = self.gate.read().await;
        if self.component_requests.contains_key(&spec.id) {
            return Err(EngineError::AlreadyExists(spec.id));
        }
        let lab = self
            .get_lab(&spec.lab_id)
            .ok_or(EngineError::NotFound(spec.lab_id))?;
        let department_id = lab.read().await.info.department_id;
        let authority = self.authority_of(&department_id)?;

        let items: Vec<ComponentRequestItem> = spec
            .items
            .iter()
            .map(|i| ComponentRequestItem {
                component_id: i.component_id,
                quantity_requested: i.quantity,
            })
            .collect();

        let initiator = Initiator::from_role(spec.requester.role, spec.supervisor.clone());
        let status = ComponentStatus::from(initial_stage(&initiator));
        let now = now_ms();
        let request = ComponentRequest {
            id: spec.id,
            requested_by: spec.requester.clone(),
            initiator,
            lab_id: spec.lab_id,
            authority,
            items,
            purpose: spec.purpose,
            status,
            faculty: None,
            lab_staff: None,
            final_approval: None,
            closed: None,
            created_at: now,
            due_on: spec.due_on,
            issued_at: None,
            return_requested_at: None,
            returned_at: None,
            extension: None,
            timeline: vec![TimelineStep {
                step: "submitted".into(),
                status: status.as_str().to_string(),
                lab_id: Some(spec.lab_id),
                actor: spec.requester,
                at: now,
                remarks: None,
            }],
            applied_keys: BTreeSet::new(),
        };

        let demand = request.demand();
        let locked = self.lock_components(demand.keys().copied()).await?;
        if let Some((id, _)) = locked.iter().find(|(_, c)| c.lab_id != spec.lab_id) {
            return Err(EngineError::InvalidTransition {
                status: status.as_str(),
                detail: format!("component {id} belongs to another lab"),
            });
        }
        let shortfalls = shortfalls(&demand, &locked);
        drop(locked);

        self.wal_append(&Event::ComponentRequestSubmitted {
            request: request.clone(),
        })
        .await?;
        self.component_requests
            .insert(request.id, Arc::new(Mutex::new(request)));

        metrics::counter!(observability::REQUESTS_SUBMITTED_TOTAL, "kind" => "component").increment(1);
        info!("component request {} submitted at {}", spec.id, status);
        Ok(ComponentReceipt {
            id: spec.id,
            status,
            shortfalls,
        })
    }

    /// Approval chain for component loans. The final approval checks stock
    /// without reserving it; `issue` takes it.
    pub async fn act_component(&self, req: ActComponentRequest) -> Result<ComponentStatus, EngineError> {
        if let Some(r) = &req.remarks {
            check_len(r, MAX_REMARKS_LEN, "remarks too long")?;
        }
        let _gate = self.gate.read().await;
        let shared = self
            .get_component_request_state(&req.request_id)
            .ok_or(EngineError::NotFound(req.request_id))?;
        let mut guard = shared.lock_owned().await;

        if let Some(key) = req.idempotency_key
            && guard.applied_keys.contains(&key)
        {
            return Ok(guard.status);
        }

        let stage = guard.status.chain_stage().ok_or_else(|| {
            wrong_status(guard.status, req.request_id, "the approval chain is complete")
        })?;
        let step = decide(
            req.request_id,
            stage,
            req.actor.role,
            guard.authority,
            req.decision,
            req.remarks.as_deref(),
        )?;
        if stage == BookingStatus::PendingFaculty
            && let Some(supervisor) = guard.initiator.supervisor()
            && supervisor != req.actor.id
        {
            return Err(EngineError::InvalidTransition {
                status: stage.as_str(),
                detail: format!("only supervisor {supervisor} may recommend this request"),
            });
        }

        let demand = guard.demand();
        let mut locked = Vec::new();
        if step == Step::Bind {
            locked = self.lock_components(demand.keys().copied()).await?;
            if let Err(e) = check_inventory(&demand, &locked) {
                metrics::counter!(observability::INVENTORY_REJECTIONS_TOTAL).increment(1);
                warn!("final approval of {} refused: {e}", req.request_id);
                return Err(e);
            }
        }

        let decision = StageDecision {
            actor: req.actor,
            at: now_ms(),
            remarks: req.remarks,
        };
        let to = ComponentStatus::from(step.target());
        self.commit_component(&mut guard, to, decision, req.idempotency_key, &mut locked)
            .await?;
        Ok(guard.status)
    }

    /// Hand the components over. Stock is decremented here, atomically across
    /// every item of the request.
    pub async fn issue(
        &self,
        request_id: Ulid,
        actor: Actor,
        idempotency_key: Option<Ulid>,
    ) -> Result<ComponentStatus, EngineError> {
        let _gate = self.gate.read().await;
        let shared = self
            .get_component_request_state(&request_id)
            .ok_or(EngineError::NotFound(request_id))?;
        let mut guard = shared.lock_owned().await;

        if let Some(key) = idempotency_key
            && guard.applied_keys.contains(&key)
        {
            return Ok(guard.status);
        }
        if guard.status != ComponentStatus::Approved {
            return Err(wrong_status(guard.status, request_id, "only approved requests can be issued"));
        }
        require_role(guard.status, &actor, Role::LabStaff)?;

        let demand = guard.demand();
        let mut locked = self.lock_components(demand.keys().copied()).await?;
        if let Err(e) = check_inventory(&demand, &locked) {
            metrics::counter!(observability::INVENTORY_REJECTIONS_TOTAL).increment(1);
            warn!("issue of {request_id} refused: {e}");
            return Err(e);
        }
        let decision = StageDecision {
            actor,
            at: now_ms(),
            remarks: None,
        };
        self.commit_component(&mut guard, ComponentStatus::Issued, decision, idempotency_key, &mut locked)
            .await?;
        Ok(guard.status)
    }

    pub async fn request_return(&self, request_id: Ulid, requester: &str) -> Result<ComponentStatus, EngineError> {
        let _gate = self.gate.read().await;
        let shared = self
            .get_component_request_state(&request_id)
            .ok_or(EngineError::NotFound(request_id))?;
        let mut guard = shared.lock_owned().await;
        if guard.requested_by.id != requester {
            return Err(EngineError::NotRequester(request_id));
        }
        if guard.status != ComponentStatus::Issued {
            return Err(wrong_status(guard.status, request_id, "nothing is out on loan"));
        }
        let decision = StageDecision {
            actor: guard.requested_by.clone(),
            at: now_ms(),
            remarks: None,
        };
        self.commit_component(&mut guard, ComponentStatus::ReturnRequested, decision, None, &mut Vec::new())
            .await?;
        Ok(guard.status)
    }

    /// Lab staff confirm the components are back. Restores stock.
    pub async fn approve_return(
        &self,
        request_id: Ulid,
        actor: Actor,
        remarks: Option<String>,
    ) -> Result<ComponentStatus, EngineError> {
        if let Some(r) = &remarks {
            check_len(r, MAX_REMARKS_LEN, "remarks too long")?;
        }
        let _gate = self.gate.read().await;
        let shared = self
            .get_component_request_state(&request_id)
            .ok_or(EngineError::NotFound(request_id))?;
        let mut guard = shared.lock_owned().await;
        if guard.status != ComponentStatus::ReturnRequested {
            return Err(wrong_status(guard.status, request_id, "no return was requested"));
        }
        require_role(guard.status, &actor, Role::LabStaff)?;

        let mut locked = self.lock_components(guard.demand().into_keys()).await?;
        let decision = StageDecision {
            actor,
            at: now_ms(),
            remarks,
        };
        self.commit_component(&mut guard, ComponentStatus::Returned, decision, None, &mut locked)
            .await?;
        Ok(guard.status)
    }

    /// Ask to keep an issued loan past its due date. The loan stays `issued`.
    pub async fn request_extension(
        &self,
        request_id: Ulid,
        requester: &str,
        until: NaiveDate,
        reason: String,
    ) -> Result<(), EngineError> {
        check_len(&reason, MAX_REMARKS_LEN, "reason too long")?;
        let _gate = self.gate.read().await;
        let shared = self
            .get_component_request_state(&request_id)
            .ok_or(EngineError::NotFound(request_id))?;
        let mut guard = shared.lock_owned().await;
        if guard.requested_by.id != requester {
            return Err(EngineError::NotRequester(request_id));
        }
        if guard.status != ComponentStatus::Issued {
            return Err(wrong_status(guard.status, request_id, "only issued loans can be extended"));
        }
        if guard.extension.as_ref().is_some_and(Extension::is_pending) {
            return Err(EngineError::InvalidTransition {
                status: guard.status.as_str(),
                detail: "an extension is already pending".into(),
            });
        }
        if let Some(due) = guard.due_on
            && until <= due
        {
            return Err(EngineError::InvalidTransition {
                status: guard.status.as_str(),
                detail: format!("extension must end after the due date {due}"),
            });
        }

        let actor = guard.requested_by.clone();
        let at = now_ms();
        self.wal_append(&Event::ExtensionRequested {
            request_id,
            actor: actor.clone(),
            until,
            reason: reason.clone(),
            at,
        })
        .await?;
        guard.apply_extension_request(&actor, until, &reason, at);
        info!("component request {request_id} asks to keep items until {until}");
        Ok(())
    }

    pub async fn decide_extension(
        &self,
        request_id: Ulid,
        actor: Actor,
        approve: bool,
        remarks: Option<String>,
    ) -> Result<Option<NaiveDate>, EngineError> {
        if let Some(r) = &remarks {
            check_len(r, MAX_REMARKS_LEN, "remarks too long")?;
        }
        let _gate = self.gate.read().await;
        let shared = self
            .get_component_request_state(&request_id)
            .ok_or(EngineError::NotFound(request_id))?;
        let mut guard = shared.lock_owned().await;
        if !guard.extension.as_ref().is_some_and(Extension::is_pending) {
            return Err(wrong_status(guard.status, request_id, "no extension is pending"));
        }
        require_role(guard.status, &actor, Role::LabStaff)?;
        if !approve && remarks.as_deref().is_none_or(|r| r.trim().is_empty()) {
            return Err(EngineError::MissingRemarks);
        }

        let decision = StageDecision {
            actor,
            at: now_ms(),
            remarks,
        };
        self.wal_append(&Event::ExtensionDecided {
            request_id,
            approved: approve,
            decision: decision.clone(),
        })
        .await?;
        guard.apply_extension_decision(approve, &decision);
        info!(
            "extension of {request_id} {}",
            if approve { "approved" } else { "rejected" }
        );
        Ok(guard.due_on)
    }

    /// Withdraw a component request. Only possible before anything is issued.
    pub async fn withdraw_component_request(
        &self,
        request_id: Ulid,
        requester: &str,
    ) -> Result<ComponentStatus, EngineError> {
        let _gate = self.gate.read().await;
        let shared = self
            .get_component_request_state(&request_id)
            .ok_or(EngineError::NotFound(request_id))?;
        let mut guard = shared.lock_owned().await;
        if guard.requested_by.id != requester {
            return Err(EngineError::NotRequester(request_id));
        }
        let open = guard
            .status
            .chain_stage()
            .is_some_and(|s| !s.is_closed());
        if !open {
            return Err(wrong_status(guard.status, request_id, "items were already issued"));
        }
        let decision = StageDecision {
            actor: guard.requested_by.clone(),
            at: now_ms(),
            remarks: None,
        };
        self.commit_component(&mut guard, ComponentStatus::Withdrawn, decision, None, &mut Vec::new())
            .await?;
        Ok(guard.status)
    }
}
