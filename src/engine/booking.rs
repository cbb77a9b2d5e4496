use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::{check_bindable, uncovered, validate_span};
use super::chain::{decide, initial_stage, next_required_role, Step};
use super::rollup::aggregate;
use super::{check_len, now_ms, Engine, EngineError};

/// What a requester submits. `id` is chosen by the caller so a retried
/// submission is caught as `AlreadyExists` instead of filed twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingSpec {
    pub id: Ulid,
    pub requester: Actor,
    pub supervisor: Option<String>,
    pub lab_ids: Vec<Ulid>,
    pub date: NaiveDate,
    pub span: Span,
    pub purpose: String,
    pub participants: Option<u32>,
}

/// Portion of the requested slot already taken in one lab at submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotConflict {
    pub lab_id: Ulid,
    pub conflicting: Vec<Span>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub id: Ulid,
    pub status: AggregateStatus,
    /// Advisory only. Nothing is bound until the final approval.
    pub conflicts: Vec<SlotConflict>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActRequest {
    pub request_id: Ulid,
    /// `None` acts on every leg waiting on the actor's role.
    pub lab_id: Option<Ulid>,
    pub actor: Actor,
    pub decision: Decision,
    pub remarks: Option<String>,
    pub idempotency_key: Option<Ulid>,
}

impl ActRequest {
    pub fn approve(request_id: Ulid, actor: Actor) -> Self {
        Self {
            request_id,
            lab_id: None,
            actor,
            decision: Decision::Approve,
            remarks: None,
            idempotency_key: None,
        }
    }

    pub fn reject(request_id: Ulid, actor: Actor, remarks: impl Into<String>) -> Self {
        Self {
            remarks: Some(remarks.into()),
            decision: Decision::Reject,
            ..Self::approve(request_id, actor)
        }
    }

    pub fn for_lab(mut self, lab_id: Ulid) -> Self {
        self.lab_id = Some(lab_id);
        self
    }

    pub fn with_key(mut self, key: Ulid) -> Self {
        self.idempotency_key = Some(key);
        self
    }
}

/// Legs an `act` call applies to.
fn select_legs(
    request: &BookingRequest,
    lab_id: Option<Ulid>,
    role: Role,
) -> Result<Vec<Ulid>, EngineError> {
    if let Some(lab_id) = lab_id {
        return request
            .leg(&lab_id)
            .map(|l| vec![l.lab_id])
            .ok_or(EngineError::NotFound(lab_id));
    }
    if let [only] = request.legs.as_slice() {
        return Ok(vec![only.lab_id]);
    }

    let waiting: Vec<Ulid> = request
        .legs
        .iter()
        .filter(|l| next_required_role(l.status, l.authority) == Some(role))
        .map(|l| l.lab_id)
        .collect();
    if !waiting.is_empty() {
        return Ok(waiting);
    }
    if request.legs.iter().all(|l| l.status.is_closed()) {
        return Err(EngineError::AlreadyTerminal(request.id));
    }
    Err(EngineError::InvalidTransition {
        status: aggregate(&request.leg_statuses()).as_str(),
        detail: format!("no lab is waiting on {}", role.as_str()),
    })
}

impl Engine {
    pub async fn create_booking(&self, spec: BookingSpec) -> Result<BookingReceipt, EngineError> {
        validate_span(&spec.span)?;
        check_len(&spec.purpose, MAX_PURPOSE_LEN, "purpose too long")?;
        if spec.lab_ids.is_empty() {
            return Err(EngineError::LimitExceeded("booking names no lab"));
        }
        if spec.lab_ids.len() > MAX_LABS_PER_REQUEST {
            return Err(EngineError::LimitExceeded("too many labs in one booking"));
        }
        let distinct: BTreeSet<&Ulid> = spec.lab_ids.iter().collect();
        if distinct.len() != spec.lab_ids.len() {
            return Err(EngineError::LimitExceeded("lab listed twice"));
        }

        let _gate = self.gate.read().await;
        if self.bookings.contains_key(&spec.id) {
            return Err(EngineError::AlreadyExists(spec.id));
        }

        let initiator = Initiator::from_role(spec.requester.role, spec.supervisor.clone());
        let stage = initial_stage(&initiator);
        let mut legs = Vec::with_capacity(spec.lab_ids.len());
        let mut conflicts = Vec::new();

        for lab_id in &spec.lab_ids {
            let lab = self.get_lab(lab_id).ok_or(EngineError::NotFound(*lab_id))?;
            let guard = lab.read().await;
            if let Some(participants) = spec.participants
                && participants > guard.info.capacity
            {
                return Err(EngineError::CapacityExceeded {
                    lab_id: *lab_id,
                    capacity: guard.info.capacity,
                });
            }
            let authority = self.authority_of(&guard.info.department_id)?;
            let taken = uncovered(&guard, spec.date, &spec.span);
            if !taken.is_empty() {
                conflicts.push(SlotConflict {
                    lab_id: *lab_id,
                    conflicting: taken,
                });
            }
            legs.push(LabApproval {
                lab_id: *lab_id,
                status: stage,
                authority,
                responsible: guard.info.responsible.clone(),
                faculty: None,
                lab_staff: None,
                final_approval: None,
                closed: None,
            });
        }

        let now = now_ms();
        let request = BookingRequest {
            id: spec.id,
            requested_by: spec.requester.clone(),
            initiator,
            date: spec.date,
            span: spec.span,
            purpose: spec.purpose,
            participants: spec.participants,
            is_multi_lab: legs.len() > 1,
            highest_approval_authority: legs[0].authority,
            legs,
            created_at: now,
            timeline: vec![TimelineStep {
                step: "submitted".into(),
                status: stage.as_str().to_string(),
                lab_id: None,
                actor: spec.requester,
                at: now,
                remarks: None,
            }],
            applied_keys: BTreeSet::new(),
        };

        self.wal_append(&Event::BookingSubmitted {
            request: request.clone(),
        })
        .await?;
        let status = aggregate(&request.leg_statuses());
        self.bookings
            .insert(request.id, Arc::new(Mutex::new(request)));

        metrics::counter!(observability::REQUESTS_SUBMITTED_TOTAL, "kind" => "booking").increment(1);
        info!("booking {} submitted at {}", spec.id, stage);
        if !conflicts.is_empty() {
            debug!("booking {} overlaps taken time in {} lab(s)", spec.id, conflicts.len());
        }
        Ok(BookingReceipt {
            id: spec.id,
            status,
            conflicts,
        })
    }

    /// Apply one approver decision.
    ///
    /// Recommendations move without touching availability. The final approval
    /// re-checks every affected lab under its write lock and commits all legs
    /// in one logged event, or fails with `SlotNoLongerAvailable` and leaves
    /// the request as it was.
    pub async fn act(&self, req: ActRequest) -> Result<AggregateStatus, EngineError> {
        if let Some(r) = &req.remarks {
            check_len(r, MAX_REMARKS_LEN, "remarks too long")?;
        }
        let _gate = self.gate.read().await;
        let booking = self
            .get_booking_state(&req.request_id)
            .ok_or(EngineError::NotFound(req.request_id))?;
        let mut guard = booking.lock_owned().await;

        if let Some(key) = req.idempotency_key
            && guard.applied_keys.contains(&key)
        {
            return Ok(aggregate(&guard.leg_statuses()));
        }

        let targets = select_legs(&guard, req.lab_id, req.actor.role)?;
        let (stage, authority) = guard
            .leg(&targets[0])
            .map(|l| (l.status, l.authority))
            .ok_or(EngineError::NotFound(targets[0]))?;
        let step = decide(
            req.request_id,
            stage,
            req.actor.role,
            authority,
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

        let transition = LegTransition {
            request_id: req.request_id,
            lab_ids: targets.clone(),
            to: step.target(),
            decision: StageDecision {
                actor: req.actor,
                at: now_ms(),
                remarks: req.remarks,
            },
            idempotency_key: req.idempotency_key,
        };

        if step == Step::Bind {
            let mut locked = self.lock_labs(&targets).await?;
            for (_, lab) in &locked {
                if let Err(e) = check_bindable(lab, guard.date, &guard.span) {
                    metrics::counter!(observability::SLOT_CONFLICTS_TOTAL).increment(1);
                    warn!("final approval of {} refused: {e}", req.request_id);
                    return Err(e);
                }
            }
            self.wal_append(&Event::BookingTransitioned {
                transition: transition.clone(),
            })
            .await?;
            let effects = guard.apply_transition(&transition);
            self.commit_effects(&effects, &mut locked);
        } else {
            self.wal_append(&Event::BookingTransitioned {
                transition: transition.clone(),
            })
            .await?;
            guard.apply_transition(&transition);
        }

        metrics::counter!(observability::TRANSITIONS_TOTAL, "kind" => "booking", "to" => transition.to.as_str())
            .increment(1);
        info!(
            "booking {} {} -> {} by {} ({} lab(s))",
            req.request_id,
            stage,
            transition.to,
            transition.decision.actor.role.as_str(),
            targets.len()
        );
        Ok(aggregate(&guard.leg_statuses()))
    }

    /// Withdraw every leg that is still open or approved.
    pub async fn withdraw(&self, request_id: Ulid, requester: &str) -> Result<AggregateStatus, EngineError> {
        let _gate = self.gate.read().await;
        let booking = self
            .get_booking_state(&request_id)
            .ok_or(EngineError::NotFound(request_id))?;
        let guard = booking.lock_owned().await;
        if guard.requested_by.id != requester {
            return Err(EngineError::NotRequester(request_id));
        }
        let targets: Vec<Ulid> = guard
            .legs
            .iter()
            .filter(|l| !l.status.is_closed())
            .map(|l| l.lab_id)
            .collect();
        if targets.is_empty() {
            return Err(EngineError::AlreadyTerminal(request_id));
        }
        self.close_legs(guard, targets).await
    }

    /// Withdraw one lab of a booking. Sibling legs are untouched.
    pub async fn withdraw_lab(
        &self,
        request_id: Ulid,
        lab_id: Ulid,
        requester: &str,
    ) -> Result<AggregateStatus, EngineError> {
        let _gate = self.gate.read().await;
        let booking = self
            .get_booking_state(&request_id)
            .ok_or(EngineError::NotFound(request_id))?;
        let guard = booking.lock_owned().await;
        if guard.requested_by.id != requester {
            return Err(EngineError::NotRequester(request_id));
        }
        let leg = guard.leg(&lab_id).ok_or(EngineError::NotFound(lab_id))?;
        if leg.status.is_closed() {
            return Err(EngineError::AlreadyTerminal(request_id));
        }
        self.close_legs(guard, vec![lab_id]).await
    }

    async fn close_legs(
        &self,
        mut guard: OwnedMutexGuard<BookingRequest>,
        targets: Vec<Ulid>,
    ) -> Result<AggregateStatus, EngineError> {
        let bound: Vec<Ulid> = targets
            .iter()
            .copied()
            .filter(|id| guard.leg(id).is_some_and(|l| l.status == BookingStatus::Approved))
            .collect();
        let mut locked = self.lock_labs(&bound).await?;

        let transition = LegTransition {
            request_id: guard.id,
            lab_ids: targets,
            to: BookingStatus::Withdrawn,
            decision: StageDecision {
                actor: guard.requested_by.clone(),
                at: now_ms(),
                remarks: None,
            },
            idempotency_key: None,
        };
        self.wal_append(&Event::BookingTransitioned {
            transition: transition.clone(),
        })
        .await?;
        let effects = guard.apply_transition(&transition);
        self.commit_effects(&effects, &mut locked);

        metrics::counter!(observability::TRANSITIONS_TOTAL, "kind" => "booking", "to" => "withdrawn").increment(1);
        info!(
            "booking {} withdrawn from {} lab(s), {} slot(s) released",
            guard.id,
            transition.lab_ids.len(),
            effects.len()
        );
        Ok(aggregate(&guard.leg_statuses()))
    }
}
