//! Role-ordered approval chain shared by bookings and component loans.
//!
//! Pure functions only: the department's approval authority is passed in by
//! the caller, never looked up here.

use crate::model::*;

use super::EngineError;

/// Where a new request enters the chain. There is no self-approval step, so
/// only student requests wait for a faculty recommendation.
pub fn initial_stage(initiator: &Initiator) -> BookingStatus {
    match initiator {
        Initiator::Student { .. } => BookingStatus::PendingFaculty,
        Initiator::Faculty | Initiator::StaffProxy | Initiator::PlacementOffice => {
            BookingStatus::PendingLabStaff
        }
    }
}

/// Role that must act next, or `None` once the chain is finished.
pub fn next_required_role(status: BookingStatus, authority: ApprovalAuthority) -> Option<Role> {
    match status {
        BookingStatus::PendingFaculty => Some(Role::Faculty),
        BookingStatus::PendingLabStaff => Some(Role::LabStaff),
        BookingStatus::PendingHod => Some(authority.role()),
        BookingStatus::Approved | BookingStatus::Rejected | BookingStatus::Withdrawn => None,
    }
}

/// Stage reached by an approval at `status`.
pub fn next_stage(status: BookingStatus) -> Option<BookingStatus> {
    match status {
        BookingStatus::PendingFaculty => Some(BookingStatus::PendingLabStaff),
        BookingStatus::PendingLabStaff => Some(BookingStatus::PendingHod),
        BookingStatus::PendingHod => Some(BookingStatus::Approved),
        BookingStatus::Approved | BookingStatus::Rejected | BookingStatus::Withdrawn => None,
    }
}

/// What a valid decision does to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Recommendation: move to the next pending stage, no availability check.
    Advance(BookingStatus),
    /// Final approval: must pass the authoritative check before committing.
    Bind,
    Reject,
}

impl Step {
    pub fn target(&self) -> BookingStatus {
        match self {
            Step::Advance(next) => *next,
            Step::Bind => BookingStatus::Approved,
            Step::Reject => BookingStatus::Rejected,
        }
    }
}

/// Validate a decision against the current stage.
///
/// Order of checks: closed/finished state, actor role, then remarks.
pub fn decide(
    request_id: ulid::Ulid,
    status: BookingStatus,
    actor: Role,
    authority: ApprovalAuthority,
    decision: Decision,
    remarks: Option<&str>,
) -> Result<Step, EngineError> {
    if status.is_closed() {
        return Err(EngineError::AlreadyTerminal(request_id));
    }
    let required = next_required_role(status, authority).ok_or_else(|| {
        EngineError::InvalidTransition {
            status: status.as_str(),
            detail: "the approval chain is complete".into(),
        }
    })?;
    if actor != required {
        return Err(EngineError::InvalidTransition {
            status: status.as_str(),
            detail: format!("requires {}, got {}", required.as_str(), actor.as_str()),
        });
    }
    match decision {
        Decision::Reject => {
            if remarks.is_none_or(|r| r.trim().is_empty()) {
                return Err(EngineError::MissingRemarks);
            }
            Ok(Step::Reject)
        }
        Decision::Approve => match next_stage(status) {
            Some(BookingStatus::Approved) => Ok(Step::Bind),
            Some(next) => Ok(Step::Advance(next)),
            None => Err(EngineError::InvalidTransition {
                status: status.as_str(),
                detail: "the approval chain is complete".into(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const ALL_ROLES: [Role; 7] = [
        Role::Student,
        Role::Faculty,
        Role::LabStaff,
        Role::Hod,
        Role::LabCoordinator,
        Role::Admin,
        Role::PlacementOffice,
    ];

    const ALL_STATUSES: [BookingStatus; 6] = [
        BookingStatus::PendingFaculty,
        BookingStatus::PendingLabStaff,
        BookingStatus::PendingHod,
        BookingStatus::Approved,
        BookingStatus::Rejected,
        BookingStatus::Withdrawn,
    ];

    #[test]
    fn student_starts_at_faculty_everyone_else_skips() {
        assert_eq!(
            initial_stage(&Initiator::Student { supervisor: None }),
            BookingStatus::PendingFaculty
        );
        for role in ALL_ROLES.into_iter().filter(|r| *r != Role::Student) {
            assert_eq!(
                initial_stage(&Initiator::from_role(role, None)),
                BookingStatus::PendingLabStaff,
                "{role:?}"
            );
        }
    }

    #[test]
    fn final_role_follows_department_setting() {
        assert_eq!(
            next_required_role(BookingStatus::PendingHod, ApprovalAuthority::Hod),
            Some(Role::Hod)
        );
        assert_eq!(
            next_required_role(BookingStatus::PendingHod, ApprovalAuthority::LabCoordinator),
            Some(Role::LabCoordinator)
        );
    }

    #[test]
    fn exhaustive_role_checks() {
        for authority in [ApprovalAuthority::Hod, ApprovalAuthority::LabCoordinator] {
            for status in ALL_STATUSES {
                for role in ALL_ROLES {
                    let result = decide(Ulid::new(), status, role, authority, Decision::Approve, None);
                    match next_required_role(status, authority) {
                        _ if status.is_closed() => {
                            assert!(matches!(result, Err(EngineError::AlreadyTerminal(_))))
                        }
                        Some(required) if required == role => {
                            let step = result.unwrap();
                            assert_eq!(Some(step.target()), next_stage(status));
                        }
                        _ => assert!(
                            matches!(result, Err(EngineError::InvalidTransition { .. })),
                            "{status:?} {role:?} {authority:?}"
                        ),
                    }
                }
            }
        }
    }

    #[test]
    fn only_final_stage_binds() {
        let bind = decide(
            Ulid::new(),
            BookingStatus::PendingHod,
            Role::Hod,
            ApprovalAuthority::Hod,
            Decision::Approve,
            None,
        )
        .unwrap();
        assert_eq!(bind, Step::Bind);

        let advance = decide(
            Ulid::new(),
            BookingStatus::PendingFaculty,
            Role::Faculty,
            ApprovalAuthority::Hod,
            Decision::Approve,
            None,
        )
        .unwrap();
        assert_eq!(advance, Step::Advance(BookingStatus::PendingLabStaff));
    }

    #[test]
    fn rejection_needs_remarks() {
        for remarks in [None, Some(""), Some("   ")] {
            let result = decide(
                Ulid::new(),
                BookingStatus::PendingLabStaff,
                Role::LabStaff,
                ApprovalAuthority::Hod,
                Decision::Reject,
                remarks,
            );
            assert!(matches!(result, Err(EngineError::MissingRemarks)));
        }
        let ok = decide(
            Ulid::new(),
            BookingStatus::PendingLabStaff,
            Role::LabStaff,
            ApprovalAuthority::Hod,
            Decision::Reject,
            Some("lab under maintenance"),
        );
        assert_eq!(ok.unwrap(), Step::Reject);
    }

    #[test]
    fn wrong_role_checked_before_remarks() {
        let result = decide(
            Ulid::new(),
            BookingStatus::PendingLabStaff,
            Role::Student,
            ApprovalAuthority::Hod,
            Decision::Reject,
            None,
        );
        assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
    }

    #[test]
    fn approved_cannot_be_acted_on() {
        let result = decide(
            Ulid::new(),
            BookingStatus::Approved,
            Role::Hod,
            ApprovalAuthority::Hod,
            Decision::Reject,
            Some("changed my mind"),
        );
        assert!(matches!(result, Err(EngineError::InvalidTransition { .. })));
    }

    #[test]
    fn chain_only_moves_forward() {
        for status in ALL_STATUSES {
            if let Some(next) = next_stage(status) {
                assert!(next.progress() > status.progress());
            }
        }
    }
}
