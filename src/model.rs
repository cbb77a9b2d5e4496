use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for every audit timestamp.
pub type Ms = i64;

/// Minutes since midnight. `HH:MM` strings are only a serialization format.
pub type Minute = i32;

pub const DAY_MINUTES: Minute = 24 * 60;

/// Half-open interval `[start, end)` within one day, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub const FULL_DAY: Span = Span {
        start: 0,
        end: DAY_MINUTES,
    };

    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor: rejects zero-length, inverted and out-of-day windows.
    pub fn try_new(start: Minute, end: Minute) -> Option<Self> {
        let span = Self { start, end };
        span.is_valid().then_some(span)
    }

    /// Parse a pair of `HH:MM` clock strings.
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        Self::try_new(parse_clock(start)?, parse_clock(end)?)
    }

    pub fn is_valid(&self) -> bool {
        0 <= self.start && self.start < self.end && self.end <= DAY_MINUTES
    }

    pub fn minutes(&self) -> Minute {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn clamp_to(&self, window: &Span) -> Option<Span> {
        Span::try_new(self.start.max(window.start), self.end.min(window.end))
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", format_clock(self.start), format_clock(self.end))
    }
}

/// Parse `HH:MM` (`24:00` allowed as end-of-day) into minutes since midnight.
pub fn parse_clock(s: &str) -> Option<Minute> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let h: Minute = h.parse().ok()?;
    let m: Minute = m.parse().ok()?;
    if !(0..60).contains(&m) {
        return None;
    }
    let total = h * 60 + m;
    (0..=DAY_MINUTES).contains(&total).then_some(total)
}

pub fn format_clock(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

// ── People and roles ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Student,
    Faculty,
    LabStaff,
    Hod,
    LabCoordinator,
    Admin,
    PlacementOffice,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Faculty => "faculty",
            Role::LabStaff => "lab_staff",
            Role::Hod => "hod",
            Role::LabCoordinator => "lab_coordinator",
            Role::Admin => "admin",
            Role::PlacementOffice => "placement_office",
        }
    }
}

/// A person acting on a request, as reported by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self { id: id.into(), role }
    }
}

/// Who opened the request. Decides where the approval chain starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initiator {
    Student { supervisor: Option<String> },
    Faculty,
    /// Lab staff, HOD, coordinator or admin filing on someone's behalf.
    StaffProxy,
    PlacementOffice,
}

impl Initiator {
    pub fn from_role(role: Role, supervisor: Option<String>) -> Self {
        match role {
            Role::Student => Initiator::Student { supervisor },
            Role::Faculty => Initiator::Faculty,
            Role::PlacementOffice => Initiator::PlacementOffice,
            Role::LabStaff | Role::Hod | Role::LabCoordinator | Role::Admin => {
                Initiator::StaffProxy
            }
        }
    }

    pub fn supervisor(&self) -> Option<&str> {
        match self {
            Initiator::Student { supervisor } => supervisor.as_deref(),
            _ => None,
        }
    }
}

/// Department setting selecting the role that gives the final approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAuthority {
    Hod,
    LabCoordinator,
}

impl ApprovalAuthority {
    pub fn role(&self) -> Role {
        match self {
            ApprovalAuthority::Hod => Role::Hod,
            ApprovalAuthority::LabCoordinator => Role::LabCoordinator,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

// ── Booking chain ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    PendingFaculty,
    PendingLabStaff,
    /// Final stage. Acted on by the HOD or the lab coordinator, per department.
    PendingHod,
    Approved,
    Rejected,
    Withdrawn,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::PendingFaculty => "pending_faculty",
            BookingStatus::PendingLabStaff => "pending_lab_staff",
            BookingStatus::PendingHod => "pending_hod",
            BookingStatus::Approved => "approved",
            BookingStatus::Rejected => "rejected",
            BookingStatus::Withdrawn => "withdrawn",
        }
    }

    /// Rejected and withdrawn legs are frozen.
    pub fn is_closed(&self) -> bool {
        matches!(self, BookingStatus::Rejected | BookingStatus::Withdrawn)
    }

    /// No further `act` is possible.
    pub fn is_terminal(&self) -> bool {
        self.is_closed() || *self == BookingStatus::Approved
    }

    /// Chain position, `None` for closed states.
    pub fn progress(&self) -> Option<u8> {
        match self {
            BookingStatus::PendingFaculty => Some(0),
            BookingStatus::PendingLabStaff => Some(1),
            BookingStatus::PendingHod => Some(2),
            BookingStatus::Approved => Some(3),
            BookingStatus::Rejected | BookingStatus::Withdrawn => None,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rollup of every leg of a booking. Derived on read, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AggregateStatus {
    PendingFaculty,
    PendingLabStaff,
    PendingHod,
    Approved,
    Rejected,
    Withdrawn,
    PartiallyWithdrawn { active: usize },
}

impl AggregateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateStatus::PendingFaculty => "pending_faculty",
            AggregateStatus::PendingLabStaff => "pending_lab_staff",
            AggregateStatus::PendingHod => "pending_hod",
            AggregateStatus::Approved => "approved",
            AggregateStatus::Rejected => "rejected",
            AggregateStatus::Withdrawn => "withdrawn",
            AggregateStatus::PartiallyWithdrawn { .. } => "partially_withdrawn",
        }
    }
}

impl From<BookingStatus> for AggregateStatus {
    fn from(status: BookingStatus) -> Self {
        match status {
            BookingStatus::PendingFaculty => AggregateStatus::PendingFaculty,
            BookingStatus::PendingLabStaff => AggregateStatus::PendingLabStaff,
            BookingStatus::PendingHod => AggregateStatus::PendingHod,
            BookingStatus::Approved => AggregateStatus::Approved,
            BookingStatus::Rejected => AggregateStatus::Rejected,
            BookingStatus::Withdrawn => AggregateStatus::Withdrawn,
        }
    }
}

/// Who decided a stage, when, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDecision {
    pub actor: Actor,
    pub at: Ms,
    pub remarks: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub email: String,
}

/// Append-only audit entry. Never consulted for control decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineStep {
    pub step: String,
    pub status: String,
    pub lab_id: Option<Ulid>,
    pub actor: Actor,
    pub at: Ms,
    pub remarks: Option<String>,
}

/// Per-lab leg of a booking. Single-lab bookings have exactly one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabApproval {
    pub lab_id: Ulid,
    pub status: BookingStatus,
    pub authority: ApprovalAuthority,
    pub responsible: Option<Contact>,
    pub faculty: Option<StageDecision>,
    pub lab_staff: Option<StageDecision>,
    pub final_approval: Option<StageDecision>,
    /// Rejection or withdrawal.
    pub closed: Option<StageDecision>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub id: Ulid,
    pub requested_by: Actor,
    pub initiator: Initiator,
    pub date: NaiveDate,
    pub span: Span,
    pub purpose: String,
    pub participants: Option<u32>,
    pub is_multi_lab: bool,
    /// Authority of the first lab's department when the request was filed.
    pub highest_approval_authority: ApprovalAuthority,
    pub legs: Vec<LabApproval>,
    pub created_at: Ms,
    pub timeline: Vec<TimelineStep>,
    pub applied_keys: BTreeSet<Ulid>,
}

/// One committed booking state change, covering one or more legs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegTransition {
    pub request_id: Ulid,
    pub lab_ids: Vec<Ulid>,
    pub to: BookingStatus,
    pub decision: StageDecision,
    pub idempotency_key: Option<Ulid>,
}

/// Ledger side effect of a booking transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEffect {
    Bind { lab_id: Ulid, allocation: Allocation },
    Free { lab_id: Ulid, request_id: Ulid },
}

impl BookingRequest {
    pub fn leg(&self, lab_id: &Ulid) -> Option<&LabApproval> {
        self.legs.iter().find(|l| l.lab_id == *lab_id)
    }

    pub fn lab_ids(&self) -> Vec<Ulid> {
        self.legs.iter().map(|l| l.lab_id).collect()
    }

    pub fn leg_statuses(&self) -> Vec<BookingStatus> {
        self.legs.iter().map(|l| l.status).collect()
    }

    /// Apply a committed transition. Returns the ledger changes the caller
    /// must apply to the affected labs.
    pub fn apply_transition(&mut self, t: &LegTransition) -> Vec<LedgerEffect> {
        let mut effects = Vec::new();
        let (date, span, request_id) = (self.date, self.span, self.id);
        for leg in self.legs.iter_mut().filter(|l| t.lab_ids.contains(&l.lab_id)) {
            let from = leg.status;
            let step = step_name(from, t.to, t.decision.actor.role);
            match t.to {
                BookingStatus::Rejected | BookingStatus::Withdrawn => {
                    leg.closed = Some(t.decision.clone())
                }
                _ => match from {
                    BookingStatus::PendingFaculty => leg.faculty = Some(t.decision.clone()),
                    BookingStatus::PendingLabStaff => leg.lab_staff = Some(t.decision.clone()),
                    BookingStatus::PendingHod => leg.final_approval = Some(t.decision.clone()),
                    _ => {}
                },
            }
            leg.status = t.to;

            if t.to == BookingStatus::Approved && from != BookingStatus::Approved {
                effects.push(LedgerEffect::Bind {
                    lab_id: leg.lab_id,
                    allocation: Allocation {
                        request_id,
                        date,
                        span,
                    },
                });
            } else if from == BookingStatus::Approved && t.to != BookingStatus::Approved {
                effects.push(LedgerEffect::Free {
                    lab_id: leg.lab_id,
                    request_id,
                });
            }

            self.timeline.push(TimelineStep {
                step,
                status: t.to.as_str().to_string(),
                lab_id: Some(leg.lab_id),
                actor: t.decision.actor.clone(),
                at: t.decision.at,
                remarks: t.decision.remarks.clone(),
            });
        }
        if let Some(key) = t.idempotency_key {
            self.applied_keys.insert(key);
        }
        effects
    }
}

/// Timeline label for a transition. Records the role that actually acted.
pub fn step_name(from: BookingStatus, to: BookingStatus, role: Role) -> String {
    match to {
        BookingStatus::Rejected => "rejected".to_string(),
        BookingStatus::Withdrawn => "withdrawn".to_string(),
        _ if from == to => to.as_str().to_string(),
        _ => format!("{}_approved", role.as_str()),
    }
}

// ── Directory (collaborator data) ────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: Ulid,
    pub name: String,
    pub authority: ApprovalAuthority,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabInfo {
    pub id: Ulid,
    pub department_id: Ulid,
    pub name: String,
    pub location: Option<String>,
    pub capacity: u32,
    /// Bookable window each day. `None` means the whole day.
    pub opening: Option<Span>,
    pub responsible: Option<Contact>,
}

/// Fixed class slot, busy every week on `weekday`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimetableEntry {
    pub id: Ulid,
    pub lab_id: Ulid,
    pub weekday: Weekday,
    pub span: Span,
    pub label: Option<String>,
}

/// An approved booking occupying a lab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub request_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
}

/// Availability ledger for one lab.
#[derive(Debug, Clone)]
pub struct LabState {
    pub info: LabInfo,
    pub timetable: Vec<TimetableEntry>,
    /// Sorted by `(date, span.start)`.
    pub allocations: Vec<Allocation>,
}

impl LabState {
    pub fn new(info: LabInfo) -> Self {
        Self {
            info,
            timetable: Vec::new(),
            allocations: Vec::new(),
        }
    }

    pub fn opening(&self) -> Span {
        self.info.opening.unwrap_or(Span::FULL_DAY)
    }

    /// Insert allocation maintaining sort order.
    pub fn bind(&mut self, allocation: Allocation) {
        let key = (allocation.date, allocation.span.start);
        let pos = self
            .allocations
            .binary_search_by_key(&key, |a| (a.date, a.span.start))
            .unwrap_or_else(|e| e);
        self.allocations.insert(pos, allocation);
    }

    pub fn free(&mut self, request_id: &Ulid) -> Option<Allocation> {
        let pos = self
            .allocations
            .iter()
            .position(|a| a.request_id == *request_id)?;
        Some(self.allocations.remove(pos))
    }

    /// Approved allocations on `date`, in start order.
    pub fn allocations_on(&self, date: NaiveDate) -> &[Allocation] {
        let lo = self.allocations.partition_point(|a| a.date < date);
        let hi = self.allocations.partition_point(|a| a.date <= date);
        &self.allocations[lo..hi]
    }

    pub fn timetable_on(&self, date: NaiveDate) -> impl Iterator<Item = &TimetableEntry> {
        let weekday = date.weekday();
        self.timetable.iter().filter(move |e| e.weekday == weekday)
    }

    pub fn add_timetable_entry(&mut self, entry: TimetableEntry) {
        self.timetable.retain(|e| e.id != entry.id);
        self.timetable.push(entry);
        self.timetable.sort_by_key(|e| (e.weekday.num_days_from_monday(), e.span.start));
    }

    pub fn remove_timetable_entry(&mut self, id: &Ulid) -> Option<TimetableEntry> {
        let pos = self.timetable.iter().position(|e| e.id == *id)?;
        Some(self.timetable.remove(pos))
    }
}

// ── Components ───────────────────────────────────────────────────

/// Inventory record. `quantity_available` stays within `[0, quantity_total]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    pub id: Ulid,
    pub lab_id: Ulid,
    pub name: String,
    pub quantity_total: u32,
    pub quantity_available: u32,
}

impl Component {
    /// Move stock by `delta`. Returns false if the result left
    /// `[0, quantity_total]` and had to be clamped, which means the loan
    /// accounting and the inventory record disagree.
    pub fn apply_delta(&mut self, delta: i64) -> bool {
        let next = i64::from(self.quantity_available) + delta;
        let clamped = next.clamp(0, i64::from(self.quantity_total));
        self.quantity_available = clamped as u32;
        clamped == next
    }

    /// Units the engine has handed out and not yet taken back.
    pub fn on_loan(&self) -> u32 {
        self.quantity_total - self.quantity_available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    PendingFaculty,
    PendingLabStaff,
    PendingHod,
    Approved,
    Issued,
    ReturnRequested,
    Returned,
    Rejected,
    Withdrawn,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::PendingFaculty => "pending_faculty",
            ComponentStatus::PendingLabStaff => "pending_lab_staff",
            ComponentStatus::PendingHod => "pending_hod",
            ComponentStatus::Approved => "approved",
            ComponentStatus::Issued => "issued",
            ComponentStatus::ReturnRequested => "return_requested",
            ComponentStatus::Returned => "returned",
            ComponentStatus::Rejected => "rejected",
            ComponentStatus::Withdrawn => "withdrawn",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ComponentStatus::Returned | ComponentStatus::Rejected | ComponentStatus::Withdrawn
        )
    }

    /// Position on the shared approval chain, if the request is still on it.
    pub fn chain_stage(&self) -> Option<BookingStatus> {
        match self {
            ComponentStatus::PendingFaculty => Some(BookingStatus::PendingFaculty),
            ComponentStatus::PendingLabStaff => Some(BookingStatus::PendingLabStaff),
            ComponentStatus::PendingHod => Some(BookingStatus::PendingHod),
            ComponentStatus::Approved => Some(BookingStatus::Approved),
            ComponentStatus::Rejected => Some(BookingStatus::Rejected),
            ComponentStatus::Withdrawn => Some(BookingStatus::Withdrawn),
            _ => None,
        }
    }
}

impl From<BookingStatus> for ComponentStatus {
    fn from(status: BookingStatus) -> Self {
        match status {
            BookingStatus::PendingFaculty => ComponentStatus::PendingFaculty,
            BookingStatus::PendingLabStaff => ComponentStatus::PendingLabStaff,
            BookingStatus::PendingHod => ComponentStatus::PendingHod,
            BookingStatus::Approved => ComponentStatus::Approved,
            BookingStatus::Rejected => ComponentStatus::Rejected,
            BookingStatus::Withdrawn => ComponentStatus::Withdrawn,
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRequestItem {
    pub component_id: Ulid,
    pub quantity_requested: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionDecision {
    pub approved: bool,
    pub decided: StageDecision,
}

/// Loan extension sub-flow. Runs beside `issued` without touching the primary status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extension {
    pub until: NaiveDate,
    pub reason: String,
    pub requested_at: Ms,
    pub decision: Option<ExtensionDecision>,
}

impl Extension {
    pub fn is_pending(&self) -> bool {
        self.decision.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRequest {
    pub id: Ulid,
    pub requested_by: Actor,
    pub initiator: Initiator,
    pub lab_id: Ulid,
    pub authority: ApprovalAuthority,
    pub items: Vec<ComponentRequestItem>,
    pub purpose: String,
    pub status: ComponentStatus,
    pub faculty: Option<StageDecision>,
    pub lab_staff: Option<StageDecision>,
    pub final_approval: Option<StageDecision>,
    pub closed: Option<StageDecision>,
    pub created_at: Ms,
    pub due_on: Option<NaiveDate>,
    pub issued_at: Option<Ms>,
    pub return_requested_at: Option<Ms>,
    pub returned_at: Option<Ms>,
    pub extension: Option<Extension>,
    pub timeline: Vec<TimelineStep>,
    pub applied_keys: BTreeSet<Ulid>,
}

impl ComponentRequest {
    /// Total quantity per component, keyed in lock order. Saturates, so an
    /// oversized total fails the inventory check instead of wrapping.
    pub fn demand(&self) -> BTreeMap<Ulid, u32> {
        let mut demand: BTreeMap<Ulid, u32> = BTreeMap::new();
        for item in &self.items {
            let total = demand.entry(item.component_id).or_insert(0);
            *total = total.saturating_add(item.quantity_requested);
        }
        demand
    }

    pub fn extension_requested_until(&self) -> Option<NaiveDate> {
        self.extension.as_ref().map(|e| e.until)
    }

    pub fn extension_approved_at(&self) -> Option<Ms> {
        self.extension
            .as_ref()
            .and_then(|e| e.decision.as_ref())
            .filter(|d| d.approved)
            .map(|d| d.decided.at)
    }

    /// Apply a committed transition. Returns inventory deltas per component.
    pub fn apply_transition(
        &mut self,
        to: ComponentStatus,
        decision: &StageDecision,
        idempotency_key: Option<Ulid>,
    ) -> Vec<(Ulid, i64)> {
        let from = self.status;
        let mut deltas = Vec::new();
        let step = match to {
            ComponentStatus::Rejected => "rejected".to_string(),
            ComponentStatus::Withdrawn => "withdrawn".to_string(),
            ComponentStatus::Issued => "issued".to_string(),
            ComponentStatus::ReturnRequested => "return_requested".to_string(),
            ComponentStatus::Returned => "returned".to_string(),
            _ => format!("{}_approved", decision.actor.role.as_str()),
        };

        match to {
            ComponentStatus::Rejected | ComponentStatus::Withdrawn => {
                self.closed = Some(decision.clone())
            }
            ComponentStatus::Issued => {
                self.issued_at = Some(decision.at);
                deltas = self
                    .demand()
                    .into_iter()
                    .map(|(id, qty)| (id, -i64::from(qty)))
                    .collect();
            }
            ComponentStatus::ReturnRequested => self.return_requested_at = Some(decision.at),
            ComponentStatus::Returned => {
                self.returned_at = Some(decision.at);
                deltas = self
                    .demand()
                    .into_iter()
                    .map(|(id, qty)| (id, i64::from(qty)))
                    .collect();
            }
            _ => match from {
                ComponentStatus::PendingFaculty => self.faculty = Some(decision.clone()),
                ComponentStatus::PendingLabStaff => self.lab_staff = Some(decision.clone()),
                ComponentStatus::PendingHod => self.final_approval = Some(decision.clone()),
                _ => {}
            },
        }
        self.status = to;
        self.timeline.push(TimelineStep {
            step,
            status: to.as_str().to_string(),
            lab_id: Some(self.lab_id),
            actor: decision.actor.clone(),
            at: decision.at,
            remarks: decision.remarks.clone(),
        });
        if let Some(key) = idempotency_key {
            self.applied_keys.insert(key);
        }
        deltas
    }

    pub fn apply_extension_request(&mut self, actor: &Actor, until: NaiveDate, reason: &str, at: Ms) {
        self.extension = Some(Extension {
            until,
            reason: reason.to_string(),
            requested_at: at,
            decision: None,
        });
        self.timeline.push(TimelineStep {
            step: "extension_requested".into(),
            status: self.status.as_str().to_string(),
            lab_id: Some(self.lab_id),
            actor: actor.clone(),
            at,
            remarks: Some(reason.to_string()),
        });
    }

    pub fn apply_extension_decision(&mut self, approved: bool, decided: &StageDecision) {
        if let Some(ext) = self.extension.as_mut() {
            if approved {
                self.due_on = Some(ext.until);
            }
            ext.decision = Some(ExtensionDecision {
                approved,
                decided: decided.clone(),
            });
        }
        self.timeline.push(TimelineStep {
            step: if approved {
                "extension_approved".into()
            } else {
                "extension_rejected".into()
            },
            status: self.status.as_str().to_string(),
            lab_id: Some(self.lab_id),
            actor: decided.actor.clone(),
            at: decided.at,
            remarks: decided.remarks.clone(),
        });
    }
}

// ── Ledger notifications ─────────────────────────────────────────

/// Broadcast to subscribers of a lab when its availability changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum LedgerChange {
    Bound { request_id: Ulid, date: NaiveDate, span: Span },
    Freed { request_id: Ulid, date: NaiveDate, span: Span },
    TimetableChanged { entry_id: Ulid },
}

// ── WAL records ──────────────────────────────────────────────────

/// The event types. This is the WAL record format. Submission events carry
/// full snapshots so compaction can reuse them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DepartmentRegistered {
        department: Department,
    },
    DepartmentAuthoritySet {
        id: Ulid,
        authority: ApprovalAuthority,
    },
    LabRegistered {
        info: LabInfo,
    },
    TimetableEntryAdded {
        entry: TimetableEntry,
    },
    TimetableEntryRemoved {
        id: Ulid,
        lab_id: Ulid,
    },
    BookingSubmitted {
        request: BookingRequest,
    },
    BookingTransitioned {
        transition: LegTransition,
    },
    ComponentRegistered {
        component: Component,
    },
    ComponentRequestSubmitted {
        request: ComponentRequest,
    },
    ComponentTransitioned {
        request_id: Ulid,
        to: ComponentStatus,
        decision: StageDecision,
        idempotency_key: Option<Ulid>,
    },
    ExtensionRequested {
        request_id: Ulid,
        actor: Actor,
        until: NaiveDate,
        reason: String,
        at: Ms,
    },
    ExtensionDecided {
        request_id: Ulid,
        approved: bool,
        decision: StageDecision,
    },
}
