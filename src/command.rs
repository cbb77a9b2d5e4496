use chrono::{NaiveDate, Weekday};
use serde::Deserialize;
use ulid::Ulid;

use crate::engine::ItemSpec;
use crate::limits::MAX_LINE_LEN;
use crate::model::*;

/// `HH:MM` on the wire, minutes since midnight in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct Clock(pub Minute);

impl TryFrom<String> for Clock {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        parse_clock(&s)
            .map(Clock)
            .ok_or_else(|| format!("invalid clock time {s:?}, expected HH:MM"))
    }
}

/// Unchecked: the engine rejects empty or inverted windows with `InvalidSpan`.
pub fn clock_span(start: Clock, end: Clock) -> Span {
    Span {
        start: start.0,
        end: end.0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Window {
    pub start: Clock,
    pub end: Clock,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Item {
    pub component_id: Ulid,
    pub quantity: u32,
}

/// One request line, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Command {
    RegisterDepartment {
        id: Ulid,
        name: String,
        authority: ApprovalAuthority,
    },
    SetDepartmentAuthority {
        id: Ulid,
        authority: ApprovalAuthority,
    },
    RegisterLab {
        id: Ulid,
        department_id: Ulid,
        name: String,
        location: Option<String>,
        capacity: u32,
        opening: Option<Window>,
        responsible: Option<Contact>,
    },
    AddTimetableEntry {
        id: Ulid,
        lab_id: Ulid,
        weekday: Weekday,
        start: Clock,
        end: Clock,
        label: Option<String>,
    },
    RemoveTimetableEntry {
        id: Ulid,
    },
    RegisterComponent {
        id: Ulid,
        lab_id: Ulid,
        name: String,
        quantity_total: u32,
        quantity_available: u32,
    },
    CreateBooking {
        id: Ulid,
        requester: Actor,
        supervisor: Option<String>,
        lab_ids: Vec<Ulid>,
        date: NaiveDate,
        start: Clock,
        end: Clock,
        purpose: String,
        participants: Option<u32>,
    },
    Act {
        request_id: Ulid,
        lab_id: Option<Ulid>,
        actor: Actor,
        decision: Decision,
        remarks: Option<String>,
        idempotency_key: Option<Ulid>,
    },
    Withdraw {
        request_id: Ulid,
        requester: String,
    },
    WithdrawLab {
        request_id: Ulid,
        lab_id: Ulid,
        requester: String,
    },
    FreeSlots {
        lab_ids: Vec<Ulid>,
        date: NaiveDate,
    },
    GetBooking {
        id: Ulid,
    },
    Timeline {
        id: Ulid,
    },
    ListBookings {
        lab_id: Ulid,
        date: NaiveDate,
    },
    CreateComponentRequest {
        id: Ulid,
        requester: Actor,
        supervisor: Option<String>,
        lab_id: Ulid,
        items: Vec<Item>,
        purpose: String,
        due_on: Option<NaiveDate>,
    },
    ActComponent {
        request_id: Ulid,
        actor: Actor,
        decision: Decision,
        remarks: Option<String>,
        idempotency_key: Option<Ulid>,
    },
    Issue {
        request_id: Ulid,
        actor: Actor,
        idempotency_key: Option<Ulid>,
    },
    RequestReturn {
        request_id: Ulid,
        requester: String,
    },
    ApproveReturn {
        request_id: Ulid,
        actor: Actor,
        remarks: Option<String>,
    },
    RequestExtension {
        request_id: Ulid,
        requester: String,
        until: NaiveDate,
        reason: String,
    },
    DecideExtension {
        request_id: Ulid,
        actor: Actor,
        approve: bool,
        remarks: Option<String>,
    },
    WithdrawComponentRequest {
        request_id: Ulid,
        requester: String,
    },
    GetLab {
        id: Ulid,
    },
    GetComponent {
        id: Ulid,
    },
    GetComponentRequest {
        id: Ulid,
    },
    Listen {
        lab_id: Ulid,
    },
    Unlisten {
        lab_id: Ulid,
    },
    Compact,
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Command::RegisterDepartment { .. } => "register_department",
            Command::SetDepartmentAuthority { .. } => "set_department_authority",
            Command::RegisterLab { .. } => "register_lab",
            Command::AddTimetableEntry { .. } => "add_timetable_entry",
            Command::RemoveTimetableEntry { .. } => "remove_timetable_entry",
            Command::RegisterComponent { .. } => "register_component",
            Command::CreateBooking { .. } => "create_booking",
            Command::Act { .. } => "act",
            Command::Withdraw { .. } => "withdraw",
            Command::WithdrawLab { .. } => "withdraw_lab",
            Command::FreeSlots { .. } => "free_slots",
            Command::GetBooking { .. } => "get_booking",
            Command::Timeline { .. } => "timeline",
            Command::ListBookings { .. } => "list_bookings",
            Command::CreateComponentRequest { .. } => "create_component_request",
            Command::ActComponent { .. } => "act_component",
            Command::Issue { .. } => "issue",
            Command::RequestReturn { .. } => "request_return",
            Command::ApproveReturn { .. } => "approve_return",
            Command::RequestExtension { .. } => "request_extension",
            Command::DecideExtension { .. } => "decide_extension",
            Command::WithdrawComponentRequest { .. } => "withdraw_component_request",
            Command::GetLab { .. } => "get_lab",
            Command::GetComponent { .. } => "get_component",
            Command::GetComponentRequest { .. } => "get_component_request",
            Command::Listen { .. } => "listen",
            Command::Unlisten { .. } => "unlisten",
            Command::Compact => "compact",
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum CommandError {
    Empty,
    TooLong(usize),
    Parse(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Empty => write!(f, "empty command"),
            CommandError::TooLong(n) => write!(f, "command of {n} bytes exceeds {MAX_LINE_LEN}"),
            CommandError::Parse(s) => write!(f, "parse error: {s}"),
        }
    }
}

impl std::error::Error for CommandError {}

pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(CommandError::Empty);
    }
    if line.len() > MAX_LINE_LEN {
        return Err(CommandError::TooLong(line.len()));
    }
    serde_json::from_str(line).map_err(|e| CommandError::Parse(e.to_string()))
}

// ── Conversions into engine inputs ───────────────────────

impl Window {
    pub fn span(&self) -> Span {
        clock_span(self.start, self.end)
    }
}

impl From<Item> for ItemSpec {
    fn from(item: Item) -> Self {
        ItemSpec {
            component_id: item.component_id,
            quantity: item.quantity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_create_booking() {
        let lab = Ulid::new();
        let id = Ulid::new();
        let line = format!(
            r#"{{"op":"create_booking","id":"{id}","requester":{{"id":"s1@campus.edu","role":"student"}},
               "supervisor":"prof@campus.edu","lab_ids":["{lab}"],"date":"2025-03-01",
               "start":"09:30","end":"10:45","purpose":"robotics demo","participants":12}}"#
        );
        match parse_command(&line).unwrap() {
            Command::CreateBooking {
                id: got,
                requester,
                supervisor,
                lab_ids,
                date,
                start,
                end,
                participants,
                ..
            } => {
                assert_eq!(got, id);
                assert_eq!(requester, Actor::new("s1@campus.edu", Role::Student));
                assert_eq!(supervisor.as_deref(), Some("prof@campus.edu"));
                assert_eq!(lab_ids, vec![lab]);
                assert_eq!(date, NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());
                assert_eq!(clock_span(start, end), Span::new(570, 645));
                assert_eq!(participants, Some(12));
            }
            other => panic!("expected CreateBooking, got {other:?}"),
        }
    }

    #[test]
    fn parse_act_defaults_optional_fields() {
        let id = Ulid::new();
        let line = format!(
            r#"{{"op":"act","request_id":"{id}","actor":{{"id":"h","role":"hod"}},"decision":"approve"}}"#
        );
        assert_eq!(
            parse_command(&line).unwrap(),
            Command::Act {
                request_id: id,
                lab_id: None,
                actor: Actor::new("h", Role::Hod),
                decision: Decision::Approve,
                remarks: None,
                idempotency_key: None,
            }
        );
    }

    #[test]
    fn parse_timetable_weekday() {
        let (id, lab) = (Ulid::new(), Ulid::new());
        let line = format!(
            r#"{{"op":"add_timetable_entry","id":"{id}","lab_id":"{lab}","weekday":"Mon","start":"08:00","end":"10:00"}}"#
        );
        match parse_command(&line).unwrap() {
            Command::AddTimetableEntry { weekday, start, end, label, .. } => {
                assert_eq!(weekday, Weekday::Mon);
                assert_eq!((start, end), (Clock(480), Clock(600)));
                assert_eq!(label, None);
            }
            other => panic!("expected AddTimetableEntry, got {other:?}"),
        }
    }

    #[test]
    fn unit_command() {
        assert_eq!(parse_command(r#"{"op":"compact"}"#).unwrap(), Command::Compact);
    }

    #[test]
    fn bad_clock_is_rejected() {
        let line = format!(
            r#"{{"op":"list_bookings","lab_id":"{}","date":"2025-03-01"}}"#,
            Ulid::new()
        );
        assert!(parse_command(&line).is_ok());

        let line = format!(
            r#"{{"op":"add_timetable_entry","id":"{}","lab_id":"{}","weekday":"Mon","start":"8am","end":"10:00"}}"#,
            Ulid::new(),
            Ulid::new()
        );
        match parse_command(&line) {
            Err(CommandError::Parse(msg)) => assert!(msg.contains("HH:MM")),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_op_and_fields() {
        assert!(matches!(
            parse_command(r#"{"op":"drop_everything"}"#),
            Err(CommandError::Parse(_))
        ));
        assert!(matches!(
            parse_command(&format!(r#"{{"op":"get_booking","id":"{}","x":1}}"#, Ulid::new())),
            Err(CommandError::Parse(_))
        ));
        assert_eq!(parse_command("   "), Err(CommandError::Empty));
        assert!(matches!(
            parse_command(&"x".repeat(MAX_LINE_LEN + 1)),
            Err(CommandError::TooLong(_))
        ));
    }

    #[test]
    fn labels_match_op_names() {
        let cmd = parse_command(&format!(r#"{{"op":"get_component_request","id":"{}"}}"#, Ulid::new())).unwrap();
        assert_eq!(cmd.label(), "get_component_request");
    }
}
