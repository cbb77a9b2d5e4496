use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use ulid::Ulid;

use crate::command::{clock_span, parse_command, Command};
use crate::engine::{
    aggregate, ActComponentRequest, ActRequest, BookingReceipt, BookingSpec, ComponentReceipt,
    ComponentRequestSpec, Engine, EngineError,
};
use crate::limits::*;
use crate::model::*;
use crate::observability;

const NOTIFY_BUFFER: usize = 256;

/// Forwarding tasks for `listen`, aborted when the connection goes away.
#[derive(Default)]
struct Listeners(HashMap<Ulid, JoinHandle<()>>);

impl Listeners {
    fn listen(&mut self, lab_id: Ulid, rx: broadcast::Receiver<LedgerChange>, tx: mpsc::Sender<Value>) {
        if self.0.contains_key(&lab_id) {
            return;
        }
        self.0.insert(lab_id, tokio::spawn(forward(lab_id, rx, tx)));
    }

    fn unlisten(&mut self, lab_id: &Ulid) -> bool {
        self.0.remove(lab_id).map(|h| h.abort()).is_some()
    }
}

impl Drop for Listeners {
    fn drop(&mut self) {
        for (_, handle) in self.0.drain() {
            handle.abort();
        }
    }
}

async fn forward(lab_id: Ulid, mut rx: broadcast::Receiver<LedgerChange>, tx: mpsc::Sender<Value>) {
    loop {
        match rx.recv().await {
            Ok(change) => {
                if tx.send(notification(lab_id, &change)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("listener on {lab_id} skipped {n} changes");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Serve one client: newline-delimited JSON commands in, one JSON reply per
/// line out, interleaved with `notify` lines for labs the client listens on.
pub async fn process_connection<S>(stream: S, engine: Arc<Engine>) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (notify_tx, mut notify_rx) = mpsc::channel::<Value>(NOTIFY_BUFFER);
    let mut listeners = Listeners::default();

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => return Ok(()),
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        framed.send(error_reply("bad_request", "line too long").to_string()).await?;
                        continue;
                    }
                    Some(Err(e)) => return Err(e),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = handle_line(&engine, &line, &mut listeners, &notify_tx).await;
                framed.send(reply.to_string()).await?;
            }
            Some(note) = notify_rx.recv() => {
                framed.send(note.to_string()).await?;
            }
        }
    }
}

async fn handle_line(
    engine: &Engine,
    line: &str,
    listeners: &mut Listeners,
    notify_tx: &mpsc::Sender<Value>,
) -> Value {
    let cmd = match parse_command(line) {
        Ok(cmd) => cmd,
        Err(e) => {
            metrics::counter!(observability::COMMANDS_TOTAL, "op" => "invalid", "status" => "error")
                .increment(1);
            return error_reply("bad_request", &e.to_string());
        }
    };

    let op = cmd.label();
    let started = Instant::now();
    let result = execute(engine, cmd, listeners, notify_tx).await;
    metrics::histogram!(observability::COMMAND_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(observability::COMMANDS_TOTAL, "op" => op, "status" => status).increment(1);

    match result {
        Ok(value) => json!({ "ok": value }),
        Err(e) => {
            debug!("{op} failed: {e}");
            engine_error(&e)
        }
    }
}

async fn execute(
    engine: &Engine,
    cmd: Command,
    listeners: &mut Listeners,
    notify_tx: &mpsc::Sender<Value>,
) -> Result<Value, EngineError> {
    match cmd {
        Command::RegisterDepartment { id, name, authority } => {
            engine.register_department(id, name, authority).await?;
            Ok(json!({ "id": id }))
        }
        Command::SetDepartmentAuthority { id, authority } => {
            engine.set_department_authority(id, authority).await?;
            Ok(json!({ "id": id, "authority": authority }))
        }
        Command::RegisterLab {
            id,
            department_id,
            name,
            location,
            capacity,
            opening,
            responsible,
        } => {
            engine
                .register_lab(LabInfo {
                    id,
                    department_id,
                    name,
                    location,
                    capacity,
                    opening: opening.map(|w| w.span()),
                    responsible,
                })
                .await?;
            Ok(json!({ "id": id }))
        }
        Command::AddTimetableEntry {
            id,
            lab_id,
            weekday,
            start,
            end,
            label,
        } => {
            engine
                .add_timetable_entry(id, lab_id, weekday, clock_span(start, end), label)
                .await?;
            Ok(json!({ "id": id }))
        }
        Command::RemoveTimetableEntry { id } => {
            let lab_id = engine.remove_timetable_entry(id).await?;
            Ok(json!({ "id": id, "lab_id": lab_id }))
        }
        Command::RegisterComponent {
            id,
            lab_id,
            name,
            quantity_total,
            quantity_available,
        } => {
            engine
                .register_component(Component {
                    id,
                    lab_id,
                    name,
                    quantity_total,
                    quantity_available,
                })
                .await?;
            Ok(json!({ "id": id }))
        }
        Command::CreateBooking {
            id,
            requester,
            supervisor,
            lab_ids,
            date,
            start,
            end,
            purpose,
            participants,
        } => {
            let receipt = engine
                .create_booking(BookingSpec {
                    id,
                    requester,
                    supervisor,
                    lab_ids,
                    date,
                    span: clock_span(start, end),
                    purpose,
                    participants,
                })
                .await?;
            Ok(booking_receipt(&receipt))
        }
        Command::Act {
            request_id,
            lab_id,
            actor,
            decision,
            remarks,
            idempotency_key,
        } => {
            let status = engine
                .act(ActRequest {
                    request_id,
                    lab_id,
                    actor,
                    decision,
                    remarks,
                    idempotency_key,
                })
                .await?;
            Ok(json!(status))
        }
        Command::Withdraw {
            request_id,
            requester,
        } => Ok(json!(engine.withdraw(request_id, &requester).await?)),
        Command::WithdrawLab {
            request_id,
            lab_id,
            requester,
        } => Ok(json!(engine.withdraw_lab(request_id, lab_id, &requester).await?)),
        Command::FreeSlots { lab_ids, date } => {
            let free = engine.query_free_slots(&lab_ids, date).await?;
            Ok(json!({ "date": date, "free": spans(&free) }))
        }
        Command::GetBooking { id } => Ok(booking_view(&engine.get_booking(id).await?)),
        Command::Timeline { id } => Ok(json!(engine.timeline(id).await?)),
        Command::ListBookings { lab_id, date } => {
            let ledger: Vec<Value> = engine
                .list_bookings(lab_id, date)
                .await?
                .iter()
                .map(|a| json!({ "request_id": a.request_id, "date": a.date, "span": a.span.to_string() }))
                .collect();
            Ok(Value::Array(ledger))
        }
        Command::CreateComponentRequest {
            id,
            requester,
            supervisor,
            lab_id,
            items,
            purpose,
            due_on,
        } => {
            let receipt = engine
                .create_component_request(ComponentRequestSpec {
                    id,
                    requester,
                    supervisor,
                    lab_id,
                    items: items.into_iter().map(Into::into).collect(),
                    purpose,
                    due_on,
                })
                .await?;
            Ok(component_receipt(&receipt))
        }
        Command::ActComponent {
            request_id,
            actor,
            decision,
            remarks,
            idempotency_key,
        } => {
            let status = engine
                .act_component(ActComponentRequest {
                    request_id,
                    actor,
                    decision,
                    remarks,
                    idempotency_key,
                })
                .await?;
            Ok(json!({ "status": status }))
        }
        Command::Issue {
            request_id,
            actor,
            idempotency_key,
        } => {
            let status = engine.issue(request_id, actor, idempotency_key).await?;
            Ok(json!({ "status": status }))
        }
        Command::RequestReturn {
            request_id,
            requester,
        } => {
            let status = engine.request_return(request_id, &requester).await?;
            Ok(json!({ "status": status }))
        }
        Command::ApproveReturn {
            request_id,
            actor,
            remarks,
        } => {
            let status = engine.approve_return(request_id, actor, remarks).await?;
            Ok(json!({ "status": status }))
        }
        Command::RequestExtension {
            request_id,
            requester,
            until,
            reason,
        } => {
            engine
                .request_extension(request_id, &requester, until, reason)
                .await?;
            Ok(json!({ "request_id": request_id, "extension_requested_until": until }))
        }
        Command::DecideExtension {
            request_id,
            actor,
            approve,
            remarks,
        } => {
            let due_on = engine
                .decide_extension(request_id, actor, approve, remarks)
                .await?;
            Ok(json!({ "request_id": request_id, "approved": approve, "due_on": due_on }))
        }
        Command::WithdrawComponentRequest {
            request_id,
            requester,
        } => {
            let status = engine
                .withdraw_component_request(request_id, &requester)
                .await?;
            Ok(json!({ "status": status }))
        }
        Command::GetLab { id } => {
            let info = engine.get_lab_info(id).await?;
            let timetable = engine.get_timetable(id).await?;
            Ok(lab_view(&info, &timetable))
        }
        Command::GetComponent { id } => Ok(json!(engine.get_component(id).await?)),
        Command::GetComponentRequest { id } => {
            Ok(json!(engine.get_component_request(id).await?))
        }
        Command::Listen { lab_id } => {
            if engine.get_lab(&lab_id).is_none() {
                return Err(EngineError::NotFound(lab_id));
            }
            if listeners.0.len() >= MAX_QUERY_LABS {
                return Err(EngineError::LimitExceeded("too many listened labs"));
            }
            listeners.listen(lab_id, engine.subscribe(lab_id), notify_tx.clone());
            Ok(json!({ "listening": lab_id }))
        }
        Command::Unlisten { lab_id } => {
            let was = listeners.unlisten(&lab_id);
            Ok(json!({ "unlistened": lab_id, "was_listening": was }))
        }
        Command::Compact => {
            engine.compact_wal().await?;
            Ok(json!({ "compacted": true }))
        }
    }
}

// ── Rendering ────────────────────────────────────────────

fn spans(spans: &[Span]) -> Value {
    Value::Array(spans.iter().map(|s| Value::String(s.to_string())).collect())
}

fn booking_receipt(receipt: &BookingReceipt) -> Value {
    let conflicts: Vec<Value> = receipt
        .conflicts
        .iter()
        .map(|c| json!({ "lab_id": c.lab_id, "conflicting": spans(&c.conflicting) }))
        .collect();
    json!({
        "id": receipt.id,
        "status": receipt.status,
        "conflicts": conflicts,
    })
}

fn component_receipt(receipt: &ComponentReceipt) -> Value {
    json!({
        "id": receipt.id,
        "status": receipt.status,
        "shortfalls": receipt.shortfalls,
    })
}

fn booking_view(b: &BookingRequest) -> Value {
    json!({
        "id": b.id,
        "requested_by": b.requested_by,
        "initiator": b.initiator,
        "date": b.date,
        "span": b.span.to_string(),
        "purpose": b.purpose,
        "participants": b.participants,
        "is_multi_lab": b.is_multi_lab,
        "highest_approval_authority": b.highest_approval_authority,
        "status": aggregate(&b.leg_statuses()),
        "legs": b.legs,
        "created_at": b.created_at,
        "timeline": b.timeline,
    })
}

fn lab_view(info: &LabInfo, timetable: &[TimetableEntry]) -> Value {
    let entries: Vec<Value> = timetable
        .iter()
        .map(|e| json!({ "id": e.id, "weekday": e.weekday, "span": e.span.to_string(), "label": e.label }))
        .collect();
    json!({
        "id": info.id,
        "department_id": info.department_id,
        "name": info.name,
        "location": info.location,
        "capacity": info.capacity,
        "opening": info.opening.unwrap_or(Span::FULL_DAY).to_string(),
        "responsible": info.responsible,
        "timetable": entries,
    })
}

fn notification(lab_id: Ulid, change: &LedgerChange) -> Value {
    let change = match change {
        LedgerChange::Bound {
            request_id,
            date,
            span,
        } => json!({ "change": "bound", "request_id": request_id, "date": date, "span": span.to_string() }),
        LedgerChange::Freed {
            request_id,
            date,
            span,
        } => json!({ "change": "freed", "request_id": request_id, "date": date, "span": span.to_string() }),
        LedgerChange::TimetableChanged { entry_id } => {
            json!({ "change": "timetable_changed", "entry_id": entry_id })
        }
    };
    json!({ "notify": { "lab_id": lab_id, "change": change } })
}

fn error_reply(kind: &str, message: &str) -> Value {
    json!({ "error": { "kind": kind, "message": message } })
}

/// Error kind plus the details a caller needs to re-decide without re-reading.
fn engine_error(e: &EngineError) -> Value {
    let mut body = Map::new();
    body.insert("kind".into(), json!(e.kind()));
    body.insert("message".into(), json!(e.to_string()));
    match e {
        EngineError::SlotNoLongerAvailable {
            lab_id,
            date,
            requested,
            conflicting,
            blocked_by,
        } => {
            body.insert("lab_id".into(), json!(lab_id));
            body.insert("date".into(), json!(date));
            body.insert("requested".into(), json!(requested.to_string()));
            body.insert("conflicting".into(), spans(conflicting));
            body.insert("blocked_by".into(), json!(blocked_by));
        }
        EngineError::InsufficientInventory {
            component_id,
            requested,
            available,
        } => {
            body.insert("component_id".into(), json!(component_id));
            body.insert("requested".into(), json!(requested));
            body.insert("available".into(), json!(available));
        }
        _ => {}
    }
    json!({ "error": body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_error_carries_clock_spans() {
        let holder = Ulid::new();
        let err = EngineError::SlotNoLongerAvailable {
            lab_id: Ulid::new(),
            date: chrono::NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            requested: Span::new(570, 630),
            conflicting: vec![Span::new(570, 600)],
            blocked_by: Some(holder),
        };
        let v = engine_error(&err);
        assert_eq!(v["error"]["kind"], "slot_no_longer_available");
        assert_eq!(v["error"]["requested"], "09:30-10:30");
        assert_eq!(v["error"]["conflicting"][0], "09:30-10:00");
        assert_eq!(v["error"]["blocked_by"], holder.to_string());
        assert_eq!(v["error"]["date"], "2025-03-01");
    }

    #[test]
    fn plain_error_has_kind_and_message() {
        let v = engine_error(&EngineError::MissingRemarks);
        assert_eq!(v["error"]["kind"], "missing_remarks");
        assert!(v["error"]["message"].as_str().unwrap().contains("remarks"));
        assert!(v["error"].get("conflicting").is_none());
    }

    #[test]
    fn aggregate_status_renders_flat() {
        assert_eq!(json!(AggregateStatus::PendingHod), json!({ "status": "pending_hod" }));
        assert_eq!(
            json!(AggregateStatus::PartiallyWithdrawn { active: 1 }),
            json!({ "status": "partially_withdrawn", "active": 1 })
        );
    }

    #[test]
    fn notification_shape() {
        let lab = Ulid::new();
        let v = notification(
            lab,
            &LedgerChange::Freed {
                request_id: Ulid::new(),
                date: chrono::NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
                span: Span::new(600, 660),
            },
        );
        assert_eq!(v["notify"]["lab_id"], lab.to_string());
        assert_eq!(v["notify"]["change"]["change"], "freed");
        assert_eq!(v["notify"]["change"]["span"], "10:00-11:00");
    }
}
