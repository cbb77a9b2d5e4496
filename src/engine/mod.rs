mod availability;
mod booking;
mod chain;
mod component;
mod directory;
mod error;
mod interval;
mod queries;
mod rollup;

pub use availability::{free_slots, uncovered};
pub use booking::{ActRequest, BookingReceipt, BookingSpec, SlotConflict};
pub use chain::{decide, initial_stage, next_required_role, next_stage, Step};
pub use component::{ActComponentRequest, ComponentReceipt, ComponentRequestSpec, ItemSpec, Shortfall};
pub use error::EngineError;
pub use interval::{contained_in, intersect_all, merge_overlapping, normalize, subtract_intervals};
pub use rollup::aggregate;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedLabState = Arc<RwLock<LabState>>;
pub type SharedBooking = Arc<Mutex<BookingRequest>>;
pub type SharedComponent = Arc<Mutex<Component>>;
pub type SharedComponentRequest = Arc<Mutex<ComponentRequest>>;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn check_len(text: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if text.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

// ── Group-commit WAL writer ──────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes the first append, drains whatever else is already
/// queued, then pays for a single fsync and answers every waiter.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<PendingAppend> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        let mut deferred = None;
        match cmd {
            WalCommand::Append { event, response } => {
                batch.push((event, response));
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                commit_batch(&mut wal, &mut batch);
            }
            other => deferred = Some(other),
        }
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes never leak into
    // the next batch; the whole batch is reported as failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// Arbitration engine: directory, availability ledger, and the request state machines.
///
/// Locks: each lab ledger is an `RwLock`, each request and component a `Mutex`.
/// Acquisition order is always request first, then labs or components sorted
/// by id, so the final-approval check and the commit that follows it happen
/// under the same lab write locks.
pub struct Engine {
    pub(super) departments: DashMap<Ulid, Department>,
    pub(super) labs: DashMap<Ulid, SharedLabState>,
    /// Reverse lookup: timetable entry id → lab id.
    pub(super) timetable_index: DashMap<Ulid, Ulid>,
    pub(super) components: DashMap<Ulid, SharedComponent>,
    pub(super) bookings: DashMap<Ulid, SharedBooking>,
    pub(super) component_requests: DashMap<Ulid, SharedComponentRequest>,
    /// Mutations hold this shared; compaction holds it exclusively so a
    /// snapshot never races an append.
    pub(super) gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply a ledger effect to a locked lab, returning the change to broadcast.
pub(super) fn apply_effect(lab: &mut LabState, effect: &LedgerEffect) -> Option<LedgerChange> {
    match effect {
        LedgerEffect::Bind { allocation, .. } => {
            lab.bind(allocation.clone());
            Some(LedgerChange::Bound {
                request_id: allocation.request_id,
                date: allocation.date,
                span: allocation.span,
            })
        }
        LedgerEffect::Free { request_id, .. } => {
            lab.free(request_id).map(|a| LedgerChange::Freed {
                request_id: a.request_id,
                date: a.date,
                span: a.span,
            })
        }
    }
}

fn effect_lab(effect: &LedgerEffect) -> Ulid {
    match effect {
        LedgerEffect::Bind { lab_id, .. } | LedgerEffect::Free { lab_id, .. } => *lab_id,
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_tail {
            warn!(
                "discarded torn tail of {} after {} events",
                wal_path.display(),
                replay.events.len()
            );
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            departments: DashMap::new(),
            labs: DashMap::new(),
            timetable_index: DashMap::new(),
            components: DashMap::new(),
            bookings: DashMap::new(),
            component_requests: DashMap::new(),
            gate: RwLock::new(()),
            wal_tx,
            notify,
        };
        for event in replay.events {
            engine.restore(event);
        }
        Ok(engine)
    }

    /// Rebuild in-memory state from one logged event. Runs before the engine
    /// is shared, so every `try_*` lock is uncontended.
    fn restore(&self, event: Event) {
        match event {
            Event::DepartmentRegistered { department } => {
                self.departments.insert(department.id, department);
            }
            Event::DepartmentAuthoritySet { id, authority } => {
                if let Some(mut dept) = self.departments.get_mut(&id) {
                    dept.authority = authority;
                }
            }
            Event::LabRegistered { info } => self.restore_lab(info),
            Event::TimetableEntryAdded { entry } => {
                if let Some(lab) = self.get_lab(&entry.lab_id)
                    && let Ok(mut guard) = lab.try_write()
                {
                    self.timetable_index.insert(entry.id, entry.lab_id);
                    guard.add_timetable_entry(entry);
                }
            }
            Event::TimetableEntryRemoved { id, lab_id } => {
                if let Some(lab) = self.get_lab(&lab_id)
                    && let Ok(mut guard) = lab.try_write()
                {
                    guard.remove_timetable_entry(&id);
                }
                self.timetable_index.remove(&id);
            }
            Event::BookingSubmitted { request } => {
                for leg in request.legs.iter().filter(|l| l.status == BookingStatus::Approved) {
                    self.restore_effect(&LedgerEffect::Bind {
                        lab_id: leg.lab_id,
                        allocation: Allocation {
                            request_id: request.id,
                            date: request.date,
                            span: request.span,
                        },
                    });
                }
                self.bookings.insert(request.id, Arc::new(Mutex::new(request)));
            }
            Event::BookingTransitioned { transition } => {
                let Some(booking) = self.get_booking_state(&transition.request_id) else {
                    return;
                };
                let effects = match booking.try_lock() {
                    Ok(mut guard) => guard.apply_transition(&transition),
                    Err(_) => return,
                };
                for effect in &effects {
                    self.restore_effect(effect);
                }
            }
            Event::ComponentRegistered { component } => {
                self.components
                    .insert(component.id, Arc::new(Mutex::new(component)));
            }
            Event::ComponentRequestSubmitted { request } => {
                self.component_requests
                    .insert(request.id, Arc::new(Mutex::new(request)));
            }
            Event::ComponentTransitioned {
                request_id,
                to,
                decision,
                idempotency_key,
            } => {
                let Some(req) = self.get_component_request_state(&request_id) else {
                    return;
                };
                let deltas = match req.try_lock() {
                    Ok(mut guard) => guard.apply_transition(to, &decision, idempotency_key),
                    Err(_) => return,
                };
                for (component_id, delta) in deltas {
                    if let Some(c) = self.get_component_state(&component_id)
                        && let Ok(mut guard) = c.try_lock()
                        && !guard.apply_delta(delta)
                    {
                        warn!("replay: stock of component {component_id} clamped after {delta:+}");
                    }
                }
            }
            Event::ExtensionRequested {
                request_id,
                actor,
                until,
                reason,
                at,
            } => {
                if let Some(req) = self.get_component_request_state(&request_id)
                    && let Ok(mut guard) = req.try_lock()
                {
                    guard.apply_extension_request(&actor, until, &reason, at);
                }
            }
            Event::ExtensionDecided {
                request_id,
                approved,
                decision,
            } => {
                if let Some(req) = self.get_component_request_state(&request_id)
                    && let Ok(mut guard) = req.try_lock()
                {
                    guard.apply_extension_decision(approved, &decision);
                }
            }
        }
    }

    fn restore_lab(&self, info: LabInfo) {
        if let Some(lab) = self.get_lab(&info.id) {
            if let Ok(mut guard) = lab.try_write() {
                guard.info = info;
            }
            return;
        }
        self.labs.insert(info.id, Arc::new(RwLock::new(LabState::new(info))));
    }

    fn restore_effect(&self, effect: &LedgerEffect) {
        if let Some(lab) = self.get_lab(&effect_lab(effect))
            && let Ok(mut guard) = lab.try_write()
        {
            apply_effect(&mut guard, effect);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Apply ledger effects to already-locked labs and broadcast them.
    pub(super) fn commit_effects(
        &self,
        effects: &[LedgerEffect],
        locked: &mut [(Ulid, tokio::sync::OwnedRwLockWriteGuard<LabState>)],
    ) {
        for effect in effects {
            let lab_id = effect_lab(effect);
            if let Some((_, guard)) = locked.iter_mut().find(|(id, _)| *id == lab_id)
                && let Some(change) = apply_effect(guard, effect)
            {
                self.notify.send(lab_id, change);
            }
        }
    }

    /// Write-lock a set of labs in id order.
    pub(super) async fn lock_labs(
        &self,
        lab_ids: &[Ulid],
    ) -> Result<Vec<(Ulid, tokio::sync::OwnedRwLockWriteGuard<LabState>)>, EngineError> {
        let mut ids = lab_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let lab = self.get_lab(&id).ok_or(EngineError::NotFound(id))?;
            guards.push((id, lab.write_owned().await));
        }
        Ok(guards)
    }

    pub fn get_lab(&self, id: &Ulid) -> Option<SharedLabState> {
        self.labs.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_booking_state(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_component_state(&self, id: &Ulid) -> Option<SharedComponent> {
        self.components.get(id).map(|e| e.value().clone())
    }

    pub(super) fn get_component_request_state(&self, id: &Ulid) -> Option<SharedComponentRequest> {
        self.component_requests.get(id).map(|e| e.value().clone())
    }

    pub(super) fn authority_of(&self, department_id: &Ulid) -> Result<ApprovalAuthority, EngineError> {
        self.departments
            .get(department_id)
            .map(|d| d.authority)
            .ok_or(EngineError::NotFound(*department_id))
    }

    pub fn subscribe(&self, lab_id: Ulid) -> tokio::sync::broadcast::Receiver<LedgerChange> {
        self.notify.subscribe(lab_id)
    }

    /// Rewrite the WAL as one snapshot event per live entity.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        let mut events = Vec::new();

        let departments: Vec<Department> =
            self.departments.iter().map(|e| e.value().clone()).collect();
        events.extend(
            departments
                .into_iter()
                .map(|department| Event::DepartmentRegistered { department }),
        );

        let labs: Vec<SharedLabState> = self.labs.iter().map(|e| e.value().clone()).collect();
        let mut timetable = Vec::new();
        for lab in labs {
            let guard = lab.read().await;
            events.push(Event::LabRegistered {
                info: guard.info.clone(),
            });
            timetable.extend(guard.timetable.iter().cloned());
        }
        events.extend(timetable.into_iter().map(|entry| Event::TimetableEntryAdded { entry }));

        let components: Vec<SharedComponent> =
            self.components.iter().map(|e| e.value().clone()).collect();
        for c in components {
            events.push(Event::ComponentRegistered {
                component: c.lock().await.clone(),
            });
        }

        let bookings: Vec<SharedBooking> = self.bookings.iter().map(|e| e.value().clone()).collect();
        for b in bookings {
            events.push(Event::BookingSubmitted {
                request: b.lock().await.clone(),
            });
        }

        let requests: Vec<SharedComponentRequest> = self
            .component_requests
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for r in requests {
            events.push(Event::ComponentRequestSubmitted {
                request: r.lock().await.clone(),
            });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
