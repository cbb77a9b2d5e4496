use std::sync::Arc;

use chrono::Weekday;
use tokio::sync::{Mutex, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::validate_span;
use super::{check_len, Engine, EngineError};

// Collaborator-owned records. These operations only mirror them into the engine.

impl Engine {
    pub async fn register_department(
        &self,
        id: Ulid,
        name: String,
        authority: ApprovalAuthority,
    ) -> Result<(), EngineError> {
        check_len(&name, MAX_NAME_LEN, "department name too long")?;
        let _gate = self.gate.read().await;
        if self.departments.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let department = Department { id, name, authority };
        self.wal_append(&Event::DepartmentRegistered {
            department: department.clone(),
        })
        .await?;
        self.departments.insert(id, department);
        Ok(())
    }

    /// Applies to requests filed afterwards; open requests keep the authority
    /// captured when they were submitted.
    pub async fn set_department_authority(
        &self,
        id: Ulid,
        authority: ApprovalAuthority,
    ) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        if !self.departments.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.wal_append(&Event::DepartmentAuthoritySet { id, authority })
            .await?;
        if let Some(mut dept) = self.departments.get_mut(&id) {
            dept.authority = authority;
        }
        info!("department {id} final approval now by {}", authority.role().as_str());
        Ok(())
    }

    /// Register a lab, or refresh its record. The ledger is kept on refresh.
    pub async fn register_lab(&self, info: LabInfo) -> Result<(), EngineError> {
        check_len(&info.name, MAX_NAME_LEN, "lab name too long")?;
        if let Some(opening) = &info.opening {
            validate_span(opening)?;
        }
        let _gate = self.gate.read().await;
        if !self.departments.contains_key(&info.department_id) {
            return Err(EngineError::NotFound(info.department_id));
        }

        if let Some(lab) = self.get_lab(&info.id) {
            let mut guard = lab.write().await;
            self.wal_append(&Event::LabRegistered { info: info.clone() })
                .await?;
            guard.info = info;
            return Ok(());
        }

        if self.labs.len() >= MAX_LABS {
            return Err(EngineError::LimitExceeded("too many labs"));
        }
        self.wal_append(&Event::LabRegistered { info: info.clone() })
            .await?;
        self.labs
            .insert(info.id, Arc::new(RwLock::new(LabState::new(info))));
        Ok(())
    }

    pub async fn add_timetable_entry(
        &self,
        id: Ulid,
        lab_id: Ulid,
        weekday: Weekday,
        span: Span,
        label: Option<String>,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        if let Some(l) = &label {
            check_len(l, MAX_NAME_LEN, "timetable label too long")?;
        }
        let _gate = self.gate.read().await;
        if self.timetable_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let lab = self.get_lab(&lab_id).ok_or(EngineError::NotFound(lab_id))?;
        let mut guard = lab.write().await;
        if guard.timetable.len() >= MAX_TIMETABLE_ENTRIES_PER_LAB {
            return Err(EngineError::LimitExceeded("too many timetable entries on lab"));
        }

        let entry = TimetableEntry {
            id,
            lab_id,
            weekday,
            span,
            label,
        };
        self.wal_append(&Event::TimetableEntryAdded {
            entry: entry.clone(),
        })
        .await?;
        guard.add_timetable_entry(entry);
        self.timetable_index.insert(id, lab_id);
        self.notify
            .send(lab_id, LedgerChange::TimetableChanged { entry_id: id });
        Ok(())
    }

    pub async fn remove_timetable_entry(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.gate.read().await;
        let lab_id = self
            .timetable_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let lab = self.get_lab(&lab_id).ok_or(EngineError::NotFound(lab_id))?;
        let mut guard = lab.write().await;

        self.wal_append(&Event::TimetableEntryRemoved { id, lab_id })
            .await?;
        guard.remove_timetable_entry(&id);
        self.timetable_index.remove(&id);
        self.notify
            .send(lab_id, LedgerChange::TimetableChanged { entry_id: id });
        Ok(lab_id)
    }

    /// Register a component, or overwrite its counts from the inventory owner.
    ///
    /// An overwrite must leave room for the units currently out on loan:
    /// `quantity_available + on_loan <= quantity_total`, where `on_loan` is the
    /// old record's `quantity_total - quantity_available`. Otherwise returns
    /// would push stock past the total.
    pub async fn register_component(&self, component: Component) -> Result<(), EngineError> {
        check_len(&component.name, MAX_NAME_LEN, "component name too long")?;
        if component.quantity_available > component.quantity_total {
            return Err(EngineError::LimitExceeded(
                "quantity_available exceeds quantity_total",
            ));
        }
        let _gate = self.gate.read().await;
        if !self.labs.contains_key(&component.lab_id) {
            return Err(EngineError::NotFound(component.lab_id));
        }

        if let Some(existing) = self.get_component_state(&component.id) {
            let mut guard = existing.lock().await;
            let on_loan = guard.on_loan();
            if u64::from(component.quantity_available) + u64::from(on_loan)
                > u64::from(component.quantity_total)
            {
                return Err(EngineError::LimitExceeded(
                    "counts leave no room for units still on loan",
                ));
            }
            self.wal_append(&Event::ComponentRegistered {
                component: component.clone(),
            })
            .await?;
            *guard = component;
            return Ok(());
        }

        if self.components.len() >= MAX_COMPONENTS {
            return Err(EngineError::LimitExceeded("too many components"));
        }
        self.wal_append(&Event::ComponentRegistered {
            component: component.clone(),
        })
        .await?;
        self.components
            .insert(component.id, Arc::new(Mutex::new(component)));
        Ok(())
    }
}
