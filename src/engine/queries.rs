use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::rollup::aggregate;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<BookingRequest, EngineError> {
        let booking = self.get_booking_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = booking.lock().await;
        Ok(guard.clone())
    }

    /// Derived on read from the legs.
    pub async fn aggregate_status(&self, id: Ulid) -> Result<AggregateStatus, EngineError> {
        let booking = self.get_booking_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = booking.lock().await;
        Ok(aggregate(&guard.leg_statuses()))
    }

    /// Audit trail of a booking or a component request.
    pub async fn timeline(&self, id: Ulid) -> Result<Vec<TimelineStep>, EngineError> {
        if let Some(booking) = self.get_booking_state(&id) {
            return Ok(booking.lock().await.timeline.clone());
        }
        let request = self
            .get_component_request_state(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = request.lock().await;
        Ok(guard.timeline.clone())
    }

    /// Approved bookings holding `lab_id` on `date`, in start order.
    pub async fn list_bookings(&self, lab_id: Ulid, date: NaiveDate) -> Result<Vec<Allocation>, EngineError> {
        let lab = self.get_lab(&lab_id).ok_or(EngineError::NotFound(lab_id))?;
        let guard = lab.read().await;
        Ok(guard.allocations_on(date).to_vec())
    }

    pub async fn get_lab_info(&self, lab_id: Ulid) -> Result<LabInfo, EngineError> {
        let lab = self.get_lab(&lab_id).ok_or(EngineError::NotFound(lab_id))?;
        let guard = lab.read().await;
        Ok(guard.info.clone())
    }

    pub async fn get_timetable(&self, lab_id: Ulid) -> Result<Vec<TimetableEntry>, EngineError> {
        let lab = self.get_lab(&lab_id).ok_or(EngineError::NotFound(lab_id))?;
        let guard = lab.read().await;
        Ok(guard.timetable.clone())
    }

    pub fn get_department(&self, id: Ulid) -> Result<Department, EngineError> {
        self.departments
            .get(&id)
            .map(|d| d.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn get_component(&self, id: Ulid) -> Result<Component, EngineError> {
        let component = self.get_component_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = component.lock().await;
        Ok(guard.clone())
    }

    pub async fn get_component_request(&self, id: Ulid) -> Result<ComponentRequest, EngineError> {
        let request = self
            .get_component_request_state(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = request.lock().await;
        Ok(guard.clone())
    }
}
