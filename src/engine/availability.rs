use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::interval::{contained_in, intersect_all, normalize, subtract_intervals};
use super::{Engine, EngineError};

// ── Availability (pure, read-only over the ledger) ────────────────

/// Busy time on `date`: fixed timetable for that weekday plus approved bookings.
fn busy_spans(lab: &LabState, date: NaiveDate) -> Vec<Span> {
    let mut busy: Vec<Span> = lab.timetable_on(date).map(|e| e.span).collect();
    busy.extend(lab.allocations_on(date).iter().map(|a| a.span));
    normalize(busy)
}

/// Opening hours minus fixed timetable minus approved bookings.
pub fn free_slots(lab: &LabState, date: NaiveDate) -> Vec<Span> {
    subtract_intervals(&[lab.opening()], &busy_spans(lab, date))
}

/// Parts of `span` that are not free on `date`. Empty means bookable.
pub fn uncovered(lab: &LabState, date: NaiveDate, span: &Span) -> Vec<Span> {
    subtract_intervals(&[*span], &free_slots(lab, date))
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if !span.is_valid() {
        return Err(EngineError::InvalidSpan(*span));
    }
    Ok(())
}

/// The authoritative final-approval check. Caller holds the lab's write lock.
pub(super) fn check_bindable(lab: &LabState, date: NaiveDate, span: &Span) -> Result<(), EngineError> {
    let free = free_slots(lab, date);
    if contained_in(&free, span) {
        return Ok(());
    }
    let blocked_by = lab
        .allocations_on(date)
        .iter()
        .find(|a| a.span.overlaps(span))
        .map(|a| a.request_id);
    Err(EngineError::SlotNoLongerAvailable {
        lab_id: lab.info.id,
        date,
        requested: *span,
        conflicting: subtract_intervals(&[*span], &free),
        blocked_by,
    })
}

impl Engine {
    pub async fn free_slots(&self, lab_id: Ulid, date: NaiveDate) -> Result<Vec<Span>, EngineError> {
        let lab = self.get_lab(&lab_id).ok_or(EngineError::NotFound(lab_id))?;
        let guard = lab.read().await;
        Ok(free_slots(&guard, date))
    }

    /// Intervals free in every lab of `lab_ids` on `date`.
    pub async fn common_free_slots(
        &self,
        lab_ids: &[Ulid],
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        if lab_ids.is_empty() {
            return Ok(Vec::new());
        }
        if lab_ids.len() > MAX_QUERY_LABS {
            return Err(EngineError::LimitExceeded("too many labs in query"));
        }
        let mut ids = lab_ids.to_vec();
        ids.sort();
        ids.dedup();

        // Hold every read lock together so the answer is one consistent snapshot.
        let mut guards = Vec::with_capacity(ids.len());
        for id in &ids {
            let lab = self.get_lab(id).ok_or(EngineError::NotFound(*id))?;
            guards.push(lab.read_owned().await);
        }
        let per_lab: Vec<Vec<Span>> = guards.iter().map(|g| free_slots(g, date)).collect();
        Ok(intersect_all(&per_lab))
    }

    /// Free slots for one lab, or the common free slots of several.
    pub async fn query_free_slots(
        &self,
        lab_ids: &[Ulid],
        date: NaiveDate,
    ) -> Result<Vec<Span>, EngineError> {
        match lab_ids {
            [single] => self.free_slots(*single, date).await,
            _ => self.common_free_slots(lab_ids, date).await,
        }
    }

    /// True if `span` is not fully inside one free interval of the lab.
    pub async fn has_conflict(
        &self,
        lab_id: Ulid,
        date: NaiveDate,
        span: Span,
    ) -> Result<bool, EngineError> {
        validate_span(&span)?;
        let free = self.free_slots(lab_id, date).await?;
        Ok(!contained_in(&free, &span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Weekday;

    fn lab(opening: Option<Span>) -> LabState {
        LabState::new(LabInfo {
            id: Ulid::new(),
            department_id: Ulid::new(),
            name: "Lab A".into(),
            location: Some("Block C".into()),
            capacity: 40,
            opening,
            responsible: None,
        })
    }

    fn saturday() -> NaiveDate {
        // 2025-03-01 is a Saturday
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    fn book(lab: &mut LabState, date: NaiveDate, span: Span) -> Ulid {
        let request_id = Ulid::new();
        lab.bind(Allocation { request_id, date, span });
        request_id
    }

    #[test]
    fn empty_lab_is_free_all_day() {
        assert_eq!(free_slots(&lab(None), saturday()), vec![Span::FULL_DAY]);
    }

    #[test]
    fn opening_hours_bound_the_day() {
        let l = lab(Some(Span::new(480, 1080)));
        assert_eq!(free_slots(&l, saturday()), vec![Span::new(480, 1080)]);
        assert_eq!(uncovered(&l, saturday(), &Span::new(420, 540)), vec![Span::new(420, 480)]);
    }

    #[test]
    fn bookings_and_timetable_are_subtracted() {
        let mut l = lab(None);
        book(&mut l, saturday(), Span::new(600, 660));
        l.add_timetable_entry(TimetableEntry {
            id: Ulid::new(),
            lab_id: l.info.id,
            weekday: Weekday::Sat,
            span: Span::new(540, 600),
            label: None,
        });
        l.add_timetable_entry(TimetableEntry {
            id: Ulid::new(),
            lab_id: l.info.id,
            weekday: Weekday::Mon,
            span: Span::new(0, 1440),
            label: None,
        });
        assert_eq!(
            free_slots(&l, saturday()),
            vec![Span::new(0, 540), Span::new(660, 1440)]
        );
    }

    #[test]
    fn other_dates_do_not_interfere() {
        let mut l = lab(None);
        book(&mut l, saturday().succ_opt().unwrap(), Span::new(600, 660));
        assert_eq!(free_slots(&l, saturday()), vec![Span::FULL_DAY]);
    }

    #[test]
    fn free_slots_is_idempotent() {
        let mut l = lab(Some(Span::new(480, 1200)));
        book(&mut l, saturday(), Span::new(500, 520));
        book(&mut l, saturday(), Span::new(700, 800));
        let first = free_slots(&l, saturday());
        assert_eq!(first, free_slots(&l, saturday()));
        assert_eq!(
            first,
            vec![Span::new(480, 500), Span::new(520, 700), Span::new(800, 1200)]
        );
    }

    #[test]
    fn bindable_check_reports_blocking_request() {
        let mut l = lab(None);
        let holder = book(&mut l, saturday(), Span::new(540, 600));
        match check_bindable(&l, saturday(), &Span::new(570, 630)) {
            Err(EngineError::SlotNoLongerAvailable {
                conflicting,
                blocked_by,
                ..
            }) => {
                assert_eq!(conflicting, vec![Span::new(570, 600)]);
                assert_eq!(blocked_by, Some(holder));
            }
            other => panic!("expected conflict, got {other:?}"),
        }
        assert!(check_bindable(&l, saturday(), &Span::new(600, 660)).is_ok());
    }

    #[test]
    fn bindable_check_respects_timetable() {
        let mut l = lab(None);
        l.add_timetable_entry(TimetableEntry {
            id: Ulid::new(),
            lab_id: l.info.id,
            weekday: Weekday::Sat,
            span: Span::new(600, 720),
            label: Some("EE201 practical".into()),
        });
        let err = check_bindable(&l, saturday(), &Span::new(690, 750)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::SlotNoLongerAvailable { blocked_by: None, .. }
        ));
    }
}
