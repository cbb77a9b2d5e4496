use crate::model::*;

/// Aggregate status of a booking from its per-lab legs.
///
/// - every leg closed: `withdrawn` if any leg was withdrawn, else `rejected`
/// - some legs closed, some active: `partially_withdrawn` with the active count
/// - otherwise the least-advanced leg decides, so `approved` needs every leg approved
pub fn aggregate(legs: &[BookingStatus]) -> AggregateStatus {
    let active: Vec<BookingStatus> = legs.iter().copied().filter(|s| !s.is_closed()).collect();

    if active.is_empty() {
        return if legs.contains(&BookingStatus::Withdrawn) {
            AggregateStatus::Withdrawn
        } else {
            AggregateStatus::Rejected
        };
    }
    if active.len() < legs.len() {
        return AggregateStatus::PartiallyWithdrawn {
            active: active.len(),
        };
    }
    active
        .into_iter()
        .min_by_key(|s| s.progress())
        .map(AggregateStatus::from)
        .unwrap_or(AggregateStatus::Rejected)
}
