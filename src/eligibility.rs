//! Gating rules for check-in ("settlement") and for treating a caller as a current guest.
//!
//! Both checks work on local wall-clock time and never touch the network, so callers pass
//! `now` explicitly.

use crate::crm_types::ClientAccommodationDto;

use chrono::{NaiveDateTime, NaiveTime, Timelike};
use serde::Serialize;

/// Earliest local hour at which guests may check in on their arrival day.
pub const SETTLEMENT_OPENING_HOUR: u32 = 13;
/// Local hour on the end date at which a stay is over.
pub const CHECKOUT_HOUR: u32 = 12;

const CONFIRMED_STATUSES: &[&str] = &["confirmed", "booking_confirmed"];
const SETTLED_STATUS: &str = "settled";

#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct Eligibility {
    pub allowed: bool,
    pub reason: String,
}

impl Eligibility {
    fn allowed(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: reason.into(),
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
        }
    }
}

fn status_is(accommodation: &ClientAccommodationDto, expected: &[&str]) -> bool {
    let status = accommodation.status.trim().to_lowercase();
    expected.iter().any(|e| *e == status)
}

/// May the guest check in right now?
pub fn check_settlement(
    accommodation: Option<&ClientAccommodationDto>,
    now: NaiveDateTime,
) -> Eligibility {
    let Some(accommodation) = accommodation else {
        return Eligibility::denied("No booking was found for this caller.");
    };
    let Some(start) = accommodation.start_date.and_then(|d| d.to_naive_date()) else {
        return Eligibility::denied("The booking has no valid start date.");
    };
    if now.date() != start {
        return Eligibility::denied(format!(
            "Check-in is only possible on the arrival day, {}.",
            start.format("%d-%m-%Y")
        ));
    }
    if now.hour() < SETTLEMENT_OPENING_HOUR {
        return Eligibility::denied(format!(
            "Check-in opens at {SETTLEMENT_OPENING_HOUR}:00."
        ));
    }
    if !status_is(accommodation, CONFIRMED_STATUSES) {
        return Eligibility::denied(format!(
            "The booking is not confirmed (status: {}).",
            accommodation.status
        ));
    }
    Eligibility::allowed("The guest may check in now.")
}

/// Is the caller currently staying at their rental?
pub fn check_active_stay(
    accommodation: Option<&ClientAccommodationDto>,
    now: NaiveDateTime,
) -> Eligibility {
    let Some(accommodation) = accommodation else {
        return Eligibility::denied("No booking was found for this caller.");
    };
    if !status_is(accommodation, &[SETTLED_STATUS]) {
        return Eligibility::denied(format!(
            "The guest has not checked in (status: {}).",
            accommodation.status
        ));
    }
    let Some(end) = accommodation.end_date.and_then(|d| d.to_naive_date()) else {
        return Eligibility::denied("The booking has no valid end date.");
    };
    let checkout = end.and_time(NaiveTime::MIN) + chrono::Duration::hours(CHECKOUT_HOUR as i64);
    if now >= checkout {
        return Eligibility::denied("The stay has already ended.");
    }
    if accommodation
        .rental_id
        .as_deref()
        .map_or(true, |id| id.trim().is_empty())
    {
        return Eligibility::denied("The booking is not linked to a rental.");
    }
    Eligibility::allowed("The guest is currently staying at the rental.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm_types::DateDayDto;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    fn day(y: i32, m: u32, d: u32) -> Option<DateDayDto> {
        Some(DateDayDto {
            year: y,
            month: m,
            day: d,
        })
    }

    fn accommodation(status: &str) -> ClientAccommodationDto {
        ClientAccommodationDto {
            id: "acc-1".into(),
            client_id: "c-1".into(),
            rental_id: Some("r-1".into()),
            start_date: day(2025, 5, 1),
            end_date: day(2025, 5, 8),
            status: status.into(),
            rental: None,
        }
    }

    #[test]
    fn settlement_requires_accommodation() {
        let res = check_settlement(None, at(2025, 5, 1, 14, 0));
        assert!(!res.allowed);
    }

    #[test]
    fn settlement_requires_valid_start_date() {
        let mut acc = accommodation("confirmed");
        acc.start_date = None;
        assert!(!check_settlement(Some(&acc), at(2025, 5, 1, 14, 0)).allowed);

        acc.start_date = day(2025, 2, 30);
        assert!(!check_settlement(Some(&acc), at(2025, 5, 1, 14, 0)).allowed);
    }

    #[test]
    fn settlement_only_on_arrival_day() {
        let acc = accommodation("confirmed");
        assert!(!check_settlement(Some(&acc), at(2025, 4, 30, 14, 0)).allowed);
        assert!(!check_settlement(Some(&acc), at(2025, 5, 2, 14, 0)).allowed);
    }

    #[test]
    fn settlement_not_before_opening_hour() {
        let acc = accommodation("confirmed");
        let res = check_settlement(Some(&acc), at(2025, 5, 1, 12, 59));
        assert!(!res.allowed);
        assert!(res.reason.contains("13:00"));
        assert!(check_settlement(Some(&acc), at(2025, 5, 1, 13, 0)).allowed);
    }

    #[test]
    fn settlement_requires_confirmed_status() {
        for status in ["pending_booking_confirmation", "settled", "cancelled", ""] {
            let acc = accommodation(status);
            assert!(
                !check_settlement(Some(&acc), at(2025, 5, 1, 15, 0)).allowed,
                "status {status:?} should not allow settlement"
            );
        }
    }

    #[test]
    fn settlement_allowed_when_all_conditions_hold() {
        for status in ["confirmed", "CONFIRMED", "Booking_Confirmed"] {
            let acc = accommodation(status);
            let res = check_settlement(Some(&acc), at(2025, 5, 1, 18, 30));
            assert!(res.allowed, "status {status:?} should allow settlement");
        }
    }

    #[test]
    fn active_stay_requires_accommodation() {
        assert!(!check_active_stay(None, at(2025, 5, 3, 10, 0)).allowed);
    }

    #[test]
    fn active_stay_requires_settled_status() {
        let acc = accommodation("confirmed");
        assert!(!check_active_stay(Some(&acc), at(2025, 5, 3, 10, 0)).allowed);
    }

    #[test]
    fn active_stay_requires_end_date() {
        let mut acc = accommodation("settled");
        acc.end_date = None;
        assert!(!check_active_stay(Some(&acc), at(2025, 5, 3, 10, 0)).allowed);
    }

    #[test]
    fn active_stay_ends_at_checkout_noon() {
        let acc = accommodation("Settled");
        assert!(check_active_stay(Some(&acc), at(2025, 5, 8, 11, 59)).allowed);
        assert!(!check_active_stay(Some(&acc), at(2025, 5, 8, 12, 0)).allowed);
        assert!(!check_active_stay(Some(&acc), at(2025, 5, 9, 9, 0)).allowed);
    }

    #[test]
    fn active_stay_requires_rental_id() {
        let mut acc = accommodation("settled");
        acc.rental_id = None;
        assert!(!check_active_stay(Some(&acc), at(2025, 5, 3, 10, 0)).allowed);
    }

    #[test]
    fn active_stay_allowed_mid_stay() {
        let acc = accommodation("settled");
        assert!(check_active_stay(Some(&acc), at(2025, 5, 3, 23, 0)).allowed);
    }
}
