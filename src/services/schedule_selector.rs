//! Session selection against a quote's estimated hours.
//!
//! The client composes dated sessions inside the provider's weekly windows
//! until the quoted hours are used up exactly. The same rules run on the
//! server when a schedule is saved; whatever the client believed about its
//! remaining hours is ignored.

use chrono::{Days, NaiveDate, NaiveTime};
use rust_decimal::Decimal;

use crate::domain::schedule::{
    hours_to_minutes, minutes_to_hours, AvailabilityWindow, DayOfWeek, TimeSlot,
};
use crate::error::{ApiError, ApiResult};

/// Every date within `horizon_days` of `from` (inclusive) falling on `day`,
/// ascending. Cloning the iterator restarts it.
pub fn candidate_dates(
    day: DayOfWeek,
    from: NaiveDate,
    horizon_days: u32,
) -> impl Iterator<Item = NaiveDate> + Clone {
    (0..u64::from(horizon_days))
        .filter_map(move |offset| from.checked_add_days(Days::new(offset)))
        .filter(move |date| DayOfWeek::of(*date) == day)
}

#[derive(Debug, Clone)]
pub struct ScheduleSelector {
    availability: Vec<AvailabilityWindow>,
    required_minutes: i64,
    slots: Vec<TimeSlot>,
}

impl ScheduleSelector {
    pub fn new(estimated_hours: Decimal, availability: Vec<AvailabilityWindow>) -> ApiResult<Self> {
        let required_minutes = hours_to_minutes(estimated_hours)
            .filter(|m| *m > 0)
            .ok_or_else(|| {
                ApiError::validation("Estimated hours must be positive whole minutes")
            })?;

        Ok(Self {
            availability,
            required_minutes,
            slots: Vec::new(),
        })
    }

    pub fn slots(&self) -> &[TimeSlot] {
        &self.slots
    }

    pub fn into_slots(self) -> Vec<TimeSlot> {
        self.slots
    }

    pub fn remaining_minutes(&self) -> i64 {
        self.required_minutes - self.slots.iter().map(TimeSlot::duration_minutes).sum::<i64>()
    }

    pub fn hours_remaining(&self) -> Decimal {
        minutes_to_hours(self.remaining_minutes())
    }

    /// Ready for approval once every quoted minute is scheduled.
    pub fn is_complete(&self) -> bool {
        self.remaining_minutes() == 0
    }

    /// Windows offered on `day`, in start order.
    pub fn windows_for(&self, day: DayOfWeek) -> impl Iterator<Item = &AvailabilityWindow> {
        self.availability.iter().filter(move |w| w.day == day)
    }

    pub fn add_slot(
        &mut self,
        date: NaiveDate,
        start_time: NaiveTime,
        end_time: NaiveTime,
    ) -> ApiResult<&TimeSlot> {
        if end_time <= start_time {
            return Err(ApiError::validation(format!(
                "Session on {} must end after it starts ({} - {})",
                date,
                start_time.format("%H:%M"),
                end_time.format("%H:%M")
            )));
        }

        let slot = TimeSlot::new(date, start_time, end_time).ok_or_else(|| {
            ApiError::validation("Session times must be whole minutes")
        })?;

        let remaining = self.remaining_minutes();
        if slot.duration_minutes() > remaining {
            return Err(ApiError::validation(format!(
                "Session of {}h exceeds the {}h left to schedule",
                slot.duration_hours,
                minutes_to_hours(remaining)
            )));
        }

        let day = slot.day();
        {
            let mut windows = self.windows_for(day).peekable();
            if windows.peek().is_none() {
                return Err(ApiError::validation(format!(
                    "Provider is not available on {} ({})",
                    day, date
                )));
            }
            if !windows.any(|w| w.contains(start_time, end_time)) {
                return Err(ApiError::validation(format!(
                    "Session {} - {} on {} falls outside the provider's availability",
                    start_time.format("%H:%M"),
                    end_time.format("%H:%M"),
                    day
                )));
            }
        }

        if let Some(clash) = self.slots.iter().find(|s| s.overlaps(&slot)) {
            return Err(ApiError::validation(format!(
                "Session overlaps another one on {} ({} - {})",
                clash.date,
                clash.start_time.format("%H:%M"),
                clash.end_time.format("%H:%M")
            )));
        }

        self.slots.push(slot);
        Ok(&self.slots[self.slots.len() - 1])
    }

    pub fn remove_slot(&mut self, index: usize) -> ApiResult<TimeSlot> {
        if index >= self.slots.len() {
            return Err(ApiError::not_found(format!("No session at position {}", index)));
        }
        Ok(self.slots.remove(index))
    }
}
