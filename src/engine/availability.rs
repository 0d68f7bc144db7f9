use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{minutes_ms, now_ms};
use super::overlap::subtract;
use super::{Engine, EngineError};

// ── Slot enumeration ──────────────────────────────────────────────

/// Slot starts on the grid `window.start + k * step` whose
/// `[start, start + duration)` lies inside one free sub-window, skipping any
/// that start before `not_before`.
pub fn slots_in_window(window: Span, busy: &[Span], duration: Ms, step: Ms, not_before: Ms) -> Vec<Span> {
    let free = subtract(window, busy);
    let mut slots = Vec::new();
    let mut fi = 0;
    let mut start = window.start;

    while start + duration <= window.end {
        let candidate = Span::new(start, start + duration);
        // Free spans ending before this candidate can't hold any later one either.
        while fi < free.len() && free[fi].end < candidate.end {
            fi += 1;
        }
        if fi == free.len() {
            break;
        }
        if start >= not_before && free[fi].contains_span(&candidate) {
            slots.push(candidate);
        }
        start += step;
    }

    slots
}

fn local_time(t: Ms, offset: FixedOffset) -> Option<NaiveTime> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.with_timezone(&offset).time())
}

fn validate_minutes(minutes: u32, min: u32, what: &'static str) -> Result<(), EngineError> {
    if minutes < min {
        return Err(EngineError::InvalidInput(what));
    }
    if minutes > MAX_SLOT_MINUTES {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    /// Bookable slots of `duration_minutes` on `date`. `step_minutes`
    /// defaults to the resource's template step.
    pub async fn free_slots(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
        step_minutes: Option<u32>,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        validate_minutes(duration_minutes, 1, "duration out of range")?;
        if let Some(step) = step_minutes {
            validate_minutes(step, MIN_STEP_MINUTES, "step out of range")?;
        }
        self.with_retry("free_slots", || {
            self.try_free_slots(resource_id, date, duration_minutes, step_minutes)
        })
        .await
    }

    async fn try_free_slots(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
        step_minutes: Option<u32>,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let resource = self
            .store
            .resource(resource_id)
            .await?
            .ok_or(EngineError::NotFound(resource_id))?;
        if !resource.active {
            return Ok(Vec::new());
        }
        let offset = self.config.utc_offset;
        let Some(window) = resource.hours.window(date, offset) else {
            return Ok(Vec::new());
        };
        let step = step_minutes.unwrap_or(resource.hours.step_minutes);
        if step == 0 {
            return Err(EngineError::InvalidInput("step out of range"));
        }

        let now = now_ms();
        let busy: Vec<Span> = self
            .store
            .busy_intervals(resource_id, window, now)
            .await?
            .into_iter()
            .map(|b| b.span)
            .collect();

        let slots = slots_in_window(window, &busy, minutes_ms(duration_minutes), minutes_ms(step), now)
            .into_iter()
            .filter_map(|s| {
                Some(TimeSlot {
                    start: s.start,
                    end: s.end,
                    local_time: local_time(s.start, offset)?,
                })
            })
            .collect();
        Ok(slots)
    }

    /// Dates in the next `range_days` (today first) on which `time` for
    /// `duration_minutes` is inside working hours and free.
    pub async fn free_dates_for_time(
        &self,
        resource_id: Ulid,
        time: NaiveTime,
        duration_minutes: u32,
        range_days: u32,
    ) -> Result<Vec<DateOption>, EngineError> {
        self.free_dates_from(resource_id, self.today(), time, duration_minutes, range_days)
            .await
    }

    pub async fn free_dates_from(
        &self,
        resource_id: Ulid,
        from: NaiveDate,
        time: NaiveTime,
        duration_minutes: u32,
        range_days: u32,
    ) -> Result<Vec<DateOption>, EngineError> {
        validate_minutes(duration_minutes, 1, "duration out of range")?;
        if range_days > MAX_RANGE_DAYS {
            return Err(EngineError::LimitExceeded("range too long"));
        }
        self.with_retry("free_dates", || {
            self.try_free_dates(resource_id, from, time, duration_minutes, range_days)
        })
        .await
    }

    async fn try_free_dates(
        &self,
        resource_id: Ulid,
        from: NaiveDate,
        time: NaiveTime,
        duration_minutes: u32,
        range_days: u32,
    ) -> Result<Vec<DateOption>, EngineError> {
        let resource = self
            .store
            .resource(resource_id)
            .await?
            .ok_or(EngineError::NotFound(resource_id))?;
        if !resource.active {
            return Ok(Vec::new());
        }

        let offset = self.config.utc_offset;
        let duration = minutes_ms(duration_minutes);
        let now = now_ms();
        let mut dates = Vec::new();

        for day in 0..range_days {
            let Some(date) = from.checked_add_days(Days::new(u64::from(day))) else {
                break;
            };
            let Some(window) = resource.hours.window(date, offset) else {
                continue;
            };
            let Some(start) = local_ms(date, time, offset) else {
                continue;
            };
            let span = Span::new(start, start + duration);
            if start < now || !window.contains_span(&span) {
                continue;
            }
            let busy = self.store.busy_intervals(resource_id, span, now).await?;
            if busy.iter().any(|b| b.span.overlaps(&span)) {
                continue;
            }
            dates.push(DateOption {
                date,
                start: span.start,
                end: span.end,
            });
        }

        Ok(dates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 60 * MINUTE_MS;

    #[test]
    fn grid_skips_busy_and_edges() {
        // 09:00-18:00 with a booking 10-11 and a hold 14:00-14:30.
        let window = Span::new(9 * H, 18 * H);
        let busy = vec![Span::new(10 * H, 11 * H), Span::new(14 * H, 14 * H + 30 * MINUTE_MS)];
        let slots = slots_in_window(window, &busy, 30 * MINUTE_MS, 30 * MINUTE_MS, 0);
        let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();

        assert!(starts.contains(&(9 * H)));
        assert!(starts.contains(&(9 * H + 30 * MINUTE_MS)));
        assert!(!starts.contains(&(10 * H)));
        assert!(!starts.contains(&(10 * H + 30 * MINUTE_MS)));
        assert!(starts.contains(&(11 * H)));
        assert!(!starts.contains(&(14 * H)));
        assert!(starts.contains(&(14 * H + 30 * MINUTE_MS)));
        assert_eq!(*starts.last().unwrap(), 17 * H + 30 * MINUTE_MS);
        assert_eq!(slots.len(), 18 - 3);
    }

    #[test]
    fn slot_must_fit_inside_one_free_span() {
        let window = Span::new(0, 4 * H);
        let busy = vec![Span::new(H + 30 * MINUTE_MS, 2 * H)];
        let slots = slots_in_window(window, &busy, H, H, 0);
        let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0, 2 * H, 3 * H]);
    }

    #[test]
    fn finer_step_than_duration() {
        let window = Span::new(0, 2 * H);
        let slots = slots_in_window(window, &[], H, 30 * MINUTE_MS, 0);
        let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![0, 30 * MINUTE_MS, H]);
    }

    #[test]
    fn past_slots_are_dropped() {
        let window = Span::new(0, 3 * H);
        let slots = slots_in_window(window, &[], H, H, H + 1);
        let starts: Vec<Ms> = slots.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![2 * H]);
    }

    #[test]
    fn duration_longer_than_window() {
        assert!(slots_in_window(Span::new(0, H), &[], 2 * H, H, 0).is_empty());
    }

    #[test]
    fn fully_booked_window() {
        let window = Span::new(0, 3 * H);
        assert!(slots_in_window(window, &[window], H, H, 0).is_empty());
    }
}
