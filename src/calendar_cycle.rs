/// Calendar Cycle Computation
///
/// Pure functions computing anchored billing-cycle windows and proration
/// factors. Windows are half-open `[start, end)`: a timestamp equal to the
/// end boundary belongs to the next cycle. Monthly anchors that do not
/// exist in a month (Feb 29 in a non-leap year, day 31 in April) roll
/// forward to day 1 of the following month, stretching the previous cycle
/// past its nominal anchor.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BillingCycleSpec, BillingInterval, CalendarUnit};

/// A half-open service window. `end == DateTime::MAX_UTC` models the
/// unbounded window of a one-time plan without a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CycleWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    pub fn is_unbounded(&self) -> bool {
        self.end == DateTime::<Utc>::MAX_UTC
    }

    pub fn len_ms(&self) -> i64 {
        (self.end - self.start).num_milliseconds()
    }
}

/// Inputs for cycle computation: the service bounds of a phase plus its
/// billing recurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSchedule {
    pub effective_start: DateTime<Utc>,
    pub effective_end: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub spec: BillingCycleSpec,
}

impl CycleSchedule {
    pub fn new(effective_start: DateTime<Utc>, spec: BillingCycleSpec) -> Self {
        Self {
            effective_start,
            effective_end: None,
            trial_ends_at: None,
            spec,
        }
    }

    pub fn with_end(mut self, end: DateTime<Utc>) -> Self {
        self.effective_end = Some(end);
        self
    }

    pub fn with_trial_end(mut self, trial_ends_at: DateTime<Utc>) -> Self {
        self.trial_ends_at = Some(trial_ends_at);
        self
    }

    /// The cycle window containing `now`, or `None` outside the service
    /// bounds.
    pub fn cycle_window(&self, now: DateTime<Utc>) -> Option<CycleWindow> {
        if now < self.effective_start {
            return None;
        }
        if let Some(end) = self.effective_end {
            if now >= end {
                return None;
            }
        }

        // Trial span is its own window regardless of recurrence.
        if let Some(trial_end) = self.trial_ends_at {
            if now < trial_end {
                return Some(self.cap_window(CycleWindow {
                    start: self.effective_start,
                    end: trial_end,
                }));
            }
        }

        if self.spec.interval == BillingInterval::Onetime {
            return match self.trial_ends_at {
                // A one-time plan with a trial only ever serves the trial
                // span; past it there is no further window.
                Some(_) => None,
                None => Some(self.cap_window(CycleWindow {
                    start: self.effective_start,
                    end: DateTime::<Utc>::MAX_UTC,
                })),
            };
        }

        let grid = self.grid_window(now);
        let floor = self.recurring_floor();
        let start = if grid.start < floor { floor } else { grid.start };
        Some(self.cap_window(CycleWindow {
            start,
            end: grid.end,
        }))
    }

    /// Full (unclamped) grid window containing `now`; its length is the
    /// proration denominator.
    pub fn grid_window(&self, now: DateTime<Utc>) -> CycleWindow {
        let ic = self.spec.interval_count.max(1) as i64;
        match self.spec.interval {
            BillingInterval::Minute => {
                let origin = minute_boundary_at_or_before(self.grid_anchor_time(), self.spec.anchor);
                fixed_step_window(origin, Duration::minutes(ic), now)
            }
            BillingInterval::Day => {
                let origin = day_boundary_at_or_before(self.grid_anchor_time(), self.spec.anchor);
                fixed_step_window(origin, Duration::days(ic), now)
            }
            BillingInterval::Week => {
                let origin = week_boundary_at_or_before(self.grid_anchor_time(), self.spec.anchor);
                fixed_step_window(origin, Duration::weeks(ic), now)
            }
            BillingInterval::Month => self.month_grid_window(now, ic),
            BillingInterval::Year => self.year_grid_window(now, ic),
            BillingInterval::Onetime => CycleWindow {
                start: self.effective_start,
                end: DateTime::<Utc>::MAX_UTC,
            },
        }
    }

    /// The recurring grid is anchored from the point service actually
    /// recurs: trial end when a trial exists, otherwise the phase start.
    fn grid_anchor_time(&self) -> DateTime<Utc> {
        self.trial_ends_at.unwrap_or(self.effective_start)
    }

    fn recurring_floor(&self) -> DateTime<Utc> {
        self.trial_ends_at.unwrap_or(self.effective_start)
    }

    fn cap_window(&self, mut window: CycleWindow) -> CycleWindow {
        if let Some(end) = self.effective_end {
            if window.end > end {
                window.end = end;
            }
        }
        window
    }

    fn month_grid_window(&self, now: DateTime<Utc>, ic: i64) -> CycleWindow {
        let anchor_day = self.spec.anchor.clamp(1, 31);
        let anchor_time = self.grid_anchor_time();

        // Origin month: the grid month whose (rolled) boundary is the
        // nearest at or before the anchor time.
        let mut origin_idx = month_index(anchor_time.year(), anchor_time.month());
        while month_boundary(origin_idx, anchor_day) > anchor_time {
            origin_idx -= 1;
        }

        // Estimate the grid step containing `now`, then settle with the
        // rolled boundaries.
        let now_idx = month_index(now.year(), now.month());
        let mut k = (now_idx - origin_idx) / ic;
        if k < 0 {
            k = 0;
        }
        while month_boundary(origin_idx + (k + 1) * ic, anchor_day) <= now {
            k += 1;
        }
        while k > 0 && month_boundary(origin_idx + k * ic, anchor_day) > now {
            k -= 1;
        }

        CycleWindow {
            start: month_boundary(origin_idx + k * ic, anchor_day),
            end: month_boundary(origin_idx + (k + 1) * ic, anchor_day),
        }
    }

    /// Yearly cycles recur on the anniversary of the grid anchor date,
    /// with Feb 29 rolling forward to Mar 1 in non-leap years.
    fn year_grid_window(&self, now: DateTime<Utc>, ic: i64) -> CycleWindow {
        let anchor_time = self.grid_anchor_time();
        let (month, day) = (anchor_time.month(), anchor_time.day());
        let origin_year = anchor_time.year();

        let mut k = (now.year() - origin_year) as i64 / ic;
        if k < 0 {
            k = 0;
        }
        while year_boundary(origin_year, (k + 1) * ic, month, day) <= now {
            k += 1;
        }
        while k > 0 && year_boundary(origin_year, k * ic, month, day) > now {
            k -= 1;
        }

        CycleWindow {
            start: year_boundary(origin_year, k * ic, month, day),
            end: year_boundary(origin_year, (k + 1) * ic, month, day),
        }
    }

    /// Fraction of a full grid cycle covered by `[service_start,
    /// service_end)`, clamped to `[0, 1]`. Trial service prices at zero.
    pub fn proration_factor(
        &self,
        service_start: DateTime<Utc>,
        service_end: DateTime<Utc>,
    ) -> f64 {
        if let Some(trial_end) = self.trial_ends_at {
            if service_start < trial_end {
                return 0.0;
            }
        }
        let clamp_start = service_start.max(self.effective_start);
        if service_end <= clamp_start {
            return 0.0;
        }

        let grid = self.grid_window(clamp_start);
        if grid.is_unbounded() {
            return 1.0;
        }
        let denominator = grid.len_ms();
        if denominator <= 0 {
            return 0.0;
        }
        let numerator = (service_end - clamp_start).num_milliseconds();
        (numerator as f64 / denominator as f64).clamp(0.0, 1.0)
    }
}

/// Plain calendar stepping used for past-due dates. Month stepping here
/// uses chrono's clamping semantics; only cycle boundaries roll forward.
pub fn next_date_after(start: DateTime<Utc>, unit: CalendarUnit, units: u32) -> DateTime<Utc> {
    let n = units as i64;
    match unit {
        CalendarUnit::Minute => start + Duration::minutes(n),
        CalendarUnit::Hour => start + Duration::hours(n),
        CalendarUnit::Day => start + Duration::days(n),
        CalendarUnit::Week => start + Duration::weeks(n),
        CalendarUnit::Month => start + chrono::Months::new(units),
        CalendarUnit::Year => start + chrono::Months::new(units * 12),
    }
}

fn fixed_step_window(origin: DateTime<Utc>, step: Duration, now: DateTime<Utc>) -> CycleWindow {
    let step_ms = step.num_milliseconds();
    let elapsed_ms = (now - origin).num_milliseconds();
    let k = elapsed_ms.div_euclid(step_ms);
    let start = origin + Duration::milliseconds(k * step_ms);
    CycleWindow {
        start,
        end: start + step,
    }
}

fn minute_boundary_at_or_before(ts: DateTime<Utc>, anchor_second: u32) -> DateTime<Utc> {
    let second = anchor_second.min(59);
    let truncated = Utc
        .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), ts.hour(), ts.minute(), second)
        .unwrap();
    if truncated > ts {
        truncated - Duration::minutes(1)
    } else {
        truncated
    }
}

fn day_boundary_at_or_before(ts: DateTime<Utc>, anchor_hour: u32) -> DateTime<Utc> {
    let hour = anchor_hour.min(23);
    let truncated = Utc
        .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), hour, 0, 0)
        .unwrap();
    if truncated > ts {
        truncated - Duration::days(1)
    } else {
        truncated
    }
}

fn week_boundary_at_or_before(ts: DateTime<Utc>, anchor_weekday: u32) -> DateTime<Utc> {
    let anchor = anchor_weekday.min(6);
    let midnight = Utc
        .with_ymd_and_hms(ts.year(), ts.month(), ts.day(), 0, 0, 0)
        .unwrap();
    // chrono: Sunday.num_days_from_sunday() == 0, matching the anchor scheme
    let weekday = midnight.weekday().num_days_from_sunday();
    let back = (weekday + 7 - anchor) % 7;
    midnight - Duration::days(back as i64)
}

fn month_index(year: i32, month: u32) -> i64 {
    year as i64 * 12 + (month as i64 - 1)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let next = if month == 12 {
        Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).unwrap()
    } else {
        Utc.with_ymd_and_hms(year, month + 1, 1, 0, 0, 0).unwrap()
    };
    (next - Duration::days(1)).day()
}

/// Boundary of the grid month `idx` for `anchor_day`, rolled forward to
/// day 1 of the following month when the anchor day does not exist.
fn month_boundary(idx: i64, anchor_day: u32) -> DateTime<Utc> {
    let year = idx.div_euclid(12) as i32;
    let month = (idx.rem_euclid(12) + 1) as u32;
    if anchor_day <= days_in_month(year, month) {
        Utc.with_ymd_and_hms(year, month, anchor_day, 0, 0, 0).unwrap()
    } else if month == 12 {
        Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).unwrap()
    } else {
        Utc.with_ymd_and_hms(year, month + 1, 1, 0, 0, 0).unwrap()
    }
}

fn year_boundary(origin_year: i32, step: i64, month: u32, day: u32) -> DateTime<Utc> {
    let year = origin_year + step as i32;
    if day <= days_in_month(year, month) {
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
    } else if month == 12 {
        Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).unwrap()
    } else {
        Utc.with_ymd_and_hms(year, month + 1, 1, 0, 0, 0).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlanType;
    use proptest::prelude::*;

    fn monthly(anchor: u32) -> BillingCycleSpec {
        BillingCycleSpec {
            interval: BillingInterval::Month,
            interval_count: 1,
            anchor,
            plan_type: PlanType::Recurring,
        }
    }

    fn at(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_outside_service_bounds() {
        let schedule = CycleSchedule::new(at(2024, 1, 10), monthly(29))
            .with_end(at(2024, 6, 1));
        assert!(schedule.cycle_window(at(2024, 1, 9)).is_none());
        assert!(schedule.cycle_window(at(2024, 6, 1)).is_none());
        assert!(schedule.cycle_window(at(2024, 7, 1)).is_none());
    }

    #[test]
    fn test_monthly_leap_anchor_29() {
        // Leap year: the Feb boundary exists on Feb 29.
        let schedule = CycleSchedule::new(at(2024, 1, 10), monthly(29));
        let window = schedule.cycle_window(at(2024, 2, 15)).unwrap();
        assert_eq!(window.start, at(2024, 1, 29));
        assert_eq!(window.end, at(2024, 2, 29));
    }

    #[test]
    fn test_monthly_non_leap_rolls_forward() {
        // Non-leap year: Feb 29 does not exist, boundary rolls to Mar 1.
        let schedule = CycleSchedule::new(at(2025, 1, 10), monthly(29));
        let window = schedule.cycle_window(at(2025, 2, 15)).unwrap();
        assert_eq!(window.start, at(2025, 1, 29));
        assert_eq!(window.end, at(2025, 3, 1));
    }

    #[test]
    fn test_half_open_boundary() {
        let schedule = CycleSchedule::new(at(2024, 1, 10), monthly(15));
        let boundary = at(2024, 2, 15);
        let window = schedule.cycle_window(boundary).unwrap();
        // now == end of the previous window maps to the next window
        assert_eq!(window.start, boundary);
        assert_eq!(window.end, at(2024, 3, 15));
    }

    #[test]
    fn test_first_window_clamps_to_effective_start() {
        // Trial ended Jan 8; grid anchored on day 15.
        let schedule = CycleSchedule::new(at(2024, 1, 1), monthly(15))
            .with_trial_end(at(2024, 1, 8));
        let window = schedule.cycle_window(at(2024, 1, 8)).unwrap();
        assert_eq!(window.start, at(2024, 1, 8));
        assert_eq!(window.end, at(2024, 1, 15));

        // The next cycle snaps back onto the grid.
        let window = schedule.cycle_window(at(2024, 1, 20)).unwrap();
        assert_eq!(window.start, at(2024, 1, 15));
        assert_eq!(window.end, at(2024, 2, 15));
    }

    #[test]
    fn test_trial_window() {
        let schedule = CycleSchedule::new(at(2024, 1, 1), monthly(15))
            .with_trial_end(at(2024, 1, 8));
        let window = schedule.cycle_window(at(2024, 1, 3)).unwrap();
        assert_eq!(window.start, at(2024, 1, 1));
        assert_eq!(window.end, at(2024, 1, 8));
    }

    #[test]
    fn test_onetime_windows() {
        let spec = BillingCycleSpec::onetime();

        let no_trial = CycleSchedule::new(at(2024, 1, 1), spec);
        let window = no_trial.cycle_window(at(2030, 1, 1)).unwrap();
        assert_eq!(window.start, at(2024, 1, 1));
        assert!(window.is_unbounded());

        let with_trial = CycleSchedule::new(at(2024, 1, 1), spec)
            .with_trial_end(at(2024, 1, 8));
        let window = with_trial.cycle_window(at(2024, 1, 5)).unwrap();
        assert_eq!(window.end, at(2024, 1, 8));
        assert!(with_trial.cycle_window(at(2024, 1, 8)).is_none());
    }

    #[test]
    fn test_weekly_anchor() {
        // 2024-01-10 is a Wednesday; anchor Sunday (0).
        let spec = BillingCycleSpec {
            interval: BillingInterval::Week,
            interval_count: 1,
            anchor: 0,
            plan_type: PlanType::Recurring,
        };
        let schedule = CycleSchedule::new(at(2024, 1, 1), spec);
        let window = schedule.cycle_window(at(2024, 1, 10)).unwrap();
        assert_eq!(window.start, at(2024, 1, 7));
        assert_eq!(window.end, at(2024, 1, 14));
    }

    #[test]
    fn test_multi_month_grid_alignment() {
        let spec = BillingCycleSpec {
            interval: BillingInterval::Month,
            interval_count: 3,
            anchor: 1,
            plan_type: PlanType::Recurring,
        };
        let schedule = CycleSchedule::new(at(2024, 1, 1), spec);
        let window = schedule.cycle_window(at(2024, 5, 20)).unwrap();
        assert_eq!(window.start, at(2024, 4, 1));
        assert_eq!(window.end, at(2024, 7, 1));
    }

    #[test]
    fn test_minute_interval() {
        let spec = BillingCycleSpec {
            interval: BillingInterval::Minute,
            interval_count: 1,
            anchor: 0,
            plan_type: PlanType::Recurring,
        };
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let schedule = CycleSchedule::new(start, spec);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 5, 30).unwrap();
        let window = schedule.cycle_window(now).unwrap();
        assert_eq!(window.start, Utc.with_ymd_and_hms(2024, 1, 1, 12, 5, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2024, 1, 1, 12, 6, 0).unwrap());
    }

    #[test]
    fn test_proration_mid_cycle_remainder() {
        // $100 cycle [Jan 1, Feb 1), downgrade at Jan 16: remainder is 16
        // of 31 days.
        let schedule = CycleSchedule::new(at(2024, 1, 1), monthly(1));
        let factor = schedule.proration_factor(at(2024, 1, 16), at(2024, 2, 1));
        let credit = (10_000.0 * factor).round() as i64;
        assert_eq!(credit, 5161);
    }

    #[test]
    fn test_proration_full_cycle_is_one() {
        let schedule = CycleSchedule::new(at(2024, 1, 1), monthly(1));
        let factor = schedule.proration_factor(at(2024, 1, 1), at(2024, 2, 1));
        assert!((factor - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_proration_trial_is_zero() {
        let schedule = CycleSchedule::new(at(2024, 1, 1), monthly(1))
            .with_trial_end(at(2024, 1, 8));
        assert_eq!(schedule.proration_factor(at(2024, 1, 1), at(2024, 1, 8)), 0.0);
    }

    #[test]
    fn test_next_date_after() {
        assert_eq!(
            next_date_after(at(2024, 1, 31), CalendarUnit::Month, 1),
            at(2024, 2, 29)
        );
        assert_eq!(
            next_date_after(at(2024, 1, 1), CalendarUnit::Day, 3),
            at(2024, 1, 4)
        );
        assert_eq!(
            next_date_after(at(2024, 2, 29), CalendarUnit::Year, 1),
            at(2025, 2, 28)
        );
    }

    proptest! {
        /// Stepping forward from one window's end lands exactly on the
        /// next window's start: the grid covers time without gap or
        /// overlap.
        #[test]
        fn prop_windows_tile_the_axis(
            anchor in 1u32..=31,
            start_day in 1u32..=28,
            steps in 1usize..24,
        ) {
            let schedule = CycleSchedule::new(at(2023, 3, start_day), monthly(anchor));
            let mut now = at(2023, 3, start_day);
            let mut prev_end: Option<DateTime<Utc>> = None;
            for _ in 0..steps {
                let window = schedule.cycle_window(now).unwrap();
                prop_assert!(window.contains(now));
                prop_assert!(window.start < window.end);
                if let Some(prev) = prev_end {
                    prop_assert_eq!(window.start, prev);
                }
                prev_end = Some(window.end);
                now = window.end;
            }
        }

        #[test]
        fn prop_boundary_belongs_to_next_window(
            anchor in 1u32..=31,
            offset_days in 0i64..400,
        ) {
            let schedule = CycleSchedule::new(at(2023, 1, 1), monthly(anchor));
            let now = at(2023, 1, 1) + Duration::days(offset_days);
            let window = schedule.cycle_window(now).unwrap();
            let next = schedule.cycle_window(window.end).unwrap();
            prop_assert_eq!(next.start, window.end);
        }
    }
}
