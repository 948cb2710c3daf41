//! Typed period codes and the recompute schedule.
//!
//! A period code is a unit letter with an optional multiplier: `d` is one
//! day, `d7` seven days, `y10` a decade. Weeks start on Monday; month,
//! quarter and year buckets start at the first of the unit in UTC.
//!
//! The recompute schedule answers "should `(period, now)` be recomputed
//! this run". Hourly periods always are; longer ones only at designated
//! UTC hours, or probabilistically when the random-recompute flag is set.
//! Every period is additionally eligible with probability
//! `1/recalc_reciprocal` per run to fill gaps left by missed runs.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Timelike, Utc};
use rand::Rng;
use thiserror::Error;

/// Errors raised by period parsing.
#[derive(Debug, Error)]
pub enum PeriodError {
    /// Unknown or malformed period expression.
    #[error("Invalid period expression: '{0}'")]
    Invalid(String),
}

/// Period unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriodKind {
    Hour,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

/// A parsed period code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Period {
    pub kind: PeriodKind,
    pub n: u32,
}

impl Period {
    /// Parses a period code like `d`, `d7`, `w`, `y10`.
    pub fn parse(code: &str) -> Result<Self, PeriodError> {
        let mut chars = code.chars();
        let unit = chars.next().ok_or_else(|| PeriodError::Invalid(code.to_string()))?;
        let kind = match unit {
            'h' => PeriodKind::Hour,
            'd' => PeriodKind::Day,
            'w' => PeriodKind::Week,
            'm' => PeriodKind::Month,
            'q' => PeriodKind::Quarter,
            'y' => PeriodKind::Year,
            _ => return Err(PeriodError::Invalid(code.to_string())),
        };
        let rest = chars.as_str();
        let n = if rest.is_empty() {
            1
        } else {
            rest.parse::<u32>()
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| PeriodError::Invalid(code.to_string()))?
        };
        Ok(Self { kind, n })
    }

    /// Canonical code form.
    pub fn code(&self) -> String {
        let unit = match self.kind {
            PeriodKind::Hour => 'h',
            PeriodKind::Day => 'd',
            PeriodKind::Week => 'w',
            PeriodKind::Month => 'm',
            PeriodKind::Quarter => 'q',
            PeriodKind::Year => 'y',
        };
        if self.n == 1 {
            unit.to_string()
        } else {
            format!("{unit}{}", self.n)
        }
    }

    /// Window length in fractional hours.
    pub fn hours(&self) -> f64 {
        let unit_hours = match self.kind {
            PeriodKind::Hour => 1.0,
            PeriodKind::Day => 24.0,
            PeriodKind::Week => 168.0,
            PeriodKind::Month => 730.5,
            PeriodKind::Quarter => 2191.5,
            PeriodKind::Year => 8766.0,
        };
        unit_hours * self.n as f64
    }

    /// PostgreSQL interval literal covering this period.
    pub fn interval(&self) -> String {
        match self.kind {
            PeriodKind::Hour => format!("{} hours", self.n),
            PeriodKind::Day => format!("{} days", self.n),
            PeriodKind::Week => format!("{} weeks", self.n),
            PeriodKind::Month => format!("{} months", self.n),
            PeriodKind::Quarter => format!("{} months", self.n * 3),
            PeriodKind::Year => format!("{} years", self.n),
        }
    }

    /// Start of the bucket containing `dt`. Multipliers bucket at base-unit
    /// granularity; iteration steps by the multiplier instead.
    pub fn bucket_start(&self, dt: DateTime<Utc>) -> DateTime<Utc> {
        let day = Utc
            .with_ymd_and_hms(dt.year(), dt.month(), dt.day(), 0, 0, 0)
            .single()
            .unwrap_or(dt);
        match self.kind {
            PeriodKind::Hour => Utc
                .with_ymd_and_hms(dt.year(), dt.month(), dt.day(), dt.hour(), 0, 0)
                .single()
                .unwrap_or(dt),
            PeriodKind::Day => day,
            PeriodKind::Week => {
                // Week starts Monday.
                let back = dt.weekday().num_days_from_monday() as i64;
                day - Duration::days(back)
            }
            PeriodKind::Month => Utc
                .with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(dt),
            PeriodKind::Quarter => {
                let month = ((dt.month() - 1) / 3) * 3 + 1;
                Utc.with_ymd_and_hms(dt.year(), month, 1, 0, 0, 0)
                    .single()
                    .unwrap_or(dt)
            }
            PeriodKind::Year => Utc
                .with_ymd_and_hms(dt.year(), 1, 1, 0, 0, 0)
                .single()
                .unwrap_or(dt),
        }
    }

    /// Advances a bucket start by `k` periods (honoring the multiplier).
    pub fn add(&self, dt: DateTime<Utc>, k: i32) -> DateTime<Utc> {
        let steps = self.n as i64 * k as i64;
        match self.kind {
            PeriodKind::Hour => dt + Duration::hours(steps),
            PeriodKind::Day => dt + Duration::days(steps),
            PeriodKind::Week => dt + Duration::weeks(steps),
            PeriodKind::Month => add_months(dt, steps),
            PeriodKind::Quarter => add_months(dt, steps * 3),
            PeriodKind::Year => add_months(dt, steps * 12),
        }
    }

    /// End (exclusive) of the bucket starting at `start`.
    pub fn bucket_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        self.add(start, 1)
    }
}

fn add_months(dt: DateTime<Utc>, months: i64) -> DateTime<Utc> {
    if months >= 0 {
        dt + Months::new(months as u32)
    } else {
        dt - Months::new((-months) as u32)
    }
}

/// Flags steering the recompute schedule.
#[derive(Debug, Clone, Default)]
pub struct ComputeFlags {
    /// Force every period every run.
    pub compute_all: bool,
    /// Restrict to these codes when non-empty.
    pub compute_periods: HashSet<String>,
    /// Extra random eligibility: probability `1/recalc_reciprocal`.
    pub recalc_reciprocal: u32,
    /// Probabilistic sampling windows instead of fixed hours.
    pub random_recompute: bool,
}

/// Sampling probabilities used when random recompute is enabled. Tuning
/// parameters, not invariants.
mod sample {
    /// Histogram metrics over annotation ranges.
    pub const ANNOTATION_PCT: u32 = 15;
    /// Daily periods, any hour.
    pub const DAILY_PCT: u32 = 25;
    /// Weekly periods, Sunday afternoon window.
    pub const WEEKLY_PCT: u32 = 30;
    /// Monthly periods at the closing hour.
    pub const MONTHLY_PCT: u32 = 60;
    /// Quarterly and yearly periods at the closing hour.
    pub const YEARLY_PCT: u32 = 80;
}

fn is_last_day_of_month(dt: DateTime<Utc>) -> bool {
    (dt + Duration::days(1)).month() != dt.month()
}

fn is_last_day_of_quarter(dt: DateTime<Utc>) -> bool {
    is_last_day_of_month(dt) && dt.month() % 3 == 0
}

/// Decides whether `(period_code, now)` should be recomputed this run.
///
/// `period_code` may also be an annotation-range suffix (`a_0_1`, `a_3_n`)
/// or a special range (`c_b`, `c_j`, `c_n`), which follow their own hours.
pub fn compute_period_at<R: Rng>(
    period_code: &str,
    now: DateTime<Utc>,
    histogram: bool,
    flags: &ComputeFlags,
    rng: &mut R,
) -> bool {
    if flags.compute_all {
        return true;
    }
    if !flags.compute_periods.is_empty() && !flags.compute_periods.contains(period_code) {
        return false;
    }
    if flags.recalc_reciprocal > 1 && rng.gen_ratio(1, flags.recalc_reciprocal) {
        return true;
    }

    let hour = now.hour();

    // Ranges between annotations and foundation-date ranges are not
    // parseable periods; they run at designated quiet hours.
    if period_code.starts_with("a_") {
        if flags.random_recompute {
            return rng.gen_ratio(sample::ANNOTATION_PCT, 100);
        }
        return hour == 7 || hour == 8;
    }
    if period_code.starts_with("c_") {
        return hour == 3 || hour == 4;
    }

    let Ok(period) = Period::parse(period_code) else {
        return false;
    };

    // Histograms are single heavy queries; they run in the same quiet
    // morning window as annotation ranges instead of the chart hours.
    if histogram {
        if flags.random_recompute {
            return rng.gen_ratio(sample::ANNOTATION_PCT, 100);
        }
        return match period.kind {
            PeriodKind::Hour => true,
            _ => hour == 7 || hour == 8,
        };
    }

    match period.kind {
        PeriodKind::Hour => true,
        PeriodKind::Day => {
            if flags.random_recompute {
                rng.gen_ratio(sample::DAILY_PCT, 100)
            } else {
                matches!(hour, 1 | 6 | 9 | 13 | 18 | 21)
            }
        }
        PeriodKind::Week => {
            let sunday = now.weekday() == chrono::Weekday::Sun;
            if flags.random_recompute {
                sunday && hour >= 12 && rng.gen_ratio(sample::WEEKLY_PCT, 100)
            } else {
                sunday && hour == 23
            }
        }
        PeriodKind::Month => {
            if flags.random_recompute {
                hour == 23 && rng.gen_ratio(sample::MONTHLY_PCT, 100)
            } else {
                hour == 23 && is_last_day_of_month(now)
            }
        }
        PeriodKind::Quarter => {
            if flags.random_recompute {
                hour == 23 && rng.gen_ratio(sample::YEARLY_PCT, 100)
            } else {
                hour == 23 && is_last_day_of_quarter(now)
            }
        }
        PeriodKind::Year => {
            if flags.random_recompute {
                hour == 23 && rng.gen_ratio(sample::YEARLY_PCT, 100)
            } else {
                hour == 23 && now.month() == 12 && now.day() == 31
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn flags() -> ComputeFlags {
        ComputeFlags {
            compute_all: false,
            compute_periods: HashSet::new(),
            recalc_reciprocal: 0,
            random_recompute: false,
        }
    }

    // A generator that never wins `gen_ratio` samples.
    fn never_rng() -> StepRng {
        StepRng::new(u64::MAX, 0)
    }

    #[test]
    fn test_parse_codes() {
        assert_eq!(
            Period::parse("d").unwrap(),
            Period { kind: PeriodKind::Day, n: 1 }
        );
        assert_eq!(
            Period::parse("d7").unwrap(),
            Period { kind: PeriodKind::Day, n: 7 }
        );
        assert_eq!(
            Period::parse("y10").unwrap(),
            Period { kind: PeriodKind::Year, n: 10 }
        );
        assert!(Period::parse("x").is_err());
        assert!(Period::parse("").is_err());
        assert!(Period::parse("d0").is_err());
        assert!(Period::parse("d7x").is_err());
    }

    #[test]
    fn test_code_round_trip() {
        for code in ["h", "d", "d7", "w", "m", "q", "y", "y10", "h24"] {
            assert_eq!(Period::parse(code).unwrap().code(), code);
        }
    }

    #[test]
    fn test_hours() {
        assert_eq!(Period::parse("h").unwrap().hours(), 1.0);
        assert_eq!(Period::parse("d7").unwrap().hours(), 168.0);
        assert_eq!(Period::parse("w").unwrap().hours(), 168.0);
        assert_eq!(Period::parse("y").unwrap().hours(), 8766.0);
    }

    #[test]
    fn test_interval_literals() {
        assert_eq!(Period::parse("d7").unwrap().interval(), "7 days");
        assert_eq!(Period::parse("q").unwrap().interval(), "3 months");
        assert_eq!(Period::parse("q2").unwrap().interval(), "6 months");
    }

    #[test]
    fn test_week_starts_monday() {
        // 2020-03-04 is a Wednesday; its week starts Monday 2020-03-02.
        let dt = Utc.with_ymd_and_hms(2020, 3, 4, 15, 30, 0).unwrap();
        let start = Period::parse("w").unwrap().bucket_start(dt);
        assert_eq!(start, Utc.with_ymd_and_hms(2020, 3, 2, 0, 0, 0).unwrap());
        // A Monday is its own week start.
        let monday = Utc.with_ymd_and_hms(2020, 3, 2, 5, 0, 0).unwrap();
        assert_eq!(
            Period::parse("w").unwrap().bucket_start(monday),
            Utc.with_ymd_and_hms(2020, 3, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_quarter_and_year_starts() {
        let dt = Utc.with_ymd_and_hms(2020, 8, 15, 12, 0, 0).unwrap();
        assert_eq!(
            Period::parse("q").unwrap().bucket_start(dt),
            Utc.with_ymd_and_hms(2020, 7, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            Period::parse("y").unwrap().bucket_start(dt),
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_bucket_stepping() {
        let period = Period::parse("d7").unwrap();
        let start = Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(
            period.bucket_end(start),
            Utc.with_ymd_and_hms(2020, 3, 8, 0, 0, 0).unwrap()
        );
        let month = Period::parse("m").unwrap();
        let jan31 = Utc.with_ymd_and_hms(2020, 1, 31, 0, 0, 0).unwrap();
        // Month arithmetic clamps the day.
        assert_eq!(
            month.add(jan31, 1),
            Utc.with_ymd_and_hms(2020, 2, 29, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_hourly_always_recomputes() {
        let mut rng = never_rng();
        let now = Utc.with_ymd_and_hms(2020, 3, 4, 14, 0, 0).unwrap();
        assert!(compute_period_at("h", now, false, &flags(), &mut rng));
    }

    #[test]
    fn test_daily_fixed_hours() {
        let mut rng = never_rng();
        for hour in [1, 6, 9, 13, 18, 21] {
            let now = Utc.with_ymd_and_hms(2020, 3, 4, hour, 0, 0).unwrap();
            assert!(compute_period_at("d", now, false, &flags(), &mut rng));
        }
        let now = Utc.with_ymd_and_hms(2020, 3, 4, 14, 0, 0).unwrap();
        assert!(!compute_period_at("d", now, false, &flags(), &mut rng));
    }

    #[test]
    fn test_weekly_sunday_23() {
        let mut rng = never_rng();
        // 2020-03-08 is a Sunday.
        let sunday23 = Utc.with_ymd_and_hms(2020, 3, 8, 23, 0, 0).unwrap();
        assert!(compute_period_at("w", sunday23, false, &flags(), &mut rng));
        let sunday12 = Utc.with_ymd_and_hms(2020, 3, 8, 12, 0, 0).unwrap();
        assert!(!compute_period_at("w", sunday12, false, &flags(), &mut rng));
        let monday23 = Utc.with_ymd_and_hms(2020, 3, 9, 23, 0, 0).unwrap();
        assert!(!compute_period_at("w", monday23, false, &flags(), &mut rng));
    }

    #[test]
    fn test_monthly_last_day() {
        let mut rng = never_rng();
        let last = Utc.with_ymd_and_hms(2020, 2, 29, 23, 0, 0).unwrap();
        assert!(compute_period_at("m", last, false, &flags(), &mut rng));
        let not_last = Utc.with_ymd_and_hms(2020, 2, 28, 23, 0, 0).unwrap();
        assert!(!compute_period_at("m", not_last, false, &flags(), &mut rng));
    }

    #[test]
    fn test_yearly_dec_31() {
        let mut rng = never_rng();
        let eve = Utc.with_ymd_and_hms(2020, 12, 31, 23, 0, 0).unwrap();
        assert!(compute_period_at("y", eve, false, &flags(), &mut rng));
        assert!(compute_period_at("q", eve, false, &flags(), &mut rng));
        let midyear = Utc.with_ymd_and_hms(2020, 6, 30, 23, 0, 0).unwrap();
        assert!(compute_period_at("q", midyear, false, &flags(), &mut rng));
        assert!(!compute_period_at("y", midyear, false, &flags(), &mut rng));
    }

    #[test]
    fn test_annotation_ranges_morning_hours() {
        let mut rng = never_rng();
        let morning = Utc.with_ymd_and_hms(2020, 3, 4, 7, 0, 0).unwrap();
        assert!(compute_period_at("a_0_1", morning, true, &flags(), &mut rng));
        assert!(compute_period_at("a_3_n", morning, true, &flags(), &mut rng));
        let night = Utc.with_ymd_and_hms(2020, 3, 4, 22, 0, 0).unwrap();
        assert!(!compute_period_at("a_0_1", night, true, &flags(), &mut rng));
        let three = Utc.with_ymd_and_hms(2020, 3, 4, 3, 0, 0).unwrap();
        assert!(compute_period_at("c_b", three, true, &flags(), &mut rng));
        assert!(!compute_period_at("c_b", morning, true, &flags(), &mut rng));
    }

    #[test]
    fn test_compute_all_and_period_narrowing() {
        let mut rng = never_rng();
        let now = Utc.with_ymd_and_hms(2020, 3, 4, 14, 0, 0).unwrap();
        let mut f = flags();
        f.compute_all = true;
        assert!(compute_period_at("y", now, false, &f, &mut rng));

        let mut f = flags();
        f.compute_periods.insert("d".to_string());
        assert!(!compute_period_at("h", now, false, &f, &mut rng));
    }

    #[test]
    fn test_recalc_reciprocal_fills_gaps() {
        // A generator that always wins `gen_ratio` samples.
        let mut rng = StepRng::new(0, 0);
        let now = Utc.with_ymd_and_hms(2020, 3, 4, 14, 0, 0).unwrap();
        let mut f = flags();
        f.recalc_reciprocal = 24;
        assert!(compute_period_at("y", now, false, &f, &mut rng));
    }
}
