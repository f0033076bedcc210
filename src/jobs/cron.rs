//! Five-field cron expressions (`minute hour day-of-month month
//! day-of-week`) evaluated in UTC.
//!
//! Fields accept `*`, numbers, `a-b` ranges, `/step` suffixes and comma
//! lists; months and weekdays also accept three-letter names. Weekday 7 is
//! Sunday. When both day fields are restricted a day matches if either
//! does. `@yearly`, `@monthly`, `@weekly`, `@daily` and `@hourly` are
//! accepted as shorthands.

use std::fmt;

use crate::utils::KvError;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Years searched ahead before declaring an expression unsatisfiable.
const MAX_YEARS_AHEAD: i64 = 8;

/// Parsed cron schedule; each field is a bitmask of allowed values.
#[derive(Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: u64,
    hours: u32,
    days_of_month: u32,
    months: u16,
    days_of_week: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn parse_value(s: &str, min: u32, max: u32, names: Option<&[&str]>) -> Result<u32, KvError> {
    if let Some(names) = names {
        let lower = s.to_ascii_lowercase();
        if let Some(pos) = names.iter().position(|n| *n == lower) {
            return Ok(pos as u32 + min);
        }
    }
    let v: u32 = s.parse()?;
    if v < min || v > max {
        return Err(KvError::msg(format!(
            "value {} out of range [{}, {}]",
            v, min, max
        )));
    }
    Ok(v)
}

/// Bitmask of one field plus whether it was `*`.
fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<&[&str]>,
) -> Result<(u64, bool), KvError> {
    let mut mask = 0u64;
    let mut star = false;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse()?;
                if step == 0 {
                    return Err(KvError::msg(format!("zero step in '{}'", part)));
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            star = star || step == 1;
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, min, max, names)?, parse_value(b, min, max, names)?)
        } else {
            let v = parse_value(range, min, max, names)?;
            // "5/15" means from 5 to the end in steps of 15
            if step > 1 {
                (v, max)
            } else {
                (v, v)
            }
        };
        if lo > hi {
            return Err(KvError::msg(format!("empty range '{}'", range)));
        }
        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }
    Ok((mask, star))
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, KvError> {
        let expanded = match expr.trim() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other => other,
        };
        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(KvError::msg(format!(
                "cron expression '{}' must have 5 fields",
                expr
            )));
        }
        let wrap = |e: KvError| KvError::msg(format!("parsing schedule expression '{}': {}", expr, e));
        let (minutes, _) = parse_field(fields[0], 0, 59, None).map_err(wrap)?;
        let (hours, _) = parse_field(fields[1], 0, 23, None).map_err(wrap)?;
        let (dom, dom_star) = parse_field(fields[2], 1, 31, None).map_err(wrap)?;
        let (months, _) = parse_field(fields[3], 1, 12, Some(&MONTH_NAMES)).map_err(wrap)?;
        let (mut dow, dow_star) = parse_field(fields[4], 0, 7, Some(&DAY_NAMES)).map_err(wrap)?;
        if dow & (1 << 7) != 0 {
            dow = (dow | 1) & !(1 << 7);
        }
        Ok(CronExpr {
            source: expr.to_string(),
            minutes,
            hours: hours as u32,
            days_of_month: dom as u32,
            months: months as u16,
            days_of_week: dow as u8,
            dom_restricted: !dom_star,
            dow_restricted: !dow_star,
        })
    }

    fn day_matches(&self, day: u32, weekday: u32) -> bool {
        let dom = self.days_of_month & (1 << day) != 0;
        let dow = self.days_of_week & (1 << weekday) != 0;
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }

    /// First matching minute strictly after `after` (unix seconds), as unix
    /// seconds; `None` if nothing matches in the next several years.
    pub fn next_after(&self, after: i64) -> Option<i64> {
        let mut minute = after.div_euclid(60) + 1;
        let (start_year, _, _) = civil_from_days(minute.div_euclid(1440));
        loop {
            let days = minute.div_euclid(1440);
            let (year, month, day) = civil_from_days(days);
            if year > start_year + MAX_YEARS_AHEAD {
                return None;
            }
            if self.months & (1 << month) == 0 {
                let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
                minute = days_from_civil(ny, nm, 1) * 1440;
                continue;
            }
            let weekday = (days + 4).rem_euclid(7) as u32;
            if !self.day_matches(day, weekday) {
                minute = (days + 1) * 1440;
                continue;
            }
            let of_day = minute.rem_euclid(1440);
            let hour = (of_day / 60) as u32;
            if self.hours & (1 << hour) == 0 {
                minute = days * 1440 + (hour as i64 + 1) * 60;
                continue;
            }
            let min = (of_day % 60) as u32;
            if self.minutes & (1 << min) == 0 {
                minute += 1;
                continue;
            }
            return Some(minute * 60);
        }
    }
}

impl fmt::Debug for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CronExpr({:?})", self.source)
    }
}

/// Days since 1970-01-01 of a proleptic Gregorian date.
pub(crate) fn days_from_civil(year: i64, month: u32, day: u32) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let m = month as i64;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + day as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

/// Inverse of `days_from_civil()`.
pub(crate) fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719468;
    let era = z.div_euclid(146097);
    let doe = z - era * 146097;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}
