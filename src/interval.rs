//! The interval value type: (months, days, ticks) with ticks in 100 ns
//! units, plus the literal parser and formatter for the
//! `N year[s] M mon[s] D day[s] [±]HH:MM:SS[.frac]` syntax. Total
//! conversions assume 30 days per month and 24 hours per day.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::constants::{DAYS_PER_MONTH, TICKS_PER_DAY, TICKS_PER_SECOND};
use crate::errors::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub ticks: i64,
}

impl Interval {
    pub fn new(months: i32, days: i32, ticks: i64) -> Interval {
        Interval { months, days, ticks }
    }

    /// The whole interval as ticks, at 30 days/month and 24 hours/day.
    pub fn total_ticks(&self) -> i64 {
        (self.months as i64 * DAYS_PER_MONTH + self.days as i64) * TICKS_PER_DAY + self.ticks
    }

    /// Redistribute into the largest units: whole months, whole days, and a
    /// sub-day remainder. Idempotent.
    pub fn justify(&self) -> Interval {
        let total = self.total_ticks();
        let ticks_per_month = DAYS_PER_MONTH * TICKS_PER_DAY;
        let months = total / ticks_per_month;
        let rem = total % ticks_per_month;
        Interval {
            months: months as i32,
            days: (rem / TICKS_PER_DAY) as i32,
            ticks: rem % TICKS_PER_DAY,
        }
    }

    /// Collapse everything into ticks.
    pub fn unjustify(&self) -> Interval {
        Interval {
            months: 0,
            days: 0,
            ticks: self.total_ticks(),
        }
    }

    /// Month-free form with the time part bounded to under one day.
    pub fn canonicalize(&self) -> Interval {
        let total = self.total_ticks();
        Interval {
            months: 0,
            days: (total / TICKS_PER_DAY) as i32,
            ticks: total % TICKS_PER_DAY,
        }
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut wrote = false;
        let years = self.months / 12;
        let months = self.months % 12;

        let mut unit = |f: &mut Formatter<'_>, value: i64, singular: &str| -> std::fmt::Result {
            if value != 0 {
                if wrote {
                    write!(f, " ")?;
                }
                if value.abs() == 1 {
                    write!(f, "{value} {singular}")?;
                } else {
                    write!(f, "{value} {singular}s")?;
                }
                wrote = true;
            }
            Ok(())
        };

        unit(f, years as i64, "year")?;
        unit(f, months as i64, "mon")?;
        unit(f, self.days as i64, "day")?;

        if self.ticks != 0 || !wrote {
            if wrote {
                write!(f, " ")?;
            }
            let sign = if self.ticks < 0 { "-" } else { "" };
            let ticks = self.ticks.unsigned_abs();
            let seconds = ticks / TICKS_PER_SECOND as u64;
            let frac = ticks % TICKS_PER_SECOND as u64;
            write!(
                f,
                "{sign}{:02}:{:02}:{:02}",
                seconds / 3600,
                seconds / 60 % 60,
                seconds % 60
            )?;
            if frac != 0 {
                let digits = format!("{frac:07}");
                write!(f, ".{}", digits.trim_end_matches('0'))?;
            }
        }
        Ok(())
    }
}

impl FromStr for Interval {
    type Err = Error;

    fn from_str(s: &str) -> Result<Interval, Error> {
        let invalid = || Error::ProtocolViolation(format!("invalid interval literal {s:?}"));

        let mut months: i64 = 0;
        let mut days: i64 = 0;
        let mut ticks: i64 = 0;
        let mut saw_token = false;
        let mut saw_time = false;

        let mut tokens = s.split_whitespace().peekable();
        while let Some(token) = tokens.next() {
            if token.contains(':') {
                if saw_time {
                    return Err(invalid());
                }
                ticks = parse_time(token).ok_or_else(invalid)?;
                saw_time = true;
                saw_token = true;
                continue;
            }

            let value: i64 = token.parse().map_err(|_| invalid())?;
            let unit = tokens.next().ok_or_else(invalid)?;
            match unit.to_ascii_lowercase().as_str() {
                "year" | "years" | "yr" | "yrs" => months += value * 12,
                "mon" | "mons" | "month" | "months" => months += value,
                "day" | "days" => days += value,
                _ => return Err(invalid()),
            }
            saw_token = true;
        }

        if !saw_token {
            return Err(invalid());
        }

        let months = i32::try_from(months).map_err(|_| invalid())?;
        let days = i32::try_from(days).map_err(|_| invalid())?;
        Ok(Interval { months, days, ticks })
    }
}

/// `[±]HH:MM:SS[.frac]`, returned as ticks.
fn parse_time(token: &str) -> Option<i64> {
    let (negative, token) = match *token.as_bytes().first()? {
        b'-' => (true, &token[1..]),
        b'+' => (false, &token[1..]),
        _ => (false, token),
    };

    let mut parts = token.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds_part = parts.next()?;
    if parts.next().is_some() || hours < 0 || !(0..60).contains(&minutes) {
        return None;
    }

    let (seconds, frac_ticks) = match seconds_part.split_once('.') {
        Some((whole, frac)) => {
            if frac.is_empty() || frac.len() > 7 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let padded = format!("{frac:0<7}");
            (whole.parse::<i64>().ok()?, padded.parse::<i64>().ok()?)
        }
        None => (seconds_part.parse::<i64>().ok()?, 0),
    };
    if !(0..60).contains(&seconds) {
        return None;
    }

    let ticks = ((hours * 3600 + minutes * 60 + seconds) * TICKS_PER_SECOND) + frac_ticks;
    Some(if negative { -ticks } else { ticks })
}
