//! Resolution of dashboard time expressions (`now-6h`, `now/d`, RFC 3339, epoch millis)
//! into concrete UTC instants.

use crate::error::{Result, ServiceError};
use chrono::{
    DateTime, Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self> {
        if from >= to {
            return Err(ServiceError::InvalidRequest(
                "time range start must be before end".to_string(),
            ));
        }
        Ok(Self { from, to })
    }

    /// Parses both edges, rounding `from` down and `to` up.
    pub fn resolve(math: &dyn TimeRangeMath, from: &str, to: &str) -> Result<Self> {
        let from = math.parse(from, false)?;
        let to = math.parse(to, true)?;
        Self::new(from, to)
    }
}

/// Turns a relative or absolute time expression into an instant.
pub trait TimeRangeMath: Send + Sync {
    fn parse(&self, value: &str, round_up: bool) -> Result<DateTime<Utc>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl Unit {
    fn from_char(ch: char) -> Option<Self> {
        match ch {
            's' => Some(Unit::Second),
            'm' => Some(Unit::Minute),
            'h' | 'H' => Some(Unit::Hour),
            'd' => Some(Unit::Day),
            'w' => Some(Unit::Week),
            'M' => Some(Unit::Month),
            'y' => Some(Unit::Year),
            _ => None,
        }
    }
}

/// Grafana-compatible date math with an injectable clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct DateMath {
    fixed_now: Option<DateTime<Utc>>,
}

impl DateMath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates every `now` against the given instant.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            fixed_now: Some(now),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.fixed_now.unwrap_or_else(Utc::now)
    }
}

impl TimeRangeMath for DateMath {
    fn parse(&self, value: &str, round_up: bool) -> Result<DateTime<Utc>> {
        let value = value.trim().trim_matches('"');
        if value.is_empty() {
            return Err(ServiceError::InvalidRequest("empty time value".into()));
        }

        if let Some(ops) = value.strip_prefix("now") {
            return apply_math(self.now(), ops, round_up)
                .ok_or_else(|| invalid_time(value));
        }

        if let Some((anchor, ops)) = value.split_once("||") {
            let anchor = parse_absolute(anchor).ok_or_else(|| invalid_time(value))?;
            return apply_math(anchor, ops, round_up).ok_or_else(|| invalid_time(value));
        }

        parse_absolute(value).ok_or_else(|| invalid_time(value))
    }
}

fn invalid_time(value: &str) -> ServiceError {
    ServiceError::InvalidRequest(format!("invalid time expression '{value}'"))
}

/// Epoch millis, RFC 3339, `YYYY-MM-DD HH:MM:SS` or a bare date, all read as UTC.
pub(crate) fn parse_absolute(value: &str) -> Option<DateTime<Utc>> {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        let millis = value.parse::<i64>().ok()?;
        return Utc.timestamp_millis_opt(millis).single();
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(start_of_day(date));
    }
    None
}

fn apply_math(mut time: DateTime<Utc>, ops: &str, round_up: bool) -> Option<DateTime<Utc>> {
    let chars: Vec<char> = ops.chars().collect();
    let mut idx = 0;

    while idx < chars.len() {
        let op = chars[idx];
        idx += 1;

        if op == '/' {
            let unit = Unit::from_char(*chars.get(idx)?)?;
            idx += 1;
            time = round_to_unit(time, unit, round_up)?;
            continue;
        }

        let sign = match op {
            '+' => 1i64,
            '-' => -1i64,
            _ => return None,
        };

        let digits_start = idx;
        while idx < chars.len() && chars[idx].is_ascii_digit() {
            idx += 1;
        }
        let amount = if idx == digits_start {
            1
        } else {
            chars[digits_start..idx]
                .iter()
                .collect::<String>()
                .parse::<i64>()
                .ok()?
        };
        let unit = Unit::from_char(*chars.get(idx)?)?;
        idx += 1;

        time = shift(time, sign * amount, unit)?;
    }

    Some(time)
}

fn shift(time: DateTime<Utc>, amount: i64, unit: Unit) -> Option<DateTime<Utc>> {
    match unit {
        Unit::Second => time.checked_add_signed(Duration::seconds(amount)),
        Unit::Minute => time.checked_add_signed(Duration::minutes(amount)),
        Unit::Hour => time.checked_add_signed(Duration::hours(amount)),
        Unit::Day => time.checked_add_signed(Duration::days(amount)),
        Unit::Week => time.checked_add_signed(Duration::weeks(amount)),
        Unit::Month => shift_months(time, amount),
        Unit::Year => shift_months(time, amount.checked_mul(12)?),
    }
}

fn shift_months(time: DateTime<Utc>, months: i64) -> Option<DateTime<Utc>> {
    let magnitude = Months::new(u32::try_from(months.unsigned_abs()).ok()?);
    if months >= 0 {
        time.checked_add_months(magnitude)
    } else {
        time.checked_sub_months(magnitude)
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    DateTime::<Utc>::from_naive_utc_and_offset(date.and_time(NaiveTime::MIN), Utc)
}

/// Rounds down to the start of `unit`; with `round_up`, to the last millisecond of it.
fn round_to_unit(time: DateTime<Utc>, unit: Unit, round_up: bool) -> Option<DateTime<Utc>> {
    let date = time.date_naive();
    let start = match unit {
        Unit::Second => Utc.timestamp_opt(time.timestamp(), 0).single()?,
        Unit::Minute => Utc.timestamp_opt(time.timestamp() - time.timestamp() % 60, 0).single()?,
        Unit::Hour => Utc
            .timestamp_opt(time.timestamp() - time.timestamp() % 3600, 0)
            .single()?,
        Unit::Day => start_of_day(date),
        Unit::Week => {
            let back = i64::from(date.weekday().num_days_from_monday());
            start_of_day(date - Duration::days(back))
        }
        Unit::Month => start_of_day(NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?),
        Unit::Year => start_of_day(NaiveDate::from_ymd_opt(date.year(), 1, 1)?),
    };

    if !round_up {
        return Some(start);
    }

    let next = shift(start, 1, unit)?;
    next.checked_sub_signed(Duration::milliseconds(1))
}
