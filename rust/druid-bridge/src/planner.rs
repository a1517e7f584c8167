//! Granularity selection and query-window rounding.

use crate::time::TimeRange;
use chrono::{DateTime, NaiveTime, SecondsFormat, TimeZone, Utc};
use serde::{ser::SerializeMap, Serialize, Serializer};
use tracing::{debug, warn};

/// Discrete bucket widths, declared in ascending order of duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Granularity {
    Minute,
    FifteenMinute,
    ThirtyMinute,
    Hour,
    Day,
}

impl Granularity {
    pub const ASCENDING: [Granularity; 5] = [
        Granularity::Minute,
        Granularity::FifteenMinute,
        Granularity::ThirtyMinute,
        Granularity::Hour,
        Granularity::Day,
    ];

    pub const fn seconds(self) -> i64 {
        match self {
            Granularity::Minute => 60,
            Granularity::FifteenMinute => 15 * 60,
            Granularity::ThirtyMinute => 30 * 60,
            Granularity::Hour => 60 * 60,
            Granularity::Day => 24 * 60 * 60,
        }
    }

    pub const fn millis(self) -> i64 {
        self.seconds() * 1000
    }

    pub const fn name(self) -> &'static str {
        match self {
            Granularity::Minute => "minute",
            Granularity::FifteenMinute => "fifteen_minute",
            Granularity::ThirtyMinute => "thirty_minute",
            Granularity::Hour => "hour",
            Granularity::Day => "day",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ASCENDING
            .into_iter()
            .find(|g| g.name().eq_ignore_ascii_case(name.trim()))
    }
}

/// The `granularity` value sent to Druid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryGranularity {
    All,
    Simple(Granularity),
    Period { period: String, time_zone: String },
    /// A Druid granularity name outside the planner's table (e.g. `week`), sent as-is.
    Other(String),
}

impl QueryGranularity {
    pub fn from_name(name: &str) -> Self {
        let trimmed = name.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return QueryGranularity::All;
        }
        match Granularity::from_name(trimmed) {
            Some(g) => QueryGranularity::Simple(g),
            None => QueryGranularity::Other(trimmed.to_string()),
        }
    }

    pub fn daily_period(time_zone: &str) -> Self {
        QueryGranularity::Period {
            period: "P1D".to_string(),
            time_zone: time_zone.to_string(),
        }
    }
}

impl Serialize for QueryGranularity {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            QueryGranularity::All => serializer.serialize_str("all"),
            QueryGranularity::Simple(g) => serializer.serialize_str(g.name()),
            QueryGranularity::Other(name) => serializer.serialize_str(name),
            QueryGranularity::Period { period, time_zone } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("type", "period")?;
                map.serialize_entry("period", period)?;
                map.serialize_entry("timeZone", time_zone)?;
                map.end()
            }
        }
    }
}

/// Smaller of the two budgets; `None` on both sides means unbounded.
pub fn effective_max_points(panel: Option<u64>, target: Option<u64>) -> Option<u64> {
    match (panel, target) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Picks the finest granularity whose bucket count fits `max_points`.
/// Falls back to the coarsest entry when even that overflows the budget.
pub fn select_granularity(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    max_points: Option<u64>,
) -> Granularity {
    let interval_secs = (to.timestamp() - from.timestamp()).max(0);
    let Some(max_points) = max_points else {
        return Granularity::ASCENDING[0];
    };
    let budget = i64::try_from(max_points).unwrap_or(i64::MAX);

    for granularity in Granularity::ASCENDING {
        let step = granularity.seconds();
        let points = (interval_secs + step - 1) / step;
        if points <= budget {
            debug!(
                granularity = granularity.name(),
                points,
                minutes = interval_secs / 60,
                max_points,
                "calculated granularity"
            );
            return granularity;
        }
    }

    let coarsest = Granularity::ASCENDING[Granularity::ASCENDING.len() - 1];
    warn!(
        minutes = interval_secs / 60,
        max_points,
        granularity = coarsest.name(),
        "no granularity fits the point budget; using the coarsest"
    );
    coarsest
}

/// Moves `from` onto a bucket edge: start of the UTC day for `day`, the next
/// multiple of the bucket width for the other table entries, untouched otherwise.
pub fn round_up_start(from: DateTime<Utc>, granularity: &QueryGranularity) -> DateTime<Utc> {
    let rounded = match granularity {
        QueryGranularity::Simple(Granularity::Day) => {
            let midnight = from.date_naive().and_time(NaiveTime::MIN);
            DateTime::<Utc>::from_naive_utc_and_offset(midnight, Utc)
        }
        QueryGranularity::Simple(g) => {
            let width = g.millis();
            let ms = from.timestamp_millis();
            let buckets = ms.div_euclid(width) + i64::from(ms.rem_euclid(width) != 0);
            match Utc.timestamp_millis_opt(buckets * width).single() {
                Some(edge) => edge,
                None => from,
            }
        }
        _ => from,
    };

    if rounded != from {
        debug!(from = %from, to = %rounded, granularity = ?granularity, "rounded window start");
    }
    rounded
}

/// One `start/end` ISO 8601 interval covering the window.
pub fn query_intervals(from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<String> {
    vec![format!(
        "{}/{}",
        from.to_rfc3339_opts(SecondsFormat::Millis, true),
        to.to_rfc3339_opts(SecondsFormat::Millis, true)
    )]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowPlan {
    pub granularity: QueryGranularity,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl WindowPlan {
    pub fn intervals(&self) -> Vec<String> {
        query_intervals(self.start, self.end)
    }
}

/// Resolves granularity and the rounded start for one target.
pub fn plan_window(
    range: &TimeRange,
    max_points: Option<u64>,
    granularity_override: Option<&str>,
    period_time_zone: Option<&str>,
) -> WindowPlan {
    let granularity = match granularity_override {
        Some(name) => QueryGranularity::from_name(name),
        None => QueryGranularity::Simple(select_granularity(range.from, range.to, max_points)),
    };

    let mut start = if granularity == QueryGranularity::All {
        range.from
    } else {
        round_up_start(range.from, &granularity)
    };
    if start > range.to {
        debug!(start = %start, end = %range.to, "window shorter than one bucket, start held at end");
        start = range.to;
    }

    let granularity = match (period_time_zone, &granularity) {
        (Some(tz), QueryGranularity::Simple(Granularity::Day)) => QueryGranularity::daily_period(tz),
        _ => granularity,
    };

    WindowPlan {
        granularity,
        start,
        end: range.to,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn at(raw: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(raw)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn picks_smallest_fitting_granularity() {
        let from = at("2024-01-01T00:00:00Z");
        let to = from + Duration::seconds(7200);
        assert_eq!(
            select_granularity(from, to, Some(10)),
            Granularity::FifteenMinute
        );
        assert_eq!(select_granularity(from, to, Some(120)), Granularity::Minute);
        assert_eq!(select_granularity(from, to, Some(2)), Granularity::Hour);
        assert_eq!(select_granularity(from, to, None), Granularity::Minute);
    }

    #[test]
    fn partial_bucket_counts_as_a_point() {
        let from = at("2024-01-01T00:00:00Z");
        let to = from + Duration::seconds(601);
        // 601s needs 11 minute buckets.
        assert_eq!(
            select_granularity(from, to, Some(10)),
            Granularity::FifteenMinute
        );
    }

    #[test]
    fn clamps_to_coarsest_when_nothing_fits() {
        let from = at("2020-01-01T00:00:00Z");
        let to = at("2024-01-01T00:00:00Z");
        assert_eq!(select_granularity(from, to, Some(5)), Granularity::Day);
    }

    #[test]
    fn rounds_up_to_bucket_edge() {
        let from = at("2024-01-01T10:07:30Z");
        let g = QueryGranularity::Simple(Granularity::FifteenMinute);
        assert_eq!(round_up_start(from, &g), at("2024-01-01T10:15:00Z"));

        let hour = QueryGranularity::Simple(Granularity::Hour);
        assert_eq!(round_up_start(from, &hour), at("2024-01-01T11:00:00Z"));
    }

    #[test]
    fn day_rounds_down_to_midnight() {
        let from = at("2024-01-01T10:07:30Z");
        let day = QueryGranularity::Simple(Granularity::Day);
        assert_eq!(round_up_start(from, &day), at("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn rounding_is_idempotent() {
        let from = at("2024-05-17T13:41:07.250Z");
        for g in Granularity::ASCENDING {
            let g = QueryGranularity::Simple(g);
            let once = round_up_start(from, &g);
            assert_eq!(round_up_start(once, &g), once, "{g:?}");
        }
    }

    #[test]
    fn all_and_unknown_names_are_not_rounded() {
        let from = at("2024-01-01T10:07:30Z");
        assert_eq!(round_up_start(from, &QueryGranularity::All), from);
        assert_eq!(
            round_up_start(from, &QueryGranularity::Other("week".into())),
            from
        );
    }

    #[test]
    fn intervals_use_millisecond_iso() {
        let intervals = query_intervals(at("2024-01-01T00:00:00Z"), at("2024-01-01T06:00:00Z"));
        assert_eq!(
            intervals,
            vec!["2024-01-01T00:00:00.000Z/2024-01-01T06:00:00.000Z".to_string()]
        );
    }

    #[test]
    fn granularity_serialization() {
        assert_eq!(
            serde_json::to_value(QueryGranularity::Simple(Granularity::ThirtyMinute)).unwrap(),
            json!("thirty_minute")
        );
        assert_eq!(
            serde_json::to_value(QueryGranularity::All).unwrap(),
            json!("all")
        );
        assert_eq!(
            serde_json::to_value(QueryGranularity::daily_period("Asia/Shanghai")).unwrap(),
            json!({"type": "period", "period": "P1D", "timeZone": "Asia/Shanghai"})
        );
    }

    #[test]
    fn plan_substitutes_period_for_daily_buckets() {
        let range = TimeRange::new(at("2024-01-01T10:00:00Z"), at("2024-03-01T00:00:00Z")).unwrap();
        let plan = plan_window(&range, Some(100), None, Some("America/New_York"));
        assert_eq!(
            plan.granularity,
            QueryGranularity::daily_period("America/New_York")
        );
        assert_eq!(plan.start, at("2024-01-01T00:00:00Z"));

        let plan = plan_window(&range, Some(100), None, None);
        assert_eq!(plan.granularity, QueryGranularity::Simple(Granularity::Day));
    }

    #[test]
    fn plan_honors_override() {
        let range = TimeRange::new(at("2024-01-01T10:07:00Z"), at("2024-01-01T12:00:00Z")).unwrap();
        let plan = plan_window(&range, Some(1000), Some("all"), None);
        assert_eq!(plan.granularity, QueryGranularity::All);
        assert_eq!(plan.start, range.from);

        let plan = plan_window(&range, Some(1000), Some("hour"), None);
        assert_eq!(plan.start, at("2024-01-01T11:00:00Z"));
    }

    #[test]
    fn start_never_passes_the_end() {
        let range = TimeRange::new(at("2024-01-01T10:07:10Z"), at("2024-01-01T10:07:40Z")).unwrap();
        let plan = plan_window(&range, Some(1000), Some("minute"), None);
        assert_eq!(plan.start, range.to);
        assert_eq!(
            plan.intervals(),
            vec!["2024-01-01T10:07:40.000Z/2024-01-01T10:07:40.000Z".to_string()]
        );
    }

    #[test]
    fn budget_takes_the_minimum() {
        assert_eq!(effective_max_points(Some(500), Some(20)), Some(20));
        assert_eq!(effective_max_points(Some(500), None), Some(500));
        assert_eq!(effective_max_points(None, None), None);
    }
}
