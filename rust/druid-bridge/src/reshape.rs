//! Pivots Druid responses into `[value, timestamp]` series.

use crate::{
    error::{Result, ServiceError},
    models::{Series, SeriesPoint},
    query::{metric_names, NativeQuery, QuerySpec},
    time::parse_absolute,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::warn;

const SQL_FALLBACK_AGE_MINUTES: i64 = 10;

fn unexpected(message: impl Into<String>) -> ServiceError {
    ServiceError::UnexpectedResponse(message.into())
}

fn as_array<'a>(data: &'a Value, what: &str) -> Result<&'a Vec<Value>> {
    data.as_array()
        .ok_or_else(|| unexpected(format!("{what} response is not an array")))
}

/// Millisecond instant for a Druid timestamp, at full precision.
fn precise_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f as i64)),
        Value::String(text) => parse_absolute(text.trim()).map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

/// Druid bucket timestamp truncated to whole seconds, in milliseconds.
pub fn format_timestamp(value: &Value) -> Result<i64> {
    precise_millis(value)
        .map(|ms| ms.div_euclid(1000) * 1000)
        .ok_or_else(|| unexpected(format!("unreadable timestamp {value}")))
}

fn bucket_timestamp(bucket: &Value) -> Result<i64> {
    format_timestamp(bucket.get("timestamp").unwrap_or(&Value::Null))
}

pub fn convert_timeseries(data: &Value, metrics: &[String]) -> Result<Vec<Series>> {
    let buckets = as_array(data, "timeseries")?;
    let mut series: Vec<Series> = metrics.iter().map(Series::new).collect();

    for bucket in buckets {
        let ts = bucket_timestamp(bucket)?;
        let result = bucket.get("result");
        for (metric, out) in metrics.iter().zip(series.iter_mut()) {
            let value = result
                .and_then(|r| r.get(metric))
                .cloned()
                .unwrap_or(Value::Null);
            out.datapoints.push(SeriesPoint(value, ts));
        }
    }
    Ok(series)
}

fn topn_key(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "null".to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn topn_rows(bucket: &Value) -> &[Value] {
    bucket
        .get("result")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// One series per distinct dimension value, aligned so every bucket yields a
/// point in every series; values absent from a bucket become `null`.
pub fn convert_topn(data: &Value, dimension: &str, metric: &str) -> Result<Vec<Series>> {
    let buckets = as_array(data, "topN")?;

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut series: Vec<Series> = Vec::new();
    for bucket in buckets {
        for row in topn_rows(bucket) {
            let key = topn_key(row.get(dimension));
            if !index.contains_key(&key) {
                index.insert(key.clone(), series.len());
                series.push(Series::new(key));
            }
        }
    }

    for bucket in buckets {
        let ts = bucket_timestamp(bucket)?;
        let mut values: Vec<Value> = vec![Value::Null; series.len()];
        for row in topn_rows(bucket) {
            if let Some(&slot) = index.get(&topn_key(row.get(dimension))) {
                values[slot] = row.get(metric).cloned().unwrap_or(Value::Null);
            }
        }
        for (out, value) in series.iter_mut().zip(values) {
            out.datapoints.push(SeriesPoint(value, ts));
        }
    }
    Ok(series)
}

fn group_label(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn pivot_events<'a>(
    events: impl IntoIterator<Item = (i64, &'a Map<String, Value>)>,
    dimensions: &[String],
    metrics: &[String],
) -> Vec<Series> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut series: Vec<Series> = Vec::new();

    for (ts, event) in events {
        let group = dimensions
            .iter()
            .map(|d| group_label(event.get(d)))
            .collect::<Vec<_>>()
            .join("-");
        for metric in metrics {
            let key = format!("{group}:{metric}");
            let slot = *index.entry(key.clone()).or_insert_with(|| {
                series.push(Series::new(key));
                series.len() - 1
            });
            let value = event.get(metric).cloned().unwrap_or(Value::Null);
            series[slot].datapoints.push(SeriesPoint(value, ts));
        }
    }
    series
}

/// Series named `"<dim values joined by ->:<metric>"`, merged across buckets.
pub fn convert_group_by(
    data: &Value,
    dimensions: &[String],
    metrics: &[String],
) -> Result<Vec<Series>> {
    let rows = as_array(data, "groupBy")?;
    let empty = Map::new();
    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let ts = bucket_timestamp(row)?;
        let event = row.get("event").and_then(Value::as_object).unwrap_or(&empty);
        events.push((ts, event));
    }
    Ok(pivot_events(events, dimensions, metrics))
}

fn has_timestamp(event: &Map<String, Value>) -> bool {
    match event.get("timestamp") {
        None | Some(Value::Null) => false,
        Some(Value::String(text)) => !text.is_empty(),
        Some(_) => true,
    }
}

/// Every event field except `timestamp` becomes a series of raw values.
pub fn convert_select(data: &Value) -> Result<Vec<Series>> {
    let pages = as_array(data, "select")?;
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut series: Vec<Series> = Vec::new();

    let events = pages.iter().flat_map(|page| {
        page.pointer("/result/events")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    });

    for wrapper in events {
        let Some(event) = wrapper.get("event").and_then(Value::as_object) else {
            continue;
        };
        if !has_timestamp(event) {
            continue;
        }
        let Some(ts) = event.get("timestamp").and_then(precise_millis) else {
            warn!(timestamp = ?event.get("timestamp"), "skipping select event with unreadable timestamp");
            continue;
        };
        for (field, value) in event {
            if field == "timestamp" {
                continue;
            }
            let slot = *index.entry(field.clone()).or_insert_with(|| {
                series.push(Series::new(field.clone()));
                series.len() - 1
            });
            series[slot].datapoints.push(SeriesPoint(value.clone(), ts));
        }
    }
    Ok(series)
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Number(n)) => n.as_f64() != Some(0.0),
        Some(_) => true,
    }
}

/// SQL rows pivoted like groupBy events. Rows without a `timestamp` take it
/// from `__time`, or from ten minutes before `now` when that is missing too.
pub fn convert_sql(
    data: &Value,
    dimensions: &[String],
    metrics: &[String],
    now: DateTime<Utc>,
) -> Result<Vec<Series>> {
    let rows = as_array(data, "sql")?;
    let fallback = (now - Duration::minutes(SQL_FALLBACK_AGE_MINUTES)).timestamp_millis();
    let empty = Map::new();

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let event = row.as_object().unwrap_or(&empty);
        let ts = if truthy(event.get("timestamp")) {
            event
                .get("timestamp")
                .and_then(precise_millis)
                .ok_or_else(|| unexpected("unreadable sql timestamp"))?
        } else if truthy(event.get("__time")) {
            event
                .get("__time")
                .and_then(precise_millis)
                .unwrap_or(fallback)
        } else {
            fallback
        };
        events.push((ts.div_euclid(1000) * 1000, event));
    }
    Ok(pivot_events(events, dimensions, metrics))
}

fn output_name(spec: Option<&Value>) -> Option<String> {
    match spec? {
        Value::String(name) => Some(name.clone()),
        Value::Object(object) => object
            .get("outputName")
            .or_else(|| object.get("dimension"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn topn_metric_name(spec: Option<&Value>) -> Option<String> {
    match spec? {
        Value::String(name) => Some(name.clone()),
        Value::Object(object) => topn_metric_name(object.get("metric")),
        _ => None,
    }
}

fn list<'a>(raw: &'a Map<String, Value>, key: &str) -> &'a [Value] {
    raw.get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// A raw query is reshaped according to its own `queryType`.
pub fn convert_raw(raw: &Map<String, Value>, data: &Value) -> Result<Vec<Series>> {
    let metrics = || metric_names(list(raw, "aggregations"), list(raw, "postAggregations"));
    match raw.get("queryType").and_then(Value::as_str) {
        Some("timeseries") => convert_timeseries(data, &metrics()),
        Some("topN") => {
            let dimension = output_name(raw.get("dimension")).unwrap_or_default();
            let metric = topn_metric_name(raw.get("metric")).unwrap_or_default();
            convert_topn(data, &dimension, &metric)
        }
        Some("groupBy") => {
            let dimensions: Vec<String> = list(raw, "dimensions")
                .iter()
                .filter_map(|d| output_name(Some(d)))
                .collect();
            convert_group_by(data, &dimensions, &metrics())
        }
        Some("select") => convert_select(data),
        other => {
            warn!(query_type = ?other, "no reshaping for raw query type");
            Ok(Vec::new())
        }
    }
}

/// Reshapes a response according to the query that produced it.
pub fn convert(spec: &QuerySpec, data: &Value, now: DateTime<Utc>) -> Result<Vec<Series>> {
    match spec {
        QuerySpec::Sql(sql) => convert_sql(data, &sql.dimensions, &sql.metrics, now),
        QuerySpec::Raw(raw) => convert_raw(raw, data),
        QuerySpec::Native(NativeQuery::Timeseries(q)) => convert_timeseries(
            data,
            &metric_names(&q.aggregation.aggregations, &q.aggregation.post_aggregations),
        ),
        QuerySpec::Native(NativeQuery::TopN(q)) => {
            convert_topn(data, &q.dimension, q.metric.as_deref().unwrap_or_default())
        }
        QuerySpec::Native(NativeQuery::GroupBy(q)) => convert_group_by(
            data,
            &q.dimensions,
            &metric_names(&q.aggregation.aggregations, &q.aggregation.post_aggregations),
        ),
        QuerySpec::Native(NativeQuery::Select(_)) => convert_select(data),
    }
}

/// Druid labels the first bucket with its floor; pull that point forward to
/// the window start. Only the first point of each series moves.
pub fn clamp_series_start(series: &mut [Series], start: DateTime<Utc>) {
    let start_ms = start.timestamp().saturating_mul(1000);
    for s in series {
        if let Some(first) = s.datapoints.first_mut() {
            if first.1 < start_ms {
                first.1 = start_ms;
            }
        }
    }
}
