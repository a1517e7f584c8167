//! Turns a panel target into the request Druid should receive.

mod native;

pub use native::{
    Aggregation, GroupByQuery, LimitSpec, NativeQuery, OrderByColumn, PagingSpec, QueryCommon,
    SelectQuery, TimeseriesQuery, TopNQuery,
};

use crate::{
    error::{Result, ServiceError},
    filter::{self, FilterDescriptor},
    models::{PanelTarget, QueryKind},
    planner::{QueryGranularity, WindowPlan},
    template::VariableSubstitution,
};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

pub const NATIVE_ENDPOINT: &str = "/druid/v2/";
pub const SQL_ENDPOINT: &str = "/druid/v2/sql";

const FILTER_VALUES_THRESHOLD: u64 = 10;

/// Operator-level rewrites applied to every native body just before it is sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOverrides {
    pub post_aggregations: Option<Vec<Value>>,
}

impl QueryOverrides {
    fn apply(&self, body: &mut Value) {
        if let (Some(post), Some(object)) = (&self.post_aggregations, body.as_object_mut()) {
            object.insert("postAggregations".into(), Value::Array(post.clone()));
        }
    }
}

/// SQL text plus the pivot the rows are reshaped with.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub query: String,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuerySpec {
    Sql(SqlQuery),
    Raw(Map<String, Value>),
    Native(NativeQuery),
}

impl QuerySpec {
    pub fn endpoint(&self) -> &'static str {
        match self {
            QuerySpec::Sql(_) => SQL_ENDPOINT,
            QuerySpec::Raw(_) | QuerySpec::Native(_) => NATIVE_ENDPOINT,
        }
    }

    /// JSON body for the request; overrides never touch SQL.
    pub fn render(&self, overrides: &QueryOverrides) -> Result<Value> {
        let mut body = match self {
            QuerySpec::Sql(sql) => {
                return Ok(json!({
                    "query": sql.query,
                    "resultFormat": "object",
                    "header": true,
                }))
            }
            QuerySpec::Raw(raw) => Value::Object(raw.clone()),
            QuerySpec::Native(native) => serde_json::to_value(native)
                .map_err(|err| ServiceError::Internal(err.into()))?,
        };
        overrides.apply(&mut body);
        Ok(body)
    }

    pub fn query_type(&self) -> &str {
        match self {
            QuerySpec::Sql(_) => "sql",
            QuerySpec::Raw(raw) => raw
                .get("queryType")
                .and_then(Value::as_str)
                .unwrap_or("raw"),
            QuerySpec::Native(NativeQuery::Timeseries(_)) => "timeseries",
            QuerySpec::Native(NativeQuery::TopN(_)) => "topN",
            QuerySpec::Native(NativeQuery::GroupBy(_)) => "groupBy",
            QuerySpec::Native(NativeQuery::Select(_)) => "select",
        }
    }

    /// Select results are raw events, so their first point is never clamped.
    pub fn clamps_first_point(&self) -> bool {
        !matches!(self, QuerySpec::Native(NativeQuery::Select(_)))
    }

    /// Lookup used by the filter editor: top ten values of `dimension` whose
    /// text contains `search`, within the target's existing filters.
    pub fn filter_values(
        datasource: &str,
        dimension: &str,
        filters: &[FilterDescriptor],
        search: &str,
        intervals: Vec<String>,
        vars: &dyn VariableSubstitution,
    ) -> Self {
        let mut filters = filters.to_vec();
        filters.push(FilterDescriptor::insensitive_search(dimension, search));

        QuerySpec::Native(NativeQuery::TopN(TopNQuery {
            common: QueryCommon {
                data_source: datasource.to_string(),
                granularity: QueryGranularity::All,
                intervals,
                filter: filter::compile(&filters, vars),
            },
            aggregation: Aggregation {
                aggregations: vec![json!({"type": "count", "name": "count"})],
                post_aggregations: Vec::new(),
            },
            dimension: dimension.to_string(),
            metric: Some("count".to_string()),
            threshold: Some(FILTER_VALUES_THRESHOLD),
        }))
    }
}

fn is_visible(spec: &Value) -> bool {
    let folded = spec.get("type").and_then(Value::as_str) == Some("approxHistogramFold");
    let hidden = spec.get("hidden").and_then(Value::as_bool).unwrap_or(false);
    !folded && !hidden
}

/// Names of the visible aggregators followed by the visible post-aggregators,
/// de-duplicated in first-seen order.
pub fn metric_names(aggregations: &[Value], post_aggregations: &[Value]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for spec in aggregations.iter().chain(post_aggregations) {
        if !is_visible(spec) {
            continue;
        }
        if let Some(name) = spec.get("name").and_then(Value::as_str) {
            if !names.iter().any(|existing| existing == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

/// Reads editor-supplied JSON that should hold a list; a lone object counts as
/// one entry. Anything unparseable is dropped.
pub fn parse_raw_list(text: Option<&str>, what: &str) -> Vec<Value> {
    let Some(text) = text else {
        return Vec::new();
    };
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => items,
        Ok(object @ Value::Object(_)) => vec![object],
        Ok(other) => {
            warn!(kind = what, value = %other, "ignoring raw json that is not a list or object");
            Vec::new()
        }
        Err(err) => {
            warn!(kind = what, error = %err, "ignoring unparseable raw json");
            Vec::new()
        }
    }
}

/// Parses a raw query; only a JSON object qualifies.
pub fn parse_raw_query(text: Option<&str>) -> Option<Map<String, Value>> {
    let text = text?;
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Some(object),
        Ok(_) => {
            warn!("ignoring raw query that is not a json object");
            None
        }
        Err(err) => {
            warn!(error = %err, "ignoring unparseable raw query");
            None
        }
    }
}

fn merged(structured: &[Value], raw: Vec<Value>) -> Vec<Value> {
    let mut out = structured.to_vec();
    out.extend(raw);
    out
}

fn merged_filters(target: &PanelTarget) -> Vec<FilterDescriptor> {
    let mut filters = target.filters.clone();
    for value in parse_raw_list(target.raw_filter_text(), "filter") {
        match serde_json::from_value::<FilterDescriptor>(value) {
            Ok(descriptor) => filters.push(descriptor),
            Err(err) => warn!(error = %err, "ignoring raw filter without a type"),
        }
    }
    filters
}

/// Builds the request for one target. SQL wins over a raw query, which wins
/// over the editor's structured query type.
pub fn build_query(
    target: &PanelTarget,
    plan: &WindowPlan,
    vars: &dyn VariableSubstitution,
) -> QuerySpec {
    let aggregations = merged(
        &target.aggregators,
        parse_raw_list(target.raw_aggregator_text(), "aggregator"),
    );
    let post_aggregations = merged(
        &target.post_aggregators,
        parse_raw_list(target.raw_post_aggregator_text(), "post-aggregator"),
    );
    let dimensions: Vec<String> = target.group_by.iter().map(|d| vars.replace(d)).collect();

    if let Some(sql) = target.sql_text() {
        return QuerySpec::Sql(SqlQuery {
            query: vars.replace(sql),
            dimensions,
            metrics: metric_names(&aggregations, &post_aggregations),
        });
    }

    if let Some(mut raw) = parse_raw_query(target.raw_query_text()) {
        raw.insert("intervals".into(), json!(plan.intervals()));
        return QuerySpec::Raw(raw);
    }

    let common = QueryCommon {
        data_source: target.datasource().unwrap_or_default().to_string(),
        granularity: plan.granularity.clone(),
        intervals: plan.intervals(),
        filter: filter::compile(&merged_filters(target), vars),
    };
    let aggregation = Aggregation {
        aggregations,
        post_aggregations,
    };

    let native = match target.kind() {
        QueryKind::TopN => NativeQuery::TopN(TopNQuery {
            common,
            aggregation,
            dimension: vars.replace(target.dimension.as_deref().unwrap_or_default()),
            metric: target.druid_metric.clone(),
            threshold: target.limit,
        }),
        QueryKind::GroupBy => NativeQuery::GroupBy(GroupByQuery {
            common,
            aggregation,
            dimensions,
            limit_spec: target
                .limit
                .map(|limit| LimitSpec::new(limit, target.order_by.as_deref())),
        }),
        QueryKind::Select => NativeQuery::Select(SelectQuery {
            common,
            dimensions: target.select_dimensions.clone(),
            metrics: target.select_metrics.clone(),
            paging_spec: PagingSpec::first_page(target.select_threshold),
        }),
        QueryKind::Timeseries | QueryKind::Unknown => NativeQuery::Timeseries(TimeseriesQuery {
            common,
            aggregation,
        }),
    };
    debug!(query_type = ?target.kind(), "built native query");
    QuerySpec::Native(native)
}
