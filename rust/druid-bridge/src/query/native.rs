//! Native Druid query bodies.

use crate::{filter::FilterTree, planner::QueryGranularity};
use serde::Serialize;
use serde_json::{Map, Value};

const DEFAULT_SELECT_THRESHOLD: u64 = 5;

/// Fields every native query carries.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCommon {
    pub data_source: String,
    pub granularity: QueryGranularity,
    pub intervals: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterTree>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Aggregation {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post_aggregations: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeseriesQuery {
    #[serde(flatten)]
    pub common: QueryCommon,
    #[serde(flatten)]
    pub aggregation: Aggregation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopNQuery {
    #[serde(flatten)]
    pub common: QueryCommon,
    #[serde(flatten)]
    pub aggregation: Aggregation,
    pub dimension: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderByColumn {
    pub dimension: String,
    pub direction: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LimitSpec {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<OrderByColumn>>,
}

impl LimitSpec {
    /// `default` limit spec ordering every listed column descending.
    pub fn new(limit: u64, order_by: Option<&[String]>) -> Self {
        Self {
            kind: "default",
            limit,
            columns: order_by.map(|columns| {
                columns
                    .iter()
                    .map(|dimension| OrderByColumn {
                        dimension: dimension.clone(),
                        direction: "DESCENDING",
                    })
                    .collect()
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupByQuery {
    #[serde(flatten)]
    pub common: QueryCommon,
    #[serde(flatten)]
    pub aggregation: Aggregation,
    pub dimensions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_spec: Option<LimitSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PagingSpec {
    pub paging_identifiers: Map<String, Value>,
    pub threshold: u64,
}

impl PagingSpec {
    pub fn first_page(threshold: Option<u64>) -> Self {
        Self {
            paging_identifiers: Map::new(),
            threshold: threshold
                .filter(|t| *t > 0)
                .unwrap_or(DEFAULT_SELECT_THRESHOLD),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectQuery {
    #[serde(flatten)]
    pub common: QueryCommon,
    pub dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub paging_spec: PagingSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "queryType")]
pub enum NativeQuery {
    #[serde(rename = "timeseries")]
    Timeseries(TimeseriesQuery),
    #[serde(rename = "topN")]
    TopN(TopNQuery),
    #[serde(rename = "groupBy")]
    GroupBy(GroupByQuery),
    #[serde(rename = "select")]
    Select(SelectQuery),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Granularity;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn common(filter: Option<FilterTree>) -> QueryCommon {
        QueryCommon {
            data_source: "wikipedia".into(),
            granularity: QueryGranularity::Simple(Granularity::Hour),
            intervals: vec!["2024-01-01T00:00:00.000Z/2024-01-02T00:00:00.000Z".into()],
            filter,
        }
    }

    #[test]
    fn timeseries_without_filter_omits_the_key() {
        let query = NativeQuery::Timeseries(TimeseriesQuery {
            common: common(None),
            aggregation: Aggregation {
                aggregations: vec![json!({"type": "count", "name": "rows"})],
                post_aggregations: vec![],
            },
        });
        assert_eq!(
            serde_json::to_value(&query).unwrap(),
            json!({
                "queryType": "timeseries",
                "dataSource": "wikipedia",
                "granularity": "hour",
                "intervals": ["2024-01-01T00:00:00.000Z/2024-01-02T00:00:00.000Z"],
                "aggregations": [{"type": "count", "name": "rows"}]
            })
        );
    }

    #[test]
    fn group_by_carries_limit_spec() {
        let query = NativeQuery::GroupBy(GroupByQuery {
            common: common(Some(FilterTree::Leaf(
                json!({"type": "selector", "dimension": "page", "value": "Main"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            ))),
            aggregation: Aggregation {
                aggregations: vec![json!({"type": "longSum", "name": "edits", "fieldName": "count"})],
                post_aggregations: vec![],
            },
            dimensions: vec!["country".into()],
            limit_spec: Some(LimitSpec::new(10, Some(&["edits".to_string()]))),
        });
        let body = serde_json::to_value(&query).unwrap();
        assert_eq!(body["queryType"], json!("groupBy"));
        assert_eq!(body["filter"]["value"], json!("Main"));
        assert_eq!(
            body["limitSpec"],
            json!({
                "type": "default",
                "limit": 10,
                "columns": [{"dimension": "edits", "direction": "DESCENDING"}]
            })
        );
    }

    #[test]
    fn select_defaults_threshold() {
        let query = NativeQuery::Select(SelectQuery {
            common: common(None),
            dimensions: vec![],
            metrics: vec!["added".into()],
            paging_spec: PagingSpec::first_page(None),
        });
        let body = serde_json::to_value(&query).unwrap();
        assert_eq!(
            body["pagingSpec"],
            json!({"pagingIdentifiers": {}, "threshold": 5})
        );
        assert!(body.get("aggregations").is_none());
    }
}
