use crate::{filter::FilterDescriptor, template::TemplateVariables};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// One `[value, timestamp_ms]` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint(pub Value, pub i64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub target: String,
    pub datapoints: Vec<SeriesPoint>,
}

impl Series {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            datapoints: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub data: Vec<Series>,
}

/// Dashboard time value: an expression such as `now-6h` or an epoch-millis number.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TimeValue {
    Millis(i64),
    Text(String),
}

impl TimeValue {
    pub fn as_expression(&self) -> String {
        match self {
            TimeValue::Millis(ms) => ms.to_string(),
            TimeValue::Text(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRange {
    pub from: TimeValue,
    pub to: TimeValue,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelQuery {
    pub range: RawRange,
    #[serde(default)]
    pub max_data_points: Option<u64>,
    #[serde(default)]
    pub targets: Vec<PanelTarget>,
    #[serde(default)]
    pub variables: TemplateVariables,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryKind {
    #[default]
    Timeseries,
    TopN,
    GroupBy,
    Select,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CurrentFilter {
    pub dimension: String,
}

/// A single panel target as the query editor stores it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PanelTarget {
    pub ref_id: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub hide: bool,
    #[serde(rename = "druidDS")]
    pub datasource: Option<String>,
    pub query_type: Option<QueryKind>,
    #[serde(deserialize_with = "null_as_default")]
    pub filters: Vec<FilterDescriptor>,
    #[serde(deserialize_with = "null_as_default")]
    pub aggregators: Vec<Value>,
    #[serde(deserialize_with = "null_as_default")]
    pub post_aggregators: Vec<Value>,
    #[serde(deserialize_with = "null_as_default")]
    pub group_by: Vec<String>,
    pub order_by: Option<Vec<String>>,
    pub limit: Option<u64>,
    pub druid_metric: Option<String>,
    pub dimension: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub select_dimensions: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub select_metrics: Vec<String>,
    pub select_threshold: Option<u64>,
    pub max_data_points: Option<u64>,
    #[serde(deserialize_with = "null_as_default")]
    pub should_override_granularity: bool,
    pub custom_granularity: Option<String>,
    #[serde(alias = "currentLucaSQL", alias = "currentSql")]
    pub sql: Option<String>,
    pub current_raw_query: Option<String>,
    pub raw_query: Option<String>,
    #[serde(alias = "currentRawFilter")]
    pub raw_filter: Option<String>,
    #[serde(alias = "currentRawAggregator")]
    pub raw_aggregator: Option<String>,
    #[serde(alias = "currentRawPostAggregator")]
    pub raw_post_aggregator: Option<String>,
    pub current_filter: Option<CurrentFilter>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn present(text: &Option<String>) -> Option<&str> {
    text.as_deref().filter(|s| !s.trim().is_empty())
}

impl PanelTarget {
    pub fn kind(&self) -> QueryKind {
        self.query_type.unwrap_or_default()
    }

    pub fn datasource(&self) -> Option<&str> {
        present(&self.datasource)
    }

    pub fn sql_text(&self) -> Option<&str> {
        present(&self.sql)
    }

    /// The editor's live raw query wins over the saved one.
    pub fn raw_query_text(&self) -> Option<&str> {
        present(&self.current_raw_query).or_else(|| present(&self.raw_query))
    }

    pub fn raw_filter_text(&self) -> Option<&str> {
        present(&self.raw_filter)
    }

    pub fn raw_aggregator_text(&self) -> Option<&str> {
        present(&self.raw_aggregator)
    }

    pub fn raw_post_aggregator_text(&self) -> Option<&str> {
        present(&self.raw_post_aggregator)
    }

    pub fn granularity_override(&self) -> Option<&str> {
        if self.should_override_granularity {
            present(&self.custom_granularity)
        } else {
            None
        }
    }

    /// Targets with nothing to ask Druid for resolve to no series without a request.
    pub fn should_skip(&self) -> bool {
        if self.hide || self.datasource().is_none() {
            return true;
        }
        let has_source = self.sql_text().is_some()
            || present(&self.current_raw_query).is_some()
            || self.raw_aggregator_text().is_some()
            || !self.aggregators.is_empty();
        !has_source && self.kind() != QueryKind::Select
    }
}
