//! Per-panel orchestration: plan, build, send and reshape every target.

use crate::{
    config::AppConfig,
    error::{Result, ServiceError},
    models::{PanelQuery, PanelTarget, QueryResult, RawRange, Series},
    planner::{effective_max_points, plan_window, query_intervals},
    query::{build_query, QueryOverrides, QuerySpec},
    reshape,
    template::{TemplateVariables, VariableSubstitution},
    time::{DateMath, TimeRange, TimeRangeMath},
    transport::Transport,
};
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

const DATASOURCES_PATH: &str = "/druid/v2/datasources";
const PLACEHOLDER_BASE: &str = "http://druid.invalid";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub status: &'static str,
    pub message: &'static str,
    pub title: &'static str,
}

/// Body of a filter-value lookup from the filter editor.
#[derive(Debug, Clone, Deserialize)]
pub struct FilterValuesRequest {
    pub target: PanelTarget,
    pub range: RawRange,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub variables: TemplateVariables,
}

#[derive(Clone)]
pub struct DruidDatasource {
    transport: Arc<dyn Transport>,
    math: Arc<dyn TimeRangeMath>,
    overrides: QueryOverrides,
    period_time_zone: Option<String>,
}

impl DruidDatasource {
    pub fn new(config: &AppConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            math: Arc::new(DateMath::new()),
            overrides: QueryOverrides {
                post_aggregations: config.post_aggregations_override.clone(),
            },
            period_time_zone: config.period_granularity.clone(),
        }
    }

    /// Swaps the clock/date parser, mainly so tests can pin `now`.
    pub fn with_time_math(mut self, math: Arc<dyn TimeRangeMath>) -> Self {
        self.math = math;
        self
    }

    pub async fn test_connection(&self) -> Result<ConnectionStatus> {
        self.transport.get(DATASOURCES_PATH).await?;
        info!("druid connection test succeeded");
        Ok(ConnectionStatus {
            status: "success",
            message: "Druid Data source is working",
            title: "Success",
        })
    }

    pub async fn list_data_sources(&self) -> Result<Vec<String>> {
        let response = self.transport.get(DATASOURCES_PATH).await?;
        serde_json::from_value(response).map_err(|err| {
            ServiceError::UnexpectedResponse(format!("datasource list: {err}"))
        })
    }

    pub async fn list_dimensions_and_metrics(&self, name: &str) -> Result<Value> {
        let name = name.trim();
        if name.is_empty() || name.contains('/') {
            return Err(ServiceError::InvalidRequest(format!(
                "invalid datasource name '{name}'"
            )));
        }
        self.transport.get(&datasource_path(name)?).await
    }

    /// Runs every target concurrently and concatenates their series in target
    /// order. One failing target fails the panel.
    pub async fn query(&self, panel: &PanelQuery) -> Result<QueryResult> {
        let range = self.resolve_range(&panel.range)?;
        let now = self.math.parse("now", false)?;

        let pending = panel.targets.iter().map(|target| {
            self.query_target(target, &range, panel.max_data_points, &panel.variables, now)
        });
        let results = try_join_all(pending).await?;

        Ok(QueryResult {
            data: results.into_iter().flatten().collect(),
        })
    }

    pub async fn lookup_filter_values(&self, request: &FilterValuesRequest) -> Result<Value> {
        let target = &request.target;
        let datasource = target.datasource().ok_or_else(|| {
            ServiceError::InvalidRequest("filter lookup needs a datasource".into())
        })?;
        let dimension = target
            .current_filter
            .as_ref()
            .map(|f| f.dimension.trim())
            .filter(|d| !d.is_empty())
            .ok_or_else(|| ServiceError::InvalidRequest("filter lookup needs a dimension".into()))?;

        let range = self.resolve_range(&request.range)?;
        let spec = QuerySpec::filter_values(
            datasource,
            dimension,
            &target.filters,
            &request.query,
            query_intervals(range.from, range.to),
            &request.variables,
        );
        self.send(&spec).await
    }

    fn resolve_range(&self, range: &RawRange) -> Result<TimeRange> {
        TimeRange::resolve(
            self.math.as_ref(),
            &range.from.as_expression(),
            &range.to.as_expression(),
        )
    }

    async fn send(&self, spec: &QuerySpec) -> Result<Value> {
        let body = spec.render(&self.overrides)?;
        debug!(query_type = spec.query_type(), endpoint = spec.endpoint(), "sending druid query");
        self.transport.post(spec.endpoint(), &body).await
    }

    async fn query_target(
        &self,
        target: &PanelTarget,
        range: &TimeRange,
        panel_max_points: Option<u64>,
        vars: &dyn VariableSubstitution,
        now: DateTime<Utc>,
    ) -> Result<Vec<Series>> {
        if target.should_skip() {
            debug!(ref_id = ?target.ref_id, "skipping target with nothing to query");
            return Ok(Vec::new());
        }

        let max_points = effective_max_points(panel_max_points, target.max_data_points);
        let plan = plan_window(
            range,
            max_points,
            target.granularity_override(),
            self.period_time_zone.as_deref(),
        );
        let spec = build_query(target, &plan, vars);
        let response = self.send(&spec).await?;

        let mut series = reshape::convert(&spec, &response, now)?;
        if spec.clamps_first_point() {
            reshape::clamp_series_start(&mut series, plan.start);
        }
        Ok(series)
    }
}

/// Schema path for one datasource, with the name percent-encoded as a single segment.
fn datasource_path(name: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(PLACEHOLDER_BASE)
        .map_err(|err| ServiceError::Internal(err.into()))?;
    url.set_path(DATASOURCES_PATH);
    url.path_segments_mut()
        .map_err(|_| ServiceError::Internal(anyhow::anyhow!("broker base cannot carry a path")))?
        .push(name);
    Ok(url.path().to_string())
}
