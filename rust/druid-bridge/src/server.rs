use crate::{
    config::AppConfig,
    datasource::{ConnectionStatus, DruidDatasource, FilterValuesRequest},
    error::{Result, ServiceError},
    models::{PanelQuery, QueryResult},
    state::AppState,
    transport::{HttpTransport, Transport},
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct Server {
    config: Arc<AppConfig>,
    state: AppState,
}

impl Server {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Builds the server around an existing Druid transport.
    pub fn with_transport(config: AppConfig, transport: Arc<dyn Transport>) -> Self {
        let datasource = DruidDatasource::new(&config, transport);
        Self::with_datasource(config, datasource)
    }

    pub fn with_datasource(config: AppConfig, datasource: DruidDatasource) -> Self {
        let config = Arc::new(config);
        let state = AppState::new(Arc::clone(&config), datasource);
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/test", get(Self::test_connection))
            .route("/api/datasources", get(Self::list_data_sources))
            .route("/api/datasources/:name", get(Self::describe_data_source))
            .route("/api/query", post(Self::query))
            .route("/api/filter-values", post(Self::filter_values))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, druid = %self.config.druid_url, "druid bridge listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn test_connection(
        State(state): State<AppState>,
        headers: HeaderMap,
    ) -> Result<Json<ConnectionStatus>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.datasource.test_connection().await?))
    }

    async fn list_data_sources(
        State(state): State<AppState>,
        headers: HeaderMap,
    ) -> Result<Json<Vec<String>>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.datasource.list_data_sources().await?))
    }

    async fn describe_data_source(
        State(state): State<AppState>,
        headers: HeaderMap,
        Path(name): Path<String>,
    ) -> Result<Json<Value>> {
        enforce_api_key(&headers, &state.config)?;
        let schema = state.datasource.list_dimensions_and_metrics(&name).await?;
        Ok(Json(schema))
    }

    async fn query(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<PanelQuery>,
    ) -> Result<Json<QueryResult>> {
        enforce_api_key(&headers, &state.config)?;
        let result = state.datasource.query(&request).await?;
        Ok(Json(result))
    }

    async fn filter_values(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<FilterValuesRequest>,
    ) -> Result<Json<Value>> {
        enforce_api_key(&headers, &state.config)?;
        let values = state.datasource.lookup_filter_values(&request).await?;
        Ok(Json(values))
    }
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}
