use crate::{config::AppConfig, datasource::DruidDatasource};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub datasource: DruidDatasource,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, datasource: DruidDatasource) -> Self {
        Self { config, datasource }
    }
}
