use crate::{
    config::{AppConfig, BasicAuth},
    error::{Result, ServiceError},
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::Value;
use tracing::debug;

/// JSON request/response channel to a Druid broker.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str) -> Result<Value>;
    async fn post(&self, path: &str, body: &Value) -> Result<Value>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    basic_auth: Option<BasicAuth>,
}

impl HttpTransport {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.druid_url.trim_end_matches('/').to_string(),
            basic_auth: config.basic_auth.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.basic_auth {
            Some(auth) => request.basic_auth(&auth.username, auth.password.as_ref()),
            None => request,
        }
    }

    async fn dispatch(&self, request: RequestBuilder) -> Result<Value> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str) -> Result<Value> {
        debug!(path, "druid get");
        self.dispatch(self.client.get(self.url(path))).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        debug!(path, body = %body, "druid post");
        self.dispatch(self.client.post(self.url(path)).json(body)).await
    }
}
