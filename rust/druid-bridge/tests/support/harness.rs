use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use druid_bridge::{
    config::AppConfig,
    datasource::DruidDatasource,
    error::{Result, ServiceError},
    server::Server,
    time::DateMath,
    transport::Transport,
};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex, Once},
};
use tower::ServiceExt;

pub const API_KEY: &str = "test-api-key";
pub const FIXED_NOW: &str = "2024-01-01T12:00:00Z";

static TRACING_INIT: Once = Once::new();

/// In-memory Druid broker: canned replies per path, every request recorded.
#[derive(Default)]
pub struct FakeDruid {
    replies: Mutex<HashMap<String, VecDeque<Result<Value>>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub body: Option<Value>,
}

impl FakeDruid {
    pub fn reply(&self, path: &str, value: Value) -> &Self {
        self.push(path, Ok(value))
    }

    pub fn fail(&self, path: &str, status: u16, body: &str) -> &Self {
        self.push(
            path,
            Err(ServiceError::Upstream {
                status,
                body: body.to_string(),
            }),
        )
    }

    fn push(&self, path: &str, reply: Result<Value>) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn answer(&self, path: &str, body: Option<&Value>) -> Result<Value> {
        self.requests.lock().unwrap().push(RecordedRequest {
            path: path.to_string(),
            body: body.cloned(),
        });
        self.replies
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(ServiceError::Upstream {
                    status: 404,
                    body: format!("no fixture for {path}"),
                })
            })
    }
}

#[async_trait]
impl Transport for FakeDruid {
    async fn get(&self, path: &str) -> Result<Value> {
        self.answer(path, None)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.answer(path, Some(body))
    }
}

#[derive(Clone)]
pub struct BridgeTestHarness {
    router: Router,
    pub druid: Arc<FakeDruid>,
}

/// Runs a test closure against a router wired to a fresh `FakeDruid`.
pub async fn with_bridge_harness<F, Fut>(configure: impl FnOnce(&mut AppConfig), test: F)
where
    F: FnOnce(BridgeTestHarness) -> Fut,
    Fut: Future<Output = ()>,
{
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt::try_init();
    });

    let mut config = AppConfig::embedded("http://druid.test:8082".to_string());
    config.api_key = Some(API_KEY.to_string());
    configure(&mut config);

    let druid = Arc::new(FakeDruid::default());
    let now: DateTime<Utc> = FIXED_NOW.parse().expect("fixed clock should parse");
    let datasource = DruidDatasource::new(&config, druid.clone())
        .with_time_math(Arc::new(DateMath::at(now)));
    let router = Server::with_datasource(config, datasource).router();

    test(BridgeTestHarness { router, druid }).await;
}

impl BridgeTestHarness {
    pub async fn get(&self, path: &str) -> http::Response<Body> {
        self.send(Request::builder().method("GET").uri(path), Body::empty(), true)
            .await
    }

    pub async fn post<T: Serialize>(&self, path: &str, payload: &T) -> http::Response<Body> {
        self.post_with_key(path, payload, true).await
    }

    pub async fn post_with_key<T: Serialize>(
        &self,
        path: &str,
        payload: &T,
        include_api_key: bool,
    ) -> http::Response<Body> {
        let body = serde_json::to_vec(payload).expect("request payload should serialize");
        let builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(http::header::CONTENT_TYPE, "application/json");
        self.send(builder, Body::from(body), include_api_key).await
    }

    async fn send(
        &self,
        mut builder: http::request::Builder,
        body: Body,
        include_api_key: bool,
    ) -> http::Response<Body> {
        if include_api_key {
            builder = builder.header("x-api-key", API_KEY);
        }
        let request = builder
            .body(body)
            .expect("failed to build harness request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router should handle harness request")
    }
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Value) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should deserialize");
    let value =
        serde_json::from_slice::<Value>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
