#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{self, Request, StatusCode},
    Router,
};
use serde_json::Value as Json;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tower::ServiceExt;
use tsbridge::{
    config::AppConfig,
    datasource::ConnectionSettings,
    engine::{Connector, EngineError, Session},
    models::RowSet,
    query::BoundArguments,
    server::Server,
};

pub const API_KEY: &str = "test-key";

/// Canned replies keyed by query text.
#[derive(Default)]
pub struct ScriptedSession {
    replies: HashMap<String, Result<RowSet, String>>,
    pub closes: AtomicUsize,
}

impl ScriptedSession {
    pub fn reply(mut self, text: &str, rows: RowSet) -> Self {
        self.replies.insert(text.to_string(), Ok(rows));
        self
    }

    pub fn fail(mut self, text: &str, message: &str) -> Self {
        self.replies.insert(text.to_string(), Err(message.to_string()));
        self
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn query(&self, text: &str, _args: &BoundArguments) -> Result<RowSet, EngineError> {
        match self.replies.get(text) {
            Some(Ok(rows)) => Ok(rows.clone()),
            Some(Err(message)) => Err(EngineError::new(message.clone())),
            None => Err(EngineError::new(format!("relation for '{text}' does not exist"))),
        }
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct ScriptedConnector {
    session: Option<Arc<ScriptedSession>>,
    refusal: String,
    pub connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn serving(session: ScriptedSession) -> Self {
        Self {
            session: Some(Arc::new(session)),
            refusal: String::new(),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn refusing(message: &str) -> Self {
        Self {
            session: None,
            refusal: message.to_string(),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn session(&self) -> Option<&Arc<ScriptedSession>> {
        self.session.as_ref()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _settings: &ConnectionSettings) -> Result<Arc<dyn Session>, EngineError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        match &self.session {
            Some(session) => Ok(session.clone()),
            None => Err(EngineError::new(self.refusal.clone())),
        }
    }
}

pub fn test_config(api_key: Option<&str>) -> AppConfig {
    AppConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        api_key: api_key.map(str::to_string),
        request_timeout: Duration::from_secs(5),
        max_concurrent_queries: 4,
        strict_duplicates: false,
        session_pool_size: 1,
        connect_timeout: Duration::from_secs(2),
    }
}

pub fn router(connector: Arc<ScriptedConnector>) -> Router {
    Server::with_connector(test_config(Some(API_KEY)), connector).router()
}

pub fn datasource(updated: i64) -> Json {
    serde_json::json!({
        "uid": "pg-metrics",
        "updated": updated,
        "jsonData": {"host": "db.internal", "port": 5432, "database": "metrics"},
        "decryptedSecureJsonData": {"password": "secret"},
    })
}

pub async fn post(router: &Router, path: &str, body: Json, api_key: Option<&str>) -> (StatusCode, Json) {
    let mut request = Request::builder()
        .method(http::Method::POST)
        .uri(path)
        .header(http::header::CONTENT_TYPE, "application/json");
    if let Some(key) = api_key {
        request = request.header("x-api-key", key);
    }
    let request = request
        .body(Body::from(body.to_string()))
        .expect("request should build");

    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router should handle request");
    read_json(response).await
}

pub async fn read_json(response: http::Response<Body>) -> (StatusCode, Json) {
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("response body should be readable");
    let value = serde_json::from_slice::<Json>(&bytes).expect("response body should be valid JSON");
    (status, value)
}
