use std::cell::RefCell;
use std::future::Future;

use reqwest::header::ACCEPT;
use serde_json::Value;

use crate::config::ApiConfig;
use crate::error::HttpError;

/// Query-string pairs for a GET.
pub type Query = [(&'static str, String)];

/// JSON-over-HTTP access to the lab API. Paths are relative to the API base.
///
/// Futures are not `Send`; the engine runs on a single-threaded runtime.
pub trait HttpClient {
    fn get(&self, path: &str, query: &Query) -> impl Future<Output = Result<Value, HttpError>>;
    fn post(&self, path: &str, body: &Value) -> impl Future<Output = Result<Value, HttpError>>;
    fn put(&self, path: &str, body: &Value) -> impl Future<Output = Result<Value, HttpError>>;
    fn delete(&self, path: &str) -> impl Future<Output = Result<Value, HttpError>>;
}

/// [`HttpClient`] over `reqwest` with bearer-token auth.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    /// Uses RefCell because the token changes on login/logout while the
    /// client is shared through `Rc`.
    token: RefCell<Option<String>>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("labgate/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: RefCell::new(config.token.clone()),
        })
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.borrow_mut() = Some(token.into());
    }

    pub fn clear_token(&self) {
        *self.token.borrow_mut() = None;
    }

    pub fn has_token(&self) -> bool {
        self.token.borrow().is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, HttpError> {
        let mut request = request.header(ACCEPT, "application/json");
        let token = self.token.borrow().clone();
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("message")?.as_str().map(str::to_string));
            tracing::debug!(status = status.as_u16(), ?message, "API request failed");
            return Err(HttpError::Status {
                status: status.as_u16(),
                message,
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| HttpError::Decode(e.to_string()))
    }
}

impl HttpClient for ApiClient {
    async fn get(&self, path: &str, query: &Query) -> Result<Value, HttpError> {
        self.send(self.client.get(self.url(path)).query(query)).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, HttpError> {
        self.send(self.client.post(self.url(path)).json(body)).await
    }

    async fn put(&self, path: &str, body: &Value) -> Result<Value, HttpError> {
        self.send(self.client.put(self.url(path)).json(body)).await
    }

    async fn delete(&self, path: &str) -> Result<Value, HttpError> {
        self.send(self.client.delete(self.url(path))).await
    }
}
