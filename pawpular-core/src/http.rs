//! Outbound HTTP behind a trait so tracking clients and the notifier can be
//! exercised without a network.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// Request credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    Bearer(String),
    Basic { user: String, password: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub auth: Auth,
    pub body: Body,
}

impl HttpRequest {
    pub fn post_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            auth: Auth::None,
            body: Body::Json(body),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            auth: Auth::None,
            body: Body::Empty,
        }
    }

    pub fn put_bytes(url: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            method: Method::Put,
            url: url.into(),
            auth: Auth::None,
            body: Body::Bytes(bytes),
        }
    }

    pub fn delete_json(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::Delete,
            url: url.into(),
            auth: Auth::None,
            body: Body::Json(body),
        }
    }

    pub fn with_auth(mut self, auth: Auth) -> Self {
        self.auth = auth;
        self
    }

    /// JSON body, if any.
    pub fn json(&self) -> Option<&serde_json::Value> {
        match &self.body {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Fail on non-2xx, otherwise parse the body as JSON (empty body -> `null`).
    pub fn into_json(self, url: &str) -> Result<serde_json::Value, CoreError> {
        if !self.is_success() {
            return Err(CoreError::HttpStatus {
                url: url.to_string(),
                status: self.status,
                body: self.body,
            });
        }
        if self.body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Trait for sending HTTP requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CoreError>;
}

/// Real transport backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CoreError> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
            Method::Put => self.client.put(&request.url),
            Method::Delete => self.client.delete(&request.url),
        };
        builder = match &request.auth {
            Auth::None => builder,
            Auth::Bearer(token) => builder.bearer_auth(token),
            Auth::Basic { user, password } => builder.basic_auth(user, Some(password)),
        };
        builder = match request.body {
            Body::Empty => builder,
            Body::Json(value) => builder.json(&value),
            Body::Bytes(bytes) => builder.body(bytes),
        };

        let resp = builder.send().await.map_err(|e| {
            tracing::warn!(url = %request.url, error = %e, "HTTP request failed");
            CoreError::request(&request.url, e)
        })?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| CoreError::request(&request.url, format!("reading body: {e}")))?;
        Ok(HttpResponse { status, body })
    }
}

/// Transport that records every request and replays queued responses.
///
/// When the queue is empty it answers `200 {}`.
#[derive(Default)]
pub struct RecordingTransport {
    requests: Mutex<Vec<HttpRequest>>,
    responses: Mutex<VecDeque<Result<HttpResponse, String>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: HttpResponse) {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(Ok(response));
        }
    }

    pub fn push_json(&self, value: serde_json::Value) {
        self.push_response(HttpResponse::ok(value.to_string()));
    }

    /// Make the next request fail at the connection level.
    pub fn push_failure(&self, message: impl Into<String>) {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(Err(message.into()));
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Requests whose URL ends with `suffix`.
    pub fn requests_to(&self, suffix: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.ends_with(suffix))
            .collect()
    }
}

#[async_trait]
impl HttpTransport for RecordingTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, CoreError> {
        let url = request.url.clone();
        if let Ok(mut r) = self.requests.lock() {
            r.push(request);
        }
        let next = self.responses.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(Ok(resp)) => Ok(resp),
            Some(Err(message)) => Err(CoreError::request(url, message)),
            None => Ok(HttpResponse::ok("{}")),
        }
    }
}
