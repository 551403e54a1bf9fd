use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::trace;

use crate::config::AuthConfig;
use crate::errors::{AuthError, Result};

const SNIPPET_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// Request payload
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    /// `application/x-www-form-urlencoded`
    Form(Vec<(String, String)>),
    Json(serde_json::Value),
}

/// A single upstream request, independent of the HTTP client used to send it
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub bearer: Option<String>,
    pub body: Body,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            bearer: None,
            body: Body::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::Put, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::Delete, url)
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn form<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.body = Body::Form(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn json<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.body = Body::Json(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Value of a form field, if this is a form request
    pub fn form_value(&self, key: &str) -> Option<&str> {
        match &self.body {
            Body::Form(pairs) => pairs
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

/// Status and body text of an upstream response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// First characters of the body, for error messages
    pub fn snippet(&self) -> String {
        self.body.chars().take(SNIPPET_LEN).collect()
    }

    /// Turn a non-2xx response into [`AuthError::Http`]
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(AuthError::Http {
                status: self.status,
                body_snippet: self.snippet(),
            })
        }
    }
}

/// Sends requests for the login chain and the inventory client.
///
/// A response with any status is `Ok`; only failures to get a response at
/// all are errors.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// [`Transport`] over a shared `reqwest` client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(config.http_timeouts.connect)
            .timeout(config.http_timeouts.request)
            .user_agent(config.user_agent.as_deref().unwrap_or("authchain-mc"))
            .build()?;

        Ok(Self { http })
    }

    pub fn from_client(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait::async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let HttpRequest {
            method,
            url,
            bearer,
            body,
        } = request;

        let mut builder = match method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
            Method::Put => self.http.put(&url),
            Method::Delete => self.http.delete(&url),
        }
        .header("Accept", "application/json");

        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        builder = match body {
            Body::Empty => builder,
            Body::Form(pairs) => builder.form(&pairs),
            Body::Json(value) => builder.json(&value),
        };

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        trace!(%url, %status, "upstream response");

        Ok(HttpResponse { status, body })
    }
}
