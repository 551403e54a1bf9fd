//! Scripted [`Transport`] for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use reqwest::StatusCode;
use url::Url;

use crate::errors::Result;
use crate::transport::{HttpRequest, HttpResponse, Transport};

/// Responds by URL path and counts requests per path.
///
/// Responses queued for a path are served in order; the last one keeps
/// being served. Unscripted paths answer `404`.
#[derive(Debug, Default)]
pub struct StubTransport {
    routes: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    calls: Mutex<HashMap<String, usize>>,
    requests: Mutex<Vec<HttpRequest>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn path_of(url: &str) -> String {
    Url::parse(url)
        .map(|url| url.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

impl StubTransport {
    /// Base URL to point [`Endpoints::with_base`](crate::Endpoints::with_base) at
    pub const BASE: &'static str = "http://stub.invalid";

    pub fn new() -> Self {
        Self::default()
    }

    /// Replace whatever is scripted for `path`
    pub fn on(&self, path: &str, status: u16, body: impl Into<String>) -> &Self {
        lock(&self.routes).insert(path.to_string(), VecDeque::from([response(status, body)]));
        self
    }

    /// Queue another response for `path`
    pub fn then(&self, path: &str, status: u16, body: impl Into<String>) -> &Self {
        lock(&self.routes)
            .entry(path.to_string())
            .or_default()
            .push_back(response(status, body));
        self
    }

    pub fn calls(&self, path: &str) -> usize {
        lock(&self.calls).get(path).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).values().sum()
    }

    /// Every request seen so far, oldest first
    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    pub fn last_request(&self, path: &str) -> Option<HttpRequest> {
        lock(&self.requests)
            .iter()
            .rev()
            .find(|req| path_of(&req.url) == path)
            .cloned()
    }
}

fn response(status: u16, body: impl Into<String>) -> HttpResponse {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::new(status, body)
}

#[async_trait::async_trait]
impl Transport for StubTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let path = path_of(&request.url);
        *lock(&self.calls).entry(path.clone()).or_default() += 1;
        lock(&self.requests).push(request);

        let mut routes = lock(&self.routes);
        let response = match routes.get_mut(&path) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(response.unwrap_or_else(|| HttpResponse::new(StatusCode::NOT_FOUND, "")))
    }
}
