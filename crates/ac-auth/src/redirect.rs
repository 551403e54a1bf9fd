use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::chain::LoginChain;
use crate::errors::{AuthError, Result};

pub const SUCCESS_PAGE: &str = "You may now close this page.";
pub const FAILURE_PAGE: &str = "Cannot authenticate.";

/// How long an accepted connection may take to send its request line
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Receives the refresh token, or `None` if the redirect carried no usable code
pub type RedirectCallback = Box<dyn FnOnce(Option<String>) + Send + 'static>;

#[derive(Debug, Default)]
struct ListenerState {
    generation: u64,
    running: Option<Running>,
}

struct Running {
    generation: u64,
    local_addr: SocketAddr,
    /// Cleared once the single connection has been accepted
    accepting: bool,
    task: JoinHandle<()>,
    callback: Option<RedirectCallback>,
}

impl fmt::Debug for Running {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Running")
            .field("generation", &self.generation)
            .field("local_addr", &self.local_addr)
            .field("accepting", &self.accepting)
            .field("has_callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

/// Loopback server that serves exactly one OAuth redirect.
///
/// The first connection closes the port whatever it contains; a code in its
/// query string is exchanged for a refresh token handed to the callback.
/// The callback runs exactly once: with the token, with `None` when the
/// request is unusable or never arrives, or with `None` from [`stop`].
///
/// [`stop`]: RedirectListener::stop
#[derive(Debug, Clone)]
pub struct RedirectListener {
    chain: LoginChain,
    addr: SocketAddr,
    request_timeout: Duration,
    state: Arc<Mutex<ListenerState>>,
}

impl RedirectListener {
    pub fn new(chain: LoginChain, addr: SocketAddr) -> Self {
        Self {
            chain,
            addr,
            request_timeout: REQUEST_TIMEOUT,
            state: Arc::new(Mutex::new(ListenerState::default())),
        }
    }

    /// Listener on `127.0.0.1` at the chain's configured redirect port
    pub fn for_chain(chain: LoginChain) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], chain.config().redirect_port));
        Self::new(chain, addr)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn state(&self) -> MutexGuard<'_, ListenerState> {
        lock(&self.state)
    }

    /// Whether the port is open and waiting for the redirect
    pub fn is_running(&self) -> bool {
        self.state()
            .running
            .as_ref()
            .is_some_and(|running| running.accepting)
    }

    /// Start serving and return the bound address.
    ///
    /// If a redirect is already pending, `callback` replaces the previous
    /// one, which is dropped without being called; the socket is untouched.
    pub async fn start(&self, callback: RedirectCallback) -> Result<SocketAddr> {
        if let Some(running) = self.state().running.as_mut() {
            running.callback = Some(callback);
            debug!(addr = %running.local_addr, "Redirect listener already running, callback replaced");
            return Ok(running.local_addr);
        }

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|source| AuthError::ListenerBind {
                addr: self.addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let mut state = self.state();
        if let Some(running) = state.running.as_mut() {
            // lost a race with a concurrent start
            running.callback = Some(callback);
            return Ok(running.local_addr);
        }

        state.generation += 1;
        let generation = state.generation;
        let task = tokio::spawn(serve_once(
            listener,
            self.chain.clone(),
            Arc::clone(&self.state),
            generation,
            self.request_timeout,
        ));
        state.running = Some(Running {
            generation,
            local_addr,
            accepting: true,
            task,
            callback: Some(callback),
        });

        info!(addr = %local_addr, "Redirect listener started");
        Ok(local_addr)
    }

    /// Stop serving and resolve a pending callback with `None`; a no-op if idle
    pub fn stop(&self) {
        let running = self.state().running.take();
        if let Some(mut running) = running {
            running.task.abort();
            if let Some(callback) = running.callback.take() {
                callback(None);
            }
            debug!(addr = %running.local_addr, "Redirect listener stopped");
        }
    }

    /// Start the listener and wait on the returned receiver for the token
    pub async fn capture_refresh_token(
        &self,
    ) -> Result<(SocketAddr, oneshot::Receiver<Option<String>>)> {
        let (tx, rx) = oneshot::channel();
        let addr = self
            .start(Box::new(move |token| {
                let _ = tx.send(token);
            }))
            .await?;
        Ok((addr, rx))
    }
}

fn lock(state: &Mutex<ListenerState>) -> MutexGuard<'_, ListenerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn mark_accepted(state: &Mutex<ListenerState>, generation: u64) {
    if let Some(running) = lock(state)
        .running
        .as_mut()
        .filter(|running| running.generation == generation)
    {
        running.accepting = false;
    }
}

/// Clear this generation's state and hand back its callback, if still pending
fn finish(state: &Mutex<ListenerState>, generation: u64) -> Option<RedirectCallback> {
    let mut state = lock(state);
    if state
        .running
        .as_ref()
        .is_some_and(|running| running.generation == generation)
    {
        state.running.take().and_then(|running| running.callback)
    } else {
        None
    }
}

async fn serve_once(
    listener: TcpListener,
    chain: LoginChain,
    state: Arc<Mutex<ListenerState>>,
    generation: u64,
    request_timeout: Duration,
) {
    let accepted = listener.accept().await;
    drop(listener);
    mark_accepted(&state, generation);

    let mut stream = match accepted {
        Ok((stream, peer)) => {
            debug!(%peer, "Redirect connection accepted");
            stream
        }
        Err(e) => {
            warn!(error = %e, "Failed to accept redirect connection");
            if let Some(callback) = finish(&state, generation) {
                callback(None);
            }
            return;
        }
    };

    let request = tokio::time::timeout(request_timeout, read_request(&mut stream)).await;
    let (status, refresh_token) = match request {
        Ok(Some(Redirect::Code(code))) => match chain.exchange_code(&code).await {
            Ok(tokens) => ("200 OK", Some(tokens.refresh_token)),
            Err(e) => {
                warn!(error = %e, "Authorization code exchange failed");
                ("200 OK", None)
            }
        },
        Ok(Some(Redirect::NoCode)) => ("200 OK", None),
        Ok(Some(Redirect::NotGet)) => ("405 Method Not Allowed", None),
        Ok(None) => ("400 Bad Request", None),
        Err(_) => {
            warn!(timeout = ?request_timeout, "Redirect connection sent no request");
            ("408 Request Timeout", None)
        }
    };

    let page = if refresh_token.is_some() {
        SUCCESS_PAGE
    } else {
        FAILURE_PAGE
    };
    match finish(&state, generation) {
        Some(callback) => callback(refresh_token),
        None => debug!("Redirect callback already resolved"),
    }

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{page}",
        page.len()
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!(error = %e, "Failed to write redirect response");
    }
    let _ = stream.shutdown().await;
}

enum Redirect {
    Code(String),
    NoCode,
    NotGet,
}

async fn read_request(stream: &mut TcpStream) -> Option<Redirect> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await.ok()?;

    // drain headers so the client sees a clean response
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) if line.trim().is_empty() => break,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    if method != "GET" {
        return Some(Redirect::NotGet);
    }

    let url = Url::parse(&format!("http://localhost{target}")).ok()?;
    let code = url
        .query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.into_owned())
        .filter(|code| !code.is_empty());

    Some(code.map_or(Redirect::NoCode, Redirect::Code))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::testing::StubTransport;
    use crate::transport::Transport;
    use tokio::io::AsyncReadExt;

    fn listener(stub: &Arc<StubTransport>) -> RedirectListener {
        let config = AuthConfig::default().with_base_url(StubTransport::BASE);
        let chain = LoginChain::with_transport(config, Arc::clone(stub) as Arc<dyn Transport>);
        RedirectListener::new(chain, SocketAddr::from(([127, 0, 0, 1], 0)))
    }

    async fn request(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_code_is_exchanged_once() {
        let stub = Arc::new(StubTransport::new());
        stub.on(
            "/oauth20_token.srf",
            200,
            r#"{"access_token":"at","refresh_token":"rt-from-code"}"#,
        );
        let listener = listener(&stub);

        let (addr, rx) = listener.capture_refresh_token().await.unwrap();
        assert!(listener.is_running());

        let response = request(addr, "GET /?code=M.abc HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with(SUCCESS_PAGE));
        assert_eq!(rx.await.unwrap().as_deref(), Some("rt-from-code"));
        assert_eq!(
            stub.last_request("/oauth20_token.srf")
                .and_then(|req| req.form_value("code").map(str::to_string))
                .as_deref(),
            Some("M.abc")
        );

        // one-shot: the port is closed after the first request
        assert!(!listener.is_running());
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_request_without_code_still_stops() {
        let stub = Arc::new(StubTransport::new());
        let listener = listener(&stub);

        let (addr, rx) = listener.capture_refresh_token().await.unwrap();
        let response = request(addr, "GET /?error=access_denied HTTP/1.1\r\n\r\n").await;

        assert!(response.ends_with(FAILURE_PAGE));
        assert_eq!(rx.await.unwrap(), None);
        assert_eq!(stub.total_calls(), 0);
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_exchange_reports_none() {
        let stub = Arc::new(StubTransport::new());
        stub.on("/oauth20_token.srf", 400, r#"{"error":"invalid_grant"}"#);
        let listener = listener(&stub);

        let (addr, rx) = listener.capture_refresh_token().await.unwrap();
        let response = request(addr, "GET /?code=bad HTTP/1.1\r\n\r\n").await;

        assert!(response.ends_with(FAILURE_PAGE));
        assert_eq!(rx.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_non_get_is_rejected() {
        let stub = Arc::new(StubTransport::new());
        let listener = listener(&stub);

        let (addr, rx) = listener.capture_refresh_token().await.unwrap();
        let response = request(addr, "POST /?code=abc HTTP/1.1\r\nContent-Length: 0\r\n\r\n").await;

        assert!(response.starts_with("HTTP/1.1 405"));
        assert_eq!(rx.await.unwrap(), None);
        assert_eq!(stub.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_second_start_hands_token_to_latest_caller() {
        let stub = Arc::new(StubTransport::new());
        stub.on(
            "/oauth20_token.srf",
            200,
            r#"{"access_token":"at","refresh_token":"rt-latest"}"#,
        );
        let listener = listener(&stub);

        let (first, first_rx) = listener.capture_refresh_token().await.unwrap();
        let (second, second_rx) = listener.capture_refresh_token().await.unwrap();
        assert_eq!(first, second);
        // the replaced callback is dropped unused
        assert!(first_rx.await.is_err());

        request(second, "GET /?code=M.again HTTP/1.1\r\n\r\n").await;
        assert_eq!(second_rx.await.unwrap().as_deref(), Some("rt-latest"));
        assert_eq!(stub.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_safe_and_resolves_pending_callback() {
        let stub = Arc::new(StubTransport::new());
        let listener = listener(&stub);

        listener.stop();
        let (_, rx) = listener.capture_refresh_token().await.unwrap();
        assert!(listener.is_running());

        listener.stop();
        assert!(!listener.is_running());
        assert_eq!(rx.await.unwrap(), None);
        listener.stop();

        // a stopped listener can be started again
        listener.capture_refresh_token().await.unwrap();
        assert!(listener.is_running());
        listener.stop();
    }

    #[tokio::test]
    async fn test_idle_connection_times_out() {
        let stub = Arc::new(StubTransport::new());
        let listener = listener(&stub).with_request_timeout(Duration::from_millis(100));

        let (addr, rx) = listener.capture_refresh_token().await.unwrap();
        let mut idle = TcpStream::connect(addr).await.unwrap();

        let token = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("callback must fire after the request timeout")
            .unwrap();
        assert_eq!(token, None);
        assert!(!listener.is_running());

        let mut response = String::new();
        idle.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 408"));
        assert_eq!(stub.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_stop_aborts_idle_connection() {
        let stub = Arc::new(StubTransport::new());
        let listener = listener(&stub);

        let (addr, rx) = listener.capture_refresh_token().await.unwrap();
        let _idle = TcpStream::connect(addr).await.unwrap();
        for _ in 0..100 {
            if !listener.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!listener.is_running());

        listener.stop();
        let token = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .expect("stop must resolve the pending callback")
            .unwrap();
        assert_eq!(token, None);
    }
}
