/*!
 * HTTP adapter.
 *
 * Devices exposing a small REST interface. Every call is a request on a
 * shared `reqwest` client, so the response of a command is its HTTP
 * response and no correlation table is needed.
 *
 * Device attributes:
 *
 * - `base_path`: prefix of the device API (default `/api`)
 * - `scheme`: `http` (default) or `https`
 */
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use iotflow_core::device::{
    CommandResponse, Device, DeviceCommand, DeviceState, Protocol, ResponseStatus,
};
use iotflow_core::types::Value;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, info};

use crate::adapter::{ConnectOptions, InboundKind, ProtocolAdapter, Subscription};
use crate::discovery::{DiscoveredDevice, DiscoverySource};
use crate::error::{DeviceError, Result};
use crate::framed::{setting_str, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
use crate::session::{ConnectGates, SessionHub};
use crate::topic;

/// Where a device's API lives and how to authenticate against it
#[derive(Debug)]
struct HttpSession {
    hub: SessionHub,
    base_url: String,
    auth_header: Option<(&'static str, String)>,
}

impl HttpSession {
    fn open(device: &Device, options: &ConnectOptions) -> Self {
        let scheme = setting_str(device, options, "scheme").unwrap_or_else(|| "http".to_string());
        let host = device.address.as_deref().unwrap_or("localhost");
        let authority = match device.port {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let base_path = setting_str(device, options, "base_path")
            .unwrap_or_else(|| "/api".to_string())
            .trim_end_matches('/')
            .to_string();
        let credentials = &device.credentials;
        let auth_header = match (&credentials.token, &credentials.api_key) {
            (Some(token), _) => Some(("Authorization", format!("Bearer {}", token))),
            (None, Some(key)) => Some(("X-API-Key", key.clone())),
            (None, None) => None,
        };
        Self {
            hub: SessionHub::new(&device.id, Protocol::Http, options.inbound.clone()),
            base_url: format!("{}://{}{}", scheme, authority, base_path),
            auth_header,
        }
    }

    fn request(&self, client: &Client, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = client
            .request(method, format!("{}{}", self.base_url, path))
            .header(reqwest::header::ACCEPT, "application/json");
        match &self.auth_header {
            Some((name, value)) => builder.header(*name, value),
            None => builder,
        }
    }

    fn transport_error(&self, operation: &str, timeout: Duration, e: reqwest::Error) -> DeviceError {
        if e.is_timeout() {
            DeviceError::timeout(self.hub.device_id(), operation, timeout)
        } else if e.is_connect() {
            DeviceError::connection(self.hub.device_id(), e.to_string())
        } else {
            DeviceError::transport(Protocol::Http, e.to_string())
        }
    }

    /// Send and read the whole body; the body is JSON when it parses
    async fn exchange(
        &self,
        request: RequestBuilder,
        operation: &str,
        timeout: Duration,
    ) -> Result<(StatusCode, Value)> {
        let response = request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(operation, timeout, e))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(operation, timeout, e))?;
        Ok((status, body_value(&body)))
    }
}

fn body_value(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

/// Error text for a non-2xx response
fn status_error(status: StatusCode, body: &Value) -> String {
    let detail = match body {
        Value::Null => String::new(),
        Value::String(text) => format!(": {}", text),
        other => format!(": {}", other),
    };
    format!(
        "HTTP {} {}{}",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default(),
        detail
    )
}

/// REST adapter
pub struct HttpAdapter {
    client: Client,
    sessions: DashMap<String, Arc<HttpSession>>,
    gates: ConnectGates,
    next_subscription: AtomicU64,
    source: Option<Arc<dyn DiscoverySource>>,
    request_timeout: Duration,
}

impl fmt::Debug for HttpAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAdapter")
            .field("sessions", &self.sessions.len())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl Default for HttpAdapter {
    fn default() -> Self {
        Self::new(Client::new())
    }
}

impl HttpAdapter {
    /// Create an adapter issuing requests through `client`
    pub fn new(client: Client) -> Self {
        Self {
            client,
            sessions: DashMap::new(),
            gates: ConnectGates::new(),
            next_subscription: AtomicU64::new(1),
            source: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Use `source` to answer [`ProtocolAdapter::discover`]
    pub fn with_discovery(mut self, source: Arc<dyn DiscoverySource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Deadline for state reads and health checks
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn session(&self, device_id: &str) -> Result<Arc<HttpSession>> {
        self.sessions
            .get(device_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| DeviceError::not_connected(device_id))
    }

    async fn open_session(&self, device: &Device, options: ConnectOptions) -> Result<bool> {
        if self.sessions.contains_key(&device.id) {
            debug!(device_id = %device.id, "already connected");
            return Ok(true);
        }
        let session = HttpSession::open(device, &options);
        // Any answer from the health endpoint, even an error status,
        // proves the API is reachable
        let deadline = options.timeout_or(DEFAULT_CONNECT_TIMEOUT);
        let health = session.request(&self.client, reqwest::Method::GET, "/health");
        let (status, _) = session.exchange(health, "connect", deadline).await?;
        debug!(device_id = %device.id, %status, "health endpoint answered");

        info!(device_id = %device.id, base_url = %session.base_url, "http session open");
        self.sessions.insert(device.id.clone(), Arc::new(session));
        Ok(true)
    }
}

#[async_trait]
impl ProtocolAdapter for HttpAdapter {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    async fn connect(&self, device: &Device, options: ConnectOptions) -> Result<bool> {
        self.gates
            .run(&device.id, self.open_session(device, options))
            .await
    }

    async fn disconnect(&self, device_id: &str) -> Result<bool> {
        let Some((_, session)) = self.sessions.remove(device_id) else {
            return Ok(false);
        };
        session.hub.close();
        self.gates.forget(device_id);
        info!(device_id, "http session closed");
        Ok(true)
    }

    async fn is_connected(&self, device_id: &str) -> bool {
        self.sessions.contains_key(device_id)
    }

    async fn send_command(
        &self,
        device_id: &str,
        command: DeviceCommand,
    ) -> Result<CommandResponse> {
        let session = self.session(device_id)?;
        debug!(
            device_id,
            command = %command.command,
            command_id = %command.command_id,
            "posting command"
        );
        let request = session
            .request(&self.client, reqwest::Method::POST, "/commands")
            .json(&command.envelope());
        let (status, body) = session
            .exchange(request, &command.command, command.timeout)
            .await?;
        if !status.is_success() {
            return Ok(CommandResponse::error(
                &command.command_id,
                status_error(status, &body),
            ));
        }
        Ok(match serde_json::from_value::<CommandResponse>(body.clone()) {
            Ok(reply) if reply.status == ResponseStatus::Error => CommandResponse::error(
                &command.command_id,
                reply.error.unwrap_or_else(|| "command failed".to_string()),
            ),
            Ok(reply) => CommandResponse::ok(&command.command_id, reply.result),
            Err(_) => CommandResponse::ok(&command.command_id, body),
        })
    }

    async fn read_state(&self, device_id: &str) -> Result<DeviceState> {
        let session = self.session(device_id)?;
        let request = session.request(&self.client, reqwest::Method::GET, "/state");
        let (status, body) = session
            .exchange(request, "read_state", self.request_timeout)
            .await?;
        if !status.is_success() {
            return Err(DeviceError::transport(
                Protocol::Http,
                status_error(status, &body),
            ));
        }
        if body.is_object() {
            session
                .hub
                .deliver(InboundKind::State, topic::state(device_id), body);
        }
        Ok(session.hub.snapshot())
    }

    async fn subscribe(&self, device_id: &str, filter: &str) -> Result<Subscription> {
        if !topic::is_valid_filter(filter) {
            return Err(DeviceError::transport(
                Protocol::Http,
                format!("invalid subscription filter '{}'", filter),
            ));
        }
        let session = self.session(device_id)?;
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        debug!(device_id, filter, subscription = id, "subscribed");
        Ok(session.hub.subscribe(id, filter))
    }

    async fn unsubscribe(&self, device_id: &str, subscription_id: u64) -> Result<bool> {
        let session = self.session(device_id)?;
        Ok(session.hub.unsubscribe(subscription_id).is_some())
    }

    async fn ping(&self, device_id: &str) -> Result<bool> {
        let session = self.session(device_id)?;
        let request = session.request(&self.client, reqwest::Method::GET, "/health");
        match session.exchange(request, "ping", self.request_timeout).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_timeout() => Ok(false),
            Err(DeviceError::Connection { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn discover(&self, timeout: Duration) -> Result<Vec<DiscoveredDevice>> {
        match &self.source {
            Some(source) => source.scan(Protocol::Http, timeout).await,
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotflow_core::device::DeviceType;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn oven(port: u16) -> Device {
        let mut device = Device::new("Oven", DeviceType::Appliance, Protocol::Http)
            .with_id("oven")
            .with_address("127.0.0.1", Some(port));
        device.credentials.api_key = Some("k-1".into());
        device
    }

    async fn setup() -> (MockServer, HttpAdapter) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        let adapter = HttpAdapter::default().with_request_timeout(Duration::from_millis(500));
        let device = oven(server.address().port());
        assert!(adapter.connect(&device, ConnectOptions::new()).await.unwrap());
        (server, adapter)
    }

    #[tokio::test]
    async fn test_command_request_shape() {
        let (server, adapter) = setup().await;
        Mock::given(method("POST"))
            .and(path("/api/commands"))
            .and(header("X-API-Key", "k-1"))
            .and(body_partial_json(json!({"command": "preheat"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"preheating": true})))
            .expect(1)
            .mount(&server)
            .await;

        let response = adapter
            .send_command("oven", DeviceCommand::new("oven", "preheat"))
            .await
            .unwrap();
        assert!(response.is_ok());
        assert_eq!(response.result, json!({"preheating": true}));
    }

    #[tokio::test]
    async fn test_error_status_becomes_failed_response() {
        let (server, adapter) = setup().await;
        Mock::given(method("POST"))
            .and(path("/api/commands"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!("boom")))
            .mount(&server)
            .await;

        let response = adapter
            .send_command("oven", DeviceCommand::new("oven", "preheat"))
            .await
            .unwrap();
        assert!(!response.is_ok());
        assert_eq!(
            response.error.as_deref(),
            Some("HTTP 500 Internal Server Error: boom")
        );
    }

    #[tokio::test]
    async fn test_command_envelope_reply() {
        let (server, adapter) = setup().await;
        Mock::given(method("POST"))
            .and(path("/api/commands"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "command_id": "x",
                "status": "error",
                "error": "door open",
            })))
            .mount(&server)
            .await;

        let response = adapter
            .send_command("oven", DeviceCommand::new("oven", "preheat"))
            .await
            .unwrap();
        assert_eq!(response.error.as_deref(), Some("door open"));
    }

    #[tokio::test]
    async fn test_state_from_get() {
        let (server, adapter) = setup().await;
        Mock::given(method("GET"))
            .and(path("/api/state"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"temperature": 180.0, "power": true})),
            )
            .mount(&server)
            .await;
        let mut states = adapter.subscribe("oven", "devices/oven/state").await.unwrap();

        let state = adapter.read_state("oven").await.unwrap();
        assert_eq!(state.temperature, Some(180.0));
        assert_eq!(state.power, Some(true));
        assert_eq!(states.recv().await.unwrap().kind, InboundKind::State);
    }

    #[tokio::test]
    async fn test_slow_command_times_out() {
        let (server, adapter) = setup().await;
        Mock::given(method("POST"))
            .and(path("/api/commands"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let command = DeviceCommand::new("oven", "preheat").with_timeout(Duration::from_millis(200));
        let err = adapter.send_command("oven", command).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_unreachable_device_fails_connect() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|listener| listener.local_addr())
            .map(|addr| addr.port())
            .unwrap();
        let adapter = HttpAdapter::default();
        assert!(adapter.connect(&oven(port), ConnectOptions::new()).await.is_err());
        assert!(!adapter.is_connected("oven").await);
        assert!(adapter.ping("oven").await.unwrap_err().is_not_connected());
    }

    #[tokio::test]
    async fn test_chunked_response_body() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let response = if request.starts_with(b"GET /api/state") {
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\
                         Transfer-Encoding: chunked\r\n\r\n\
                         c\r\n{\"power\":tru\r\n\
                         14\r\ne,\"temperature\":21.5\r\n\
                         1\r\n}\r\n\
                         0\r\n\r\n"
                    } else {
                        "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"
                    };
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });

        let adapter = HttpAdapter::default();
        adapter.connect(&oven(port), ConnectOptions::new()).await.unwrap();
        let state = adapter.read_state("oven").await.unwrap();
        assert_eq!(state.power, Some(true));
        assert_eq!(state.temperature, Some(21.5));
    }
}
