//! Proxy server implementation
//! Plaintext and TLS listeners feeding a single dispatcher that matches
//! host and path, rewrites forwarding headers and streams to the backend

use crate::body::{empty_body, full_body, idle_timeout, IdleTimeoutBody, ProxyBody};
use crate::certificate::{server_config, FallbackPolicy, SniResolver, TlsStatus};
use crate::config::ProxyRule;
use crate::error::{BoxError, StartupError};
use crate::routing::{Endpoint, MatchResult};
use crate::state::{ProxyState, Snapshot};
use crate::transport::{restore_upgrade, strip_hop_by_hop, upgrade_protocol, Transport};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, HOST, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Optional header behaviour on forwarded requests
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions {
    /// Send the backend authority as Host instead of the inbound Host
    pub rewrite_host: bool,
    /// Also set X-Forwarded-For and X-Forwarded-Proto
    pub forwarded_for: bool,
}

/// Proxy server configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: IpAddr,
    pub http_port: u16,
    pub https_port: u16,
    pub fallback: FallbackPolicy,
    pub isolate_tls_failure: bool,
    pub forward: ForwardOptions,
    pub header_read_timeout: Duration,
    pub connect_timeout: Duration,
    pub upstream_timeout: Duration,
    pub body_idle_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 80,
            https_port: 443,
            fallback: FallbackPolicy::FirstLoaded,
            isolate_tls_failure: false,
            forward: ForwardOptions::default(),
            header_read_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            upstream_timeout: Duration::from_secs(30),
            body_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Scheme the client used to reach the proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundScheme {
    Http,
    Https,
}

impl InboundScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundScheme::Http => "http",
            InboundScheme::Https => "https",
        }
    }
}

/// The connection a request arrived on
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    pub scheme: InboundScheme,
}

/// Host the client asked for: the Host header, else the URI authority
pub fn inbound_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.to_string())
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .filter(|h| !h.is_empty())
}

/// Point a request at `endpoint` and set forwarding headers.
/// The inbound host is read before anything is changed.
pub fn rewrite_request<B>(
    req: Request<B>,
    endpoint: &Endpoint,
    client: &ClientInfo,
    options: ForwardOptions,
) -> Result<Request<B>, hyper::http::Error> {
    let original_host = inbound_host(&req);

    let (mut parts, body) = req.into_parts();
    parts.uri = endpoint.target_uri(parts.uri.path(), parts.uri.query())?;
    parts.version = Version::HTTP_11;
    let upgrade = upgrade_protocol(&parts.headers);
    strip_hop_by_hop(&mut parts.headers);
    if let Some(protocol) = upgrade {
        restore_upgrade(&mut parts.headers, protocol);
    }

    let outbound_host = if options.rewrite_host {
        Some(endpoint.authority().to_string())
    } else {
        original_host.clone()
    };
    if let Some(host) = outbound_host {
        parts.headers.insert(HOST, HeaderValue::from_str(&host)?);
    }

    if let Some(host) = &original_host {
        parts.headers.insert(X_FORWARDED_HOST, HeaderValue::from_str(host)?);
    }

    if options.forwarded_for {
        let client_ip = client.addr.ip().to_string();
        let forwarded_for = match parts.headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(prior) => format!("{}, {}", prior, client_ip),
            None => client_ip,
        };
        parts.headers.insert(X_FORWARDED_FOR, HeaderValue::from_str(&forwarded_for)?);
        parts
            .headers
            .insert(X_FORWARDED_PROTO, HeaderValue::from_static(client.scheme.as_str()));
    }

    Ok(Request::from_parts(parts, body))
}

/// Plain-text response for requests the proxy answers itself
pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(message.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Resolves requests against the current routing table and forwards them
pub struct Dispatcher {
    state: Arc<Snapshot<ProxyState>>,
    transport: Transport,
    options: ForwardOptions,
    body_idle_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        state: Arc<Snapshot<ProxyState>>,
        transport: Transport,
        options: ForwardOptions,
        body_idle_timeout: Duration,
    ) -> Self {
        Self {
            state,
            transport,
            options,
            body_idle_timeout,
        }
    }

    /// Match, rewrite and forward one request. Never fails: routing misses
    /// and backend errors become 4xx/5xx responses.
    pub async fn dispatch<B>(&self, mut req: Request<B>, client: ClientInfo) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        debug!("{} {} from {}", method, path, client.addr);

        let host = match inbound_host(&req) {
            Some(h) => h,
            None => {
                warn!("Request without host from {}: {} {}", client.addr, method, path);
                return error_response(StatusCode::BAD_REQUEST, "Missing Host header");
            }
        };

        let (endpoint, server_name, location) = {
            let state = self.state.load();
            match state.table.resolve(&host, &path) {
                MatchResult::Forward {
                    endpoint,
                    server_name,
                    location,
                } => (endpoint.clone(), server_name.to_string(), location.to_string()),
                MatchResult::Unmatched => {
                    warn!("Request not served, no route for host: {} path: {}", host, path);
                    return error_response(StatusCode::NOT_FOUND, "No route for host");
                }
            }
        };

        let client_upgrade = upgrade_protocol(req.headers()).map(|_| hyper::upgrade::on(&mut req));

        let outbound = match rewrite_request(req, &endpoint, &client, self.options) {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to rewrite request for {}: {}", endpoint, e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        };

        info!(
            "Forwarding {} {}{} to {} (server {}, location {})",
            method,
            host,
            path,
            outbound.uri(),
            server_name,
            location
        );

        let outbound = outbound.map(|body| IdleTimeoutBody::new(body, self.body_idle_timeout));

        match self.transport.send(outbound).await {
            Ok(response) if response.status() == StatusCode::SWITCHING_PROTOCOLS => match client_upgrade {
                Some(client_upgrade) => tunnel(client_upgrade, response, &endpoint),
                None => {
                    error!("Backend {} switched protocols without an upgrade request", endpoint);
                    error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
                }
            },
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, idle_timeout(body, self.body_idle_timeout))
            }
            Err(e) if e.is_timeout() => {
                error!("Backend {} timed out: {}", endpoint, e);
                error_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
            }
            Err(e) => {
                error!("Backend {} failed: {}", endpoint, e);
                error_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }
}

/// Relay a backend's 101 to the client and splice the two upgraded
/// connections once both sides have switched
fn tunnel(client_upgrade: OnUpgrade, mut response: Response<Incoming>, endpoint: &Endpoint) -> Response<ProxyBody> {
    let backend_upgrade = hyper::upgrade::on(&mut response);
    let (mut parts, _) = response.into_parts();
    let protocol = parts.headers.get(UPGRADE).cloned();
    strip_hop_by_hop(&mut parts.headers);
    if let Some(protocol) = protocol {
        restore_upgrade(&mut parts.headers, protocol);
    }

    let endpoint = endpoint.to_string();
    tokio::spawn(async move {
        let (client, backend) = match tokio::try_join!(client_upgrade, backend_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                warn!("Upgrade to {} failed: {}", endpoint, e);
                return;
            }
        };

        let mut client = TokioIo::new(client);
        let mut backend = TokioIo::new(backend);
        match copy_bidirectional(&mut client, &mut backend).await {
            Ok((sent, received)) => debug!(
                "Upgraded connection to {} closed, {} bytes sent, {} bytes received",
                endpoint, sent, received
            ),
            Err(e) => debug!("Upgraded connection to {} ended: {}", endpoint, e),
        }
    });

    Response::from_parts(parts, empty_body())
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    state: Arc<Snapshot<ProxyState>>,
    dispatcher: Arc<Dispatcher>,
    tls_failure: Option<String>,
}

impl ProxyServer {
    /// Build routing and certificates from `rules`.
    /// Certificate failures are fatal unless `isolate_tls_failure` is set,
    /// in which case the server runs plaintext only.
    pub fn new(config: ProxyConfig, rules: &[ProxyRule]) -> Result<Self, StartupError> {
        let (state, tls_failure) = match ProxyState::build(rules, &config.fallback) {
            Ok(state) => (state, None),
            Err(StartupError::Certificate(e)) if config.isolate_tls_failure => {
                error!("TLS listener disabled, certificate error: {}", e);
                (ProxyState::plaintext(rules)?, Some(e.to_string()))
            }
            Err(e) => return Err(e),
        };

        let mut server = Self::from_state(config, state);
        server.tls_failure = tls_failure;
        Ok(server)
    }

    /// Server around an already built state
    pub fn from_state(config: ProxyConfig, state: ProxyState) -> Self {
        let state = Arc::new(Snapshot::new(state));
        let transport = Transport::new(config.connect_timeout, config.upstream_timeout);
        let dispatcher = Arc::new(Dispatcher::new(
            state.clone(),
            transport,
            config.forward,
            config.body_idle_timeout,
        ));

        Self {
            config,
            state,
            dispatcher,
            tls_failure: None,
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn tls_status(&self) -> TlsStatus {
        match &self.tls_failure {
            Some(reason) => TlsStatus::Failed(reason.clone()),
            None => self.state.load().tls_status(),
        }
    }

    /// Replace routing table and certificates in one step.
    /// The new state is fully built before it becomes visible; in-flight
    /// requests finish against the state they started with.
    pub fn reload(&self, rules: &[ProxyRule]) -> Result<(), StartupError> {
        let next = ProxyState::build(rules, &self.config.fallback)?;

        let serving_tls = self.state.load().certificates.is_some();
        match (serving_tls, next.certificates.is_some()) {
            (false, true) => return Err(StartupError::TlsToggle("enable")),
            (true, false) => return Err(StartupError::TlsToggle("disable")),
            _ => {}
        }

        self.state.store(next);
        info!("Reloaded {} rules", rules.len());
        Ok(())
    }

    /// Bind the listeners and serve until a listener fails
    pub async fn run(self: Arc<Self>) -> Result<(), StartupError> {
        let http_addr = SocketAddr::new(self.config.bind_addr, self.config.http_port);
        let http_listener = Self::bind(http_addr).await?;
        info!("HTTP server listening on {}", http_addr);

        let https_listener = match self.tls_status() {
            TlsStatus::Serving { certificates } => {
                let https_addr = SocketAddr::new(self.config.bind_addr, self.config.https_port);
                let listener = Self::bind(https_addr).await?;
                info!("HTTPS server listening on {} with {} certificate(s)", https_addr, certificates);
                Some(listener)
            }
            TlsStatus::Disabled => {
                info!("No TLS server configured, HTTPS listener disabled");
                None
            }
            TlsStatus::Failed(reason) => {
                warn!("HTTPS listener not started: {}", reason);
                None
            }
        };

        match https_listener {
            Some(listener) => {
                tokio::try_join!(
                    self.clone().run_http_server(http_listener),
                    self.clone().run_https_server(listener)
                )?;
                Ok(())
            }
            None => self.run_http_server(http_listener).await,
        }
    }

    async fn bind(addr: SocketAddr) -> Result<TcpListener, StartupError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| StartupError::Bind { addr, source })
    }

    /// Run HTTP server
    async fn run_http_server(self: Arc<Self>, listener: TcpListener) -> Result<(), StartupError> {
        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("HTTP accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, remote_addr, InboundScheme::Http).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Run HTTPS server; certificates are chosen per handshake from SNI
    async fn run_https_server(self: Arc<Self>, listener: TcpListener) -> Result<(), StartupError> {
        let acceptor = TlsAcceptor::from(server_config(SniResolver::new(self.state.clone())));

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("HTTPS accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let server = self.clone();
            let acceptor = acceptor.clone();

            tokio::spawn(async move {
                let tls_stream = match timeout(server.config.header_read_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => {
                        debug!("TLS handshake with {} failed: {}", remote_addr, e);
                        return;
                    }
                    Err(_) => {
                        debug!("TLS handshake with {} timed out", remote_addr);
                        return;
                    }
                };

                if let Err(e) = server.handle_connection(tls_stream, remote_addr, InboundScheme::Https).await {
                    debug!("HTTPS connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single client connection
    async fn handle_connection<S>(self: Arc<Self>, stream: S, remote_addr: SocketAddr, scheme: InboundScheme) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let io = TokioIo::new(stream);
        let dispatcher = self.dispatcher.clone();
        let client = ClientInfo {
            addr: remote_addr,
            scheme,
        };

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.header_read_timeout)
            .preserve_header_case(true)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let dispatcher = dispatcher.clone();
                    async move { Ok::<_, Infallible>(dispatcher.dispatch(req, client).await) }
                }),
            )
            .with_upgrades()
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }
}
