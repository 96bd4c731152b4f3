//! Forwarding transport: one backend exchange per request
//! Connects to the authority of the request URI (TLS for `https`), sends the
//! request in origin-form and hands back the streaming response

use crate::error::{BoxError, ForwardError};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, UPGRADE};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Protocol named by `Upgrade` when `Connection` asks for an upgrade
pub fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let requested = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if requested {
        headers.get(UPGRADE).cloned()
    } else {
        None
    }
}

/// Put back the two headers an upgrade handshake needs after stripping
pub fn restore_upgrade(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, protocol);
}

/// Backend client
#[derive(Clone)]
pub struct Transport {
    connect_timeout: Duration,
    response_timeout: Duration,
    tls: TlsConnector,
}

impl Transport {
    /// Transport verifying `https` backends against the webpki root set
    pub fn new(connect_timeout: Duration, response_timeout: Duration) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(roots, connect_timeout, response_timeout)
    }

    pub fn with_roots(roots: RootCertStore, connect_timeout: Duration, response_timeout: Duration) -> Self {
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            connect_timeout,
            response_timeout,
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Send a request whose URI is absolute; returns once response headers arrive
    pub async fn send<B>(&self, req: Request<B>) -> Result<Response<Incoming>, ForwardError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let host = req.uri().host().ok_or(ForwardError::MissingHost)?.to_string();
        let is_https = req.uri().scheme_str() == Some("https");
        let port = req.uri().port_u16().unwrap_or(if is_https { 443 } else { 80 });
        let addr = format!("{}:{}", host, port);

        let (mut parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        parts.uri = Uri::builder().path_and_query(path_and_query).build()?;
        let req = Request::from_parts(parts, body);

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ForwardError::Connect { addr, source }),
            Err(_) => return Err(ForwardError::Timeout(self.connect_timeout)),
        };
        let _ = stream.set_nodelay(true);

        if !is_https {
            return self.exchange(TokioIo::new(stream), req).await;
        }

        let bare_host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let server_name = ServerName::try_from(bare_host.clone()).map_err(|_| ForwardError::ServerName(bare_host))?;

        let tls = match timeout(self.connect_timeout, self.tls.connect(server_name, stream)).await {
            Ok(Ok(tls)) => tls,
            Ok(Err(source)) => return Err(ForwardError::Tls { addr, source }),
            Err(_) => return Err(ForwardError::Timeout(self.connect_timeout)),
        };

        self.exchange(TokioIo::new(tls), req).await
    }

    async fn exchange<IO, B>(&self, io: IO, req: Request<B>) -> Result<Response<Incoming>, ForwardError>
    where
        IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

        // Ends when both the sender and the response body are dropped,
        // including when the client goes away mid-request. A 101 response
        // hands the socket over to `hyper::upgrade::on`.
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Backend connection error: {}", e);
            }
        });

        match timeout(self.response_timeout, sender.send_request(req)).await {
            Ok(response) => Ok(response?),
            Err(_) => Err(ForwardError::Timeout(self.response_timeout)),
        }
    }
}
