//! Error types for configuration, certificate loading, startup and forwarding

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error used for streaming bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Rule file could not be read or contains an invalid rule
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read rule file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON rule file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML rule file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("rule #{rule} has no server names")]
    NoServerNames { rule: usize },

    #[error("rule #{rule} has an empty server name")]
    EmptyServerName { rule: usize },

    #[error("rule #{rule}: location path {path:?} must start with '/'")]
    InvalidPath { rule: usize, path: String },

    #[error("rule #{rule}: invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint {
        rule: usize,
        endpoint: String,
        reason: String,
    },

    #[error("rule #{rule} enables TLS but does not name both cert and certkey")]
    MissingTlsFiles { rule: usize },
}

/// A certificate/key pair could not be turned into a usable TLS identity
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("TLS server {0} does not name both cert and certkey")]
    MissingFiles(String),

    #[error("no certificates found in {path}")]
    NoCertificates { path: PathBuf },

    #[error("no private key found in {path}")]
    NoPrivateKey { path: PathBuf },

    #[error("unsupported private key in {path}: {source}")]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: rustls::Error,
    },

    #[error("unparseable certificate in {path}: {reason}")]
    InvalidCertificate { path: PathBuf, reason: String },

    #[error("private key {key} does not belong to certificate {cert}")]
    KeyMismatch { cert: PathBuf, key: PathBuf },

    #[error("default certificate {0:?} does not name a TLS-enabled server")]
    UnknownDefault(String),
}

/// Anything that stops the proxy from starting or reloading
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("reload would {0} the TLS listener; restart the proxy instead")]
    TlsToggle(&'static str),
}

/// Failure while exchanging a request with a backend
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("target URI has no host")]
    MissingHost,

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {addr} failed: {source}")]
    Tls {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid TLS server name {0:?}")]
    ServerName(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("backend HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to build backend request: {0}")]
    Request(#[from] hyper::http::Error),
}

impl ForwardError {
    /// Whether the failure should be reported to the client as a gateway timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ForwardError::Timeout(_))
    }
}
