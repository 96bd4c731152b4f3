//! RProxy - a virtual-host reverse proxy
//!
//! - Host and path based routing with first-match, prefix semantics
//! - One TLS listener serving many certificates, selected by SNI
//! - Streaming forwarding with X-Forwarded-Host rewriting
//! - Rule files in JSON or YAML

pub mod body;
pub mod certificate;
pub mod config;
pub mod error;
pub mod proxy;
pub mod routing;
pub mod state;
pub mod transport;

pub use certificate::{CertificateIndex, FallbackPolicy, SniResolver, TlsStatus};
pub use config::{load_rules, LocationConfig, ProxyRule};
pub use error::{CertificateError, ConfigError, ForwardError, StartupError};
pub use proxy::{ClientInfo, Dispatcher, ForwardOptions, InboundScheme, ProxyConfig, ProxyServer};
pub use routing::{Endpoint, MatchResult, RoutingTable};
pub use state::{ProxyState, Snapshot};
