//! Proxy state shared by the dispatcher and the SNI resolver
//!
//! The routing table and the certificate index are built together and
//! published together. Readers take an `Arc` snapshot and keep it for the
//! life of a request or handshake; a reload replaces the pointer, never the
//! contents.

use crate::certificate::{CertificateIndex, FallbackPolicy, TlsStatus};
use crate::config::ProxyRule;
use crate::error::{ConfigError, StartupError};
use crate::routing::RoutingTable;
use parking_lot::RwLock;
use std::sync::Arc;

/// Atomically swappable immutable value
#[derive(Debug)]
pub struct Snapshot<T> {
    current: RwLock<Arc<T>>,
}

impl<T> Snapshot<T> {
    pub fn new(value: T) -> Self {
        Self {
            current: RwLock::new(Arc::new(value)),
        }
    }

    /// Current value; stays valid even if a newer one is published
    pub fn load(&self) -> Arc<T> {
        self.current.read().clone()
    }

    /// Publish `value`, returning the previous snapshot
    pub fn store(&self, value: T) -> Arc<T> {
        let next = Arc::new(value);
        std::mem::replace(&mut *self.current.write(), next)
    }
}

/// Everything derived from the rule file
#[derive(Debug, Clone, Default)]
pub struct ProxyState {
    pub table: RoutingTable,
    pub certificates: Option<CertificateIndex>,
}

impl ProxyState {
    /// Compile the routing table and load every certificate.
    /// Fails without side effects if either part is invalid.
    pub fn build(rules: &[ProxyRule], fallback: &FallbackPolicy) -> Result<Self, StartupError> {
        let table = RoutingTable::build(rules)?;
        let certificates = CertificateIndex::build(rules, fallback)?;
        Ok(Self { table, certificates })
    }

    /// Routing table only, for running without TLS
    pub fn plaintext(rules: &[ProxyRule]) -> Result<Self, ConfigError> {
        Ok(Self {
            table: RoutingTable::build(rules)?,
            certificates: None,
        })
    }

    pub fn tls_status(&self) -> TlsStatus {
        match &self.certificates {
            Some(index) => TlsStatus::Serving {
                certificates: index.len(),
            },
            None => TlsStatus::Disabled,
        }
    }
}
