//! Certificate selection for TLS termination
//! Loads the PEM pair of every TLS-enabled rule once and picks one per
//! handshake from the client's SNI name

use crate::config::ProxyRule;
use crate::error::CertificateError;
use crate::state::{ProxyState, Snapshot};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, SignatureVerificationAlgorithm};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{CertifiedKey, SigningKey};
use rustls::{ServerConfig, SignatureScheme};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which certificate to present when the SNI name has no entry
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// The certificate of the first TLS rule in the rule file
    #[default]
    FirstLoaded,
    /// The certificate indexed under this server name
    ServerName(String),
    /// No certificate; the handshake is aborted
    Reject,
}

impl FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err("empty fallback policy".to_string()),
            "first" => Ok(FallbackPolicy::FirstLoaded),
            "none" => Ok(FallbackPolicy::Reject),
            name => Ok(FallbackPolicy::ServerName(name.to_string())),
        }
    }
}

impl fmt::Display for FallbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackPolicy::FirstLoaded => f.write_str("first"),
            FallbackPolicy::ServerName(name) => f.write_str(name),
            FallbackPolicy::Reject => f.write_str("none"),
        }
    }
}

/// Lifecycle of the TLS listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TlsStatus {
    /// No rule enables TLS
    Disabled,
    /// Index built, listener may serve
    Serving { certificates: usize },
    /// Index build failed; only the plaintext listener runs
    Failed(String),
}

/// Load every certificate in a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CertificateError> {
    let file = File::open(path).map_err(|source| CertificateError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| CertificateError::Read {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(CertificateError::NoCertificates {
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) in a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, CertificateError> {
    let file = File::open(path).map_err(|source| CertificateError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| CertificateError::Read {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| CertificateError::NoPrivateKey {
            path: path.to_path_buf(),
        })
}

/// Load a certificate chain and its key into a signing identity.
/// The key must be the one the leaf certificate was issued for.
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, CertificateError> {
    let chain = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let signing_key =
        rustls::crypto::ring::sign::any_supported_type(&key).map_err(|source| CertificateError::InvalidKey {
            path: key_path.to_path_buf(),
            source,
        })?;
    verify_key_matches(&chain[0], signing_key.as_ref(), cert_path, key_path)?;
    Ok(CertifiedKey::new(chain, signing_key))
}

const PAIR_CHECK_MESSAGE: &[u8] = b"rproxy certificate/key pair check";

const PAIR_CHECK_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ED25519,
    SignatureScheme::RSA_PKCS1_SHA256,
];

fn verification_algorithm(scheme: SignatureScheme) -> Option<&'static dyn SignatureVerificationAlgorithm> {
    match scheme {
        SignatureScheme::ECDSA_NISTP256_SHA256 => Some(webpki::ring::ECDSA_P256_SHA256),
        SignatureScheme::ECDSA_NISTP384_SHA384 => Some(webpki::ring::ECDSA_P384_SHA384),
        SignatureScheme::ED25519 => Some(webpki::ring::ED25519),
        SignatureScheme::RSA_PKCS1_SHA256 => Some(webpki::ring::RSA_PKCS1_2048_8192_SHA256),
        _ => None,
    }
}

/// Sign a fixed message with `key` and verify it against the leaf's public key
fn verify_key_matches(
    leaf: &CertificateDer<'_>,
    key: &dyn SigningKey,
    cert_path: &Path,
    key_path: &Path,
) -> Result<(), CertificateError> {
    let mismatch = || CertificateError::KeyMismatch {
        cert: cert_path.to_path_buf(),
        key: key_path.to_path_buf(),
    };

    let cert = webpki::EndEntityCert::try_from(leaf).map_err(|e| CertificateError::InvalidCertificate {
        path: cert_path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let signer = key.choose_scheme(PAIR_CHECK_SCHEMES).ok_or_else(mismatch)?;
    let algorithm = verification_algorithm(signer.scheme()).ok_or_else(mismatch)?;
    let signature = signer
        .sign(PAIR_CHECK_MESSAGE)
        .map_err(|source| CertificateError::InvalidKey {
            path: key_path.to_path_buf(),
            source,
        })?;

    cert.verify_signature(algorithm, PAIR_CHECK_MESSAGE, &signature)
        .map_err(|_| mismatch())
}

/// SNI names are compared case-insensitively and without a trailing dot
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// A loaded identity and the names it was indexed under
#[derive(Clone)]
pub struct LoadedCertificate {
    pub server_names: Vec<String>,
    pub cert_path: PathBuf,
    pub key: Arc<CertifiedKey>,
}

impl fmt::Debug for LoadedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedCertificate")
            .field("server_names", &self.server_names)
            .field("cert_path", &self.cert_path)
            .finish_non_exhaustive()
    }
}

/// Normalized server name -> certificate, plus the fallback identity
#[derive(Clone)]
pub struct CertificateIndex {
    by_name: HashMap<String, Arc<CertifiedKey>>,
    loaded: Vec<LoadedCertificate>,
    fallback: Option<Arc<CertifiedKey>>,
    policy: FallbackPolicy,
}

impl fmt::Debug for CertificateIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateIndex")
            .field("loaded", &self.loaded)
            .field("policy", &self.policy)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

impl CertificateIndex {
    /// Load every TLS rule's pair. `Ok(None)` when no rule enables TLS.
    /// Any unreadable or unusable pair fails the whole index.
    pub fn build(rules: &[ProxyRule], policy: &FallbackPolicy) -> Result<Option<Self>, CertificateError> {
        let mut by_name = HashMap::new();
        let mut loaded = Vec::new();

        for rule in rules.iter().filter(|r| r.tls) {
            let names = rule.server_names.join(",");
            let (Some(cert_path), Some(key_path)) = (&rule.cert, &rule.key) else {
                return Err(CertificateError::MissingFiles(names));
            };

            let key = Arc::new(load_certified_key(cert_path, key_path)?);
            info!("Loaded certificate {} for {}", cert_path.display(), names);

            for name in &rule.server_names {
                let normalized = normalize_name(name);
                if by_name.contains_key(&normalized) {
                    warn!("Server name {} already has a certificate, keeping the first one", name);
                    continue;
                }
                by_name.insert(normalized, key.clone());
            }

            loaded.push(LoadedCertificate {
                server_names: rule.server_names.clone(),
                cert_path: cert_path.clone(),
                key,
            });
        }

        if loaded.is_empty() {
            return Ok(None);
        }

        let fallback = match policy {
            FallbackPolicy::FirstLoaded => Some(loaded[0].key.clone()),
            FallbackPolicy::ServerName(name) => Some(
                by_name
                    .get(&normalize_name(name))
                    .cloned()
                    .ok_or_else(|| CertificateError::UnknownDefault(name.clone()))?,
            ),
            FallbackPolicy::Reject => None,
        };

        Ok(Some(Self {
            by_name,
            loaded,
            fallback,
            policy: policy.clone(),
        }))
    }

    /// Certificate for a negotiated server name, falling back per policy
    pub fn certificate_for(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = server_name {
            if let Some(key) = self.by_name.get(&normalize_name(name)) {
                return Some(key.clone());
            }
            debug!("No certificate for {}, using fallback ({})", name, self.policy);
        }
        self.fallback.clone()
    }

    pub fn entries(&self) -> &[LoadedCertificate] {
        &self.loaded
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }
}

/// Handshake-time certificate lookup against the current proxy state
#[derive(Clone)]
pub struct SniResolver {
    state: Arc<Snapshot<ProxyState>>,
}

impl SniResolver {
    pub fn new(state: Arc<Snapshot<ProxyState>>) -> Self {
        Self { state }
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let state = self.state.load();
        let index = state.certificates.as_ref()?;
        let selected = index.certificate_for(client_hello.server_name());
        if selected.is_none() {
            warn!("No certificate for SNI {:?}, aborting handshake", client_hello.server_name());
        }
        selected
    }
}

/// TLS server configuration that selects certificates through `resolver`
pub fn server_config(resolver: SniResolver) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rcgen::generate_simple_self_signed;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    /// Write a self-signed pair for `names` and return (cert, key, DER)
    pub(crate) fn write_self_signed(dir: &Path, file_stem: &str, names: &[&str]) -> (PathBuf, PathBuf, Vec<u8>) {
        let cert = generate_simple_self_signed(names.iter().map(|n| n.to_string()).collect::<Vec<_>>()).unwrap();
        let cert_path = dir.join(format!("{}.crt", file_stem));
        let key_path = dir.join(format!("{}.key", file_stem));
        fs::write(&cert_path, cert.serialize_pem().unwrap()).unwrap();
        fs::write(&key_path, cert.serialize_private_key_pem()).unwrap();
        let der = load_certs(&cert_path).unwrap()[0].as_ref().to_vec();
        (cert_path, key_path, der)
    }

    fn der_of(key: &CertifiedKey) -> Vec<u8> {
        key.cert[0].as_ref().to_vec()
    }

    fn two_tls_rules() -> (TempDir, Vec<ProxyRule>, Vec<u8>, Vec<u8>) {
        let dir = tempdir().unwrap();
        let (a_cert, a_key, a_der) = write_self_signed(dir.path(), "a", &["a.test"]);
        let (b_cert, b_key, b_der) = write_self_signed(dir.path(), "b", &["b.test", "www.b.test"]);
        let rules = vec![
            ProxyRule::new(["a.test"]).with_tls(a_cert, a_key),
            ProxyRule::new(["plain.test"]),
            ProxyRule::new(["b.test", "www.b.test"]).with_tls(b_cert, b_key),
        ];
        (dir, rules, a_der, b_der)
    }

    #[test]
    fn test_selects_certificate_by_sni() {
        let (_dir, rules, a_der, b_der) = two_tls_rules();
        let index = CertificateIndex::build(&rules, &FallbackPolicy::FirstLoaded).unwrap().unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(der_of(&index.certificate_for(Some("a.test")).unwrap()), a_der);
        assert_eq!(der_of(&index.certificate_for(Some("b.test")).unwrap()), b_der);
        assert_eq!(der_of(&index.certificate_for(Some("www.b.test")).unwrap()), b_der);
    }

    #[test]
    fn test_sni_lookup_is_normalized() {
        let (_dir, rules, _a_der, b_der) = two_tls_rules();
        let index = CertificateIndex::build(&rules, &FallbackPolicy::Reject).unwrap().unwrap();

        assert_eq!(der_of(&index.certificate_for(Some("B.TEST")).unwrap()), b_der);
        assert_eq!(der_of(&index.certificate_for(Some("b.test.")).unwrap()), b_der);
    }

    #[test]
    fn test_fallback_policies() {
        let (_dir, rules, a_der, b_der) = two_tls_rules();

        let first = CertificateIndex::build(&rules, &FallbackPolicy::FirstLoaded).unwrap().unwrap();
        assert_eq!(der_of(&first.certificate_for(Some("unknown.test")).unwrap()), a_der);
        assert_eq!(der_of(&first.certificate_for(None).unwrap()), a_der);

        let named = CertificateIndex::build(&rules, &"www.b.test".parse::<FallbackPolicy>().unwrap()).unwrap().unwrap();
        assert_eq!(der_of(&named.certificate_for(Some("unknown.test")).unwrap()), b_der);

        let reject = CertificateIndex::build(&rules, &FallbackPolicy::Reject).unwrap().unwrap();
        assert!(reject.certificate_for(Some("unknown.test")).is_none());
        assert!(reject.certificate_for(None).is_none());
    }

    #[test]
    fn test_unknown_default_name_fails() {
        let (_dir, rules, _, _) = two_tls_rules();
        let err = CertificateIndex::build(&rules, &FallbackPolicy::ServerName("plain.test".into())).unwrap_err();
        assert!(matches!(err, CertificateError::UnknownDefault(_)));
    }

    #[test]
    fn test_no_tls_rules_disables_index() {
        let rules = vec![ProxyRule::new(["a.test"]).location("/", "http://127.0.0.1:1")];
        assert!(CertificateIndex::build(&rules, &FallbackPolicy::FirstLoaded).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_name_keeps_first() {
        let dir = tempdir().unwrap();
        let (a_cert, a_key, a_der) = write_self_signed(dir.path(), "a", &["shared.test"]);
        let (b_cert, b_key, _) = write_self_signed(dir.path(), "b", &["shared.test"]);
        let rules = vec![
            ProxyRule::new(["shared.test"]).with_tls(a_cert, a_key),
            ProxyRule::new(["shared.test"]).with_tls(b_cert, b_key),
        ];
        let index = CertificateIndex::build(&rules, &FallbackPolicy::Reject).unwrap().unwrap();
        assert_eq!(der_of(&index.certificate_for(Some("shared.test")).unwrap()), a_der);
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let (dir, mut rules, _, _) = two_tls_rules();
        rules[2].key = Some(dir.path().join("missing.key"));
        let err = CertificateIndex::build(&rules, &FallbackPolicy::FirstLoaded).unwrap_err();
        assert!(matches!(err, CertificateError::Read { .. }));
    }

    #[test]
    fn test_garbage_pem_is_fatal() {
        let dir = tempdir().unwrap();
        let (cert, _, _) = write_self_signed(dir.path(), "a", &["a.test"]);
        let bogus = dir.path().join("bogus.pem");
        fs::write(&bogus, "not a pem file").unwrap();

        let rules = vec![ProxyRule::new(["a.test"]).with_tls(bogus.clone(), bogus.clone())];
        assert!(matches!(
            CertificateIndex::build(&rules, &FallbackPolicy::FirstLoaded),
            Err(CertificateError::NoCertificates { .. })
        ));

        let rules = vec![ProxyRule::new(["a.test"]).with_tls(cert, bogus)];
        assert!(matches!(
            CertificateIndex::build(&rules, &FallbackPolicy::FirstLoaded),
            Err(CertificateError::NoPrivateKey { .. })
        ));
    }

    #[test]
    fn test_key_from_other_certificate_is_fatal() {
        let dir = tempdir().unwrap();
        let (a_cert, _a_key, _) = write_self_signed(dir.path(), "a", &["a.test"]);
        let (_b_cert, b_key, _) = write_self_signed(dir.path(), "b", &["b.test"]);

        let rules = vec![ProxyRule::new(["a.test"]).with_tls(a_cert.clone(), b_key.clone())];
        match CertificateIndex::build(&rules, &FallbackPolicy::FirstLoaded) {
            Err(CertificateError::KeyMismatch { cert, key }) => {
                assert_eq!(cert, a_cert);
                assert_eq!(key, b_key);
            }
            other => panic!("expected KeyMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_matching_pair_passes_check() {
        let dir = tempdir().unwrap();
        let (cert, key, der) = write_self_signed(dir.path(), "a", &["a.test"]);
        let loaded = load_certified_key(&cert, &key).unwrap();
        assert_eq!(der_of(&loaded), der);
    }

    #[test]
    fn test_missing_paths_reported() {
        let mut rule = ProxyRule::new(["a.test"]);
        rule.tls = true;
        let err = CertificateIndex::build(&[rule], &FallbackPolicy::FirstLoaded).unwrap_err();
        assert!(matches!(err, CertificateError::MissingFiles(_)));
    }

    #[test]
    fn test_fallback_policy_parse() {
        assert_eq!("first".parse::<FallbackPolicy>().unwrap(), FallbackPolicy::FirstLoaded);
        assert_eq!("none".parse::<FallbackPolicy>().unwrap(), FallbackPolicy::Reject);
        assert_eq!(
            "example.com".parse::<FallbackPolicy>().unwrap(),
            FallbackPolicy::ServerName("example.com".into())
        );
        assert!("".parse::<FallbackPolicy>().is_err());
        assert_eq!(FallbackPolicy::Reject.to_string(), "none");
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("WWW.Example.COM."), "www.example.com");
    }
}
