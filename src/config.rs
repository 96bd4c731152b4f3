//! Rule model and rule-file loading
//! A rule binds a group of virtual-host aliases to an ordered list of
//! path-prefix -> backend locations, with optional TLS material

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// One `(path prefix, backend URL)` pair inside a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationConfig {
    pub path: String,
    pub endpoint: String,
}

/// One configuration unit as written in the rule file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRule {
    #[serde(rename = "servername", default)]
    pub server_names: Vec<String>,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,
    #[serde(rename = "certkey", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,
}

impl ProxyRule {
    pub fn new<S: Into<String>>(server_names: impl IntoIterator<Item = S>) -> Self {
        Self {
            server_names: server_names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Append a location; order of calls is match precedence
    pub fn location(mut self, path: &str, endpoint: &str) -> Self {
        self.locations.push(LocationConfig {
            path: path.to_string(),
            endpoint: endpoint.to_string(),
        });
        self
    }

    pub fn with_tls<P: Into<PathBuf>>(mut self, cert: P, key: P) -> Self {
        self.tls = true;
        self.cert = Some(cert.into());
        self.key = Some(key.into());
        self
    }
}

/// Accepted top-level shapes of a rule file
#[derive(Deserialize)]
#[serde(untagged)]
enum RuleDocument {
    Wrapped { proxy: Vec<ProxyRule> },
    Bare(Vec<ProxyRule>),
}

impl From<RuleDocument> for Vec<ProxyRule> {
    fn from(doc: RuleDocument) -> Self {
        match doc {
            RuleDocument::Wrapped { proxy } => proxy,
            RuleDocument::Bare(rules) => rules,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFormat {
    Json,
    Yaml,
}

impl RuleFormat {
    /// Pick a format from the file extension; YAML also reads JSON
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => RuleFormat::Json,
            _ => RuleFormat::Yaml,
        }
    }
}

/// Load and validate the rule file at `path`
pub fn load_rules<P: AsRef<Path>>(path: P) -> Result<Vec<ProxyRule>, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_rules(&contents, RuleFormat::from_path(path))
}

/// Parse and validate rule-file contents
pub fn parse_rules(contents: &str, format: RuleFormat) -> Result<Vec<ProxyRule>, ConfigError> {
    let doc: RuleDocument = match format {
        RuleFormat::Json => serde_json::from_str(contents)?,
        RuleFormat::Yaml => serde_yaml::from_str(contents)?,
    };
    let rules: Vec<ProxyRule> = doc.into();
    validate_rules(&rules)?;
    Ok(rules)
}

/// Structural checks that do not need the filesystem or the network
pub fn validate_rules(rules: &[ProxyRule]) -> Result<(), ConfigError> {
    for (rule, item) in rules.iter().enumerate() {
        if item.server_names.is_empty() {
            return Err(ConfigError::NoServerNames { rule });
        }
        if item.server_names.iter().any(|name| name.is_empty()) {
            return Err(ConfigError::EmptyServerName { rule });
        }

        for location in &item.locations {
            if !location.path.starts_with('/') {
                return Err(ConfigError::InvalidPath {
                    rule,
                    path: location.path.clone(),
                });
            }
        }

        if item.tls && (item.cert.is_none() || item.key.is_none()) {
            return Err(ConfigError::MissingTlsFiles { rule });
        }
    }
    Ok(())
}
