//! Compiled routing table with host and path matching
//!
//! Matching is first-match in declaration order on both levels:
//! - host: rules in order, aliases in order, alias is a prefix of the request host
//! - path: locations of the selected rule in order, pattern is a prefix of the request path
//!
//! The prefix predicate is deliberately loose: `example.com` also matches
//! `example.com.evil.org` and `example.com:8080`. Host values are compared
//! exactly as received, without case folding.

use crate::config::{validate_rules, ProxyRule};
use crate::error::ConfigError;
use hyper::http::uri::InvalidUri;
use hyper::Uri;
use url::Url;

/// Backend a location forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: String,
    authority: String,
    base_path: String,
    base_query: Option<String>,
}

impl Endpoint {
    /// Parse an absolute `http`/`https` URL
    pub fn parse(raw: &str) -> Result<Self, String> {
        let url = Url::parse(raw).map_err(|e| e.to_string())?;

        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(format!("unsupported scheme {:?}", scheme));
        }

        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h,
            _ => return Err("missing host".to_string()),
        };

        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            scheme: scheme.to_string(),
            authority,
            base_path: url.path().to_string(),
            base_query: url.query().map(|q| q.to_string()),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// `host[:port]` as written in the endpoint, used for the outbound Host header
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Absolute URI for a request path/query forwarded to this endpoint
    pub fn target_uri(&self, path: &str, query: Option<&str>) -> Result<Uri, InvalidUri> {
        let path = join_path(&self.base_path, path);
        let target = match merge_query(self.base_query.as_deref(), query) {
            Some(q) => format!("{}://{}{}?{}", self.scheme, self.authority, path, q),
            None => format!("{}://{}{}", self.scheme, self.authority, path),
        };
        target.parse()
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.base_path)
    }
}

/// Join two path segments with exactly one slash between them
fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

fn merge_query(base: Option<&str>, request: Option<&str>) -> Option<String> {
    match (base.filter(|q| !q.is_empty()), request.filter(|q| !q.is_empty())) {
        (Some(b), Some(r)) => Some(format!("{}&{}", b, r)),
        (Some(q), None) | (None, Some(q)) => Some(q.to_string()),
        (None, None) => None,
    }
}

/// A path prefix bound to a backend
#[derive(Debug, Clone)]
pub struct Location {
    pub path: String,
    pub endpoint: Endpoint,
}

/// A compiled rule
#[derive(Debug, Clone)]
pub struct Route {
    pub server_names: Vec<String>,
    pub locations: Vec<Location>,
    pub tls: bool,
}

impl Route {
    /// First location whose pattern is a prefix of `path`
    pub fn match_path(&self, path: &str) -> Option<&Location> {
        self.locations.iter().find(|location| {
            let hit = path.starts_with(location.path.as_str());
            tracing::trace!("location {} vs {}: {}", location.path, path, hit);
            hit
        })
    }
}

/// Rule selected by the host matcher, with the alias that matched
#[derive(Debug, Clone, Copy)]
pub struct HostMatch<'a> {
    pub route: &'a Route,
    pub alias: &'a str,
}

/// Outcome of resolving a request against the table
#[derive(Debug, Clone, Copy)]
pub enum MatchResult<'a> {
    Forward {
        endpoint: &'a Endpoint,
        server_name: &'a str,
        location: &'a str,
    },
    Unmatched,
}

impl MatchResult<'_> {
    pub fn is_unmatched(&self) -> bool {
        matches!(self, MatchResult::Unmatched)
    }
}

/// Immutable, ordered view of all rules
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    /// Validate and compile rules; any invalid rule fails the whole table
    pub fn build(rules: &[ProxyRule]) -> Result<Self, ConfigError> {
        validate_rules(rules)?;

        let mut routes = Vec::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            let mut locations = Vec::with_capacity(rule.locations.len());
            for location in &rule.locations {
                let endpoint = Endpoint::parse(&location.endpoint).map_err(|reason| {
                    ConfigError::InvalidEndpoint {
                        rule: index,
                        endpoint: location.endpoint.clone(),
                        reason,
                    }
                })?;
                locations.push(Location {
                    path: location.path.clone(),
                    endpoint,
                });
            }

            routes.push(Route {
                server_names: rule.server_names.clone(),
                locations,
                tls: rule.tls,
            });
        }

        Ok(Self { routes })
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Whether any rule asks for TLS termination
    pub fn has_tls(&self) -> bool {
        self.routes.iter().any(|r| r.tls)
    }

    /// First rule (and alias) whose alias is a prefix of `host`
    pub fn match_host(&self, host: &str) -> Option<HostMatch<'_>> {
        for route in &self.routes {
            for alias in &route.server_names {
                tracing::debug!("Trying server name {} for host {}", alias, host);
                if host.starts_with(alias.as_str()) {
                    return Some(HostMatch { route, alias });
                }
            }
        }
        None
    }

    /// Host match, then path match within the selected rule only
    pub fn resolve(&self, host: &str, path: &str) -> MatchResult<'_> {
        let Some(HostMatch { route, alias }) = self.match_host(host) else {
            return MatchResult::Unmatched;
        };

        match route.match_path(path) {
            Some(location) => MatchResult::Forward {
                endpoint: &location.endpoint,
                server_name: alias,
                location: &location.path,
            },
            None => MatchResult::Unmatched,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_table() -> RoutingTable {
        RoutingTable::build(&[
            ProxyRule::new(["a.com"]).location("/api", "http://127.0.0.1:9000"),
            ProxyRule::new(["b.com"]).location("/", "http://127.0.0.1:8080"),
        ])
        .unwrap()
    }

    fn forwarded_to(result: MatchResult<'_>) -> String {
        match result {
            MatchResult::Forward { endpoint, .. } => endpoint.authority().to_string(),
            MatchResult::Unmatched => "unmatched".to_string(),
        }
    }

    #[test]
    fn test_example_scenario() {
        let table = example_table();

        let MatchResult::Forward { endpoint, server_name, location } = table.resolve("a.com", "/api/users") else {
            panic!("a.com should match");
        };
        assert_eq!(server_name, "a.com");
        assert_eq!(location, "/api");
        assert_eq!(
            endpoint.target_uri("/api/users", None).unwrap().to_string(),
            "http://127.0.0.1:9000/api/users"
        );

        let MatchResult::Forward { endpoint, .. } = table.resolve("b.com", "/anything") else {
            panic!("b.com should match");
        };
        assert_eq!(
            endpoint.target_uri("/anything", None).unwrap().to_string(),
            "http://127.0.0.1:8080/anything"
        );

        assert!(table.resolve("c.com", "/").is_unmatched());
    }

    #[test]
    fn test_exact_alias_always_matches() {
        let table = RoutingTable::build(&[
            ProxyRule::new(["www.example.com", "example.com"]).location("/", "http://127.0.0.1:1"),
            ProxyRule::new(["other.org"]).location("/", "http://127.0.0.1:2"),
        ])
        .unwrap();

        for route in table.routes() {
            for alias in &route.server_names {
                let hit = table.match_host(alias).unwrap();
                assert!(std::ptr::eq(hit.route, route));
                assert_eq!(hit.alias, alias);
            }
        }
    }

    #[test]
    fn test_earlier_rule_wins() {
        let table = RoutingTable::build(&[
            ProxyRule::new(["api"]).location("/", "http://127.0.0.1:1"),
            ProxyRule::new(["api.example.com"]).location("/", "http://127.0.0.1:2"),
        ])
        .unwrap();

        for _ in 0..10 {
            assert_eq!(forwarded_to(table.resolve("api.example.com", "/")), "127.0.0.1:1");
        }
    }

    #[test]
    fn test_earlier_alias_wins_within_rule() {
        let table = RoutingTable::build(&[ProxyRule::new(["exam", "example.com"]).location("/", "http://127.0.0.1:1")]).unwrap();
        assert_eq!(table.match_host("example.com").unwrap().alias, "exam");
    }

    #[test]
    fn test_prefix_host_quirk_preserved() {
        let table = example_table();
        assert_eq!(forwarded_to(table.resolve("a.com.evil.org", "/api")), "127.0.0.1:9000");
        assert_eq!(forwarded_to(table.resolve("a.com:8080", "/api")), "127.0.0.1:9000");
        assert!(table.resolve("www.a.com", "/api").is_unmatched());
    }

    #[test]
    fn test_host_case_not_folded() {
        let table = example_table();
        assert!(table.resolve("A.COM", "/api").is_unmatched());
    }

    #[test]
    fn test_catch_all_last() {
        let table = RoutingTable::build(&[ProxyRule::new(["a.com"])
            .location("/api", "http://127.0.0.1:1")
            .location("/", "http://127.0.0.1:2")])
        .unwrap();

        assert_eq!(forwarded_to(table.resolve("a.com", "/api/v1")), "127.0.0.1:1");
        assert_eq!(forwarded_to(table.resolve("a.com", "/other")), "127.0.0.1:2");
    }

    #[test]
    fn test_catch_all_first_shadows_everything() {
        let table = RoutingTable::build(&[ProxyRule::new(["a.com"])
            .location("/", "http://127.0.0.1:2")
            .location("/api", "http://127.0.0.1:1")])
        .unwrap();

        assert_eq!(forwarded_to(table.resolve("a.com", "/api/v1")), "127.0.0.1:2");
        assert_eq!(forwarded_to(table.resolve("a.com", "/other")), "127.0.0.1:2");
    }

    #[test]
    fn test_path_miss_in_selected_rule_is_unmatched() {
        let table = RoutingTable::build(&[
            ProxyRule::new(["a.com"]).location("/api", "http://127.0.0.1:1"),
            ProxyRule::new(["a.com"]).location("/", "http://127.0.0.1:2"),
        ])
        .unwrap();

        assert!(table.resolve("a.com", "/web").is_unmatched());
    }

    #[test]
    fn test_rule_without_locations() {
        let table = RoutingTable::build(&[ProxyRule::new(["a.com"])]).unwrap();
        assert!(table.match_host("a.com").is_some());
        assert!(table.resolve("a.com", "/").is_unmatched());
    }

    #[test]
    fn test_invalid_endpoints_rejected() {
        for bad in ["127.0.0.1:9000", "ftp://host/", "http://", "not a url"] {
            let err = RoutingTable::build(&[ProxyRule::new(["a.com"]).location("/", bad)]).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidEndpoint { rule: 0, .. }), "{}", bad);
        }
    }

    #[test]
    fn test_has_tls() {
        assert!(!example_table().has_tls());
        let table = RoutingTable::build(&[ProxyRule::new(["a.com"]).with_tls("a.pem", "a.key")]).unwrap();
        assert!(table.has_tls());
    }

    #[test]
    fn test_target_uri_joins_paths() {
        let ep = Endpoint::parse("http://127.0.0.1:9090/").unwrap();
        assert_eq!(ep.target_uri("/a/b", Some("x=1")).unwrap().to_string(), "http://127.0.0.1:9090/a/b?x=1");

        let ep = Endpoint::parse("https://backend.internal/base").unwrap();
        assert_eq!(ep.scheme(), "https");
        assert_eq!(ep.authority(), "backend.internal");
        assert_eq!(ep.target_uri("/users", None).unwrap().to_string(), "https://backend.internal/base/users");

        let ep = Endpoint::parse("http://127.0.0.1:8000/v1/?key=k").unwrap();
        assert_eq!(
            ep.target_uri("/items", Some("page=2")).unwrap().to_string(),
            "http://127.0.0.1:8000/v1/items?key=k&page=2"
        );
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "/x"), "/x");
        assert_eq!(join_path("/base", "x"), "/base/x");
        assert_eq!(join_path("/base/", "x"), "/base/x");
        assert_eq!(join_path("/base", "/x"), "/base/x");
    }
}
