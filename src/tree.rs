//! Typed view of the proxy's `apps.http.servers` configuration subtree
//!
//! Only the parts the reconciler reads or writes get fields of their own:
//! listen addresses, routes, host matchers, and the `reverse_proxy`,
//! `subroute` and `file_server` handlers. Everything else is kept in the
//! `extra` maps (and in `Handler::Other`) so that a fetch followed by a
//! replace leaves configuration this crate does not understand untouched.

use serde::de::{DeserializeOwned, Error as DeError};
use serde::ser::{Error as SerError, SerializeMap};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Discriminant of the reverse proxy handler
pub const HANDLER_REVERSE_PROXY: &str = "reverse_proxy";
/// Discriminant of the subroute handler
pub const HANDLER_SUBROUTE: &str = "subroute";
/// Discriminant of the static file handler
pub const HANDLER_FILE_SERVER: &str = "file_server";

/// Listener groups keyed by name (`srv0`, `srv1`, ... in a stock config).
///
/// Ordered by name so the serialized form is deterministic.
pub type ListenerGroupMap = BTreeMap<String, ListenerGroup>;

/// Parse a listener-group map from a response body.
///
/// The admin API answers `null` when the subtree does not exist yet; that is
/// treated as an empty map.
pub fn parse_listener_groups(body: &[u8]) -> serde_json::Result<ListenerGroupMap> {
    let groups: Option<ListenerGroupMap> = serde_json::from_slice(body)?;
    Ok(groups.unwrap_or_default())
}

/// Serialize a listener-group map for the admin API.
pub fn listener_groups_to_json(groups: &ListenerGroupMap) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(groups)
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A server block: a set of listen addresses and the routes evaluated for them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListenerGroup {
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub listen: Vec<String>,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub routes: Vec<Route>,

    /// TLS policies, automatic HTTPS settings, timeouts, ...
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ListenerGroup {
    /// Create a group with the given listen addresses and no routes
    pub fn listening_on<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            listen: addresses.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parsed listen addresses, skipping ones without a port (unix sockets)
    pub fn listen_addresses(&self) -> impl Iterator<Item = ListenAddress> + '_ {
        self.listen.iter().filter_map(|addr| ListenAddress::parse(addr))
    }

    /// Whether any listen address of this group covers `port`
    pub fn listens_on(&self, port: u16) -> bool {
        self.listen_addresses().any(|addr| addr.covers(port))
    }

    /// First managed upstream among this group's routes, see [`Route::managed_upstream_mut`]
    pub fn managed_upstream_mut(&mut self) -> Option<&mut Upstream> {
        self.routes.iter_mut().find_map(|route| route.managed_upstream_mut())
    }

    /// Remove `file_server` handlers from catch-all routes.
    ///
    /// A catch-all route left without handlers is dropped; catch-all routes
    /// that never held a file server are kept as they are. Returns the number
    /// of handlers removed.
    pub fn strip_catch_all_file_servers(&mut self) -> usize {
        let mut removed = 0;
        self.routes.retain_mut(|route| {
            if !route.is_catch_all() {
                return true;
            }
            let before = route.handle.len();
            route
                .handle
                .retain(|handler| !matches!(handler, Handler::FileServer(_)));
            let stripped = before - route.handle.len();
            removed += stripped;
            stripped == 0 || !route.handle.is_empty()
        });
        removed
    }
}

/// A listen address such as `:443`, `0.0.0.0:80`, `tcp/[::]:8080-8081`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenAddress {
    /// Network prefix (`tcp`, `udp`, ...) when given
    pub network: Option<String>,
    /// Host part, empty for "all interfaces"
    pub host: String,
    pub start_port: u16,
    pub end_port: u16,
}

impl ListenAddress {
    /// Parse a listen address. Returns `None` for addresses without a port.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (network, rest) = match raw.split_once('/') {
            Some((network, rest)) if !network.is_empty() && !network.contains(':') => {
                (Some(network.to_string()), rest)
            }
            _ => (None, raw),
        };

        let (host, ports) = rest.rsplit_once(':')?;
        let (start_port, end_port) = match ports.split_once('-') {
            Some((start, end)) => (start.parse().ok()?, end.parse().ok()?),
            None => {
                let port = ports.parse().ok()?;
                (port, port)
            }
        };
        if start_port > end_port {
            return None;
        }

        Some(Self {
            network,
            host: host.to_string(),
            start_port,
            end_port,
        })
    }

    pub fn covers(&self, port: u16) -> bool {
        (self.start_port..=self.end_port).contains(&port)
    }
}

/// A route: matcher sets, a handler chain, and the terminal flag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Matcher sets, OR-ed together. Empty means the route matches everything.
    #[serde(
        rename = "match",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub matchers: Vec<MatchSet>,

    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub handle: Vec<Handler>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub terminal: bool,

    /// `group`, `@id`, ...
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Route {
    /// The route this crate installs for an app:
    /// host match on `domain`, a subroute wrapping one reverse proxy to `dial`.
    pub fn proxy_for_host(domain: &str, dial: &str) -> Self {
        let proxy = Route {
            handle: vec![Handler::ReverseProxy(ReverseProxy::to(dial))],
            ..Route::default()
        };
        Route {
            matchers: vec![MatchSet::host(domain)],
            handle: vec![Handler::Subroute(Subroute {
                routes: vec![proxy],
                extra: Map::new(),
            })],
            ..Route::default()
        }
    }

    /// A route without matchers applies to every request
    pub fn is_catch_all(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Host names from all matcher sets
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.matchers
            .iter()
            .flat_map(|set| set.host.iter().map(String::as_str))
    }

    pub fn subroutes(&self) -> impl Iterator<Item = &Subroute> {
        self.handle.iter().filter_map(Handler::as_subroute)
    }

    /// The first upstream of the first `subroute -> reverse_proxy` chain in this route.
    ///
    /// Only one level of nesting is inspected, and only reverse proxies with at
    /// least one upstream count.
    pub fn managed_upstream_mut(&mut self) -> Option<&mut Upstream> {
        for handler in &mut self.handle {
            let Handler::Subroute(subroute) = handler else {
                continue;
            };
            for nested in &mut subroute.routes {
                for inner in &mut nested.handle {
                    if let Handler::ReverseProxy(proxy) = inner {
                        if let Some(upstream) = proxy.upstreams.first_mut() {
                            return Some(upstream);
                        }
                    }
                }
            }
        }
        None
    }

    pub fn managed_upstream(&self) -> Option<&Upstream> {
        self.subroutes()
            .flat_map(|subroute| subroute.routes.iter())
            .flat_map(|nested| nested.handle.iter())
            .filter_map(Handler::as_reverse_proxy)
            .find_map(|proxy| proxy.upstreams.first())
    }
}

/// One matcher set. Only host matching is modelled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSet {
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub host: Vec<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MatchSet {
    pub fn host(domain: &str) -> Self {
        Self {
            host: vec![domain.to_string()],
            extra: Map::new(),
        }
    }
}

/// A handler in a route's chain, discriminated by its `handler` field
#[derive(Debug, Clone, PartialEq)]
pub enum Handler {
    ReverseProxy(ReverseProxy),
    Subroute(Subroute),
    FileServer(FileServer),
    /// Any other handler kind, carried through untouched
    Other {
        kind: String,
        fields: Map<String, Value>,
    },
}

impl Handler {
    pub fn kind(&self) -> &str {
        match self {
            Handler::ReverseProxy(_) => HANDLER_REVERSE_PROXY,
            Handler::Subroute(_) => HANDLER_SUBROUTE,
            Handler::FileServer(_) => HANDLER_FILE_SERVER,
            Handler::Other { kind, .. } => kind,
        }
    }

    pub fn as_subroute(&self) -> Option<&Subroute> {
        match self {
            Handler::Subroute(subroute) => Some(subroute),
            _ => None,
        }
    }

    pub fn as_reverse_proxy(&self) -> Option<&ReverseProxy> {
        match self {
            Handler::ReverseProxy(proxy) => Some(proxy),
            _ => None,
        }
    }
}

fn from_fields<T, E>(fields: Map<String, Value>) -> Result<T, E>
where
    T: DeserializeOwned,
    E: DeError,
{
    serde_json::from_value(Value::Object(fields)).map_err(E::custom)
}

impl<'de> Deserialize<'de> for Handler {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut fields = Map::<String, Value>::deserialize(deserializer)?;
        let kind = match fields.remove("handler") {
            Some(Value::String(kind)) => kind,
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "handler discriminant must be a string, got {}",
                    other
                )))
            }
            None => return Err(D::Error::missing_field("handler")),
        };

        let handler = match kind.as_str() {
            HANDLER_REVERSE_PROXY => Handler::ReverseProxy(from_fields::<_, D::Error>(fields)?),
            HANDLER_SUBROUTE => Handler::Subroute(from_fields::<_, D::Error>(fields)?),
            HANDLER_FILE_SERVER => Handler::FileServer(from_fields::<_, D::Error>(fields)?),
            _ => Handler::Other { kind, fields },
        };
        Ok(handler)
    }
}

impl Serialize for Handler {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let body = match self {
            Handler::ReverseProxy(proxy) => serde_json::to_value(proxy),
            Handler::Subroute(subroute) => serde_json::to_value(subroute),
            Handler::FileServer(file_server) => serde_json::to_value(file_server),
            Handler::Other { .. } => Ok(Value::Null),
        }
        .map_err(S::Error::custom)?;

        let fields = match (self, &body) {
            (Handler::Other { fields, .. }, _) => fields,
            (_, Value::Object(fields)) => fields,
            _ => return Err(S::Error::custom("handler body must serialize to an object")),
        };

        let mut map = serializer.serialize_map(Some(fields.len() + 1))?;
        map.serialize_entry("handler", self.kind())?;
        for (key, value) in fields {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// `reverse_proxy` handler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReverseProxy {
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub upstreams: Vec<Upstream>,

    /// Load balancing, health checks, transport, headers, ...
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReverseProxy {
    pub fn to(dial: &str) -> Self {
        Self {
            upstreams: vec![Upstream::new(dial)],
            extra: Map::new(),
        }
    }
}

/// `subroute` handler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Subroute {
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub routes: Vec<Route>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `file_server` handler. Its settings are opaque here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileServer {
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A backend the proxy dials
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dial: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Upstream {
    pub fn new(dial: &str) -> Self {
        Self {
            dial: dial.to_string(),
            extra: Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stock_servers() -> Value {
        json!({
            "srv0": {
                "listen": [":443"],
                "routes": [
                    {
                        "match": [{"host": ["a.test"]}],
                        "handle": [{
                            "handler": "subroute",
                            "routes": [{
                                "handle": [{
                                    "handler": "reverse_proxy",
                                    "upstreams": [{"dial": "127.0.0.1:3000", "max_requests": 10}],
                                    "health_checks": {"active": {"uri": "/health"}}
                                }]
                            }]
                        }],
                        "terminal": true
                    },
                    {
                        "handle": [
                            {"handler": "vars", "root": "/usr/share/caddy"},
                            {"handler": "file_server", "hide": ["/etc/caddy/Caddyfile"]}
                        ]
                    }
                ],
                "tls_connection_policies": [{}],
                "automatic_https": {"disable_redirects": true}
            },
            "srv1": {
                "listen": ["tcp/0.0.0.0:80"],
                "routes": [{
                    "match": [{"host": ["b.test"], "path": ["/api/*"]}],
                    "handle": [{"handler": "static_response", "status_code": 204}]
                }]
            }
        })
    }

    #[test]
    fn test_round_trip_preserves_unknown_fields() {
        let original = stock_servers();
        let groups: ListenerGroupMap = serde_json::from_value(original.clone()).unwrap();

        assert_eq!(groups.len(), 2);
        assert!(groups["srv0"].extra.contains_key("tls_connection_policies"));
        assert!(matches!(
            groups["srv1"].routes[0].handle[0],
            Handler::Other { ref kind, .. } if kind == "static_response"
        ));

        let reserialized = serde_json::to_value(&groups).unwrap();
        assert_eq!(reserialized, original);
    }

    #[test]
    fn test_null_body_is_empty_map() {
        let groups = parse_listener_groups(b"null").unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn test_null_routes_are_empty() {
        let groups =
            parse_listener_groups(br#"{"srv0": {"listen": [":80"], "routes": null}}"#).unwrap();
        assert!(groups["srv0"].routes.is_empty());
    }

    #[test]
    fn test_handler_without_discriminant_is_rejected() {
        let result: Result<Handler, _> = serde_json::from_value(json!({"upstreams": []}));
        assert!(result.is_err());

        let result: Result<Handler, _> = serde_json::from_value(json!({"handler": 7}));
        assert!(result.is_err());
    }

    #[test]
    fn test_handler_serializes_discriminant_first() {
        let handler = Handler::ReverseProxy(ReverseProxy::to("127.0.0.1:3000"));
        let json = serde_json::to_string(&handler).unwrap();
        assert_eq!(
            json,
            r#"{"handler":"reverse_proxy","upstreams":[{"dial":"127.0.0.1:3000"}]}"#
        );
    }

    #[test]
    fn test_listen_address_parsing() {
        let addr = ListenAddress::parse(":443").unwrap();
        assert_eq!(addr.host, "");
        assert!(addr.covers(443));
        assert!(!addr.covers(80));

        let addr = ListenAddress::parse("tcp/0.0.0.0:80").unwrap();
        assert_eq!(addr.network.as_deref(), Some("tcp"));
        assert_eq!(addr.host, "0.0.0.0");
        assert!(addr.covers(80));

        let addr = ListenAddress::parse("[::1]:8000-8010").unwrap();
        assert_eq!(addr.host, "[::1]");
        assert!(addr.covers(8005));
        assert!(!addr.covers(8011));

        assert!(ListenAddress::parse("unix//run/caddy.sock").is_none());
        assert!(ListenAddress::parse(":90-80").is_none());
        assert!(ListenAddress::parse("localhost").is_none());
    }

    #[test]
    fn test_listens_on() {
        let group = ListenerGroup::listening_on([":8080", "127.0.0.1:443"]);
        assert!(group.listens_on(443));
        assert!(group.listens_on(8080));
        assert!(!group.listens_on(80));
    }

    #[test]
    fn test_managed_upstream_found_through_subroute() {
        let mut groups: ListenerGroupMap = serde_json::from_value(stock_servers()).unwrap();
        let srv0 = groups.get_mut("srv0").unwrap();

        let upstream = srv0.managed_upstream_mut().unwrap();
        assert_eq!(upstream.dial, "127.0.0.1:3000");
        assert_eq!(upstream.extra["max_requests"], json!(10));

        assert!(groups.get_mut("srv1").unwrap().managed_upstream_mut().is_none());
    }

    #[test]
    fn test_bare_reverse_proxy_is_not_managed() {
        let mut route = Route {
            handle: vec![Handler::ReverseProxy(ReverseProxy::to("127.0.0.1:9000"))],
            ..Route::default()
        };
        assert!(route.managed_upstream_mut().is_none());
        assert!(route.managed_upstream().is_none());
    }

    #[test]
    fn test_proxy_for_host_shape() {
        let route = Route::proxy_for_host("b.test", "127.0.0.1:5000");
        assert_eq!(
            serde_json::to_value(&route).unwrap(),
            json!({
                "match": [{"host": ["b.test"]}],
                "handle": [{
                    "handler": "subroute",
                    "routes": [{
                        "handle": [{
                            "handler": "reverse_proxy",
                            "upstreams": [{"dial": "127.0.0.1:5000"}]
                        }]
                    }]
                }]
            })
        );
        assert_eq!(route.hosts().collect::<Vec<_>>(), vec!["b.test"]);
        assert_eq!(route.managed_upstream().unwrap().dial, "127.0.0.1:5000");
    }

    #[test]
    fn test_strip_catch_all_file_servers() {
        let mut group: ListenerGroup = serde_json::from_value(json!({
            "listen": [":80"],
            "routes": [
                {"handle": [{"handler": "file_server"}]},
                {"handle": [{"handler": "vars", "root": "/srv"}, {"handler": "file_server"}]},
                {"match": [{"host": ["docs.test"]}], "handle": [{"handler": "file_server"}]},
                {"handle": [{"handler": "headers"}]}
            ]
        }))
        .unwrap();

        assert_eq!(group.strip_catch_all_file_servers(), 2);
        assert_eq!(group.routes.len(), 3);
        assert_eq!(group.routes[0].handle[0].kind(), "vars");
        assert_eq!(group.routes[1].handle[0].kind(), HANDLER_FILE_SERVER);
        assert_eq!(group.routes[2].handle[0].kind(), "headers");

        assert_eq!(group.strip_catch_all_file_servers(), 0);
    }
}
