// src/core/ha/uri.rs

//! Parses and classifies HA backend URIs of the form
//! `<backend>+<store>[+<wire>]://host:port/<cluster_name>`, and selects the
//! matching watcher implementation.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::core::CoreResult;
use crate::core::errors::CoreError;

static URI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<backend>[a-z]+)\+(?P<store>[a-z]+)(\+(?P<wire>https?))?://(?P<host>[^:/]+)(:(?P<port>\d+))?/(?P<name>[^/]+)$",
    )
    .expect("HA URI regex is a fixed, known-valid pattern")
});

/// The decomposed fields of a parsed HA URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaUri {
    pub backend: String,
    pub store: String,
    pub wire: WireTag,
    pub host: String,
    pub port: u16,
    pub cluster_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireTag {
    Plain,
    Http,
    Https,
}

const DEFAULT_CONSUL_PORT: u16 = 8500;

/// Parses and validates an HA URI against the supported backend/store/wire
/// combinations. Only `stolon+consul` (optionally `+http`/`+https`) is
/// currently recognized; anything else is a hard error naming the offending
/// URI.
pub fn parse(uri: &str) -> CoreResult<HaUri> {
    let caps = URI_RE.captures(uri).ok_or_else(|| CoreError::InvalidHaUri {
        uri: uri.to_string(),
        reason: "does not match <backend>+<store>[+<wire>]://host[:port]/name".to_string(),
    })?;

    let backend = caps["backend"].to_string();
    let store = caps["store"].to_string();
    let wire = match caps.name("wire").map(|m| m.as_str()) {
        None => WireTag::Plain,
        Some("http") => WireTag::Http,
        Some("https") => WireTag::Https,
        Some(other) => {
            return Err(CoreError::InvalidHaUri {
                uri: uri.to_string(),
                reason: format!("unsupported wire protocol '{other}'"),
            });
        }
    };

    if backend != "stolon" {
        return Err(CoreError::InvalidHaUri {
            uri: uri.to_string(),
            reason: format!("unsupported backend '{backend}'"),
        });
    }
    if store != "consul" {
        return Err(CoreError::InvalidHaUri {
            uri: uri.to_string(),
            reason: format!("unsupported store '{store}'"),
        });
    }

    let host = caps["host"].to_string();
    let port: u16 = match caps.name("port") {
        Some(m) => m.as_str().parse().map_err(|_| CoreError::InvalidHaUri {
            uri: uri.to_string(),
            reason: "port is not a valid u16".to_string(),
        })?,
        None => DEFAULT_CONSUL_PORT,
    };
    let cluster_name = caps["name"].to_string();

    Ok(HaUri {
        backend,
        store,
        wire,
        host,
        port,
        cluster_name,
    })
}

impl HaUri {
    /// The base URL the passive watcher issues its long-poll GETs against.
    pub fn base_url(&self) -> String {
        let scheme = match self.wire {
            WireTag::Plain | WireTag::Http => "http",
            WireTag::Https => "https",
        };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_wire_and_port() {
        let uri = parse("stolon+consul://10.0.0.1/mycluster").unwrap();
        assert_eq!(uri.backend, "stolon");
        assert_eq!(uri.store, "consul");
        assert_eq!(uri.wire, WireTag::Plain);
        assert_eq!(uri.port, DEFAULT_CONSUL_PORT);
        assert_eq!(uri.cluster_name, "mycluster");
    }

    #[test]
    fn parses_explicit_wire_and_port() {
        let uri = parse("stolon+consul+https://consul.example:8501/prod").unwrap();
        assert_eq!(uri.wire, WireTag::Https);
        assert_eq!(uri.port, 8501);
        assert_eq!(uri.base_url(), "https://consul.example:8501");
    }

    #[test]
    fn rejects_unknown_backend() {
        assert!(matches!(
            parse("sentinel+consul://host/name"),
            Err(CoreError::InvalidHaUri { .. })
        ));
    }

    #[test]
    fn rejects_unknown_store() {
        assert!(matches!(
            parse("stolon+zookeeper://host/name"),
            Err(CoreError::InvalidHaUri { .. })
        ));
    }

    #[test]
    fn rejects_malformed_uri() {
        assert!(parse("not-a-uri").is_err());
    }
}
