//! Channel endpoints
//!
//! Either side of a queued channel may bind. Endpoints are written as
//! `bind://host:port` or `connect://host:port`; `tcp://` means connect.

use super::TransportError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Which side of the socket this end takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    Bind,
    Connect,
}

/// A channel address plus the socket role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub mode: EndpointMode,
    pub address: String,
}

impl Endpoint {
    pub fn bind(address: impl Into<String>) -> Self {
        Self {
            mode: EndpointMode::Bind,
            address: address.into(),
        }
    }

    pub fn connect(address: impl Into<String>) -> Self {
        Self {
            mode: EndpointMode::Connect,
            address: address.into(),
        }
    }

    pub fn is_bind(&self) -> bool {
        self.mode == EndpointMode::Bind
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mode, rest) = if let Some(rest) = s.strip_prefix("bind://") {
            (EndpointMode::Bind, rest)
        } else if let Some(rest) = s.strip_prefix("connect://") {
            (EndpointMode::Connect, rest)
        } else if let Some(rest) = s.strip_prefix("tcp://") {
            (EndpointMode::Connect, rest)
        } else {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        };

        // host:port with a numeric port
        let valid = rest
            .rsplit_once(':')
            .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
            .unwrap_or(false);
        if !valid {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }

        Ok(Self {
            mode,
            address: rest.to_string(),
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            EndpointMode::Bind => write!(f, "bind://{}", self.address),
            EndpointMode::Connect => write!(f, "connect://{}", self.address),
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_modes() {
        let e: Endpoint = "bind://0.0.0.0:5555".parse().unwrap();
        assert_eq!(e, Endpoint::bind("0.0.0.0:5555"));

        let e: Endpoint = "tcp://localhost:5559".parse().unwrap();
        assert_eq!(e, Endpoint::connect("localhost:5559"));
        assert_eq!(e.to_string(), "connect://localhost:5559");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("localhost:5555".parse::<Endpoint>().is_err());
        assert!("bind://:5555".parse::<Endpoint>().is_err());
        assert!("connect://host:notaport".parse::<Endpoint>().is_err());
    }
}
