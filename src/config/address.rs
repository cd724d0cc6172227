//! Backend addresses: TCP `host:port` or `unix:/path/to.sock`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::Display;

/// A backend server address. Unix socket paths are marked by a `unix:`
/// prefix in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Tcp(String),
    Unix(String),
}

impl Address {
    pub fn parse(raw: &str) -> Address {
        match raw.strip_prefix("unix:") {
            Some(path) => Address::Unix(path.to_string()),
            None => Address::Tcp(raw.to_string()),
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Address::Unix(_))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Tcp(addr) => write!(f, "{addr}"),
            Address::Unix(path) => write!(f, "unix:{path}"),
        }
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Address, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Address::parse(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        assert_eq!(
            Address::parse("10.0.0.1:3306"),
            Address::Tcp("10.0.0.1:3306".into())
        );
    }

    #[test]
    fn test_parse_unix() {
        let addr = Address::parse("unix:/var/run/mysqld.sock");
        assert_eq!(addr, Address::Unix("/var/run/mysqld.sock".into()));
        assert!(addr.is_unix());
        assert_eq!(addr.to_string(), "unix:/var/run/mysqld.sock");
    }
}
