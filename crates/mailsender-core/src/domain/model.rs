//! Connection descriptor types.

use std::collections::BTreeMap;
use std::fmt;

use serde_yaml::Value;

use crate::security::{self, Security};
use crate::{Error, Result};

/// Raw key/value fields of one domain entry, as read from a layer.
pub type DomainFields = BTreeMap<String, Value>;

/// Identifies the `MailSender` implementation for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ProtocolId {
    /// Built-in SMTP sender.
    #[default]
    Smtp,
    /// Another symbolic protocol name.
    Named(String),
    /// Load-by-name reference in `module:Name` form.
    Locator {
        /// Module path part.
        module: String,
        /// Implementation name part.
        name: String,
    },
}

impl ProtocolId {
    /// Parses a configured protocol string.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.eq_ignore_ascii_case("smtp") {
            return Self::Smtp;
        }
        match value.split_once(':') {
            Some((module, name)) => Self::Locator {
                module: module.to_string(),
                name: name.to_string(),
            },
            None => Self::Named(value.to_string()),
        }
    }

    /// Returns true for `module:Name` locators.
    #[must_use]
    pub const fn is_locator(&self) -> bool {
        matches!(self, Self::Locator { .. })
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Smtp => f.write_str("smtp"),
            Self::Named(name) => f.write_str(name),
            Self::Locator { module, name } => write!(f, "{module}:{name}"),
        }
    }
}

/// Merged settings for one sending domain.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionDescriptor {
    /// Domain this descriptor was resolved for.
    pub domain: String,
    /// Protocol implementation to use.
    pub protocol: ProtocolId,
    /// Server hostname.
    pub server: Option<String>,
    /// Server port.
    pub port: Option<u16>,
    /// Connection security.
    pub security: Option<Security>,
    /// Protocol-specific fields not understood by the core.
    pub extra: BTreeMap<String, Value>,
}

impl ConnectionDescriptor {
    /// Builds a descriptor from merged raw fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a known field has the wrong type.
    pub fn from_fields(domain: &str, fields: &DomainFields) -> Result<Self> {
        let mut descriptor = Self {
            domain: domain.to_string(),
            ..Self::default()
        };

        for (key, value) in fields {
            match key.as_str() {
                "protocol" => {
                    descriptor.protocol = ProtocolId::parse(string_field(domain, key, value)?);
                }
                "server" => {
                    descriptor.server = Some(string_field(domain, key, value)?.to_string());
                }
                "port" => descriptor.port = Some(port_field(domain, value)?),
                "security" => {
                    let keyword = string_field(domain, key, value)?;
                    let security: Security = keyword
                        .parse()
                        .map_err(|e| Error::Config(format!("{domain}: {e}")))?;
                    descriptor.security = Some(security);
                }
                _ => {
                    descriptor.extra.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(descriptor)
    }

    /// Fills in port and security using the defaulting rules.
    pub fn resolve_transport(&mut self) {
        let (port, security) = security::resolve(self.port, self.security);
        self.port = Some(port);
        self.security = Some(security);
    }

    /// Resolved port and security, if both are present.
    #[must_use]
    pub const fn transport(&self) -> Option<(u16, Security)> {
        match (self.port, self.security) {
            (Some(port), Some(security)) => Some((port, security)),
            _ => None,
        }
    }

    /// Looks up a protocol-specific string field.
    #[must_use]
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

fn string_field<'a>(domain: &str, key: &str, value: &'a Value) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| Error::Config(format!("{domain}: {key} must be a string")))
}

fn port_field(domain: &str, value: &Value) -> Result<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    port.ok_or_else(|| Error::Config(format!("{domain}: port must be a number from 0 to 65535")))
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;

    fn fields(yaml: &str) -> DomainFields {
        serde_yaml::from_str(yaml).unwrap()
    }

    mod protocol_id_tests {
        use super::*;

        #[test]
        fn smtp_is_case_insensitive() {
            assert_eq!(ProtocolId::parse("SMTP"), ProtocolId::Smtp);
            assert_eq!(ProtocolId::parse(" smtp "), ProtocolId::Smtp);
        }

        #[test]
        fn locator_splits_on_first_colon() {
            let id = ProtocolId::parse("senders.custom:OAuthSender");
            assert_eq!(
                id,
                ProtocolId::Locator {
                    module: "senders.custom".into(),
                    name: "OAuthSender".into(),
                }
            );
            assert!(id.is_locator());
            assert_eq!(id.to_string(), "senders.custom:OAuthSender");
        }

        #[test]
        fn other_names_are_symbolic() {
            let id = ProtocolId::parse("gmail");
            assert_eq!(id, ProtocolId::Named("gmail".into()));
            assert!(!id.is_locator());
        }
    }

    #[test]
    fn protocol_defaults_to_smtp() {
        let descriptor =
            ConnectionDescriptor::from_fields("example.com", &fields("server: mx.example.com"))
                .unwrap();
        assert_eq!(descriptor.protocol, ProtocolId::Smtp);
        assert_eq!(descriptor.server.as_deref(), Some("mx.example.com"));
        assert_eq!(descriptor.port, None);
        assert_eq!(descriptor.security, None);
    }

    #[test]
    fn unknown_keys_go_to_extra() {
        let descriptor = ConnectionDescriptor::from_fields(
            "example.com",
            &fields("server: mx.example.com\nport: 2525\nsecurity: STARTTLS\nclient_id: abc"),
        )
        .unwrap();
        assert_eq!(descriptor.port, Some(2525));
        assert_eq!(descriptor.security, Some(Security::StartTls));
        assert_eq!(descriptor.extra_str("client_id"), Some("abc"));
    }

    #[test]
    fn port_as_string_is_accepted() {
        let descriptor =
            ConnectionDescriptor::from_fields("example.com", &fields("port: '587'")).unwrap();
        assert_eq!(descriptor.port, Some(587));
    }

    #[test]
    fn bad_port_is_config_error() {
        let err =
            ConnectionDescriptor::from_fields("example.com", &fields("port: 70000")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn bad_security_is_config_error() {
        let err = ConnectionDescriptor::from_fields("example.com", &fields("security: carrier"))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn resolve_transport_fills_both() {
        let mut descriptor =
            ConnectionDescriptor::from_fields("example.com", &fields("port: 587")).unwrap();
        assert_eq!(descriptor.transport(), None);
        descriptor.resolve_transport();
        assert_eq!(descriptor.transport(), Some((587, Security::StartTls)));
    }
}
