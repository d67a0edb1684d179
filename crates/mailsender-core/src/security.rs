//! Connection security schemes and port defaulting.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Security/encryption mode for the connection to the sending server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Security {
    /// No encryption (not recommended).
    None,
    /// Implicit TLS (connect directly with TLS).
    #[default]
    Ssl,
    /// STARTTLS upgrade after plaintext connect.
    StartTls,
}

impl Security {
    /// All schemes, in canonical-port order.
    pub const ALL: [Self; 3] = [Self::None, Self::Ssl, Self::StartTls];

    /// Canonical port for the security mode.
    #[must_use]
    pub const fn canonical_port(self) -> u16 {
        match self {
            Self::None => 25,
            Self::Ssl => 485,
            Self::StartTls => 587,
        }
    }

    /// Security mode whose canonical port is `port`, if any.
    #[must_use]
    pub const fn for_canonical_port(port: u16) -> Option<Self> {
        match port {
            25 => Some(Self::None),
            485 => Some(Self::Ssl),
            587 => Some(Self::StartTls),
            _ => None,
        }
    }

    /// Configuration keyword for the security mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ssl => "ssl",
            Self::StartTls => "starttls",
        }
    }

    /// Get display name for the security mode.
    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::None => "None (insecure)",
            Self::Ssl => "SSL/TLS",
            Self::StartTls => "STARTTLS",
        }
    }
}

/// Completes a partial `(port, security)` pair.
///
/// - both given: returned unchanged, even when they disagree
/// - only security: its canonical port
/// - only port: the security whose canonical port it is, otherwise SSL
/// - neither: SSL on its canonical port
#[must_use]
pub fn resolve(port: Option<u16>, security: Option<Security>) -> (u16, Security) {
    match (port, security) {
        (Some(port), Some(security)) => {
            if Security::for_canonical_port(port) != Some(security) {
                tracing::debug!(
                    port,
                    security = security.as_str(),
                    "non-canonical port/security pair"
                );
            }
            (port, security)
        }
        (None, Some(security)) => (security.canonical_port(), security),
        (Some(port), None) => (port, Security::for_canonical_port(port).unwrap_or(Security::Ssl)),
        (None, None) => (Security::Ssl.canonical_port(), Security::Ssl),
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a security keyword is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown security mode {0:?} (expected none, ssl or starttls)")]
pub struct ParseSecurityError(String);

impl FromStr for Security {
    type Err = ParseSecurityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "plain" => Ok(Self::None),
            "ssl" | "tls" => Ok(Self::Ssl),
            "starttls" => Ok(Self::StartTls),
            _ => Err(ParseSecurityError(s.to_string())),
        }
    }
}

impl Serialize for Security {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Security {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let keyword = String::deserialize(deserializer)?;
        keyword.parse().map_err(serde::de::Error::custom)
    }
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
    use proptest::prelude::*;

    mod resolve_tests {
        use super::*;

        #[test]
        fn security_only_gets_canonical_port() {
            assert_eq!(resolve(None, Some(Security::StartTls)), (587, Security::StartTls));
            assert_eq!(resolve(None, Some(Security::Ssl)), (485, Security::Ssl));
            assert_eq!(resolve(None, Some(Security::None)), (25, Security::None));
        }

        #[test]
        fn neither_defaults_to_ssl() {
            assert_eq!(resolve(None, None), (485, Security::Ssl));
        }

        #[test]
        fn canonical_port_only() {
            assert_eq!(resolve(Some(587), None), (587, Security::StartTls));
            assert_eq!(resolve(Some(25), None), (25, Security::None));
            assert_eq!(resolve(Some(485), None), (485, Security::Ssl));
        }

        #[test]
        fn unrecognized_port_defaults_to_ssl() {
            assert_eq!(resolve(Some(465), None), (465, Security::Ssl));
            assert_eq!(resolve(Some(2525), None), (2525, Security::Ssl));
        }

        #[test]
        fn inconsistent_pair_passes_through() {
            assert_eq!(
                resolve(Some(25), Some(Security::StartTls)),
                (25, Security::StartTls)
            );
        }
    }

    mod parse_tests {
        use super::*;

        #[test]
        fn keywords() {
            assert_eq!("none".parse::<Security>().unwrap(), Security::None);
            assert_eq!("SSL".parse::<Security>().unwrap(), Security::Ssl);
            assert_eq!("tls".parse::<Security>().unwrap(), Security::Ssl);
            assert_eq!("StartTLS".parse::<Security>().unwrap(), Security::StartTls);
        }

        #[test]
        fn unknown_keyword() {
            assert!("smoke-signals".parse::<Security>().is_err());
        }

        #[test]
        fn yaml_round_trip_uses_keywords() {
            let yaml = serde_yaml::to_string(&Security::StartTls).unwrap();
            assert_eq!(yaml.trim(), "starttls");
            let parsed: Security = serde_yaml::from_str("STARTTLS").unwrap();
            assert_eq!(parsed, Security::StartTls);
        }

        #[test]
        fn display_names() {
            assert_eq!(Security::None.display_name(), "None (insecure)");
            assert_eq!(Security::Ssl.display_name(), "SSL/TLS");
            assert_eq!(Security::StartTls.display_name(), "STARTTLS");
        }
    }

    fn any_security() -> impl Strategy<Value = Security> {
        prop::sample::select(Security::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn explicit_pairs_are_never_changed(port in any::<u16>(), security in any_security()) {
            prop_assert_eq!(resolve(Some(port), Some(security)), (port, security));
        }

        #[test]
        fn port_only_keeps_port(port in any::<u16>()) {
            let (resolved, security) = resolve(Some(port), None);
            prop_assert_eq!(resolved, port);
            if Security::for_canonical_port(port).is_none() {
                prop_assert_eq!(security, Security::Ssl);
            }
        }

        #[test]
        fn security_only_is_consistent(security in any_security()) {
            let (port, resolved) = resolve(None, Some(security));
            prop_assert_eq!(resolved, security);
            prop_assert_eq!(Security::for_canonical_port(port), Some(security));
        }
    }
}
