//! Credential record types.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;

/// Stored credentials for one sending address.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Login name; the sending address is used when absent.
    #[serde(
        default,
        deserialize_with = "scalar_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub userid: Option<String>,
    /// Password or app password.
    #[serde(
        default,
        deserialize_with = "scalar_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub password: Option<String>,
    /// Protocol-specific fields.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Reads a scalar as text, so hand-written `password: 12345` or
/// `userid: true` still load.
fn scalar_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(serde::de::Error::custom("expected a plain scalar")),
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("userid", &self.userid)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("extra", &self.extra)
            .finish()
    }
}

/// Contents of a credentials file, keyed by full sending address.
pub type CredentialMap = BTreeMap<String, CredentialRecord>;

/// Where a resolved password came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordSource {
    /// Passed in by the caller; never written to disk.
    Explicit,
    /// Read from the credentials file.
    Stored,
    /// Typed at the prompt; written to disk once a login succeeds with it.
    Prompted,
    /// No password was needed.
    Absent,
}

/// Credentials resolved for one sender.
#[derive(Clone, PartialEq)]
pub struct Credentials {
    /// Login name.
    pub userid: String,
    /// Password, if one was resolved.
    pub password: Option<String>,
    /// Origin of `password`.
    pub source: PasswordSource,
    /// Protocol-specific fields from the stored record.
    pub extra: BTreeMap<String, Value>,
}

impl Credentials {
    /// Credentials with only a login name.
    #[must_use]
    pub fn anonymous(userid: impl Into<String>) -> Self {
        Self {
            userid: userid.into(),
            password: None,
            source: PasswordSource::Absent,
            extra: BTreeMap::new(),
        }
    }

    /// `(userid, password)` when a password is available.
    #[must_use]
    pub fn login(&self) -> Option<(&str, &str)> {
        self.password
            .as_deref()
            .map(|password| (self.userid.as_str(), password))
    }

    /// True if the password still has to be confirmed by a successful login
    /// before it may be stored.
    #[must_use]
    pub const fn is_unverified(&self) -> bool {
        matches!(self.source, PasswordSource::Prompted)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("userid", &self.userid)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("source", &self.source)
            .field("extra", &self.extra)
            .finish()
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

    #[test]
    fn record_keeps_extra_fields() {
        let record: CredentialRecord =
            serde_yaml::from_str("userid: me\npassword: pw\ntoken_cache: /tmp/t\n").unwrap();
        assert_eq!(record.userid.as_deref(), Some("me"));
        assert_eq!(record.password.as_deref(), Some("pw"));
        assert_eq!(record.extra["token_cache"].as_str(), Some("/tmp/t"));

        let yaml = serde_yaml::to_string(&record).unwrap();
        assert!(yaml.contains("token_cache"));
    }

    #[test]
    fn numeric_scalars_load_as_text() {
        let record: CredentialRecord =
            serde_yaml::from_str("userid: 1001\npassword: 12345\n").unwrap();
        assert_eq!(record.userid.as_deref(), Some("1001"));
        assert_eq!(record.password.as_deref(), Some("12345"));
    }

    #[test]
    fn nested_password_is_rejected() {
        assert!(serde_yaml::from_str::<CredentialRecord>("password: [a, b]\n").is_err());
    }

    #[test]
    fn absent_fields_are_not_written() {
        let record = CredentialRecord {
            password: Some("pw".into()),
            ..CredentialRecord::default()
        };
        let yaml = serde_yaml::to_string(&record).unwrap();
        assert_eq!(yaml.trim(), "password: pw");
    }

    #[test]
    fn debug_hides_password() {
        let record = CredentialRecord {
            password: Some("hunter2".into()),
            ..CredentialRecord::default()
        };
        assert!(!format!("{record:?}").contains("hunter2"));

        let creds = Credentials {
            userid: "me".into(),
            password: Some("hunter2".into()),
            source: PasswordSource::Stored,
            extra: BTreeMap::new(),
        };
        assert!(!format!("{creds:?}").contains("hunter2"));
        assert_eq!(creds.login(), Some(("me", "hunter2")));
        assert!(!creds.is_unverified());
    }

    #[test]
    fn anonymous_has_no_login() {
        let creds = Credentials::anonymous("me@example.com");
        assert_eq!(creds.login(), None);
        assert_eq!(creds.source, PasswordSource::Absent);
    }
}
