//! Protocol registry.
//!
//! Maps protocol identifiers to sender constructors. The set of protocols is
//! fixed by what the application registers; `module:Name` locators must be
//! registered under that exact string before a domain can use them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::credentials::{CredentialStore, Credentials};
use crate::domain::{ConnectionDescriptor, ProtocolId};
use crate::sender::{MailSender, SmtpSender};
use crate::{Error, Result};

/// Everything a protocol constructor receives.
#[derive(Debug, Clone)]
pub struct SenderContext {
    /// Sending address.
    pub address: String,
    /// Merged settings for the address's domain.
    pub descriptor: ConnectionDescriptor,
    /// Resolved credentials.
    pub credentials: Credentials,
    /// Store the credentials came from, for write-back.
    pub store: CredentialStore,
}

type Constructor = dyn Fn(SenderContext) -> Result<Box<dyn MailSender>> + Send + Sync;

/// A registered protocol implementation.
#[derive(Clone)]
pub struct ProtocolEntry {
    constructor: Arc<Constructor>,
    password_required: bool,
    normalizes_transport: bool,
}

impl fmt::Debug for ProtocolEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEntry")
            .field("password_required", &self.password_required)
            .field("normalizes_transport", &self.normalizes_transport)
            .finish_non_exhaustive()
    }
}

impl ProtocolEntry {
    /// Wraps a constructor. The entry requires a password and leaves port and
    /// security untouched until configured otherwise.
    pub fn new<F>(constructor: F) -> Self
    where
        F: Fn(SenderContext) -> Result<Box<dyn MailSender>> + Send + Sync + 'static,
    {
        Self {
            constructor: Arc::new(constructor),
            password_required: true,
            normalizes_transport: false,
        }
    }

    /// The built-in SMTP implementation.
    #[must_use]
    pub fn smtp() -> Self {
        Self::new(|context| Ok(Box::new(SmtpSender::from_context(context)?)))
            .with_transport_normalization(true)
    }

    /// Sets whether credentials resolution must produce a password.
    #[must_use]
    pub const fn with_password_required(mut self, required: bool) -> Self {
        self.password_required = required;
        self
    }

    /// Sets whether port and security are defaulted before construction.
    #[must_use]
    pub const fn with_transport_normalization(mut self, normalize: bool) -> Self {
        self.normalizes_transport = normalize;
        self
    }

    /// True if the protocol authenticates with a password.
    #[must_use]
    pub const fn password_required(&self) -> bool {
        self.password_required
    }

    /// True if port and security are defaulted for this protocol.
    #[must_use]
    pub const fn normalizes_transport(&self) -> bool {
        self.normalizes_transport
    }

    /// Runs the constructor.
    ///
    /// # Errors
    ///
    /// Returns whatever the constructor returns.
    pub fn build(&self, context: SenderContext) -> Result<Box<dyn MailSender>> {
        (self.constructor)(context)
    }
}

/// Known protocol implementations, keyed by protocol identifier.
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    entries: HashMap<String, ProtocolEntry>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolRegistry {
    /// Registry with the built-in `smtp` protocol.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(ProtocolId::Smtp.to_string(), ProtocolEntry::smtp());
        registry
    }

    /// Registry with no protocols at all.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers `entry` under `id` (a symbolic name or `module:Name`),
    /// returning any entry it replaces.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        entry: ProtocolEntry,
    ) -> Option<ProtocolEntry> {
        let key = ProtocolId::parse(&id.into()).to_string();
        self.entries.insert(key, entry)
    }

    /// Returns true if `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &ProtocolId) -> bool {
        self.entries.contains_key(&id.to_string())
    }

    /// Registered identifiers, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Finds the implementation for a domain's protocol.
    ///
    /// # Errors
    ///
    /// Returns `Error::ProtocolResolution` if nothing is registered for `id`.
    pub fn resolve(&self, id: &ProtocolId, domain: &str) -> Result<&ProtocolEntry> {
        let key = id.to_string();
        self.entries.get(&key).ok_or_else(|| {
            let reason = if id.is_locator() {
                "implementation is not registered"
            } else {
                "no implementation specified"
            };
            Error::protocol_resolution(key.clone(), domain, reason)
        })
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
    use async_trait::async_trait;

    use super::*;
    use crate::sender::ComposedMessage;

    #[derive(Debug)]
    struct Null(String);

    #[async_trait]
    impl MailSender for Null {
        fn address(&self) -> &str {
            &self.0
        }

        fn service_name(&self) -> &str {
            "null"
        }

        async fn send(&self, _message: &dyn ComposedMessage) -> Result<()> {
            Ok(())
        }
    }

    fn null_entry() -> ProtocolEntry {
        ProtocolEntry::new(|context| Ok(Box::new(Null(context.address))))
            .with_password_required(false)
    }

    #[test]
    fn smtp_is_builtin() {
        let registry = ProtocolRegistry::new();
        let entry = registry.resolve(&ProtocolId::Smtp, "example.com").unwrap();
        assert!(entry.password_required());
        assert!(entry.normalizes_transport());
        assert_eq!(registry.ids(), vec!["smtp"]);
    }

    #[test]
    fn empty_registry_has_nothing() {
        let registry = ProtocolRegistry::empty();
        assert!(!registry.contains(&ProtocolId::Smtp));
        assert!(registry.resolve(&ProtocolId::Smtp, "example.com").is_err());
    }

    #[test]
    fn registered_locator_resolves() {
        let mut registry = ProtocolRegistry::new();
        assert!(registry.register("tests:Null", null_entry()).is_none());

        let id = ProtocolId::parse("tests:Null");
        let entry = registry.resolve(&id, "example.com").unwrap();
        assert!(!entry.password_required());
        assert!(!entry.normalizes_transport());
        assert_eq!(registry.ids(), vec!["smtp", "tests:Null"]);
    }

    #[test]
    fn unregistered_locator_fails() {
        let registry = ProtocolRegistry::new();
        let err = registry
            .resolve(&ProtocolId::parse("nowhere:Sender"), "bad.server")
            .unwrap_err();
        match err {
            Error::ProtocolResolution {
                protocol,
                domain,
                reason,
            } => {
                assert_eq!(protocol, "nowhere:Sender");
                assert_eq!(domain, "bad.server");
                assert!(reason.contains("not registered"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_name_fails() {
        let registry = ProtocolRegistry::new();
        let err = registry
            .resolve(&ProtocolId::parse("gmail"), "gmail.none.test")
            .unwrap_err();
        assert!(err.to_string().contains("no implementation specified"));
    }

    #[test]
    fn register_smtp_alias_replaces_builtin() {
        let mut registry = ProtocolRegistry::new();
        assert!(registry.register("SMTP", null_entry()).is_some());
        assert!(
            !registry
                .resolve(&ProtocolId::Smtp, "example.com")
                .unwrap()
                .password_required()
        );
    }

    #[test]
    fn entry_builds_sender() {
        let dir = tempfile::tempdir().unwrap();
        let context = SenderContext {
            address: "me@example.com".into(),
            descriptor: ConnectionDescriptor::default(),
            credentials: Credentials::anonymous("me@example.com"),
            store: CredentialStore::open(dir.path().join("creds.yml")).unwrap(),
        };
        let sender = null_entry().build(context).unwrap();
        assert_eq!(sender.address(), "me@example.com");
        assert_eq!(sender.service_name(), "null");
    }
}
