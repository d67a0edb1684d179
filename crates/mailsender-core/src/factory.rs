//! Sender factory.
//!
//! Turns a sending address into a ready [`MailSender`]: domain settings are
//! looked up, the protocol is resolved, port and security are defaulted and
//! credentials are obtained before the protocol's constructor runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::credentials::{CredentialStore, DEFAULT_LOCK_TIMEOUT, SecretPrompt, TerminalPrompt};
use crate::domain::{ConfigPaths, ConfigSource, DomainConfig, config_file_list};
use crate::registry::{ProtocolRegistry, SenderContext};
use crate::sender::MailSender;
use crate::{Error, Result};

/// Per-call options for [`SenderFactory::create_sender`].
#[derive(Debug, Clone, Default)]
pub struct SenderOptions {
    /// Replaces the built-in domain defaults.
    pub base_config: Option<ConfigSource>,
    /// Highest-precedence domain settings.
    pub overrides: Option<ConfigSource>,
    /// Credentials file to use instead of the default.
    pub creds_file: Option<PathBuf>,
    /// Password to use without consulting the credentials file. Never stored.
    pub password: Option<String>,
    /// Login name to use instead of the stored one or the address. Never stored.
    pub userid: Option<String>,
}

impl SenderOptions {
    /// Options with every field unset.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base configuration.
    #[must_use]
    pub fn base_config(mut self, source: impl Into<ConfigSource>) -> Self {
        self.base_config = Some(source.into());
        self
    }

    /// Sets the override configuration.
    #[must_use]
    pub fn overrides(mut self, source: impl Into<ConfigSource>) -> Self {
        self.overrides = Some(source.into());
        self
    }

    /// Sets the credentials file.
    #[must_use]
    pub fn creds_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.creds_file = Some(path.into());
        self
    }

    /// Sets an explicit password.
    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets an explicit login name.
    #[must_use]
    pub fn userid(mut self, userid: impl Into<String>) -> Self {
        self.userid = Some(userid.into());
        self
    }
}

/// Builds senders from layered configuration and stored credentials.
#[derive(Clone)]
pub struct SenderFactory {
    paths: ConfigPaths,
    registry: ProtocolRegistry,
    prompt: Arc<dyn SecretPrompt>,
    lock_timeout: Duration,
}

impl std::fmt::Debug for SenderFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SenderFactory")
            .field("paths", &self.paths)
            .field("registry", &self.registry)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for SenderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SenderFactory {
    /// Factory using the system configuration directories, the built-in
    /// protocols and the terminal for password prompts.
    #[must_use]
    pub fn new() -> Self {
        Self {
            paths: ConfigPaths::from_system(),
            registry: ProtocolRegistry::new(),
            prompt: Arc::new(TerminalPrompt),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Replaces the configuration directories.
    #[must_use]
    pub fn with_paths(mut self, paths: ConfigPaths) -> Self {
        self.paths = paths;
        self
    }

    /// Replaces the protocol registry.
    #[must_use]
    pub fn with_registry(mut self, registry: ProtocolRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the password prompt.
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl SecretPrompt + 'static) -> Self {
        self.prompt = Arc::new(prompt);
        self
    }

    /// Sets how long to wait for the credentials file lock.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Configuration directories in use.
    #[must_use]
    pub const fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    /// Protocol registry in use.
    #[must_use]
    pub const fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    /// Mutable access to the registry, for registering protocols.
    pub const fn registry_mut(&mut self) -> &mut ProtocolRegistry {
        &mut self.registry
    }

    /// Creates a sender for `address`.
    ///
    /// No connection is made; that happens on each send.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidAddress` if the address is empty or malformed
    /// - `Error::UnknownDomain` if no configuration layer has its domain
    /// - `Error::ProtocolResolution` if the domain's protocol is not registered
    /// - `Error::CredentialsUnavailable` if a password is needed and none can
    ///   be obtained
    /// - configuration, locking and I/O errors from reading the layers and
    ///   the credentials file
    pub fn create_sender(
        &self,
        address: &str,
        options: &SenderOptions,
    ) -> Result<Box<dyn MailSender>> {
        let address = address.trim();
        let domain = domain_of(address)?;

        let config = DomainConfig::load(
            &self.paths,
            options.base_config.as_ref(),
            options.overrides.as_ref(),
        )?;
        let mut descriptor = config.lookup(&domain)?;

        let entry = self.registry.resolve(&descriptor.protocol, &domain)?;
        if entry.normalizes_transport() {
            descriptor.resolve_transport();
        }

        let store = CredentialStore::locate(options.creds_file.as_deref())?
            .with_lock_timeout(self.lock_timeout);
        let credentials = store.resolve(
            address,
            options.password.as_deref(),
            options.userid.as_deref(),
            self.prompt.as_ref(),
            entry.password_required(),
        )?;

        info!(
            address,
            protocol = %descriptor.protocol,
            server = descriptor.server.as_deref().unwrap_or("-"),
            "Creating mail sender"
        );
        entry.build(SenderContext {
            address: address.to_string(),
            descriptor,
            credentials,
            store,
        })
    }

    /// Every configured domain with its server, if it has one.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration layer cannot be loaded.
    pub fn known_domains(
        &self,
        options: &SenderOptions,
    ) -> Result<BTreeMap<String, Option<String>>> {
        let config = DomainConfig::load(
            &self.paths,
            options.base_config.as_ref(),
            options.overrides.as_ref(),
        )?;
        Ok(config.known_domains())
    }

    /// Every file that would be consulted, in resolution order, ending with
    /// the credentials file. Files need not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials path cannot be determined.
    pub fn config_file_list(&self, options: &SenderOptions) -> Result<Vec<PathBuf>> {
        let creds_file = CredentialStore::default_path(options.creds_file.as_deref())?;
        Ok(config_file_list(
            &self.paths,
            options.base_config.as_ref(),
            options.overrides.as_ref(),
            &creds_file,
        ))
    }
}

/// Creates a sender with the default [`SenderFactory`].
///
/// # Errors
///
/// See [`SenderFactory::create_sender`].
pub fn create_sender(address: &str, options: &SenderOptions) -> Result<Box<dyn MailSender>> {
    SenderFactory::new().create_sender(address, options)
}

/// Extracts the lower-cased domain of a sending address.
///
/// # Errors
///
/// Returns `Error::InvalidAddress` unless the address is `local@domain` with
/// both parts non-empty.
pub fn domain_of(address: &str) -> Result<String> {
    if address.is_empty() {
        return Err(Error::InvalidAddress("sender address is empty".into()));
    }
    match address.split_once('@') {
        Some((local, domain))
            if !local.is_empty() && !domain.is_empty() && !domain.contains('@') =>
        {
            debug!(address, domain, "sender domain");
            Ok(domain.to_lowercase())
        }
        _ => Err(Error::InvalidAddress(address.to_string())),
    }
}

/// Credentials file used when none is given explicitly.
///
/// # Errors
///
/// Returns an error if no configuration directory is available.
pub fn default_creds_file() -> Result<PathBuf> {
    CredentialStore::default_path(None::<&Path>)
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
    use crate::credentials::NoPrompt;
    use crate::security::Security;

    #[test]
    fn domain_extraction() {
        assert_eq!(domain_of("Me@Example.COM").unwrap(), "example.com");
        for bad in ["", "plain", "@example.com", "me@", "a@b@c"] {
            assert!(
                matches!(domain_of(bad), Err(Error::InvalidAddress(_))),
                "{bad:?} accepted"
            );
        }
    }

    #[test]
    fn options_builder() {
        let options = SenderOptions::new()
            .creds_file("/tmp/creds.yml")
            .password("pw")
            .userid("login")
            .overrides(PathBuf::from("/tmp/o.yml"));
        assert_eq!(options.creds_file, Some(PathBuf::from("/tmp/creds.yml")));
        assert_eq!(options.password.as_deref(), Some("pw"));
        assert_eq!(options.userid.as_deref(), Some("login"));
        assert_eq!(options.overrides, Some(ConfigSource::path("/tmp/o.yml")));
        assert!(options.base_config.is_none());
    }

    #[test]
    fn builtin_domain_gets_smtp_sender() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SenderFactory::new()
            .with_paths(ConfigPaths::none())
            .with_prompt(NoPrompt);
        let options = SenderOptions::new()
            .creds_file(dir.path().join("creds.yml"))
            .password("app-password");

        let sender = factory.create_sender("someone@gmail.com", &options).unwrap();
        assert_eq!(sender.address(), "someone@gmail.com");
        assert_eq!(sender.service_name(), "smtp");
    }

    #[test]
    fn missing_password_without_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let factory = SenderFactory::new()
            .with_paths(ConfigPaths::none())
            .with_prompt(NoPrompt);
        let options = SenderOptions::new().creds_file(dir.path().join("creds.yml"));

        let err = factory.create_sender("someone@gmail.com", &options).unwrap_err();
        assert!(matches!(err, Error::CredentialsUnavailable(_)));
    }

    #[test]
    fn overrides_reach_known_domains() {
        let factory = SenderFactory::new().with_paths(ConfigPaths::none());
        let options = SenderOptions::new().overrides(
            ConfigSource::from_yaml("gmail.com:\n  server: relay.example.net\n").unwrap(),
        );
        let known = factory.known_domains(&options).unwrap();
        assert_eq!(known["gmail.com"].as_deref(), Some("relay.example.net"));
        assert_eq!(known["aol.com"].as_deref(), Some("smtp.aol.com"));
    }

    #[test]
    fn file_list_ends_with_creds() {
        let factory = SenderFactory::new().with_paths(ConfigPaths::none());
        let options = SenderOptions::new().creds_file("/tmp/creds.yml");
        assert_eq!(
            factory.config_file_list(&options).unwrap(),
            vec![PathBuf::from("/tmp/creds.yml")]
        );
    }

    #[test]
    fn aol_keeps_configured_ssl_port() {
        let config = DomainConfig::load(&ConfigPaths::none(), None, None).unwrap();
        let mut aol = config.lookup("aol.com").unwrap();
        aol.resolve_transport();
        assert_eq!(aol.transport(), Some((465, Security::Ssl)));
    }
}
