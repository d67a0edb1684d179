//! SMTP sender.
//!
//! Connection handling is delegated to an [`SmtpTransport`]; the production
//! transport is built on `lettre` and opens a fresh connection per message.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use tracing::{debug, info, warn};

use super::{ComposedMessage, MailSender};
use crate::credentials::{CredentialStore, Credentials};
use crate::registry::SenderContext;
use crate::security::{self, Security};
use crate::{Error, Result};

/// Reply codes that mean the server refused the login.
const AUTH_FAILURE_CODES: [u16; 4] = [530, 534, 535, 538];

/// One message on its way to an SMTP server.
#[derive(Clone, PartialEq, Eq)]
pub struct Delivery<'a> {
    /// Server hostname.
    pub server: &'a str,
    /// Server port.
    pub port: u16,
    /// Connection security.
    pub security: Security,
    /// `(userid, password)` to authenticate with, if any.
    pub login: Option<(&'a str, &'a str)>,
    /// Envelope sender.
    pub envelope_from: &'a str,
    /// Envelope recipients.
    pub recipients: Vec<&'a str>,
    /// Message bytes.
    pub message: &'a [u8],
}

impl std::fmt::Debug for Delivery<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("userid", &self.login.map(|(userid, _)| userid))
            .field("envelope_from", &self.envelope_from)
            .field("recipients", &self.recipients)
            .field("message_len", &self.message.len())
            .finish()
    }
}

/// A failed [`Delivery`].
#[derive(Debug)]
pub struct DeliveryError {
    /// True if the server accepted the login before the failure.
    pub authenticated: bool,
    /// What went wrong.
    pub error: Error,
}

impl DeliveryError {
    /// Failure before or during authentication.
    #[must_use]
    pub const fn before_auth(error: Error) -> Self {
        Self {
            authenticated: false,
            error,
        }
    }

    /// Failure after the server accepted the login.
    #[must_use]
    pub const fn after_auth(error: Error) -> Self {
        Self {
            authenticated: true,
            error,
        }
    }
}

impl From<Error> for DeliveryError {
    fn from(error: Error) -> Self {
        Self::before_auth(error)
    }
}

/// Carries a [`Delivery`] to the server.
#[async_trait]
pub trait SmtpTransport: Send + Sync {
    /// Connects, authenticates if a login is given, transmits the message and
    /// disconnects. On success the login, if any, was accepted.
    ///
    /// # Errors
    ///
    /// The error carries `Error::AuthenticationFailure` if the server rejects
    /// the login, `Error::InvalidMessage` for unusable envelope addresses and
    /// `Error::Transport` for everything else, plus whether the login had
    /// already been accepted.
    async fn deliver(&self, delivery: &Delivery<'_>) -> std::result::Result<(), DeliveryError>;
}

/// [`SmtpTransport`] backed by `lettre`.
///
/// With a login, a first connection only authenticates; the message goes out
/// on a second one. This tells a rejected login apart from a rejected message.
#[derive(Debug, Clone, Copy, Default)]
pub struct LettreTransport;

#[async_trait]
impl SmtpTransport for LettreTransport {
    async fn deliver(&self, delivery: &Delivery<'_>) -> std::result::Result<(), DeliveryError> {
        let envelope = envelope(delivery)?;

        let builder = match delivery.security {
            Security::Ssl => AsyncSmtpTransport::<Tokio1Executor>::relay(delivery.server),
            Security::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(delivery.server)
            }
            Security::None => Ok(AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(
                delivery.server,
            )),
        }
        .map_err(|e| Error::Transport(format!("{}: {e}", delivery.server)))?;

        let mut builder = builder.port(delivery.port);
        if let Some((userid, password)) = delivery.login {
            builder = builder.credentials(SmtpCredentials::new(
                userid.to_string(),
                password.to_string(),
            ));
        }
        let transport = builder.build();

        debug!(
            server = delivery.server,
            port = delivery.port,
            security = %delivery.security,
            "Connecting to SMTP server"
        );
        let authenticated = if delivery.login.is_some() {
            match transport.test_connection().await {
                Ok(true) => true,
                Ok(false) => {
                    return Err(DeliveryError::before_auth(Error::Transport(format!(
                        "{}: connection closed during login",
                        delivery.server
                    ))));
                }
                Err(e) => return Err(DeliveryError::before_auth(classify(&e))),
            }
        } else {
            false
        };
        if authenticated {
            debug!(server = delivery.server, "SMTP login accepted");
        }

        transport
            .send_raw(&envelope, delivery.message)
            .await
            .map_err(|e| {
                let error = classify(&e);
                if authenticated && !matches!(error, Error::AuthenticationFailure(_)) {
                    DeliveryError::after_auth(error)
                } else {
                    DeliveryError::before_auth(error)
                }
            })?;
        Ok(())
    }
}

fn envelope(delivery: &Delivery<'_>) -> Result<Envelope> {
    let parse = |addr: &str| {
        addr.parse::<Address>()
            .map_err(|e| Error::InvalidMessage(format!("{addr}: {e}")))
    };
    let from = parse(delivery.envelope_from)?;
    let to = delivery
        .recipients
        .iter()
        .map(|addr| parse(addr))
        .collect::<Result<Vec<_>>>()?;
    Envelope::new(Some(from), to).map_err(|e| Error::InvalidMessage(e.to_string()))
}

fn classify(err: &lettre::transport::smtp::Error) -> Error {
    let code = err
        .status()
        .and_then(|code| code.to_string().parse::<u16>().ok());
    match code {
        Some(code) if is_auth_failure(code) => Error::AuthenticationFailure(err.to_string()),
        _ => Error::Transport(err.to_string()),
    }
}

fn is_auth_failure(code: u16) -> bool {
    AUTH_FAILURE_CODES.contains(&code)
}

/// Sends mail through an SMTP server.
pub struct SmtpSender {
    address: String,
    server: String,
    port: u16,
    security: Security,
    credentials: Credentials,
    store: CredentialStore,
    transport: Arc<dyn SmtpTransport>,
    password_saved: AtomicBool,
}

impl std::fmt::Debug for SmtpSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSender")
            .field("address", &self.address)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("security", &self.security)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl SmtpSender {
    /// Creates a sender using [`LettreTransport`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the domain has no server configured.
    pub fn from_context(context: SenderContext) -> Result<Self> {
        Self::with_transport(context, Arc::new(LettreTransport))
    }

    /// Creates a sender delivering through `transport`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the domain has no server configured.
    pub fn with_transport(
        context: SenderContext,
        transport: Arc<dyn SmtpTransport>,
    ) -> Result<Self> {
        let SenderContext {
            address,
            descriptor,
            credentials,
            store,
        } = context;

        let server = descriptor.server.clone().ok_or_else(|| {
            Error::Config(format!("no server configured for domain {}", descriptor.domain))
        })?;
        let (port, security) = descriptor
            .transport()
            .unwrap_or_else(|| security::resolve(descriptor.port, descriptor.security));

        Ok(Self {
            address,
            server,
            port,
            security,
            credentials,
            store,
            transport,
            password_saved: AtomicBool::new(false),
        })
    }

    /// Server hostname.
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Server port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Connection security.
    #[must_use]
    pub const fn security(&self) -> Security {
        self.security
    }

    /// Credentials presented to the server.
    #[must_use]
    pub const fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    fn save_verified_password(&self) -> Result<()> {
        if !self.credentials.is_unverified() || self.password_saved.load(Ordering::Acquire) {
            return Ok(());
        }
        if let Some(password) = self.credentials.password.as_deref() {
            self.store.remember(&self.address, password)?;
        }
        self.password_saved.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl MailSender for SmtpSender {
    fn address(&self) -> &str {
        &self.address
    }

    fn service_name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, message: &dyn ComposedMessage) -> Result<()> {
        let recipients = message.all_recipients();
        if recipients.is_empty() {
            return Err(Error::InvalidMessage("no recipients specified".into()));
        }
        let bytes = message.formatted();

        let delivery = Delivery {
            server: &self.server,
            port: self.port,
            security: self.security,
            login: self.credentials.login(),
            envelope_from: message.sender().unwrap_or(&self.address),
            recipients,
            message: &bytes,
        };
        let recipient_count = delivery.recipients.len();

        match self.transport.deliver(&delivery).await {
            Ok(()) => {
                info!(
                    address = %self.address,
                    server = %self.server,
                    recipients = recipient_count,
                    "Message sent"
                );
                // Already delivered: a failed save must not look retryable.
                self.save_verified_password()
                    .map_err(|source| Error::PasswordNotSaved {
                        source: Box::new(source),
                    })
            }
            Err(failure) => {
                if failure.authenticated
                    && let Err(e) = self.save_verified_password()
                {
                    warn!(address = %self.address, "Failed to save verified password: {e}");
                }
                Err(failure.error)
            }
        }
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
    use std::path::Path;
    use std::sync::Mutex;

    use super::*;
    use crate::credentials::PasswordSource;
    use crate::domain::{ConnectionDescriptor, ProtocolId};
    use crate::sender::OutgoingMessage;

    const ADDRESS: &str = "me@example.com";

    #[derive(Debug, Clone, PartialEq)]
    struct Recorded {
        server: String,
        port: u16,
        security: Security,
        login: Option<(String, String)>,
        envelope_from: String,
        recipients: Vec<String>,
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    enum Reply {
        #[default]
        Accept,
        RejectLogin,
        RejectRecipient,
    }

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<Recorded>>,
        reply: Reply,
    }

    impl MockTransport {
        fn replying(reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                reply,
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl SmtpTransport for MockTransport {
        async fn deliver(
            &self,
            delivery: &Delivery<'_>,
        ) -> std::result::Result<(), DeliveryError> {
            match self.reply {
                Reply::RejectLogin => {
                    return Err(DeliveryError::before_auth(Error::AuthenticationFailure(
                        "535 5.7.8 bad credentials".into(),
                    )));
                }
                Reply::RejectRecipient => {
                    return Err(DeliveryError::after_auth(Error::Transport(
                        "550 5.1.1 mailbox unavailable".into(),
                    )));
                }
                Reply::Accept => {}
            }
            self.sent.lock().unwrap().push(Recorded {
                server: delivery.server.to_string(),
                port: delivery.port,
                security: delivery.security,
                login: delivery
                    .login
                    .map(|(u, p)| (u.to_string(), p.to_string())),
                envelope_from: delivery.envelope_from.to_string(),
                recipients: delivery.recipients.iter().map(ToString::to_string).collect(),
            });
            Ok(())
        }
    }

    fn descriptor() -> ConnectionDescriptor {
        ConnectionDescriptor {
            domain: "example.com".into(),
            protocol: ProtocolId::Smtp,
            server: Some("smtp.example.com".into()),
            port: Some(587),
            security: Some(Security::StartTls),
            ..ConnectionDescriptor::default()
        }
    }

    fn credentials(password: &str, source: PasswordSource) -> Credentials {
        Credentials {
            userid: ADDRESS.into(),
            password: Some(password.into()),
            source,
            extra: std::collections::BTreeMap::new(),
        }
    }

    fn sender(
        dir: &Path,
        credentials: Credentials,
        transport: Arc<MockTransport>,
    ) -> (SmtpSender, CredentialStore) {
        let store = CredentialStore::open(dir.join("creds.yml")).unwrap();
        let context = SenderContext {
            address: ADDRESS.into(),
            descriptor: descriptor(),
            credentials,
            store: store.clone(),
        };
        (SmtpSender::with_transport(context, transport).unwrap(), store)
    }

    fn message() -> OutgoingMessage {
        OutgoingMessage::new(ADDRESS, "Hi", "Body").to("you@example.org")
    }

    #[tokio::test]
    async fn delivers_with_resolved_settings() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default());
        let (sender, _) = sender(
            dir.path(),
            credentials("pw", PasswordSource::Stored),
            transport.clone(),
        );

        sender
            .send(&message().cc("cc@example.org").bcc("hidden@example.org"))
            .await
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(
            sent[0],
            Recorded {
                server: "smtp.example.com".into(),
                port: 587,
                security: Security::StartTls,
                login: Some((ADDRESS.into(), "pw".into())),
                envelope_from: ADDRESS.into(),
                recipients: vec![
                    "you@example.org".into(),
                    "cc@example.org".into(),
                    "hidden@example.org".into(),
                ],
            }
        );
        assert_eq!(sender.service_name(), "smtp");
        assert_eq!(sender.address(), ADDRESS);
    }

    #[tokio::test]
    async fn prompted_password_saved_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default());
        let (sender, store) = sender(
            dir.path(),
            credentials("typed", PasswordSource::Prompted),
            transport,
        );

        assert!(store.get(ADDRESS).unwrap().is_none());
        sender.send(&message()).await.unwrap();
        assert_eq!(
            store.get(ADDRESS).unwrap().unwrap().password.as_deref(),
            Some("typed")
        );
    }

    #[tokio::test]
    async fn rejected_password_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, store) = sender(
            dir.path(),
            credentials("wrong", PasswordSource::Prompted),
            MockTransport::replying(Reply::RejectLogin),
        );

        let err = sender.send(&message()).await.unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailure(_)));
        assert!(!err.is_retryable());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn rejected_password_leaves_existing_file_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, store) = sender(
            dir.path(),
            credentials("wrong", PasswordSource::Prompted),
            MockTransport::replying(Reply::RejectLogin),
        );
        store.remember("other@example.com", "kept").unwrap();
        let before = std::fs::read(store.path()).unwrap();

        sender.send(&message()).await.unwrap_err();
        assert_eq!(std::fs::read(store.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn authenticated_password_saved_when_recipient_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (sender, store) = sender(
            dir.path(),
            credentials("typed", PasswordSource::Prompted),
            MockTransport::replying(Reply::RejectRecipient),
        );

        let err = sender.send(&message()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(ref reply) if reply.starts_with("550")));
        assert_eq!(
            store.get(ADDRESS).unwrap().unwrap().password.as_deref(),
            Some("typed")
        );
    }

    #[tokio::test]
    async fn unsaved_password_after_delivery_is_not_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path().join("creds.yml")).unwrap();
        let transport = Arc::new(MockTransport::default());
        let context = SenderContext {
            address: ADDRESS.into(),
            descriptor: descriptor(),
            credentials: credentials("typed", PasswordSource::Prompted),
            store: store
                .clone()
                .with_lock_timeout(std::time::Duration::from_millis(100)),
        };
        let sender = SmtpSender::with_transport(context, transport.clone()).unwrap();

        let guard = store.lock().unwrap();
        let err = sender.send(&message()).await.unwrap_err();
        drop(guard);

        let Error::PasswordNotSaved { source } = &err else {
            panic!("unexpected error: {err}");
        };
        assert!(matches!(**source, Error::LockContention { .. }));
        assert!(!err.is_retryable());
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        assert!(store.get(ADDRESS).unwrap().is_none());
    }

    #[tokio::test]
    async fn explicit_password_never_saved() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default());
        let (sender, store) = sender(
            dir.path(),
            credentials("given", PasswordSource::Explicit),
            transport,
        );

        sender.send(&message()).await.unwrap();
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn no_recipients_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default());
        let (sender, _) = sender(
            dir.path(),
            credentials("pw", PasswordSource::Stored),
            transport.clone(),
        );

        let err = sender
            .send(&OutgoingMessage::new(ADDRESS, "s", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_from_uses_sending_address() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::default());
        let (sender, _) = sender(
            dir.path(),
            credentials("pw", PasswordSource::Stored),
            transport.clone(),
        );

        sender
            .send(&OutgoingMessage::new("", "s", "b").to("you@example.org"))
            .await
            .unwrap();
        assert_eq!(transport.sent.lock().unwrap()[0].envelope_from, ADDRESS);
    }

    #[test]
    fn missing_server_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let context = SenderContext {
            address: ADDRESS.into(),
            descriptor: ConnectionDescriptor {
                server: None,
                ..descriptor()
            },
            credentials: Credentials::anonymous(ADDRESS),
            store: CredentialStore::open(dir.path().join("creds.yml")).unwrap(),
        };
        assert!(matches!(
            SmtpSender::from_context(context),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn unresolved_descriptor_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let context = SenderContext {
            address: ADDRESS.into(),
            descriptor: ConnectionDescriptor {
                port: None,
                security: None,
                ..descriptor()
            },
            credentials: Credentials::anonymous(ADDRESS),
            store: CredentialStore::open(dir.path().join("creds.yml")).unwrap(),
        };
        let sender = SmtpSender::from_context(context).unwrap();
        assert_eq!((sender.port(), sender.security()), (485, Security::Ssl));
    }

    #[test]
    fn auth_failure_codes() {
        for code in [530, 534, 535, 538] {
            assert!(is_auth_failure(code));
        }
        for code in [421, 450, 550, 554] {
            assert!(!is_auth_failure(code));
        }
    }

    #[test]
    fn envelope_rejects_bad_address() {
        let delivery = Delivery {
            server: "smtp.example.com",
            port: 25,
            security: Security::None,
            login: None,
            envelope_from: ADDRESS,
            recipients: vec!["not an address"],
            message: b"",
        };
        assert!(matches!(envelope(&delivery), Err(Error::InvalidMessage(_))));
    }
}
