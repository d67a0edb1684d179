//! Integration tests for sender creation.
//!
//! Protocols are replaced by a recording implementation so the resolved
//! settings and credentials can be inspected without a mail server.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use mailsender_core::sender::{Delivery, DeliveryError, SmtpTransport};
use mailsender_core::{
    ComposedMessage, ConfigPaths, ConfigSource, CredentialStore, Error, MailSender, NoPrompt,
    OutgoingMessage, PasswordSource, ProtocolEntry, ProtocolRegistry, Result, Security,
    SenderContext, SenderFactory, SenderOptions, SmtpSender,
};

/// Sender that records the context it was built from.
#[derive(Debug)]
struct RecordingSender {
    address: String,
}

#[async_trait]
impl MailSender for RecordingSender {
    fn address(&self) -> &str {
        &self.address
    }

    fn service_name(&self) -> &str {
        "recorder"
    }

    async fn send(&self, _message: &dyn ComposedMessage) -> Result<()> {
        Ok(())
    }
}

type Captured = Arc<Mutex<Vec<SenderContext>>>;

fn recording_entry(captured: &Captured) -> ProtocolEntry {
    let captured = Arc::clone(captured);
    ProtocolEntry::new(move |context: SenderContext| {
        let address = context.address.clone();
        captured.lock().unwrap().push(context);
        Ok(Box::new(RecordingSender { address }))
    })
}

fn fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/mailsender_domains.yml")
}

/// Factory isolated from the machine's configuration, with `recorder:RecordingSender`
/// registered and `smtp` replaced by a recorder that still defaults port and security.
fn factory(captured: &Captured) -> SenderFactory {
    let mut registry = ProtocolRegistry::empty();
    registry.register(
        "recorder:RecordingSender",
        recording_entry(captured).with_password_required(false),
    );
    registry.register(
        "smtp",
        recording_entry(captured).with_transport_normalization(true),
    );
    SenderFactory::new()
        .with_paths(ConfigPaths::none())
        .with_registry(registry)
        .with_prompt(NoPrompt)
}

fn options(dir: &Path) -> SenderOptions {
    SenderOptions::new()
        .base_config(fixture())
        .creds_file(dir.join("creds").join("mailsender_creds.yml"))
}

fn last(captured: &Captured) -> SenderContext {
    captured.lock().unwrap().last().cloned().unwrap()
}

#[test]
fn registered_locator_builds_sender() {
    let dir = tempfile::tempdir().unwrap();
    let captured = Captured::default();

    let sender = factory(&captured)
        .create_sender("someone@base.com", &options(dir.path()))
        .unwrap();
    assert_eq!(sender.address(), "someone@base.com");
    assert_eq!(sender.service_name(), "recorder");

    let context = last(&captured);
    assert_eq!(context.descriptor.domain, "base.com");
    assert_eq!(context.descriptor.extra_str("tag"), Some("base"));
    // Not an SMTP-style protocol: nothing defaulted, no password demanded.
    assert_eq!(context.descriptor.transport(), None);
    assert_eq!(context.credentials.source, PasswordSource::Absent);
    assert_eq!(context.credentials.userid, "someone@base.com");
}

#[test]
fn unregistered_locator_is_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = factory(&Captured::default())
        .create_sender("someone@bad.server", &options(dir.path()))
        .unwrap_err();
    assert!(
        matches!(&err, Error::ProtocolResolution { domain, .. } if domain == "bad.server"),
        "{err}"
    );
}

#[test]
fn unknown_protocol_name_is_resolution_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = factory(&Captured::default())
        .create_sender("someone@gmail.none.test", &options(dir.path()))
        .unwrap_err();
    assert!(matches!(err, Error::ProtocolResolution { .. }));
    assert!(err.to_string().contains("no implementation specified"));
}

#[test]
fn resolution_fails_before_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let opts = options(dir.path());
    let _ = factory(&Captured::default()).create_sender("someone@bad.server", &opts);
    assert!(!opts.creds_file.unwrap().exists());
}

#[test]
fn unknown_domain() {
    let dir = tempfile::tempdir().unwrap();
    let err = factory(&Captured::default())
        .create_sender("someone@nowhere.test", &options(dir.path()))
        .unwrap_err();
    assert!(matches!(err, Error::UnknownDomain(d) if d == "nowhere.test"));
}

#[test]
fn base_config_hides_builtins() {
    let dir = tempfile::tempdir().unwrap();
    let err = factory(&Captured::default())
        .create_sender("someone@gmail.com", &options(dir.path()))
        .unwrap_err();
    assert!(matches!(err, Error::UnknownDomain(_)));
}

#[test]
fn empty_sender_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let err = factory(&Captured::default())
        .create_sender("", &options(dir.path()))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidAddress(_)));
}

#[test]
fn non_canonical_port_defaults_to_ssl() {
    let dir = tempfile::tempdir().unwrap();
    let captured = Captured::default();
    factory(&captured)
        .create_sender("me@relay.test", &options(dir.path()).password("pw"))
        .unwrap();
    assert_eq!(
        last(&captured).descriptor.transport(),
        Some((2525, Security::Ssl))
    );
}

#[test]
fn domain_match_ignores_case() {
    let dir = tempfile::tempdir().unwrap();
    let captured = Captured::default();
    factory(&captured)
        .create_sender("me@MIXED.case.TEST", &options(dir.path()).password("pw"))
        .unwrap();
    let descriptor = last(&captured).descriptor;
    assert_eq!(descriptor.server.as_deref(), Some("mx.mixed.case.test"));
    assert_eq!(descriptor.transport(), Some((587, Security::StartTls)));
}

#[test]
fn inline_base_matches_file_base() {
    let dir = tempfile::tempdir().unwrap();
    let captured = Captured::default();
    let text = std::fs::read_to_string(fixture()).unwrap();
    let inline = options(dir.path())
        .base_config(ConfigSource::from_yaml(&text).unwrap())
        .password("pw");

    factory(&captured)
        .create_sender("me@relay.test", &inline)
        .unwrap();
    factory(&captured)
        .create_sender("me@relay.test", &options(dir.path()).password("pw"))
        .unwrap();

    let contexts = captured.lock().unwrap();
    assert_eq!(contexts[0].descriptor, contexts[1].descriptor);
}

#[test]
fn overrides_change_one_field() {
    let dir = tempfile::tempdir().unwrap();
    let captured = Captured::default();
    let opts = options(dir.path())
        .overrides(ConfigSource::from_yaml("relay.test:\n  security: starttls\n").unwrap())
        .password("pw");

    factory(&captured).create_sender("me@relay.test", &opts).unwrap();
    let descriptor = last(&captured).descriptor;
    assert_eq!(descriptor.server.as_deref(), Some("relay.test"));
    assert_eq!(descriptor.transport(), Some((2525, Security::StartTls)));
}

#[test]
fn missing_password_without_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let err = factory(&Captured::default())
        .create_sender("me@relay.test", &options(dir.path()))
        .unwrap_err();
    assert!(matches!(err, Error::CredentialsUnavailable(a) if a == "me@relay.test"));
}

#[test]
fn prompted_password_reaches_sender_unsaved() {
    let dir = tempfile::tempdir().unwrap();
    let captured = Captured::default();
    let opts = options(dir.path());
    let factory = factory(&captured)
        .with_prompt(|_: &str| -> std::io::Result<Option<String>> { Ok(Some("typed".into())) });

    factory.create_sender("me@relay.test", &opts).unwrap();

    let credentials = last(&captured).credentials;
    assert_eq!(credentials.login(), Some(("me@relay.test", "typed")));
    assert!(credentials.is_unverified());
    assert!(!opts.creds_file.unwrap().exists());
}

#[test]
fn stored_credentials_used() {
    let dir = tempfile::tempdir().unwrap();
    let captured = Captured::default();
    let opts = options(dir.path());
    let creds_file = opts.creds_file.clone().unwrap();
    std::fs::create_dir_all(creds_file.parent().unwrap()).unwrap();
    std::fs::write(
        &creds_file,
        "me@relay.test:\n  userid: relay-login\n  password: stored-pw\n",
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&creds_file, std::fs::Permissions::from_mode(0o600)).unwrap();
    }

    factory(&captured).create_sender("me@relay.test", &opts).unwrap();
    let credentials = last(&captured).credentials;
    assert_eq!(credentials.login(), Some(("relay-login", "stored-pw")));
    assert_eq!(credentials.source, PasswordSource::Stored);

    // Explicit values win and leave the file alone.
    let before = std::fs::read_to_string(&creds_file).unwrap();
    factory(&captured)
        .create_sender(
            "me@relay.test",
            &opts.clone().userid("other-login").password("given"),
        )
        .unwrap();
    let credentials = last(&captured).credentials;
    assert_eq!(credentials.login(), Some(("other-login", "given")));
    assert_eq!(std::fs::read_to_string(&creds_file).unwrap(), before);
}

#[test]
fn known_domains_and_file_list() {
    let dir = tempfile::tempdir().unwrap();
    let factory = factory(&Captured::default());
    let opts = options(dir.path());

    let known = factory.known_domains(&opts).unwrap();
    assert_eq!(known["relay.test"].as_deref(), Some("relay.test"));
    assert_eq!(known["base.com"], None);
    assert!(known.contains_key("mixed.case.test"));

    let files = factory.config_file_list(&opts).unwrap();
    assert_eq!(files, vec![fixture(), opts.creds_file.unwrap()]);
}

/// SMTP transport that accepts or refuses the login and counts deliveries.
#[derive(Default)]
struct StubServer {
    refuse_login: bool,
    logins: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl SmtpTransport for StubServer {
    async fn deliver(&self, delivery: &Delivery<'_>) -> std::result::Result<(), DeliveryError> {
        if self.refuse_login {
            return Err(DeliveryError::before_auth(Error::AuthenticationFailure(
                "535 5.7.8 authentication failed".into(),
            )));
        }
        if let Some((userid, password)) = delivery.login {
            self.logins
                .lock()
                .unwrap()
                .push((userid.to_string(), password.to_string()));
        }
        Ok(())
    }
}

/// Factory whose `smtp` entry is a real [`SmtpSender`] talking to `server`,
/// with a prompt that always answers `secret`.
fn smtp_factory(server: &Arc<StubServer>) -> SenderFactory {
    let server = Arc::clone(server);
    let mut registry = ProtocolRegistry::empty();
    registry.register(
        "smtp",
        ProtocolEntry::new(move |context: SenderContext| {
            let sender = SmtpSender::with_transport(context, server.clone())?;
            Ok(Box::new(sender))
        })
        .with_transport_normalization(true),
    );
    SenderFactory::new()
        .with_paths(ConfigPaths::none())
        .with_registry(registry)
        .with_prompt(|_: &str| -> std::io::Result<Option<String>> { Ok(Some("secret".into())) })
}

fn relay_message() -> OutgoingMessage {
    OutgoingMessage::new("me@relay.test", "Hello", "Body").to("you@example.org")
}

#[tokio::test]
async fn prompted_password_saved_after_send() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(StubServer::default());
    let opts = options(dir.path());
    let creds_file = opts.creds_file.clone().unwrap();

    let sender = smtp_factory(&server)
        .create_sender("me@relay.test", &opts)
        .unwrap();
    assert!(!creds_file.exists());
    sender.send(&relay_message()).await.unwrap();

    assert_eq!(
        *server.logins.lock().unwrap(),
        vec![("me@relay.test".to_string(), "secret".to_string())]
    );
    let record = CredentialStore::open(&creds_file)
        .unwrap()
        .get("me@relay.test")
        .unwrap()
        .unwrap();
    assert_eq!(record.password.as_deref(), Some("secret"));

    // The next sender finds the stored password and never prompts.
    let sender = smtp_factory(&server)
        .with_prompt(NoPrompt)
        .create_sender("me@relay.test", &opts)
        .unwrap();
    sender.send(&relay_message()).await.unwrap();
    assert_eq!(server.logins.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn refused_login_leaves_credentials_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let server = Arc::new(StubServer {
        refuse_login: true,
        ..StubServer::default()
    });
    let opts = options(dir.path());
    let creds_file = opts.creds_file.clone().unwrap();
    CredentialStore::open(&creds_file)
        .unwrap()
        .remember("other@relay.test", "theirs")
        .unwrap();
    let before = std::fs::read(&creds_file).unwrap();

    let sender = smtp_factory(&server)
        .create_sender("me@relay.test", &opts)
        .unwrap();
    let err = sender.send(&relay_message()).await.unwrap_err();

    assert!(matches!(err, Error::AuthenticationFailure(_)), "{err}");
    assert_eq!(std::fs::read(&creds_file).unwrap(), before);
}
