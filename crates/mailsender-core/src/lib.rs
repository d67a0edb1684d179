//! # mailsender-core
//!
//! Sends email from a configured address with as little setup as possible.
//!
//! Given a sending address, the library works out how to reach the mail
//! server for its domain and which credentials to present:
//! - Domain settings merged from built-in defaults, site, environment and
//!   user configuration files, and caller overrides
//! - Port and connection security defaulting
//! - A per-user credentials file, with a password prompt as fallback and
//!   write-back once the server accepts the password
//! - A registry of protocol implementations, with SMTP built in
//!
//! ```no_run
//! use mailsender_core::{OutgoingMessage, SenderOptions, create_sender};
//!
//! # async fn example() -> mailsender_core::Result<()> {
//! let sender = create_sender("me@gmail.com", &SenderOptions::default())?;
//! let message = OutgoingMessage::new("me@gmail.com", "Hello", "Sent with mailsender")
//!     .to("you@example.com");
//! sender.send(&message).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod credentials;
pub mod domain;
mod error;
pub mod factory;
pub mod registry;
pub mod security;
pub mod sender;

pub use credentials::{
    CredentialRecord, CredentialStore, Credentials, NoPrompt, PasswordSource, SecretPrompt,
    TerminalPrompt,
};
pub use domain::{ConfigPaths, ConfigSource, ConnectionDescriptor, DomainConfig, ProtocolId};
pub use error::{Error, Result};
pub use factory::{SenderFactory, SenderOptions, create_sender, default_creds_file, domain_of};
pub use registry::{ProtocolEntry, ProtocolRegistry, SenderContext};
pub use security::Security;
pub use sender::{ComposedMessage, MailSender, OutgoingMessage, SmtpSender};
