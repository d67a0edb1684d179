//! Error types for the core library.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while resolving or using a mail sender.
#[derive(Debug, Error)]
pub enum Error {
    /// Sending address is empty or malformed.
    #[error("Invalid sending address: {0}")]
    InvalidAddress(String),

    /// No configuration layer has an entry for the sending domain.
    #[error("Domain {0} isn't recognized")]
    UnknownDomain(String),

    /// The configured protocol does not resolve to a registered implementation.
    #[error("Protocol {protocol} for email domain {domain} is unknown: {reason}")]
    ProtocolResolution {
        /// Protocol identifier as configured.
        protocol: String,
        /// Domain the protocol was configured for.
        domain: String,
        /// Why resolution failed.
        reason: String,
    },

    /// No password could be obtained (nothing stored, nothing explicit, no prompt).
    #[error("No credentials available for {0}")]
    CredentialsUnavailable(String),

    /// The server rejected the credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    /// Network or protocol failure while talking to the server.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The credentials file stayed locked by another process.
    #[error("Credentials file {} still locked after {waited:?}", path.display())]
    LockContention {
        /// Lock file that could not be acquired.
        path: PathBuf,
        /// How long acquisition was attempted.
        waited: Duration,
    },

    /// The credentials file or its directory is readable or writable by others.
    #[error("Refusing to write {}: permissions {mode:o} are too open", path.display())]
    InsecurePermissions {
        /// Offending file or directory.
        path: PathBuf,
        /// Its permission bits.
        mode: u32,
    },

    /// The message was delivered, but the password it was sent with could not
    /// be written to the credentials file. Sending again would duplicate it.
    #[error("Message delivered, but the verified password was not saved: {source}")]
    PasswordNotSaved {
        /// Why the credentials file could not be updated.
        #[source]
        source: Box<Error>,
    },

    /// The message cannot be sent as composed.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// YAML parse or serialization error.
    #[error("YAML error in {}: {source}", path.display())]
    Yaml {
        /// File being read or written.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_yaml::Error,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates a protocol resolution error.
    #[must_use]
    pub fn protocol_resolution(
        protocol: impl Into<String>,
        domain: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::ProtocolResolution {
            protocol: protocol.into(),
            domain: domain.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the caller may reasonably retry the same operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockContention { .. } | Self::Transport(_))
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        let lock = Error::LockContention {
            path: PathBuf::from("/tmp/creds.yml.lock"),
            waited: Duration::from_secs(1),
        };
        assert!(lock.is_retryable());
        assert!(Error::Transport("reset by peer".into()).is_retryable());
        assert!(!Error::AuthenticationFailure("535".into()).is_retryable());
        assert!(!Error::UnknownDomain("nowhere.invalid".into()).is_retryable());

        let unsaved = Error::PasswordNotSaved {
            source: Box::new(lock),
        };
        assert!(!unsaved.is_retryable());
        assert!(std::error::Error::source(&unsaved).is_some());
    }

    #[test]
    fn protocol_resolution_message() {
        let err = Error::protocol_resolution("nosuch:Sender", "bad.server", "not registered");
        assert_eq!(
            err.to_string(),
            "Protocol nosuch:Sender for email domain bad.server is unknown: not registered"
        );
    }
}
