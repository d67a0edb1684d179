//! Credentials for sending addresses.
//!
//! A per-user YAML file maps each address to a login name and password.
//! Passwords typed at a prompt are written back only after the server
//! accepts them.

mod prompt;
mod record;
mod store;

pub use prompt::{NoPrompt, SecretPrompt, TerminalPrompt};
pub use record::{CredentialMap, CredentialRecord, Credentials, PasswordSource};
pub use store::{
    CREDS_ENV_VAR, CREDS_FILE_NAME, CredentialStore, CredentialsLock, DEFAULT_LOCK_TIMEOUT,
    resolve_path,
};
