//! Interactive secret entry.

use std::io::{self, IsTerminal};

use tracing::debug;

/// Source of secrets typed by a person.
///
/// `Ok(None)` means no secret can be obtained, e.g. when running unattended.
pub trait SecretPrompt: Send + Sync {
    /// Asks for a secret.
    ///
    /// # Errors
    ///
    /// Returns an error if reading from the terminal fails.
    fn obtain_secret(&self, prompt: &str) -> io::Result<Option<String>>;
}

impl<F> SecretPrompt for F
where
    F: Fn(&str) -> io::Result<Option<String>> + Send + Sync,
{
    fn obtain_secret(&self, prompt: &str) -> io::Result<Option<String>> {
        self(prompt)
    }
}

/// Reads a password from the controlling terminal without echo.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl SecretPrompt for TerminalPrompt {
    fn obtain_secret(&self, prompt: &str) -> io::Result<Option<String>> {
        if !io::stdin().is_terminal() && !io::stderr().is_terminal() {
            debug!("no terminal attached, not prompting");
            return Ok(None);
        }
        let secret = rpassword::prompt_password(prompt)?;
        Ok(Some(secret).filter(|s| !s.is_empty()))
    }
}

/// Never obtains a secret.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrompt;

impl SecretPrompt for NoPrompt {
    fn obtain_secret(&self, _prompt: &str) -> io::Result<Option<String>> {
        Ok(None)
    }
}
