//! Mail senders.
//!
//! A [`MailSender`] sends already-composed messages from one address. The
//! message itself is opaque apart from its envelope addresses and wire bytes.

mod smtp;

pub use smtp::{Delivery, DeliveryError, LettreTransport, SmtpSender, SmtpTransport};

use std::fmt;

use async_trait::async_trait;

use crate::Result;

/// A message ready to send.
pub trait ComposedMessage: Send + Sync {
    /// `From` address, if the message carries one.
    fn sender(&self) -> Option<&str>;

    /// `To` recipients.
    fn to(&self) -> Vec<&str>;

    /// `Cc` recipients.
    fn cc(&self) -> Vec<&str>;

    /// Blind recipients; not part of the formatted message.
    fn bcc(&self) -> Vec<&str>;

    /// The message as sent on the wire.
    fn formatted(&self) -> Vec<u8>;

    /// Every envelope recipient, without duplicates, in `to`, `cc`, `bcc` order.
    fn all_recipients(&self) -> Vec<&str> {
        let mut recipients: Vec<&str> = Vec::new();
        for addr in self.to().into_iter().chain(self.cc()).chain(self.bcc()) {
            if !recipients.contains(&addr) {
                recipients.push(addr);
            }
        }
        recipients
    }
}

/// Sends mail from one configured address.
#[async_trait]
pub trait MailSender: fmt::Debug + Send + Sync {
    /// Sending address this sender was created for.
    fn address(&self) -> &str;

    /// Short name of the protocol implementation, e.g. `smtp`.
    fn service_name(&self) -> &str;

    /// Sends one message. Any connection is opened for this call and closed
    /// before it returns.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be delivered to every recipient.
    async fn send(&self, message: &dyn ComposedMessage) -> Result<()>;
}

/// A plain-text email message.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    /// Sender address.
    pub from: String,
    /// Recipient addresses.
    pub to: Vec<String>,
    /// CC addresses.
    pub cc: Vec<String>,
    /// BCC addresses.
    pub bcc: Vec<String>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body: String,
}

impl OutgoingMessage {
    /// Creates a new outgoing message.
    #[must_use]
    pub fn new(
        from: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Adds a recipient.
    #[must_use]
    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.to.push(recipient.into());
        self
    }

    /// Adds a CC recipient.
    #[must_use]
    pub fn cc(mut self, recipient: impl Into<String>) -> Self {
        self.cc.push(recipient.into());
        self
    }

    /// Adds a BCC recipient.
    #[must_use]
    pub fn bcc(mut self, recipient: impl Into<String>) -> Self {
        self.bcc.push(recipient.into());
        self
    }

    /// Formats the message per RFC 5322 with CRLF line endings.
    #[must_use]
    pub fn to_rfc5322(&self) -> String {
        use std::fmt::Write;

        let mut message = String::new();
        let _ = write!(message, "From: {}\r\n", self.from);
        if !self.to.is_empty() {
            let _ = write!(message, "To: {}\r\n", self.to.join(", "));
        }
        if !self.cc.is_empty() {
            let _ = write!(message, "Cc: {}\r\n", self.cc.join(", "));
        }
        let _ = write!(message, "Subject: {}\r\n", self.subject);
        message.push_str("MIME-Version: 1.0\r\n");
        message.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        message.push_str("Content-Transfer-Encoding: 8bit\r\n");
        message.push_str("\r\n");

        for line in self.body.lines() {
            message.push_str(line);
            message.push_str("\r\n");
        }
        message
    }
}

impl ComposedMessage for OutgoingMessage {
    fn sender(&self) -> Option<&str> {
        Some(self.from.as_str()).filter(|from| !from.is_empty())
    }

    fn to(&self) -> Vec<&str> {
        self.to.iter().map(String::as_str).collect()
    }

    fn cc(&self) -> Vec<&str> {
        self.cc.iter().map(String::as_str).collect()
    }

    fn bcc(&self) -> Vec<&str> {
        self.bcc.iter().map(String::as_str).collect()
    }

    fn formatted(&self) -> Vec<u8> {
        self.to_rfc5322().into_bytes()
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

    fn message() -> OutgoingMessage {
        OutgoingMessage::new("me@example.com", "Hello", "line one\nline two")
            .to("a@example.com")
            .cc("b@example.com")
            .bcc("c@example.com")
    }

    #[test]
    fn headers_and_body() {
        let text = message().to_rfc5322();
        assert!(text.starts_with("From: me@example.com\r\n"));
        assert!(text.contains("To: a@example.com\r\n"));
        assert!(text.contains("Cc: b@example.com\r\n"));
        assert!(text.contains("Subject: Hello\r\n"));
        assert!(text.ends_with("\r\n\r\nline one\r\nline two\r\n"));
    }

    #[test]
    fn bcc_not_in_headers() {
        let text = message().to_rfc5322();
        assert!(!text.contains("c@example.com"));
        assert!(!text.contains("Bcc"));
    }

    #[test]
    fn recipients_are_union_of_all_fields() {
        let msg = message().cc("a@example.com");
        assert_eq!(
            msg.all_recipients(),
            vec!["a@example.com", "b@example.com", "c@example.com"]
        );
    }

    #[test]
    fn empty_from_is_no_sender() {
        let msg = OutgoingMessage::new("", "s", "b");
        assert_eq!(msg.sender(), None);
        assert_eq!(message().sender(), Some("me@example.com"));
    }
}
