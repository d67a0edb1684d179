//! `mailsender` - inspect sender configuration and send test messages.
//!
//! ```text
//! mailsender domains                      configured domains and servers
//! mailsender files                        configuration files, in resolution order
//! mailsender send <from> <to> [subject]   send stdin as a plain-text message
//! ```
//!
//! Set `MAILSENDER_CREDS` to use another credentials file and `RUST_LOG` to
//! change log verbosity.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::io::Read;

use anyhow::{Context, bail};
use mailsender_core::{OutgoingMessage, SenderFactory, SenderOptions};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: mailsender domains | files | send <from> <to> [subject]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mailsender=info,mailsender_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let factory = SenderFactory::new();
    let options = SenderOptions::default();

    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["domains"] => list_domains(&factory, &options),
        ["files"] => list_files(&factory, &options),
        ["send", from, to] => send(&factory, &options, from, to, "Test message").await,
        ["send", from, to, subject] => send(&factory, &options, from, to, subject).await,
        _ => bail!(USAGE),
    }
}

fn list_domains(factory: &SenderFactory, options: &SenderOptions) -> anyhow::Result<()> {
    let domains = factory
        .known_domains(options)
        .context("Failed to load domain configuration")?;
    let width = domains.keys().map(String::len).max().unwrap_or(0);
    for (domain, server) in &domains {
        println!("{domain:<width$}  {}", server.as_deref().unwrap_or("-"));
    }
    Ok(())
}

fn list_files(factory: &SenderFactory, options: &SenderOptions) -> anyhow::Result<()> {
    for file in factory.config_file_list(options)? {
        let marker = if file.exists() { "found" } else { "missing" };
        println!("{marker:<7}  {}", file.display());
    }
    Ok(())
}

async fn send(
    factory: &SenderFactory,
    options: &SenderOptions,
    from: &str,
    to: &str,
    subject: &str,
) -> anyhow::Result<()> {
    let sender = factory
        .create_sender(from, options)
        .with_context(|| format!("Cannot send from {from}"))?;

    let mut body = String::new();
    std::io::stdin()
        .read_to_string(&mut body)
        .context("Failed to read message body from stdin")?;

    let message = OutgoingMessage::new(from, subject, body).to(to);
    sender
        .send(&message)
        .await
        .with_context(|| format!("Sending via {} failed", sender.service_name()))?;

    info!("Sent message from {} to {}", from, to);
    Ok(())
}
