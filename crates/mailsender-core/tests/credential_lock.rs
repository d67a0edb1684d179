//! Concurrent access to one credentials file.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use mailsender_core::{CredentialStore, Error};

#[test]
fn concurrent_updates_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("MailSender").join("mailsender_creds.yml");
    let first = CredentialStore::open(&path).unwrap();
    let second = CredentialStore::open(&path).unwrap();

    let (locked_tx, locked_rx) = mpsc::channel();
    let holder = thread::spawn(move || {
        first
            .update(|creds| {
                creds.entry("a@example.com".into()).or_default().password = Some("a".into());
                locked_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(300));
            })
            .unwrap();
    });

    // Wait until the first update holds the lock, then race it.
    locked_rx.recv().unwrap();
    let seen_first = second
        .update(|creds| {
            let seen = creds.contains_key("a@example.com");
            creds.entry("b@example.com".into()).or_default().password = Some("b".into());
            seen
        })
        .unwrap();
    holder.join().unwrap();

    assert!(seen_first, "second update ran before the first was written");
    let creds = second.load().unwrap();
    assert_eq!(creds["a@example.com"].password.as_deref(), Some("a"));
    assert_eq!(creds["b@example.com"].password.as_deref(), Some("b"));
}

#[test]
fn remember_keeps_other_writers_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("creds.yml");
    let store = CredentialStore::open(&path).unwrap();

    let writers: Vec<_> = (0..4)
        .map(|i| {
            let store = store.clone();
            thread::spawn(move || {
                store
                    .remember(&format!("user{i}@example.com"), &format!("pw{i}"))
                    .unwrap();
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let creds = store.load().unwrap();
    assert_eq!(creds.len(), 4);
    for i in 0..4 {
        assert_eq!(
            creds[&format!("user{i}@example.com")].password,
            Some(format!("pw{i}"))
        );
    }
}

#[test]
fn held_lock_reports_contention() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("creds.yml");
    let store = CredentialStore::open(&path).unwrap();
    let impatient = CredentialStore::open(&path)
        .unwrap()
        .with_lock_timeout(Duration::from_millis(150));

    let _guard = store.lock().unwrap();
    let err = impatient
        .remember("me@example.com", "pw")
        .unwrap_err();
    assert!(matches!(err, Error::LockContention { .. }));
    assert!(!path.exists());
}
