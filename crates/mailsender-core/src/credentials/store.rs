//! File-backed credential store.
//!
//! One YAML file maps sending addresses to credential records. Every access
//! holds an exclusive advisory lock on a sibling `.lock` file, so separate
//! processes sharing the file serialize their read-modify-write cycles.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::prompt::SecretPrompt;
use super::record::{CredentialMap, CredentialRecord, Credentials, PasswordSource};
use crate::domain::APPLICATION_NAME;
use crate::{Error, Result};

/// Default credentials file name inside the user configuration directory.
pub const CREDS_FILE_NAME: &str = "mailsender_creds.yml";

/// Environment variable naming an alternate credentials file.
pub const CREDS_ENV_VAR: &str = "MAILSENDER_CREDS";

/// How long to wait for another process to release the lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Handle on a credentials file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

/// Exclusive lock on a credentials file; released on drop.
#[derive(Debug)]
pub struct CredentialsLock {
    file: File,
}

impl Drop for CredentialsLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!("Failed to release credentials lock: {e}");
        }
    }
}

impl CredentialStore {
    /// Credentials file path: `explicit`, else `$MAILSENDER_CREDS`, else the
    /// user configuration directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no path is given and the platform has no user
    /// configuration directory.
    pub fn default_path(explicit: Option<&Path>) -> Result<PathBuf> {
        resolve_path(explicit, std::env::var_os(CREDS_ENV_VAR), dirs::config_dir())
    }

    /// Opens the store at the default path (see [`Self::default_path`]).
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be resolved or its directory created.
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        Self::open(Self::default_path(explicit)?)
    }

    /// Opens the store at `path`, creating its directory (owner-only) if needed.
    /// The file itself is created on first write.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        create_private_dir(parent_dir(&path))?;

        let mut lock_name = path.as_os_str().to_os_string();
        lock_name.push(".lock");

        Ok(Self {
            path,
            lock_path: PathBuf::from(lock_name),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Sets how long lock acquisition may wait before failing.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Path of the credentials file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Takes the exclusive lock, waiting up to the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns `Error::LockContention` if the lock stays held elsewhere.
    pub fn lock(&self) -> Result<CredentialsLock> {
        let file = open_lock_file(&self.lock_path)?;
        let started = Instant::now();
        loop {
            match fs2::FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(CredentialsLock { file }),
                Err(e) if is_contended(&e) => {
                    let waited = started.elapsed();
                    if waited >= self.lock_timeout {
                        return Err(Error::LockContention {
                            path: self.lock_path.clone(),
                            waited,
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reads the whole file.
    ///
    /// # Errors
    ///
    /// Returns an error if locking, reading, or parsing fails.
    pub fn load(&self) -> Result<CredentialMap> {
        let _lock = self.lock()?;
        self.read_locked()
    }

    /// Stored record for one address.
    ///
    /// # Errors
    ///
    /// Returns an error if locking, reading, or parsing fails.
    pub fn get(&self, address: &str) -> Result<Option<CredentialRecord>> {
        Ok(self.load()?.remove(address))
    }

    /// Runs a read-modify-write cycle under the lock.
    ///
    /// The file is re-read after locking, `modify` edits it, and the result
    /// replaces the file atomically before the lock is released.
    ///
    /// # Errors
    ///
    /// Returns `Error::InsecurePermissions` if the file or its directory is
    /// open to other users, or any locking, I/O or YAML error.
    pub fn update<T>(&self, modify: impl FnOnce(&mut CredentialMap) -> T) -> Result<T> {
        let _lock = self.lock()?;
        ensure_private(&self.path, 0o077)?;
        ensure_private(parent_dir(&self.path), 0o022)?;

        let mut creds = self.read_locked()?;
        let output = modify(&mut creds);
        self.write_locked(&creds)?;
        Ok(output)
    }

    /// Records a password confirmed by a successful login. Other fields of the
    /// current on-disk entry are kept.
    ///
    /// # Errors
    ///
    /// See [`Self::update`].
    pub fn remember(&self, address: &str, password: &str) -> Result<()> {
        self.update(|creds| {
            creds.entry(address.to_string()).or_default().password = Some(password.to_string());
        })?;
        info!(address, path = %self.path.display(), "Stored verified password");
        Ok(())
    }

    /// Resolves credentials for `address`.
    ///
    /// Explicit values win over the stored record; a missing password is
    /// asked for through `prompt` only when `password_required`. The login
    /// name falls back to the address.
    ///
    /// # Errors
    ///
    /// Returns `Error::CredentialsUnavailable` if a password is required and
    /// none can be obtained, or any error from reading the file.
    pub fn resolve(
        &self,
        address: &str,
        explicit_password: Option<&str>,
        explicit_userid: Option<&str>,
        prompt: &dyn SecretPrompt,
        password_required: bool,
    ) -> Result<Credentials> {
        let stored = self.get(address)?.unwrap_or_default();

        let userid = explicit_userid
            .map(str::to_string)
            .or(stored.userid)
            .unwrap_or_else(|| address.to_string());

        let (password, source) = if let Some(password) = explicit_password {
            (Some(password.to_string()), PasswordSource::Explicit)
        } else if let Some(password) = stored.password {
            (Some(password), PasswordSource::Stored)
        } else if password_required {
            let secret = prompt.obtain_secret(&format!("Password for {address}: "))?;
            match secret {
                Some(password) => (Some(password), PasswordSource::Prompted),
                None => return Err(Error::CredentialsUnavailable(address.to_string())),
            }
        } else {
            (None, PasswordSource::Absent)
        };

        debug!(address, userid, ?source, "credentials resolved");
        Ok(Credentials {
            userid,
            password,
            source,
            extra: stored.extra,
        })
    }

    fn read_locked(&self) -> Result<CredentialMap> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CredentialMap::new()),
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = ensure_private(&self.path, 0o077) {
            warn!("{e}");
        }
        if text.trim().is_empty() {
            return Ok(CredentialMap::new());
        }

        let raw: Option<std::collections::BTreeMap<String, serde_yaml::Value>> =
            serde_yaml::from_str(&text).map_err(|source| Error::Yaml {
                path: self.path.clone(),
                source,
            })?;
        raw.unwrap_or_default()
            .into_iter()
            .map(|(address, value)| {
                let record: Option<CredentialRecord> =
                    serde_yaml::from_value(value).map_err(|e| {
                        Error::Config(format!(
                            "{}: entry for {address}: {e}",
                            self.path.display()
                        ))
                    })?;
                Ok((address, record.unwrap_or_default()))
            })
            .collect()
    }

    fn write_locked(&self, creds: &CredentialMap) -> Result<()> {
        let text = serde_yaml::to_string(creds).map_err(|source| Error::Yaml {
            path: self.path.clone(),
            source,
        })?;

        // Write beside the target, then rename over it.
        let mut temp = tempfile::Builder::new()
            .prefix(".mailsender_creds")
            .suffix(".tmp")
            .tempfile_in(parent_dir(&self.path))?;
        temp.write_all(text.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        debug!(path = %self.path.display(), entries = creds.len(), "credentials written");
        Ok(())
    }
}

/// Credentials path resolution with the environment passed in.
///
/// # Errors
///
/// Returns `Error::Config` if nothing is given and `config_dir` is `None`.
pub fn resolve_path(
    explicit: Option<&Path>,
    env_value: Option<OsString>,
    config_dir: Option<PathBuf>,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    if let Some(value) = env_value.filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(value));
    }
    config_dir
        .map(|dir| dir.join(APPLICATION_NAME).join(CREDS_FILE_NAME))
        .ok_or_else(|| Error::Config("no user configuration directory for credentials".into()))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)?;
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(unix)]
fn open_lock_file(path: &Path) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?)
}

#[cfg(not(unix))]
fn open_lock_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

/// Fails if `path` exists with any of the `forbidden` permission bits.
#[cfg(unix)]
fn ensure_private(path: &Path, forbidden: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.permissions().mode() & 0o777;
            if mode & forbidden == 0 {
                Ok(())
            } else {
                Err(Error::InsecurePermissions {
                    path: path.to_path_buf(),
                    mode,
                })
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn ensure_private(_path: &Path, _forbidden: u32) -> Result<()> {
    Ok(())
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

    const ADDRESS: &str = "me@example.com";

    fn store_in(dir: &Path) -> CredentialStore {
        CredentialStore::open(dir.join("creds").join(CREDS_FILE_NAME)).unwrap()
    }

    fn fixed(secret: &'static str) -> impl Fn(&str) -> io::Result<Option<String>> + Send + Sync {
        move |_: &str| Ok(Some(secret.to_string()))
    }

    mod path_tests {
        use super::*;

        #[test]
        fn explicit_wins() {
            let path = resolve_path(
                Some(Path::new("/explicit.yml")),
                Some("/env.yml".into()),
                Some(PathBuf::from("/config")),
            )
            .unwrap();
            assert_eq!(path, PathBuf::from("/explicit.yml"));
        }

        #[test]
        fn environment_before_config_dir() {
            let path =
                resolve_path(None, Some("/env.yml".into()), Some(PathBuf::from("/config")))
                    .unwrap();
            assert_eq!(path, PathBuf::from("/env.yml"));
        }

        #[test]
        fn config_dir_default() {
            let path = resolve_path(None, None, Some(PathBuf::from("/config"))).unwrap();
            assert_eq!(
                path,
                PathBuf::from("/config")
                    .join(APPLICATION_NAME)
                    .join(CREDS_FILE_NAME)
            );
        }

        #[test]
        fn empty_environment_value_is_ignored() {
            let path = resolve_path(None, Some(OsString::new()), Some(PathBuf::from("/c"))).unwrap();
            assert!(path.ends_with(CREDS_FILE_NAME));
        }

        #[test]
        fn nothing_available() {
            assert!(matches!(resolve_path(None, None, None), Err(Error::Config(_))));
        }
    }

    mod file_tests {
        use super::*;

        #[test]
        fn missing_file_is_empty() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            assert!(store.load().unwrap().is_empty());
            assert!(store.get(ADDRESS).unwrap().is_none());
        }

        #[test]
        fn remember_creates_then_merges() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            std::fs::write(
                store.path(),
                "me@example.com:\n  userid: me\n  token_cache: /tmp/t\nother@example.com:\n  password: old\n",
            )
            .unwrap();
            set_mode(store.path(), 0o600);

            store.remember(ADDRESS, "secret").unwrap();

            let creds = store.load().unwrap();
            let me = &creds[ADDRESS];
            assert_eq!(me.password.as_deref(), Some("secret"));
            assert_eq!(me.userid.as_deref(), Some("me"));
            assert_eq!(me.extra["token_cache"].as_str(), Some("/tmp/t"));
            assert_eq!(creds["other@example.com"].password.as_deref(), Some("old"));
        }

        #[test]
        fn null_entries_load_as_empty_records() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            std::fs::write(store.path(), "me@example.com:\n").unwrap();
            set_mode(store.path(), 0o600);
            assert_eq!(store.get(ADDRESS).unwrap(), Some(CredentialRecord::default()));
        }

        #[test]
        fn numeric_password_loads() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            std::fs::write(
                store.path(),
                "me@example.com:\n  password: 12345\nother@example.com:\n  password: pw\n",
            )
            .unwrap();
            set_mode(store.path(), 0o600);
            assert_eq!(
                store.get(ADDRESS).unwrap().unwrap().password.as_deref(),
                Some("12345")
            );
        }

        #[test]
        fn bad_entry_names_its_address() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            std::fs::write(
                store.path(),
                "me@example.com:\n  password: {nested: map}\nother@example.com:\n  password: pw\n",
            )
            .unwrap();
            set_mode(store.path(), 0o600);
            let err = store.load().unwrap_err();
            assert!(matches!(&err, Error::Config(msg) if msg.contains(ADDRESS)), "{err}");
        }

        #[test]
        fn malformed_file_is_yaml_error() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            std::fs::write(store.path(), "[unclosed").unwrap();
            set_mode(store.path(), 0o600);
            assert!(matches!(store.load(), Err(Error::Yaml { .. })));
        }

        #[test]
        fn held_lock_times_out() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            let impatient = store
                .clone()
                .with_lock_timeout(Duration::from_millis(100));

            let held = store.lock().unwrap();
            let err = impatient.load().unwrap_err();
            assert!(matches!(err, Error::LockContention { .. }));
            assert!(err.is_retryable());

            drop(held);
            assert!(impatient.load().is_ok());
        }
    }

    #[cfg(unix)]
    fn set_mode(path: &Path, mode: u32) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
    }

    #[cfg(not(unix))]
    fn set_mode(_path: &Path, _mode: u32) {}

    #[cfg(unix)]
    mod permission_tests {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        #[test]
        fn directory_is_created_owner_only() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            let mode = std::fs::metadata(store.path().parent().unwrap())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o077, 0);
        }

        #[test]
        fn written_file_is_owner_only() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            store.remember(ADDRESS, "secret").unwrap();
            let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        #[test]
        fn open_file_is_not_rewritten() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            std::fs::write(store.path(), "other@example.com:\n  password: old\n").unwrap();
            set_mode(store.path(), 0o644);

            let err = store.remember(ADDRESS, "secret").unwrap_err();
            assert!(matches!(err, Error::InsecurePermissions { mode: 0o644, .. }));

            // Not fixed behind the caller's back.
            let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o644);
            let text = std::fs::read_to_string(store.path()).unwrap();
            assert!(!text.contains("secret"));
        }

        #[test]
        fn open_file_can_still_be_read() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            std::fs::write(store.path(), "me@example.com:\n  password: pw\n").unwrap();
            set_mode(store.path(), 0o644);
            assert_eq!(
                store.get(ADDRESS).unwrap().unwrap().password.as_deref(),
                Some("pw")
            );
        }
    }

    mod resolve_tests {
        use super::*;

        fn store_with(dir: &Path, yaml: &str) -> CredentialStore {
            let store = store_in(dir);
            std::fs::write(store.path(), yaml).unwrap();
            set_mode(store.path(), 0o600);
            store
        }

        #[test]
        fn explicit_values_win() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_with(dir.path(), "me@example.com:\n  userid: stored\n  password: stored\n");
            let creds = store
                .resolve(ADDRESS, Some("given"), Some("login"), &NoPrompt, true)
                .unwrap();
            assert_eq!(creds.login(), Some(("login", "given")));
            assert_eq!(creds.source, PasswordSource::Explicit);
        }

        #[test]
        fn stored_values_used() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_with(dir.path(), "me@example.com:\n  userid: stored\n  password: pw\n");
            let creds = store.resolve(ADDRESS, None, None, &NoPrompt, true).unwrap();
            assert_eq!(creds.login(), Some(("stored", "pw")));
            assert_eq!(creds.source, PasswordSource::Stored);
        }

        #[test]
        fn userid_defaults_to_address() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            let creds = store
                .resolve(ADDRESS, None, None, &fixed("typed"), true)
                .unwrap();
            assert_eq!(creds.userid, ADDRESS);
            assert_eq!(creds.password.as_deref(), Some("typed"));
            assert!(creds.is_unverified());
        }

        #[test]
        fn prompt_does_not_write() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            store
                .resolve(ADDRESS, None, None, &fixed("typed"), true)
                .unwrap();
            assert!(!store.path().exists());
        }

        #[test]
        fn no_prompt_is_unavailable() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            let err = store.resolve(ADDRESS, None, None, &NoPrompt, true).unwrap_err();
            assert!(matches!(err, Error::CredentialsUnavailable(a) if a == ADDRESS));
        }

        #[test]
        fn password_not_required() {
            let dir = tempfile::tempdir().unwrap();
            let store = store_in(dir.path());
            let creds = store.resolve(ADDRESS, None, None, &NoPrompt, false).unwrap();
            assert_eq!(creds.source, PasswordSource::Absent);
            assert_eq!(creds.login(), None);
        }
    }
}
