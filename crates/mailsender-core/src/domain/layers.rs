//! Configuration layer sources and their locations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::model::DomainFields;
use crate::{Error, Result};

/// Name of the domain configuration file inside each layer directory.
pub const CONFIG_FILE_NAME: &str = "mailsender_domains.yml";

/// Application directory name used under system and user config roots.
pub const APPLICATION_NAME: &str = "MailSender";

/// Domain name to raw fields, for one layer or a merged result.
pub type DomainTable = BTreeMap<String, DomainFields>;

const BUILTIN_DOMAINS: &str = include_str!("builtin_domains.yml");

/// A configuration layer supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigSource {
    /// YAML file to read.
    Path(PathBuf),
    /// Already-parsed table.
    Inline(DomainTable),
}

impl ConfigSource {
    /// Creates a file-backed source.
    #[must_use]
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// Creates an inline source from YAML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a domain mapping.
    pub fn from_yaml(text: &str) -> Result<Self> {
        parse_table(text, Path::new("<inline>")).map(Self::Inline)
    }

    /// The backing file, if this source is one.
    #[must_use]
    pub fn file(&self) -> Option<&Path> {
        match self {
            Self::Path(path) => Some(path),
            Self::Inline(_) => None,
        }
    }

    /// Reads the layer.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed. A missing file is
    /// an error here since the caller named it explicitly.
    pub fn load(&self) -> Result<DomainTable> {
        match self {
            Self::Path(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                parse_table(&text, path)
            }
            Self::Inline(table) => Ok(normalize(table.clone())),
        }
    }
}

impl From<DomainTable> for ConfigSource {
    fn from(table: DomainTable) -> Self {
        Self::Inline(table)
    }
}

impl From<PathBuf> for ConfigSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

/// Directories searched for layer files, lowest precedence first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPaths {
    /// Site-wide configuration directories.
    pub site_dirs: Vec<PathBuf>,
    /// Configuration directory of the installation prefix.
    pub environment_dir: Option<PathBuf>,
    /// Per-user configuration directory.
    pub user_dir: Option<PathBuf>,
}

impl ConfigPaths {
    /// Standard locations for this platform and installation.
    #[must_use]
    pub fn from_system() -> Self {
        Self {
            site_dirs: site_dirs(),
            environment_dir: environment_dir(),
            user_dir: dirs::config_dir().map(|dir| dir.join(APPLICATION_NAME)),
        }
    }

    /// No file layers at all; only built-ins and caller-supplied sources apply.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Layer files in merge order, whether or not they exist.
    #[must_use]
    pub fn layer_files(&self) -> Vec<PathBuf> {
        self.site_dirs
            .iter()
            .chain(self.environment_dir.iter())
            .chain(self.user_dir.iter())
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .collect()
    }
}

/// The built-in provider table.
///
/// # Errors
///
/// Returns an error only if the embedded table is malformed.
pub fn builtin_domains() -> Result<DomainTable> {
    parse_table(BUILTIN_DOMAINS, Path::new("<builtin>"))
}

/// Parses a YAML domain table; domain keys are lower-cased.
///
/// # Errors
///
/// Returns `Error::Yaml` naming `origin` if the text is not a mapping of
/// domains to field mappings.
pub fn parse_table(text: &str, origin: &Path) -> Result<DomainTable> {
    let blank = text.lines().all(|line| {
        let line = line.trim();
        line.is_empty() || line.starts_with('#')
    });
    if blank {
        return Ok(DomainTable::new());
    }

    let raw: Option<BTreeMap<String, Option<DomainFields>>> =
        serde_yaml::from_str(text).map_err(|source| Error::Yaml {
            path: origin.to_path_buf(),
            source,
        })?;

    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(domain, fields)| (domain.to_lowercase(), fields.unwrap_or_default()))
        .collect())
}

/// Reads a layer file, treating a missing file as an absent layer.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn read_layer_file(path: &Path) -> Result<Option<DomainTable>> {
    match std::fs::read_to_string(path) {
        Ok(text) => {
            debug!(path = %path.display(), "loading domain layer");
            parse_table(&text, path).map(Some)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "domain layer not present");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn normalize(table: DomainTable) -> DomainTable {
    table
        .into_iter()
        .map(|(domain, fields)| (domain.to_lowercase(), fields))
        .collect()
}

#[cfg(all(unix, not(target_os = "macos")))]
fn site_dirs() -> Vec<PathBuf> {
    let configured = std::env::var_os("XDG_CONFIG_DIRS").filter(|value| !value.is_empty());
    let roots = configured.unwrap_or_else(|| "/etc/xdg".into());
    // XDG lists the most important directory first.
    let mut dirs: Vec<PathBuf> = std::env::split_paths(&roots)
        .filter(|root| root.is_absolute())
        .map(|root| root.join(APPLICATION_NAME))
        .collect();
    dirs.reverse();
    dirs
}

#[cfg(target_os = "macos")]
fn site_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/Library/Application Support").join(APPLICATION_NAME)]
}

#[cfg(windows)]
fn site_dirs() -> Vec<PathBuf> {
    std::env::var_os("PROGRAMDATA")
        .map(|root| PathBuf::from(root).join(APPLICATION_NAME))
        .into_iter()
        .collect()
}

#[cfg(not(any(unix, windows)))]
fn site_dirs() -> Vec<PathBuf> {
    Vec::new()
}

/// `<prefix>/etc/MailSender`, where the executable lives in `<prefix>/bin`.
fn environment_dir() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let prefix = exe.parent()?.parent()?;
    Some(prefix.join("etc").join(APPLICATION_NAME))
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

    #[test]
    fn builtin_table_has_known_providers() {
        let table = builtin_domains().unwrap();
        for domain in [
            "yahoo.com",
            "aol.com",
            "gmail.com",
            "outlook.com",
            "hotmail.com",
            "live.com",
            "comcast.net",
        ] {
            let fields = table.get(domain).unwrap();
            assert_eq!(fields["protocol"].as_str(), Some("smtp"), "{domain}");
            assert!(fields["server"].as_str().is_some(), "{domain}");
        }
        assert_eq!(
            table["hotmail.com"]["server"].as_str(),
            Some("smtp-mail.outlook.com")
        );
    }

    #[test]
    fn parse_lowercases_domains_and_allows_empty_entries() {
        let table = parse_table("Example.COM:\n  server: mx\nbare.org:\n", Path::new("t")).unwrap();
        assert!(table.contains_key("example.com"));
        assert!(table["bare.org"].is_empty());
    }

    #[test]
    fn parse_empty_text() {
        assert!(parse_table("", Path::new("t")).unwrap().is_empty());
        assert!(parse_table("# nothing\n", Path::new("t")).unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_non_mapping() {
        let err = parse_table("- a\n- b\n", Path::new("layer.yml")).unwrap_err();
        assert!(matches!(err, Error::Yaml { .. }));
        assert!(err.to_string().contains("layer.yml"));
    }

    #[test]
    fn missing_layer_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_layer_file(&dir.path().join(CONFIG_FILE_NAME)).unwrap().is_none());
    }

    #[test]
    fn explicit_missing_source_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = ConfigSource::path(dir.path().join("absent.yml"));
        assert!(matches!(source.load(), Err(Error::Config(_))));
    }

    #[test]
    fn layer_files_follow_precedence() {
        let paths = ConfigPaths {
            site_dirs: vec![PathBuf::from("/etc/xdg/MailSender")],
            environment_dir: Some(PathBuf::from("/opt/app/etc/MailSender")),
            user_dir: Some(PathBuf::from("/home/u/.config/MailSender")),
        };
        assert_eq!(
            paths.layer_files(),
            vec![
                PathBuf::from("/etc/xdg/MailSender").join(CONFIG_FILE_NAME),
                PathBuf::from("/opt/app/etc/MailSender").join(CONFIG_FILE_NAME),
                PathBuf::from("/home/u/.config/MailSender").join(CONFIG_FILE_NAME),
            ]
        );
        assert!(ConfigPaths::none().layer_files().is_empty());
    }
}
