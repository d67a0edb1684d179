//! Merged domain configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::layers::{ConfigPaths, ConfigSource, DomainTable, builtin_domains, read_layer_file};
use super::model::ConnectionDescriptor;
use crate::{Error, Result};

/// Domain configuration merged from every layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainConfig {
    domains: DomainTable,
}

impl DomainConfig {
    /// Loads and merges all layers.
    ///
    /// Order, lowest precedence first: built-in defaults (replaced entirely by
    /// `base_config` when given), site files, environment file, user file,
    /// `overrides`.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit source cannot be read or any existing
    /// layer file is malformed.
    pub fn load(
        paths: &ConfigPaths,
        base_config: Option<&ConfigSource>,
        overrides: Option<&ConfigSource>,
    ) -> Result<Self> {
        let mut domains = match base_config {
            Some(source) => source.load()?,
            None => builtin_domains()?,
        };

        for file in paths.layer_files() {
            if let Some(layer) = read_layer_file(&file)? {
                merge_layer(&mut domains, layer);
            }
        }

        if let Some(source) = overrides {
            merge_layer(&mut domains, source.load()?);
        }

        debug!(domains = domains.len(), "domain configuration loaded");
        Ok(Self { domains })
    }

    /// Merges already-loaded layers, lowest precedence first.
    #[must_use]
    pub fn from_layers(layers: impl IntoIterator<Item = DomainTable>) -> Self {
        let mut domains = DomainTable::new();
        for layer in layers {
            merge_layer(&mut domains, layer);
        }
        Self { domains }
    }

    /// Returns the descriptor for a domain (case-insensitive exact match).
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownDomain` if no layer configures the domain, or
    /// `Error::Config` if its fields are malformed.
    pub fn lookup(&self, domain: &str) -> Result<ConnectionDescriptor> {
        let domain = domain.to_lowercase();
        let fields = self
            .domains
            .get(&domain)
            .ok_or_else(|| Error::UnknownDomain(domain.clone()))?;
        ConnectionDescriptor::from_fields(&domain, fields)
    }

    /// Returns true if the domain is configured.
    #[must_use]
    pub fn contains(&self, domain: &str) -> bool {
        self.domains.contains_key(&domain.to_lowercase())
    }

    /// Configured domain names, sorted.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.domains.keys().map(String::as_str)
    }

    /// Server configured for each domain.
    #[must_use]
    pub fn known_domains(&self) -> BTreeMap<String, Option<String>> {
        self.domains
            .iter()
            .map(|(domain, fields)| {
                let server = fields
                    .get("server")
                    .and_then(serde_yaml::Value::as_str)
                    .map(str::to_string);
                (domain.clone(), server)
            })
            .collect()
    }
}

/// Merges `layer` into `into`: per domain, the layer's keys replace existing
/// keys and all other keys are kept.
pub fn merge_layer(into: &mut DomainTable, layer: DomainTable) {
    for (domain, fields) in layer {
        into.entry(domain).or_default().extend(fields);
    }
}

/// Every file consulted for a sender, in resolution order, followed by the
/// credentials file. Files that do not exist are included.
#[must_use]
pub fn config_file_list(
    paths: &ConfigPaths,
    base_config: Option<&ConfigSource>,
    overrides: Option<&ConfigSource>,
    creds_file: &Path,
) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = base_config
        .and_then(ConfigSource::file)
        .map(Path::to_path_buf)
        .into_iter()
        .collect();
    files.extend(paths.layer_files());
    files.extend(overrides.and_then(ConfigSource::file).map(Path::to_path_buf));
    files.push(creds_file.to_path_buf());
    files
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
    use crate::domain::CONFIG_FILE_NAME;
    use crate::security::Security;

    fn table(yaml: &str) -> DomainTable {
        crate::domain::parse_table(yaml, Path::new("test")).unwrap()
    }

    fn write_layer(dir: &Path, yaml: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(CONFIG_FILE_NAME), yaml).unwrap();
    }

    mod merge_tests {
        use super::*;

        #[test]
        fn later_layer_wins_per_key() {
            let config = DomainConfig::from_layers([
                table("example.com:\n  server: a.example.com\n  port: 25\n"),
                table("example.com:\n  server: b.example.com\n"),
            ]);
            let descriptor = config.lookup("example.com").unwrap();
            assert_eq!(descriptor.server.as_deref(), Some("b.example.com"));
            assert_eq!(descriptor.port, Some(25));
        }

        #[test]
        fn layers_add_domains() {
            let config = DomainConfig::from_layers([
                table("one.com:\n  server: one\n"),
                table("two.com:\n  server: two\n"),
            ]);
            assert!(config.contains("one.com"));
            assert!(config.contains("two.com"));
            assert_eq!(config.domains().collect::<Vec<_>>(), vec!["one.com", "two.com"]);
        }
    }

    mod load_tests {
        use super::*;

        #[test]
        fn builtins_without_any_layers() {
            let config = DomainConfig::load(&ConfigPaths::none(), None, None).unwrap();
            let gmail = config.lookup("gmail.com").unwrap();
            assert_eq!(gmail.server.as_deref(), Some("smtp.gmail.com"));
            assert_eq!(gmail.transport(), Some((587, Security::StartTls)));
        }

        #[test]
        fn user_layer_overrides_builtin_server_only() {
            let dir = tempfile::tempdir().unwrap();
            let user = dir.path().join("user");
            write_layer(&user, "yahoo.com:\n  server: relay.example.net\n");
            let paths = ConfigPaths {
                user_dir: Some(user),
                ..ConfigPaths::none()
            };

            let yahoo = DomainConfig::load(&paths, None, None)
                .unwrap()
                .lookup("yahoo.com")
                .unwrap();
            assert_eq!(yahoo.server.as_deref(), Some("relay.example.net"));
            assert_eq!(yahoo.port, Some(587));
            assert_eq!(yahoo.security, Some(Security::StartTls));
        }

        #[test]
        fn base_config_replaces_builtins() {
            let base = ConfigSource::from_yaml("corp.example:\n  server: mail.corp.example\n")
                .unwrap();
            let config = DomainConfig::load(&ConfigPaths::none(), Some(&base), None).unwrap();
            assert!(config.contains("corp.example"));
            assert!(!config.contains("gmail.com"));
            assert!(matches!(
                config.lookup("gmail.com"),
                Err(Error::UnknownDomain(_))
            ));
        }

        #[test]
        fn layer_precedence_site_environment_user_overrides() {
            let dir = tempfile::tempdir().unwrap();
            let site = dir.path().join("site");
            let env = dir.path().join("env");
            let user = dir.path().join("user");
            write_layer(&site, "x.org:\n  server: site\n  port: 25\n  security: none\n");
            write_layer(&env, "x.org:\n  server: env\n  port: 2525\n");
            write_layer(&user, "x.org:\n  server: user\n");
            let paths = ConfigPaths {
                site_dirs: vec![site],
                environment_dir: Some(env),
                user_dir: Some(user),
            };

            let merged = DomainConfig::load(&paths, None, None).unwrap();
            let x = merged.lookup("x.org").unwrap();
            assert_eq!(x.server.as_deref(), Some("user"));
            assert_eq!(x.port, Some(2525));
            assert_eq!(x.security, Some(Security::None));

            let overrides = ConfigSource::from_yaml("x.org:\n  server: override\n").unwrap();
            let merged = DomainConfig::load(&paths, None, Some(&overrides)).unwrap();
            assert_eq!(
                merged.lookup("x.org").unwrap().server.as_deref(),
                Some("override")
            );
        }

        #[test]
        fn overrides_from_file_match_inline() {
            let dir = tempfile::tempdir().unwrap();
            let yaml = "x.org:\n  server: override\n  port: 587\n";
            let file = dir.path().join("overrides.yml");
            std::fs::write(&file, yaml).unwrap();

            let from_file =
                DomainConfig::load(&ConfigPaths::none(), None, Some(&ConfigSource::path(&file)))
                    .unwrap();
            let inline = DomainConfig::load(
                &ConfigPaths::none(),
                None,
                Some(&ConfigSource::from_yaml(yaml).unwrap()),
            )
            .unwrap();
            assert_eq!(from_file, inline);
        }

        #[test]
        fn malformed_layer_file_is_error() {
            let dir = tempfile::tempdir().unwrap();
            let user = dir.path().join("user");
            write_layer(&user, "just a string\n");
            let paths = ConfigPaths {
                user_dir: Some(user),
                ..ConfigPaths::none()
            };
            assert!(matches!(
                DomainConfig::load(&paths, None, None),
                Err(Error::Yaml { .. })
            ));
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let config = DomainConfig::from_layers([table("Example.com:\n  server: mx\n")]);
        assert!(config.lookup("EXAMPLE.COM").is_ok());
    }

    #[test]
    fn lookup_is_exact_match() {
        let config = DomainConfig::from_layers([table("example.com:\n  server: mx\n")]);
        assert!(matches!(
            config.lookup("mail.example.com"),
            Err(Error::UnknownDomain(d)) if d == "mail.example.com"
        ));
    }

    #[test]
    fn known_domains_reports_servers() {
        let config = DomainConfig::from_layers([table(
            "a.com:\n  server: mx.a.com\nb.com:\n  protocol: 'tests:Recorder'\n",
        )]);
        let known = config.known_domains();
        assert_eq!(known["a.com"].as_deref(), Some("mx.a.com"));
        assert_eq!(known["b.com"], None);
    }

    #[test]
    fn file_list_order_includes_missing_files() {
        let paths = ConfigPaths {
            site_dirs: vec![PathBuf::from("/site")],
            environment_dir: Some(PathBuf::from("/env")),
            user_dir: Some(PathBuf::from("/user")),
        };
        let base = ConfigSource::path("/base.yml");
        let overrides = ConfigSource::path("/overrides.yml");
        let files = config_file_list(
            &paths,
            Some(&base),
            Some(&overrides),
            Path::new("/creds/mailsender_creds.yml"),
        );
        assert_eq!(
            files,
            vec![
                PathBuf::from("/base.yml"),
                PathBuf::from("/site").join(CONFIG_FILE_NAME),
                PathBuf::from("/env").join(CONFIG_FILE_NAME),
                PathBuf::from("/user").join(CONFIG_FILE_NAME),
                PathBuf::from("/overrides.yml"),
                PathBuf::from("/creds/mailsender_creds.yml"),
            ]
        );
    }

    #[test]
    fn file_list_skips_inline_sources() {
        let inline = ConfigSource::from_yaml("a.com:\n  server: mx\n").unwrap();
        let files = config_file_list(
            &ConfigPaths::none(),
            Some(&inline),
            None,
            Path::new("/creds.yml"),
        );
        assert_eq!(files, vec![PathBuf::from("/creds.yml")]);
    }
}
