//! Operator-side settings.
//!
//! Settings come from three layers, each overriding the last: built-in defaults, an optional
//! YAML file, and command-line flags. The file lives at `~/.config/sz-deploy/config.yaml` unless
//! another path is given. Every key is optional:
//!
//! ```yaml
//! host: 10.0.0.5
//! port: 22
//! user: root
//! ssh-key: ~/.ssh/deploy_ed25519
//! timeout-secs: 600
//! build-zip: gradle build
//! build-tree: gradle installDist
//! web-owner: nginx:nginx
//! setup-tool: ~/.cargo/bin/sz-setup
//! ```

use crate::error::{Error, Result};
use crate::sync::Endpoint;
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Location of the default config file, relative to the user's home.
const CONFIG_FILE: &str = ".config/sz-deploy/config.yaml";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub ssh_key: PathBuf,

    /// Upper bound for any single remote command. No limit if absent.
    pub timeout_secs: Option<u64>,

    /// Builds `build/distributions/<app>.zip`.
    pub build_zip: String,

    /// Builds `build/install/<app>`.
    pub build_tree: String,

    /// `user:group` that static sites are handed to after upload.
    pub web_owner: String,

    /// The `sz-setup` binary to push to the managed host. Defaults to the one installed next to
    /// `sz-deploy`.
    pub setup_tool: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 10022,
            user: "root".into(),
            ssh_key: "~/.ssh/id_rsa".into(),
            timeout_secs: None,
            build_zip: "gradle build".into(),
            build_tree: "gradle installDist".into(),
            web_owner: "nginx:nginx".into(),
            setup_tool: None,
        }
    }
}

impl Settings {
    /// Loads settings from `path`, or from the default config file if `path` is [None].
    ///
    /// A missing default file just means defaults. A missing file that was asked for by name is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (expand_tilde(path), true),
            None => match default_config_file() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        let yaml = match fs::read_to_string(&path) {
            Ok(yaml) => yaml,
            Err(err) if err.kind() == ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "no config file; using defaults");
                return Ok(Self::default());
            }
            Err(err) => return Err(Error::io_at(path, err)),
        };

        let settings = Self::from_yaml(&yaml).map_err(|source| Error::Config {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(settings)
    }

    pub fn from_yaml(yaml: &str) -> std::result::Result<Self, serde_yaml::Error> {
        // An empty file is a valid, empty config.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            key: expand_tilde(&self.ssh_key),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// The local `sz-setup` binary to push to the managed host.
    pub fn setup_tool(&self) -> Result<PathBuf> {
        if let Some(path) = &self.setup_tool {
            return Ok(expand_tilde(path));
        }
        let exe = std::env::current_exe()?;
        let dir = exe.parent().unwrap_or(Path::new("."));
        Ok(dir.join(crate::layout::SETUP_TOOL))
    }
}

/// Returns the default config file path, or [None] if the home directory is unknown.
pub fn default_config_file() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(CONFIG_FILE))
}

/// Replaces a leading `~` with the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match home::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!("127.0.0.1", settings.host);
        assert_eq!(10022, settings.port);
        assert_eq!(None, settings.timeout());

        let endpoint = settings.endpoint();
        assert_eq!("root", endpoint.user);
        assert!(endpoint.key.ends_with(".ssh/id_rsa"));
        assert!(!endpoint.key.starts_with("~"));
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let settings = Settings::from_yaml("host: 10.0.0.5\ntimeout-secs: 30\n").unwrap();
        assert_eq!("10.0.0.5", settings.host);
        assert_eq!(10022, settings.port);
        assert_eq!(Some(Duration::from_secs(30)), settings.timeout());
        assert_eq!("gradle installDist", settings.build_tree);
    }

    #[test]
    fn empty_yaml() {
        assert_eq!(Settings::default(), Settings::from_yaml("\n").unwrap());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Settings::from_yaml("hots: 10.0.0.5\n").is_err());
    }

    #[test]
    fn load_named_file() {
        let dir = TempDir::with_prefix("sz-deploy-").unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "web-owner: www-data:www-data\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!("www-data:www-data", settings.web_owner);
    }

    #[test]
    fn missing_named_file_is_an_error() {
        let dir = TempDir::with_prefix("sz-deploy-").unwrap();
        let error = Settings::load(Some(&dir.path().join("nope.yaml"))).unwrap_err();
        assert!(matches!(error, Error::IoAt { .. }));
    }

    #[test]
    fn malformed_file() {
        let dir = TempDir::with_prefix("sz-deploy-").unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "port: not-a-number\n").unwrap();
        assert!(matches!(
            Settings::load(Some(&path)).unwrap_err(),
            Error::Config { .. },
        ));
    }

    #[test]
    fn tilde_expansion() {
        let home = home::home_dir().unwrap();
        assert_eq!(home.join("work/api"), expand_tilde(Path::new("~/work/api")));
        assert_eq!(Path::new("/abs"), expand_tilde(Path::new("/abs")));
        assert_eq!(Path::new("rel/~"), expand_tilde(Path::new("rel/~")));
    }

    #[test]
    fn explicit_setup_tool() {
        let settings = Settings {
            setup_tool: Some("/opt/bin/sz-setup".into()),
            ..Settings::default()
        };
        assert_eq!(
            Path::new("/opt/bin/sz-setup"),
            settings.setup_tool().unwrap(),
        );
    }
}
