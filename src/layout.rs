//! Where everything lives on a managed host.
//!
//! [Layout] is the only place that knows directory and file names. Both halves of sz-deploy ask
//! it for paths: the host tool uses them to touch the filesystem, and the operator tool uses
//! them as sync destinations and in remote commands. Nothing else joins path segments for
//! application state.

use crate::error::{Error, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// Relative to the layout root. Omit the leading slash so that PathBuf::join appends instead of
// replacing.
const SUPERVISOR_CONF_DIR: &str = "etc/supervisor/conf.d";
const APPS_DIR: &str = "sz/apps";
const APP_CONFIGS_DIR: &str = "sz/deploy/configs";
const APPS_ZIP_DIR: &str = "sz/deploy/zips";
const NGINX_CONF_DIR: &str = "etc/nginx/conf.d";
const WEB_ROOT: &str = "web_html";
const TOOL_DIR: &str = "usr/local/bin";

/// File name of the host-side tool once it has been pushed to the managed host.
pub const SETUP_TOOL: &str = "sz-setup";

/// Subdirectory of the application home that survives a refresh of the installed tree.
pub const LOGS_DIR: &str = "logs";

/// Subdirectory holding the application's embedded database. Never deleted by a tree sync.
pub const EMBEDDED_DB_DIR: &str = "h2db";

/// The main config file. Its presence means the config directory has been seeded.
pub const MAIN_CONFIG: &str = "application.conf";

/// The config artifacts referenced from the properties file, in the order they are written.
pub const CONFIG_ARTIFACTS: [(&str, &str); 4] = [
    ("config.url", MAIN_CONFIG),
    ("logback.configurationFile", "logback.xml"),
    ("sz.vertxOptions.url", "vertxOptions.json"),
    ("sz.zookeeper.config.url", "zookeeper.json"),
];

const PROPERTIES_FILE: &str = "sz.app.properties";

/// Returns an error unless `name` is safe to use as a single path component and command
/// argument.
pub fn validate_name(name: &str) -> Result<()> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern =
        PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid regex"));

    if pattern.is_match(name) {
        Ok(())
    } else {
        Err(Error::precondition(format!(
            "invalid name {name:?}: use letters, digits, '.', '_' and '-' only"
        )))
    }
}

/// The filesystem layout of a managed host, anchored at `root`.
///
/// In production `root` is `/`. Tests anchor it in a temporary directory so that the host tool
/// can run against a throwaway tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self::new("/")
    }
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.root.join(APPS_DIR)
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join(APP_CONFIGS_DIR)
    }

    /// The shared directory where staged artifacts wait to be installed.
    pub fn zips_dir(&self) -> PathBuf {
        self.root.join(APPS_ZIP_DIR)
    }

    pub fn supervisor_dir(&self) -> PathBuf {
        self.root.join(SUPERVISOR_CONF_DIR)
    }

    pub fn nginx_dir(&self) -> PathBuf {
        self.root.join(NGINX_CONF_DIR)
    }

    pub fn web_root(&self) -> PathBuf {
        self.root.join(WEB_ROOT)
    }

    pub fn tool_dir(&self) -> PathBuf {
        self.root.join(TOOL_DIR)
    }

    pub fn setup_tool(&self) -> PathBuf {
        self.tool_dir().join(SETUP_TOOL)
    }

    pub fn home_dir(&self, app: &str) -> PathBuf {
        self.apps_dir().join(app)
    }

    /// The script the supervisor launches.
    pub fn start_script(&self, app: &str) -> PathBuf {
        self.home_dir(app).join("bin").join(app)
    }

    /// The `conf` subtree that every artifact ships with its default configuration in.
    pub fn bundled_conf_dir(&self, app: &str) -> PathBuf {
        self.home_dir(app).join("conf")
    }

    pub fn conf_dir(&self, app: &str) -> PathBuf {
        self.configs_dir().join(app)
    }

    pub fn main_config(&self, app: &str) -> PathBuf {
        self.conf_dir(app).join(MAIN_CONFIG)
    }

    pub fn properties_file(&self, app: &str) -> PathBuf {
        self.conf_dir(app).join(PROPERTIES_FILE)
    }

    pub fn unit_file(&self, app: &str) -> PathBuf {
        self.supervisor_dir().join(format!("{app}.conf"))
    }

    pub fn staged_zip(&self, app: &str) -> PathBuf {
        self.zips_dir().join(format!("{app}.zip"))
    }

    /// Where a staged artifact is unpacked before it replaces the application home.
    pub fn scratch_dir(&self, app: &str) -> PathBuf {
        self.zips_dir().join(format!(".{app}.unpack"))
    }

    pub fn proxy_conf(&self, file_name: &str) -> PathBuf {
        self.nginx_dir().join(file_name)
    }

    pub fn site_dir(&self, site: &str) -> PathBuf {
        self.web_root().join(site)
    }
}

/// Renders a host path as a `file://` URL.
pub fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Derives a name from the last component of `path`, e.g. a project directory.
pub fn base_name(path: &Path) -> Option<String> {
    path.file_name().map(|s| s.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_paths() {
        let layout = Layout::default();
        assert_eq!(Path::new("/sz/apps/api"), layout.home_dir("api"));
        assert_eq!(Path::new("/sz/apps/api/bin/api"), layout.start_script("api"));
        assert_eq!(Path::new("/sz/deploy/configs/api"), layout.conf_dir("api"));
        assert_eq!(
            Path::new("/sz/deploy/configs/api/sz.app.properties"),
            layout.properties_file("api"),
        );
        assert_eq!(Path::new("/sz/deploy/zips/api.zip"), layout.staged_zip("api"));
        assert_eq!(
            Path::new("/etc/supervisor/conf.d/api.conf"),
            layout.unit_file("api"),
        );
        assert_eq!(
            Path::new("/etc/nginx/conf.d/site.conf"),
            layout.proxy_conf("site.conf"),
        );
        assert_eq!(Path::new("/web_html/docs"), layout.site_dir("docs"));
        assert_eq!(Path::new("/usr/local/bin/sz-setup"), layout.setup_tool());
    }

    #[test]
    fn relocated_root() {
        let layout = Layout::new("/tmp/host");
        assert_eq!(Path::new("/tmp/host/sz/apps/api"), layout.home_dir("api"));
        assert_eq!(
            Path::new("/tmp/host/etc/supervisor/conf.d/api.conf"),
            layout.unit_file("api"),
        );
    }

    #[test]
    fn names() {
        for good in ["api", "api_server", "web-1", "a.b"] {
            assert!(validate_name(good).is_ok(), "{good} should be accepted");
        }
        for bad in ["", "..", "-rf", "a/b", "a b", "$(reboot)", ".hidden"] {
            assert!(validate_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn base_names() {
        assert_eq!(
            Some("api_server".to_string()),
            base_name(Path::new("/home/me/work/api_server")),
        );
        assert_eq!(None, base_name(Path::new("/")));
    }

    #[test]
    fn file_urls() {
        assert_eq!(
            "file:///sz/deploy/configs/api/logback.xml",
            file_url(&Layout::default().conf_dir("api").join("logback.xml")),
        );
    }
}
