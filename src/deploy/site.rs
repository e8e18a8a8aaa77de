//! Static sites served from the managed host's web root.

use super::{require_dir, Deployer};
use crate::error::{Error, Result};
use crate::exec::{CommandLine, Policy, Run};
use crate::layout::{base_name, validate_name};
use crate::session::Session;
use crate::sync::SyncRequest;
use std::path::Path;

impl<S: Session, R: Run> Deployer<S, R> {
    /// Mirrors a local directory into `<web root>/<name>` and hands it to the web server's user.
    ///
    /// `name` defaults to the base name of `dir`. Files that no longer exist locally are deleted
    /// from the site. Returns the site name.
    pub fn install_web_app(&mut self, dir: &Path, name: Option<&str>) -> Result<String> {
        let dir = crate::config::expand_tilde(dir);
        require_dir(&dir, "site directory")?;
        let site = match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => base_name(&dir).ok_or_else(|| {
                Error::precondition(format!("cannot derive a site name from {}", dir.display()))
            })?,
        };
        validate_name(&site)?;
        let site_dir = self.layout.site_dir(&site);

        self.session.remote(
            &CommandLine::new("mkdir").arg("-p").path_arg(&site_dir),
            Policy::FailFast,
        )?;
        let request = SyncRequest::contents(&dir, &site_dir)?.delete(true);
        self.sync(&request)?;
        let chown = CommandLine::new("chown")
            .arg("-R")
            .arg(self.settings.web_owner.as_str())
            .path_arg(&site_dir);
        self.session.remote(&chown, Policy::FailFast)?;

        tracing::info!(site = %site, "installed web app");
        Ok(site)
    }

    /// Deletes `<web root>/<name>`. Removing a site that doesn't exist succeeds.
    pub fn uninstall_web_app(&mut self, name: &str) -> Result<()> {
        validate_name(name)?;
        let command = CommandLine::new("rm")
            .arg("-rf")
            .path_arg(self.layout.site_dir(name));
        self.session.remote(&command, Policy::FailFast)?;
        tracing::info!(site = %name, "removed web app");
        Ok(())
    }
}
