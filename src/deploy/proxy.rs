//! Reverse-proxy configs in the managed host's nginx `conf.d`.

use super::{require_file, Deployer};
use crate::error::{Error, Result};
use crate::exec::{CommandLine, CommandOutput, Policy, Run};
use crate::layout::{base_name, validate_name};
use crate::session::Session;
use crate::sync::SyncRequest;
use std::path::Path;

const CONF_EXTENSION: &str = "conf";

impl<S: Session, R: Run> Deployer<S, R> {
    /// Uploads a proxy config and checks that nginx accepts it.
    ///
    /// A config that fails `nginx -t` is removed again so that it can't break the next reload.
    /// Returns the file name the config was installed as.
    pub fn install_proxy_conf(&mut self, path: &Path) -> Result<String> {
        let path = crate::config::expand_tilde(path);
        require_file(&path, "proxy config")?;
        if path.extension().and_then(|e| e.to_str()) != Some(CONF_EXTENSION) {
            return Err(Error::precondition(format!(
                "proxy config must end in .{CONF_EXTENSION}: {}",
                path.display()
            )));
        }
        let file_name = base_name(&path)
            .ok_or_else(|| Error::precondition(format!("no file name in {}", path.display())))?;
        validate_name(&file_name)?;

        let request = SyncRequest::into_dir(&path, &self.layout.nginx_dir())?;
        self.sync(&request)?;

        let check = CommandLine::new("nginx").arg("-t");
        let output = self.session.remote(&check, Policy::Tolerate)?;
        if !output.success() {
            tracing::error!(file = %file_name, "nginx rejected the config; removing it");
            self.remove_proxy_conf(&file_name)?;
            return Err(Error::CommandFailed {
                command: check.display(),
                status: output.status,
            });
        }

        tracing::info!(file = %file_name, "installed proxy config");
        Ok(file_name)
    }

    /// Removes a proxy config. `name` may omit the `.conf` extension.
    ///
    /// nginx is not reloaded.
    pub fn uninstall_proxy_conf(&mut self, name: &str) -> Result<String> {
        let file_name = proxy_file_name(name);
        validate_name(&file_name)?;
        self.remove_proxy_conf(&file_name)?;
        tracing::info!(file = %file_name, "removed proxy config");
        Ok(file_name)
    }

    /// Lists the proxy config directory.
    pub fn list_proxy_confs(&mut self) -> Result<CommandOutput> {
        let command = CommandLine::new("ls")
            .arg("-l")
            .path_arg(self.layout.nginx_dir());
        self.session.remote(&command, Policy::FailFast)
    }

    /// Prints one proxy config. `name` may omit the `.conf` extension.
    pub fn dump_proxy_conf(&mut self, name: &str) -> Result<CommandOutput> {
        let file_name = proxy_file_name(name);
        validate_name(&file_name)?;
        let command = CommandLine::new("cat").path_arg(self.layout.proxy_conf(&file_name));
        self.session.remote(&command, Policy::FailFast)
    }

    fn remove_proxy_conf(&mut self, file_name: &str) -> Result<CommandOutput> {
        let command = CommandLine::new("rm")
            .arg("-f")
            .path_arg(self.layout.proxy_conf(file_name));
        self.session.remote(&command, Policy::FailFast)
    }
}

fn proxy_file_name(name: &str) -> String {
    if name.ends_with(".conf") {
        name.to_string()
    } else {
        format!("{name}.{CONF_EXTENSION}")
    }
}
