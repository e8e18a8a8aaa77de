//! Registers applications with `supervisord`.
//!
//! Each application gets one unit file in the supervisor's `conf.d` and one generated properties
//! file in its config directory. Both are rendered from the [Layout] alone, so rewriting them on
//! every install is always safe. `supervisord` does not watch its configuration directory:
//! after a unit file changes, [Registrar::reload] must run before the change takes effect.

use crate::error::{Error, Result};
use crate::exec::{CommandLine, CommandOutput, Policy, Run};
use crate::layout::{file_url, Layout, CONFIG_ARTIFACTS};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// The supervisor control program.
pub const SUPERVISORCTL: &str = "supervisorctl";

/// Seconds a process has to stay up before the supervisor considers it started.
pub const START_SECS: u32 = 5;

/// The per-application verbs of `supervisorctl`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Start,
    Stop,
    Status,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verb::Start => "start",
            Verb::Stop => "stop",
            Verb::Status => "status",
        })
    }
}

/// `supervisorctl <verb> <app>`.
pub fn control_command(verb: Verb, app: &str) -> CommandLine {
    CommandLine::new(SUPERVISORCTL)
        .arg(verb.to_string())
        .arg(app)
}

/// `supervisorctl update`, which re-reads unit files and applies any differences.
pub fn update_command() -> CommandLine {
    CommandLine::new(SUPERVISORCTL).arg("update")
}

/// Renders the unit file for `app`.
pub fn render_unit(layout: &Layout, app: &str) -> String {
    let properties = file_url(&layout.properties_file(app));
    [
        format!("[program:{app}]"),
        format!("directory={}", layout.home_dir(app).display()),
        format!("command={}", layout.start_script(app).display()),
        format!("environment=JAVA_OPTS=\"-Dsz.properties.url={properties}\""),
        "autostart=true".to_string(),
        "autorestart=true".to_string(),
        format!("startsecs={START_SECS}"),
    ]
    .iter()
    .map(|line| format!("{line}\n"))
    .collect()
}

/// Renders the properties file that points the application at its externalized config.
pub fn render_properties(layout: &Layout, app: &str) -> String {
    let conf_dir = layout.conf_dir(app);
    CONFIG_ARTIFACTS
        .iter()
        .map(|(key, file)| format!("{key} = {}\n", file_url(&conf_dir.join(file))))
        .collect()
}

/// Writes and removes the supervisor's view of applications on this host.
#[derive(Clone, Copy, Debug)]
pub struct Registrar<'l> {
    layout: &'l Layout,
}

impl<'l> Registrar<'l> {
    pub fn new(layout: &'l Layout) -> Self {
        Self { layout }
    }

    /// Whether `app` is installed.
    ///
    /// Installation state is never stored anywhere: an application is installed exactly when its
    /// unit file exists.
    pub fn installed(&self, app: &str) -> bool {
        self.layout.unit_file(app).is_file()
    }

    /// Replaces the unit file for `app` with a freshly rendered one.
    pub fn write_unit(&self, app: &str) -> Result<()> {
        let path = self.layout.unit_file(app);
        write(&path, &render_unit(self.layout, app))?;
        tracing::info!(app, path = %path.display(), "wrote supervisor unit");
        Ok(())
    }

    /// Replaces the properties file for `app` with a freshly rendered one.
    pub fn write_properties(&self, app: &str) -> Result<()> {
        let path = self.layout.properties_file(app);
        write(&path, &render_properties(self.layout, app))?;
        tracing::info!(app, path = %path.display(), "wrote properties file");
        Ok(())
    }

    /// Removes the unit file for `app`. A missing file is not an error.
    pub fn remove_unit(&self, app: &str) -> Result<()> {
        let path = self.layout.unit_file(app);
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(app, path = %path.display(), "removed supervisor unit");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::io_at(path, err)),
        }
    }

    /// Tells the supervisor to pick up unit file changes.
    pub fn reload<R: Run + ?Sized>(&self, runner: &mut R) -> Result<CommandOutput> {
        runner.run(&update_command(), Policy::FailFast)
    }

    /// Runs `supervisorctl <verb> <app>`.
    pub fn control<R: Run + ?Sized>(
        &self,
        runner: &mut R,
        verb: Verb,
        app: &str,
        policy: Policy,
    ) -> Result<CommandOutput> {
        runner.run(&control_command(verb, app), policy)
    }
}

/// Writes `contents` to `path`, truncating whatever was there and creating parent directories.
fn write(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
    }
    fs::write(path, contents).map_err(|e| Error::io_at(path, e))
}
