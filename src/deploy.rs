//! Operator-side flows: what `sz-deploy` does to a managed host, step by step.
//!
//! Each flow is a fixed, ordered list of local commands (builds, `rsync`) and remote `sz-setup`
//! invocations. Every step must succeed before the next one starts, except for the steps that
//! are explicitly tolerated: stopping an application before (re)installing it, and asking for
//! status at the end.

mod proxy;
mod site;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::exec::{CommandLine, CommandOutput, Policy, Run};
use crate::layout::{base_name, validate_name, Layout, EMBEDDED_DB_DIR, LOGS_DIR};
use crate::session::Session;
use crate::supervisor::{control_command, Verb};
use crate::sync::{self, Endpoint, SyncRequest};
use std::path::{Path, PathBuf};

/// How the application tree gets to the managed host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Build a distribution zip, stage it, and let `sz-setup installzip` unpack it.
    #[default]
    Zip,

    /// Build an installed tree and sync it straight into the application home.
    Tree,
}

/// A local project directory and the application it deploys as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Project {
    pub dir: PathBuf,
    pub app: String,
}

impl Project {
    /// The application name defaults to the base name of `dir`.
    pub fn new(dir: impl Into<PathBuf>, app: Option<&str>) -> Result<Self> {
        let dir = crate::config::expand_tilde(&dir.into());
        let app = match app {
            Some(app) if !app.is_empty() => app.to_string(),
            _ => base_name(&dir).ok_or_else(|| {
                Error::precondition(format!(
                    "cannot derive an application name from {}",
                    dir.display()
                ))
            })?,
        };
        validate_name(&app)?;
        Ok(Self { dir, app })
    }

    /// The distribution zip produced by [Settings::build_zip].
    pub fn distribution_zip(&self) -> PathBuf {
        self.dir
            .join("build")
            .join("distributions")
            .join(format!("{}.zip", self.app))
    }

    /// The installed tree produced by [Settings::build_tree].
    pub fn install_tree(&self) -> PathBuf {
        self.dir.join("build").join("install").join(&self.app)
    }
}

/// Drives a managed host through one session.
#[derive(Debug)]
pub struct Deployer<S: Session, R: Run> {
    session: S,
    runner: R,
    layout: Layout,
    endpoint: Endpoint,
    settings: Settings,
}

impl<S: Session, R: Run> Deployer<S, R> {
    pub fn new(session: S, runner: R, settings: Settings) -> Self {
        Self {
            session,
            runner,
            layout: Layout::default(),
            endpoint: settings.endpoint(),
            settings,
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Hands back the session, e.g. to close it.
    pub fn into_session(self) -> S {
        self.session
    }

    /// Copies the host-side tool to the managed host so the flows can call it.
    pub fn push_setup_tool(&mut self) -> Result<()> {
        let local = self.settings.setup_tool()?;
        require_file(&local, "host tool")?;
        let request = SyncRequest::file(&local, &self.layout.setup_tool())?;
        self.sync(&request)?;
        Ok(())
    }

    /// Builds `project` and installs or upgrades it on the managed host, then starts it.
    pub fn deploy_app(&mut self, project: &Project, mode: Mode) -> Result<()> {
        let app = project.app.as_str();
        tracing::info!(app, ?mode, "building");
        let build = match mode {
            Mode::Zip => self.settings.build_zip.clone(),
            Mode::Tree => self.settings.build_tree.clone(),
        };
        let build = CommandLine::parse(&build)
            .ok_or_else(|| Error::precondition(format!("invalid build command: {build:?}")))?
            .current_dir(&project.dir);
        self.runner.run(&build, Policy::FailFast)?;

        // Locate the build output before touching the managed host.
        let (request, install) = match mode {
            Mode::Zip => {
                let zip = project.distribution_zip();
                require_file(&zip, "distribution zip")?;
                (
                    SyncRequest::into_dir(&zip, &self.layout.zips_dir())?,
                    "installzip",
                )
            }
            Mode::Tree => {
                let tree = project.install_tree();
                require_dir(&tree, "installed tree")?;
                let request = SyncRequest::into_dir(&tree, &self.layout.apps_dir())?
                    .delete(true)
                    .exclude([format!("{LOGS_DIR}/"), format!("{EMBEDDED_DB_DIR}/")]);
                (request, "install")
            }
        };

        self.setup("init", app, Policy::FailFast)?;
        self.setup("stop", app, Policy::Tolerate)?;
        self.sync(&request)?;
        self.setup(install, app, Policy::FailFast)?;

        self.setup("start", app, Policy::FailFast)?;
        self.session
            .remote(&control_command(Verb::Status, app), Policy::Tolerate)?;
        tracing::info!(app, "deployed");
        Ok(())
    }

    /// Pushes a directory of config files to both the config directory and the installed
    /// tree, then restarts the application.
    pub fn deploy_conf(&mut self, project: &Project, conf_dir: &Path) -> Result<()> {
        let app = project.app.as_str();
        let conf_dir = crate::config::expand_tilde(conf_dir);
        require_dir(&conf_dir, "config directory")?;

        self.setup("init", app, Policy::FailFast)?;
        for dest in [self.layout.conf_dir(app), self.layout.bundled_conf_dir(app)] {
            let request = SyncRequest::contents(&conf_dir, &dest)?;
            self.sync(&request)?;
        }

        self.setup("stop", app, Policy::FailFast)?;
        self.setup("start", app, Policy::FailFast)?;
        self.setup("status", app, Policy::Tolerate)?;
        tracing::info!(app, "deployed config");
        Ok(())
    }

    /// Removes the application from the managed host.
    pub fn undeploy(&mut self, project: &Project) -> Result<()> {
        tracing::info!(app = %project.app, "undeploying");
        self.setup("uninstall", &project.app, Policy::FailFast)?;
        tracing::info!(app = %project.app, "undeployed");
        Ok(())
    }

    /// Runs `sz-setup <verb> --app-name <app>` on the managed host.
    fn setup(&mut self, verb: &str, app: &str, policy: Policy) -> Result<CommandOutput> {
        let command = CommandLine::new(self.layout.setup_tool().to_string_lossy())
            .arg(verb)
            .arg("--app-name")
            .arg(app);
        self.session.remote(&command, policy)
    }

    fn sync(&mut self, request: &SyncRequest) -> Result<CommandOutput> {
        sync::sync(&mut self.runner, &self.endpoint, request)
    }
}

fn require_file(path: &Path, what: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::precondition(format!(
            "{what} not found: {}",
            path.display()
        )))
    }
}

fn require_dir(path: &Path, what: &str) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(Error::precondition(format!(
            "{what} is not a directory: {}",
            path.display()
        )))
    }
}
