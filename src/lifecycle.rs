//! The application lifecycle state machine, as run by `sz-setup` on the managed host.
//!
//! # States
//!
//! An application's state is never recorded anywhere. [Engine::state] infers it from the
//! filesystem every time it is asked:
//!
//! - [State::Absent]: no home directory, no config directory, no unit file.
//! - [State::Initialized]: directories exist, but no unit file.
//! - [State::Installed]: the unit file exists; the process may be running or stopped.
//!
//! # Transitions
//!
//! Every transition is safe to repeat. If one fails halfway (a full disk, a corrupt archive, a
//! supervisor that won't reload), fixing the cause and running the same transition again picks
//! up where it left off. Nothing is rolled back automatically.
//!
//! The externalized config directory is seeded from the artifact exactly once, when its main
//! config file is missing. After that it belongs to the operator, and no install touches it.

use crate::error::{Error, Result};
use crate::exec::{CommandOutput, Policy, Run};
use crate::layout::{validate_name, Layout, LOGS_DIR, MAIN_CONFIG};
use crate::supervisor::{Registrar, Verb};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

/// How long a first install waits for the supervisor to settle before returning.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Pauses the current thread. Abstracted so tests can observe the grace period without waiting
/// for it.
pub trait Sleep {
    fn sleep(&mut self, duration: Duration);
}

/// Production implementation of [Sleep].
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleep;

impl Sleep for ThreadSleep {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Where an application currently is in its lifecycle. See the [module docs](self).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Absent,
    Initialized,
    Installed,
}

/// The outcome of a successful install.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Installed {
    pub app: String,

    /// Whether the application was already installed before this transition.
    pub upgrade: bool,

    /// Whether this install seeded the config directory from the artifact.
    pub seeded_config: bool,
}

/// The outcome of a start, stop or status request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Control {
    /// There is no unit file, so nothing was asked of the supervisor.
    NotInstalled,

    /// The supervisor was asked, and this is what it said.
    Ran(CommandOutput),
}

/// Drives lifecycle transitions for applications on this host.
#[derive(Debug)]
pub struct Engine<'l, R: Run, S: Sleep> {
    layout: &'l Layout,
    runner: R,
    sleeper: S,
    grace: Duration,
}

impl<'l, R: Run, S: Sleep> Engine<'l, R, S> {
    pub fn new(layout: &'l Layout, runner: R, sleeper: S) -> Self {
        Self {
            layout,
            runner,
            sleeper,
            grace: GRACE_PERIOD,
        }
    }

    /// Overrides [GRACE_PERIOD].
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn sleeper(&self) -> &S {
        &self.sleeper
    }

    fn registrar(&self) -> Registrar<'l> {
        Registrar::new(self.layout)
    }

    /// Infers the state of `app` from the filesystem.
    pub fn state(&self, app: &str) -> State {
        if self.registrar().installed(app) {
            State::Installed
        } else if self.layout.home_dir(app).is_dir() || self.layout.conf_dir(app).is_dir() {
            State::Initialized
        } else {
            State::Absent
        }
    }

    /// Ensures the home directory, the config directory and the shared staging directory exist.
    pub fn init(&mut self, app: &str) -> Result<()> {
        validate_name(app)?;
        create_dir(&self.layout.home_dir(app))?;
        create_dir(&self.layout.conf_dir(app))?;
        create_dir(&self.layout.zips_dir())?;
        tracing::info!(app, "directories initialized");
        Ok(())
    }

    /// Installs or upgrades `app` from its staged zip, consuming the zip on success.
    pub fn install_zip(&mut self, app: &str) -> Result<Installed> {
        validate_name(app)?;
        let zip = self.layout.staged_zip(app);
        if !zip.is_file() {
            return Err(Error::precondition(format!(
                "staged artifact {} not found; sync {app}.zip to {} first",
                zip.display(),
                self.layout.zips_dir().display(),
            )));
        }

        // Must be decided before anything changes.
        let upgrade = self.registrar().installed(app);
        tracing::info!(app, upgrade, zip = %zip.display(), "installing from staged artifact");

        let home = self.layout.home_dir(app);
        create_dir(&home)?;

        // A bad archive must fail here, while the installed tree is still intact.
        let scratch = self.layout.scratch_dir(app);
        remove_path(&scratch)?;
        unpack(&zip, &scratch)?;
        let unpacked = unpacked_root(&scratch, app)?;
        if let Err(err) = self.check_seed_source(app, &unpacked.join("conf")) {
            remove_path(&scratch)?;
            return Err(err);
        }

        clear_dir(&home, &[LOGS_DIR])?;
        move_contents(&unpacked, &home)?;
        remove_path(&scratch)?;

        let installed = self.register(app, upgrade)?;

        remove_path(&zip)?;
        tracing::info!(app, zip = %zip.display(), "consumed staged artifact");

        self.settle(&installed);
        Ok(installed)
    }

    /// Installs or upgrades `app` from a tree that has already been synced into its home
    /// directory.
    pub fn install_tree(&mut self, app: &str) -> Result<Installed> {
        validate_name(app)?;
        let home = self.layout.home_dir(app);
        if !home.is_dir() {
            return Err(Error::precondition(format!(
                "{} not found; sync the application tree to it first",
                home.display(),
            )));
        }

        let upgrade = self.registrar().installed(app);
        tracing::info!(app, upgrade, "installing from synced tree");

        let installed = self.register(app, upgrade)?;
        self.settle(&installed);
        Ok(installed)
    }

    /// Stops `app` and removes every trace of it from this host.
    pub fn uninstall(&mut self, app: &str) -> Result<()> {
        validate_name(app)?;

        // The process must be stopped before its working directory disappears.
        self.control(app, Verb::Stop, Policy::Tolerate)?;

        remove_path(&self.layout.home_dir(app))?;
        remove_path(&self.layout.conf_dir(app))?;
        self.registrar().remove_unit(app)?;
        remove_path(&self.layout.staged_zip(app))?;
        remove_path(&self.layout.scratch_dir(app))?;
        self.registrar().reload(&mut self.runner)?;

        tracing::info!(app, "uninstalled");
        Ok(())
    }

    pub fn start(&mut self, app: &str) -> Result<Control> {
        self.control(app, Verb::Start, Policy::FailFast)
    }

    pub fn stop(&mut self, app: &str) -> Result<Control> {
        self.control(app, Verb::Stop, Policy::FailFast)
    }

    /// Asks the supervisor about `app`. A stopped or crashed process is an answer, not an
    /// error.
    pub fn status(&mut self, app: &str) -> Result<Control> {
        self.control(app, Verb::Status, Policy::Tolerate)
    }

    fn control(&mut self, app: &str, verb: Verb, policy: Policy) -> Result<Control> {
        validate_name(app)?;
        let registrar = self.registrar();
        if !registrar.installed(app) {
            tracing::info!(app, %verb, "not installed; nothing to do");
            return Ok(Control::NotInstalled);
        }
        let output = registrar.control(&mut self.runner, verb, app, policy)?;
        Ok(Control::Ran(output))
    }

    /// The steps shared by both install flavors, once the application tree is in place.
    fn register(&mut self, app: &str, upgrade: bool) -> Result<Installed> {
        let seeded_config = self.seed_config(app)?;

        let registrar = self.registrar();
        registrar.write_properties(app)?;
        registrar.write_unit(app)?;
        registrar.reload(&mut self.runner)?;

        Ok(Installed {
            app: app.to_string(),
            upgrade,
            seeded_config,
        })
    }

    /// Copies the artifact's bundled config into the config directory, unless the config
    /// directory already has a main config file. Returns whether it copied anything.
    fn seed_config(&mut self, app: &str) -> Result<bool> {
        if self.layout.main_config(app).exists() {
            return Ok(false);
        }

        let bundled = self.layout.bundled_conf_dir(app);
        self.check_seed_source(app, &bundled)?;
        let conf_dir = self.layout.conf_dir(app);
        copy_tree(&bundled, &conf_dir)?;
        tracing::info!(app, from = %bundled.display(), to = %conf_dir.display(), "seeded config");
        Ok(true)
    }

    /// Fails unless the config directory is already seeded or `bundled` can seed it.
    fn check_seed_source(&self, app: &str, bundled: &Path) -> Result<()> {
        if self.layout.main_config(app).exists() || bundled.is_dir() {
            return Ok(());
        }
        Err(Error::precondition(format!(
            "{} is missing {MAIN_CONFIG}, and the artifact has no conf directory to seed it from",
            self.layout.conf_dir(app).display(),
        )))
    }

    /// Gives the supervisor time to bring up a newly registered process.
    fn settle(&mut self, installed: &Installed) {
        if !installed.upgrade {
            tracing::info!(
                app = %installed.app,
                seconds = self.grace.as_secs_f32(),
                "waiting for first start",
            );
            self.sleeper.sleep(self.grace);
        }
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::io_at(path, e))
}

/// Removes a file, symlink or directory tree. Succeeds if nothing is there.
fn remove_path(path: &Path) -> Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(md) if md.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::io_at(path, err)),
    }
}

/// Removes everything in `dir` except the entries named in `keep`.
fn clear_dir(dir: &Path, keep: &[&str]) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(|e| Error::io_at(dir, e))? {
        let entry = entry.map_err(|e| Error::io_at(dir, e))?;
        if keep.iter().any(|k| entry.file_name().as_os_str() == OsStr::new(k)) {
            continue;
        }
        remove_path(&entry.path())?;
    }
    Ok(())
}

fn unpack(zip: &Path, dest: &Path) -> Result<()> {
    let file = File::open(zip).map_err(|e| Error::io_at(zip, e))?;
    let archive_error = |source| Error::Archive {
        path: zip.to_path_buf(),
        source,
    };
    let mut archive = zip::ZipArchive::new(file).map_err(archive_error)?;
    archive.extract(dest).map_err(archive_error)?;
    tracing::debug!(zip = %zip.display(), dest = %dest.display(), "unpacked");
    Ok(())
}

/// Distribution archives usually wrap everything in one top-level directory named after the
/// application, optionally with a version suffix (`api/` or `api-1.0/`). Returns that directory
/// if present, otherwise `scratch` itself.
fn unpacked_root(scratch: &Path, app: &str) -> Result<PathBuf> {
    let wrapped = scratch.join(app);
    if wrapped.is_dir() {
        return Ok(wrapped);
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(scratch).map_err(|e| Error::io_at(scratch, e))? {
        entries.push(entry.map_err(|e| Error::io_at(scratch, e))?.path());
    }
    if let [only] = entries.as_slice() {
        let versioned = only
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(&format!("{app}-")));
        if versioned && only.is_dir() {
            return Ok(only.clone());
        }
    }
    Ok(scratch.to_path_buf())
}

/// Moves every entry of `from` into `to`, merging directories that exist in both.
fn move_contents(from: &Path, to: &Path) -> Result<()> {
    for entry in fs::read_dir(from).map_err(|e| Error::io_at(from, e))? {
        let entry = entry.map_err(|e| Error::io_at(from, e))?;
        let source = entry.path();
        let target = to.join(entry.file_name());

        if source.is_dir() && target.is_dir() {
            move_contents(&source, &target)?;
            remove_path(&source)?;
            continue;
        }

        remove_path(&target)?;
        if fs::rename(&source, &target).is_err() {
            // Probably a different filesystem. Fall back to copying.
            if source.is_dir() {
                copy_tree(&source, &target)?;
            } else {
                fs::copy(&source, &target).map_err(|e| Error::io_at(&target, e))?;
            }
            remove_path(&source)?;
        }
    }
    Ok(())
}

/// Recursively copies the contents of `from` into `to`, overwriting files that exist in both.
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(from).to_path_buf();
            Error::io_at(path, e.into())
        })?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = to.join(relative);

        if entry.file_type().is_dir() {
            create_dir(&target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| Error::io_at(&target, e))?;
        }
    }
    Ok(())
}
