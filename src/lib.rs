//! Remote application lifecycle management for SZ services.
//!
//! sz-deploy installs, upgrades, starts, stops and removes long-running services on a managed
//! host, and manages the static sites and reverse-proxy configs that sit in front of them.
//!
//! # Program flow
//!
//! There are two binaries, one on each side of an SSH connection.
//!
//! 1. On the operator's machine, `sz-deploy` builds the project locally, connects to the managed
//!    host ([session]), and pushes `sz-setup` to it.
//!
//! 2. `sz-deploy` then drives the host through an ordered list of steps ([deploy]): file
//!    transfers with `rsync` ([sync]) and `sz-setup` invocations over SSH.
//!
//! 3. On the managed host, each `sz-setup` invocation runs one transition of the lifecycle
//!    state machine ([lifecycle]) against the host's filesystem and `supervisord`
//!    ([supervisor]).
//!
//! Both sides agree on where everything lives through [layout]. Every step is ordered and
//! blocking; the first step that fails aborts the run, and its exit status becomes the exit
//! status of the binary.

pub mod config;
pub mod deploy;
pub mod error;
pub mod exec;
pub mod layout;
pub mod lifecycle;
pub mod session;
pub mod supervisor;
pub mod sync;

#[doc(inline)]
pub use error::{Error, Result};

#[doc(inline)]
pub use layout::Layout;

#[doc(inline)]
pub use lifecycle::Engine;

#[cfg(test)]
pub mod fixtures {
    use crate::error::Result;
    use crate::exec::{CommandLine, CommandOutput, Policy, Run};
    use crate::lifecycle::Sleep;
    use std::collections::HashMap;
    use std::fs::{self, File};
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    /// A fake [Run] that records commands instead of running them.
    ///
    /// Every command succeeds unless given a different exit code with [Self::exit_code].
    #[derive(Debug, Default)]
    pub struct FakeRunner {
        pub commands: Vec<CommandLine>,
        exit_codes: HashMap<String, i32>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the command displayed as `command` exit with `code`.
        pub fn exit_code(&mut self, command: &str, code: i32) {
            self.exit_codes.insert(command.to_string(), code);
        }
    }

    impl Run for FakeRunner {
        fn run(&mut self, command: &CommandLine, policy: Policy) -> Result<CommandOutput> {
            self.commands.push(command.clone());
            let status = self.exit_codes.get(&command.display()).copied().unwrap_or(0);
            CommandOutput {
                lines: vec![],
                status: Some(status),
            }
            .check(command, policy)
        }
    }

    /// A fake [Sleep] that records how long it was asked to sleep.
    #[derive(Debug, Default)]
    pub struct FakeSleep {
        pub sleeps: Vec<Duration>,
    }

    impl Sleep for FakeSleep {
        fn sleep(&mut self, duration: Duration) {
            self.sleeps.push(duration);
        }
    }

    /// The contents of a distribution zip for [stage_artifact].
    #[derive(Clone, Debug)]
    pub struct Artifact {
        /// Written to `lib/<app>.jar`.
        pub version: &'static str,

        /// Written to `conf/application.conf`.
        pub bundled_config: &'static str,

        /// Whether to include the `conf` directory at all.
        pub with_config: bool,

        /// Whether everything sits under a top-level `<app>/` directory.
        pub wrapped: bool,

        /// Overrides the name of the top-level directory when [Self::wrapped] is set.
        pub wrapper: Option<&'static str>,
    }

    impl Default for Artifact {
        fn default() -> Self {
            Self {
                version: "v1",
                bundled_config: "bundled",
                with_config: true,
                wrapped: true,
                wrapper: None,
            }
        }
    }

    /// Writes a distribution zip for `app` to `path`.
    pub fn stage_artifact(path: &Path, app: &str, artifact: &Artifact) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        let dirs = SimpleFileOptions::default().unix_permissions(0o755);
        let files = SimpleFileOptions::default().unix_permissions(0o644);
        let prefix = if artifact.wrapped {
            format!("{}/", artifact.wrapper.unwrap_or(app))
        } else {
            String::new()
        };

        let mut entries = vec![
            (format!("bin/{app}"), "#!/bin/sh\n", dirs),
            (format!("lib/{app}.jar"), artifact.version, files),
        ];
        if artifact.with_config {
            entries.push(("conf/application.conf".into(), artifact.bundled_config, files));
            entries.push(("conf/logback.xml".into(), "<configuration/>", files));
        }

        for dir in ["bin/", "lib/", "conf/"] {
            if dir == "conf/" && !artifact.with_config {
                continue;
            }
            zip.add_directory(format!("{prefix}{dir}"), dirs).unwrap();
        }
        for (name, contents, options) in entries {
            zip.start_file(format!("{prefix}{name}"), options).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
}
