//! Mirrors local files and directory trees onto the managed host with `rsync` over SSH.

use crate::error::Result;
use crate::exec::{utf8_path, CommandLine, CommandOutput, Policy, Run};
use std::path::{Path, PathBuf};

/// How to reach the managed host. Shared by the SSH session and by `rsync`'s SSH transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key: PathBuf,
}

impl Endpoint {
    /// `user@host:path`, the destination notation understood by `rsync` and `scp`.
    pub fn remote_spec(&self, path: &str) -> String {
        format!("{}@{}:{}", self.user, self.host, path)
    }

    /// The remote shell `rsync` should use to reach this endpoint.
    fn transport(&self) -> String {
        // rsync splits -e on white space itself and honors quotes, so quote the key path in case
        // it contains spaces.
        let key = self.key.to_string_lossy();
        let key = shlex::try_quote(&key)
            .map(|q| q.into_owned())
            .unwrap_or_else(|_| key.into_owned());
        format!("ssh -i {key} -p {}", self.port)
    }
}

/// One transfer from the operator's machine to the managed host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncRequest {
    /// The local file or directory. A trailing `/` means "the contents of this directory".
    pub local: String,

    /// The destination on the managed host.
    pub remote: String,

    /// Remove destination entries that don't exist locally.
    pub delete: bool,

    /// Patterns that [Self::delete] must never remove, e.g. runtime logs.
    pub exclusions: Vec<String>,
}

impl SyncRequest {
    /// Copies a single file or a whole directory (as a subdirectory) into `remote_dir`.
    pub fn into_dir(local: &Path, remote_dir: &Path) -> Result<Self> {
        Ok(Self {
            local: utf8_path(local)?,
            remote: with_trailing_slash(utf8_path(remote_dir)?),
            delete: false,
            exclusions: Vec::new(),
        })
    }

    /// Copies a single file to exactly `remote_file`.
    pub fn file(local: &Path, remote_file: &Path) -> Result<Self> {
        Ok(Self {
            local: utf8_path(local)?,
            remote: utf8_path(remote_file)?,
            delete: false,
            exclusions: Vec::new(),
        })
    }

    /// Copies the contents of `local_dir` into `remote_dir`.
    pub fn contents(local_dir: &Path, remote_dir: &Path) -> Result<Self> {
        Ok(Self {
            local: with_trailing_slash(utf8_path(local_dir)?),
            remote: with_trailing_slash(utf8_path(remote_dir)?),
            delete: false,
            exclusions: Vec::new(),
        })
    }

    pub fn delete(mut self, delete: bool) -> Self {
        self.delete = delete;
        self
    }

    pub fn exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclusions.extend(patterns.into_iter().map(Into::into));
        self
    }

    /// Builds the `rsync` invocation for this request.
    pub fn command(&self, endpoint: &Endpoint) -> CommandLine {
        let mut command = CommandLine::new("rsync").arg("-av");
        if self.delete {
            command = command.arg("--delete");
        }
        for pattern in &self.exclusions {
            command = command.arg("--exclude").arg(pattern.as_str());
        }
        command
            .arg("--progress")
            .arg("-e")
            .arg(endpoint.transport())
            .arg(self.local.as_str())
            .arg(endpoint.remote_spec(&self.remote))
    }
}

/// Runs `request` through `runner`. A failed transfer always aborts.
pub fn sync<R: Run + ?Sized>(
    runner: &mut R,
    endpoint: &Endpoint,
    request: &SyncRequest,
) -> Result<CommandOutput> {
    tracing::debug!(
        local = %request.local,
        remote = %request.remote,
        delete = request.delete,
        exclusions = ?request.exclusions,
        "syncing",
    );
    runner.run(&request.command(endpoint), Policy::FailFast)
}

fn with_trailing_slash(mut path: String) -> String {
    if !path.ends_with('/') {
        path.push('/');
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::LocalRunner;
    use std::fs;
    use std::process::{Command, Stdio};
    use tempfile::TempDir;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "10.0.0.5".into(),
            port: 10022,
            user: "root".into(),
            key: "/home/ops/.ssh/id_rsa".into(),
        }
    }

    #[test]
    fn plain_copy() {
        let request =
            SyncRequest::into_dir(Path::new("/tmp/api.zip"), Path::new("/sz/deploy/zips"))
                .unwrap();
        assert_eq!(
            vec![
                "-av",
                "--progress",
                "-e",
                "ssh -i /home/ops/.ssh/id_rsa -p 10022",
                "/tmp/api.zip",
                "root@10.0.0.5:/sz/deploy/zips/",
            ],
            request.command(&endpoint()).args,
        );
    }

    #[test]
    fn delete_with_exclusions() {
        let request = SyncRequest::into_dir(
            Path::new("/work/api/build/install/api"),
            Path::new("/sz/apps"),
        )
        .unwrap()
        .delete(true)
        .exclude(["logs/", "h2db/"]);

        let command = request.command(&endpoint());
        assert_eq!("rsync", command.program);
        assert_eq!(
            vec![
                "-av",
                "--delete",
                "--exclude",
                "logs/",
                "--exclude",
                "h2db/",
                "--progress",
                "-e",
                "ssh -i /home/ops/.ssh/id_rsa -p 10022",
                "/work/api/build/install/api",
                "root@10.0.0.5:/sz/apps/",
            ],
            command.args,
        );
    }

    /// The command `request` renders, aimed at a local directory instead of the managed host.
    fn local_command(request: &SyncRequest, destination: &Path) -> CommandLine {
        let mut args = request.command(&endpoint()).args;
        args.pop();
        let transport = args.iter().position(|arg| arg == "-e").unwrap();
        args.drain(transport..transport + 2);
        CommandLine::new("rsync")
            .args(args)
            .arg(format!("{}/", destination.display()))
    }

    fn rsync_available() -> bool {
        Command::new("rsync")
            .arg("--version")
            .stdout(Stdio::null())
            .status()
            .is_ok_and(|status| status.success())
    }

    #[test]
    fn delete_spares_excluded_directories() {
        if !rsync_available() {
            eprintln!("skipping: rsync is not installed");
            return;
        }
        let dir = TempDir::with_prefix("sz-deploy-").unwrap();
        let build = dir.path().join("build/install/api");
        fs::create_dir_all(build.join("bin")).unwrap();
        fs::write(build.join("bin/api"), "#!/bin/sh\n").unwrap();

        let apps = dir.path().join("apps");
        let installed = apps.join("api");
        fs::create_dir_all(installed.join("logs")).unwrap();
        fs::create_dir_all(installed.join("h2db")).unwrap();
        fs::write(installed.join("stale.jar"), "old").unwrap();
        fs::write(installed.join("logs/app.log"), "started\n").unwrap();
        fs::write(installed.join("h2db/db.mv"), "rows").unwrap();

        let request = SyncRequest::into_dir(&build, Path::new("/sz/apps"))
            .unwrap()
            .delete(true)
            .exclude(["logs/", "h2db/"]);
        LocalRunner::new(Vec::new())
            .run(&local_command(&request, &apps), Policy::FailFast)
            .unwrap();

        assert!(installed.join("bin/api").is_file());
        assert!(!installed.join("stale.jar").exists());
        assert_eq!(
            "started\n",
            fs::read_to_string(installed.join("logs/app.log")).unwrap()
        );
        assert_eq!("rows", fs::read_to_string(installed.join("h2db/db.mv")).unwrap());
    }

    #[test]
    fn contents_use_trailing_slashes() {
        let request =
            SyncRequest::contents(Path::new("/work/site"), Path::new("/web_html/site")).unwrap();
        assert_eq!("/work/site/", request.local);
        assert_eq!("/web_html/site/", request.remote);
    }

    #[test]
    fn single_file_keeps_its_destination_name() {
        let request = SyncRequest::file(
            Path::new("/home/ops/.cargo/bin/sz-setup"),
            Path::new("/usr/local/bin/sz-setup"),
        )
        .unwrap();
        assert_eq!(
            Some(&"root@10.0.0.5:/usr/local/bin/sz-setup".to_string()),
            request.command(&endpoint()).args.last(),
        );
    }

    #[test]
    fn key_with_spaces_is_quoted() {
        let mut endpoint = endpoint();
        endpoint.key = "/home/ops/my keys/id".into();
        let request = SyncRequest::contents(Path::new("/a"), Path::new("/b")).unwrap();
        let command = request.command(&endpoint);
        assert!(command
            .args
            .contains(&"ssh -i '/home/ops/my keys/id' -p 10022".to_string()));
    }
}
