//! The operator-side half of sz-deploy. Builds projects locally and drives a managed host over
//! SSH.

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use sz_deploy::config::Settings;
use sz_deploy::deploy::{Deployer, Mode, Project};
use sz_deploy::exec::LocalRunner;
use sz_deploy::session::SshSession;
use tracing_subscriber::EnvFilter;

/// Deploys supervised applications, static sites and proxy configs to a managed host
#[derive(Parser)]
#[command(name = "sz-deploy")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Managed host to connect to
    #[arg(long, global = true)]
    host: Option<String>,

    /// SSH port of the managed host
    #[arg(long, global = true)]
    port: Option<u16>,

    /// SSH private key
    #[arg(long, global = true)]
    ssh_key: Option<PathBuf>,

    /// Remote user
    #[arg(long, global = true)]
    user: Option<String>,

    /// Config file (default: ~/.config/sz-deploy/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Give up on any single remote command after this many seconds
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Local sz-setup binary to push to the managed host
    #[arg(long, global = true)]
    setup_tool: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a project and install or upgrade it on the managed host
    App {
        /// Project directory
        #[arg(long)]
        prj_dir: PathBuf,

        /// Application name (default: the project directory's name)
        #[arg(long)]
        app_name: Option<String>,

        /// How to ship the build
        #[arg(long, value_enum, default_value_t = Mode::Zip)]
        mode: Mode,
    },

    /// Push config files for an installed application and restart it
    Conf {
        /// Project directory
        #[arg(long)]
        prj_dir: PathBuf,

        /// Directory holding the config files
        #[arg(long)]
        conf_dir: PathBuf,

        /// Application name (default: the project directory's name)
        #[arg(long)]
        app_name: Option<String>,
    },

    /// Remove an application from the managed host
    Undeploy {
        /// Project directory
        #[arg(long)]
        prj_dir: PathBuf,

        /// Application name (default: the project directory's name)
        #[arg(long)]
        app_name: Option<String>,
    },

    /// Upload an nginx config and check it with `nginx -t`
    #[command(name = "install_nginx_conf", alias = "install-nginx-conf")]
    InstallNginxConf {
        /// The .conf file to upload
        #[arg(long)]
        conf_file: PathBuf,
    },

    /// Remove an nginx config
    #[command(name = "uninstall_nginx_conf", alias = "uninstall-nginx-conf")]
    UninstallNginxConf {
        /// Config name, with or without the .conf extension
        #[arg(long)]
        conf_name: String,
    },

    /// List the nginx configs
    #[command(name = "list_nginx_conf", alias = "list-nginx-conf")]
    ListNginxConf,

    /// Print an nginx config
    #[command(name = "dump_nginx_conf", alias = "dump-nginx-conf")]
    DumpNginxConf {
        /// Config name, with or without the .conf extension
        #[arg(long)]
        conf_name: String,
    },

    /// Mirror a directory of static files into the web root
    #[command(name = "install_web_app", alias = "install-web-app")]
    InstallWebApp {
        /// Directory holding the site
        #[arg(long)]
        web_dir: PathBuf,

        /// Site name (default: the directory's name)
        #[arg(long)]
        web_name: Option<String>,
    },

    /// Delete a site from the web root
    #[command(name = "uninstall_web_app", alias = "uninstall-web-app")]
    UninstallWebApp {
        /// Site name
        #[arg(long)]
        web_name: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .without_time()
        .init();

    let mut cli = Cli::parse();
    let Some(command) = cli.command.take() else {
        // Printing help is best effort; the exit status is what matters.
        let _ = Cli::command().print_help();
        return ExitCode::FAILURE;
    };

    match run(cli, command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code(&err)
        }
    }
}

fn run(cli: Cli, command: Commands) -> anyhow::Result<()> {
    let settings = settings(cli)?;
    let endpoint = settings.endpoint();
    let session = SshSession::connect(&endpoint, settings.timeout())
        .with_context(|| format!("could not connect to {}", endpoint.host))?;

    let mut deployer = Deployer::new(session, LocalRunner::stdout(), settings);
    let result = deployer
        .push_setup_tool()
        .context("could not push sz-setup")
        .and_then(|()| dispatch(&mut deployer, command));

    // Keep the first error; a failure to close only matters if everything else worked.
    let closed = deployer.into_session().close();
    result?;
    closed?;
    Ok(())
}

fn settings(cli: Cli) -> anyhow::Result<Settings> {
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(user) = cli.user {
        settings.user = user;
    }
    if let Some(key) = cli.ssh_key {
        settings.ssh_key = key;
    }
    if let Some(timeout) = cli.timeout {
        settings.timeout_secs = Some(timeout);
    }
    if let Some(tool) = cli.setup_tool {
        settings.setup_tool = Some(tool);
    }
    Ok(settings)
}

fn dispatch(
    deployer: &mut Deployer<SshSession, LocalRunner<std::io::Stdout>>,
    command: Commands,
) -> anyhow::Result<()> {
    match command {
        Commands::App {
            prj_dir,
            app_name,
            mode,
        } => {
            let project = Project::new(prj_dir, app_name.as_deref())?;
            deployer
                .deploy_app(&project, mode)
                .with_context(|| format!("could not deploy [{}]", project.app))?;
            println!("application [{}] deployed", project.app);
        }
        Commands::Conf {
            prj_dir,
            conf_dir,
            app_name,
        } => {
            let project = Project::new(prj_dir, app_name.as_deref())?;
            deployer
                .deploy_conf(&project, &conf_dir)
                .with_context(|| format!("could not deploy config for [{}]", project.app))?;
            println!("application [{}] config deployed", project.app);
        }
        Commands::Undeploy { prj_dir, app_name } => {
            let project = Project::new(prj_dir, app_name.as_deref())?;
            deployer
                .undeploy(&project)
                .with_context(|| format!("could not undeploy [{}]", project.app))?;
            println!("application [{}] undeployed", project.app);
        }
        Commands::InstallNginxConf { conf_file } => {
            let name = deployer.install_proxy_conf(&conf_file)?;
            println!("nginx config [{name}] installed");
        }
        Commands::UninstallNginxConf { conf_name } => {
            let name = deployer.uninstall_proxy_conf(&conf_name)?;
            println!("nginx config [{name}] removed");
        }
        Commands::ListNginxConf => {
            deployer.list_proxy_confs()?;
        }
        Commands::DumpNginxConf { conf_name } => {
            deployer.dump_proxy_conf(&conf_name)?;
        }
        Commands::InstallWebApp { web_dir, web_name } => {
            let site = deployer.install_web_app(&web_dir, web_name.as_deref())?;
            println!("web app [{site}] installed");
        }
        Commands::UninstallWebApp { web_name } => {
            deployer.uninstall_web_app(&web_name)?;
            println!("web app [{web_name}] removed");
        }
    }
    Ok(())
}

/// A failed command passes its own exit code through; anything else exits 1.
fn exit_code(err: &anyhow::Error) -> ExitCode {
    let code = err
        .downcast_ref::<sz_deploy::Error>()
        .map(sz_deploy::Error::exit_code)
        .unwrap_or(1);
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
