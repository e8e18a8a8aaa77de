//! The host-side half of sz-deploy. Runs one lifecycle transition on the machine it is invoked
//! on, usually by `sz-deploy` over SSH.

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use sz_deploy::exec::LocalRunner;
use sz_deploy::lifecycle::{Control, Engine, Installed, ThreadSleep};
use sz_deploy::Layout;
use tracing_subscriber::EnvFilter;

/// Installs, upgrades, starts, stops and removes supervised applications on this host
#[derive(Parser)]
#[command(name = "sz-setup")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Treat this directory as the filesystem root
    #[arg(long, global = true, default_value = "/", hide = true)]
    root: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the application's directories
    Init(App),

    /// Install or upgrade from the tree already synced into the application home
    Install(App),

    /// Install or upgrade from the staged distribution zip
    Installzip(App),

    /// Stop and remove the application, its config and its supervisor unit
    Uninstall(App),

    /// Start the application
    Start(App),

    /// Stop the application
    Stop(App),

    /// Show the application's process status
    Status(App),
}

#[derive(clap::Args)]
struct App {
    /// Name of the application
    #[arg(long)]
    app_name: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .without_time()
        .init();

    let cli = Cli::parse();
    let Some(command) = cli.command else {
        // Printing help is best effort; the exit status is what matters.
        let _ = Cli::command().print_help();
        return ExitCode::FAILURE;
    };

    match run(&Layout::new(cli.root), command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code(&err)
        }
    }
}

fn run(layout: &Layout, command: Commands) -> anyhow::Result<()> {
    let mut engine = Engine::new(layout, LocalRunner::stdout(), ThreadSleep);

    match command {
        Commands::Init(App { app_name }) => {
            engine
                .init(&app_name)
                .with_context(|| format!("could not initialize [{app_name}]"))?;
            println!("application [{app_name}] initialized");
        }
        Commands::Install(App { app_name }) => {
            let installed = engine
                .install_tree(&app_name)
                .with_context(|| format!("could not install [{app_name}]"))?;
            report_install(&installed);
        }
        Commands::Installzip(App { app_name }) => {
            let installed = engine
                .install_zip(&app_name)
                .with_context(|| format!("could not install [{app_name}]"))?;
            report_install(&installed);
        }
        Commands::Uninstall(App { app_name }) => {
            engine
                .uninstall(&app_name)
                .with_context(|| format!("could not uninstall [{app_name}]"))?;
            println!("application [{app_name}] uninstalled");
        }
        Commands::Start(App { app_name }) => {
            report_control(&app_name, engine.start(&app_name)?);
        }
        Commands::Stop(App { app_name }) => {
            report_control(&app_name, engine.stop(&app_name)?);
        }
        Commands::Status(App { app_name }) => {
            report_control(&app_name, engine.status(&app_name)?);
        }
    }
    Ok(())
}

fn report_install(installed: &Installed) {
    let app = &installed.app;
    if installed.seeded_config {
        println!("application [{app}] config seeded from the artifact");
    }
    if installed.upgrade {
        println!("application [{app}] upgraded");
    } else {
        println!("application [{app}] installed");
    }
}

fn report_control(app: &str, control: Control) {
    if matches!(control, Control::NotInstalled) {
        println!("application [{app}] is not installed");
    }
}

/// A failed command passes its own exit code through; anything else exits 1.
fn exit_code(err: &anyhow::Error) -> ExitCode {
    let code = err
        .downcast_ref::<sz_deploy::Error>()
        .map(sz_deploy::Error::exit_code)
        .unwrap_or(1);
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
