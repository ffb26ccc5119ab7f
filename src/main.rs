#![forbid(unsafe_code)]

mod app;
mod cli;
mod config;
mod constants;
mod instance;
mod ipc;
mod power;
mod tray;

use anyhow::Result;
use std::process::ExitCode;
use tracing::{debug, error, info, warn, Level as TraceLevel};
use tracing_subscriber::FmtSubscriber;

use app::OwnerSetup;
use cli::{Action, Cli};
use instance::{InstanceRegistry, Role};
use ipc::IpcFlags;
use power::KeepAwakeBackend;
use tray::TrayPresence;

fn run(cli: Cli, flags: IpcFlags) -> Result<()> {
    let registry = InstanceRegistry::new(match cli.runtime_dir {
        Some(dir) => dir,
        None => ipc::default_runtime_dir()?,
    });

    match instance::start(&registry, flags)? {
        Role::Delegate => Ok(()),
        Role::Owner(lock) => {
            let config_path = match cli.config {
                Some(path) => path,
                None => config::default_config_path()?,
            };
            let setup = OwnerSetup {
                registry,
                lock,
                config_path,
                initial: flags,
                handle_signals: true,
            };
            app::run_owner(setup, KeepAwakeBackend::default(), TrayPresence::register)
        }
    }
}

/// Log the full error chain and raise a desktop notification, since a
/// launcher-started process has no visible stderr
fn report_fatal(e: &anyhow::Error) {
    error!("{e:#}");

    let (summary, body) = fatal_notice(e);
    let shown = notify_rust::Notification::new()
        .summary(&summary)
        .body(&body)
        .appname(constants::app::NAME)
        .icon(constants::tray::ICON_INACTIVE)
        .show();
    if let Err(e) = shown {
        warn!(error = %e, "Failed to show error notification");
    }
}

/// Notification summary and body; the body carries every cause in the chain
fn fatal_notice(e: &anyhow::Error) -> (String, String) {
    (format!("{} failed", constants::app::NAME), format!("{e:#}"))
}

fn main() -> ExitCode {
    // Parse log level from environment variable
    let log_level = match std::env::var("LOG_LEVEL")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => TraceLevel::TRACE,
        "debug" => TraceLevel::DEBUG,
        "warn" => TraceLevel::WARN,
        "error" => TraceLevel::ERROR,
        _ => TraceLevel::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to install log subscriber: {e}");
    }

    let cli = Cli::parse_lenient(std::env::args_os());
    let overrides = match cli.action() {
        Action::Help => {
            cli::print_usage();
            return ExitCode::SUCCESS;
        }
        Action::Run(overrides) => overrides,
    };

    if overrides.is_empty() {
        debug!("No power switches given");
    }
    let flags = IpcFlags::encode(overrides);
    info!(flags = flags.bits(), "Starting {}", constants::app::NAME);

    match run(cli, flags) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_fatal(&e);
            ExitCode::FAILURE
        }
    }
}
