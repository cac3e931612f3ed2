use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use lowmemd::config::{FileProperties, DEFAULT_PROPERTIES_PATH};
use lowmemd::control::{protocol, CONTROL_SOCKET_PATH};
use lowmemd::daemon::Daemon;
use lowmemd::logging;

/// Userspace low-memory killer daemon.
#[derive(Parser, Debug)]
#[command(name = "lowmemd", version, about)]
struct CliArgs {
    /// Ask a running daemon to re-read its tunables and reinitialize its
    /// pressure monitors.
    #[arg(long)]
    reinit: bool,

    /// Notify a running daemon that the system finished booting.
    #[arg(long = "boot_completed")]
    boot_completed: bool,
}

fn issue_reinit() -> ExitCode {
    let mut stream = match protocol::connect(Path::new(CONTROL_SOCKET_PATH)) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to connect to lowmemd: {e}");
            return ExitCode::FAILURE;
        }
    };
    match protocol::request_update_props(&mut stream) {
        Ok(0) => {
            info!("lowmemd updated properties successfully");
            ExitCode::SUCCESS
        }
        Ok(_) => {
            error!("lowmemd failed to update its properties");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("failed to complete lowmemd request: {e}");
            ExitCode::FAILURE
        }
    }
}

fn notify_boot_completed() -> ExitCode {
    let mut stream = match protocol::connect(Path::new(CONTROL_SOCKET_PATH)) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to connect to lowmemd: {e}");
            return ExitCode::FAILURE;
        }
    };
    match protocol::request_boot_completed(&mut stream) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(1) => {
            log::warn!("lowmemd already handled boot-completed operations");
            ExitCode::FAILURE
        }
        Ok(_) => {
            error!("lowmemd failed to handle the boot-completed notification");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("failed to complete lowmemd request: {e}");
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    if let Err(e) = logging::setup_logging(logging::level_from_env()) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }

    let args = CliArgs::parse();
    if args.reinit {
        return issue_reinit();
    }
    if args.boot_completed {
        return notify_boot_completed();
    }

    let props = Box::new(FileProperties::load(DEFAULT_PROPERTIES_PATH));
    let mut daemon = match Daemon::new(props) {
        Ok(d) => d,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = daemon.init() {
        error!("{e}");
        return ExitCode::FAILURE;
    }
    match daemon.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
