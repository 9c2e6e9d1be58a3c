//! stagerun - Main entry point
//!
//! Parses the command line, sets up logging and the interrupt handler, and
//! dispatches to the library. All fatal errors end the process here.

use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use stagerun::abort::{AbortHandler, CleanupLatch, init_signal_handlers};
use stagerun::cli::{Cli, Commands};
use stagerun::error::InstallError;
use stagerun::install_config::{ConfigSource, InstallConfig, JsonFileSource, PromptSource};
use stagerun::installer::{self, InstallOptions, STEP_NAMES};
use stagerun::preflight::{Preflight, PreflightReport};

/// Initialize the tracing subscriber (stderr, RUST_LOG overrides the level)
fn init_logger(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(verbose)
        .init();
}

/// Upper bound on waiting for the signal handler to finish unmounting
const ABORT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Main application entry point
fn main() {
    let cli = Cli::parse_args();
    init_logger(cli.verbose);
    debug!("CLI arguments parsed: {:?}", cli);

    // Terminates step scripts and releases mounts on SIGINT/SIGTERM/SIGHUP
    if let Err(e) = init_signal_handlers(AbortHandler::global(&cli.state_dir)) {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    if let Err(e) = run(cli) {
        error!("{}", e);
        if let InstallError::Preflight(failures) = &e {
            eprint!("{}", PreflightReport(failures));
        } else {
            eprintln!("Error: {e}");
        }
        let mut code = e.exit_code();
        if matches!(e, InstallError::Interrupted { .. }) {
            // The handler thread still owns cleanup; exiting now would skip the unmount
            match CleanupLatch::global().wait(ABORT_CLEANUP_TIMEOUT) {
                Some(handler_code) => code = handler_code,
                None => warn!("Abort cleanup did not finish within {:?}", ABORT_CLEANUP_TIMEOUT),
            }
        }
        std::process::exit(code);
    }
}

fn run(cli: Cli) -> Result<(), InstallError> {
    let command = cli.command.clone().unwrap_or_else(Commands::default_install);

    match command {
        Commands::Install {
            config,
            yes,
            no_persist_secrets,
            no_reboot,
            mount_root,
        } => {
            let options = InstallOptions {
                state_dir: cli.state_dir,
                scripts_dir: cli.scripts_dir,
                mount_root,
                config_file: config.clone(),
                assume_yes: yes,
                persist_secrets: !no_persist_secrets,
                reboot: !no_reboot,
                dry_run: cli.dry_run,
                preflight: Preflight::from_env(),
            };
            if options.dry_run {
                info!("Dry-run mode: no scripts run and nothing is recorded");
            }

            let mut source: Box<dyn ConfigSource> = match config {
                Some(path) => Box::new(JsonFileSource::new(path)),
                None => Box::new(PromptSource::new(io::stdin().lock(), io::stderr())),
            };
            let report = installer::run_install(&options, source.as_mut())?;
            println!("Install complete: {report}");
        }
        Commands::Status => {
            let report = installer::status(&cli.state_dir)?;
            print!("{report}");
        }
        Commands::Preflight => {
            Preflight::from_env().validate()?;
            println!("All pre-flight checks passed");
        }
        Commands::Reset { all } => {
            reset_state(cli.dry_run, &cli.state_dir, all)?;
        }
        Commands::Steps => {
            for (i, name) in STEP_NAMES.iter().enumerate() {
                println!("{:>2}. {}", i + 1, name);
            }
        }
        Commands::Validate { config } => {
            info!("Validating configuration file: {:?}", config);
            InstallConfig::load_from_file(&config)
                .and_then(|c| c.validate())
                .map_err(|e| InstallError::config(format!("{e:#}")))?;
            println!("Configuration file is valid: {}", config.display());
        }
    }

    Ok(())
}

fn reset_state(dry_run: bool, state_dir: &Path, all: bool) -> Result<(), InstallError> {
    if dry_run {
        println!(
            "[dry-run] Would clear completion records{} in {}",
            if all { " and saved configuration" } else { "" },
            state_dir.display()
        );
        return Ok(());
    }
    installer::reset(state_dir, all)?;
    println!("Reset {}", state_dir.display());
    Ok(())
}
