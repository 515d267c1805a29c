//! piped - Entry Point
//!
//! Plans and runs the deployments of the applications bound to this piped,
//! reports drift between Git and the live state and answers plan-preview
//! commands.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use piped::app::options::AppOptions;
use piped::app::run::run;
use piped::config::piped::PipedConfig;
use piped::logs::{init_logging, LogLevel, LogOptions};
use piped::utils::version_info;

use tracing::{error, info};

const USAGE: &str =
    "Usage: piped --config-file=PATH [--log-level=LEVEL] [--log-json] [--log-dir=DIR] [--version]";

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(v) => println!("{}", v),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    let Some(config_file) = cli_args.get("config-file").map(PathBuf::from) else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let log_level = match cli_args.get("log-level").map(|l| l.parse::<LogLevel>()) {
        Some(Ok(level)) => level,
        Some(Err(e)) => {
            eprintln!("{}\n{}", e, USAGE);
            std::process::exit(2);
        }
        None => LogLevel::default(),
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level,
        json_format: cli_args.contains_key("log-json"),
        log_dir: cli_args.get("log-dir").map(PathBuf::from),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // The configuration is read once here for the worker intervals, the run
    // loop loads it again to build the shared state
    let spec = match PipedConfig::load(&config_file).await {
        Ok(cfg) => cfg.spec,
        Err(e) => {
            error!("Unable to read piped configuration {}: {}", config_file.display(), e);
            std::process::exit(1);
        }
    };
    let options = AppOptions::from_spec(config_file, &spec);

    info!("Running piped {} with options: {:?}", version.version, options);
    let result = run(version.version, options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run piped: {e}");
        std::process::exit(1);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            _ => {
                error!("Failed to install signal handlers, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
