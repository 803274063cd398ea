//! proxy-forwarder: multi-tenant SOCKS5 front door
//!
//! This is the main entry point for the forwarder process.
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! ./proxy-forwarder
//!
//! # Run with custom configuration
//! ./proxy-forwarder -c /path/to/config.json
//!
//! # Run with environment overrides
//! FORWARDER_PUBLIC_PROXY_PORT=1080 FORWARDER_LOG_LEVEL=debug ./proxy-forwarder
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use proxy_forwarder::config::{load_config_with_env, LogConfig};
use proxy_forwarder::ProxyForwarder;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/proxy-forwarder/config.json");
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-g" | "--generate-config" => {
                    generate_config = true;
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("proxy-forwarder v{}", proxy_forwarder::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"proxy-forwarder v{}

Multi-tenant SOCKS5 front door for a rotating upstream HTTP proxy gateway.

USAGE:
    proxy-forwarder [OPTIONS]

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/proxy-forwarder/config.json]
    -g, --generate-config   Generate default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    FORWARDER_PUBLIC_PROXY_PORT     Override SOCKS5 listen port
    FORWARDER_INSIDE_SOCKET_PORT    Override loopback control port
    FORWARDER_PROXY_HOST            Override upstream gateway host
    FORWARDER_PROXY_PORT            Override upstream gateway port
    FORWARDER_PROXY_USERNAME        Override upstream gateway username
    FORWARDER_PROXY_BASE_PASSWORD   Override upstream base password
    FORWARDER_INACTIVE_TIMEOUT      Override entry point inactivity timeout (seconds)
    FORWARDER_BUFFER_SIZE           Override relay read size (bytes)
    FORWARDER_LOG_LEVEL             Override log level (trace, debug, info, warn, error)
"#,
        proxy_forwarder::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &LogConfig) {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.target);

    if config.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();

    let args = Args::parse();

    if args.generate_config {
        proxy_forwarder::config::create_default_config(&args.config_path)?;
        println!("Generated default configuration at {:?}", args.config_path);
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config.log);

    info!("proxy-forwarder v{}", proxy_forwarder::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    let forwarder = Arc::new(ProxyForwarder::new(config));
    let mut run_handle = tokio::spawn(Arc::clone(&forwarder).run());

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    let finished = tokio::select! {
        result = &mut run_handle => Some(result),
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
            None
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
            None
        }
    };

    let result = match finished {
        Some(result) => result,
        None => {
            forwarder.shutdown();
            match tokio::time::timeout(Duration::from_secs(5), run_handle).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Listeners did not stop within 5s");
                    return Ok(());
                }
            }
        }
    };

    match result {
        Ok(Ok(())) => {
            info!("Shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "Forwarder failed");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("Forwarder task failed: {e}")),
    }
}

/// Wait for SIGTERM signal
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
