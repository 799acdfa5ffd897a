//! netem-router: userspace network emulator for satellite/DTC links
//!
//! This is the daemon entry point. The tun fd is acquired by a
//! collaborator (the platform's VPN service) and handed over by number.
//!
//! # Usage
//!
//! ```bash
//! # Run against an inherited tun fd
//! netem-router -c /etc/netem-router/config.json --tun-fd 3
//!
//! # Generate a default configuration
//! netem-router -g > config.json
//!
//! # Validate a configuration
//! netem-router -c config.json --check
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use netem_router::config::{default_config_json, load_config_with_env};
use netem_router::router::{Router, RouterEvent};
use netem_router::session::NoopProtector;
use netem_router::tun::{FdTun, TunInterface};

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Tun file descriptor inherited from the collaborator
    tun_fd: Option<i32>,
    /// Generate default configuration
    generate_config: bool,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/netem-router/config.json");
        let mut tun_fd = None;
        let mut generate_config = false;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--tun-fd" => {
                    if let Some(fd) = args.next() {
                        match fd.parse() {
                            Ok(fd) => tun_fd = Some(fd),
                            Err(_) => {
                                eprintln!("Invalid fd: {fd}");
                                std::process::exit(1);
                            }
                        }
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
                    println!("netem-router v{}", netem_router::VERSION);
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
            tun_fd,
            generate_config,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"netem-router v{}

Userspace network emulator: impairs traffic between a tun device and the
real network with configurable latency, jitter and loss.

USAGE:
    netem-router [OPTIONS] --tun-fd <FD>

OPTIONS:
    -c, --config <PATH>     Configuration file path [default: /etc/netem-router/config.json]
    --tun-fd <FD>           Tun file descriptor inherited from the launcher
    -g, --generate-config   Print the default configuration and exit
    --check                 Check configuration and exit
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    NETEM_ROUTER_LOG_LEVEL           Override log level (trace, debug, info, warn, error)
    NETEM_ROUTER_TUN_ADDR            Override the tun address
    NETEM_ROUTER_IDLE_TIMEOUT_SECS   Override the session idle horizon
"#,
        netem_router::VERSION
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        println!("{}", default_config_json());
        return Ok(());
    }

    let config = load_config_with_env(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path.display()))?;

    if args.check_config {
        println!("Configuration OK: {}", args.config_path.display());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone())),
        )
        .init();

    let Some(fd) = args.tun_fd else {
        bail!("--tun-fd is required (the launcher owns the VPN permission dance)");
    };

    // Safety: the launcher transfers ownership of the fd via --tun-fd.
    let tun: Arc<dyn TunInterface> =
        Arc::new(unsafe { FdTun::from_raw_fd(fd) }.context("adopting tun fd")?);

    let profile = config.build_profile()?;
    let (router, handle, mut events) = Router::new(
        tun,
        config.router_config(),
        profile,
        Arc::new(NoopProtector),
    );

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                RouterEvent::TunClosed { fatal } if fatal => {
                    warn!("tun closed, router is shutting down");
                }
                RouterEvent::ShutdownComplete => info!("shutdown complete"),
                _ => {}
            }
        }
    });

    let runner = tokio::spawn(router.run());

    info!("netem-router v{} running, ctrl-c to stop", netem_router::VERSION);
    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("ctrl-c received, stopping router");

    if let Err(e) = handle.stop().await {
        // Router already stopped on its own (for instance tun closure).
        warn!(error = %e, "stop command not delivered");
    }

    match runner.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "router exited with error");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "router task panicked");
            Err(e.into())
        }
    }
}
