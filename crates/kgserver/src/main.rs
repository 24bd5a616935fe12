//
// main.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Main binary entry point for the Kernelgate server.

#![allow(missing_docs)]

use std::fs::File;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{command, Parser};
use kgserver::{config::GatewayConfig, kernel_registry::KernelRegistry, server};
use log::LevelFilter;
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode, WriteLogger};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The port to bind the server to. If 0, the OS picks one.
    #[arg(short, long, default_value_t = 8888)]
    port: u16,

    /// The address the server and its kernels listen on
    #[arg(long, default_value = "127.0.0.1")]
    ip: IpAddr,

    /// The path to a log file. If specified, log output will be written to this
    /// file in addition to standard streams.
    #[arg(long)]
    log_file: Option<String>,

    /// The log level to use. Valid values are "trace", "debug", "info", "warn",
    /// and "error". If not specified, the default log level is "info", or the
    /// value of `RUST_LOG` if set.
    #[arg(short, long)]
    log_level: Option<String>,

    /// The directory kernel connection files are written to. Defaults to the
    /// system's temporary directory.
    #[arg(long)]
    connection_dir: Option<PathBuf>,

    /// A directory to search for kernelspecs before the standard Jupyter
    /// locations. May be given more than once.
    #[arg(long = "kernel-spec-dir")]
    kernel_spec_dirs: Vec<PathBuf>,

    /// The kernelspec advertised as the default
    #[arg(long, default_value = "python3")]
    default_kernel: String,

    /// The lowest port handed out to kernels
    #[arg(long, default_value_t = 5000)]
    min_port: u16,

    /// One past the highest port handed out to kernels
    #[arg(long, default_value_t = 6000)]
    max_port: u16,

    /// Let the OS pick kernel ports instead of reserving them from the port
    /// range
    #[arg(long)]
    no_port_cache: bool,

    /// An interpreter to try in place of a bare `python` in a kernelspec. May
    /// be given more than once; candidates are tried in order.
    #[arg(long = "python")]
    python_candidates: Vec<String>,

    /// How long to wait, in milliseconds, for a kernel to answer the first
    /// request on a new connection
    #[arg(long, default_value_t = 2000)]
    nudge_timeout_ms: u64,

    /// How long to wait, in milliseconds, when connecting to a kernel socket
    #[arg(long, default_value_t = 10000)]
    connect_timeout_ms: u64,

    /// The time between heartbeats, in milliseconds
    #[arg(long, default_value_t = 2000)]
    heartbeat_interval_ms: u64,

    /// How many messages may wait for a slow client before iopub messages are
    /// dropped
    #[arg(long, default_value_t = 1024)]
    queue_capacity: usize,
}

impl Args {
    fn to_config(&self) -> GatewayConfig {
        let defaults = GatewayConfig::default();
        GatewayConfig {
            ip: self.ip,
            connection_dir: self
                .connection_dir
                .clone()
                .unwrap_or(defaults.connection_dir),
            kernel_spec_dirs: self.kernel_spec_dirs.clone(),
            default_kernel: self.default_kernel.clone(),
            cache_ports: !self.no_port_cache,
            port_range: self.min_port..self.max_port,
            python_candidates: if self.python_candidates.is_empty() {
                defaults.python_candidates
            } else {
                self.python_candidates.clone()
            },
            nudge_timeout: Duration::from_millis(self.nudge_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            delivery_queue_capacity: self.queue_capacity,
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args = Args::parse();

    if args.min_port >= args.max_port {
        eprintln!(
            "Error: --min-port ({}) must be lower than --max-port ({})",
            args.min_port, args.max_port
        );
        std::process::exit(1);
    }

    // Derive the log level
    let log_level = match args.log_level {
        Some(ref level) => {
            // If the log level is set in the command-line arguments, use it
            level.to_string()
        }
        None => match std::env::var("RUST_LOG") {
            Ok(level) => level,
            Err(_) => "info".to_string(),
        },
    };

    // Match the log level to a `LevelFilter`
    let log_level = match log_level.as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            println!("Invalid log level '{}'; using 'info'", log_level);
            LevelFilter::Info
        }
    };

    // Check to see if a log file was provided
    let init = match args.log_file {
        Some(ref log_file) => {
            let file = match File::create(log_file) {
                Ok(file) => file,
                Err(err) => {
                    println!("Failed to create log file '{}': {}", log_file, err);
                    std::process::exit(1);
                }
            };
            CombinedLogger::init(vec![
                TermLogger::new(
                    log_level,
                    Config::default(),
                    TerminalMode::Mixed,
                    ColorChoice::Auto,
                ),
                WriteLogger::new(log_level, Config::default(), file),
            ])
        }
        None => TermLogger::init(
            log_level,
            Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
    };
    if let Err(err) = init {
        // Consider it a fatal error if we can't initialize logging
        println!("Failed to initialize logging: {}", err);
        std::process::exit(1);
    }

    let config = args.to_config();
    let addr = SocketAddr::new(args.ip, args.port);
    let listener = match TcpListener::bind(addr) {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    let local_addr = match listener.local_addr() {
        Ok(local_addr) => local_addr,
        Err(e) => {
            log::error!("Failed to read the server's address: {}", e);
            std::process::exit(1);
        }
    };

    println!(
        r#"
  Kernelgate: a WebSocket gateway for Jupyter kernels. Version {}.
  Listening on http://{}
"#,
        env!("CARGO_PKG_VERSION"),
        local_addr
    );

    let registry = Arc::new(KernelRegistry::with_defaults(config));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Received Ctrl+C; shutting down");
    };

    if let Err(e) = server::serve(listener, registry.clone(), shutdown).await {
        log::error!("Server error: {}", e);
    }

    registry.cleanup().await;
}
