//! Main application entry point for the gatehouse ingress server
//!
//! Provides CLI interface, configuration loading, logging setup, and server
//! startup with graceful signal-based shutdown. All protocol semantics live
//! behind the `gate_core` service contract; this crate only composes.

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use gate_core::{AdmissionConfig, GateConfig, GateServer};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod status;

use status::StatusService;

// ============================================================================
// Configuration
// ============================================================================

/// Application configuration loaded from TOML file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener and per-connection settings
    pub server: ServerSettings,
    /// Accept-time flood/backoff tunables
    pub admission: AdmissionConfig,
    /// Logging configuration
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Address the listening sockets bind to
    pub bind_ip: String,
    /// Port the built-in status service listens on
    pub status_port: u16,
    /// Hard cap on simultaneous connections
    pub max_connections: usize,
    /// Read watchdog deadline, seconds
    pub read_timeout: u64,
    /// Write watchdog deadline, seconds
    pub write_timeout: u64,
    /// Per-connection packets-per-second ceiling
    pub max_packets_per_second: u32,
    /// Scale accept loops across cores with SO_REUSEPORT
    pub use_reuse_port: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter
    pub level: String,
    /// JSON formatting
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_ip: "0.0.0.0".to_string(),
                status_port: 7979,
                max_connections: 1000,
                read_timeout: 30,
                write_timeout: 30,
                max_packets_per_second: 50,
                use_reuse_port: false,
            },
            admission: AdmissionConfig::default(),
            logging: LoggingSettings { level: "info".to_string(), json_format: false },
        }
    }
}

impl AppConfig {
    /// Load configuration from file, creating a default one on first run
    pub async fn load_from_file(path: &PathBuf) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Convert to the core server configuration
    pub fn to_gate_config(&self) -> anyhow::Result<GateConfig> {
        Ok(GateConfig {
            bind_ip: self
                .server
                .bind_ip
                .parse()
                .with_context(|| format!("invalid bind_ip: {}", self.server.bind_ip))?,
            read_timeout_secs: self.server.read_timeout,
            write_timeout_secs: self.server.write_timeout,
            max_packets_per_second: self.server.max_packets_per_second,
            max_connections: self.server.max_connections,
            use_reuse_port: self.server.use_reuse_port,
            admission: self.admission.clone(),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.bind_ip.parse::<std::net::IpAddr>().is_err() {
            bail!("invalid bind_ip: {}", self.server.bind_ip);
        }
        if self.server.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        if self.server.read_timeout == 0 || self.server.write_timeout == 0 {
            bail!("read_timeout and write_timeout must be nonzero");
        }
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            bail!("invalid log level: {} (must be one of {:?})", self.logging.level, valid_levels);
        }
        Ok(())
    }
}

// ============================================================================
// CLI Interface
// ============================================================================

/// Command line arguments
#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub bind_ip: Option<String>,
    pub status_port: Option<u16>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl CliArgs {
    /// Parse command line arguments
    pub fn parse() -> Self {
        let matches = Command::new("Gatehouse Ingress Server")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Connection and transport-framing front end for a persistent game world")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("gatehouse.toml"),
            )
            .arg(
                Arg::new("bind")
                    .short('b')
                    .long("bind")
                    .value_name("ADDRESS")
                    .help("Bind address (e.g., 0.0.0.0)"),
            )
            .arg(
                Arg::new("status-port")
                    .long("status-port")
                    .value_name("PORT")
                    .value_parser(clap::value_parser!(u16))
                    .help("Port for the built-in status service"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(ArgAction::SetTrue),
            )
            .get_matches();

        Self {
            config_path: PathBuf::from(
                matches.get_one::<String>("config").expect("config has a default value"),
            ),
            bind_ip: matches.get_one::<String>("bind").cloned(),
            status_port: matches.get_one::<u16>("status-port").copied(),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}

// ============================================================================
// Logging Setup
// ============================================================================

/// Initialize logging system
fn setup_logging(config: &LoggingSettings) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        registry
            .with(fmt::layer().json().with_file(false).with_line_number(false))
            .init();
    } else {
        registry
            .with(fmt::layer().with_ansi(true).with_file(false).with_line_number(false))
            .init();
    }

    info!("🔧 Logging initialized with level: {}", config.level);
    Ok(())
}

// ============================================================================
// Signal Handling
// ============================================================================

/// Block until a shutdown signal arrives
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("📡 Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("📡 Received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
    }

    Ok(())
}

// ============================================================================
// Application
// ============================================================================

pub struct Application {
    config: AppConfig,
    server: Arc<GateServer>,
}

impl Application {
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        // CLI overrides beat the file
        if let Some(bind_ip) = args.bind_ip {
            config.server.bind_ip = bind_ip;
        }
        if let Some(port) = args.status_port {
            config.server.status_port = port;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        config.validate()?;
        setup_logging(&config.logging)?;

        let server = Arc::new(GateServer::new(config.to_gate_config()?));
        let status = StatusService::new(Arc::clone(server.registry()));
        server.register_service(config.server.status_port, Arc::new(status))?;

        info!("🚀 Gatehouse v{}", env!("CARGO_PKG_VERSION"));
        info!("📂 Config: {}", args.config_path.display());

        Ok(Self { config, server })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!("📋 Configuration summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_ip);
        info!("  🔎 Status port: {}", self.config.server.status_port);
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!(
            "  ⏱️ Timeouts: read {}s / write {}s",
            self.config.server.read_timeout, self.config.server.write_timeout
        );

        let server_handle = {
            let server = Arc::clone(&self.server);
            tokio::spawn(async move {
                if let Err(e) = server.start().await {
                    error!("❌ Server error: {e}");
                    std::process::exit(1);
                }
            })
        };

        info!("✅ Gatehouse is now running!");
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        wait_for_shutdown_signal().await?;

        info!("🛑 Shutdown signal received, closing connections...");
        self.server.shutdown();
        server_handle.await.ok();

        info!("✅ Gatehouse shutdown complete");
        Ok(())
    }
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    match Application::new(args).await {
        Ok(app) => app.run().await,
        Err(e) => {
            eprintln!("❌ Failed to start: {e:?}");
            std::process::exit(1);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
