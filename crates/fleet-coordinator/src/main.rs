use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use fleet_coordinator::registry::RegistryEvent;
use fleet_coordinator::server::{self, CoordinatorState, ServerOptions};
use tokio::sync::broadcast;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    debug: bool,
    write_timeout: Duration,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "fleet-coordinator")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };

    let state = Arc::new(CoordinatorState::new(ServerOptions {
        write_timeout: config.write_timeout,
        debug: config.debug,
    }));
    start_event_logger(&state);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "coordinator_error", error = %err);
            return;
        }
    };

    info!(event = "coordinator_start", addr = %config.addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(
        listener,
        server::app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        error!(event = "coordinator_error", error = %err);
    }
}

fn start_event_logger(state: &Arc<CoordinatorState>) {
    let mut events = state.registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RegistryEvent::AgentConnected { identity, hostname }) => {
                    debug!(
                        event = "registry_event",
                        change = "connected",
                        identity = %identity,
                        hostname = %hostname
                    );
                }
                Ok(RegistryEvent::AgentDisconnected { identity }) => {
                    debug!(
                        event = "registry_event",
                        change = "disconnected",
                        identity = %identity
                    );
                }
                Ok(RegistryEvent::InventoryUpdated { identity, apps }) => {
                    debug!(
                        event = "registry_event",
                        change = "inventory",
                        identity = %identity,
                        apps = apps.len()
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(event = "registry_event_lag", skipped = skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

fn load_config() -> Config {
    let args = Args::parse();
    let addr = resolve_addr(&args.addr);
    let debug = args.debug || env_true("FLEET_DEBUG");
    let log_dir = resolve_log_dir(&args.log_dir);
    Config {
        addr,
        debug,
        write_timeout: Duration::from_secs(args.write_timeout),
        log_dir,
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("FLEET_LOG_LEVEL") {
        level
    } else {
        "info,hyper=warn".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl MultiWriter {
    fn new(file: Option<Arc<Mutex<std::fs::File>>>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap();
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let path = dir.join("fleet-coordinator.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .write(true)
        .open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Ok(value) = std::env::var("FLEET_COORDINATOR_ADDR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    "0.0.0.0:8080".to_string()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    if let Ok(value) = std::env::var("FLEET_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    ".fleet/logs".to_string()
}
