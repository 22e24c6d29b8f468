use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use fleet_agent::inventory::ScriptProvider;
use fleet_agent::lifecycle::ProcessController;
use fleet_agent::session::{AgentSession, SessionConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "fleet-agent")]
struct Args {
    #[arg(long, default_value = "")]
    identity: String,
    #[arg(long, default_value = "")]
    url: String,
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = 3)]
    reconnect_delay: u64,
    #[arg(long, default_value_t = 5)]
    heartbeat_interval: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(last = true)]
    apps_command: Vec<String>,
}

#[derive(Clone, Debug)]
struct RuntimeConfig {
    session: SessionConfig,
    apps_command: Vec<String>,
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = load_config(args);
    let _log_guard = init_logging(&config);

    if config.session.identity.trim().is_empty() {
        error!("missing identity: pass --identity or set FLEET_AGENT_IDENTITY");
        std::process::exit(1);
    }

    let controller = Arc::new(ProcessController::system());
    let provider = Arc::new(ScriptProvider::new(config.apps_command.clone()));
    let session = AgentSession::new(config.session.clone(), controller, provider);

    info!(
        "agent starting: identity={} coordinator={}",
        config.session.identity, config.session.coordinator_url
    );

    tokio::select! {
        _ = session.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }
}

fn load_config(args: Args) -> RuntimeConfig {
    let identity = resolve_identity(&args.identity);
    let coordinator_url = resolve_coordinator_url(&args.url, &args.addr);
    let log_dir = resolve_log_dir(&args.log_dir);
    RuntimeConfig {
        session: SessionConfig {
            coordinator_url,
            identity,
            hostname: resolve_hostname(),
            reconnect_delay: Duration::from_secs(args.reconnect_delay),
            heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        },
        apps_command: args.apps_command,
        log_dir,
    }
}

fn init_logging(config: &RuntimeConfig) -> Option<LogGuard> {
    let level = if env_true("FLEET_DEBUG") {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("FLEET_LOG_LEVEL") {
        level
    } else {
        "info,tungstenite=warn".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir, &config.session.identity) {
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

fn open_log_file(log_dir: &str, identity: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    if std::fs::create_dir_all(&dir).is_err() {
        return Ok(LogGuard { file: None });
    }
    let safe_identity = sanitize_component(identity);
    let path = dir.join(format!("fleet-agent-{safe_identity}.log"));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .write(true)
        .open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

fn sanitize_component(input: &str) -> String {
    input
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
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

fn resolve_identity(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var("FLEET_AGENT_IDENTITY") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    String::new()
}

fn resolve_coordinator_url(flag_url: &str, flag_addr: &str) -> Url {
    if !flag_url.trim().is_empty() {
        return Url::parse(flag_url).expect("invalid coordinator url");
    }
    if let Ok(value) = std::env::var("FLEET_COORDINATOR_URL") {
        if !value.trim().is_empty() {
            return Url::parse(&value).expect("invalid coordinator url");
        }
    }
    let addr = if !flag_addr.trim().is_empty() {
        flag_addr.to_string()
    } else if let Ok(value) = std::env::var("FLEET_COORDINATOR_ADDR") {
        if !value.trim().is_empty() {
            value
        } else {
            "127.0.0.1:8080".to_string()
        }
    } else {
        "127.0.0.1:8080".to_string()
    };
    Url::parse(&format!("ws://{addr}/ws")).expect("invalid coordinator addr")
}

fn resolve_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => "unknown".to_string(),
    }
}

fn resolve_log_dir(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var("FLEET_LOG_DIR") {
        if !value.trim().is_empty() {
            return value;
        }
    }
    ".fleet/logs".to_string()
}
