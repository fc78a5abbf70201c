//! Baton - Main entry point
//!
//! Serves a static page and an event stream, and replaces itself with a new
//! copy of the binary on SIGHUP without dropping a connection.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info, warn};

use baton_common::observability::{init_logging, LogFormat};
use baton_common::ExitStatus;
use baton_config::{Config, LifecycleConfig, ListenerConfig};
use baton_server::{
    trigger_channel, ControlServer, GenerationManager, GenerationSettings, HarnessConfig,
    HttpHarness, SignalTrigger, SuccessorCommand, TriggerSender,
};

/// Time allowed for gracefully closed connections to finish after the drain
const CONNECTION_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Baton - zero-downtime binary upgrades for a streaming HTTP server
#[derive(Parser, Debug)]
#[command(name = "baton")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (.kdl or .toml)
    #[arg(short = 'c', long = "config", env = "BATON_CONFIG")]
    config: Option<PathBuf>,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Listener as `name=host:port` or `host:port`; replaces configured listeners
    #[arg(short = 'l', long = "listen", env = "BATON_LISTEN", value_delimiter = ',')]
    listen: Vec<String>,

    /// Seconds a draining generation waits for open streams
    #[arg(long = "drain-grace-secs", env = "BATON_DRAIN_GRACE_SECS")]
    drain_grace_secs: Option<u64>,

    /// Seconds past the drain deadline before the process is killed outright
    #[arg(long = "hard-exit-secs", env = "BATON_HARD_EXIT_SECS")]
    hard_exit_secs: Option<u64>,

    /// Seconds to wait for a successor to report ready
    #[arg(long = "readiness-timeout-secs", env = "BATON_READINESS_TIMEOUT_SECS")]
    readiness_timeout_secs: Option<u64>,

    /// PID file naming the generation currently serving
    #[arg(long = "pid-file", env = "BATON_PID_FILE")]
    pid_file: Option<PathBuf>,

    /// Admin control socket path
    #[arg(long = "control-socket", env = "BATON_CONTROL_SOCKET")]
    control_socket: Option<PathBuf>,

    /// Milliseconds between events on /ping
    #[arg(long = "stream-interval-ms", env = "BATON_STREAM_INTERVAL_MS")]
    stream_interval_ms: Option<u64>,

    /// Program started as the successor instead of the running executable
    #[arg(long = "successor-program", env = "BATON_SUCCESSOR_PROGRAM")]
    successor_program: Option<PathBuf>,

    /// HTML file served at /
    #[arg(long = "index-file", env = "BATON_INDEX_FILE")]
    index_file: Option<PathBuf>,

    /// Tag appended to every event, e.g. a release name
    #[arg(long = "release-tag", env = "BATON_RELEASE_TAG")]
    release_tag: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Log output format: pretty or json
    #[arg(long = "log-format", env = "BATON_LOG_FORMAT", default_value = "pretty")]
    log_format: String,
}

fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    if let Err(e) = init_logging(log_level, LogFormat::from_str_loose(&cli.log_format)) {
        eprintln!("baton: {}", e);
    }

    let code = match run(cli) {
        Ok(status) => status.code(),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Generation failed");
            ExitStatus::StartupFailure.code()
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<ExitStatus> {
    let config = load_config(&cli)?;

    if cli.test {
        println!(
            "baton: configuration {} test is successful",
            cli.config
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(defaults)".to_string())
        );
        return Ok(ExitStatus::Clean);
    }

    // Resolved before anything can replace the binary on disk
    let successor = successor_command(&config.lifecycle)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let status = runtime.block_on(serve(config, successor));
    runtime.shutdown_timeout(Duration::from_secs(1));
    status
}

/// Load the configuration file, apply flag overrides and validate
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            info!(path = %path.display(), "Loading configuration");
            Config::from_file(path).context("Failed to load configuration file")?
        }
        None => {
            debug!("No configuration file, using defaults");
            Config::default()
        }
    };

    if !cli.listen.is_empty() {
        config.listeners = parse_listen_flags(&cli.listen);
    }
    if let Some(secs) = cli.drain_grace_secs {
        config.lifecycle.drain_grace_secs = secs;
    }
    if let Some(secs) = cli.hard_exit_secs {
        config.lifecycle.hard_exit_secs = secs;
    }
    if let Some(secs) = cli.readiness_timeout_secs {
        config.lifecycle.readiness_timeout_secs = secs;
    }
    if let Some(path) = &cli.pid_file {
        config.lifecycle.pid_file = Some(path.clone());
    }
    if let Some(path) = &cli.control_socket {
        config.lifecycle.control_socket = Some(path.clone());
    }
    if let Some(program) = &cli.successor_program {
        config.lifecycle.successor_program = Some(program.clone());
    }
    if let Some(ms) = cli.stream_interval_ms {
        config.stream.interval_ms = ms;
    }
    if let Some(path) = &cli.index_file {
        config.stream.index_file = Some(path.clone());
    }
    if let Some(tag) = &cli.release_tag {
        config.stream.release_tag = Some(tag.clone());
    }

    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

/// Command that starts the next generation
fn successor_command(lifecycle: &LifecycleConfig) -> Result<SuccessorCommand> {
    let mut command = SuccessorCommand::current_process()
        .context("Failed to resolve the running executable")?;
    if let Some(program) = &lifecycle.successor_program {
        command.program = program.clone();
    }
    if let Some(args) = &lifecycle.successor_args {
        command.args = args.iter().map(Into::into).collect();
    }
    debug!(
        program = %command.program.display(),
        args = command.args.len(),
        "Resolved successor command"
    );
    Ok(command)
}

/// Unnamed listeners are called `http`, `http-2`, `http-3`, ...
fn parse_listen_flags(values: &[String]) -> Vec<ListenerConfig> {
    let mut unnamed = 0;
    values
        .iter()
        .map(|value| match value.split_once('=') {
            Some((name, address)) => ListenerConfig::new(name.trim(), address.trim()),
            None => {
                unnamed += 1;
                let name = if unnamed == 1 {
                    "http".to_string()
                } else {
                    format!("http-{}", unnamed)
                };
                ListenerConfig::new(name, value.trim())
            }
        })
        .collect()
}

async fn serve(config: Config, successor: SuccessorCommand) -> Result<ExitStatus> {
    let settings = GenerationSettings::from_config(&config.lifecycle, successor);
    let manager = GenerationManager::from_env(settings).context("Failed to read handoff state")?;

    info!(
        generation = %manager.id(),
        pid = std::process::id(),
        successor_of = ?manager.status().parent_pid,
        "Starting generation"
    );

    // Installed early so an upgrade or stop signal during startup is queued
    let (triggers, trigger_rx) = trigger_channel();
    let signals = SignalTrigger::install(triggers.clone()).context("Failed to install signal handlers")?;

    let harness = match start(&manager, &config).await {
        Ok(harness) => harness,
        Err(e) => {
            manager.fail_startup();
            signals.close();
            return Err(e);
        }
    };

    start_control_socket(&manager, &config, &triggers);
    drop(triggers);

    let status = manager.run(trigger_rx).await;
    signals.close();

    if tokio::time::timeout(CONNECTION_SETTLE_TIMEOUT, harness.wait_idle())
        .await
        .is_err()
    {
        warn!(
            open_connections = harness.open_connections(),
            "Connections still open at exit"
        );
    }

    info!(status = ?status, code = status.code(), "Generation exited");
    Ok(status)
}

/// Bind or adopt every listener, start serving and report readiness
async fn start(manager: &Arc<GenerationManager>, config: &Config) -> Result<Arc<HttpHarness>> {
    let mut bound = Vec::with_capacity(config.listeners.len());
    for listener in &config.listeners {
        let socket = manager
            .registry()
            .listen(&listener.name, &listener.address)
            .with_context(|| format!("Failed to set up listener '{}'", listener.name))?;
        bound.push((listener.name.clone(), socket));
    }
    manager.mark_listening()?;

    let harness_config = HarnessConfig::from_stream_config(&config.stream, manager.id());
    let harness = HttpHarness::new(harness_config, manager.drain());
    for (name, socket) in bound {
        let addr = harness
            .serve(&name, socket)
            .with_context(|| format!("Failed to serve listener '{}'", name))?;
        info!(listener = %name, address = %addr, "HTTP listening");
    }

    manager.signal_ready().await?;
    Ok(harness)
}

fn start_control_socket(manager: &GenerationManager, config: &Config, triggers: &TriggerSender) {
    let Some(path) = &config.lifecycle.control_socket else {
        return;
    };
    match ControlServer::bind(path, triggers.clone()) {
        Ok(control) => {
            tokio::spawn(control.run(manager.drain().accept_token()));
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to bind control socket"),
    }
}
