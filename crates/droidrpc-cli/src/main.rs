//! Runs the reply script on one or more Android devices.
//!
//! Every port names one device on `host`; each device gets its own task and
//! all devices run in parallel. Ctrl-C stops every device after its current
//! iteration and closes all sessions.
//!
//! # Usage
//!
//! ```bash
//! # Two devices behind one host
//! droidrpc 192.168.1.181 7101 7102
//!
//! # Explicit engine library and a short run
//! droidrpc --library /opt/engine/libmytrpc.so --iterations 5 192.168.1.181 7101
//!
//! # Exercise the whole stack against the in-process mock engine
//! droidrpc --dry-run --iterations 1 10.0.0.5 7101
//!
//! # Debug logging to a file
//! RUST_LOG=debug droidrpc --log-file droidrpc.log 192.168.1.181 7101
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use droidrpc_core::binding::Binding;
use droidrpc_core::config::DroidRpcConfig;
use droidrpc_core::mock_engine::MockEngine;
use droidrpc_core::orchestrator::{DeviceReport, Orchestrator, Outcome};
use droidrpc_core::registry::SessionRegistry;
use droidrpc_core::script::ReplyScript;
use droidrpc_core::RpcError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Run scripted automation loops on Android devices.
#[derive(Parser)]
#[command(name = "droidrpc")]
#[command(about = "Run the reply script on Android devices through the automation engine")]
#[command(version)]
struct Cli {
    /// Device host
    host: String,

    /// Device ports, one device per port
    #[arg(required = true)]
    ports: Vec<String>,

    /// Path to the engine shared library
    #[arg(short, long, env = "DROIDRPC_LIBRARY")]
    library: Option<PathBuf>,

    /// Iterations per device
    #[arg(short = 'n', long, env = "DROIDRPC_ITERATIONS")]
    iterations: Option<u32>,

    /// Config file (default: ~/.droidrpc/config.json)
    #[arg(short, long, env = "DROIDRPC_CONFIG")]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Use the in-process mock engine instead of the shared library
    #[arg(long)]
    dry_run: bool,

    /// Print device reports as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Debug)]
enum CliError {
    Usage(String),
    Engine(RpcError),
    DevicesFailed(usize),
}

impl CliError {
    fn exit_code(&self) -> ExitCode {
        match self {
            CliError::DevicesFailed(_) => ExitCode::from(1),
            CliError::Usage(_) => ExitCode::from(2),
            CliError::Engine(_) => ExitCode::from(3),
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Usage(msg) => write!(f, "{}", msg),
            CliError::Engine(e) => write!(f, "{}", e),
            CliError::DevicesFailed(n) => write!(f, "{} device(s) failed", n),
        }
    }
}

impl From<RpcError> for CliError {
    fn from(e: RpcError) -> Self {
        CliError::Engine(e)
    }
}

fn init_logging(log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .map(|n| n.to_owned())
                .unwrap_or_else(|| "droidrpc.log".into());
            let file_appender = tracing_appender::rolling::never(dir, name);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(file_appender)
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

/// Parses port arguments, skipping (and logging) the invalid ones.
fn parse_ports(args: &[String]) -> Vec<u16> {
    args.iter()
        .filter_map(|arg| match arg.parse::<u16>() {
            Ok(port) => Some(port),
            Err(_) => {
                warn!(port = %arg, "ignoring invalid port");
                None
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref());

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let ports = parse_ports(&cli.ports);
    if ports.is_empty() {
        return Err(CliError::Usage("at least one valid port is required".to_string()));
    }

    let mut config = match &cli.config {
        Some(path) => DroidRpcConfig::load_from(path),
        None => DroidRpcConfig::load(),
    };
    if let Some(library) = cli.library {
        config.library_path = Some(library);
    }
    if let Some(iterations) = cli.iterations {
        config.iterations = iterations;
    }

    let binding = if cli.dry_run {
        info!("using mock engine");
        Binding::new(Arc::new(MockEngine::device()))
    } else {
        Binding::load(config.library_path())?
    };

    let registry = Arc::new(SessionRegistry::new(binding, config.connect.clone()));
    let script = Arc::new(ReplyScript::new(config.reply.clone(), config.text_entry.clone()));
    let mut orchestrator = Orchestrator::new(registry, script, config.iterations);

    info!(host = %cli.host, devices = ports.len(), iterations = config.iterations, "starting");
    for port in ports {
        orchestrator.spawn_device(&cli.host, port);
    }

    let token = orchestrator.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping devices");
            token.cancel();
        }
    });

    let reports = orchestrator.shutdown_after_completion().await;
    print_reports(&reports, cli.json);

    let failed = reports
        .iter()
        .filter(|r| matches!(r.outcome, Outcome::Failed(_)))
        .count();
    if failed > 0 {
        return Err(CliError::DevicesFailed(failed));
    }
    Ok(())
}

fn print_reports(reports: &[DeviceReport], json: bool) {
    for report in reports {
        if json {
            match serde_json::to_string(report) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!(error = %e, "failed to serialize report"),
            }
        } else {
            println!("{}", report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_ports_are_skipped() {
        let args: Vec<String> = ["7101", "abc", "70000", "7102"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(parse_ports(&args), vec![7101, 7102]);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(CliError::DevicesFailed(1).exit_code(), ExitCode::from(1));
        assert_eq!(CliError::Usage(String::new()).exit_code(), ExitCode::from(2));
        assert_eq!(
            CliError::Engine(RpcError::Binding("openDevice".into())).exit_code(),
            ExitCode::from(3)
        );
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "droidrpc",
            "--iterations",
            "5",
            "--dry-run",
            "192.168.1.181",
            "7101",
            "7102",
        ])
        .unwrap();
        assert_eq!(cli.host, "192.168.1.181");
        assert_eq!(cli.ports, vec!["7101", "7102"]);
        assert_eq!(cli.iterations, Some(5));
        assert!(cli.dry_run);
    }
}
