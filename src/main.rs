use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use railvisor::config::{Config, SupervisorConfig};
use railvisor::healthcheck::ReadinessProbe;
use railvisor::signal::{self, Signal};
use railvisor::{PidFileController, Supervisor, SupervisorError};
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "railvisor")]
#[command(about = "Runs an upstream application server and controls it through its PID file")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the upstream (or attach to a running one) and supervise it
    Run(RunArgs),
    /// Stop the process named in the PID file
    Stop {
        #[command(flatten)]
        pid_file: PidFileArg,
        /// How long to wait for the process to exit
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Send SIGKILL if the process is still running after the timeout
        #[arg(long)]
        force: bool,
    },
    /// Reload the workers of the process named in the PID file
    PhasedRestart {
        #[command(flatten)]
        pid_file: PidFileArg,
        /// Server family: puma or unicorn
        #[arg(long, default_value = "puma")]
        server_type: String,
    },
}

#[derive(Args)]
struct PidFileArg {
    /// PID file written by the upstream (default: tmp/pids/server.pid)
    #[arg(long)]
    pid_file: Option<String>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    pid_file: PidFileArg,

    /// Port the upstream should listen on, exported as PORT
    #[arg(long)]
    target_port: Option<u16>,

    /// Wait for the PID file and relay signals to worker processes too
    #[arg(long)]
    workers: bool,

    /// Exit once the upstream is started, leaving it running without signal relay
    #[arg(long)]
    detach: bool,

    /// Command and arguments; `bin/rails server` when omitted
    #[arg(last = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("railvisor=debug".parse().expect("valid log directive")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let config = Config::load(path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => Config::default(),
    };

    let code = match cli.command {
        Commands::Run(args) => run(config, args).await?,
        Commands::Stop {
            pid_file,
            timeout_ms,
            force,
        } => {
            let mut supervisor = config.supervisor;
            apply_pid_file(&mut supervisor, pid_file);
            if let Some(ms) = timeout_ms {
                supervisor.stop_timeout_ms = ms;
            }
            stop(&supervisor, force).await?;
            0
        }
        Commands::PhasedRestart {
            pid_file,
            server_type,
        } => {
            let mut supervisor = config.supervisor;
            apply_pid_file(&mut supervisor, pid_file);
            PidFileController::from_config(&supervisor)
                .phased_restart(&server_type)
                .context("failed to phased restart upstream process")?;
            0
        }
    };

    std::process::exit(code);
}

fn apply_pid_file(config: &mut SupervisorConfig, arg: PidFileArg) {
    if let Some(path) = arg.pid_file {
        config.pid_file = Some(path);
    }
}

async fn run(config: Config, args: RunArgs) -> anyhow::Result<i32> {
    let mut supervisor_config = config.supervisor;
    apply_pid_file(&mut supervisor_config, args.pid_file);

    if let Some((command, rest)) = args.command.split_first() {
        supervisor_config.command = Some(command.clone());
        supervisor_config.args = rest.to_vec();
    }
    if let Some(port) = args.target_port {
        supervisor_config.target_port = Some(port);
    }
    if args.workers {
        supervisor_config.discover_workers = true;
    }
    if args.detach {
        supervisor_config.synchronous = false;
    }
    supervisor_config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid supervisor configuration: {}", e))?;

    let target_port = supervisor_config.target_port;
    let mut supervisor = Supervisor::new(supervisor_config)?;
    let started = supervisor.started();

    // Readiness is reported separately from "started": the port must answer
    if let Some(port) = target_port {
        let probe = ReadinessProbe::from_config(port, &config.readiness);
        tokio::spawn(async move {
            if let Ok(target) = started.await {
                info!(pid = target.pid, attached = target.attached, port, "Upstream started, probing readiness");
                if let Err(e) = probe.wait_until_ready().await {
                    warn!(error = %e, "Upstream never became ready");
                }
            }
        });
    }

    let code = match supervisor.run().await {
        Ok(code) => code,
        Err(e @ SupervisorError::PidFileTimeout { .. }) => {
            // The upstream is still running; keep relaying until it exits
            error!(error = %e, "Upstream never wrote its PID file, supervising it without workers");
            let code = supervisor
                .wait_for_exit()
                .await
                .context("failed to wait for upstream process")?;
            info!(exit_code = code, "Upstream exited after PID file timeout");
            return Ok(if code == 0 { 1 } else { code });
        }
        Err(e) => return Err(e).context("failed to run upstream process"),
    };
    info!(exit_code = code, "Supervisor finished");
    Ok(code)
}

async fn stop(config: &SupervisorConfig, force: bool) -> anyhow::Result<()> {
    let controller = PidFileController::from_config(config);

    match controller.stop().await {
        Ok(()) => Ok(()),
        Err(SupervisorError::ShutdownTimeout { pid, .. }) if force => {
            warn!(pid, "Graceful stop timed out, sending SIGKILL");
            signal::send(pid, Signal::Kill).context("failed to kill upstream process")
        }
        Err(e) => Err(e).context("failed to stop upstream process"),
    }
}
