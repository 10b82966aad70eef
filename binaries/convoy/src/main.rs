//! Convoy - declarative multi-service orchestration.
//!
//! A thin command-line front end over `convoy-orchestrator`. It loads the
//! topology file, applies profiles, connects to the container runtime and
//! maps the engine's reports to process exit codes.
//!
//! # Usage
//!
//! ```bash
//! # Start every service in the background
//! convoy up -d
//!
//! # Start one service and its dependencies with three replicas
//! convoy up --scale web=3 web
//!
//! # Use a configuration file and another topology
//! convoy --config convoy.toml -f deploy/stack.yaml up
//!
//! # Tear down, removing volumes and locally built images
//! convoy down -v --rmi local
//! ```
//!
//! # Exit codes
//!
//! | Code | Meaning                                   |
//! |------|-------------------------------------------|
//! | 0    | every selected service converged          |
//! | 1    | one or more services failed               |
//! | 2    | invalid topology or configuration         |
//! | 3    | interrupted by a signal                   |

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::ConvoyConfig;
use convoy_orchestrator::runtime::{LogLine, LogStream};
use convoy_orchestrator::{
    BuildOptions, DockerRuntime, DownOptions, ExecOptions, InMemoryRuntime, LogOptions,
    Orchestrator, OrchestratorError, RemoveImages, SharedRuntime, Topology, UpOptions,
    EXIT_CONFIG_ERROR, EXIT_CONVERGED, EXIT_INTERRUPTED, EXIT_SERVICE_FAILED,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// CLI arguments for convoy.
#[derive(Parser, Debug)]
#[command(
    name = "convoy",
    about = "Bring multi-service container projects up and down",
    version
)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Topology file.
    #[arg(short = 'f', long, value_name = "FILE", global = true)]
    file: Option<PathBuf>,

    /// Project name, used when the topology does not set one.
    #[arg(short = 'p', long, value_name = "NAME", env = "CONVOY_PROJECT_NAME", global = true)]
    project_name: Option<String>,

    /// Enable a profile. May be repeated.
    #[arg(long, value_name = "PROFILE", global = true)]
    profile: Vec<String>,

    /// Log level or filter directive.
    #[arg(short, long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Enable JSON log output.
    #[arg(long, global = true)]
    json_logs: bool,

    /// Seconds to wait for each dependency condition.
    #[arg(long, value_name = "SECS", global = true)]
    readiness_timeout: Option<u64>,

    /// Start nothing further once a service fails.
    #[arg(long, global = true)]
    abort_on_failure: bool,

    /// Docker daemon address.
    #[arg(long, value_name = "HOST", env = "DOCKER_HOST", global = true)]
    docker_host: Option<String>,

    /// Run against an in-memory runtime instead of Docker.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Print the default configuration and exit.
    #[arg(long)]
    print_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create and start services.
    Up {
        /// Run in the background.
        #[arg(short, long)]
        detach: bool,

        /// Build images before starting containers.
        #[arg(long)]
        build: bool,

        /// Pull images before starting containers.
        #[arg(long)]
        pull: bool,

        /// Scale a service, e.g. `web=3`. May be repeated.
        #[arg(long, value_name = "SERVICE=NUM", value_parser = parse_scale)]
        scale: Vec<(String, u32)>,

        /// Do not start linked services.
        #[arg(long)]
        no_deps: bool,

        /// Services to start. Defaults to all.
        services: Vec<String>,
    },

    /// Stop and remove containers and networks.
    Down {
        /// Remove named volumes.
        #[arg(short, long)]
        volumes: bool,

        /// Remove images used by services.
        #[arg(long, value_enum)]
        rmi: Option<RmiArg>,
    },

    /// List containers.
    Ps {
        /// Include stopped containers.
        #[arg(short, long)]
        all: bool,
    },

    /// Show container output.
    Logs {
        /// Follow log output.
        #[arg(long)]
        follow: bool,

        /// Number of lines from the end of each log.
        #[arg(long, value_name = "N")]
        tail: Option<usize>,

        /// Show timestamps.
        #[arg(short, long)]
        timestamps: bool,

        /// Services to show. Defaults to all.
        services: Vec<String>,
    },

    /// Build images of services with a build section.
    Build {
        /// Do not use the build cache.
        #[arg(long)]
        no_cache: bool,

        /// Always pull newer base images.
        #[arg(long)]
        pull: bool,

        /// Build images concurrently.
        #[arg(long)]
        parallel: bool,

        /// Services to build. Defaults to all.
        services: Vec<String>,
    },

    /// Run a command in a running service container.
    Exec {
        /// Run as this user.
        #[arg(short, long)]
        user: Option<String>,

        /// Working directory inside the container.
        #[arg(short, long)]
        workdir: Option<String>,

        /// Set an environment variable, e.g. `KEY=VALUE`.
        #[arg(short, long)]
        env: Vec<String>,

        /// Give extended privileges to the process.
        #[arg(long)]
        privileged: bool,

        /// Replica to run in.
        #[arg(long, default_value_t = 1)]
        index: u32,

        /// Service name.
        service: String,

        /// Command and arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Pull service images.
    Pull {
        /// Continue when an image cannot be pulled.
        #[arg(long)]
        ignore_pull_failures: bool,

        /// Services to pull. Defaults to all.
        services: Vec<String>,
    },

    /// Validate the topology and print it in compose form.
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RmiArg {
    /// Images built by convoy.
    Local,
    /// Every image used by the project.
    All,
}

impl From<RmiArg> for RemoveImages {
    fn from(arg: RmiArg) -> Self {
        match arg {
            RmiArg::Local => RemoveImages::Local,
            RmiArg::All => RemoveImages::All,
        }
    }
}

fn parse_scale(value: &str) -> Result<(String, u32), String> {
    let (service, count) = value
        .split_once('=')
        .ok_or_else(|| format!("expected SERVICE=NUM, got {}", value))?;
    if service.is_empty() {
        return Err(format!("missing service name in {}", value));
    }
    let count = count
        .parse()
        .map_err(|e| format!("invalid replica count in {}: {}", value, e))?;
    Ok((service.to_string(), count))
}

/// Initialize tracing/logging.
fn init_tracing(config: &config::LoggingConfig, json_logs: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Failed to parse log filter")?;

    let format = if json_logs {
        "json".to_string()
    } else {
        config.format.to_lowercase()
    };

    // Logs go to stderr so command output on stdout stays machine readable.
    let result = match format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        "pretty" => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init(),
        _ => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {}", e))
}

/// Resolves when the process receives Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Loads the topology file and applies the active profiles.
fn load_topology(config: &ConvoyConfig) -> Result<Topology> {
    let path = &config.project.file;
    let topology = Topology::from_file(path).map_err(|e| match e {
        OrchestratorError::Io(io) => {
            OrchestratorError::configuration(format!("cannot read {}: {}", path.display(), io))
        }
        other => other,
    })?;
    Ok(topology.with_profiles(&config.project.profiles))
}

async fn connect_runtime(config: &ConvoyConfig, offline: bool) -> Result<SharedRuntime> {
    if offline {
        info!("Using in-memory runtime");
        return Ok(Arc::new(InMemoryRuntime::new()));
    }
    let runtime: SharedRuntime = Arc::new(
        DockerRuntime::with_config(&config.docker)
            .await
            .map_err(OrchestratorError::from)
            .context("Failed to connect to the Docker daemon")?,
    );
    ensure_ready(&runtime).await?;
    Ok(runtime)
}

/// Fails early when the runtime does not answer.
async fn ensure_ready(runtime: &SharedRuntime) -> Result<()> {
    if !runtime.is_ready().await {
        anyhow::bail!("{} runtime is not responding", runtime.name());
    }
    info!(runtime = runtime.name(), "Runtime is ready");
    Ok(())
}

/// Runs the selected command and returns the process exit code.
async fn run(args: CliArgs, config: ConvoyConfig) -> Result<i32> {
    let Some(command) = args.command else {
        anyhow::bail!("no command given, see `convoy --help`");
    };

    let topology = load_topology(&config)?;

    // Rendering never talks to the daemon.
    let offline = args.dry_run || matches!(command, Command::Config);
    let runtime = connect_runtime(&config, offline).await?;
    let orchestrator = Orchestrator::new(topology, runtime, config.engine.clone())?;

    let token = orchestrator.cancel_token();
    let signal_token = token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    match command {
        Command::Up {
            detach,
            build,
            pull,
            scale,
            no_deps,
            services,
        } => {
            let options = UpOptions {
                services,
                detach,
                build,
                pull,
                scale: scale.into_iter().collect::<HashMap<_, _>>(),
                no_deps,
            };
            up(&orchestrator, options, &token).await
        }
        Command::Down { volumes, rmi } => {
            let report = orchestrator
                .down(DownOptions {
                    remove_volumes: volumes,
                    rmi: rmi.map(RemoveImages::from).unwrap_or_default(),
                })
                .await;
            for name in &report.removed_containers {
                println!("Removed container {}", name);
            }
            report.into_result()?;
            Ok(EXIT_CONVERGED)
        }
        Command::Ps { all } => {
            let containers = orchestrator.ps(all).await?;
            println!("{:<32} {:<16} {:<12} {}", "NAME", "SERVICE", "STATUS", "HEALTH");
            for c in containers {
                let health = c.health.map(|h| h.to_string()).unwrap_or_default();
                println!("{:<32} {:<16} {:<12} {}", c.name, c.service, c.status, health);
            }
            Ok(EXIT_CONVERGED)
        }
        Command::Logs {
            follow,
            tail,
            timestamps,
            services,
        } => {
            let options = LogOptions {
                follow,
                tail,
                timestamps,
            };
            follow_logs(&orchestrator, &services, options, &token).await?;
            Ok(EXIT_CONVERGED)
        }
        Command::Build {
            no_cache,
            pull,
            parallel,
            services,
        } => {
            let tags = orchestrator
                .build(BuildOptions {
                    services,
                    no_cache,
                    pull,
                    parallel,
                })
                .await?;
            for tag in tags {
                println!("Built {}", tag);
            }
            Ok(EXIT_CONVERGED)
        }
        Command::Exec {
            user,
            workdir,
            env,
            privileged,
            index,
            service,
            command,
        } => {
            let options = ExecOptions {
                user,
                working_dir: workdir,
                env,
                privileged,
            };
            let output = orchestrator.exec(&service, &command, options, index).await?;
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            Ok(i32::try_from(output.exit_code).unwrap_or(EXIT_SERVICE_FAILED))
        }
        Command::Pull {
            ignore_pull_failures,
            services,
        } => {
            for image in orchestrator.pull(&services, ignore_pull_failures).await? {
                println!("Pulled {}", image);
            }
            Ok(EXIT_CONVERGED)
        }
        Command::Config => {
            print!("{}", orchestrator.render_config()?);
            Ok(EXIT_CONVERGED)
        }
    }
}

async fn up(orchestrator: &Orchestrator, options: UpOptions, token: &CancellationToken) -> Result<i32> {
    let detach = options.detach;
    let report = orchestrator.up(options).await?;
    print!("{}", report);

    if report.cancelled {
        warn!(project = %orchestrator.project(), "Interrupted, tearing down");
        teardown(orchestrator).await;
        return Ok(EXIT_INTERRUPTED);
    }

    if !report.is_success() {
        if let Some(err) = report.first_error() {
            error!(error = %err, "Project did not fully converge");
        }
    }

    if detach {
        return Ok(report.exit_code());
    }

    // Attached: stream logs until interrupted, then stop the project.
    let services = report
        .outcomes
        .iter()
        .filter(|o| o.is_started())
        .map(|o| o.service.clone())
        .collect::<Vec<_>>();
    if !services.is_empty() {
        let options = LogOptions {
            follow: true,
            ..Default::default()
        };
        if let Err(e) = follow_logs(orchestrator, &services, options, token).await {
            warn!(error = %e, "Log stream ended");
        }
    }
    token.cancelled().await;
    teardown(orchestrator).await;
    Ok(report.exit_code())
}

async fn follow_logs(
    orchestrator: &Orchestrator,
    services: &[String],
    options: LogOptions,
    token: &CancellationToken,
) -> Result<()> {
    let mut stream = orchestrator.logs(services, options).await?;
    loop {
        tokio::select! {
            line = stream.next() => match line {
                Some(Ok(line)) => print_line(&line),
                Some(Err(e)) => return Err(OrchestratorError::from(e).into()),
                None => return Ok(()),
            },
            _ = token.cancelled() => return Ok(()),
        }
    }
}

fn print_line(line: &LogLine) {
    match line.stream {
        LogStream::Stdout => println!("{} | {}", line.container, line.message.trim_end()),
        LogStream::Stderr => eprintln!("{} | {}", line.container, line.message.trim_end()),
    }
}

async fn teardown(orchestrator: &Orchestrator) {
    let report = orchestrator.down(DownOptions::default()).await;
    for err in &report.errors {
        warn!(error = %err, "Teardown error");
    }
}

/// Maps an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<OrchestratorError>())
        .map(OrchestratorError::exit_code)
        .unwrap_or(EXIT_CONFIG_ERROR)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    if args.print_config {
        return match toml::to_string_pretty(&ConvoyConfig::default()) {
            Ok(rendered) => {
                println!("{}", rendered);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                ExitCode::from(EXIT_CONFIG_ERROR as u8)
            }
        };
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(EXIT_CONFIG_ERROR as u8);
        }
    };

    if let Err(e) = init_tracing(&config.logging, args.json_logs) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(EXIT_CONFIG_ERROR as u8);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "convoy starting");

    let code = match run(args, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Command failed");
            eprintln!("Error: {:#}", e);
            exit_code_for(&e)
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Loads, merges and validates the configuration.
fn load_config(args: &CliArgs) -> Result<ConvoyConfig> {
    let mut config = if let Some(ref config_path) = args.config {
        ConvoyConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        ConvoyConfig::default()
    };

    config.merge_cli_args(args);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}
