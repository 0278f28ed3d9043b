//! procrun - process-backed container runtime CLI
//!
//! A thin front end over [`procrun::ProcessRuntime`], mainly for operating
//! and debugging an agent host by hand.
//!
//! ## Usage
//!
//! ```sh
//! procrun pull [--force] <image>
//! procrun run [--id <id>] [--tool <tool>] [--env K=V]... [--workdir <dir>] [--gpus <ids>] [<image>] -- <cmd...>
//! procrun attach <id>
//! procrun kill <id> [signal]
//! procrun rm <id> [--force]
//! procrun ps
//! ```
//!
//! Global options (before the command): `--config <file.yaml>`,
//! `--root <dir>`. Without them the configuration comes from the
//! environment (`PROCRUN_*`).
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`.

use anyhow::{Context, bail};
use procrun::events::ChannelPublisher;
use procrun::{
    Completion, Config, ContainerId, ContainerRuntime, DeviceRequest, Event, ImageTool,
    ListFilter, ProcessRuntime, PullRequest, RunSpec, Signal,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Event channel capacity between the runtime and the printer.
const EVENT_BUFFER: usize = 1024;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Default)]
struct GlobalOptions {
    config: Option<PathBuf>,
    root: Option<PathBuf>,
}

#[derive(Debug)]
enum Command {
    Pull {
        image: String,
        force: bool,
    },
    Run {
        id: Option<String>,
        tool: Option<String>,
        image: String,
        cmd: Vec<String>,
        env: Vec<String>,
        workdir: String,
        gpus: Option<String>,
    },
    Attach {
        id: String,
    },
    Kill {
        id: String,
        signal: String,
    },
    Remove {
        id: String,
        force: bool,
    },
    Ps,
    Version,
    Help,
}

fn take_value(args: &[String], i: usize, flag: &str) -> Result<String, String> {
    args.get(i + 1)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args(args: &[String]) -> Result<(GlobalOptions, Command), String> {
    let mut global = GlobalOptions::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                global.config = Some(PathBuf::from(take_value(args, i, "--config")?));
                i += 2;
            }
            "--root" => {
                global.root = Some(PathBuf::from(take_value(args, i, "--root")?));
                i += 2;
            }
            _ => break,
        }
    }

    let Some(command) = args.get(i) else {
        return Ok((global, Command::Help));
    };
    let rest = &args[i + 1..];

    let command = match command.as_str() {
        "pull" => {
            let force = rest.iter().any(|a| a == "--force" || a == "-f");
            let image = rest
                .iter()
                .find(|a| !a.starts_with('-'))
                .cloned()
                .ok_or("pull requires <image>")?;
            Command::Pull { image, force }
        }
        "run" => parse_run(rest)?,
        "attach" => Command::Attach {
            id: rest.first().cloned().ok_or("attach requires <id>")?,
        },
        "kill" => Command::Kill {
            id: rest.first().cloned().ok_or("kill requires <id>")?,
            signal: rest.get(1).cloned().unwrap_or_else(|| "SIGTERM".to_string()),
        },
        "rm" | "remove" => Command::Remove {
            id: rest
                .iter()
                .find(|a| !a.starts_with('-'))
                .cloned()
                .ok_or("rm requires <id>")?,
            force: rest.iter().any(|a| a == "--force" || a == "-f"),
        },
        "ps" | "list" => Command::Ps,
        "version" | "--version" | "-v" => Command::Version,
        "help" | "--help" | "-h" => Command::Help,
        unknown => return Err(format!("unknown command: {unknown}")),
    };
    Ok((global, command))
}

fn parse_run(args: &[String]) -> Result<Command, String> {
    let mut id = None;
    let mut tool = None;
    let mut image = String::new();
    let mut env = Vec::new();
    let mut workdir = String::new();
    let mut gpus = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--" => {
                i += 1;
                break;
            }
            "--id" => {
                id = Some(take_value(args, i, "--id")?);
                i += 2;
            }
            "--tool" | "-t" => {
                tool = Some(take_value(args, i, "--tool")?);
                i += 2;
            }
            "--env" | "-e" => {
                env.push(take_value(args, i, "--env")?);
                i += 2;
            }
            "--workdir" | "-w" => {
                workdir = take_value(args, i, "--workdir")?;
                i += 2;
            }
            "--gpus" => {
                gpus = Some(take_value(args, i, "--gpus")?);
                i += 2;
            }
            flag if flag.starts_with('-') => return Err(format!("unknown run option: {flag}")),
            positional => {
                if !image.is_empty() {
                    return Err(format!("unexpected argument '{positional}', use -- before the command"));
                }
                image = positional.to_string();
                i += 1;
            }
        }
    }

    let cmd: Vec<String> = args[i.min(args.len())..].to_vec();
    if cmd.is_empty() {
        return Err("run requires a command after --".to_string());
    }
    Ok(Command::Run {
        id,
        tool,
        image,
        cmd,
        env,
        workdir,
        gpus,
    })
}

// =============================================================================
// Runtime Setup
// =============================================================================

fn load_config(global: &GlobalOptions) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(path) = &global.config {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        config = config.merge_yaml(&yaml)?;
    }
    config = config.merge_env(|key| std::env::var(key).ok())?;
    if let Some(root) = &global.root {
        config = config.rooted_at(root);
    }
    Ok(config)
}

/// Creates a publisher honouring the configured publish timeout.
fn event_channel(config: &Config) -> (ChannelPublisher, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    (ChannelPublisher::with_timeout(tx, config.publish_timeout), rx)
}

/// Prints events until the channel closes.
fn spawn_printer(mut rx: mpsc::Receiver<Event>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Log {
                    level,
                    stream,
                    message,
                    ..
                } => println!("[{level}] {stream:?}: {message}"),
                Event::BeginStats { kind, timestamp } => {
                    eprintln!("{timestamp} begin {kind:?}");
                }
                Event::EndStats { kind, timestamp } => {
                    eprintln!("{timestamp} end {kind:?}");
                }
            }
        }
    })
}

fn exit_code(completion: &Completion) -> ExitCode {
    match completion {
        Completion::Exited(outcome) => {
            if let Some(error) = &outcome.error {
                eprintln!("container terminated abnormally: {}", error.message);
            }
            ExitCode::from(u8::try_from(outcome.status_code).unwrap_or(1))
        }
        Completion::Removed => {
            eprintln!("container was removed");
            ExitCode::FAILURE
        }
    }
}

/// Waits for a container, forwarding Ctrl-C to it as SIGINT.
async fn wait_forwarding(
    runtime: &ProcessRuntime,
    container: procrun::Container,
) -> anyhow::Result<ExitCode> {
    let id = container.id.clone();
    let mut wait = std::pin::pin!(container.waiter.wait());
    loop {
        tokio::select! {
            completion = &mut wait => return Ok(exit_code(&completion?)),
            interrupted = tokio::signal::ctrl_c() => {
                interrupted.context("listening for Ctrl-C")?;
                eprintln!("forwarding SIGINT to {id}");
                runtime.signal_container(&id, Signal::Int).await?;
            }
        }
    }
}

// =============================================================================
// Command Implementations
// =============================================================================

async fn cmd_pull(config: Config, image: String, force: bool) -> anyhow::Result<ExitCode> {
    let (publisher, rx) = event_channel(&config);
    let runtime = ProcessRuntime::new(config)?;
    let printer = spawn_printer(rx);

    let req = PullRequest {
        name: image,
        force_pull: force,
    };
    let result = runtime.pull_image(&req, Arc::new(publisher)).await;
    let _ = printer.await;
    result?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_run(
    config: Config,
    id: Option<String>,
    image: String,
    cmd: Vec<String>,
    env: Vec<String>,
    workdir: String,
    gpus: Option<String>,
) -> anyhow::Result<ExitCode> {
    let (publisher, rx) = event_channel(&config);
    let runtime = ProcessRuntime::new(config)?;
    let publisher = Arc::new(publisher);
    let printer = spawn_printer(rx);

    let id = id.map(ContainerId::from).unwrap_or_else(ContainerId::generate);
    let mut spec = RunSpec::new(image, cmd);
    spec.env = env;
    spec.working_dir = workdir;
    if let Some(gpus) = gpus {
        spec.device_requests
            .push(DeviceRequest::nvidia(gpus.split(',').filter(|g| !g.is_empty())));
    }

    runtime.create_container(&id, spec, publisher.clone()).await?;
    let container = runtime.run_container(&id, publisher).await?;
    eprintln!("started {id} (pid {})", container.pid);

    let code = wait_forwarding(&runtime, container).await?;
    drop(runtime);
    let _ = printer.await;
    Ok(code)
}

async fn cmd_attach(config: Config, id: String) -> anyhow::Result<ExitCode> {
    let runtime = ProcessRuntime::new(config)?;
    let container = runtime.reattach_container(&ContainerId::from(id)).await?;
    eprintln!("attached to {} (pid {})", container.id, container.pid);
    wait_forwarding(&runtime, container).await
}

async fn cmd_kill(config: Config, id: String, signal: String) -> anyhow::Result<ExitCode> {
    let Some(signal) = Signal::parse(&signal) else {
        bail!("unknown signal: {signal}");
    };
    let runtime = ProcessRuntime::new(config)?;
    runtime.signal_container(&ContainerId::from(id), signal).await?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_remove(config: Config, id: String, force: bool) -> anyhow::Result<ExitCode> {
    let runtime = ProcessRuntime::new(config)?;
    runtime.remove_container(&ContainerId::from(id), force).await?;
    Ok(ExitCode::SUCCESS)
}

async fn cmd_ps(config: Config) -> anyhow::Result<ExitCode> {
    let runtime = ProcessRuntime::new(config)?;
    let mut running: Vec<_> = runtime
        .list_running_containers(&ListFilter::all())
        .await?
        .into_values()
        .collect();
    running.sort_by(|a, b| a.id.cmp(&b.id));

    println!("ID\tPID\tIMAGE\tCOMMAND");
    for c in running {
        println!("{}\t{}\t{}\t{}", c.id, c.pid, c.image, c.command.join(" "));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_version() {
    println!("procrun version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"procrun - process-backed container runtime

USAGE:
    procrun [--config <file>] [--root <dir>] <command> [options]

COMMANDS:
    pull [--force] <image>          Pull an image into the image cache
    run [options] [<image>] -- <cmd...>
                                    Create and run a container, wait for it
    attach <id>                     Reattach to a container and wait for it
    kill <id> [signal]              Send a signal to a container
    rm <id> [--force]               Remove a container
    ps                              List running containers
    version                         Show version info
    help                            Show this help

RUN OPTIONS:
    --id <id>              Container id (default: random)
    --tool, -t <tool>      singularity, apptainer or host
    --env, -e <K=V>        Environment variable (repeatable)
    --workdir, -w <dir>    Working directory inside the container
    --gpus <ids>           Comma-separated NVIDIA device ids

EXAMPLES:
    procrun pull docker://python:3.11
    procrun run docker://python:3.11 -- python3 -c 'print(1)'
    procrun --root /tmp/pr run --tool host -- sh -c 'echo hi'
"#
    );
}

// =============================================================================
// Main
// =============================================================================

async fn dispatch(global: GlobalOptions, command: Command) -> anyhow::Result<ExitCode> {
    let config = load_config(&global)?;
    match command {
        Command::Pull { image, force } => cmd_pull(config, image, force).await,
        Command::Run {
            id,
            tool,
            image,
            cmd,
            env,
            workdir,
            gpus,
        } => {
            let config = match tool {
                Some(tool) => config.with_tool(
                    ImageTool::parse(&tool).with_context(|| format!("unknown tool: {tool}"))?,
                ),
                None => config,
            };
            cmd_run(config, id, image, cmd, env, workdir, gpus).await
        }
        Command::Attach { id } => cmd_attach(config, id).await,
        Command::Kill { id, signal } => cmd_kill(config, id, signal).await,
        Command::Remove { id, force } => cmd_remove(config, id, force).await,
        Command::Ps => cmd_ps(config).await,
        Command::Version => {
            cmd_version();
            Ok(ExitCode::SUCCESS)
        }
        Command::Help => {
            cmd_help();
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args) {
        Ok((global, command)) => match dispatch(global, command).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {e:#}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("error: {e}");
            cmd_help();
            ExitCode::FAILURE
        }
    }
}
