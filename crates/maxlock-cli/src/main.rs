use std::{error::Error, process::ExitCode, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use maxlock_dsync::{
    CoordinatorConfig, Lock, LockCoordinator, MemoryNode, SharedNode, TracingSink,
};
use maxlock_resp::RespNode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "maxlock", about = "Quorum lock coordinator over independent key-value nodes")]
struct Cli {
    /// Comma separated node endpoints, e.g. redis://10.0.0.1:6379,10.0.0.2
    #[arg(long, env = "MAXLOCK_NODES", global = true)]
    nodes: Option<String>,

    /// Run against an in-process cluster of this many nodes instead.
    #[arg(long, global = true, conflicts_with = "nodes")]
    memory: Option<usize>,

    /// Connect timeout for each node, in milliseconds.
    #[arg(long, global = true, default_value_t = 2_000)]
    connect_timeout_ms: u64,

    #[arg(long, global = true)]
    drift_factor: Option<f64>,

    #[arg(long, global = true)]
    retry_count: Option<u32>,

    #[arg(long, global = true)]
    retry_delay_ms: Option<u64>,

    #[arg(long, global = true)]
    retry_jitter_ms: Option<u64>,

    #[arg(long, global = true)]
    attempt_timeout_ms: Option<u64>,

    /// Print lock handles as JSON.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct LockArgs {
    #[arg(long = "resource", required = true)]
    resources: Vec<String>,

    #[arg(long, default_value_t = 10_000)]
    duration_ms: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Acquire a lock, hold it, then release it.
    Lock {
        #[command(flatten)]
        lock: LockArgs,

        /// How long to hold before releasing. Waits for ctrl-c when omitted.
        #[arg(long)]
        hold_ms: Option<u64>,
    },
    /// Run a command while holding a lock, extending it until the command exits.
    Exec {
        #[command(flatten)]
        lock: LockArgs,

        #[arg(trailing_var_arg = true, required = true, num_args = 1..)]
        command: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn Error>> {
    let env_filter = EnvFilter::from_default_env().add_directive("maxlock=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = coordinator_config(&cli)?;
    let nodes = build_nodes(&cli)?;
    let coordinator = LockCoordinator::new(nodes, config)?.with_sink(Arc::new(TracingSink));
    info!(
        nodes = coordinator.node_count(),
        quorum = coordinator.quorum(),
        "coordinator ready"
    );

    let result = match &cli.command {
        Command::Lock { lock, hold_ms } => {
            run_lock(&coordinator, lock, *hold_ms, cli.json).await.map(|()| ExitCode::SUCCESS)
        }
        Command::Exec { lock, command } => run_exec(&coordinator, lock, command, cli.json).await,
    };

    if let Err(err) = coordinator.shutdown().await {
        warn!(error = %err, "shutdown did not close every node");
    }
    result
}

fn coordinator_config(cli: &Cli) -> Result<CoordinatorConfig, Box<dyn Error>> {
    let mut config = CoordinatorConfig::from_env()?;
    if let Some(drift_factor) = cli.drift_factor {
        config.drift_factor = drift_factor;
    }
    if let Some(retry_count) = cli.retry_count {
        config.retry.retry_count = retry_count;
    }
    if let Some(delay) = cli.retry_delay_ms {
        config.retry.retry_delay = Duration::from_millis(delay);
    }
    if let Some(jitter) = cli.retry_jitter_ms {
        config.retry.retry_jitter = Duration::from_millis(jitter);
    }
    if let Some(timeout) = cli.attempt_timeout_ms {
        config.retry.attempt_timeout = Duration::from_millis(timeout);
    }
    Ok(config)
}

fn build_nodes(cli: &Cli) -> Result<Vec<SharedNode>, Box<dyn Error>> {
    if let Some(size) = cli.memory {
        return Ok(MemoryNode::shared(&MemoryNode::cluster(size)));
    }

    let connect_timeout = Duration::from_millis(cli.connect_timeout_ms);
    let endpoints = maxlock_resp::parse_list(cli.nodes.as_deref().unwrap_or_default())?;
    Ok(endpoints
        .into_iter()
        .map(|endpoint| {
            Arc::new(RespNode::new(endpoint).with_connect_timeout(connect_timeout)) as SharedNode
        })
        .collect())
}

fn print_lock(lock: &Lock, json: bool) -> Result<(), Box<dyn Error>> {
    if json {
        println!("{}", serde_json::to_string(lock)?);
    } else {
        println!(
            "locked {} token={} expires={} attempts={}",
            lock.resources().join(","),
            lock.token(),
            lock.expiration().to_rfc3339(),
            lock.attempts().len()
        );
    }
    Ok(())
}

async fn run_lock(
    coordinator: &LockCoordinator,
    args: &LockArgs,
    hold_ms: Option<u64>,
    json: bool,
) -> Result<(), Box<dyn Error>> {
    let duration = Duration::from_millis(args.duration_ms);
    let mut lock = coordinator.acquire(&args.resources, duration, None).await?;
    print_lock(&lock, json)?;

    match hold_ms {
        Some(hold_ms) => tokio::time::sleep(Duration::from_millis(hold_ms)).await,
        None => {
            info!("holding lock until interrupted");
            tokio::signal::ctrl_c().await?;
        }
    }

    let stats = coordinator.release(&mut lock, None).await?;
    info!(
        released = stats.votes_for.len(),
        failed = stats.votes_against.len(),
        "lock released"
    );
    Ok(())
}

async fn run_exec(
    coordinator: &LockCoordinator,
    args: &LockArgs,
    command: &[String],
    json: bool,
) -> Result<ExitCode, Box<dyn Error>> {
    let Some((program, program_args)) = command.split_first() else {
        return Err("missing command".into());
    };
    let duration = Duration::from_millis(args.duration_ms);
    let mut lock = coordinator.acquire(&args.resources, duration, None).await?;
    print_lock(&lock, json)?;

    let mut child = tokio::process::Command::new(program)
        .args(program_args)
        .kill_on_drop(true)
        .spawn()?;

    let mut renew = tokio::time::interval((duration / 2).max(Duration::from_millis(1)));
    renew.tick().await;

    let status = loop {
        tokio::select! {
            status = child.wait() => break Some(status?),
            _ = renew.tick() => {
                match coordinator.extend(&mut lock, duration, None).await {
                    Ok(extended) => lock = extended,
                    Err(err) => {
                        warn!(error = %err, "lost the lock; stopping command");
                        child.kill().await?;
                        break None;
                    }
                }
            }
        }
    };

    if let Err(err) = coordinator.release(&mut lock, None).await {
        warn!(error = %err, "release did not reach quorum; keys will expire");
    }

    let code = match status {
        Some(status) => status
            .code()
            .and_then(|code| u8::try_from(code).ok())
            .unwrap_or(1),
        None => 1,
    };
    Ok(ExitCode::from(code))
}
