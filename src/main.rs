use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use grid_lite::config::{
    ClientConfig, DriverConfig, LoadBalancerConfig, NodeConfig, ProportionalSettings, QueueConfig,
};
use grid_lite::scheduler::{Job, TaskSpec, Unit, UnitTimeout};
use grid_lite::shutdown::install_shutdown_handler;
use grid_lite::{Driver, GridClient, Node, TaskRegistry, UnitOutcome};

#[derive(Parser, Debug)]
#[command(name = "grid-lite")]
#[command(version)]
#[command(about = "A task grid: one driver dispatching bundles of work units to executor nodes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a driver
    Driver(DriverArgs),

    /// Start an executor node
    Node(NodeArgs),

    /// Submit a job of builtin tasks and print its report
    Submit(SubmitArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Algorithm {
    Fixed,
    Proportional,
    NodeThreads,
}

#[derive(Parser, Debug)]
struct DriverArgs {
    /// Address of the single acceptor port
    #[arg(long, default_value = "0.0.0.0:11111")]
    listen: SocketAddr,

    /// Address of the HTTP management API (optional)
    #[arg(long)]
    management: Option<SocketAddr>,

    /// Load-balancing algorithm
    #[arg(long, value_enum, default_value = "proportional")]
    algorithm: Algorithm,

    /// Bundle size for the fixed algorithm, upper bound for the others
    #[arg(long, default_value = "10")]
    bundle_size: usize,

    /// Bundles per processing thread for the node-threads algorithm
    #[arg(long, default_value = "1")]
    multiplier: usize,

    /// Target per-unit latency for the proportional algorithm
    #[arg(long, default_value = "100")]
    target_latency_ms: u64,

    /// Maximum number of queued jobs
    #[arg(long, default_value = "10000")]
    max_jobs: usize,

    /// Serve equal-priority jobs in strict admission order
    #[arg(long)]
    strict_fifo: bool,
}

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Driver acceptor address
    #[arg(long, short = 'd', default_value = "127.0.0.1:11111")]
    driver: String,

    /// Number of processing threads (defaults to the available parallelism)
    #[arg(long)]
    threads: Option<usize>,

    /// Announce this node as a peer dispatcher
    #[arg(long)]
    peer: bool,

    /// Reported properties, as key=value (repeatable)
    #[arg(long = "property", value_parser = parse_property)]
    properties: Vec<(String, String)>,
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Driver acceptor address
    #[arg(long, short = 'd', default_value = "127.0.0.1:11111")]
    driver: String,

    /// Job name
    #[arg(long, default_value = "cli-job")]
    name: String,

    /// Builtin task kind of every unit (echo, sleep, fail)
    #[arg(long, default_value = "echo")]
    task: String,

    /// Payload of every unit
    #[arg(long, default_value = "hello")]
    payload: String,

    /// Number of units
    #[arg(long, short = 'n', default_value = "10")]
    units: usize,

    #[arg(long, default_value = "0")]
    priority: i32,

    /// Per-unit timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Driver(args) => run_driver(args).await,
        Commands::Node(args) => run_node(args).await,
        Commands::Submit(args) => run_submit(args).await,
    }
}

async fn run_driver(args: DriverArgs) -> Result<(), Box<dyn std::error::Error>> {
    let load_balancer = match args.algorithm {
        Algorithm::Fixed => LoadBalancerConfig::Fixed {
            size: args.bundle_size,
        },
        Algorithm::Proportional => LoadBalancerConfig::Proportional(ProportionalSettings {
            max_size: args.bundle_size,
            target_latency_ms: args.target_latency_ms,
            ..ProportionalSettings::default()
        }),
        Algorithm::NodeThreads => LoadBalancerConfig::NodeThreads {
            multiplier: args.multiplier,
            max_size: args.bundle_size,
        },
    };
    let mut config = DriverConfig::new(args.listen)
        .with_load_balancer(load_balancer)
        .with_queue(QueueConfig {
            max_jobs: args.max_jobs,
            fair_rotation: !args.strict_fifo,
        });
    if let Some(addr) = args.management {
        config = config.with_management(addr);
    }

    let shutdown = install_shutdown_handler();
    let driver = Driver::start(config, shutdown.clone()).await?;
    println!("Driver listening on {}", driver.local_addr());
    if let Some(addr) = driver.management_addr() {
        println!("Management API on http://{addr}");
    }

    shutdown.cancelled().await;
    driver.join().await;
    tracing::info!("Driver shutdown complete");
    Ok(())
}

async fn run_node(args: NodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = NodeConfig::new(args.driver);
    config.is_peer = args.peer;
    if let Some(threads) = args.threads {
        config = config.with_threads(threads);
    }
    for (key, value) in args.properties {
        config = config.with_property(key, value);
    }

    let shutdown = install_shutdown_handler();
    let node = Node::new(config, TaskRegistry::with_builtins());
    tracing::info!(node = %node.uuid(), "Starting node");
    node.run(shutdown).await?;
    Ok(())
}

async fn run_submit(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let client = GridClient::connect(ClientConfig::new(args.driver)).await?;

    let mut job = Job::new(args.name).with_priority(args.priority);
    for i in 0..args.units {
        let mut unit = Unit::new(TaskSpec::new(args.task.clone(), args.payload.clone()))
            .with_id(format!("unit-{i}"));
        if let Some(ms) = args.timeout_ms {
            unit = unit.with_timeout(UnitTimeout::after(Duration::from_millis(ms)));
        }
        job.add_unit(unit);
    }

    let handle = client.submit(job).await?;
    println!("Job submitted: {}", handle.job_id());
    let report = handle.wait().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{} {}: {}/{} completed{}",
        report.job_id,
        report.name,
        report.completed_count(),
        report.results.len(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
    println!("{:<10} {:<12} {:>10}  OUTPUT", "POSITION", "STATUS", "ELAPSED");
    println!("{}", "-".repeat(60));
    for result in &report.results {
        let output = match &result.outcome {
            UnitOutcome::Completed { output } => String::from_utf8_lossy(output).into_owned(),
            UnitOutcome::Failed { error } => error.clone(),
            _ => String::new(),
        };
        println!(
            "{:<10} {:<12} {:>8}ms  {}",
            result.position,
            result.outcome.label(),
            result.elapsed_ms,
            output
        );
    }
    Ok(())
}

