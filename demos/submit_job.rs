//! Runs a complete grid in one process: a driver, two executor nodes and a submitter
//! that serves a resource to the tasks of its job.
//!
//! ```text
//! cargo run --example submit_job -- --units 40 --nodes 3
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use grid_lite::config::{ClientConfig, DriverConfig, NodeConfig};
use grid_lite::scheduler::{Job, TaskSpec, Unit};
use grid_lite::{Driver, GridClient, Node, Task, TaskContext, TaskRegistry, UnitOutcome};

#[derive(Parser, Debug)]
#[command(name = "submit-job")]
#[command(about = "Run an in-process grid and submit one job to it")]
struct Args {
    /// Number of units in the job
    #[arg(long, default_value = "20")]
    units: usize,

    /// Number of executor nodes
    #[arg(long, default_value = "2")]
    nodes: usize,

    /// Processing threads per node
    #[arg(long, default_value = "2")]
    threads: usize,
}

/// Prefixes its payload with a greeting fetched from the submitter.
struct GreetTask;

#[async_trait]
impl Task for GreetTask {
    async fn run(&self, ctx: TaskContext, payload: Vec<u8>) -> Result<Vec<u8>, String> {
        let greeting = ctx
            .resource("greeting")
            .await
            .map_err(|e| e.to_string())?
            .ok_or("greeting not provided")?;
        let mut out = greeting;
        out.extend_from_slice(b", ");
        out.extend_from_slice(&payload);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(out)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let args = Args::parse();
    let shutdown = CancellationToken::new();

    let listen: SocketAddr = "127.0.0.1:0".parse()?;
    let driver = Driver::start(DriverConfig::new(listen), shutdown.clone()).await?;
    let addr = driver.local_addr().to_string();
    println!("Driver on {addr}");

    for _ in 0..args.nodes {
        let registry = TaskRegistry::with_builtins().with("greet", GreetTask);
        let node = Node::new(
            NodeConfig::new(addr.clone()).with_threads(args.threads),
            registry,
        );
        tokio::spawn(node.run(shutdown.clone()));
    }

    let mut resources = HashMap::new();
    resources.insert("greeting".to_string(), b"hello".to_vec());
    let client =
        GridClient::connect_with_resources(ClientConfig::new(addr), Arc::new(resources)).await?;

    let mut job = Job::new("greetings");
    for i in 0..args.units {
        job.add_unit(Unit::new(TaskSpec::new("greet", format!("unit {i}"))));
    }
    let handle = client.submit(job).await?;
    println!("Submitted job {}", handle.job_id());

    let report = handle.wait().await?;
    for result in &report.results {
        match &result.outcome {
            UnitOutcome::Completed { output } => {
                println!("{:>3}: {}", result.position, String::from_utf8_lossy(output))
            }
            other => println!("{:>3}: {}", result.position, other.label()),
        }
    }

    let stats = driver.management().statistics();
    println!(
        "{} units dispatched, {} requeued, mean unit time {:.1} ms",
        stats.units_dispatched, stats.units_requeued, stats.mean_unit_ms
    );

    shutdown.cancel();
    driver.join().await;
    Ok(())
}
