//! CLI for BigFan
//!
//! Subcommands:
//! - `serve`: run the gateway, the consumer server, the sweeper and local workers
//! - `worker`: run a worker against a remote gateway's consumer server
//! - `dead-letters`: inspect, replay or purge dead letters

use std::sync::Arc;
use std::time::Duration;

use bigfan::broker::Broker;
use bigfan::client::RemoteQueue;
use bigfan::config::{Settings, load_config, load_config_from};
use bigfan::transport::http::start_http_server;
use bigfan::transport::websocket::start_consumer_server;
use bigfan::utils::error::Result;
use bigfan::utils::logging;
use bigfan::worker::{LoggingHandler, Worker};
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "bigfan", version, about = "Fan-out message gateway")]
struct Cli {
    /// Configuration file; defaults to `config/default.*`
    #[arg(long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP gateway, the consumer server and in-process workers
    Serve,
    /// Consume one queue of a running gateway over WebSocket
    Worker {
        /// Consumer server URL
        #[arg(long, default_value = "ws://127.0.0.1:8081")]
        url: String,
        #[arg(long)]
        queue: String,
        /// Label used in the handler's log lines
        #[arg(long)]
        label: Option<String>,
    },
    /// Operate on the dead-letter store (gateway must be stopped)
    DeadLetters {
        #[command(subcommand)]
        action: DeadLetterAction,
    },
}

#[derive(Subcommand)]
enum DeadLetterAction {
    /// Print every dead letter as one JSON line
    List,
    /// Put a dead letter back on a queue
    Replay {
        id: String,
        /// Target queue; defaults to the queue it came from
        #[arg(long)]
        queue: Option<String>,
    },
    /// Drop dead letters older than the retention period
    Purge,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let loaded = match cli.config.as_deref() {
        Some(path) => load_config_from(path),
        None => load_config(),
    };
    let settings = match loaded {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    let result = match cli.command {
        Command::Serve => run_server(settings).await,
        Command::Worker { url, queue, label } => {
            let label = label.unwrap_or_else(|| queue.clone());
            run_remote_worker(&settings, &url, &queue, &label).await
        }
        Command::DeadLetters { action } => run_dead_letters(&settings, action).await,
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_server(settings: Settings) -> Result<()> {
    let broker = Arc::new(Broker::open(&settings)?);
    let shutdown = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    tasks.push(tokio::spawn(Broker::start_sweep_loop(
        broker.clone(),
        Duration::from_millis(settings.queue.sweep_interval_ms),
        shutdown.clone(),
    )));

    let wait_time = Duration::from_millis(settings.queue.wait_time_ms);
    for queue in broker.queues() {
        for _ in 0..settings.workers.per_queue {
            let worker = Worker::new(queue.clone(), Arc::new(LoggingHandler::new(queue.name())))
                .with_batch(settings.queue.max_messages, wait_time);
            tasks.push(tokio::spawn(worker.run(shutdown.clone())));
        }
    }

    {
        let addr = format!("{}:{}", settings.server.host, settings.server.consumer_port);
        let (broker, shutdown) = (broker.clone(), shutdown.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = start_consumer_server(&addr, broker, shutdown.clone()).await {
                error!("Consumer server failed: {e}");
                shutdown.cancel();
            }
        }));
    }
    {
        let addr = format!("{}:{}", settings.server.host, settings.server.port);
        let (broker, shutdown) = (broker.clone(), shutdown.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = start_http_server(&addr, broker, shutdown.clone()).await {
                error!("Gateway failed: {e}");
                shutdown.cancel();
            }
        }));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
        _ = shutdown.cancelled() => {
            error!("A server exited unexpectedly.");
        }
    }

    shutdown.cancel();
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            error!("task failed during shutdown: {e}");
        }
    }
    broker.flush().await
}

async fn run_remote_worker(settings: &Settings, url: &str, queue: &str, label: &str) -> Result<()> {
    let remote = RemoteQueue::connect(url, queue).await?;
    let worker = Worker::new(Arc::new(remote), Arc::new(LoggingHandler::new(label))).with_batch(
        settings.queue.max_messages,
        Duration::from_millis(settings.queue.wait_time_ms),
    );

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {e}");
    }
    info!("Shutdown signal received. Stopping worker.");
    shutdown.cancel();
    if let Err(e) = handle.await {
        error!("worker task failed: {e}");
    }
    Ok(())
}

async fn run_dead_letters(settings: &Settings, action: DeadLetterAction) -> Result<()> {
    let broker = Broker::open(settings)?;
    match action {
        DeadLetterAction::List => {
            for letter in broker.dead_letters().list()? {
                println!("{}", serde_json::to_string(&letter)?);
            }
        }
        DeadLetterAction::Replay { id, queue } => {
            let entry_id = broker.replay_dead_letter(&id, queue.as_deref())?;
            println!("{entry_id}");
        }
        DeadLetterAction::Purge => {
            let purged = broker.dead_letters().purge_expired()?;
            println!("purged {purged} dead letter(s)");
        }
    }
    broker.flush().await
}
