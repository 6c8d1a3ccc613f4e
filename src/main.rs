use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::{Layer as _, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use slotd::config::ServerConfig;
use slotd::engine::Engine;
use slotd::server_dir::ServerDir;
use slotd::shutdown::install_shutdown_handler;
use slotd::supervisor::Supervisor;
use slotd::wire;

#[derive(Parser, Debug)]
#[command(name = "slotd")]
#[command(version)]
#[command(about = "A slot-capped job queue daemon")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground
    Serve {
        /// Server directory holding the port file and log sinks
        server_dir: PathBuf,

        /// Number of resource slots to schedule against
        #[arg(long, default_value = "1")]
        slots: u32,

        /// Listening port; 0 picks an ephemeral port
        #[arg(long, default_value = "0")]
        port: u16,

        /// Seconds between scheduler cycles
        #[arg(long, default_value = "3")]
        poll_interval: u64,

        /// Seconds a graceful shutdown waits for running jobs before
        /// killing them
        #[arg(long, default_value = "30")]
        drain_timeout: u64,
    },

    /// Queue a command on a running daemon
    Submit {
        /// Server directory of the target daemon
        server_dir: PathBuf,

        /// Put the job in the priority tier
        #[arg(short, long)]
        priority: bool,

        /// Slots the job needs while running
        #[arg(short, long, default_value = "1")]
        slots: u32,

        /// Executable path and its arguments (after --)
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },

    /// Show pending-job and free-slot counts for a running daemon
    Status {
        /// Server directory of the target daemon
        server_dir: PathBuf,
    },
}

/// Route INFO and up to the log sink, WARN and up to the error sink.
/// `RUST_LOG` can tighten or widen the log-sink filter.
fn init_logging(log: File, err: File) {
    let log_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(log))
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        );
    let err_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Arc::new(err))
        .with_filter(LevelFilter::WARN);
    tracing_subscriber::registry()
        .with(log_layer)
        .with(err_layer)
        .init();
}

async fn run_serve(
    dir: PathBuf,
    slots: u32,
    port: u16,
    poll_interval: u64,
    drain_timeout: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let server_dir = ServerDir::create(&dir)?;
    let log = server_dir.log_sink()?;
    let err = server_dir.err_sink()?;
    init_logging(log.try_clone()?, err.try_clone()?);

    let config = ServerConfig {
        slots,
        port,
        poll_interval: Duration::from_secs(poll_interval),
        drain_timeout: Duration::from_secs(drain_timeout),
        ..Default::default()
    };
    let supervisor =
        Supervisor::new(config.slot_env_var.clone(), config.max_env_value_len).with_output(log, err);
    let engine = Arc::new(Engine::new(&config, supervisor)?);

    let listener = wire::Listener::bind(engine.clone(), config.port).await?;
    let actual_port = listener.local_port()?;
    server_dir.write_port(actual_port)?;

    tracing::info!(
        dir = %server_dir.path().display(),
        port = actual_port,
        slots,
        "slotd serving"
    );
    println!("Serving on port {actual_port} with {slots} slots");

    let shutdown = install_shutdown_handler()?;
    let listener_task = tokio::spawn(listener.run(shutdown.clone()));
    engine.run(shutdown).await;
    let _ = listener_task.await;
    Ok(())
}

async fn run_submit(dir: PathBuf, priority: bool, slots: u32, command: Vec<String>) {
    let port = match ServerDir::open(&dir).and_then(|d| d.read_port()) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    match wire::submit_job(port, command, priority, slots).await {
        Ok(receipt) => {
            println!("Job queued");
            println!("Job ID: {}", receipt.job_id);
        }
        Err(e) => {
            eprintln!("Error: failed to submit job: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_status(dir: PathBuf) {
    let port = match ServerDir::open(&dir).and_then(|d| d.read_port()) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    match wire::fetch_status(port).await {
        Ok(status) => {
            println!("Pending jobs: {}", status.pending);
            println!("Running jobs: {}", status.running);
            println!(
                "Free slots:   {} of {}",
                status.free_slots, status.total_slots
            );
        }
        Err(e) => {
            eprintln!("Error: failed to fetch status: {e}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Serve {
            server_dir,
            slots,
            port,
            poll_interval,
            drain_timeout,
        } => {
            run_serve(server_dir, slots, port, poll_interval, drain_timeout).await?;
        }
        Commands::Submit {
            server_dir,
            priority,
            slots,
            command,
        } => {
            run_submit(server_dir, priority, slots, command).await;
        }
        Commands::Status { server_dir } => {
            run_status(server_dir).await;
        }
    }

    Ok(())
}
