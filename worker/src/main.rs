use std::error::Error;
use std::io::{self, BufWriter, Write};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shmqueue::{QueueError, SharedQueue, ShmemConfig};

#[derive(Parser)]
#[clap(name = "shmq-worker", about = "Pool member for a shared-memory work queue")]
struct Opts {
    /// TOML file with a [shmem] table. Flags below override it.
    #[clap(short = 'c', long = "config")]
    config: Option<String>,
    #[clap(short = 'n', long = "name")]
    name: Option<String>,
    #[clap(short = 's', long = "size")]
    size: Option<usize>,
    #[clap(long = "lock-timeout-ms")]
    lock_timeout_ms: Option<u64>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the pool and exit, leaving it in place.
    Create,
    /// Create the pool, then close and destroy it on SIGINT/SIGTERM.
    Supervise,
    /// Put COUNT items "TAG:i".
    Produce {
        #[clap(long = "count", default_value = "1")]
        count: usize,
        #[clap(long = "tag", default_value = "0")]
        tag: String,
    },
    /// Print items, one per line, until the queue is closed and drained.
    Consume {
        /// Stop after this many items.
        #[clap(long = "max")]
        max: Option<usize>,
        /// Give up when no item arrives for this long.
        #[clap(long = "idle-timeout-ms")]
        idle_timeout_ms: Option<u64>,
    },
    Close,
    Stat,
    Destroy,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct WorkerConfig {
    shmem: ShmemConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let opts: Opts = Opts::parse();
    let cfg = load_config(&opts)?;
    match &opts.command {
        Command::Create => create(&cfg)?,
        Command::Supervise => supervise(&cfg)?,
        Command::Produce { count, tag } => produce(&cfg, *count, tag)?,
        Command::Consume { max, idle_timeout_ms } => consume(&cfg, *max, idle_timeout_ms.map(Duration::from_millis))?,
        Command::Close => SharedQueue::attach(&cfg)?.close()?,
        Command::Stat => stat(&cfg)?,
        Command::Destroy => SharedQueue::attach(&cfg)?.destroy(),
    }
    Ok(())
}

fn load_config(opts: &Opts) -> Result<ShmemConfig, Box<dyn Error>> {
    let mut cfg = match &opts.config {
        Some(path) => confy::load_path::<WorkerConfig>(path)?.shmem,
        None => ShmemConfig::default(),
    };
    if let Some(name) = &opts.name {
        cfg.name = name.clone();
    }
    if let Some(size) = opts.size {
        cfg.size = size;
    }
    if let Some(ms) = opts.lock_timeout_ms {
        cfg.lock_timeout_ms = ms;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn create(cfg: &ShmemConfig) -> Result<(), QueueError> {
    let queue = SharedQueue::create(cfg)?;
    info!(pool = %queue.name(), size = queue.pool().size(), "pool ready");
    queue.detach();
    Ok(())
}

fn supervise(cfg: &ShmemConfig) -> Result<(), Box<dyn Error>> {
    let queue = SharedQueue::create(cfg)?;
    let mut signals = Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM])?;
    info!(pool = %queue.name(), "supervising pool, waiting for a termination signal");
    if let Some(signal) = signals.forever().next() {
        info!(signal, "shutting down pool");
    }
    let remaining = queue.qsize()?;
    if remaining > 0 {
        warn!(remaining, "closing with items still queued");
    }
    queue.close()?;
    queue.destroy();
    Ok(())
}

fn produce(cfg: &ShmemConfig, count: usize, tag: &str) -> Result<(), QueueError> {
    let queue = SharedQueue::attach(cfg)?;
    for i in 0..count {
        queue.put(format!("{}:{}", tag, i).as_bytes())?;
    }
    info!(tag, count, "produced");
    queue.detach();
    Ok(())
}

fn consume(cfg: &ShmemConfig, max: Option<usize>, idle_timeout: Option<Duration>) -> Result<(), Box<dyn Error>> {
    let queue = SharedQueue::attach(cfg)?;
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut received = 0usize;
    while max.map_or(true, |max| received < max) {
        let item = match idle_timeout {
            Some(timeout) => queue.get_timeout(timeout)?,
            None => queue.get()?,
        };
        match item {
            Some(item) => {
                out.write_all(&item)?;
                out.write_all(b"\n")?;
                received += 1;
            }
            None => break,
        }
    }
    out.flush()?;
    info!(received, "consumer done");
    queue.detach();
    Ok(())
}

fn stat(cfg: &ShmemConfig) -> Result<(), QueueError> {
    let queue = SharedQueue::attach(cfg)?;
    let stats = queue.stats()?;
    println!("name: {}", queue.name());
    println!("pool_size: {}", stats.pool_size);
    println!("len: {}", stats.len);
    println!("live_bytes: {}", stats.live_bytes);
    println!("free_bytes: {}", stats.heap.free_bytes());
    println!("free_nodes: {}", stats.heap.free_nodes);
    println!("largest_free_block: {}", stats.heap.largest_free_block);
    println!("closed: {}", stats.closed);
    println!("total_puts: {}", stats.total_puts);
    println!("total_gets: {}", stats.total_gets);
    queue.detach();
    Ok(())
}
