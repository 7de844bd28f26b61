//! Trace ingestor daemon
//!
//! Reads spans from a Kafka consumer group or from newline-delimited JSON on
//! a file or stdin, assembles traces and writes them to ClickHouse, spooling
//! to disk while the store is down.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use trace_ingestor::ingest::{JsonLinesLog, LogSource};
use trace_ingestor::storage::{ClickHouseStore, SpanStore};
use trace_ingestor::{metrics, telemetry, Config, Ingestor};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    /// Newline-delimited JSON from --input
    Lines,
    /// The consumer group in [kafka]
    Kafka,
}

#[derive(Parser, Debug)]
#[command(name = "ingestor", version, about = "Trace assembly and persistence engine")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, env = "INGESTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Where spans are read from
    #[arg(long, value_enum, default_value_t = Source::Lines)]
    source: Source,

    /// Span input for --source lines, a file of JSON lines or "-" for stdin
    #[arg(short, long, default_value = "-")]
    input: String,

    /// Overrides [log].level
    #[arg(long)]
    log_level: Option<String>,
}

fn open_input(input: &str) -> anyhow::Result<Box<dyn io::BufRead + Send>> {
    if input == "-" {
        return Ok(Box::new(BufReader::new(io::stdin())));
    }
    let file = File::open(input).with_context(|| format!("opening input {}", input))?;
    Ok(Box::new(BufReader::new(file)))
}

fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn SpanStore>> {
    let store = ClickHouseStore::new(config.clickhouse.clone())?;
    match store.ping() {
        Ok(()) => info!(url = %config.clickhouse.url, "clickhouse reachable"),
        Err(e) => warn!(url = %config.clickhouse.url, "clickhouse unreachable, batches will spool: {}", e),
    }
    if config.clickhouse.create_table {
        if let Err(e) = store.ensure_table() {
            warn!("creating clickhouse table failed: {}", e);
        }
    }
    Ok(Arc::new(store))
}

fn run<L: LogSource + 'static>(config: Config, log: L) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("ingestor-rt")
        .enable_all()
        .build()?;

    if config.metrics.enabled {
        let addr: SocketAddr = format!("{}:{}", config.metrics.host, config.metrics.port)
            .parse()
            .context("invalid metrics address")?;
        runtime.spawn(metrics::start_metrics_server(addr));
    }

    let store = connect_store(&config)?;
    let ingestor = Ingestor::start(&config, log, store)?;

    let reason = runtime.block_on(async {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut check = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                res = &mut ctrl_c => {
                    if let Err(e) = res {
                        warn!("unable to listen for shutdown signal: {}", e);
                    }
                    break "signal";
                }
                _ = check.tick() => {
                    if ingestor.is_consumer_finished() {
                        break "input exhausted";
                    }
                }
            }
        }
    });

    info!(reason, "stopping");
    let stats = ingestor.shutdown()?;
    info!(accepted = stats.accepted, rejected = stats.rejected, "ingestor exited");

    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    config.validate()?;

    telemetry::init(&config.log);
    info!(source = ?args.source, "starting ingestor");

    match args.source {
        Source::Lines => {
            info!(input = %args.input, "reading json lines");
            let log = JsonLinesLog::new(open_input(&args.input)?);
            run(config, log)
        }
        Source::Kafka => run_kafka(config),
    }
}

#[cfg(feature = "kafka")]
fn run_kafka(config: Config) -> anyhow::Result<()> {
    let log = trace_ingestor::ingest::KafkaLog::connect(&config.kafka).context("joining kafka consumer group")?;
    run(config, log)
}

#[cfg(not(feature = "kafka"))]
fn run_kafka(_config: Config) -> anyhow::Result<()> {
    anyhow::bail!("ingestor was built without the `kafka` feature")
}
