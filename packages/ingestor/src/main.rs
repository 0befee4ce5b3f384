use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chainwatch_ingestor::dedup::{Deduplicator, DEFAULT_DEDUP_CAPACITY};
use chainwatch_ingestor::exporter::MetricSnapshotExporter;
use chainwatch_ingestor::filter::{ThresholdGate, TransferQuery, DEFAULT_THRESHOLD};
use chainwatch_ingestor::metrics::ServiceMetrics;
use chainwatch_ingestor::oracle::VotePenaltyClient;
use chainwatch_ingestor::pipeline::TransferPipeline;
use chainwatch_ingestor::projector::{MetricProjector, ProjectionKind, ProjectorConfig};
use chainwatch_ingestor::rpc::{RpcClient, RpcConfig, DEFAULT_RPC_URL};
use chainwatch_ingestor::server::{self, AppState, ServerError, DEFAULT_LISTEN_ADDR};
use chainwatch_ingestor::session::{SessionConfig, SessionError, SubscriptionSession};
use chainwatch_ingestor::source::{
    EventLogConfig, EventLogSource, EventSource, LatestTxSource, PollConfig,
    DEFAULT_POLL_INTERVAL_MS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SourceKind {
    /// Cursor-based long-poll of the node's event log
    EventLog,
    /// Poll for the most recent matching transaction
    Poll,
}

#[derive(Parser)]
#[command(author, version, about = "Exports large bank transfers as Prometheus metrics")]
struct Cli {
    /// Node RPC URL
    #[arg(long, env = "CHAINWATCH_RPC_URL", default_value = DEFAULT_RPC_URL)]
    rpc_url: String,

    /// REST gateway URL for oracle queries; oracle endpoint is disabled when unset
    #[arg(long, env = "CHAINWATCH_LCD_URL")]
    lcd_url: Option<String>,

    /// Address the metrics server listens on
    #[arg(long, env = "CHAINWATCH_LISTEN", default_value = DEFAULT_LISTEN_ADDR)]
    listen: SocketAddr,

    /// Chain id attached as a constant label to every exported series
    #[arg(long, env = "CHAINWATCH_CHAIN_ID")]
    chain_id: Option<String>,

    /// Transfers at or below this amount are dropped
    #[arg(long, env = "CHAINWATCH_THRESHOLD", default_value_t = DEFAULT_THRESHOLD)]
    threshold: f64,

    /// counter, expiring-gauge or histogram
    #[arg(long, env = "CHAINWATCH_PROJECTION", default_value_t = ProjectionKind::ExpiringGauge)]
    projection: ProjectionKind,

    /// Lifetime of an expiring gauge sample after its last write
    #[arg(long, env = "CHAINWATCH_EXPIRY_SECS", default_value_t = 300)]
    expiry_secs: u64,

    /// Number of recent transaction hashes remembered for deduplication
    #[arg(long, env = "CHAINWATCH_DEDUP_CAPACITY", default_value_t = DEFAULT_DEDUP_CAPACITY)]
    dedup_capacity: usize,

    #[arg(long, env = "CHAINWATCH_SOURCE", value_enum, default_value_t = SourceKind::EventLog)]
    source: SourceKind,

    /// Delay between polls when using the polling source
    #[arg(long, env = "CHAINWATCH_POLL_INTERVAL_MS", default_value_t = DEFAULT_POLL_INTERVAL_MS)]
    poll_interval_ms: u64,

    /// Emit logs as JSON
    #[arg(long, env = "CHAINWATCH_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

impl Cli {
    fn const_labels(&self) -> HashMap<String, String> {
        self.chain_id
            .iter()
            .map(|id| ("chain_id".to_string(), id.clone()))
            .collect()
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let client = Arc::new(RpcClient::new(RpcConfig::with_url(cli.rpc_url.clone()))?);
    let query = TransferQuery::bank_send().to_string();

    match cli.source {
        SourceKind::EventLog => {
            let source = EventLogSource::new(client, query, EventLogConfig::default());
            run(&cli, source).await
        }
        SourceKind::Poll => {
            let config = PollConfig {
                interval_ms: cli.poll_interval_ms,
                ..Default::default()
            };
            run(&cli, LatestTxSource::new(client, query, config)).await
        }
    }
}

async fn run<S: EventSource>(cli: &Cli, source: S) -> Result<()> {
    let const_labels = cli.const_labels();

    let projector = Arc::new(MetricProjector::new(ProjectorConfig {
        kind: cli.projection,
        expiry: Duration::from_secs(cli.expiry_secs),
        const_labels: const_labels.clone(),
        ..Default::default()
    })?);
    let metrics = Arc::new(ServiceMetrics::new()?);
    let pipeline = TransferPipeline::new(
        Deduplicator::new(cli.dedup_capacity),
        ThresholdGate::new(cli.threshold),
        Arc::clone(&projector),
        Arc::clone(&metrics),
    );

    let oracle = match &cli.lcd_url {
        Some(url) => Some(Arc::new(VotePenaltyClient::new(url, const_labels)?)),
        None => None,
    };

    info!(
        projection = %cli.projection,
        threshold = cli.threshold,
        "Starting chainwatch"
    );

    let cancel = CancellationToken::new();
    let session = Arc::new(SubscriptionSession::new(
        source,
        pipeline,
        SessionConfig::default(),
    ));
    session
        .start(cancel.clone())
        .await
        .context("could not start subscription session")?;

    let state = AppState {
        exporter: Arc::new(MetricSnapshotExporter::new(projector, metrics)),
        oracle,
        session: session.state_handle(),
    };
    let mut server_task = tokio::spawn(server::serve(cli.listen, state, cancel.clone()));
    let mut session_task = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.wait().await })
    };

    let result = tokio::select! {
        res = &mut session_task => session_result(res),
        res = &mut server_task => server_result(res),
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    cancel.cancel();
    if !server_task.is_finished() {
        if let Err(e) = server_result(server_task.await) {
            error!("Metrics server did not shut down cleanly: {:#}", e);
        }
    }
    if !session_task.is_finished() {
        if let Err(e) = session_result(session_task.await) {
            error!("Subscription session did not shut down cleanly: {:#}", e);
        }
    }

    result
}

fn session_result(res: Result<Result<(), SessionError>, JoinError>) -> Result<()> {
    res.context("subscription session task panicked")?
        .context("subscription session terminated")
}

fn server_result(res: Result<Result<(), ServerError>, JoinError>) -> Result<()> {
    res.context("metrics server task panicked")?
        .context("metrics server failed")
}
