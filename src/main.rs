use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

use swarmbee_worker::batch::{BatchConfig, BatchSealer};
use swarmbee_worker::config::{Config, LogFormat};
use swarmbee_worker::dispatcher::{Collaborators, DispatcherConfig, JobDispatcher};
use swarmbee_worker::health::HealthChecker;
use swarmbee_worker::inference::HttpInferenceProvider;
use swarmbee_worker::metrics::MetricsCollector;
use swarmbee_worker::prometheus_metrics::PrometheusMetrics;
use swarmbee_worker::queue::HttpJobQueue;
use swarmbee_worker::receipt::ReceiptFactory;
use swarmbee_worker::sampler::AdaptiveSampler;
use swarmbee_worker::server::HealthServer;
use swarmbee_worker::signing::{Secp, Signer};
use swarmbee_worker::store::ReceiptStore;

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().with_current_span(true).init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    config.validate()?;
    init_tracing(&config);

    let span = info_span!("worker", identity = %config.worker_identity, epoch = config.epoch);
    run(config).instrument(span).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        slots = config.slots.len(),
        batch_size = config.merkle_batch_size,
        inference_url = %config.inference_url,
        queue_url = %config.queue_url,
        "starting worker"
    );

    let signer: Option<Arc<dyn Signer>> = match &config.worker_sk_hex {
        Some(sk_hex) => {
            let secp = Secp::from_hex(sk_hex)?;
            info!(pubkey = %secp.key_ref(), "signing key loaded");
            Some(Arc::new(secp))
        }
        None => {
            warn!("WORKER_SK_HEX not set, batch roots will be unsigned");
            None
        }
    };

    let store = ReceiptStore::open(&config.receipts_dir).await?;
    let sealer = Arc::new(
        BatchSealer::open(
            BatchConfig {
                worker_identity: config.worker_identity.clone(),
                epoch: config.epoch,
                batch_size: config.merkle_batch_size,
                retry: config.retry_config(),
            },
            store,
            signer.clone(),
        )
        .await?,
    );

    let queue = Arc::new(HttpJobQueue::new(&config.queue_url, &config.queue_prefix, &config.human_review_queue)?);
    let inference = Arc::new(HttpInferenceProvider::new(&config.inference_url, config.job_timeout())?);
    let metrics = Arc::new(MetricsCollector::new(config.sampling.low_confidence_threshold));

    let mut dispatcher = JobDispatcher::new(
        DispatcherConfig::from(&config),
        config.slots.clone(),
        AdaptiveSampler::new(config.sampling.clone()),
        ReceiptFactory::new(config.worker_identity.clone(), signer),
        Arc::clone(&sealer),
        Collaborators { inference, queue: queue.clone(), review: queue },
    )
    .with_observer(metrics.clone());

    let prometheus = config.metrics_enabled.then(|| Arc::new(PrometheusMetrics::new()));
    if let Some(p) = &prometheus {
        dispatcher = dispatcher.with_observer(p.clone());
    }
    let dispatcher = Arc::new(dispatcher);

    let mut checker = HealthChecker::new(metrics, Arc::clone(&dispatcher), &config);
    if let Some(p) = prometheus {
        checker = checker.with_prometheus(p);
    }
    let server = HealthServer::new(Arc::new(checker), SocketAddr::from(([0, 0, 0, 0], config.health_port)));
    tokio::spawn(
        async move {
            if let Err(e) = server.start().await {
                error!(error = %e, "health server stopped");
            }
        }
        .in_current_span(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatch_loop = tokio::spawn(Arc::clone(&dispatcher).run(shutdown_rx).in_current_span());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining in-flight jobs");
    let _ = shutdown_tx.send(true);
    dispatch_loop.await?;

    if let Some(manifest) = sealer.flush().await? {
        info!(batch_id = %manifest.batch_id, receipts = manifest.receipt_count, "sealed partial batch");
    }
    info!("worker stopped");
    Ok(())
}
