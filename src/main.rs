//! listing-radar binary entrypoint.
//! Wires config, store, leader election, pollers, the push feed, the market
//! catalog refresh and the HTTP surface, then runs until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use listing_radar::config::RadarConfig;
use listing_radar::ingest::http::{JsonMarketListProvider, JsonNoticeSource};
use listing_radar::ingest::{feed_channel, NoticeSource};
use listing_radar::latency::LatencyTracker;
use listing_radar::leader::{LeaderElector, SqliteLockRepository};
use listing_radar::metrics::{feed_router, status_router, Metrics};
use listing_radar::pipeline::{LogDispatcher, Pipeline, PipelineParts};
use listing_radar::resilience::Guard;
use listing_radar::store::SqliteStore;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const RETENTION_SWEEP: Duration = Duration::from_secs(3600);

/// Compact logs by default; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("listing_radar=info,warn"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = RadarConfig::load_default()?;
    if let Some(parent) = cfg.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = SqliteStore::open(&cfg.db_path).context("opening sqlite store")?;

    let metrics = Metrics::init()?;
    let guard = Arc::new(Guard::new(&cfg.resilience));
    let latency = Arc::new(LatencyTracker::new(cfg.latency.clone()));
    latency.start();

    let leader = if cfg.leader_election {
        let id = cfg
            .instance_id
            .clone()
            .unwrap_or_else(LeaderElector::random_instance_id);
        let repo = Arc::new(SqliteLockRepository::new(store.clone()));
        let elector = Arc::new(LeaderElector::new(id, repo, cfg.leader.clone()));
        elector.spawn_campaign();
        Some(elector)
    } else {
        None
    };

    let pipeline = Arc::new(Pipeline::new(PipelineParts {
        store: store.clone(),
        dispatcher: Arc::new(LogDispatcher),
        guard: guard.clone(),
        latency: latency.clone(),
        leader: leader.clone(),
        config: cfg.pipeline.clone(),
    }));

    let call_timeout = cfg.resilience.call_timeout.max(Duration::from_secs(1));
    for s in &cfg.sources {
        let source: Arc<dyn NoticeSource> =
            Arc::new(JsonNoticeSource::new(s.name.clone(), s.url.clone(), call_timeout)?);
        pipeline.spawn_poller(source, s.poll_interval.unwrap_or(cfg.poll_interval));
        info!(target: "pipeline", source = %s.name, url = %s.url, "poller started");
    }
    if cfg.sources.is_empty() && cfg.feed_source.is_none() {
        warn!(target: "pipeline", "no sources configured; only the HTTP surface is running");
    }

    let mut app = metrics.router().merge(status_router(pipeline.clone()));
    if let Some(name) = &cfg.feed_source {
        let (tx, rx) = feed_channel(name, cfg.feed_capacity);
        pipeline.spawn_feed_consumer(rx);
        app = app.merge(feed_router(tx));
        info!(
            target: "pipeline",
            source = %name,
            capacity = cfg.feed_capacity,
            "push feed on POST /feed"
        );
    }

    if let Some(c) = &cfg.catalog {
        let provider = Arc::new(JsonMarketListProvider::new(
            c.exchange.clone(),
            c.url.clone(),
            call_timeout,
        )?);
        pipeline.spawn_catalog_refresh(provider, c.refresh_interval);
        info!(target: "pipeline", exchange = %c.exchange, url = %c.url, "catalog refresh started");
    }

    let retention = cfg.retention;
    let purger = {
        let p = pipeline.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RETENTION_SWEEP);
            loop {
                tick.tick().await;
                match p.purge_expired(retention) {
                    Ok(n) if n > 0 => info!(target: "dedup", removed = n, "retention purge"),
                    Ok(_) => {}
                    Err(e) => warn!(target: "dedup", error = %e, "retention purge failed"),
                }
            }
        })
    };

    let listener = tokio::net::TcpListener::bind(&cfg.metrics_addr)
        .await
        .with_context(|| format!("binding {}", cfg.metrics_addr))?;
    info!(addr = %cfg.metrics_addr, "http surface listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("http server")?;

    info!("shutting down");
    pipeline.shutdown();
    latency.stop();
    purger.abort();
    if let Some(l) = &leader {
        if let Err(e) = l.release_leadership() {
            warn!(target: "leader", error = %e, "release on shutdown failed");
        }
    }
    Ok(())
}
