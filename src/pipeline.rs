//! # Pipeline
//! Notice → watermark gate → detector → fingerprint → leader gate → dedup
//! claim → timing → cooldown → dispatch.
//!
//! Ordering guarantees:
//! - Followers never claim fingerprints, so a failover leader can still act
//!   on an event that only observers have seen.
//! - The fingerprint claim comes before the cooldown check, and the cooldown
//!   is stamped only after the dispatcher reports success.
//! - A claimed event is dispatched at most once. A failed dispatch is not
//!   retried; the claim stays consumed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::detector::{DetectorMode, NoticeDetector};
use crate::error::{CoreError, Result};
use crate::identity::{build_event_id, EventFingerprint, ListingEvent};
use crate::ingest::{prepare_batch, FeedReceiver, Notice, NoticeSource};
use crate::latency::{LatencyTracker, DEDUPED, DETECTED, DISPATCHED, RECEIVED};
use crate::leader::{AlwaysLeader, LeaderElector, LeadershipGate};
use crate::metrics::StatusSnapshot;
use crate::resilience::Guard;
use crate::store::catalog::{refresh_catalog, MarketListProvider};
use crate::store::{EventStore, InsertOutcome, SqliteStore};
use crate::timing::{MissingTradeTime, Timing, TimingClassifier};
use crate::watermark::{Watermark, WatermarkStore};

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_outcome_total", "Notices processed, by outcome.");
        describe_counter!("dispatch_failed_total", "Dispatcher calls that returned an error.");
        describe_counter!("pipeline_errors_total", "Notices whose processing hit a store error.");
    });
}

/// Downstream collaborator that places the order.
#[async_trait]
pub trait TradeDispatcher: Send + Sync {
    async fn dispatch(
        &self,
        base: &str,
        trade_time_utc: Option<DateTime<Utc>>,
        fingerprint: &EventFingerprint,
    ) -> Result<()>;
}

/// Dispatcher that only logs. Used when no order adapter is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDispatcher;

#[async_trait]
impl TradeDispatcher for LogDispatcher {
    async fn dispatch(
        &self,
        base: &str,
        trade_time_utc: Option<DateTime<Utc>>,
        fingerprint: &EventFingerprint,
    ) -> Result<()> {
        info!(
            target: "pipeline",
            base,
            trade_time = ?trade_time_utc,
            fingerprint = %fingerprint,
            "dispatch (log only)"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How long after trade open a listing still counts as live.
    #[serde(with = "crate::config::duration_ms")]
    pub live_window: Duration,
    /// At most one dispatch per base inside this rolling window.
    #[serde(with = "crate::config::duration_ms")]
    pub cooldown: Duration,
    pub missing_trade_time: MissingTradeTime,
    pub detector_mode: DetectorMode,
    /// Quote currency used to build the market symbol, e.g. `KRW-BIO`.
    pub quote: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            live_window: Duration::from_secs(300),
            cooldown: Duration::from_secs(24 * 3600),
            missing_trade_time: MissingTradeTime::AssumeLive,
            detector_mode: DetectorMode::Standard,
            quote: "KRW".into(),
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessOutcome {
    BehindWatermark,
    NotListing { score: u32 },
    NoBase { alias: Option<String> },
    /// Listing seen while not leader; nothing claimed.
    Observed { base: String },
    Duplicate { base: String },
    Stale { base: String },
    CooledDown { base: String },
    Scheduled { base: String, trade_time: DateTime<Utc> },
    Dispatched { base: String, fingerprint: EventFingerprint },
    DispatchFailed { base: String, error: String },
}

impl ProcessOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ProcessOutcome::BehindWatermark => "behind_watermark",
            ProcessOutcome::NotListing { .. } => "not_listing",
            ProcessOutcome::NoBase { .. } => "no_base",
            ProcessOutcome::Observed { .. } => "observed",
            ProcessOutcome::Duplicate { .. } => "duplicate",
            ProcessOutcome::Stale { .. } => "stale",
            ProcessOutcome::CooledDown { .. } => "cooled_down",
            ProcessOutcome::Scheduled { .. } => "scheduled",
            ProcessOutcome::Dispatched { .. } => "dispatched",
            ProcessOutcome::DispatchFailed { .. } => "dispatch_failed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<ProcessOutcome>,
    pub errors: usize,
    /// Watermark after the batch; unchanged when any notice errored or the
    /// instance is following.
    pub watermark: Option<Watermark>,
}

/// Collaborators the pipeline is assembled from.
pub struct PipelineParts {
    pub store: SqliteStore,
    pub dispatcher: Arc<dyn TradeDispatcher>,
    pub guard: Arc<Guard>,
    pub latency: Arc<LatencyTracker>,
    /// `None` runs as a single always-leader instance.
    pub leader: Option<Arc<LeaderElector>>,
    pub config: PipelineConfig,
}

pub struct Pipeline {
    store: SqliteStore,
    watermarks: WatermarkStore,
    detector: NoticeDetector,
    timing: TimingClassifier,
    gate: Arc<dyn LeadershipGate>,
    leader: Option<Arc<LeaderElector>>,
    dispatcher: Arc<dyn TradeDispatcher>,
    guard: Arc<Guard>,
    latency: Arc<LatencyTracker>,
    config: PipelineConfig,
    scheduled: Arc<AtomicUsize>,
    stop_tx: watch::Sender<bool>,
}

impl Pipeline {
    pub fn new(parts: PipelineParts) -> Self {
        ensure_metrics_described();
        let gate: Arc<dyn LeadershipGate> = match &parts.leader {
            Some(l) => l.clone() as Arc<dyn LeadershipGate>,
            None => Arc::new(AlwaysLeader) as Arc<dyn LeadershipGate>,
        };
        let (stop_tx, _) = watch::channel(false);
        Self {
            watermarks: WatermarkStore::new(parts.store.clone()),
            store: parts.store,
            detector: NoticeDetector::new(parts.config.detector_mode),
            timing: TimingClassifier::new(
                to_chrono(parts.config.live_window),
                parts.config.missing_trade_time,
            ),
            gate,
            leader: parts.leader,
            dispatcher: parts.dispatcher,
            guard: parts.guard,
            latency: parts.latency,
            config: parts.config,
            scheduled: Arc::new(AtomicUsize::new(0)),
            stop_tx,
        }
    }

    /// Replace the leadership gate, e.g. with a test double.
    pub fn with_gate(mut self, gate: Arc<dyn LeadershipGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    pub fn scheduled_pending(&self) -> usize {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Run one notice through the full flow.
    pub async fn process_notice(
        self: &Arc<Self>,
        source: &str,
        notice: &Notice,
    ) -> Result<ProcessOutcome> {
        let flow = format!("{source}:{}", notice.uid);
        self.latency.tag_resource(&flow, source);
        self.latency.mark(&flow, RECEIVED);

        let outcome = self.evaluate(source, notice, &flow).await;
        if !matches!(outcome, Ok(ProcessOutcome::Scheduled { .. })) {
            self.latency.end(&flow);
        }
        if let Ok(o) = &outcome {
            counter!("pipeline_outcome_total", "outcome" => o.label()).increment(1);
            debug!(target: "pipeline", source, uid = %notice.uid, outcome = o.label(), "notice processed");
        }
        outcome
    }

    async fn evaluate(
        self: &Arc<Self>,
        source: &str,
        notice: &Notice,
        flow: &str,
    ) -> Result<ProcessOutcome> {
        if !self.watermarks.should_consider(source, notice)? {
            return Ok(ProcessOutcome::BehindWatermark);
        }

        let analysis = self.detector.analyze(notice);
        self.latency.mark(flow, DETECTED);
        if !analysis.detection.is_listing {
            return Ok(ProcessOutcome::NotListing {
                score: analysis.detection.score,
            });
        }
        let Some(base) = analysis.extraction.base().map(str::to_string) else {
            let alias = analysis.extraction.alias().map(str::to_string);
            warn!(
                target: "pipeline",
                source,
                uid = %notice.uid,
                alias = alias.as_deref().unwrap_or("-"),
                "listing without an extractable ticker"
            );
            return Ok(ProcessOutcome::NoBase { alias });
        };

        let event = ListingEvent {
            source: source.to_string(),
            base: base.clone(),
            url: notice.url.clone(),
            markets: vec![format!("{}-{}", self.config.quote, base)],
            trade_time_utc: notice.effective_trade_time(),
            raw_title: notice.title.clone(),
        };

        if !self.gate.is_leader() {
            info!(target: "pipeline", base = %base, source, "listing observed (not leader)");
            return Ok(ProcessOutcome::Observed { base });
        }

        let fingerprint = build_event_id(&event);
        let claim = self.store.try_mark_processed(&event)?;
        self.latency.mark(flow, DEDUPED);
        if claim == InsertOutcome::Duplicate {
            return Ok(ProcessOutcome::Duplicate { base });
        }

        match self.timing.classify(event.trade_time_utc, Utc::now()) {
            Timing::Stale => {
                info!(target: "pipeline", base = %base, trade_time = ?event.trade_time_utc, "stale listing");
                Ok(ProcessOutcome::Stale { base })
            }
            Timing::Live => self.fire(&event, &fingerprint, flow).await,
            Timing::Future => {
                let trade_time = event.trade_time_utc.unwrap_or_else(Utc::now);
                self.schedule(event, fingerprint, flow.to_string(), trade_time);
                Ok(ProcessOutcome::Scheduled { base, trade_time })
            }
        }
    }

    fn schedule(
        self: &Arc<Self>,
        event: ListingEvent,
        fingerprint: EventFingerprint,
        flow: String,
        at: DateTime<Utc>,
    ) {
        let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let me = Arc::clone(self);
        let mut stop = self.stop_tx.subscribe();
        self.scheduled.fetch_add(1, Ordering::AcqRel);
        info!(
            target: "pipeline",
            base = %event.base,
            trade_time = %at,
            wait_ms = wait.as_millis() as u64,
            "listing scheduled"
        );

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    // Woken at trade time; only a missed live window cancels now.
                    let outcome = match me.timing.classify(event.trade_time_utc, Utc::now()) {
                        Timing::Stale => Ok(ProcessOutcome::Stale { base: event.base.clone() }),
                        Timing::Live | Timing::Future => me.fire(&event, &fingerprint, &flow).await,
                    };
                    match outcome {
                        Ok(o) => {
                            counter!("pipeline_outcome_total", "outcome" => o.label()).increment(1);
                            info!(
                                target: "pipeline",
                                base = %event.base,
                                outcome = o.label(),
                                "scheduled listing fired"
                            );
                        }
                        Err(e) => {
                            counter!("pipeline_errors_total").increment(1);
                            warn!(target: "pipeline", base = %event.base, error = %e, "scheduled listing failed");
                        }
                    }
                }
                _ = stop.changed() => {
                    debug!(target: "pipeline", base = %event.base, "scheduled listing cancelled");
                }
            }
            me.latency.end(&flow);
            me.scheduled.fetch_sub(1, Ordering::AcqRel);
        });
    }

    async fn fire(
        &self,
        event: &ListingEvent,
        fingerprint: &EventFingerprint,
        flow: &str,
    ) -> Result<ProcessOutcome> {
        let base = event.base.clone();
        if !self.gate.is_leader() {
            return Ok(ProcessOutcome::Observed { base });
        }
        let cooldown = to_chrono(self.config.cooldown);
        let Some(claim) = self
            .store
            .claim_base_at(&base, fingerprint, cooldown, Utc::now())?
        else {
            info!(target: "pipeline", base = %base, "base in cooldown, not dispatching");
            return Ok(ProcessOutcome::CooledDown { base });
        };

        match self
            .dispatcher
            .dispatch(&base, event.trade_time_utc, fingerprint)
            .await
        {
            Ok(()) => {
                self.latency.mark(flow, DISPATCHED);
                info!(target: "pipeline", base = %base, fingerprint = %fingerprint, "dispatched");
                Ok(ProcessOutcome::Dispatched {
                    base,
                    fingerprint: fingerprint.clone(),
                })
            }
            Err(e) => {
                counter!("dispatch_failed_total").increment(1);
                warn!(target: "pipeline", base = %base, error = %e, "dispatch failed");
                self.store.release_base_claim(&claim)?;
                Ok(ProcessOutcome::DispatchFailed {
                    base,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Process each notice, then advance the source watermark over the whole
    /// batch. A store error on any notice leaves the watermark where it was so
    /// the next poll replays the batch; dedup absorbs the repeats. Followers
    /// never advance it: the rows are shared with the leader.
    pub async fn process_batch(
        self: &Arc<Self>,
        source: &str,
        notices: &[Notice],
    ) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for n in notices {
            match self.process_notice(source, n).await {
                Ok(o) => report.outcomes.push(o),
                Err(e) => {
                    report.errors += 1;
                    counter!("pipeline_errors_total").increment(1);
                    warn!(target: "pipeline", source, uid = %n.uid, error = %e, "notice processing failed");
                }
            }
        }
        report.watermark = if report.errors == 0 && self.gate.is_leader() {
            self.watermarks.update_from_batch(source, notices)?
        } else {
            self.watermarks.get(source)?
        };
        Ok(report)
    }

    /// Fetch through the guard, normalize, and process one batch.
    pub async fn poll_once(self: &Arc<Self>, source: &dyn NoticeSource) -> Result<BatchReport> {
        let name = source.name().to_string();
        let raw = self
            .guard
            .run(&name, move || async move { source.fetch_latest().await })
            .await?;
        let (kept, _, _) = prepare_batch(raw);
        self.process_batch(&name, &kept).await
    }

    /// Timer-driven poller. Seeds the boot watermark first.
    pub fn spawn_poller(
        self: &Arc<Self>,
        source: Arc<dyn NoticeSource>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let me = Arc::clone(self);
        let mut stop = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let name = source.name().to_string();
            if let Err(e) = me.watermarks.initialize_at_boot(&name, Utc::now()) {
                warn!(target: "pipeline", source = %name, error = %e, "boot watermark failed");
            }
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(50)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match me.poll_once(source.as_ref()).await {
                            Ok(report) => debug!(
                                target: "pipeline",
                                source = %name,
                                notices = report.outcomes.len(),
                                errors = report.errors,
                                "poll complete"
                            ),
                            Err(CoreError::BreakerOpen { .. }) => {
                                debug!(target: "pipeline", source = %name, "poll skipped, circuit open");
                            }
                            Err(e) => warn!(target: "pipeline", source = %name, error = %e, "poll failed"),
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            info!(target: "pipeline", source = %name, "poller stopped");
        })
    }

    /// Drain a push feed into the pipeline, one notice at a time.
    pub fn spawn_feed_consumer(self: &Arc<Self>, mut rx: FeedReceiver) -> JoinHandle<()> {
        let me = Arc::clone(self);
        let mut stop = self.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = rx.recv() => {
                        let Some(item) = item else { break };
                        let (kept, _, _) = prepare_batch(vec![item.notice]);
                        if let Err(e) = me.process_batch(&item.source, &kept).await {
                            warn!(target: "pipeline", source = %item.source, error = %e, "feed notice failed");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!(target: "pipeline", "feed consumer stopped");
        })
    }

    /// Fetch the exchange's market list through the guard and replace the
    /// stored catalog.
    pub async fn refresh_catalog(&self, provider: &dyn MarketListProvider) -> Result<usize> {
        refresh_catalog(&self.guard, &self.store, provider).await
    }

    /// Periodically replace the exchange's market catalog.
    pub fn spawn_catalog_refresh(
        self: &Arc<Self>,
        provider: Arc<dyn MarketListProvider>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let me = Arc::clone(self);
        let mut stop = self.stop_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = me.refresh_catalog(provider.as_ref()).await {
                            warn!(
                                target: "pipeline",
                                exchange = provider.exchange(),
                                error = %e,
                                "catalog refresh failed"
                            );
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        })
    }

    /// Purge fingerprints older than `retention`.
    pub fn purge_expired(&self, retention: Duration) -> Result<usize> {
        let cutoff = Utc::now() - to_chrono(retention);
        self.store.purge_processed_before(cutoff)
    }

    /// Stop every spawned task and cancel pending scheduled dispatches.
    pub fn shutdown(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let leader = self
            .leader
            .as_ref()
            .and_then(|l| match l.check_leadership_health() {
                Ok(h) => Some(h),
                Err(e) => {
                    warn!(target: "leader", error = %e, "leadership health check failed");
                    None
                }
            });
        let instance_id = self
            .leader
            .as_ref()
            .map(|l| l.instance_id().to_string())
            .unwrap_or_else(|| "standalone".into());

        StatusSnapshot {
            generated_at: Utc::now(),
            instance_id,
            leader,
            dedup: self.store.dedup_totals(),
            processed_rows: self.store.processed_count().unwrap_or_default(),
            scheduled_pending: self.scheduled_pending(),
            breakers: self.guard.breakers().snapshot(),
            rate_limits: self.guard.limiter().snapshot(),
            latency: self.latency.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::ResilienceConfig;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl TradeDispatcher for Recorder {
        async fn dispatch(
            &self,
            base: &str,
            _: Option<DateTime<Utc>>,
            _: &EventFingerprint,
        ) -> Result<()> {
            self.calls.lock().push(base.to_string());
            if self.fail.load(Ordering::SeqCst) {
                Err(CoreError::Dispatch("exchange rejected".into()))
            } else {
                Ok(())
            }
        }
    }

    struct Toggle(AtomicBool);

    impl LeadershipGate for Toggle {
        fn is_leader(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn pipeline(dispatcher: Arc<Recorder>) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(PipelineParts {
            store: SqliteStore::open_in_memory().unwrap(),
            dispatcher,
            guard: Arc::new(Guard::new(&ResilienceConfig::default())),
            latency: Arc::new(LatencyTracker::default()),
            leader: None,
            config: PipelineConfig::default(),
        }))
    }

    fn bio(uid: &str) -> Notice {
        Notice {
            uid: uid.into(),
            title: "바이오 프로토콜(BIO) 원화 마켓 신규 추가".into(),
            url: format!("https://upbit.com/service_center/notice/{uid}"),
            published_at: Utc::now(),
            tickers: vec!["BIO".into()],
            ..Notice::default()
        }
    }

    #[tokio::test]
    async fn live_listing_dispatches_once() {
        let rec = Arc::new(Recorder::default());
        let p = pipeline(rec.clone());

        let first = p.process_notice("upbit", &bio("1")).await.unwrap();
        assert!(matches!(first, ProcessOutcome::Dispatched { ref base, .. } if base == "BIO"));
        // Same notice re-delivered with different tracking params.
        let mut again = bio("1");
        again.url.push_str("&utm_source=tg");
        let second = p.process_notice("upbit", &again).await.unwrap();
        assert_eq!(second, ProcessOutcome::Duplicate { base: "BIO".into() });
        assert_eq!(rec.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn second_announcement_hits_cooldown() {
        let rec = Arc::new(Recorder::default());
        let p = pipeline(rec.clone());
        p.process_notice("upbit", &bio("1")).await.unwrap();
        let other = p.process_notice("upbit", &bio("2")).await.unwrap();
        assert_eq!(other, ProcessOutcome::CooledDown { base: "BIO".into() });
        assert_eq!(rec.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_dispatch_does_not_stamp_cooldown() {
        let rec = Arc::new(Recorder::default());
        rec.fail.store(true, Ordering::SeqCst);
        let p = pipeline(rec.clone());
        let out = p.process_notice("upbit", &bio("1")).await.unwrap();
        assert!(matches!(out, ProcessOutcome::DispatchFailed { .. }));

        rec.fail.store(false, Ordering::SeqCst);
        let retry = p.process_notice("upbit", &bio("2")).await.unwrap();
        assert!(matches!(retry, ProcessOutcome::Dispatched { .. }));
    }

    #[tokio::test]
    async fn followers_observe_without_claiming() {
        let rec = Arc::new(Recorder::default());
        let gate = Arc::new(Toggle(AtomicBool::new(false)));
        let p = Arc::new(
            Pipeline::new(PipelineParts {
                store: SqliteStore::open_in_memory().unwrap(),
                dispatcher: rec.clone(),
                guard: Arc::new(Guard::new(&ResilienceConfig::default())),
                latency: Arc::new(LatencyTracker::default()),
                leader: None,
                config: PipelineConfig::default(),
            })
            .with_gate(gate.clone()),
        );

        let report = p.process_batch("upbit", &[bio("1")]).await.unwrap();
        assert_eq!(report.outcomes, vec![ProcessOutcome::Observed { base: "BIO".into() }]);
        assert_eq!(report.watermark, None);
        assert_eq!(p.store().processed_count().unwrap(), 0);

        gate.0.store(true, Ordering::SeqCst);
        let report = p.process_batch("upbit", &[bio("1")]).await.unwrap();
        assert!(matches!(report.outcomes[0], ProcessOutcome::Dispatched { .. }));
        assert_eq!(report.watermark.unwrap().last_notice_uid, "1");
    }

    #[tokio::test]
    async fn non_listing_and_batch_watermark() {
        let rec = Arc::new(Recorder::default());
        let p = pipeline(rec.clone());
        let chatter = Notice {
            uid: "9".into(),
            title: "BIO 프로젝트 메인넷 업그레이드 일정 안내".into(),
            published_at: Utc::now(),
            tickers: vec!["BIO".into()],
            ..Notice::default()
        };
        let report = p.process_batch("upbit", &[chatter.clone()]).await.unwrap();
        assert!(matches!(report.outcomes[0], ProcessOutcome::NotListing { .. }));
        assert_eq!(report.watermark.unwrap().last_notice_uid, "9");

        let replay = p.process_notice("upbit", &chatter).await.unwrap();
        assert_eq!(replay, ProcessOutcome::BehindWatermark);
    }
}
