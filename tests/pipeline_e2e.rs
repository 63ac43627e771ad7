// tests/pipeline_e2e.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listing_radar::error::{CoreError, Result};
use listing_radar::identity::EventFingerprint;
use listing_radar::ingest::{feed_channel, Notice, NoticeSource};
use listing_radar::latency::LatencyTracker;
use listing_radar::leader::{LeaderConfig, LeaderElector, MemoryLockRepository};
use listing_radar::pipeline::{
    Pipeline, PipelineConfig, PipelineParts, ProcessOutcome, TradeDispatcher,
};
use listing_radar::resilience::{Guard, ResilienceConfig};
use listing_radar::store::catalog::MarketListProvider;
use listing_radar::store::SqliteStore;
use listing_radar::timing::MissingTradeTime;
use parking_lot::Mutex;

#[derive(Default)]
struct FakeDispatcher {
    calls: Mutex<Vec<(String, Option<DateTime<Utc>>)>>,
    latency: Option<Duration>,
    fail_next: AtomicBool,
}

impl FakeDispatcher {
    fn slow(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    fn bases(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(b, _)| b.clone()).collect()
    }
}

#[async_trait]
impl TradeDispatcher for FakeDispatcher {
    async fn dispatch(
        &self,
        base: &str,
        t: Option<DateTime<Utc>>,
        _: &EventFingerprint,
    ) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CoreError::Dispatch("order rejected".into()));
        }
        self.calls.lock().push((base.to_string(), t));
        Ok(())
    }
}

fn build(
    store: SqliteStore,
    dispatcher: Arc<FakeDispatcher>,
    leader: Option<Arc<LeaderElector>>,
) -> Arc<Pipeline> {
    build_with(store, dispatcher, leader, PipelineConfig::default())
}

fn build_with(
    store: SqliteStore,
    dispatcher: Arc<FakeDispatcher>,
    leader: Option<Arc<LeaderElector>>,
    config: PipelineConfig,
) -> Arc<Pipeline> {
    Arc::new(Pipeline::new(PipelineParts {
        store,
        dispatcher,
        guard: Arc::new(Guard::new(&ResilienceConfig::default())),
        latency: Arc::new(LatencyTracker::default()),
        leader,
        config,
    }))
}

fn listing(uid: &str, title: &str, ticker: &str) -> Notice {
    Notice {
        uid: uid.into(),
        title: title.into(),
        url: format!("https://upbit.com/service_center/notice/{uid}"),
        published_at: Utc::now(),
        tickers: vec![ticker.into()],
        ..Notice::default()
    }
}

async fn settle(mut done: impl FnMut() -> bool) {
    for _ in 0..50 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn two_transports_one_dispatch() {
    let rec = Arc::new(FakeDispatcher::default());
    let p = build(SqliteStore::open_in_memory().unwrap(), rec.clone(), None);

    let poll_copy = listing("5100", "바이오 프로토콜(BIO) 원화 마켓 신규 추가", "BIO");
    let mut push_copy = poll_copy.clone();
    push_copy.url.push_str("?utm_source=telegram");
    push_copy.tickers.clear();

    let a = p.process_batch("upbit", &[poll_copy]).await.unwrap();
    let b = p.process_notice("upbit", &push_copy).await.unwrap();

    assert!(matches!(a.outcomes[0], ProcessOutcome::Dispatched { .. }));
    assert!(matches!(b, ProcessOutcome::BehindWatermark | ProcessOutcome::Duplicate { .. }));
    assert_eq!(rec.bases(), vec!["BIO".to_string()]);
}

#[tokio::test]
async fn same_listing_from_two_sources_dispatches_once() {
    let rec = Arc::new(FakeDispatcher::slow(Duration::from_millis(20)));
    let p = build(SqliteStore::open_in_memory().unwrap(), rec.clone(), None);
    let n = listing("5100", "바이오 프로토콜(BIO) 원화 마켓 신규 추가", "BIO");

    // Different sources give different fingerprints; the base claim still holds.
    let (a, b) = tokio::join!(
        p.process_notice("upbit-poll", &n),
        p.process_notice("upbit-ws", &n)
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    let dispatched = outcomes
        .iter()
        .filter(|o| matches!(o, ProcessOutcome::Dispatched { .. }))
        .count();
    assert_eq!(dispatched, 1, "{outcomes:?}");
    assert!(outcomes.contains(&ProcessOutcome::CooledDown { base: "BIO".into() }));
    assert_eq!(rec.bases(), vec!["BIO".to_string()]);
}

#[tokio::test]
async fn failed_dispatch_frees_the_base_for_the_other_source() {
    let rec = Arc::new(FakeDispatcher::default());
    rec.fail_next.store(true, Ordering::SeqCst);
    let p = build(SqliteStore::open_in_memory().unwrap(), rec.clone(), None);
    let n = listing("5100", "바이오 프로토콜(BIO) 원화 마켓 신규 추가", "BIO");

    let first = p.process_notice("upbit-poll", &n).await.unwrap();
    assert!(matches!(first, ProcessOutcome::DispatchFailed { .. }));
    let second = p.process_notice("upbit-ws", &n).await.unwrap();
    assert!(matches!(second, ProcessOutcome::Dispatched { .. }));
    assert_eq!(rec.bases(), vec!["BIO".to_string()]);
}

#[tokio::test]
async fn store_shared_by_two_pipelines_dedups_across_them() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("radar.sqlite3");
    let rec = Arc::new(FakeDispatcher::default());
    let p1 = build(SqliteStore::open(&path).unwrap(), rec.clone(), None);
    let p2 = build(SqliteStore::open(&path).unwrap(), rec.clone(), None);

    let n = listing("1", "앱토스(APT) 원화 마켓 디지털 자산 추가", "APT");
    let (r1, r2) = tokio::join!(p1.process_notice("upbit", &n), p2.process_notice("upbit", &n));
    let outcomes = [r1.unwrap(), r2.unwrap()];
    let dispatched = outcomes
        .iter()
        .filter(|o| matches!(o, ProcessOutcome::Dispatched { .. }))
        .count();
    assert_eq!(dispatched, 1, "{outcomes:?}");
    assert_eq!(rec.bases().len(), 1);
}

#[tokio::test]
async fn follower_does_not_dispatch_and_leader_can_still_claim() {
    let repo = Arc::new(MemoryLockRepository::new());
    let leader = Arc::new(LeaderElector::new("a", repo.clone(), LeaderConfig::default()));
    let follower = Arc::new(LeaderElector::new("b", repo, LeaderConfig::default()));
    assert!(leader.try_acquire_leadership().unwrap());
    assert!(!follower.try_acquire_leadership().unwrap());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("radar.sqlite3");
    let rec = Arc::new(FakeDispatcher::default());
    let pa = build(SqliteStore::open(&path).unwrap(), rec.clone(), Some(leader));
    let pb = build(SqliteStore::open(&path).unwrap(), rec.clone(), Some(follower));

    let n = listing("1", "SAHARA 원화 마켓 신규 추가 안내", "SAHARA");
    let observed = pb.process_notice("upbit", &n).await.unwrap();
    assert_eq!(observed, ProcessOutcome::Observed { base: "SAHARA".into() });
    let acted = pa.process_notice("upbit", &n).await.unwrap();
    assert!(matches!(acted, ProcessOutcome::Dispatched { .. }));
    assert_eq!(rec.bases(), vec!["SAHARA".to_string()]);

    let status = pb.snapshot();
    assert_eq!(status.instance_id, "b");
    assert!(status.leader.is_some_and(|h| !h.is_leader && h.holder.as_deref() == Some("a")));
}

#[tokio::test]
async fn follower_batch_first_leaves_the_watermark_for_the_leader() {
    let repo = Arc::new(MemoryLockRepository::new());
    let leader = Arc::new(LeaderElector::new("a", repo.clone(), LeaderConfig::default()));
    let follower = Arc::new(LeaderElector::new("b", repo, LeaderConfig::default()));
    assert!(leader.try_acquire_leadership().unwrap());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("radar.sqlite3");
    let rec = Arc::new(FakeDispatcher::default());
    let pa = build(SqliteStore::open(&path).unwrap(), rec.clone(), Some(leader));
    let pb = build(SqliteStore::open(&path).unwrap(), rec.clone(), Some(follower));

    let n = listing("1", "바이오 프로토콜(BIO) 원화 마켓 신규 추가", "BIO");
    let seen = pb.process_batch("upbit", &[n.clone()]).await.unwrap();
    assert_eq!(seen.outcomes, vec![ProcessOutcome::Observed { base: "BIO".into() }]);
    assert_eq!(pb.watermarks().get("upbit").unwrap(), None);

    let acted = pa.process_batch("upbit", &[n]).await.unwrap();
    assert!(matches!(acted.outcomes[0], ProcessOutcome::Dispatched { .. }));
    assert_eq!(acted.watermark.unwrap().last_notice_uid, "1");
    assert_eq!(rec.bases(), vec!["BIO".to_string()]);
}

#[tokio::test]
async fn stale_listing_is_claimed_but_not_dispatched() {
    let rec = Arc::new(FakeDispatcher::default());
    let p = build(SqliteStore::open_in_memory().unwrap(), rec.clone(), None);
    let mut n = listing("1", "바이오 프로토콜(BIO) 원화 마켓 신규 추가", "BIO");
    n.trade_time = Some(Utc::now() - chrono::Duration::hours(2));

    assert_eq!(
        p.process_notice("upbit", &n).await.unwrap(),
        ProcessOutcome::Stale { base: "BIO".into() }
    );
    assert!(rec.bases().is_empty());
    assert_eq!(p.store().processed_count().unwrap(), 1);
}

#[tokio::test]
async fn missing_trade_time_policy_is_honoured() {
    let rec = Arc::new(FakeDispatcher::default());
    let cfg = PipelineConfig {
        missing_trade_time: MissingTradeTime::AssumeStale,
        ..PipelineConfig::default()
    };
    let p = build_with(SqliteStore::open_in_memory().unwrap(), rec.clone(), None, cfg);
    let n = listing("1", "바이오 프로토콜(BIO) 원화 마켓 신규 추가", "BIO");
    assert!(matches!(
        p.process_notice("upbit", &n).await.unwrap(),
        ProcessOutcome::Stale { .. }
    ));
    assert!(rec.bases().is_empty());
}

#[tokio::test(start_paused = true)]
async fn future_listing_fires_at_trade_time() {
    let rec = Arc::new(FakeDispatcher::default());
    let p = build(SqliteStore::open_in_memory().unwrap(), rec.clone(), None);
    let mut n = listing("1", "바이오 프로토콜(BIO) 원화 마켓 신규 추가", "BIO");
    let open_at = Utc::now() + chrono::Duration::minutes(30);
    n.trade_time = Some(open_at);

    let out = p.process_notice("upbit", &n).await.unwrap();
    assert!(matches!(out, ProcessOutcome::Scheduled { ref base, .. } if base == "BIO"));
    assert_eq!(p.scheduled_pending(), 1);
    assert!(rec.bases().is_empty());

    tokio::time::sleep(Duration::from_secs(31 * 60)).await;
    settle(|| p.scheduled_pending() == 0).await;

    let calls = rec.calls.lock().clone();
    assert_eq!(calls, vec![("BIO".to_string(), Some(open_at))]);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_scheduled_dispatch() {
    let rec = Arc::new(FakeDispatcher::default());
    let p = build(SqliteStore::open_in_memory().unwrap(), rec.clone(), None);
    let mut n = listing("1", "바이오 프로토콜(BIO) 원화 마켓 신규 추가", "BIO");
    n.trade_time = Some(Utc::now() + chrono::Duration::minutes(30));
    p.process_notice("upbit", &n).await.unwrap();

    p.shutdown();
    settle(|| p.scheduled_pending() == 0).await;
    assert_eq!(p.scheduled_pending(), 0);
    tokio::time::sleep(Duration::from_secs(31 * 60)).await;
    assert!(rec.bases().is_empty());
}

struct FlakySource {
    failures_left: Mutex<u32>,
    batch: Vec<Notice>,
}

#[async_trait]
impl NoticeSource for FlakySource {
    async fn fetch_latest(&self) -> Result<Vec<Notice>> {
        let mut left = self.failures_left.lock();
        if *left > 0 {
            *left -= 1;
            return Err(CoreError::TransientNetwork("connection reset".into()));
        }
        Ok(self.batch.clone())
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

#[tokio::test(start_paused = true)]
async fn poll_retries_transient_errors_then_processes() {
    let rec = Arc::new(FakeDispatcher::default());
    let p = build(SqliteStore::open_in_memory().unwrap(), rec.clone(), None);
    let mut batch = vec![
        listing("2", "앱토스(APT) 원화 마켓 디지털 자산 추가", "APT"),
        listing("1", "USDT 프로젝트 업데이트 일정 안내", "USDT"),
    ];
    // Same timestamp, so the uid breaks the tie.
    let at = Utc::now();
    batch.iter_mut().for_each(|n| n.published_at = at);
    let src = FlakySource {
        failures_left: Mutex::new(1),
        batch,
    };

    let report = p.poll_once(&src).await.unwrap();
    assert_eq!(report.errors, 0);
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(rec.bases(), vec!["APT".to_string()]);
    assert_eq!(report.watermark.unwrap().last_notice_uid, "2");

    let stats = p.guard().breakers().snapshot();
    assert!(stats.iter().any(|s| s.resource == "flaky"));
}

#[tokio::test]
async fn push_feed_reaches_the_dispatcher() {
    let rec = Arc::new(FakeDispatcher::default());
    let p = build(SqliteStore::open_in_memory().unwrap(), rec.clone(), None);
    let (tx, rx) = feed_channel("upbit-ws", 8);
    let consumer = p.spawn_feed_consumer(rx);

    tx.push(listing("1", "바이오 프로토콜(BIO) 원화 마켓 신규 추가", "BIO"))
        .await
        .unwrap();
    drop(tx);
    consumer.await.unwrap();

    assert_eq!(rec.bases(), vec!["BIO".to_string()]);
}

struct FlakyMarkets {
    failures_left: Mutex<u32>,
}

#[async_trait]
impl MarketListProvider for FlakyMarkets {
    async fn fetch_markets(&self) -> Result<Vec<String>> {
        let mut left = self.failures_left.lock();
        if *left > 0 {
            *left -= 1;
            return Err(CoreError::TransientNetwork("503".into()));
        }
        Ok(vec!["krw-btc".into(), "KRW-BIO".into()])
    }

    fn exchange(&self) -> &str {
        "upbit"
    }
}

#[tokio::test(start_paused = true)]
async fn catalog_refresh_retries_through_the_guard() {
    let p = build(SqliteStore::open_in_memory().unwrap(), Arc::default(), None);
    let provider = FlakyMarkets {
        failures_left: Mutex::new(1),
    };

    assert_eq!(p.refresh_catalog(&provider).await.unwrap(), 2);
    assert_eq!(p.store().listed_markets("upbit").unwrap(), vec!["KRW-BIO", "KRW-BTC"]);
    let stats = p.guard().breakers().get("upbit").stats();
    assert_eq!(stats.consecutive_errors, 0);
}

#[tokio::test(start_paused = true)]
async fn catalog_refresh_task_fills_the_catalog() {
    let p = build(SqliteStore::open_in_memory().unwrap(), Arc::default(), None);
    let provider = Arc::new(FlakyMarkets {
        failures_left: Mutex::new(0),
    });
    let task = p.spawn_catalog_refresh(provider, Duration::from_secs(600));

    let store = p.store().clone();
    settle(|| !store.listed_markets("upbit").unwrap().is_empty()).await;
    assert_eq!(store.listed_markets("upbit").unwrap().len(), 2);

    p.shutdown();
    task.await.unwrap();
}
