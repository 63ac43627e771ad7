//! # Latency Tracker
//! Per-flow timestamp marks feeding per-operation rolling estimators.
//!
//! A flow is one notice moving through the pipeline. Each `mark` stamps a
//! label; whenever both ends of a configured [`StagePair`] exist, the delta
//! lands in the estimator for `(operation, resource)`. Marks never fail and
//! never block the caller beyond a short mutex section.

pub mod percentile;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use percentile::{percentile, PercentileSummary, RollingEstimator};

pub const RECEIVED: &str = "received";
pub const DETECTED: &str = "detected";
pub const DEDUPED: &str = "deduped";
pub const DISPATCHED: &str = "dispatched";

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_histogram!("latency_stage_ms", "Per-operation pipeline stage latency in ms.");
        describe_counter!("latency_slow_total", "Stage deltas above their soft SLO.");
    });
}

/// An ordered pair of labels that defines one measured operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePair {
    pub operation: String,
    pub from: String,
    pub to: String,
    /// Soft SLO; deltas above it are counted as slow.
    #[serde(default)]
    pub slo_ms: Option<f64>,
}

impl StagePair {
    pub fn new(operation: &str, from: &str, to: &str, slo_ms: Option<f64>) -> Self {
        Self {
            operation: operation.into(),
            from: from.into(),
            to: to.into(),
            slo_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub buffer_capacity: usize,
    #[serde(with = "crate::config::duration_ms")]
    pub flow_ttl: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub sample_ttl: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub sweep_interval: Duration,
    pub pairs: Vec<StagePair>,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            flow_ttl: Duration::from_secs(120),
            sample_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
            pairs: vec![
                StagePair::new("detect", RECEIVED, DETECTED, Some(50.0)),
                StagePair::new("dedup", DETECTED, DEDUPED, Some(25.0)),
                StagePair::new("dispatch", DEDUPED, DISPATCHED, Some(250.0)),
                StagePair::new("end_to_end", RECEIVED, DISPATCHED, Some(500.0)),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationSnapshot {
    pub operation: String,
    pub resource: Option<String>,
    pub slow_count: u64,
    pub summary: PercentileSummary,
}

#[derive(Debug)]
struct Flow {
    opened_at: Instant,
    resource: Option<String>,
    marks: HashMap<String, Instant>,
}

impl Flow {
    fn new(now: Instant) -> Self {
        Self {
            opened_at: now,
            resource: None,
            marks: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct Series {
    estimator: RollingEstimator,
    slow: u64,
}

type SeriesKey = (String, Option<String>);

#[derive(Debug, Default)]
struct State {
    flows: HashMap<String, Flow>,
    series: HashMap<SeriesKey, Series>,
}

pub struct LatencyTracker {
    config: LatencyConfig,
    state: Mutex<State>,
    stop_tx: watch::Sender<bool>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LatencyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("LatencyTracker")
            .field("open_flows", &st.flows.len())
            .field("series", &st.series.len())
            .finish()
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(LatencyConfig::default())
    }
}

impl LatencyTracker {
    pub fn new(config: LatencyConfig) -> Self {
        ensure_metrics_described();
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            state: Mutex::new(State::default()),
            stop_tx,
            sweeper: Mutex::new(None),
        }
    }

    /// Start the retention sweeper. Calling twice restarts it.
    pub fn start(self: &Arc<Self>) {
        self.stop_tx.send_replace(false);
        let me = Arc::downgrade(self);
        let mut stop = self.stop_tx.subscribe();
        let period = self.config.sweep_interval.max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(tracker) = me.upgrade() else { break };
                        tracker.sweep(Instant::now());
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        if let Some(old) = self.sweeper.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
        if let Some(h) = self.sweeper.lock().take() {
            h.abort();
        }
    }

    /// Open a flow. A flow that is already open is left untouched.
    pub fn begin(&self, flow_id: &str) {
        let now = Instant::now();
        self.state
            .lock()
            .flows
            .entry(flow_id.to_string())
            .or_insert_with(|| Flow::new(now));
    }

    /// Attach a resource label (e.g. exchange) to a flow's future deltas.
    pub fn tag_resource(&self, flow_id: &str, resource: &str) {
        let now = Instant::now();
        let mut st = self.state.lock();
        st.flows
            .entry(flow_id.to_string())
            .or_insert_with(|| Flow::new(now))
            .resource = Some(resource.to_string());
    }

    /// Stamp `label` on the flow, opening it if needed. The first stamp of a
    /// label wins.
    pub fn mark(&self, flow_id: &str, label: &str) {
        let now = Instant::now();
        let completed: Vec<(String, Option<String>, f64)> = {
            let mut st = self.state.lock();
            let flow = st
                .flows
                .entry(flow_id.to_string())
                .or_insert_with(|| Flow::new(now));
            if flow.marks.contains_key(label) {
                return;
            }
            flow.marks.insert(label.to_string(), now);

            self.config
                .pairs
                .iter()
                .filter(|p| p.to == label)
                .filter_map(|p| {
                    let from = flow.marks.get(&p.from)?;
                    let ms = now.saturating_duration_since(*from).as_secs_f64() * 1000.0;
                    Some((p.operation.clone(), flow.resource.clone(), ms))
                })
                .collect()
        };
        for (operation, resource, ms) in completed {
            self.record(&operation, resource.as_deref(), ms);
        }
    }

    /// Feed a measured delta directly.
    pub fn record(&self, operation: &str, resource: Option<&str>, ms: f64) {
        let slo = self.slo_for(operation);
        let slow = slo.is_some_and(|limit| ms > limit);
        {
            let mut st = self.state.lock();
            let series = st
                .series
                .entry((operation.to_string(), resource.map(str::to_string)))
                .or_insert_with(|| Series {
                    estimator: RollingEstimator::new(self.config.buffer_capacity),
                    slow: 0,
                });
            series.estimator.record(ms);
            if slow {
                series.slow += 1;
            }
        }

        histogram!("latency_stage_ms", "operation" => operation.to_string()).record(ms);
        if slow {
            counter!("latency_slow_total", "operation" => operation.to_string()).increment(1);
            warn!(
                target: "latency",
                operation,
                resource = resource.unwrap_or("-"),
                ms,
                slo_ms = slo.unwrap_or_default(),
                "stage exceeded soft SLO"
            );
        }
    }

    /// Close a flow. Returns each label's offset from the flow's open, in ms.
    pub fn end(&self, flow_id: &str) -> Option<HashMap<String, f64>> {
        let flow = self.state.lock().flows.remove(flow_id)?;
        Some(
            flow.marks
                .into_iter()
                .map(|(label, at)| {
                    let ms = at.saturating_duration_since(flow.opened_at).as_secs_f64() * 1000.0;
                    (label, ms)
                })
                .collect(),
        )
    }

    pub fn open_flows(&self) -> usize {
        self.state.lock().flows.len()
    }

    pub fn summary(&self, operation: &str, resource: Option<&str>) -> Option<PercentileSummary> {
        let st = self.state.lock();
        st.series
            .get(&(operation.to_string(), resource.map(str::to_string)))
            .map(|s| s.estimator.summary())
    }

    pub fn snapshot(&self) -> Vec<OperationSnapshot> {
        let st = self.state.lock();
        let mut out: Vec<_> = st
            .series
            .iter()
            .map(|((operation, resource), s)| OperationSnapshot {
                operation: operation.clone(),
                resource: resource.clone(),
                slow_count: s.slow,
                summary: s.estimator.summary(),
            })
            .collect();
        out.sort_by(|a, b| (&a.operation, &a.resource).cmp(&(&b.operation, &b.resource)));
        out
    }

    /// Evict flows past `flow_ttl` and samples past `sample_ttl`.
    pub fn sweep(&self, now: Instant) {
        let mut st = self.state.lock();
        let flow_ttl = self.config.flow_ttl;
        let before = st.flows.len();
        st.flows
            .retain(|_, f| now.saturating_duration_since(f.opened_at) <= flow_ttl);
        let flows_evicted = before - st.flows.len();

        let mut samples_evicted = 0usize;
        if let Some(cutoff) = now.checked_sub(self.config.sample_ttl) {
            for s in st.series.values_mut() {
                samples_evicted += s.estimator.evict_before(cutoff);
            }
        }
        if flows_evicted > 0 || samples_evicted > 0 {
            debug!(target: "latency", flows_evicted, samples_evicted, "latency sweep");
        }
    }

    fn slo_for(&self, operation: &str) -> Option<f64> {
        self.config
            .pairs
            .iter()
            .find(|p| p.operation == operation)
            .and_then(|p| p.slo_ms)
    }
}

impl Drop for LatencyTracker {
    fn drop(&mut self) {
        if let Some(h) = self.sweeper.get_mut().take() {
            h.abort();
        }
    }
}
