//! # Leader Election
//! At most one instance acts on detections at a time.
//!
//! - **Acquire**: inside one serialized transaction, take the lock if it is
//!   free, already ours, or older than the TTL.
//! - **Heartbeat**: renew every TTL/2. A renewal that changes no row, or an
//!   error, demotes this instance immediately.
//! - **Release**: delete the row only if we hold it.

pub mod repo;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use repo::{LockRepository, LockRow, LockTx, MemoryLockRepository, SqliteLockRepository};

use crate::error::Result;

/// Anything that can say whether this instance may act right now.
pub trait LeadershipGate: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Gate for single-instance deployments.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysLeader;

impl LeadershipGate for AlwaysLeader {
    fn is_leader(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    pub lock_key: String,
    #[serde(with = "crate::config::duration_ms")]
    pub ttl: Duration,
    /// Delay between acquisition attempts while not leader.
    #[serde(with = "crate::config::duration_ms")]
    pub retry_interval: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lock_key: "listing-radar".into(),
            ttl: Duration::from_secs(30),
            retry_interval: Duration::from_secs(5),
        }
    }
}

impl LeaderConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        self.ttl / 2
    }

    fn ttl_chrono(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.ttl.as_millis() as i64)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LeadershipHealth {
    pub instance_id: String,
    pub is_leader: bool,
    pub holder: Option<String>,
    pub lock_age_ms: Option<i64>,
    pub healthy: bool,
}

pub struct LeaderElector {
    instance_id: String,
    config: LeaderConfig,
    repo: Arc<dyn LockRepository>,
    is_leader: AtomicBool,
    stop_tx: watch::Sender<bool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LeaderElector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaderElector")
            .field("instance_id", &self.instance_id)
            .field("lock_key", &self.config.lock_key)
            .field("is_leader", &self.is_leader())
            .finish()
    }
}

impl LeadershipGate for LeaderElector {
    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }
}

impl LeaderElector {
    pub fn new(
        instance_id: impl Into<String>,
        repo: Arc<dyn LockRepository>,
        config: LeaderConfig,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            instance_id: instance_id.into(),
            config,
            repo,
            is_leader: AtomicBool::new(false),
            stop_tx,
            heartbeat: Mutex::new(None),
        }
    }

    /// Fresh random instance id (`host-uuid` style is left to the caller).
    pub fn random_instance_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &LeaderConfig {
        &self.config
    }

    pub fn is_leader(&self) -> bool {
        LeadershipGate::is_leader(self)
    }

    pub fn try_acquire_leadership(&self) -> Result<bool> {
        self.try_acquire_leadership_at(Utc::now())
    }

    pub fn try_acquire_leadership_at(&self, now: DateTime<Utc>) -> Result<bool> {
        let key = self.config.lock_key.as_str();
        let mine = LockRow {
            instance_id: self.instance_id.clone(),
            acquired_at: now,
        };

        let mut tx = self.repo.begin()?;
        let acquired = match tx.read(key)? {
            None => {
                tx.insert(key, &mine)?;
                tx.commit()?;
                info!(target: "leader", instance_id = %self.instance_id, "leadership acquired");
                true
            }
            Some(row) if row.instance_id == self.instance_id => {
                // Re-stamp our own row.
                tx.delete(key)?;
                tx.insert(key, &mine)?;
                tx.commit()?;
                true
            }
            Some(row) if now.signed_duration_since(row.acquired_at) > self.config.ttl_chrono() => {
                tx.delete(key)?;
                tx.insert(key, &mine)?;
                tx.commit()?;
                counter!("leader_takeover_total").increment(1);
                info!(
                    target: "leader",
                    instance_id = %self.instance_id,
                    previous = %row.instance_id,
                    stale_ms = now.signed_duration_since(row.acquired_at).num_milliseconds(),
                    "took over stale leadership lock"
                );
                true
            }
            Some(row) => {
                drop(tx);
                debug!(target: "leader", holder = %row.instance_id, "lock held by another instance");
                false
            }
        };

        if acquired && !self.is_leader.swap(true, Ordering::AcqRel) {
            counter!("leader_acquired_total").increment(1);
            gauge!("leader_is_leader").set(1.0);
        }
        Ok(acquired)
    }

    /// One renewal. Returns whether this instance is still leader afterwards.
    pub fn heartbeat_once(&self) -> bool {
        if !self.is_leader() {
            return false;
        }
        match self
            .repo
            .renew_lock(&self.config.lock_key, &self.instance_id, Utc::now())
        {
            Ok(n) if n > 0 => true,
            Ok(_) => {
                self.demote("lock row no longer ours");
                false
            }
            Err(e) => {
                self.demote(&format!("renewal failed: {e}"));
                false
            }
        }
    }

    /// Spawn the heartbeat loop. It exits on demotion or on release.
    pub fn start_heartbeat(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let mut stop = self.stop_tx.subscribe();
        let period = self.config.heartbeat_interval();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        if !me.heartbeat_once() {
                            break;
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!(target: "leader", instance_id = %me.instance_id, "heartbeat stopped");
        });
        if let Some(old) = self.heartbeat.lock().replace(handle) {
            old.abort();
        }
    }

    /// Stop heartbeating and give the lock back if we hold it.
    pub fn release_leadership(&self) -> Result<()> {
        self.stop_tx.send_replace(true);
        if let Some(h) = self.heartbeat.lock().take() {
            h.abort();
        }
        if self.is_leader.swap(false, Ordering::AcqRel) {
            gauge!("leader_is_leader").set(0.0);
            let n = self
                .repo
                .release_lock(&self.config.lock_key, &self.instance_id)?;
            info!(target: "leader", instance_id = %self.instance_id, released = n, "leadership released");
        }
        Ok(())
    }

    pub fn check_leadership_health(&self) -> Result<LeadershipHealth> {
        let current = self.repo.current(&self.config.lock_key)?;
        let now = Utc::now();
        let is_leader = self.is_leader();
        let holder = current.as_ref().map(|r| r.instance_id.clone());
        let age = current
            .as_ref()
            .map(|r| now.signed_duration_since(r.acquired_at));
        let fresh = age.is_some_and(|a| a <= self.config.ttl_chrono());
        let holds = holder.as_deref() == Some(self.instance_id.as_str());

        let healthy = if is_leader { holds && fresh } else { !holds };
        Ok(LeadershipHealth {
            instance_id: self.instance_id.clone(),
            is_leader,
            holder,
            lock_age_ms: age.map(|a| a.num_milliseconds()),
            healthy,
        })
    }

    /// Long-running loop: campaign while follower. Each successful
    /// acquisition starts the heartbeat, which runs until demotion.
    /// Ends when `release_leadership` is called.
    pub fn spawn_campaign(self: &Arc<Self>) -> JoinHandle<()> {
        let me = Arc::clone(self);
        let mut stop = self.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let wait = if me.is_leader() {
                    me.config.heartbeat_interval()
                } else {
                    match me.try_acquire_leadership() {
                        Ok(true) => {
                            me.start_heartbeat();
                            me.config.heartbeat_interval()
                        }
                        Ok(false) => me.config.retry_interval,
                        Err(e) => {
                            warn!(target: "leader", error = %e, "leadership attempt failed");
                            me.config.retry_interval
                        }
                    }
                };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = stop.changed() => break,
                }
            }
        })
    }

    fn demote(&self, reason: &str) {
        if self.is_leader.swap(false, Ordering::AcqRel) {
            counter!("leader_demoted_total").increment(1);
            gauge!("leader_is_leader").set(0.0);
            warn!(target: "leader", instance_id = %self.instance_id, reason, "demoted");
        }
    }
}
