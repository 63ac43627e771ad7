// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::latency::LatencyConfig;
use crate::leader::LeaderConfig;
use crate::pipeline::PipelineConfig;
use crate::resilience::ResilienceConfig;

pub const ENV_CONFIG_PATH: &str = "RADAR_CONFIG_PATH";
pub const ENV_DB_PATH: &str = "RADAR_DB_PATH";
pub const ENV_INSTANCE_ID: &str = "RADAR_INSTANCE_ID";
pub const DEFAULT_CONFIG_PATH: &str = "config/radar.toml";

/// Durations in config files are plain millisecond integers.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default, with = "opt_duration_ms")]
    pub poll_interval: Option<Duration>,
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Market catalog refresh against the exchange's market-list endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CatalogConfig {
    pub exchange: String,
    pub url: String,
    #[serde(with = "duration_ms")]
    pub refresh_interval: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            exchange: "upbit".into(),
            url: "https://api.upbit.com/v1/market/all".into(),
            refresh_interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadarConfig {
    pub db_path: PathBuf,
    /// Random per process when unset.
    pub instance_id: Option<String>,
    pub metrics_addr: String,
    /// Run leader election; off means this instance always acts.
    pub leader_election: bool,
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Source name for notices pushed to `POST /feed`; the route is off when unset.
    pub feed_source: Option<String>,
    pub feed_capacity: usize,
    pub catalog: Option<CatalogConfig>,
    /// Processed fingerprints older than this are purged.
    #[serde(with = "duration_ms")]
    pub retention: Duration,
    pub sources: Vec<SourceConfig>,
    pub pipeline: PipelineConfig,
    pub resilience: ResilienceConfig,
    pub leader: LeaderConfig,
    pub latency: LatencyConfig,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/radar.sqlite3"),
            instance_id: None,
            metrics_addr: "127.0.0.1:9464".into(),
            leader_election: true,
            poll_interval: Duration::from_millis(1_000),
            feed_source: None,
            feed_capacity: 256,
            catalog: None,
            retention: Duration::from_secs(30 * 24 * 3600),
            sources: Vec::new(),
            pipeline: PipelineConfig::default(),
            resilience: ResilienceConfig::default(),
            leader: LeaderConfig::default(),
            latency: LatencyConfig::default(),
        }
    }
}

impl RadarConfig {
    /// Parse TOML. Missing fields take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: RadarConfig = toml::from_str(s).context("parsing radar config toml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading radar config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Load using env var + fallbacks, then apply env overrides:
    /// 1) $RADAR_CONFIG_PATH
    /// 2) config/radar.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            Self::load_from(&pb)?
        } else {
            let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default_p.exists() {
                Self::load_from(&default_p)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(p) = std::env::var(ENV_DB_PATH) {
            if !p.trim().is_empty() {
                self.db_path = PathBuf::from(p);
            }
        }
        if let Ok(id) = std::env::var(ENV_INSTANCE_ID) {
            if !id.trim().is_empty() {
                self.instance_id = Some(id.trim().to_string());
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.leader.ttl < Duration::from_secs(2) {
            return Err(anyhow!("leader.ttl must be at least 2000 ms"));
        }
        if self.resilience.breaker.errors_before_open == 0 {
            return Err(anyhow!("resilience.breaker.errors_before_open must be > 0"));
        }
        if self.resilience.rate_limit.max_requests == 0 {
            return Err(anyhow!("resilience.rate_limit.max_requests must be > 0"));
        }
        if self.feed_capacity == 0 {
            return Err(anyhow!("feed_capacity must be > 0"));
        }
        let mut names = std::collections::BTreeSet::new();
        for name in self
            .sources
            .iter()
            .map(|s| s.name.as_str())
            .chain(self.feed_source.as_deref())
        {
            if !names.insert(name) {
                return Err(anyhow!("duplicate source name: {name}"));
            }
        }
        for (resource, o) in &self.resilience.overrides {
            if o.rate_limit.as_ref().is_some_and(|r| r.max_requests == 0) {
                return Err(anyhow!(
                    "resilience.overrides.{resource}.rate_limit.max_requests must be > 0"
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = RadarConfig::from_toml_str(
            r#"
            poll_interval = 500

            [[sources]]
            name = "upbit"
            url = "https://example.invalid/notices"

            [pipeline]
            cooldown = 3600000

            [leader]
            ttl = 10000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(500));
        assert_eq!(cfg.sources[0].poll_interval, None);
        assert_eq!(cfg.pipeline.cooldown, Duration::from_secs(3600));
        assert_eq!(cfg.leader.ttl, Duration::from_secs(10));
        assert_eq!(cfg.leader.lock_key, LeaderConfig::default().lock_key);
        assert_eq!(cfg.feed_capacity, 256);
        assert_eq!(cfg.feed_source, None);
        assert_eq!(cfg.catalog, None);
    }

    #[test]
    fn feed_catalog_and_overrides_parse() {
        let cfg = RadarConfig::from_toml_str(
            r#"
            feed_source = "upbit-ws"
            feed_capacity = 8

            [catalog]
            refresh_interval = 60000

            [resilience.overrides.bithumb.rate_limit]
            max_requests = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.feed_source.as_deref(), Some("upbit-ws"));
        assert_eq!(cfg.feed_capacity, 8);
        let catalog = cfg.catalog.unwrap();
        assert_eq!(catalog.exchange, "upbit");
        assert_eq!(catalog.refresh_interval, Duration::from_secs(60));
        let o = &cfg.resilience.overrides["bithumb"];
        assert_eq!(o.rate_limit.as_ref().map(|r| r.max_requests), Some(3));
        assert!(o.breaker.is_none());

        let clash = "feed_source = \"a\"\n[[sources]]\nname = \"a\"\nurl = \"u\"";
        assert!(RadarConfig::from_toml_str(clash).is_err());
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(RadarConfig::from_toml_str("[leader]\nttl = 10").is_err());
        let dup = r#"
            [[sources]]
            name = "a"
            url = "u"
            [[sources]]
            name = "a"
            url = "v"
        "#;
        assert!(RadarConfig::from_toml_str(dup).is_err());
    }

    #[test]
    #[serial]
    fn env_overrides_apply() {
        std::env::set_var(ENV_DB_PATH, "/tmp/other.sqlite3");
        std::env::set_var(ENV_INSTANCE_ID, "  node-b ");
        let mut cfg = RadarConfig::default();
        cfg.apply_env_overrides();
        std::env::remove_var(ENV_DB_PATH);
        std::env::remove_var(ENV_INSTANCE_ID);

        assert_eq!(cfg.db_path, PathBuf::from("/tmp/other.sqlite3"));
        assert_eq!(cfg.instance_id.as_deref(), Some("node-b"));
    }

    #[test]
    #[serial]
    fn missing_explicit_path_is_an_error() {
        std::env::set_var(ENV_CONFIG_PATH, "/definitely/not/here.toml");
        let res = RadarConfig::load_default();
        std::env::remove_var(ENV_CONFIG_PATH);
        assert!(res.is_err());
    }
}
