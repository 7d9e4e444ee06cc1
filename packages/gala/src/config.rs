use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::error::GalaError;
use crate::job::DEFAULT_QUEUE_NAME;
use crate::worker::JobWorkerConfig;

/// Worker concurrency for the default queue when none is configured.
pub const DEFAULT_WORKER_COUNT: usize = 10;

/// Whether emitted envelopes go through the job queue or run in-process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    #[default]
    Durable,
    InMemory,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Durable => "durable",
            DispatchMode::InMemory => "in_memory",
        }
    }
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMode {
    type Err = GalaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "durable" => Ok(DispatchMode::Durable),
            "in_memory" => Ok(DispatchMode::InMemory),
            other => Err(GalaError::DispatchModeInvalid {
                mode: other.to_string(),
            }),
        }
    }
}

/// Gala configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct GalaConfig {
    pub enabled: bool,
    pub dispatch_mode: DispatchMode,
    /// Default queue for durable dispatch jobs
    pub queue_name: String,
    /// Concurrency for the default queue
    pub worker_count: usize,
    /// Additional queues and their concurrency
    pub queue_workers: BTreeMap<String, usize>,
    /// Max attempts for dispatch jobs when greater than zero
    pub max_retries: u32,
    pub poll_interval: Duration,
    pub fetch_cooldown: Duration,
}

impl Default for GalaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dispatch_mode: DispatchMode::Durable,
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            worker_count: DEFAULT_WORKER_COUNT,
            queue_workers: BTreeMap::new(),
            max_retries: 0,
            poll_interval: Duration::from_secs(1),
            fetch_cooldown: Duration::from_millis(100),
        }
    }
}

impl GalaConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let mut config = Self {
            enabled: match lookup("GALA_ENABLED") {
                Some(raw) => parse_bool(&raw).context("GALA_ENABLED must be true or false")?,
                None => defaults.enabled,
            },
            dispatch_mode: lookup("GALA_DISPATCH_MODE")
                .unwrap_or_default()
                .parse()
                .context("GALA_DISPATCH_MODE must be durable or in_memory")?,
            queue_name: lookup("GALA_QUEUE_NAME").unwrap_or(defaults.queue_name),
            worker_count: lookup("GALA_WORKER_COUNT")
                .map(|raw| raw.trim().parse())
                .transpose()
                .context("GALA_WORKER_COUNT must be a valid number")?
                .unwrap_or(defaults.worker_count),
            queue_workers: lookup("GALA_QUEUE_WORKERS")
                .map(|raw| parse_queue_workers(&raw))
                .transpose()
                .context("GALA_QUEUE_WORKERS must look like name=4,other=2")?
                .unwrap_or_default(),
            max_retries: lookup("GALA_MAX_RETRIES")
                .map(|raw| raw.trim().parse())
                .transpose()
                .context("GALA_MAX_RETRIES must be a valid number")?
                .unwrap_or(defaults.max_retries),
            poll_interval: lookup("GALA_POLL_INTERVAL_MS")
                .map(|raw| raw.trim().parse().map(Duration::from_millis))
                .transpose()
                .context("GALA_POLL_INTERVAL_MS must be a valid number")?
                .unwrap_or(defaults.poll_interval),
            fetch_cooldown: lookup("GALA_FETCH_COOLDOWN_MS")
                .map(|raw| raw.trim().parse().map(Duration::from_millis))
                .transpose()
                .context("GALA_FETCH_COOLDOWN_MS must be a valid number")?
                .unwrap_or(defaults.fetch_cooldown),
        };

        config.normalize();
        Ok(config)
    }

    /// Fill blank or out-of-range values with defaults.
    pub fn normalize(&mut self) {
        let queue_name = self.queue_name.trim();
        self.queue_name = if queue_name.is_empty() {
            DEFAULT_QUEUE_NAME.to_string()
        } else {
            queue_name.to_string()
        };
        self.worker_count = self.worker_count.max(1);
        self.fetch_cooldown = self.fetch_cooldown.max(Duration::from_millis(1));
        if self.poll_interval.is_zero() {
            self.poll_interval = Duration::from_secs(1);
        }
    }

    /// Queue name to worker count for every queue a worker should poll.
    pub fn build_queue_config(&self) -> BTreeMap<String, usize> {
        let mut queues = BTreeMap::new();
        queues.insert(self.queue_name.clone(), self.worker_count.max(1));

        for (name, workers) in &self.queue_workers {
            let name = name.trim();
            if name.is_empty() || *workers < 1 {
                continue;
            }
            queues.insert(name.to_string(), *workers);
        }

        queues
    }

    pub fn worker_config(&self) -> JobWorkerConfig {
        JobWorkerConfig {
            queues: self.build_queue_config(),
            poll_interval: self.poll_interval,
            fetch_cooldown: self.fetch_cooldown,
            ..Default::default()
        }
    }

    /// Max attempts for dispatch jobs, if configured.
    pub fn max_attempts(&self) -> Option<u32> {
        (self.max_retries > 0).then_some(self.max_retries)
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("invalid boolean: {other}"),
    }
}

fn parse_queue_workers(raw: &str) -> Result<BTreeMap<String, usize>> {
    let mut queues = BTreeMap::new();

    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, count) = pair
            .split_once('=')
            .with_context(|| format!("missing '=' in {pair:?}"))?;
        let count: usize = count
            .trim()
            .parse()
            .with_context(|| format!("invalid worker count in {pair:?}"))?;
        queues.insert(name.trim().to_string(), count);
    }

    Ok(queues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = GalaConfig::from_lookup(lookup(&[])).unwrap();

        assert!(config.enabled);
        assert_eq!(config.dispatch_mode, DispatchMode::Durable);
        assert_eq!(config.queue_name, "gala");
        assert_eq!(config.worker_count, DEFAULT_WORKER_COUNT);
        assert_eq!(config.max_attempts(), None);
    }

    #[test]
    fn test_parses_every_variable() {
        let config = GalaConfig::from_lookup(lookup(&[
            ("GALA_ENABLED", "false"),
            ("GALA_DISPATCH_MODE", "in_memory"),
            ("GALA_QUEUE_NAME", " events "),
            ("GALA_WORKER_COUNT", "0"),
            ("GALA_QUEUE_WORKERS", "integrations=4, workflow=2"),
            ("GALA_MAX_RETRIES", "5"),
            ("GALA_POLL_INTERVAL_MS", "250"),
            ("GALA_FETCH_COOLDOWN_MS", "0"),
        ]))
        .unwrap();

        assert!(!config.enabled);
        assert_eq!(config.dispatch_mode, DispatchMode::InMemory);
        assert_eq!(config.queue_name, "events");
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.queue_workers["integrations"], 4);
        assert_eq!(config.max_attempts(), Some(5));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.fetch_cooldown, Duration::from_millis(1));
    }

    #[test]
    fn test_invalid_dispatch_mode_is_rejected() {
        let err = GalaConfig::from_lookup(lookup(&[("GALA_DISPATCH_MODE", "carrier_pigeon")])).unwrap_err();
        let root = err.root_cause().downcast_ref::<GalaError>();
        assert!(matches!(root, Some(GalaError::DispatchModeInvalid { .. })));
    }

    #[test]
    fn test_malformed_queue_workers_is_rejected() {
        assert!(GalaConfig::from_lookup(lookup(&[("GALA_QUEUE_WORKERS", "integrations")])).is_err());
        assert!(GalaConfig::from_lookup(lookup(&[("GALA_QUEUE_WORKERS", "integrations=many")])).is_err());
    }

    #[test]
    fn test_build_queue_config_skips_blank_and_idle_queues() {
        let config = GalaConfig {
            queue_name: "gala".into(),
            worker_count: 3,
            queue_workers: BTreeMap::from([
                ("integrations".to_string(), 4),
                (" ".to_string(), 2),
                ("paused".to_string(), 0),
            ]),
            ..Default::default()
        };

        let queues = config.build_queue_config();
        assert_eq!(queues.len(), 2);
        assert_eq!(queues["gala"], 3);
        assert_eq!(queues["integrations"], 4);
        assert_eq!(config.worker_config().queues, queues);
    }
}
