//! Collector configuration: YAML model, embedded defaults, legacy
//! conversion, and startup validation.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::tags::{Tags, TagSet};

/// Fallback configuration: one local reflector target probed from four
/// wildcard-bound ports.
pub const DEFAULT_CONFIG_YAML: &str = "\
summarization:
    interval:   30
    handlers:   2

api:
    bind:   0.0.0.0:5000

ports:
    default:
        ip:         0.0.0.0
        port:       0
        tos:        0
        timeout_ms: 1000
port_groups:
    default:
        - port:     default
          count:    4
rate_limits:
    default:
        cps:    4.0
tests:
    - targets:      default
      port_group:   default
      rate_limit:   default
targets:
    default:
        - ip:       127.0.0.1
          port:     8100
          tags:     {}
";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizationConfig {
    /// Window length in seconds.
    pub interval: u64,
    /// Number of result handler workers.
    pub handlers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// "host:port" the HTTP surface binds to.
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub ip: String,
    pub port: u16,
    pub tos: u8,
    /// Shared timeout in milliseconds: cache TTL, sweep cadence, and the
    /// socket read deadline all derive from it.
    pub timeout_ms: u64,
}

impl PortConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let ip = self
            .ip
            .parse()
            .with_context(|| format!("invalid port bind IP {:?}", self.ip))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortGroupConfig {
    /// Name of a `ports` entry.
    pub port: String,
    /// How many identical Ports to create from it.
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Cycles per second through the target list.
    pub cps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    /// Name of a `targets` entry.
    pub targets: String,
    /// Name of a `port_groups` entry.
    pub port_group: String,
    /// Name of a `rate_limits` entry.
    pub rate_limit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub tags: Tags,
}

impl TargetConfig {
    /// Resolve to a socket address; hostnames go through the resolver.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        if let Ok(ip) = self.ip.parse() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        format!("{}:{}", self.ip, self.port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve target {:?}", self.ip))?
            .next()
            .with_context(|| format!("no addresses for target {:?}", self.ip))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub summarization: SummarizationConfig,
    pub api: ApiConfig,
    pub ports: HashMap<String, PortConfig>,
    pub port_groups: HashMap<String, Vec<PortGroupConfig>>,
    pub rate_limits: HashMap<String, RateLimitConfig>,
    pub tests: Vec<TestConfig>,
    pub targets: HashMap<String, Vec<TargetConfig>>,
}

impl CollectorConfig {
    /// The embedded default configuration.
    pub fn default_config() -> Result<Self> {
        Self::from_yaml(DEFAULT_CONFIG_YAML)
    }

    /// Parse and validate a standard YAML config.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: CollectorConfig =
            serde_yaml::from_str(data).context("failed to parse collector config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a file, accepting either the standard form or the legacy
    /// flat target map (converted with `legacy_dst_port`).
    pub fn load(path: &Path, legacy_dst_port: u16) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        if let Ok(legacy) = serde_yaml::from_str::<LegacyConfig>(&data) {
            return legacy.into_config(legacy_dst_port);
        }
        Self::from_yaml(&data)
    }

    /// Cross-check every name reference; config errors are fatal at
    /// startup rather than surprises mid-run.
    pub fn validate(&self) -> Result<()> {
        self.api
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid api bind address {:?}", self.api.bind))?;
        if self.summarization.interval == 0 {
            bail!("summarization interval must be positive");
        }
        if self.summarization.handlers == 0 {
            bail!("at least one result handler is required");
        }
        for (name, rl) in &self.rate_limits {
            if rl.cps <= 0.0 {
                bail!("rate limit {name:?} must have positive cps");
            }
        }
        for (name, group) in &self.port_groups {
            for member in group {
                if !self.ports.contains_key(&member.port) {
                    bail!("port group {name:?} references unknown port {:?}", member.port);
                }
            }
        }
        for (i, test) in self.tests.iter().enumerate() {
            if !self.targets.contains_key(&test.targets) {
                bail!("test #{i} references unknown targets {:?}", test.targets);
            }
            if !self.port_groups.contains_key(&test.port_group) {
                bail!("test #{i} references unknown port group {:?}", test.port_group);
            }
            if !self.rate_limits.contains_key(&test.rate_limit) {
                bail!("test #{i} references unknown rate limit {:?}", test.rate_limit);
            }
        }
        Ok(())
    }

    pub fn api_bind(&self) -> SocketAddr {
        // Checked by validate().
        self.api.bind.parse().expect("validated bind address")
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.summarization.interval)
    }

    /// Resolved socket addresses for one named target set.
    pub fn resolved_targets(&self, name: &str) -> Result<Vec<SocketAddr>> {
        let set = self
            .targets
            .get(name)
            .with_context(|| format!("unknown target set {name:?}"))?;
        set.iter().map(TargetConfig::socket_addr).collect()
    }

    /// Build the TagSet for all configured targets. A target appearing in
    /// several sets keeps the last entry seen.
    pub fn tag_set(&self) -> TagSet {
        let mut ts = TagSet::new();
        for set in self.targets.values() {
            for target in set {
                ts.insert(target.ip.clone(), target.tags.clone());
            }
        }
        ts
    }
}

/// Older deployments shipped a bare `{address → tags}` map. Converted by
/// overlaying those targets onto the default config.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyConfig(HashMap<String, Tags>);

impl LegacyConfig {
    pub fn into_config(self, dst_port: u16) -> Result<CollectorConfig> {
        let mut cfg = CollectorConfig::default_config()?;
        let targets = self
            .0
            .into_iter()
            .map(|(ip, tags)| TargetConfig {
                ip,
                port: dst_port,
                tags,
            })
            .collect();
        cfg.targets = HashMap::from([("default".to_string(), targets)]);
        Ok(cfg)
    }
}
