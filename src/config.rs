//! Configuration management for the gateway
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::model::{Consumer, Deployment, PricingPlan, ANONYMOUS_CONSUMER_ID};

/// Main configuration structure for the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Lookup cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Plan-based rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    /// Upstream dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,
    /// Origin connection pool configuration
    #[serde(default)]
    pub pool: PoolConfig,
    /// Metrics and monitoring configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Records served by the in-memory store
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listening address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
    /// Overall deadline for one request, body streaming included
    #[serde(with = "humantime_serde", default = "default_request_deadline")]
    pub request_deadline: Duration,
    /// Largest accepted request body in bytes
    #[serde(default = "default_max_request_body")]
    pub max_request_body: usize,
    /// Worker threads for the proxy service
    pub threads: Option<usize>,
}

/// Lookup cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of settled entries per cache
    #[serde(default = "default_max_cache_entries")]
    pub max_entries: usize,
    /// Lifetime of cached deployments
    #[serde(with = "humantime_serde", default = "default_deployment_ttl")]
    pub deployment_ttl: Duration,
    /// Lifetime of cached consumers
    #[serde(with = "humantime_serde", default = "default_consumer_ttl")]
    pub consumer_ttl: Duration,
    /// Lifetime of cached pricing plans
    #[serde(with = "humantime_serde", default = "default_plan_ttl")]
    pub plan_ttl: Duration,
    /// Lifetime of compiled tool schemas
    #[serde(with = "humantime_serde", default = "default_schema_ttl")]
    pub schema_ttl: Duration,
    /// Lifetime of "does not exist" answers
    #[serde(with = "humantime_serde", default = "default_negative_ttl")]
    pub negative_ttl: Duration,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Limits used when neither the consumer's plan nor "free" is in the store
    #[serde(default)]
    pub free_plan: PricingPlan,
    /// Consumers tracked before idle windows are evicted
    #[serde(default = "default_max_tracked_consumers")]
    pub max_tracked_consumers: usize,
}

/// Upstream dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Total attempts per tool call, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles after every failure
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    pub base_delay: Duration,
    /// Share of the remaining budget granted to a non-final attempt
    #[serde(default = "default_attempt_timeout_ratio")]
    pub attempt_timeout_ratio: f64,
    /// Largest chunk written to the client at once
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

/// Origin connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum open connections per origin host
    #[serde(default = "default_max_connections_per_host")]
    pub max_connections_per_host: usize,
    /// How long a request waits for a connection before giving up
    #[serde(with = "humantime_serde", default = "default_acquire_timeout")]
    pub acquire_timeout: Duration,
    /// TCP connect and handshake timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
}

/// Metrics and monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics
    #[serde(default)]
    pub prometheus: bool,
    /// Metrics server address
    pub metrics_addr: Option<SocketAddr>,
    /// Request records buffered before new ones are dropped
    #[serde(default = "default_record_buffer")]
    pub record_buffer: usize,
}

/// Records loaded into the in-memory store at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub deployments: Vec<Deployment>,
    #[serde(default)]
    pub consumers: Vec<Consumer>,
    #[serde(default)]
    pub plans: Vec<PricingPlan>,
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config file: {}", path))?
        } else if path.ends_with(".toml") {
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config file: {}", path))?
        } else if path.ends_with(".json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config file: {}", path))?
        } else {
            return Err(anyhow!(
                "Unsupported config file format. Supported formats: .yaml, .yml, .toml, .json"
            ));
        };

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.max_attempts == 0 {
            return Err(anyhow!("dispatch.max_attempts must be at least 1"));
        }
        if !(self.dispatch.attempt_timeout_ratio > 0.0
            && self.dispatch.attempt_timeout_ratio <= 1.0)
        {
            return Err(anyhow!(
                "dispatch.attempt_timeout_ratio must be in (0, 1], got {}",
                self.dispatch.attempt_timeout_ratio
            ));
        }
        if self.dispatch.chunk_size == 0 {
            return Err(anyhow!("dispatch.chunk_size must be positive"));
        }
        if self.pool.max_connections_per_host == 0 {
            return Err(anyhow!("pool.max_connections_per_host must be positive"));
        }
        if self.cache.max_entries == 0 {
            return Err(anyhow!("cache.max_entries must be positive"));
        }

        let mut seen = HashSet::new();
        for deployment in &self.store.deployments {
            if !seen.insert(deployment.id.as_str()) {
                return Err(anyhow!("Deployment '{}' is defined twice", deployment.id));
            }
            let url = url::Url::parse(&deployment.origin_base_url).with_context(|| {
                format!(
                    "Deployment '{}' has an invalid origin_base_url",
                    deployment.id
                )
            })?;
            if url.scheme() != "http" || url.host_str().is_none() {
                return Err(anyhow!(
                    "Deployment '{}' origin must be an http:// URL with a host",
                    deployment.id
                ));
            }
            if deployment.default_timeout_ms == 0 {
                return Err(anyhow!(
                    "Deployment '{}' must have a positive default_timeout_ms",
                    deployment.id
                ));
            }
            for (name, tool) in &deployment.tools {
                if name != &tool.name {
                    return Err(anyhow!(
                        "Deployment '{}' lists tool '{}' under key '{}'",
                        deployment.id,
                        tool.name,
                        name
                    ));
                }
            }
        }

        let known_plans: HashSet<&str> =
            self.store.plans.iter().map(|p| p.slug.as_str()).collect();
        for consumer in &self.store.consumers {
            if consumer.id == ANONYMOUS_CONSUMER_ID {
                return Err(anyhow!(
                    "Consumer id '{}' is reserved for anonymous requests",
                    ANONYMOUS_CONSUMER_ID
                ));
            }
            if !known_plans.contains(consumer.plan_slug.as_str()) {
                log::warn!(
                    "Consumer '{}' references unknown plan '{}'; free limits will apply",
                    consumer.id,
                    consumer.plan_slug
                );
            }
        }

        Ok(())
    }
}

// Default value functions
fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_request_deadline() -> Duration {
    Duration::from_secs(60)
}

fn default_max_request_body() -> usize {
    1024 * 1024 // 1MB
}

fn default_max_cache_entries() -> usize {
    10000
}

fn default_deployment_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_consumer_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_plan_ttl() -> Duration {
    Duration::from_secs(300) // 5 minutes
}

fn default_schema_ttl() -> Duration {
    Duration::from_secs(600)
}

fn default_negative_ttl() -> Duration {
    Duration::from_secs(5)
}

fn default_max_tracked_consumers() -> usize {
    100_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_attempt_timeout_ratio() -> f64 {
    0.5
}

fn default_chunk_size() -> usize {
    16 * 1024
}

fn default_max_connections_per_host() -> usize {
    64
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_record_buffer() -> usize {
    4096
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            request_deadline: default_request_deadline(),
            max_request_body: default_max_request_body(),
            threads: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_cache_entries(),
            deployment_ttl: default_deployment_ttl(),
            consumer_ttl: default_consumer_ttl(),
            plan_ttl: default_plan_ttl(),
            schema_ttl: default_schema_ttl(),
            negative_ttl: default_negative_ttl(),
        }
    }
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            free_plan: PricingPlan::free(),
            max_tracked_consumers: default_max_tracked_consumers(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            attempt_timeout_ratio: default_attempt_timeout_ratio(),
            chunk_size: default_chunk_size(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_host: default_max_connections_per_host(),
            acquire_timeout: default_acquire_timeout(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            prometheus: false,
            metrics_addr: None,
            record_buffer: default_record_buffer(),
        }
    }
}
