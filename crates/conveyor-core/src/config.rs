use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::assignment::Strategy;

/// Main configuration structure for the scheduling engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub registration: RegistrationConfig,

    #[serde(default)]
    pub queues: QueueConfig,

    #[serde(default)]
    pub assignment: AssignmentConfig,

    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub dependencies: DependencyConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            registration: RegistrationConfig::default(),
            queues: QueueConfig::default(),
            assignment: AssignmentConfig::default(),
            load_balancing: LoadBalancingConfig::default(),
            limits: LimitsConfig::default(),
            dependencies: DependencyConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self, crate::Error> {
        use crate::Error;

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: SchedulerConfig = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, crate::Error> {
        // Try to load from CONVEYOR_CONFIG env var first
        if let Ok(config_path) = std::env::var("CONVEYOR_CONFIG") {
            return Self::load(&config_path);
        }

        // Try default locations
        let default_paths = [
            "./config/default.toml",
            "./config/production.toml",
            "/etc/conveyor/config.toml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::load(path);
            }
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        use crate::Error;

        if self.health.heartbeat_timeout_secs == 0 {
            return Err(Error::Config("heartbeat timeout must be > 0".to_string()));
        }

        if self.health.max_consecutive_failures == 0 {
            return Err(Error::Config(
                "max consecutive failures must be > 0".to_string(),
            ));
        }

        if self.registration.max_attempts == 0 {
            return Err(Error::Config(
                "max registration attempts must be > 0".to_string(),
            ));
        }

        if self.queues.high_capacity == 0
            || self.queues.normal_capacity == 0
            || self.queues.low_capacity == 0
        {
            return Err(Error::Config("queue capacities must be > 0".to_string()));
        }

        if !(0.0..=1.0).contains(&self.load_balancing.imbalance_threshold) {
            return Err(Error::Config(
                "imbalance threshold must be within [0.0, 1.0]".to_string(),
            ));
        }

        if self.limits.max_concurrent_jobs == 0 {
            return Err(Error::Config(
                "max concurrent jobs limit must be > 0".to_string(),
            ));
        }

        if self.limits.load_factor_min >= self.limits.load_factor_max {
            return Err(Error::Config(
                "load factor bounds must satisfy min < max".to_string(),
            ));
        }

        if self.dependencies.max_cycle_probe_depth == 0 {
            return Err(Error::Config(
                "cycle probe depth must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Health monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Liveness boundary: a worker is stale when its last heartbeat is
    /// older than this
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Period of the health check task
    #[serde(default = "default_health_check_interval")]
    pub check_interval_secs: u64,

    /// Age of an ERROR worker before the cleanup task retires it
    #[serde(default = "default_cleanup_threshold")]
    pub cleanup_threshold_secs: u64,

    /// Period of the cleanup task
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Consecutive unhealthy checks before a worker is flagged FAILED
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            check_interval_secs: default_health_check_interval(),
            cleanup_threshold_secs: default_cleanup_threshold(),
            cleanup_interval_secs: default_cleanup_interval(),
            max_consecutive_failures: default_max_consecutive_failures(),
        }
    }
}

impl HealthConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn cleanup_threshold(&self) -> Duration {
        Duration::from_secs(self.cleanup_threshold_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn default_heartbeat_timeout() -> u64 {
    300 // 5 minutes
}

fn default_health_check_interval() -> u64 {
    120 // 2 minutes
}

fn default_cleanup_threshold() -> u64 {
    900 // 15 minutes
}

fn default_cleanup_interval() -> u64 {
    900 // 15 minutes
}

fn default_max_consecutive_failures() -> u32 {
    3
}

/// Worker registration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Failed attempts allowed per worker id before rate limiting kicks in
    #[serde(default = "default_max_registration_attempts")]
    pub max_attempts: u32,

    /// Cooldown measured from the last failed attempt
    #[serde(default = "default_registration_cooldown")]
    pub cooldown_secs: u64,

    /// TTL for cached worker records
    #[serde(default = "default_worker_cache_ttl")]
    pub worker_cache_ttl_secs: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_registration_attempts(),
            cooldown_secs: default_registration_cooldown(),
            worker_cache_ttl_secs: default_worker_cache_ttl(),
        }
    }
}

impl RegistrationConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

fn default_max_registration_attempts() -> u32 {
    3
}

fn default_registration_cooldown() -> u64 {
    3600 // 60 minutes
}

fn default_worker_cache_ttl() -> u64 {
    600
}

/// Ready-queue capacity bounds, per band
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_high_capacity")]
    pub high_capacity: usize,

    #[serde(default = "default_normal_capacity")]
    pub normal_capacity: usize,

    #[serde(default = "default_low_capacity")]
    pub low_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high_capacity: default_high_capacity(),
            normal_capacity: default_normal_capacity(),
            low_capacity: default_low_capacity(),
        }
    }
}

fn default_high_capacity() -> usize {
    1000
}

fn default_normal_capacity() -> usize {
    5000
}

fn default_low_capacity() -> usize {
    10000
}

/// Assignment policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignmentConfig {
    /// Strategy used to pick a worker for a ready job
    #[serde(default)]
    pub strategy: Strategy,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
        }
    }
}

/// Load balancer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingConfig {
    /// Period of the queue drain task
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,

    /// Period of the rebalance task
    #[serde(default = "default_rebalance_interval")]
    pub rebalance_interval_secs: u64,

    /// Load spread (max − min) that triggers a rebalance
    #[serde(default = "default_imbalance_threshold")]
    pub imbalance_threshold: f64,
}

impl Default for LoadBalancingConfig {
    fn default() -> Self {
        Self {
            drain_interval_secs: default_drain_interval(),
            rebalance_interval_secs: default_rebalance_interval(),
            imbalance_threshold: default_imbalance_threshold(),
        }
    }
}

impl LoadBalancingConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs)
    }
}

fn default_drain_interval() -> u64 {
    5
}

fn default_rebalance_interval() -> u64 {
    60
}

fn default_imbalance_threshold() -> f64 {
    0.4
}

/// Hard bounds on worker attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Upper bound for a worker's maxConcurrentJobs
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: u32,

    /// Lower bound for a worker's load factor
    #[serde(default = "default_load_factor_min")]
    pub load_factor_min: f64,

    /// Upper bound for a worker's load factor
    #[serde(default = "default_load_factor_max")]
    pub load_factor_max: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            load_factor_min: default_load_factor_min(),
            load_factor_max: default_load_factor_max(),
        }
    }
}

fn default_max_concurrent_jobs() -> u32 {
    100
}

fn default_load_factor_min() -> f64 {
    0.1
}

fn default_load_factor_max() -> f64 {
    2.0
}

/// Dependency graph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Cap on the probe path recorded in cycle-rejection diagnostics.
    /// The insertion-time reachability search itself is exhaustive.
    #[serde(default = "default_max_cycle_probe_depth")]
    pub max_cycle_probe_depth: usize,

    /// Chain depth past which validate() emits a warning
    #[serde(default = "default_deep_chain_threshold")]
    pub deep_chain_threshold: usize,

    /// Whether a terminal parent satisfies CONDITIONAL edges regardless
    /// of outcome. When false, CONDITIONAL behaves like MUST_SUCCEED.
    #[serde(default = "default_conditional_propagation")]
    pub conditional_propagation: bool,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            max_cycle_probe_depth: default_max_cycle_probe_depth(),
            deep_chain_threshold: default_deep_chain_threshold(),
            conditional_propagation: default_conditional_propagation(),
        }
    }
}

fn default_max_cycle_probe_depth() -> usize {
    20
}

fn default_deep_chain_threshold() -> usize {
    10
}

fn default_conditional_propagation() -> bool {
    true
}

/// Backing store retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Internal retries for transient store failures before surfacing
    #[serde(default = "default_store_retries")]
    pub max_retries: u32,

    /// Initial backoff delay between store retries, in milliseconds
    #[serde(default = "default_store_backoff_ms")]
    pub initial_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_retries: default_store_retries(),
            initial_backoff_ms: default_store_backoff_ms(),
        }
    }
}

fn default_store_retries() -> u32 {
    3
}

fn default_store_backoff_ms() -> u64 {
    100
}
