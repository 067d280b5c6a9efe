//! fleetsync application settings
use std::path::PathBuf;
use std::time::Duration;

use crate::config_error;
use crate::error::Result;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_PORT_HTTP: u16 = 8420;
pub const DEFAULT_PORT_HTTP: &str = "8420";

/// Timing and sizing knobs of the sync/collect/enforce engine
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Per-call timeout for node control-plane RPCs
    pub rpc_timeout: Duration,
    /// Shorter per-call timeout used against degraded nodes
    pub degraded_rpc_timeout: Duration,

    /// Regular reconciliation interval per node
    pub sync_interval: Duration,
    /// Retry backoff after an unreachable push: base * 2^(n-1), capped
    pub sync_backoff_base: Duration,
    pub sync_backoff_cap: Duration,
    /// Consecutive push failures before a node is marked unreachable
    pub sync_failure_threshold: u32,
    /// How long an unreachable node keeps a reassigned subscriber before
    /// the new node is allowed to add it anyway
    pub reassignment_grace: Duration,

    /// Health poll interval
    pub health_interval: Duration,
    /// Consecutive failed pings before a node is unreachable
    pub unreachable_after: u32,

    /// Traffic counter poll interval
    pub collect_interval: Duration,

    /// Device limit for subscribers that have none; zero means unlimited
    pub default_device_limit: u32,

    /// Cap on concurrently running node operations
    pub max_in_flight: usize,
    /// How long `retire` waits for a node's running cycle before aborting it
    pub shutdown_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(5),
            degraded_rpc_timeout: Duration::from_secs(2),
            sync_interval: Duration::from_secs(30),
            sync_backoff_base: Duration::from_secs(2),
            sync_backoff_cap: Duration::from_secs(300),
            sync_failure_threshold: 5,
            reassignment_grace: Duration::from_secs(120),
            health_interval: Duration::from_secs(30),
            unreachable_after: 3,
            collect_interval: Duration::from_secs(60),
            default_device_limit: 0,
            max_in_flight: 50,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl EngineSettings {
    pub fn validate(&self) -> Result<()> {
        let intervals = [
            ("rpc-timeout", self.rpc_timeout),
            ("degraded-rpc-timeout", self.degraded_rpc_timeout),
            ("sync-interval", self.sync_interval),
            ("sync-backoff-base", self.sync_backoff_base),
            ("health-interval", self.health_interval),
            ("collect-interval", self.collect_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(config_error!("{} must be greater than zero", name));
            }
        }
        if self.sync_backoff_cap < self.sync_backoff_base {
            return Err(config_error!(
                "sync-backoff-cap ({}s) is below sync-backoff-base ({}s)",
                self.sync_backoff_cap.as_secs(),
                self.sync_backoff_base.as_secs()
            ));
        }
        if self.sync_failure_threshold == 0 {
            return Err(config_error!("sync-failure-threshold must be at least 1"));
        }
        if self.unreachable_after == 0 {
            return Err(config_error!("unreachable-after must be at least 1"));
        }
        if self.max_in_flight == 0 {
            return Err(config_error!("max-in-flight must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    // Server listen address
    pub listen_address: String,

    // HTTP API listen port
    pub listen_port: u16,

    // JSON snapshot of the store; in-memory only when absent
    pub state_file: Option<PathBuf>,

    // Emit logs as JSON lines
    pub log_json: bool,

    pub engine: EngineSettings,
}
