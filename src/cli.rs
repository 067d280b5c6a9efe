//! CLI for this application
//!
use std::path::PathBuf;
use std::time::Duration;

use crate::settings;

pub use settings::{APP_NAME, APP_VERSION};

#[derive(Clone, Debug, clap::Parser)]
#[command(name = "fleetsync", version, about = "Proxy fleet sync and usage enforcement")]
pub struct Cli {
    // Server listen address
    #[clap(
        long,
        default_value = "0.0.0.0",
        env("FLEETSYNC_LISTEN_ADDRESS"),
        help = "IP Address to listen on"
    )]
    pub listen_address: String,

    // HTTP API listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_HTTP,
        env("FLEETSYNC_HTTP_LISTEN_PORT"),
        help = "Port to bind the admin HTTP API to"
    )]
    pub listen_port: u16,

    #[clap(
        long,
        env("FLEETSYNC_STATE_FILE"),
        help = "JSON state file holding nodes, subscribers, usage and events. In-memory if unset."
    )]
    pub state_file: Option<PathBuf>,

    #[clap(long, env("FLEETSYNC_LOG_JSON"), help = "Emit logs as JSON")]
    pub log_json: bool,

    #[clap(
        long,
        default_value = "5",
        env("FLEETSYNC_RPC_TIMEOUT_SECONDS"),
        help = "Timeout for a single node control-plane call"
    )]
    pub rpc_timeout_seconds: u64,

    #[clap(
        long,
        default_value = "2",
        env("FLEETSYNC_DEGRADED_RPC_TIMEOUT_SECONDS"),
        help = "Timeout for calls against degraded nodes"
    )]
    pub degraded_rpc_timeout_seconds: u64,

    #[clap(
        long,
        default_value = "30",
        env("FLEETSYNC_SYNC_INTERVAL_SECONDS"),
        help = "Interval between reconciliations of one node"
    )]
    pub sync_interval_seconds: u64,

    #[clap(
        long,
        default_value = "2",
        env("FLEETSYNC_SYNC_BACKOFF_BASE_SECONDS"),
        help = "Base delay of the retry backoff after a failed push"
    )]
    pub sync_backoff_base_seconds: u64,

    #[clap(
        long,
        default_value = "300",
        env("FLEETSYNC_SYNC_BACKOFF_CAP_SECONDS"),
        help = "Maximum retry delay after failed pushes"
    )]
    pub sync_backoff_cap_seconds: u64,

    #[clap(
        long,
        default_value = "5",
        env("FLEETSYNC_SYNC_FAILURE_THRESHOLD"),
        help = "Consecutive failed pushes before a node is marked unreachable"
    )]
    pub sync_failure_threshold: u32,

    #[clap(
        long,
        default_value = "120",
        env("FLEETSYNC_REASSIGNMENT_GRACE_SECONDS"),
        help = "How long an unreachable old node holds a reassigned subscriber"
    )]
    pub reassignment_grace_seconds: u64,

    #[clap(
        long,
        default_value = "30",
        env("FLEETSYNC_HEALTH_INTERVAL_SECONDS"),
        help = "Node ping interval"
    )]
    pub health_interval_seconds: u64,

    #[clap(
        long,
        default_value = "3",
        env("FLEETSYNC_UNREACHABLE_AFTER"),
        help = "Consecutive failed pings before a node is unreachable"
    )]
    pub unreachable_after: u32,

    #[clap(
        long,
        default_value = "60",
        env("FLEETSYNC_COLLECT_INTERVAL_SECONDS"),
        help = "Traffic counter poll interval"
    )]
    pub collect_interval_seconds: u64,

    #[clap(
        long,
        default_value = "0",
        env("FLEETSYNC_DEFAULT_DEVICE_LIMIT"),
        help = "Device limit for subscribers without one (0 = unlimited)"
    )]
    pub default_device_limit: u32,

    #[clap(
        long,
        default_value = "50",
        env("FLEETSYNC_MAX_IN_FLIGHT"),
        help = "Maximum concurrent node operations"
    )]
    pub max_in_flight: usize,

    #[clap(
        long,
        default_value = "10",
        env("FLEETSYNC_SHUTDOWN_GRACE_SECONDS"),
        help = "Grace period for a retired node's running cycle"
    )]
    pub shutdown_grace_seconds: u64,
}

impl Cli {
    pub fn into_settings(self) -> settings::Settings {
        settings::Settings {
            listen_address: self.listen_address,
            listen_port: self.listen_port,
            state_file: self.state_file,
            log_json: self.log_json,
            engine: settings::EngineSettings {
                rpc_timeout: Duration::from_secs(self.rpc_timeout_seconds),
                degraded_rpc_timeout: Duration::from_secs(self.degraded_rpc_timeout_seconds),
                sync_interval: Duration::from_secs(self.sync_interval_seconds),
                sync_backoff_base: Duration::from_secs(self.sync_backoff_base_seconds),
                sync_backoff_cap: Duration::from_secs(self.sync_backoff_cap_seconds),
                sync_failure_threshold: self.sync_failure_threshold,
                reassignment_grace: Duration::from_secs(self.reassignment_grace_seconds),
                health_interval: Duration::from_secs(self.health_interval_seconds),
                unreachable_after: self.unreachable_after,
                collect_interval: Duration::from_secs(self.collect_interval_seconds),
                default_device_limit: self.default_device_limit,
                max_in_flight: self.max_in_flight,
                shutdown_grace: Duration::from_secs(self.shutdown_grace_seconds),
            },
        }
    }
}
