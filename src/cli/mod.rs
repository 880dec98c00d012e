//! CLI argument surface for the wazgate server

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::substrate::PortWaitOptions;
use crate::unit::ControllerSettings;

#[derive(Parser, Debug)]
#[command(name = "wazgate")]
#[command(about = "Front Wazuh clusters with on-demand sandboxed unit orchestration")]
#[command(version)]
pub struct Args {
    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub bind_addr: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Directory holding persisted cluster documents
    #[arg(long, env = "WAZGATE_CONFIG_DIR", default_value = "clusters")]
    pub config_dir: PathBuf,

    /// Directory for lifecycle events; omit to disable telemetry
    #[arg(long, env = "WAZGATE_EVENTS_DIR")]
    pub events_dir: Option<PathBuf>,

    /// SQLite URL for enrollment bookkeeping; omit to disable
    #[arg(long, env = "WAZGATE_META_DB")]
    pub meta_db: Option<String>,

    /// Cluster used when a request names none
    #[arg(long, env = "DEFAULT_CLUSTER", default_value = "primary")]
    pub default_cluster: String,

    /// Readiness timeout in milliseconds; 0 falls back to the default
    #[arg(long, env = "CONTAINER_PORT_READY_TIMEOUT_MS", default_value_t = 0)]
    pub ready_timeout_ms: u64,

    /// Poll interval for port waits and health probes, in milliseconds
    #[arg(long, default_value_t = 1_000)]
    pub poll_interval_ms: u64,

    /// Stop an idle unit after this many seconds; omit to keep units running
    #[arg(long, env = "CONTAINER_SLEEP_AFTER_SECS")]
    pub sleep_after_secs: Option<u64>,

    /// Load environment variables from this file before starting
    #[arg(long)]
    pub env_file: Option<PathBuf>,
}

impl Args {
    /// Readiness timeout, falling back to the substrate default when unset
    pub fn ready_timeout(&self) -> Duration {
        if self.ready_timeout_ms > 0 {
            Duration::from_millis(self.ready_timeout_ms)
        } else {
            PortWaitOptions::default().timeout
        }
    }

    pub fn poll_interval(&self) -> Duration {
        if self.poll_interval_ms > 0 {
            Duration::from_millis(self.poll_interval_ms)
        } else {
            PortWaitOptions::default().poll_interval
        }
    }

    pub fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            ready_timeout: self.ready_timeout(),
            poll_interval: self.poll_interval(),
        }
    }

    pub fn sleep_after(&self) -> Option<Duration> {
        self.sleep_after_secs.map(Duration::from_secs)
    }
}
