//! Configuration for the orchestration core.
//!
//! All components take their settings by value through constructor
//! injection; there is no global configuration singleton. [`Config`] can be
//! built programmatically (tests) or loaded from the environment via
//! [`Config::from_env`], which also honours a local `.env` file.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::VmState;

/// Settings for reaching the coordination service.
#[derive(Clone, Debug)]
pub struct CoordinationConfig {
    /// Hostname or IP of the coordination service.
    pub hostname: String,
    /// TCP port of the coordination service.
    pub port: u16,
    /// Database namespace used by this experiment (e.g. `"prod"`, `"test"`).
    pub db: String,
}

impl CoordinationConfig {
    /// Socket address string in `host:port` form.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 50_059,
            db: "prod".to_string(),
        }
    }
}

/// Settings for the per-VM schedule executor.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Seconds of slack added to "now" when the experiment start time is
    /// stamped, so distributed agents enter `running` together.
    pub experiment_start_buffer_secs: i64,
    /// State assigned to a VM when it is first registered.
    pub default_state: VmState,
    /// In-VM path probed to detect a pending reboot.
    pub reboot_marker_path: String,
    /// Host directory receiving transfer-out files
    /// (`<transfer_root>/transfers/<vm_name>/<in_vm_path>`).
    pub transfer_root: PathBuf,
    /// Host directory receiving per-VM program transcripts.
    pub transcript_dir: PathBuf,
    /// How often a dispatched guest program is polled for completion.
    pub exec_poll_interval: Duration,
    /// How often the agent polls for a published start time while parked
    /// at the barrier.
    pub start_poll_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            experiment_start_buffer_secs: 60,
            default_state: VmState::Uninitialized,
            reboot_marker_path: "/tmp/embermesh_reboot".to_string(),
            transfer_root: PathBuf::from("/var/lib/embermesh"),
            transcript_dir: PathBuf::from("/var/log/embermesh/vm"),
            exec_poll_interval: Duration::from_millis(500),
            start_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Settings for the shared object store.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Root directory of the local store replica.
    pub root: PathBuf,
    /// Peer store roots that receive broadcast writes.
    pub peers: Vec<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/embermesh/store"),
            peers: Vec::new(),
        }
    }
}

/// Top-level configuration threaded through every component.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub coordination: CoordinationConfig,
    pub agent: AgentConfig,
    pub store: StoreConfig,
    /// Location of the repository index file (`repositories.json`).
    pub repository_index: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// Reads a `.env` file if one is present, then applies
    /// `EMBERMESH_*` variables on top of the defaults. Unset variables
    /// keep their default; malformed numeric values are ignored with a
    /// warning rather than failing startup.
    #[must_use]
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let mut config = Config::default();

        if let Ok(host) = std::env::var("EMBERMESH_COORDINATION_HOST") {
            config.coordination.hostname = host;
        }
        if let Some(port) = env_parse::<u16>("EMBERMESH_COORDINATION_PORT") {
            config.coordination.port = port;
        }
        if let Ok(db) = std::env::var("EMBERMESH_COORDINATION_DB") {
            config.coordination.db = db;
        }
        if let Some(buffer) = env_parse::<i64>("EMBERMESH_START_BUFFER_SECS") {
            config.agent.experiment_start_buffer_secs = buffer;
        }
        if let Ok(path) = std::env::var("EMBERMESH_TRANSFER_ROOT") {
            config.agent.transfer_root = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("EMBERMESH_TRANSCRIPT_DIR") {
            config.agent.transcript_dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("EMBERMESH_STORE_ROOT") {
            config.store.root = PathBuf::from(path);
        }
        if let Ok(peers) = std::env::var("EMBERMESH_STORE_PEERS") {
            config.store.peers = peers
                .split(':')
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Ok(path) = std::env::var("EMBERMESH_REPOSITORY_INDEX") {
            config.repository_index = Some(PathBuf::from(path));
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(%key, %raw, "ignoring malformed environment value");
            None
        }
    }
}
