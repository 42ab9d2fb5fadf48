//! Daemon configuration, loaded from a TOML file.
//!
//! Every section and field has a default, so a minimal deployment can run
//! with an empty file plus one `[[output]]` block. Durations are plain
//! numbers: seconds unless the field name says otherwise.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

use crate::sinks::unix::UnixSinkConfig;
use crate::sources::audit::AuditSourceConfig;
use crate::sources::socket::InputConfig;
use crate::transforms::enrich::inventory::InventoryConfig;
use crate::transforms::enrich::EnrichConfig;
use auditmux_buffers::QueueConfig;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file {}: {source}", path.display()))]
    Read { path: PathBuf, source: std::io::Error },

    #[snafu(display("failed to parse config file {}: {source}", path.display()))]
    Parse { path: PathBuf, source: toml::de::Error },
}

fn default_data_dir() -> PathBuf {
    "/var/lib/auditmux".into()
}

fn default_input_path() -> String {
    "/run/auditmux/input.sock".into()
}

fn default_socket_mode() -> u32 {
    0o600
}

fn default_num_priorities() -> usize {
    8
}

fn default_max_segment_size() -> u64 {
    4 * 1024 * 1024
}

fn default_max_priority_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_max_record_age_ms() -> u64 {
    1500
}

fn default_null_placeholder() -> String {
    " ".into()
}

fn default_true() -> bool {
    true
}

fn default_inventory_fetch_secs() -> u64 {
    300
}

fn default_inventory_event_secs() -> u64 {
    3600
}

fn default_ack_queue_size() -> usize {
    128
}

fn default_ack_timeout_ms() -> u64 {
    10_000
}

fn default_write_timeout_ms() -> u64 {
    10_000
}

fn default_default_priority() -> usize {
    4
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputSection {
    #[serde(default = "default_input_path")]
    pub path: String,
    #[serde(default = "default_socket_mode")]
    pub mode: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for InputSection {
    fn default() -> Self {
        InputSection { path: default_input_path(), mode: default_socket_mode(), enabled: true }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetlinkSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_record_age_ms")]
    pub max_record_age_ms: u64,
}

impl Default for NetlinkSection {
    fn default() -> Self {
        NetlinkSection {
            enabled: true,
            flush_interval_ms: default_flush_interval_ms(),
            max_record_age_ms: default_max_record_age_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueSection {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_num_priorities")]
    pub num_priorities: usize,
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,
    #[serde(default = "default_max_priority_bytes")]
    pub max_priority_bytes: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        QueueSection {
            data_dir: default_data_dir(),
            num_priorities: default_num_priorities(),
            max_segment_size: default_max_segment_size(),
            max_priority_bytes: default_max_priority_bytes(),
            flush_interval_ms: default_flush_interval_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrichSection {
    #[serde(default = "default_null_placeholder")]
    pub null_placeholder: String,
}

impl Default for EnrichSection {
    fn default() -> Self {
        EnrichSection { null_placeholder: default_null_placeholder() }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InventorySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_inventory_fetch_secs")]
    pub fetch_interval_secs: u64,
    #[serde(default = "default_inventory_event_secs")]
    pub event_interval_secs: u64,
}

impl Default for InventorySection {
    fn default() -> Self {
        InventorySection {
            enabled: true,
            fetch_interval_secs: default_inventory_fetch_secs(),
            event_interval_secs: default_inventory_event_secs(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregatorSection {
    /// JSON file holding the aggregation rule array; no file, no
    /// aggregation.
    pub rules_file: Option<PathBuf>,
    /// Where open aggregates are persisted across restarts; defaults to
    /// `<queue.data_dir>/aggregator.state`.
    pub state_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PrioritySection {
    #[serde(default = "default_default_priority")]
    pub default: usize,
    /// Record-type name to band overrides.
    #[serde(default)]
    pub by_record_type: HashMap<String, usize>,
}

impl Default for PrioritySection {
    fn default() -> Self {
        PrioritySection { default: default_default_priority(), by_record_type: HashMap::new() }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSection {
    pub name: String,
    pub path: String,
    #[serde(default = "default_true")]
    pub ack_mode: bool,
    #[serde(default = "default_ack_queue_size")]
    pub ack_queue_size: usize,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub input: InputSection,
    #[serde(default)]
    pub netlink: NetlinkSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub enrich: EnrichSection,
    #[serde(default)]
    pub inventory: InventorySection,
    #[serde(default)]
    pub aggregator: AggregatorSection,
    #[serde(default)]
    pub priority: PrioritySection,
    #[serde(default, rename = "output")]
    pub outputs: Vec<OutputSection>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path).context(ReadSnafu { path: path.to_owned() })?;
        toml::from_str(&raw).context(ParseSnafu { path: path.to_owned() })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            data_dir: self.queue.data_dir.join("queue"),
            num_priorities: self.queue.num_priorities.max(1),
            max_segment_size: self.queue.max_segment_size,
            max_priority_bytes: self.queue.max_priority_bytes,
            flush_interval: Duration::from_millis(self.queue.flush_interval_ms),
        }
    }

    pub fn audit_source_config(&self) -> AuditSourceConfig {
        AuditSourceConfig {
            flush_interval: Duration::from_millis(self.netlink.flush_interval_ms.max(100)),
            max_record_age: Duration::from_millis(self.netlink.max_record_age_ms),
        }
    }

    pub fn input_config(&self) -> InputConfig {
        InputConfig { path: self.input.path.clone(), mode: self.input.mode }
    }

    pub fn enrich_config(&self) -> EnrichConfig {
        EnrichConfig { null_placeholder: self.enrich.null_placeholder.clone() }
    }

    pub fn inventory_config(&self) -> InventoryConfig {
        InventoryConfig {
            enabled: self.inventory.enabled,
            fetch_interval: Duration::from_secs(self.inventory.fetch_interval_secs.max(1)),
            event_interval: Duration::from_secs(self.inventory.event_interval_secs.max(1)),
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.aggregator
            .state_file
            .clone()
            .unwrap_or_else(|| self.queue.data_dir.join("aggregator.state"))
    }

    pub fn sink_configs(&self) -> Vec<UnixSinkConfig> {
        self.outputs
            .iter()
            .map(|o| {
                let mut config = UnixSinkConfig::new(o.name.clone(), o.path.clone());
                config.ack_mode = o.ack_mode;
                config.ack_queue_size = o.ack_queue_size.max(1);
                config.ack_timeout = Duration::from_millis(o.ack_timeout_ms.max(1));
                config.write_timeout = Duration::from_millis(o.write_timeout_ms.max(1));
                config
            })
            .collect()
    }
}
