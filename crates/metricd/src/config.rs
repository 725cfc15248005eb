//! metricd.toml configuration.
//!
//! Every section has defaults, so an empty file is a valid single-node
//! configuration without streams.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use metricgrid_cluster::membership::validate_address;
use metricgrid_cluster::{RemoteClientConfig, SelectorKind};
use metricgrid_core::{ConfigError, DownSampling, MergeOperator, RoleId, Schema, StageKind, ValueType};
use metricgrid_graph::{MetricsStreamDef, StageOptions, SweepConfig};
use metricgrid_queue::{Backpressure, QueueConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub cluster: ClusterSection,
    pub queue: QueueSection,
    pub remote: RemoteSection,
    pub persistence: PersistenceSection,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NodeSection {
    pub grpc_addr: SocketAddr,
    pub http_addr: SocketAddr,
    /// Address peers use to reach this node. Defaults to `grpc_addr`.
    pub advertise_addr: Option<String>,
    pub data_dir: PathBuf,
    pub in_memory_storage: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            grpc_addr: SocketAddr::from(([0, 0, 0, 0], 11800)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 12800)),
            advertise_addr: None,
            data_dir: PathBuf::from("/var/lib/metricgrid"),
            in_memory_storage: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterSection {
    /// Every member of the cluster, this node included.
    pub peers: Vec<String>,
    pub refresh_interval_secs: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            refresh_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureConfig {
    #[default]
    Blocking,
    DropIfFull,
    BoundedWait { timeout_ms: u64 },
}

impl From<BackpressureConfig> for Backpressure {
    fn from(config: BackpressureConfig) -> Self {
        match config {
            BackpressureConfig::Blocking => Backpressure::Blocking,
            BackpressureConfig::DropIfFull => Backpressure::DropIfFull,
            BackpressureConfig::BoundedWait { timeout_ms } => {
                Backpressure::BoundedWait(Duration::from_millis(timeout_ms))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSection {
    /// Slots per partition. Must be a power of two.
    pub capacity: usize,
    pub partitions: usize,
    pub consumers: usize,
    pub batch_size: usize,
    pub idle_wait_ms: u64,
    pub backpressure: BackpressureConfig,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: 1024,
            partitions: 4,
            consumers: 1,
            batch_size: 256,
            idle_wait_ms: 20,
            backpressure: BackpressureConfig::Blocking,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteSection {
    pub channel_capacity: usize,
    pub connect_timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            connect_timeout_ms: 3000,
            backoff_initial_ms: 200,
            backoff_max_ms: 10_000,
            heartbeat_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersistenceSection {
    pub interval_secs: u64,
    pub initial_delay_secs: u64,
    pub max_batch_size: usize,
    /// Keep persisted rows in memory so later rounds skip the storage read.
    pub session_cache: bool,
    /// Cached rows not written for this long are evicted.
    pub session_timeout_secs: u64,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            interval_secs: 25,
            initial_delay_secs: 10,
            max_batch_size: 2000,
            session_cache: true,
            session_timeout_secs: 70,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamConfig {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub selector: SelectorKind,
    #[serde(default)]
    pub downsampling: Vec<DownSampling>,
    /// When false, rows are written once and later values for a stored row
    /// are discarded.
    #[serde(default = "default_support_update")]
    pub support_update: bool,
    pub columns: Vec<ColumnConfig>,
}

fn default_support_update() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub merge: MergeOperator,
}

impl StreamConfig {
    /// Schema of the stream; its id is the stream id.
    pub fn schema(&self) -> Result<Arc<Schema>, ConfigError> {
        self.columns
            .iter()
            .fold(Schema::builder(self.id, self.name.clone()), |b, c| {
                b.column(c.name.clone(), c.value_type, c.merge)
            })
            .build()
    }

    pub fn definition(&self) -> Result<MetricsStreamDef, ConfigError> {
        Ok(MetricsStreamDef {
            id: self.id,
            name: self.name.clone(),
            schema: self.schema()?,
            selector: self.selector,
            downsampling: self.downsampling.clone(),
            support_update: self.support_update,
        })
    }
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn advertise_addr(&self) -> String {
        self.node
            .advertise_addr
            .clone()
            .unwrap_or_else(|| self.node.grpc_addr.to_string())
    }

    /// Reject configurations the node cannot start with.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.stage_options().queue.validate()?;
        if self.queue.consumers == 0 {
            return Err(ConfigError::Invalid("queue.consumers must be at least 1".into()).into());
        }

        validate_address(&self.advertise_addr()).context("node.advertise_addr")?;
        for peer in &self.cluster.peers {
            validate_address(peer).context("cluster.peers")?;
        }
        let advertise = self.advertise_addr();
        if !self.cluster.peers.is_empty() && !self.cluster.peers.contains(&advertise) {
            return Err(ConfigError::Invalid(format!(
                "cluster.peers must include this node's advertise address {advertise}"
            ))
            .into());
        }
        if self.cluster.refresh_interval_secs == 0 {
            return Err(ConfigError::Invalid("cluster.refresh_interval_secs must be positive".into()).into());
        }
        if self.remote.channel_capacity == 0 || self.remote.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "remote.channel_capacity and remote.heartbeat_interval_secs must be positive".into(),
            )
            .into());
        }
        if self.persistence.session_cache && self.persistence.session_timeout_secs == 0 {
            return Err(ConfigError::Invalid("persistence.session_timeout_secs must be positive".into()).into());
        }
        if self.persistence.interval_secs == 0 || self.persistence.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "persistence.interval_secs and persistence.max_batch_size must be positive".into(),
            )
            .into());
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for stream in &self.streams {
            if !ids.insert(stream.id) {
                return Err(ConfigError::Invalid(format!("duplicate stream id {}", stream.id)).into());
            }
            if !names.insert(stream.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate stream name {:?}", stream.name)).into());
            }
            RoleId::for_stream(stream.id, StageKind::Aggregate)
                .with_context(|| format!("stream {:?}", stream.name))?;
            stream
                .schema()
                .with_context(|| format!("stream {:?}", stream.name))?;
        }
        Ok(())
    }

    pub fn stage_options(&self) -> StageOptions {
        StageOptions {
            queue: QueueConfig {
                name: "stage".to_string(),
                capacity: self.queue.capacity,
                partitions: self.queue.partitions,
                backpressure: self.queue.backpressure.into(),
                batch_size: self.queue.batch_size,
                idle_wait: Duration::from_millis(self.queue.idle_wait_ms),
            },
            consumers: self.queue.consumers,
        }
    }

    pub fn remote_config(&self) -> RemoteClientConfig {
        RemoteClientConfig {
            channel_capacity: self.remote.channel_capacity,
            connect_timeout: Duration::from_millis(self.remote.connect_timeout_ms),
            backoff_initial: Duration::from_millis(self.remote.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.remote.backoff_max_ms),
            heartbeat_interval: Duration::from_secs(self.remote.heartbeat_interval_secs),
        }
    }

    pub fn sweep_config(&self) -> SweepConfig {
        SweepConfig {
            interval: Duration::from_secs(self.persistence.interval_secs),
            initial_delay: Duration::from_secs(self.persistence.initial_delay_secs),
            max_batch_size: self.persistence.max_batch_size,
            session_timeout: self
                .persistence
                .session_cache
                .then(|| Duration::from_secs(self.persistence.session_timeout_secs)),
        }
    }

    pub fn stream_defs(&self) -> Result<Vec<MetricsStreamDef>, ConfigError> {
        self.streams.iter().map(StreamConfig::definition).collect()
    }
}
