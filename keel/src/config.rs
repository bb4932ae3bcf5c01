use kel_cluster::{ControllerOptions, NodeInfo};
use kel_core::{InstanceId, KeelError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub instance_id: u16,
    pub cluster_size: usize,
    pub http_addr: SocketAddr,
    pub health_addr: SocketAddr,
    pub external_tcp_addr: Option<SocketAddr>,
    pub external_secure_tcp_addr: Option<SocketAddr>,
    /// Internal node-to-node endpoint, advertised to peers via gossip.
    pub internal_tcp_addr: SocketAddr,
    #[serde(default)]
    pub read_only_replica: bool,
    /// Plugin subsystems expected to report in before `SystemReady`.
    #[serde(default)]
    pub subsystems: Vec<String>,
    #[serde(default = "default_prepare_timeout_ms")]
    pub prepare_timeout_ms: u64,
    #[serde(default = "default_commit_timeout_ms")]
    pub commit_timeout_ms: u64,
    pub data_dir: PathBuf,
}

fn default_prepare_timeout_ms() -> u64 {
    2000
}

fn default_commit_timeout_ms() -> u64 {
    2000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: 0,
            cluster_size: 1,
            http_addr: SocketAddr::from(([0, 0, 0, 0], 2113)),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            external_tcp_addr: None,
            external_secure_tcp_addr: None,
            internal_tcp_addr: SocketAddr::from(([0, 0, 0, 0], 1112)),
            read_only_replica: false,
            subsystems: Vec::new(),
            prepare_timeout_ms: default_prepare_timeout_ms(),
            commit_timeout_ms: default_commit_timeout_ms(),
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match ext {
            "toml" => toml::from_str(&content)
                .map_err(|e| KeelError::Config(format!("TOML parse error: {e}"))),
            "json" => serde_json::from_str(&content)
                .map_err(|e| KeelError::Config(format!("JSON parse error: {e}"))),
            _ => Err(KeelError::Config(format!(
                "Unknown config file extension: {ext}"
            ))),
        }
    }

    pub fn from_args(args: &super::Args) -> Self {
        Self {
            instance_id: args.instance_id,
            cluster_size: args.cluster_size,
            http_addr: args.http,
            health_addr: args.health,
            external_tcp_addr: args.external_tcp,
            external_secure_tcp_addr: args.external_secure_tcp,
            internal_tcp_addr: args.internal_tcp,
            read_only_replica: args.read_only,
            data_dir: args.data_dir.clone(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_size == 0 {
            return Err(KeelError::Config("cluster_size must be at least 1".into()));
        }
        if self.read_only_replica && self.cluster_size == 1 {
            return Err(KeelError::Config(
                "a single-node cluster cannot be a read-only replica".into(),
            ));
        }
        Ok(())
    }

    pub fn node_info(&self) -> NodeInfo {
        let mut node = NodeInfo::new(InstanceId(self.instance_id), self.http_addr);
        if let Some(tcp) = self.external_tcp_addr {
            node = node.with_external_tcp(tcp);
        }
        if let Some(secure) = self.external_secure_tcp_addr {
            node = node.with_external_secure_tcp(secure);
        }
        if self.read_only_replica {
            node = node.read_only_replica();
        }
        node
    }

    pub fn controller_options(&self) -> ControllerOptions {
        let mut options = ControllerOptions::new(self.node_info(), self.cluster_size);
        options.subsystem_count = self.subsystems.len();
        options.prepare_timeout = Duration::from_millis(self.prepare_timeout_ms);
        options.commit_timeout = Duration::from_millis(self.commit_timeout_ms);
        options
    }
}
