//! Persisted node configuration.
//!
//! A small JSON key-value file holds the identity and radio settings that
//! survive reboots. Missing or corrupt files fall back to defaults — the
//! node must come up regardless.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{info, warn};

use meshloc_types::{IdError, NodeId, RfEnvironment};

pub const CONFIG_FILE: &str = "meshloc.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeConfig {
    pub node_id: String,
    /// Wi-Fi channels the sniffer hops across.
    pub channels: Vec<u8>,
    pub mesh_send_interval_ms: u64,
    pub baseline_rssi_dbm: i8,
    pub rf_environment: RfEnvironment,
    pub serial_port: Option<String>,
    pub serial_baud: u32,
    pub http_port: u16,
    pub sd_log_path: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "N1".to_string(),
            channels: vec![1, 6, 11],
            mesh_send_interval_ms: 3000,
            baseline_rssi_dbm: -90,
            rf_environment: RfEnvironment::Indoor,
            serial_port: None,
            serial_baud: 115_200,
            http_port: 8080,
            sd_log_path: None,
        }
    }
}

impl NodeConfig {
    pub fn node_id(&self) -> Result<NodeId, IdError> {
        NodeId::new(&self.node_id)
    }
}

/// Load configuration from disk. Returns defaults if the file is missing or
/// unparseable.
pub async fn load_config(path: &str) -> NodeConfig {
    if !Path::new(path).exists() {
        info!("no {path} found, using default configuration");
        return NodeConfig::default();
    }
    match fs::read_to_string(path).await {
        Ok(data) => match serde_json::from_str::<NodeConfig>(&data) {
            Ok(cfg) => {
                info!(node_id = %cfg.node_id, "configuration loaded");
                cfg
            }
            Err(e) => {
                warn!("failed to parse {path}: {e}, using defaults");
                NodeConfig::default()
            }
        },
        Err(e) => {
            warn!("failed to read {path}: {e}, using defaults");
            NodeConfig::default()
        }
    }
}

pub async fn save_config(path: &str, cfg: &NodeConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(cfg)?;
    fs::write(path, json).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = NodeConfig::default();
        assert!(cfg.node_id().is_ok());
        assert_eq!(cfg.serial_baud, 115_200);
        assert_eq!(cfg.rf_environment, RfEnvironment::Indoor);
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = std::env::temp_dir().join("meshloc-config-test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("cfg.json");
        let path = path.to_str().unwrap();

        let mut cfg = NodeConfig::default();
        cfg.node_id = "AB3".into();
        cfg.rf_environment = RfEnvironment::OpenSky;
        save_config(path, &cfg).await.unwrap();

        let back = load_config(path).await;
        assert_eq!(back.node_id, "AB3");
        assert_eq!(back.rf_environment, RfEnvironment::OpenSky);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn corrupt_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join("meshloc-config-test");
        let _ = std::fs::create_dir_all(&dir);
        let path = dir.join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let cfg = load_config(path.to_str().unwrap()).await;
        assert_eq!(cfg.node_id, "N1");
        let _ = std::fs::remove_file(&path);
    }
}
