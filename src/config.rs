//! Reconciler Configuration

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Fabric scopes reconciled by this process
    pub scopes: Vec<String>,
    /// Base reconcile interval
    pub interval_secs: u64,
    /// Random jitter added to each interval
    pub jitter_ms: u64,
    /// Wall-clock budget per cycle
    pub cycle_budget_secs: u64,
    /// Run independent domain chains concurrently
    pub parallel_chains: bool,
    /// Kernel driver
    pub driver: DriverKind,
    /// Intent store export directory
    pub store_dir: String,
    /// Kernel realization parameters
    pub layout: LayoutConfig,
    /// Capability probe
    pub probe: ProbeConfig,
    /// External commands
    pub commands: CommandPaths,
    /// Local API
    pub api: ApiConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            scopes: vec!["default".into()],
            interval_secs: 30,
            jitter_ms: 2000,
            cycle_budget_secs: 60,
            parallel_chains: true,
            driver: DriverKind::Iproute,
            store_dir: "/var/lib/fabric/intent".into(),
            layout: LayoutConfig::default(),
            probe: ProbeConfig::default(),
            commands: CommandPaths::default(),
            api: ApiConfig::default(),
        }
    }
}

impl ReconcilerConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn cycle_budget(&self) -> Duration {
        Duration::from_secs(self.cycle_budget_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Local host via iproute2/iptables
    Iproute,
    /// In-memory fabric node
    Simulated,
}

/// How resources are realized in the kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Domain table = table_base + segment_id
    pub table_base: u32,
    /// rtnetlink protocol stamped on owned routes
    pub route_protocol: u8,
    /// Priority of fallback policy rules
    pub policy_priority: u32,
    /// VXLAN UDP port
    pub vxlan_port: u16,
    /// VXLAN local tunnel address
    pub vxlan_local: Option<IpAddr>,
    /// Default uplink for internet gateways
    pub uplink: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            table_base: 10000,
            route_protocol: 250,
            policy_priority: 1000,
            vxlan_port: 4789,
            vxlan_local: None,
            uplink: "eth0".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Throwaway VRF device
    pub device: String,
    pub table: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            device: "vrf-probe".into(),
            table: 9999,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPaths {
    pub ip: String,
    pub iptables: String,
    pub ip6tables: String,
}

impl Default for CommandPaths {
    fn default() -> Self {
        Self {
            ip: "ip".into(),
            iptables: "iptables".into(),
            ip6tables: "ip6tables".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: "127.0.0.1:9180".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let json = r#"{"scopes":["blue","green"],"driver":"simulated","layout":{"table_base":20000}}"#;
        let config: ReconcilerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.scopes, vec!["blue", "green"]);
        assert_eq!(config.driver, DriverKind::Simulated);
        assert_eq!(config.layout.table_base, 20000);
        assert_eq!(config.layout.vxlan_port, 4789);
        assert_eq!(config.interval_secs, 30);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("reconciler-{}.json", uuid::Uuid::new_v4()));
        let path = path.to_string_lossy().to_string();
        let mut config = ReconcilerConfig::default();
        config.parallel_chains = false;
        config.save(&path).unwrap();

        let loaded = ReconcilerConfig::load(&path).unwrap();
        assert!(!loaded.parallel_chains);
        assert_eq!(loaded.layout, LayoutConfig::default());
        std::fs::remove_file(&path).unwrap();
    }
}
