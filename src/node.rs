//! Rented remote nodes.
//!
//! A `Node` is built from a `NodeDescriptor` returned by the cloud API. One node is driven by
//! at most one tokio task at a time: its installer call first, then its worker loop.

use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use colored::*;
use colourado::Color;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Instance id used in the event log for records that are not about one node.
pub const MASTER_ID: &str = "<master>";

/// Lifecycle of a node within one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeState {
    Requested,
    Started,
    Installing,
    Installed,
    Working,
    Retiring,
    Terminated,
    Failed,
}

/// Where and as whom to SSH into a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl SshEndpoint {
    /// `user@host`, the destination string handed to ssh.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// CPU facts used to rate a device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceMetrics {
    pub cpu_arch: String,
    pub num_cores: usize,
    pub core_speeds_ghz: Vec<f64>,
    pub core_families: Vec<String>,
}

/// Computes a performance rating from device metrics.
pub type Rater = fn(&DeviceMetrics) -> f64;

/// Default rating: total clock across cores, weighted up for 64-bit cores.
pub fn nominal_rating(metrics: &DeviceMetrics) -> f64 {
    let arch_factor = if metrics.cpu_arch.contains("64") {
        10.0
    } else {
        6.0
    };
    metrics.core_speeds_ghz.iter().sum::<f64>() * arch_factor
}

// Descriptor records as produced by the cloud API and stored in inventory files.
// Fields this crate does not read are kept in `extra` so inventories round-trip.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshSpec {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(rename = "hostKeys", default, skip_serializing_if = "Value::is_null")]
    pub host_keys: Value,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreSpec {
    #[serde(alias = "freqHz", default)]
    pub freq: f64,
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub vendor: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuSpec {
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub cores: Vec<CoreSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RamSpec {
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSpec {
    pub free: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceLocation {
    pub country_code: Option<String>,
    pub area: Option<String>,
    pub locality: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub instance_id: String,
    /// `started` for usable nodes; anything else (e.g. `exhausted`) is unusable.
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram: Option<RamSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSpec>,
    #[serde(
        rename = "device-location",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub location: Option<DeviceLocation>,
    /// Rating precomputed by the provider, if it supplied one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dpr: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NodeDescriptor {
    pub fn is_started(&self) -> bool {
        self.state == "started"
    }

    pub fn metrics(&self) -> DeviceMetrics {
        match &self.cpu {
            Some(cpu) => DeviceMetrics {
                cpu_arch: cpu.arch.clone(),
                num_cores: cpu.cores.len(),
                core_speeds_ghz: cpu.cores.iter().map(|c| c.freq / 1e9).collect(),
                core_families: cpu.cores.iter().map(|c| c.family.clone()).collect(),
            },
            None => DeviceMetrics::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub endpoint: SshEndpoint,
    pub metrics: DeviceMetrics,
    pub performance_rating: f64,
    pub state: NodeState,
    /// The record this node was built from, written back to inventory files.
    pub descriptor: NodeDescriptor,
}

impl Node {
    /// Builds a node from a started descriptor. Returns `None` if it has no SSH endpoint.
    pub fn from_descriptor(descriptor: NodeDescriptor, rater: Rater) -> Option<Self> {
        let ssh = descriptor.ssh.as_ref()?;
        let endpoint = SshEndpoint {
            host: ssh.host.clone(),
            port: ssh.port,
            user: ssh.user.clone(),
        };
        let metrics = descriptor.metrics();
        let performance_rating = descriptor.dpr.unwrap_or_else(|| rater(&metrics));
        let state = if descriptor.is_started() {
            NodeState::Started
        } else {
            NodeState::Requested
        };
        Some(Self {
            id: descriptor.instance_id.clone(),
            endpoint,
            metrics,
            performance_rating,
            state,
            descriptor,
        })
    }

    /// First 16 characters of the instance id, enough to tell nodes apart in console output.
    pub fn short_id(&self) -> &str {
        match self.id.char_indices().nth(16) {
            Some((i, _)) => &self.id[..i],
            None => &self.id,
        }
    }

    /// For pretty-printing the node id.
    /// Surrounds with brackets and colors it with the given palette color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        let r = (color.red * 255.0) as u8;
        let g = (color.green * 255.0) as u8;
        let b = (color.blue * 255.0) as u8;
        format!("{}", self).truecolor(r, g, b)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.short_id())
    }
}

/// Reads an inventory file: a JSON array of node descriptors.
pub fn load_inventory(path: &Path) -> Result<Vec<NodeDescriptor>> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(file)?)
}

/// Overwrites an inventory file with the given descriptors.
pub fn save_inventory(path: &Path, descriptors: &[NodeDescriptor]) -> Result<()> {
    let file = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(file, descriptors)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(json: &str) -> NodeDescriptor {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_provider_descriptor() {
        let desc = descriptor(
            r#"{
                "instanceId": "abcdef0123456789-rest",
                "state": "started",
                "ssh": {"host": "10.0.0.5", "port": 2222, "user": "u0_a1"},
                "cpu": {"arch": "aarch64", "cores": [
                    {"freq": 2000000000, "family": "Cortex-A76", "vendor": "ARM"},
                    {"freq": 1000000000, "family": "Cortex-A55", "vendor": "ARM"}
                ]},
                "ram": {"total": 4000000000},
                "device-location": {"country-code": "US", "locality": "Austin"},
                "device-id": 1234
            }"#,
        );
        assert!(desc.is_started());
        assert_eq!(desc.ram, Some(RamSpec { total: 4_000_000_000 }));
        assert_eq!(
            desc.location.as_ref().unwrap().country_code.as_deref(),
            Some("US")
        );
        // Unread fields survive.
        assert_eq!(desc.extra.get("device-id"), Some(&Value::from(1234)));

        let metrics = desc.metrics();
        assert_eq!(metrics.num_cores, 2);
        assert_eq!(metrics.core_speeds_ghz, vec![2.0, 1.0]);
        assert_eq!(metrics.core_families, vec!["Cortex-A76", "Cortex-A55"]);
    }

    #[test]
    fn node_from_descriptor_uses_rater_unless_provider_rated() {
        let desc = descriptor(
            r#"{"instanceId": "n1", "state": "started",
                "ssh": {"host": "h", "user": "u"},
                "cpu": {"arch": "armv7l", "cores": [{"freqHz": 1500000000}]}}"#,
        );
        let node = Node::from_descriptor(desc.clone(), nominal_rating).unwrap();
        assert_eq!(node.endpoint.port, 22);
        assert_eq!(node.endpoint.destination(), "u@h");
        assert_eq!(node.state, NodeState::Started);
        assert!((node.performance_rating - 9.0).abs() < 1e-9);

        let mut rated = desc;
        rated.dpr = Some(48.0);
        let node = Node::from_descriptor(rated, nominal_rating).unwrap();
        assert_eq!(node.performance_rating, 48.0);
    }

    #[test]
    fn node_without_ssh_is_rejected() {
        let desc = descriptor(r#"{"instanceId": "n2", "state": "exhausted"}"#);
        assert!(!desc.is_started());
        assert!(Node::from_descriptor(desc, nominal_rating).is_none());
    }

    #[test]
    fn short_id_truncates() {
        let desc = descriptor(
            r#"{"instanceId": "0123456789abcdefXYZ", "state": "started",
                "ssh": {"host": "h", "user": "u"}}"#,
        );
        let node = Node::from_descriptor(desc, nominal_rating).unwrap();
        assert_eq!(node.short_id(), "0123456789abcdef");
        assert_eq!(node.to_string(), "[0123456789abcdef]");
    }

    #[test]
    fn inventory_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inventory.json");
        let desc = descriptor(
            r#"{"instanceId": "n3", "state": "started",
                "ssh": {"host": "h", "port": 22, "user": "u"}, "job": "j-1"}"#,
        );
        save_inventory(&path, &[desc.clone()]).unwrap();
        assert_eq!(load_inventory(&path).unwrap(), vec![desc]);
    }
}
