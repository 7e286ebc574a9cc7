use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Configuration pushed to the agent running inside an instance.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AgentSettings {
    pub agent_id: String,
    pub vm: AgentVm,
    pub mbus: String,
    pub blobstore: Option<String>,
    pub ntp: Vec<String>,
    pub disks: AgentDisks,
    pub networks: BTreeMap<String, AgentNetwork>,
    pub env: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AgentVm {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct AgentDisks {
    pub system: String,
    pub ephemeral: Option<String>,
    pub persistent: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AgentNetwork {
    #[serde(rename = "type")]
    pub kind: String,
    pub ip: Option<String>,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
    pub dns: Vec<String>,
    pub default: Vec<String>,
}
