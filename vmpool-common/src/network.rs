use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{CpiError, CpiResult};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Dynamic,
    Manual,
    Vip,
    /// Empty or unknown type; skipped during validation.
    #[default]
    #[serde(other)]
    Unspecified,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct NetworkCloudProperties {
    #[serde(default)]
    pub private_vlan_id: Option<u64>,
    #[serde(default)]
    pub public_vlan_id: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct NetworkDefinition {
    #[serde(rename = "type", default)]
    pub kind: NetworkType,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub netmask: Option<String>,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub default: Vec<String>,
    #[serde(default)]
    pub cloud_properties: NetworkCloudProperties,
}

/// Network definitions after the one-time type dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedNetworks {
    pub dynamic_name: String,
    pub dynamic: NetworkDefinition,
    pub manual: Vec<(String, NetworkDefinition)>,
}

impl ValidatedNetworks {
    pub fn validate(networks: &BTreeMap<String, NetworkDefinition>) -> CpiResult<Self> {
        let mut dynamic: Vec<(&String, &NetworkDefinition)> = Vec::new();
        let mut manual = Vec::new();

        for (name, def) in networks {
            match def.kind {
                NetworkType::Dynamic => dynamic.push((name, def)),
                NetworkType::Manual => manual.push((name.clone(), def.clone())),
                NetworkType::Vip => {
                    return Err(CpiError::not_supported(format!(
                        "network '{}': vip networks are not supported",
                        name
                    )))
                }
                NetworkType::Unspecified => {}
            }
        }

        if dynamic.len() != 1 {
            return Err(CpiError::invalid(format!(
                "exactly one dynamic network is required, found {}",
                dynamic.len()
            )));
        }
        let (name, def) = dynamic[0];

        Ok(Self {
            dynamic_name: name.clone(),
            dynamic: def.clone(),
            manual,
        })
    }

    /// Fixed address pinned on the dynamic network, if any.
    pub fn fixed_ip(&self) -> Option<IpAddr> {
        self.dynamic.ip
    }

    pub fn private_vlan(&self) -> u64 {
        self.dynamic.cloud_properties.private_vlan_id.unwrap_or_default()
    }

    pub fn public_vlan(&self) -> u64 {
        self.dynamic.cloud_properties.public_vlan_id.unwrap_or_default()
    }
}

/// RFC 1918 for IPv4, unique-local (fc00::/7) for IPv6.
pub fn is_private_address(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn net(kind: NetworkType) -> NetworkDefinition {
        NetworkDefinition {
            kind,
            ..Default::default()
        }
    }

    #[test]
    fn parses_type_tags() {
        let defs: BTreeMap<String, NetworkDefinition> = serde_json::from_value(serde_json::json!({
            "a": {"type": "dynamic", "cloud_properties": {"private_vlan_id": 5}},
            "b": {"type": "manual", "ip": "10.1.1.1"},
            "c": {"type": ""},
            "d": {}
        }))
        .unwrap();
        assert_eq!(defs["a"].kind, NetworkType::Dynamic);
        assert_eq!(defs["b"].kind, NetworkType::Manual);
        assert_eq!(defs["c"].kind, NetworkType::Unspecified);
        assert_eq!(defs["d"].kind, NetworkType::Unspecified);

        let v = ValidatedNetworks::validate(&defs).unwrap();
        assert_eq!(v.dynamic_name, "a");
        assert_eq!(v.private_vlan(), 5);
        assert_eq!(v.manual.len(), 1);
        assert_eq!(v.fixed_ip(), None);
    }

    #[test]
    fn requires_exactly_one_dynamic() {
        let mut defs = BTreeMap::new();
        defs.insert("m".to_string(), net(NetworkType::Manual));
        let err = ValidatedNetworks::validate(&defs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        defs.insert("d1".to_string(), net(NetworkType::Dynamic));
        defs.insert("d2".to_string(), net(NetworkType::Dynamic));
        assert!(ValidatedNetworks::validate(&defs).is_err());
    }

    #[test]
    fn vip_is_rejected() {
        let mut defs = BTreeMap::new();
        defs.insert("d".to_string(), net(NetworkType::Dynamic));
        defs.insert("v".to_string(), net(NetworkType::Vip));
        let err = ValidatedNetworks::validate(&defs).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn private_ranges() {
        assert!(is_private_address(&"10.20.30.40".parse().unwrap()));
        assert!(is_private_address(&"192.168.1.1".parse().unwrap()));
        assert!(!is_private_address(&"169.45.1.1".parse().unwrap()));
        assert!(is_private_address(&"fd00::1".parse().unwrap()));
        assert!(!is_private_address(&"2001:db8::1".parse().unwrap()));
    }
}
