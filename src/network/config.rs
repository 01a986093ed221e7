//! Network configuration documents

use crate::error::{Result, RuneError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::SystemTime;

pub const CNI_VERSION: &str = "1.0.0";

/// Highest network id; ids map onto `10.4.<id>.0/24`
pub const MAX_NETWORK_ID: u32 = 255;

/// Name of the default network
pub const DEFAULT_NETWORK: &str = "bridge";

/// Networks that exist without a user-editable config
pub const PSEUDO_NETWORKS: [&str; 3] = ["host", "none", DEFAULT_NETWORK];

pub fn is_pseudo(name: &str) -> bool {
    PSEUDO_NETWORKS.contains(&name)
}

/// Host bridge interface for a network id
pub fn bridge_name(id: u32) -> String {
    format!("runectl{}", id)
}

/// Network driver types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkDriver {
    /// Bridge network (default)
    #[default]
    Bridge,
    /// Macvlan network
    Macvlan,
    /// IPvlan network
    Ipvlan,
}

impl std::fmt::Display for NetworkDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkDriver::Bridge => write!(f, "bridge"),
            NetworkDriver::Macvlan => write!(f, "macvlan"),
            NetworkDriver::Ipvlan => write!(f, "ipvlan"),
        }
    }
}

impl std::str::FromStr for NetworkDriver {
    type Err = RuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "bridge" => Ok(NetworkDriver::Bridge),
            "macvlan" => Ok(NetworkDriver::Macvlan),
            "ipvlan" => Ok(NetworkDriver::Ipvlan),
            other => Err(RuneError::usage(format!("unsupported network driver {:?}", other))),
        }
    }
}

/// IPAM driver types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IpamDriver {
    #[default]
    HostLocal,
    Dhcp,
}

impl std::str::FromStr for IpamDriver {
    type Err = RuneError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "default" | "host-local" => Ok(IpamDriver::HostLocal),
            "dhcp" => Ok(IpamDriver::Dhcp),
            other => Err(RuneError::usage(format!("unsupported IPAM driver {:?}", other))),
        }
    }
}

/// An IPv4 CIDR block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Subnet {
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || RuneError::usage(format!("invalid subnet {:?}", s));
        let (addr, prefix) = s.split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix > 30 {
            return Err(invalid());
        }
        let mask = Self::mask_bits(prefix);
        Ok(Self {
            addr: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    fn mask_bits(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix as u32)
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_bits(self.prefix) == u32::from(self.addr)
    }

    /// First usable address, conventionally the gateway
    pub fn first_host(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) + 1)
    }

    /// Last usable address
    pub fn last_host(&self) -> Ipv4Addr {
        Ipv4Addr::from((u32::from(self.addr) | !Self::mask_bits(self.prefix)) - 1)
    }

    /// Default subnet for a network id
    pub fn for_id(id: u32) -> Result<Self> {
        if id > MAX_NETWORK_ID {
            return Err(RuneError::SubnetExhausted(id));
        }
        Ok(Self {
            addr: Ipv4Addr::new(10, 4, id as u8, 0),
            prefix: 24,
        })
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Options for `network create`
#[derive(Debug, Clone, Default)]
pub struct CreateNetworkOptions {
    pub name: String,
    pub driver: NetworkDriver,
    /// Driver options, e.g. `parent`, `mode`, `mtu`
    pub options: BTreeMap<String, String>,
    pub ipam_driver: IpamDriver,
    pub subnet: Option<String>,
    pub gateway: Option<String>,
    pub ip_range: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl CreateNetworkOptions {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Set network driver
    pub fn driver(mut self, driver: NetworkDriver) -> Self {
        self.driver = driver;
        self
    }

    /// Set subnet
    pub fn subnet(mut self, subnet: &str) -> Self {
        self.subnet = Some(subnet.to_string());
        self
    }

    /// Set gateway
    pub fn gateway(mut self, gateway: &str) -> Self {
        self.gateway = Some(gateway.to_string());
        self
    }

    /// Add label
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Add driver option
    pub fn option(mut self, key: &str, value: &str) -> Self {
        self.options.insert(key.to_string(), value.to_string());
        self
    }
}

/// A plugin-list document as stored in the network config directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub name: String,
    /// Present only on networks this tool manages
    #[serde(rename = "runectlID", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(rename = "runectlLabels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub plugins: Vec<Value>,
    /// File the document was read from
    #[serde(skip)]
    pub file: PathBuf,
    #[serde(skip)]
    pub modified: Option<SystemTime>,
}

impl NetworkConfig {
    /// Assemble the plugin chain for `opts` with network id `id`
    pub fn build(opts: &CreateNetworkOptions, id: u32) -> Result<Self> {
        let subnet = match &opts.subnet {
            Some(s) => Subnet::parse(s)?,
            None => Subnet::for_id(id)?,
        };
        let gateway = match &opts.gateway {
            Some(g) => {
                let ip: Ipv4Addr = g
                    .parse()
                    .map_err(|_| RuneError::usage(format!("invalid gateway {:?}", g)))?;
                if !subnet.contains(ip) {
                    return Err(RuneError::usage(format!("gateway {} is outside subnet {}", ip, subnet)));
                }
                ip
            }
            None => subnet.first_host(),
        };
        let ipam = ipam_config(opts, &subnet, gateway)?;

        let mut plugins = Vec::new();
        match opts.driver {
            NetworkDriver::Bridge => {
                let mut bridge = json!({
                    "type": "bridge",
                    "bridge": bridge_name(id),
                    "isGateway": true,
                    "ipMasq": true,
                    "hairpinMode": true,
                    "ipam": ipam,
                });
                if let Some(mtu) = opts.options.get("mtu").or_else(|| opts.options.get("com.docker.network.driver.mtu")) {
                    bridge["mtu"] = json!(parse_mtu(mtu)?);
                }
                plugins.push(bridge);
                plugins.push(json!({"type": "portmap", "capabilities": {"portMappings": true}}));
                plugins.push(json!({"type": "firewall"}));
                plugins.push(json!({"type": "tuning"}));
            }
            NetworkDriver::Macvlan | NetworkDriver::Ipvlan => {
                let master = opts.options.get("parent").ok_or_else(|| {
                    RuneError::usage(format!("the {} driver requires -o parent=<interface>", opts.driver))
                })?;
                let mode = opts.options.get(&format!("{}_mode", opts.driver)).or_else(|| opts.options.get("mode"));
                let default_mode = if opts.driver == NetworkDriver::Macvlan { "bridge" } else { "l2" };
                let mut plugin = json!({
                    "type": opts.driver.to_string(),
                    "master": master,
                    "mode": mode.map(String::as_str).unwrap_or(default_mode),
                    "ipam": ipam,
                });
                if let Some(mtu) = opts.options.get("mtu") {
                    plugin["mtu"] = json!(parse_mtu(mtu)?);
                }
                plugins.push(plugin);
            }
        }

        Ok(Self {
            cni_version: CNI_VERSION.to_string(),
            name: opts.name.clone(),
            id: Some(id),
            labels: opts.labels.clone(),
            plugins,
            file: PathBuf::new(),
            modified: None,
        })
    }

    /// Driver of the first plugin
    pub fn driver(&self) -> String {
        self.plugins
            .first()
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    /// `(subnet, gateway)` pairs of the host-local IPAM ranges
    pub fn ipam_ranges(&self) -> Vec<(String, Option<String>)> {
        let mut out = Vec::new();
        for plugin in &self.plugins {
            let ranges = plugin
                .get("ipam")
                .and_then(|i| i.get("ranges"))
                .and_then(Value::as_array);
            for set in ranges.into_iter().flatten() {
                for range in set.as_array().into_iter().flatten() {
                    if let Some(subnet) = range.get("subnet").and_then(Value::as_str) {
                        let gateway = range.get("gateway").and_then(Value::as_str).map(String::from);
                        out.push((subnet.to_string(), gateway));
                    }
                }
            }
        }
        out
    }

    /// Host bridge interface owned by this network, if any
    pub fn bridge_interface(&self) -> Option<String> {
        self.plugins
            .iter()
            .find(|p| p.get("type").and_then(Value::as_str) == Some("bridge"))
            .and_then(|p| p.get("bridge"))
            .and_then(Value::as_str)
            .map(String::from)
    }
}

fn parse_mtu(raw: &str) -> Result<u32> {
    raw.parse()
        .map_err(|_| RuneError::usage(format!("invalid mtu {:?}", raw)))
}

fn ipam_config(opts: &CreateNetworkOptions, subnet: &Subnet, gateway: Ipv4Addr) -> Result<Value> {
    if opts.ipam_driver == IpamDriver::Dhcp {
        if opts.driver == NetworkDriver::Bridge {
            return Err(RuneError::usage("the dhcp IPAM driver is not supported with the bridge driver"));
        }
        return Ok(json!({"type": "dhcp"}));
    }
    let mut range = json!({
        "subnet": subnet.to_string(),
        "gateway": gateway.to_string(),
    });
    if let Some(raw) = &opts.ip_range {
        let r = Subnet::parse(raw)?;
        if !subnet.contains(r.addr) {
            return Err(RuneError::usage(format!("ip-range {} is outside subnet {}", r, subnet)));
        }
        range["rangeStart"] = json!(r.first_host().to_string());
        range["rangeEnd"] = json!(r.last_host().to_string());
    }
    Ok(json!({
        "type": "host-local",
        "ranges": [[range]],
        "routes": [{"dst": "0.0.0.0/0"}],
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_subnet_from_id() {
        let config = NetworkConfig::build(&CreateNetworkOptions::new("n0"), 7).unwrap();
        assert_eq!(config.id, Some(7));
        assert_eq!(config.driver(), "bridge");
        assert_eq!(config.bridge_interface().as_deref(), Some("runectl7"));
        assert_eq!(
            config.ipam_ranges(),
            vec![("10.4.7.0/24".to_string(), Some("10.4.7.1".to_string()))]
        );
        let types: Vec<_> = config.plugins.iter().map(|p| p["type"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["bridge", "portmap", "firewall", "tuning"]);
    }

    #[test]
    fn test_subnet_exhausted_without_explicit_subnet() {
        let err = NetworkConfig::build(&CreateNetworkOptions::new("n"), 256).unwrap_err();
        assert!(matches!(err, RuneError::SubnetExhausted(256)));
        let ok = NetworkConfig::build(&CreateNetworkOptions::new("n").subnet("192.168.9.0/24"), 256);
        assert!(ok.is_ok());
    }

    #[test]
    fn test_explicit_subnet_gateway_and_range() {
        let mut opts = CreateNetworkOptions::new("n")
            .subnet("172.30.0.0/16")
            .gateway("172.30.0.254");
        opts.ip_range = Some("172.30.5.0/24".to_string());
        let config = NetworkConfig::build(&opts, 3).unwrap();
        let range = &config.plugins[0]["ipam"]["ranges"][0][0];
        assert_eq!(range["gateway"], "172.30.0.254");
        assert_eq!(range["rangeStart"], "172.30.5.1");
        assert_eq!(range["rangeEnd"], "172.30.5.254");

        let bad = CreateNetworkOptions::new("n").subnet("172.30.0.0/16").gateway("10.0.0.1");
        assert!(NetworkConfig::build(&bad, 3).is_err());
    }

    #[test]
    fn test_macvlan_requires_parent() {
        let opts = CreateNetworkOptions::new("m").driver(NetworkDriver::Macvlan);
        assert!(matches!(NetworkConfig::build(&opts, 1), Err(RuneError::Usage(_))));
        let opts = opts.option("parent", "eth0");
        let config = NetworkConfig::build(&opts, 1).unwrap();
        assert_eq!(config.plugins[0]["master"], "eth0");
        assert_eq!(config.plugins[0]["mode"], "bridge");
        assert!(config.bridge_interface().is_none());
    }

    #[test]
    fn test_document_round_trips_id_field() {
        let config = NetworkConfig::build(&CreateNetworkOptions::new("n").label("team", "a"), 2).unwrap();
        let raw = serde_json::to_string(&config).unwrap();
        assert!(raw.contains("\"runectlID\":2"));
        let back: NetworkConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.id, Some(2));
        assert_eq!(back.labels["team"], "a");
    }

    #[test]
    fn test_subnet_math() {
        let s = Subnet::parse("10.1.2.3/24").unwrap();
        assert_eq!(s.to_string(), "10.1.2.0/24");
        assert!(s.contains("10.1.2.200".parse().unwrap()));
        assert!(!s.contains("10.1.3.1".parse().unwrap()));
        assert_eq!(s.last_host(), Ipv4Addr::new(10, 1, 2, 254));
        assert!(Subnet::parse("10.1.2.0").is_err());
    }
}
