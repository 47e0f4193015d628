use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, UplinkError};

/// Address families an interface holds (link layer always counts as one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddresses {
    pub name: String,
    pub families: usize,
}

// Link, IPv4 and IPv6 together mean the interface has a lease.
const LEASE_MIN_FAMILIES: usize = 3;

/// Heuristic "has an IP lease": some non-loopback interface holds more than
/// the link-layer plus one other address family.
pub fn has_address_lease(interfaces: &[InterfaceAddresses]) -> bool {
    interfaces
        .iter()
        .any(|i| i.name != "lo" && i.families >= LEASE_MIN_FAMILIES)
}

/// Parses `ip -o addr show` into per-interface family counts.
pub fn parse_ip_addr(output: &str) -> Vec<InterfaceAddresses> {
    let mut families: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_index), Some(name), Some(family)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        let name = name.split('@').next().unwrap_or(name).trim_end_matches(':');
        let entry = families.entry(name.to_string()).or_default();
        entry.insert("link".to_string());
        entry.insert(family.to_string());
    }
    families
        .into_iter()
        .map(|(name, set)| InterfaceAddresses {
            name,
            families: set.len(),
        })
        .collect()
}

/// Parses the first IPv4 address of an interface out of `ip -o -4 addr show dev X`.
pub fn parse_ipv4(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace().skip_while(|f| *f != "inet");
        fields.next()?;
        let cidr = fields.next()?;
        Some(cidr.split('/').next().unwrap_or(cidr).to_string())
    })
}

#[async_trait]
pub trait WifiDriver: Send + Sync {
    async fn loopback_reachable(&self) -> Result<bool>;
    async fn interface_addresses(&self) -> Result<Vec<InterfaceAddresses>>;
    /// Takes the interface down and back up.
    async fn cycle_interface(&self, name: &str) -> Result<()>;
    async fn ipv4_address(&self, name: &str) -> Result<Option<String>>;
}

/// Drives the host's network stack through `ping` and `ip`.
#[derive(Debug, Default)]
pub struct SystemWifi;

impl SystemWifi {
    async fn run(program: &str, args: &[&str]) -> Result<std::process::Output> {
        debug!(program, ?args, "Running network command");
        Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| UplinkError::Driver(format!("{program}: {e}")))
    }
}

#[async_trait]
impl WifiDriver for SystemWifi {
    async fn loopback_reachable(&self) -> Result<bool> {
        let output = Self::run("ping", &["-c", "1", "127.0.0.1"]).await?;
        Ok(output.status.success())
    }

    async fn interface_addresses(&self) -> Result<Vec<InterfaceAddresses>> {
        let output = Self::run("ip", &["-o", "addr", "show"]).await?;
        Ok(parse_ip_addr(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn cycle_interface(&self, name: &str) -> Result<()> {
        for state in ["down", "up"] {
            let output = Self::run("sudo", &["ip", "link", "set", "dev", name, state]).await?;
            if !output.status.success() {
                return Err(UplinkError::Driver(format!(
                    "ip link set dev {name} {state}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }
        Ok(())
    }

    async fn ipv4_address(&self, name: &str) -> Result<Option<String>> {
        let output = Self::run("ip", &["-o", "-4", "addr", "show", "dev", name]).await?;
        Ok(parse_ipv4(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Hardware identity in the same form the configuration tool uses: the MAC
/// address of `interface` read as a 48-bit decimal integer.
pub fn hardware_identity(interface: &str) -> Option<String> {
    let path = Path::new("/sys/class/net").join(interface).join("address");
    let mac = std::fs::read_to_string(path).ok()?;
    mac_to_node_id(&mac)
}

pub fn mac_to_node_id(mac: &str) -> Option<String> {
    let hex: String = mac.trim().split(':').collect();
    if hex.len() != 12 {
        return None;
    }
    u64::from_str_radix(&hex, 16).ok().map(|n| n.to_string())
}
