//! Connection context payload: IP addressing, routes, DNS, and ethernet.
//!
//! The context is owned jointly by the requester and the responding endpoint.
//! The requester declares what it needs (`src_ip_required`, ...); the endpoint
//! fills it in. A context is always replaced wholesale, see
//! [`crate::Connection::update_context`].

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::MeshError;

/// A route prefix in CIDR notation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination prefix, e.g. `"10.60.1.0/24"`.
    pub prefix: String,
}

/// A static neighbour entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpNeighbor {
    /// Neighbour IP address.
    pub ip: String,
    /// Neighbour hardware address.
    pub hardware_address: String,
}

/// Addressing and routing requirements for both ends of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpContext {
    /// Source interface address in CIDR notation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_ip_addr: Option<String>,
    /// Destination interface address in CIDR notation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_ip_addr: Option<String>,
    /// The requester needs a source address assigned.
    #[serde(default)]
    pub src_ip_required: bool,
    /// The requester needs a destination address assigned.
    #[serde(default)]
    pub dst_ip_required: bool,
    /// Routes installed on the source side.
    #[serde(default)]
    pub src_routes: Vec<Route>,
    /// Routes installed on the destination side.
    #[serde(default)]
    pub dst_routes: Vec<Route>,
    /// Prefixes the endpoint must not hand out.
    #[serde(default)]
    pub excluded_prefixes: Vec<String>,
    /// Static neighbour entries.
    #[serde(default)]
    pub ip_neighbors: Vec<IpNeighbor>,
}

/// One DNS resolver configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Resolver addresses.
    #[serde(default)]
    pub dns_server_ips: Vec<String>,
    /// Search domains.
    #[serde(default)]
    pub search_domains: Vec<String>,
}

/// DNS settings pushed to the client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsContext {
    /// Resolver configurations in priority order.
    #[serde(default)]
    pub configs: Vec<DnsConfig>,
}

/// Layer-2 addressing of both interfaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthernetContext {
    /// Source MAC address.
    #[serde(default)]
    pub src_mac: String,
    /// Destination MAC address.
    #[serde(default)]
    pub dst_mac: String,
}

/// Opaque-to-the-pipeline payload negotiated between client and endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionContext {
    /// IP addressing and routes.
    #[serde(default)]
    pub ip: IpContext,
    /// DNS configuration.
    #[serde(default)]
    pub dns: DnsContext,
    /// Ethernet addressing, usually filled in by the forwarder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ethernet: Option<EthernetContext>,
}

impl ConnectionContext {
    /// Checks that `self` satisfies the requirements declared in `original`.
    pub fn meets_requirements(&self, original: &ConnectionContext) -> Result<(), MeshError> {
        if original.ip.src_ip_required && self.ip.src_ip_addr.is_none() {
            return Err(MeshError::invariant(
                "connection context requires a source address, none was provided",
            ));
        }
        if original.ip.dst_ip_required && self.ip.dst_ip_addr.is_none() {
            return Err(MeshError::invariant(
                "connection context requires a destination address, none was provided",
            ));
        }
        Ok(())
    }

    /// Checks that every address, prefix, and neighbour is well-formed.
    pub fn validate(&self) -> Result<(), MeshError> {
        let ip = &self.ip;
        for (field, value) in [("src_ip_addr", &ip.src_ip_addr), ("dst_ip_addr", &ip.dst_ip_addr)] {
            if let Some(addr) = value {
                parse_cidr(addr).map_err(|e| {
                    MeshError::invariant(format!("context.ip.{field} {addr:?} is invalid: {e}"))
                })?;
            }
        }
        for route in ip.src_routes.iter().chain(&ip.dst_routes) {
            if route.prefix.is_empty() {
                return Err(MeshError::invariant(
                    "context route prefix is required and cannot be empty",
                ));
            }
            parse_cidr(&route.prefix).map_err(|e| {
                MeshError::invariant(format!("context route {:?} is invalid: {e}", route.prefix))
            })?;
        }
        for prefix in &ip.excluded_prefixes {
            parse_cidr(prefix).map_err(|e| {
                MeshError::invariant(format!("excluded prefix {prefix:?} is invalid: {e}"))
            })?;
        }
        for neighbor in &ip.ip_neighbors {
            if neighbor.ip.is_empty() || neighbor.hardware_address.is_empty() {
                return Err(MeshError::invariant(
                    "context neighbour needs both an ip and a hardware address",
                ));
            }
        }
        Ok(())
    }
}

/// Parses `addr/len` and checks the prefix length against the address family.
pub fn parse_cidr(value: &str) -> Result<(IpAddr, u8), String> {
    let (addr, len) = value
        .split_once('/')
        .ok_or_else(|| "missing prefix length".to_string())?;
    let addr: IpAddr = addr.parse().map_err(|e| format!("{e}"))?;
    let len: u8 = len.parse().map_err(|e| format!("prefix length: {e}"))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if len > max {
        return Err(format!("prefix length {len} exceeds {max}"));
    }
    Ok((addr, len))
}
