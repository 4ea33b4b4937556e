//! Connection context plugins.

use std::net::IpAddr;
use std::sync::Arc;

use crate::context::parse_cidr;
use crate::{Connection, ConnectionContext, ConnectionPlugin, MeshError};

/// Plugins applied in registration order.
#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn ConnectionPlugin>>,
}

impl std::fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name().to_string()))
            .finish()
    }
}

impl PluginChain {
    pub fn new(plugins: Vec<Arc<dyn ConnectionPlugin>>) -> Self {
        Self { plugins }
    }

    pub fn push(&mut self, plugin: Arc<dyn ConnectionPlugin>) {
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Runs every `enrich` hook; the first failure wins.
    pub fn enrich(&self, context: &mut ConnectionContext) -> Result<(), MeshError> {
        for plugin in &self.plugins {
            plugin
                .enrich(context)
                .map_err(|e| e.with_context(&format!("plugin {}", plugin.name())))?;
        }
        Ok(())
    }

    /// Runs every `validate` hook; the first failure wins.
    pub fn validate(&self, connection: &Connection) -> Result<(), MeshError> {
        for plugin in &self.plugins {
            plugin
                .validate(connection)
                .map_err(|e| e.with_context(&format!("plugin {}", plugin.name())))?;
        }
        Ok(())
    }
}

/// Keeps endpoints from assigning addresses out of reserved ranges
/// (cluster pod and service CIDRs, typically).
#[derive(Debug, Clone)]
pub struct ExcludedPrefixes {
    prefixes: Vec<String>,
}

impl ExcludedPrefixes {
    /// Fails if any prefix is not valid CIDR.
    pub fn new<I, S>(prefixes: I) -> Result<Self, MeshError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefixes: Vec<String> = prefixes.into_iter().map(Into::into).collect();
        for prefix in &prefixes {
            parse_cidr(prefix).map_err(|e| {
                MeshError::configuration(format!("excluded prefix {prefix:?}: {e}"))
            })?;
        }
        Ok(Self { prefixes })
    }
}

fn contains(prefix: &str, addr: IpAddr) -> bool {
    let Ok((network, len)) = parse_cidr(prefix) else {
        return false;
    };
    match (network, addr) {
        (IpAddr::V4(n), IpAddr::V4(a)) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(len)).unwrap_or(0);
            u32::from(n) & mask == u32::from(a) & mask
        }
        (IpAddr::V6(n), IpAddr::V6(a)) => {
            let mask = u128::MAX.checked_shl(128 - u32::from(len)).unwrap_or(0);
            u128::from(n) & mask == u128::from(a) & mask
        }
        _ => false,
    }
}

impl ConnectionPlugin for ExcludedPrefixes {
    fn name(&self) -> &str {
        "excluded_prefixes"
    }

    fn enrich(&self, context: &mut ConnectionContext) -> Result<(), MeshError> {
        for prefix in &self.prefixes {
            if !context.ip.excluded_prefixes.contains(prefix) {
                context.ip.excluded_prefixes.push(prefix.clone());
            }
        }
        Ok(())
    }

    fn validate(&self, connection: &Connection) -> Result<(), MeshError> {
        let ip = &connection.context.ip;
        for addr in [&ip.src_ip_addr, &ip.dst_ip_addr].into_iter().flatten() {
            let Ok((parsed, _)) = parse_cidr(addr) else {
                continue;
            };
            if let Some(prefix) = self.prefixes.iter().find(|p| contains(p, parsed)) {
                return Err(MeshError::invariant(format!(
                    "address {addr} assigned by the endpoint is inside excluded prefix {prefix}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enrich_adds_prefixes_once() {
        let plugin = ExcludedPrefixes::new(["10.96.0.0/12"]).unwrap();
        let mut context = ConnectionContext::default();
        plugin.enrich(&mut context).unwrap();
        plugin.enrich(&mut context).unwrap();
        assert_eq!(context.ip.excluded_prefixes, vec!["10.96.0.0/12".to_string()]);
    }

    #[test]
    fn addresses_inside_excluded_prefix_are_rejected() {
        let plugin = ExcludedPrefixes::new(["10.96.0.0/12"]).unwrap();
        let mut connection = Connection::new("svc");
        connection.context.ip.src_ip_addr = Some("10.100.1.1/32".into());
        assert!(plugin.validate(&connection).is_err());
        connection.context.ip.src_ip_addr = Some("172.16.1.1/32".into());
        assert!(plugin.validate(&connection).is_ok());
    }

    #[test]
    fn malformed_prefix_is_a_configuration_error() {
        let err = ExcludedPrefixes::new(["nonsense"]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }
}
