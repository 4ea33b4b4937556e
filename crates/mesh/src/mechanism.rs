//! Mechanism types, the per-instance registry, and the mechanism selector.
//!
//! Each transport technology is a [`MechanismType`] registered by name in a
//! [`MechanismRegistry`]. The registry is built once per manager and injected
//! into every stage that validates or negotiates mechanisms.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::{Mechanism, MechanismClass, MeshError, SidAllocator, VniAllocator};

/// Manager-private parameters injected for local endpoints.
pub mod workspace {
    /// Workspace identifier of the endpoint on this node.
    pub const WORKSPACE: &str = "workspace";
    /// Registered endpoint name inside the workspace.
    pub const WORKSPACE_NSE_NAME: &str = "workspaceNseName";

    /// Keys that only ever appear on the destination leg.
    pub const PRIVATE_PARAMETERS: [&str; 2] = [WORKSPACE, WORKSPACE_NSE_NAME];
}

/// Kernel interface mechanism.
pub mod kernel {
    /// Type name.
    pub const MECHANISM: &str = "KERNEL_INTERFACE";
    /// Interface name inside the workload namespace.
    pub const INTERFACE_NAME: &str = "name";
    /// Inode of the workload network namespace.
    pub const NETNS_INODE: &str = "netnsInode";
    /// Linux `IFNAMSIZ - 1`.
    pub const MAX_INTERFACE_NAME_LEN: usize = 15;
}

/// Shared-memory interface mechanism.
pub mod memif {
    /// Type name.
    pub const MECHANISM: &str = "MEM_INTERFACE";
    /// Interface name.
    pub const INTERFACE_NAME: &str = "name";
    /// Socket file relative to the workspace.
    pub const SOCKET_FILENAME: &str = "socketfile";
}

/// VXLAN tunnel mechanism.
pub mod vxlan {
    /// Type name.
    pub const MECHANISM: &str = "VXLAN";
    /// Tunnel source address.
    pub const SRC_IP: &str = "src_ip";
    /// Tunnel destination address.
    pub const DST_IP: &str = "dst_ip";
    /// Source address before NAT, if any.
    pub const SRC_ORIGINAL_IP: &str = "src_original_ip";
    /// Destination address as seen from outside, if any.
    pub const DST_EXTERNAL_IP: &str = "dst_external_ip";
    /// Virtual network identifier.
    pub const VNI: &str = "vni";
}

/// SRv6 segment-routing mechanism.
pub mod srv6 {
    /// Type name.
    pub const MECHANISM: &str = "SRV6";
    pub const SRC_HARDWARE_ADDRESS: &str = "src_hw_addr";
    pub const DST_HARDWARE_ADDRESS: &str = "dst_hw_addr";
    pub const SRC_HOST_IP: &str = "src_host_ip";
    pub const DST_HOST_IP: &str = "dst_host_ip";
    pub const SRC_HOST_LOCAL_SID: &str = "src_host_local_sid";
    pub const DST_HOST_LOCAL_SID: &str = "dst_host_local_sid";
    pub const SRC_BSID: &str = "src_bsid";
    pub const SRC_LOCAL_SID: &str = "src_local_sid";
    pub const DST_BSID: &str = "dst_bsid";
    pub const DST_LOCAL_SID: &str = "dst_local_sid";
}

// ---------------------------------------------------------------------------
// Mechanism type trait
// ---------------------------------------------------------------------------

/// Validation and negotiation rules for one mechanism type.
pub trait MechanismType: Send + Sync {
    /// Type name as carried in [`Mechanism::mechanism_type`].
    fn name(&self) -> &'static str;

    /// Class this type belongs to.
    fn class(&self) -> MechanismClass;

    /// Checks type-specific parameters.
    fn validate(&self, _mechanism: &Mechanism) -> Result<(), MeshError> {
        Ok(())
    }

    /// Derives the negotiated mechanism from the client preference and the
    /// forwarder's advertisement of the same type.
    fn negotiate(
        &self,
        preference: &Mechanism,
        _advertised: &Mechanism,
        _connection_id: &str,
    ) -> Result<Mechanism, MeshError> {
        Ok(preference.clone())
    }

    /// Returns `true` if the forwarder's advertisement no longer matches a
    /// previously negotiated mechanism.
    fn is_stale(&self, negotiated: &Mechanism, advertised: &Mechanism) -> bool {
        negotiated.mechanism_type != advertised.mechanism_type
            || advertised
                .parameters
                .iter()
                .any(|(k, v)| negotiated.parameter(k) != Some(v.as_str()))
    }
}

fn check_ip(mechanism: &Mechanism, key: &str) -> Result<(), MeshError> {
    if let Some(value) = mechanism.parameter(key) {
        value.parse::<IpAddr>().map_err(|e| {
            MeshError::validation(format!(
                "mechanism {} parameter {key}={value:?} is not an address: {e}",
                mechanism.mechanism_type
            ))
        })?;
    }
    Ok(())
}

fn required<'a>(mechanism: &'a Mechanism, key: &str) -> Result<&'a str, MeshError> {
    mechanism.parameter(key).ok_or_else(|| {
        MeshError::selection(format!(
            "forwarder advertised {} without the {key} parameter",
            mechanism.mechanism_type
        ))
    })
}

// ---------------------------------------------------------------------------
// Built-in types
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct KernelInterface;

impl MechanismType for KernelInterface {
    fn name(&self) -> &'static str {
        kernel::MECHANISM
    }

    fn class(&self) -> MechanismClass {
        MechanismClass::Local
    }

    fn validate(&self, mechanism: &Mechanism) -> Result<(), MeshError> {
        if let Some(inode) = mechanism.parameter(kernel::NETNS_INODE) {
            inode.parse::<u64>().map_err(|e| {
                MeshError::validation(format!(
                    "{} must be an unsigned integer, got {inode:?}: {e}",
                    kernel::NETNS_INODE
                ))
            })?;
        }
        if let Some(name) = mechanism.parameter(kernel::INTERFACE_NAME) {
            if name.len() > kernel::MAX_INTERFACE_NAME_LEN {
                return Err(MeshError::validation(format!(
                    "interface name {name:?} exceeds {} characters",
                    kernel::MAX_INTERFACE_NAME_LEN
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemInterface;

impl MechanismType for MemInterface {
    fn name(&self) -> &'static str {
        memif::MECHANISM
    }

    fn class(&self) -> MechanismClass {
        MechanismClass::Local
    }
}

/// VXLAN: destination address from the forwarder, VNI from the endpoint pair.
#[derive(Debug, Default)]
pub struct Vxlan {
    vnis: Arc<VniAllocator>,
}

impl Vxlan {
    pub fn new(vnis: Arc<VniAllocator>) -> Self {
        Self { vnis }
    }
}

impl MechanismType for Vxlan {
    fn name(&self) -> &'static str {
        vxlan::MECHANISM
    }

    fn class(&self) -> MechanismClass {
        MechanismClass::Remote
    }

    fn validate(&self, mechanism: &Mechanism) -> Result<(), MeshError> {
        for key in [
            vxlan::SRC_IP,
            vxlan::DST_IP,
            vxlan::SRC_ORIGINAL_IP,
            vxlan::DST_EXTERNAL_IP,
        ] {
            check_ip(mechanism, key)?;
        }
        if let Some(vni) = mechanism.parameter(vxlan::VNI) {
            let parsed = vni.parse::<u32>().map_err(|e| {
                MeshError::validation(format!("vni {vni:?} is not an integer: {e}"))
            })?;
            if parsed > crate::allocator::MAX_VNI {
                return Err(MeshError::validation(format!("vni {parsed} exceeds 24 bits")));
            }
        }
        Ok(())
    }

    fn negotiate(
        &self,
        preference: &Mechanism,
        advertised: &Mechanism,
        _connection_id: &str,
    ) -> Result<Mechanism, MeshError> {
        let forwarder_ip = required(advertised, vxlan::SRC_IP)?.to_string();
        let mut negotiated = preference.clone();
        negotiated.set_parameter(vxlan::DST_IP, forwarder_ip.clone());

        let requester_ip = preference.parameter(vxlan::SRC_IP).unwrap_or_default();
        let src_ip = preference
            .parameter(vxlan::SRC_ORIGINAL_IP)
            .unwrap_or(requester_ip);
        let ext_dst_ip = preference
            .parameter(vxlan::DST_EXTERNAL_IP)
            .unwrap_or(forwarder_ip.as_str());

        let vni = if ext_dst_ip != requester_ip {
            self.vnis.vni(ext_dst_ip, requester_ip)?
        } else {
            self.vnis.vni(&forwarder_ip, src_ip)?
        };
        negotiated.set_parameter(vxlan::VNI, vni.to_string());
        Ok(negotiated)
    }
}

/// SRv6: destination host fields from the forwarder, SIDs per connection id.
#[derive(Debug, Default)]
pub struct Srv6 {
    sids: Arc<SidAllocator>,
}

impl Srv6 {
    pub fn new(sids: Arc<SidAllocator>) -> Self {
        Self { sids }
    }
}

impl MechanismType for Srv6 {
    fn name(&self) -> &'static str {
        srv6::MECHANISM
    }

    fn class(&self) -> MechanismClass {
        MechanismClass::Remote
    }

    fn validate(&self, mechanism: &Mechanism) -> Result<(), MeshError> {
        for key in [
            srv6::SRC_HOST_IP,
            srv6::DST_HOST_IP,
            srv6::SRC_HOST_LOCAL_SID,
            srv6::DST_HOST_LOCAL_SID,
            srv6::SRC_BSID,
            srv6::SRC_LOCAL_SID,
            srv6::DST_BSID,
            srv6::DST_LOCAL_SID,
        ] {
            check_ip(mechanism, key)?;
        }
        Ok(())
    }

    fn negotiate(
        &self,
        preference: &Mechanism,
        advertised: &Mechanism,
        connection_id: &str,
    ) -> Result<Mechanism, MeshError> {
        let mut negotiated = preference.clone();
        for (dst, src) in [
            (srv6::DST_HARDWARE_ADDRESS, srv6::SRC_HARDWARE_ADDRESS),
            (srv6::DST_HOST_IP, srv6::SRC_HOST_IP),
            (srv6::DST_HOST_LOCAL_SID, srv6::SRC_HOST_LOCAL_SID),
        ] {
            negotiated.set_parameter(dst, required(advertised, src)?);
        }
        for key in [
            srv6::SRC_BSID,
            srv6::SRC_LOCAL_SID,
            srv6::DST_BSID,
            srv6::DST_LOCAL_SID,
        ] {
            let sid = self.sids.sid(&format!("{connection_id}/{key}"))?;
            negotiated.set_parameter(key, sid);
        }
        Ok(negotiated)
    }

    fn is_stale(&self, negotiated: &Mechanism, advertised: &Mechanism) -> bool {
        [
            (srv6::DST_HARDWARE_ADDRESS, srv6::SRC_HARDWARE_ADDRESS),
            (srv6::DST_HOST_IP, srv6::SRC_HOST_IP),
            (srv6::DST_HOST_LOCAL_SID, srv6::SRC_HOST_LOCAL_SID),
        ]
        .iter()
        .any(|(dst, src)| negotiated.parameter(dst) != advertised.parameter(src))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name-indexed set of mechanism types.
#[derive(Clone)]
pub struct MechanismRegistry {
    types: BTreeMap<&'static str, Arc<dyn MechanismType>>,
}

impl fmt::Debug for MechanismRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MechanismRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for MechanismRegistry {
    /// Kernel, memif, VXLAN, and SRv6 with fresh allocators.
    fn default() -> Self {
        Self::with_allocators(Arc::default(), Arc::default())
    }
}

impl MechanismRegistry {
    /// Empty registry.
    pub fn empty() -> Self {
        Self {
            types: BTreeMap::new(),
        }
    }

    /// Built-in types sharing the given allocators.
    pub fn with_allocators(vnis: Arc<VniAllocator>, sids: Arc<SidAllocator>) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(KernelInterface));
        registry.register(Arc::new(MemInterface));
        registry.register(Arc::new(Vxlan::new(vnis)));
        registry.register(Arc::new(Srv6::new(sids)));
        registry
    }

    /// Adds or replaces a type.
    pub fn register(&mut self, mechanism_type: Arc<dyn MechanismType>) {
        self.types.insert(mechanism_type.name(), mechanism_type);
    }

    /// Looks up a type by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn MechanismType>> {
        self.types.get(name)
    }

    fn resolve(&self, mechanism: &Mechanism) -> Result<&Arc<dyn MechanismType>, MeshError> {
        self.get(&mechanism.mechanism_type).ok_or_else(|| {
            MeshError::validation(format!(
                "unknown mechanism type {:?}",
                mechanism.mechanism_type
            ))
        })
    }

    /// Checks that the type is known, the class matches, and the parameters
    /// are acceptable.
    pub fn validate(&self, mechanism: &Mechanism) -> Result<(), MeshError> {
        let mechanism_type = self.resolve(mechanism)?;
        if mechanism_type.class() != mechanism.class {
            return Err(MeshError::validation(format!(
                "mechanism {} is {} but was sent as {}",
                mechanism.mechanism_type,
                mechanism_type.class(),
                mechanism.class
            )));
        }
        mechanism_type.validate(mechanism)
    }

    /// Returns `true` if the forwarder's current advertisement invalidates a
    /// previously negotiated mechanism. Unknown types are always stale.
    pub fn is_stale(&self, negotiated: &Mechanism, advertised: &Mechanism) -> bool {
        self.resolve(negotiated)
            .map(|t| t.is_stale(negotiated, advertised))
            .unwrap_or(true)
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Returns the first mechanism in `list` with the given type.
pub fn find_mechanism<'a>(list: &'a [Mechanism], mechanism_type: &str) -> Option<&'a Mechanism> {
    list.iter().find(|m| m.mechanism_type == mechanism_type)
}

/// First-match mechanism selection with an optional preferred type.
#[derive(Debug, Clone)]
pub struct MechanismSelector {
    registry: MechanismRegistry,
    preferred: Option<String>,
}

impl MechanismSelector {
    pub fn new(registry: MechanismRegistry, preferred: Option<String>) -> Self {
        Self {
            registry,
            preferred,
        }
    }

    /// Returns `true` if at least one preference is advertised.
    pub fn can_serve(&self, preferences: &[Mechanism], advertised: &[Mechanism]) -> bool {
        preferences
            .iter()
            .any(|p| find_mechanism(advertised, &p.mechanism_type).is_some())
    }

    /// Chooses and negotiates a mechanism for `connection_id`.
    ///
    /// The configured preferred type wins when both sides list it; otherwise
    /// the first client preference the forwarder also advertises is taken.
    pub fn select(
        &self,
        preferences: &[Mechanism],
        advertised: &[Mechanism],
        connection_id: &str,
    ) -> Result<Mechanism, MeshError> {
        let preferred = self.preferred.as_deref().and_then(|name| {
            Some((
                find_mechanism(preferences, name)?,
                find_mechanism(advertised, name)?,
            ))
        });
        let (preference, offer) = match preferred {
            Some(pair) => pair,
            None => preferences
                .iter()
                .find_map(|p| Some((p, find_mechanism(advertised, &p.mechanism_type)?)))
                .ok_or_else(|| {
                    MeshError::selection("failed to select mechanism, no matched mechanisms found")
                })?,
        };
        let mechanism_type = self.registry.resolve(preference)?;
        let negotiated = mechanism_type.negotiate(preference, offer, connection_id)?;
        tracing::debug!(
            mechanism = %negotiated.mechanism_type,
            connection_id,
            "mechanism selected"
        );
        Ok(negotiated)
    }
}
