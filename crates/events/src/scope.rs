use serde::{Deserialize, Serialize};

use tally_core::{DeviceId, TenantId};

/// Identity of one hash chain: a device writing on behalf of a tenant.
///
/// Ordering and integrity guarantees hold within a scope only. Chains of
/// different devices of the same tenant are independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainScope {
    pub device_id: DeviceId,
    pub tenant_id: TenantId,
}

impl ChainScope {
    pub fn new(device_id: DeviceId, tenant_id: TenantId) -> Self {
        Self {
            device_id,
            tenant_id,
        }
    }
}

impl core::fmt::Display for ChainScope {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.device_id)
    }
}

/// Marks types that belong to exactly one chain.
///
/// Ledgers, the sync worker and the ingest service use this to refuse messages
/// addressed to a chain other than the one they serve.
pub trait ChainScoped {
    fn chain_scope(&self) -> ChainScope;

    fn belongs_to(&self, scope: &ChainScope) -> bool {
        &self.chain_scope() == scope
    }
}

impl ChainScoped for ChainScope {
    fn chain_scope(&self) -> ChainScope {
        self.clone()
    }
}
