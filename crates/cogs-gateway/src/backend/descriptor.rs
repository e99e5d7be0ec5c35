//! Backend Descriptor and Selection Policy. Descriptors are created at
//! startup from configuration and mutated only by the router.

use std::time::Instant;

use crate::capability::Capability;

/// `{id, capability, is_primary, is_available, last_health_check,
/// policy_weight}`. The router is the sole mutator; readers observe
/// through `BackendRouter::snapshot`.
#[derive(Debug, Clone)]
pub struct BackendDescriptor {
    pub id: String,
    pub capability: Capability,
    pub is_primary: bool,
    pub is_available: bool,
    pub last_health_check: Option<Instant>,
    pub policy_weight: u32,
    pub(crate) consecutive_failures: u32,
    pub(crate) unavailable_since: Option<Instant>,
}

impl BackendDescriptor {
    pub fn new(id: impl Into<String>, capability: Capability, is_primary: bool, policy_weight: u32) -> Self {
        BackendDescriptor {
            id: id.into(),
            capability,
            is_primary,
            is_available: true,
            last_health_check: None,
            policy_weight,
            consecutive_failures: 0,
            unavailable_since: None,
        }
    }
}

/// Per-capability ordered backend list plus strict/fallback mode.
#[derive(Debug, Clone)]
pub struct SelectionPolicy {
    pub order: Vec<String>,
    pub fallback_enabled: bool,
}

impl SelectionPolicy {
    pub fn new(order: Vec<String>, fallback_enabled: bool) -> Self {
        SelectionPolicy {
            order,
            fallback_enabled,
        }
    }
}
