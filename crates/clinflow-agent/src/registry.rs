use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::types::CapabilityDescriptor;

use crate::capabilities::{
    Capability, ClinicalAssessmentCapability, EmergencyProtocolCapability, ImageAnalysisCapability,
    ReferralDecisionCapability, RiskAssessmentCapability, RiskReferralCapability,
    SoapNoteCapability, TreatmentPlanCapability,
};

/// Registry of available capabilities, kept in registration order.
pub struct CapabilityRegistry {
    order: Vec<Arc<dyn Capability>>,
    index: HashMap<String, usize>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register a capability. A duplicate name replaces the earlier one in place.
    pub fn register(&mut self, capability: impl Capability) {
        self.register_arc(Arc::new(capability));
    }

    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        match self.index.get(&name) {
            Some(&slot) => {
                warn!(capability = %name, "Capability re-registered, replacing previous");
                self.order[slot] = capability;
            }
            None => {
                self.index.insert(name, self.order.len());
                self.order.push(capability);
            }
        }
    }

    /// Get a capability by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Capability>> {
        self.index
            .get(name)
            .map(|&slot| self.order[slot].clone())
            .ok_or_else(|| ClinflowError::CapabilityNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All capabilities in registration order.
    pub fn list(&self) -> &[Arc<dyn Capability>] {
        &self.order
    }

    pub fn names(&self) -> Vec<&str> {
        self.order.iter().map(|c| c.name()).collect()
    }

    /// Descriptors for the routing prompt.
    pub fn describe_all(&self) -> Vec<CapabilityDescriptor> {
        self.order.iter().map(|c| c.descriptor()).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Create a registry with the clinical capabilities registered.
    pub fn with_clinical_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(ClinicalAssessmentCapability);
        registry.register(EmergencyProtocolCapability);
        registry.register(RiskAssessmentCapability);
        registry.register(ReferralDecisionCapability);
        registry.register(TreatmentPlanCapability);
        registry.register(SoapNoteCapability);
        registry.register(ImageAnalysisCapability);
        registry.register(RiskReferralCapability);
        registry
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
