//! Pre-emergency confirmation gate.
//!
//! A run always pauses before the emergency protocol step. A health worker
//! then approves the protocol or rejects it with a justification.

use chrono::Utc;
use tracing::{info, warn};

use clinflow_core::state::{EmergencyGuidance, OverrideRecord, WorkflowState};
use clinflow_core::types::{Decision, ResumeRequest, Severity};

use crate::capabilities::EMERGENCY;

/// Whether the run must pause before invoking `step`.
pub fn requires_confirmation(step: &str) -> bool {
    step == EMERGENCY
}

/// Mark `state` as paused at the gate.
pub fn pause(state: &mut WorkflowState) {
    state.awaiting_confirmation = true;
    let triage = state.triage().map(|t| t.as_str()).unwrap_or("UNKNOWN");
    let red_flags = state
        .clinical_assessment
        .as_ref()
        .map(|a| a.red_flags.join(", "))
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| "none recorded".to_string());
    state.messages.push(format!(
        "EMERGENCY DETECTED: paused for confirmation (triage: {}, red flags: {})",
        triage, red_flags
    ));
}

/// Apply a human decision to a paused state.
///
/// Approve only clears the pause. Reject also clears the emergency flag,
/// lowers triage one level and records the override as the emergency guidance,
/// so the emergency guardrail cannot fire again.
pub fn apply_decision(state: &mut WorkflowState, request: &ResumeRequest) {
    let timestamp = Utc::now();
    state.awaiting_confirmation = false;

    match request.decision {
        Decision::Approve => {
            info!(run_id = %state.run_id(), "Emergency protocol approved");
            state.messages.push(format!(
                "APPROVED emergency protocol at {}: {}",
                timestamp.to_rfc3339(),
                request.justification
            ));
        }
        Decision::Reject => {
            warn!(run_id = %state.run_id(), "Emergency protocol rejected by health worker");
            let original_severity = state.triage().unwrap_or(Severity::HIGHEST);
            if let Some(assessment) = state.clinical_assessment.as_mut() {
                assessment.triage = assessment.triage.downgrade();
            }
            state.emergency = false;
            state.emergency_guidance = Some(EmergencyGuidance::Override(OverrideRecord {
                decision: Decision::Reject,
                justification: request.justification.clone(),
                timestamp,
                original_severity,
            }));
            state.messages.push(format!(
                "REJECTED emergency protocol at {}: {}",
                timestamp.to_rfc3339(),
                request.justification
            ));
        }
    }
}
