use futures::future::BoxFuture;
use serde_json::json;

use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::state::{
    EmergencyGuidance, EmergencyLevel, EmergencyProtocol, StatePatch, WorkflowState,
};
use clinflow_core::types::{CompletionRequest, ToolCallRecord};

use super::fields::{list_field, str_field};
use super::{task_header, truncate, Capability, CapabilityContext, EMERGENCY};

/// Immediate airway, breathing and circulation guidance for the health worker.
pub struct EmergencyProtocolCapability;

fn parse_level(raw: Option<String>) -> EmergencyLevel {
    match raw.as_deref().map(str::to_ascii_uppercase).as_deref() {
        Some("SEVERE") => EmergencyLevel::Severe,
        Some("MODERATE") => EmergencyLevel::Moderate,
        _ => EmergencyLevel::Critical,
    }
}

impl Capability for EmergencyProtocolCapability {
    fn name(&self) -> &str {
        EMERGENCY
    }

    fn description(&self) -> &str {
        "Immediate emergency guidance (ABC)"
    }

    fn use_when(&self) -> &str {
        "EMERGENCY triage or life-threatening cases only"
    }

    fn is_complete(&self, state: &WorkflowState) -> bool {
        state.emergency_guidance.is_some()
    }

    fn is_eligible(&self, state: &WorkflowState) -> bool {
        state.emergency && state.clinical_assessment.is_some()
    }

    fn execute<'a>(
        &'a self,
        state: &'a WorkflowState,
        ctx: &'a CapabilityContext,
    ) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            ctx.step_start(
                state,
                EMERGENCY,
                "Activating Emergency Protocol",
                "Generating immediate life-saving instructions",
            );

            let input = state.input();
            let prompt = format!(
                "{}\nSYMPTOMS: {}, VITALS: {}\n\n\
                 Return JSON only: {{\"emergency_level\": \"CRITICAL|SEVERE|MODERATE\", \
                 \"immediate_actions\": [\"action1\", \"action2\"], \
                 \"call_for_help\": \"who to call\", \"monitoring\": \"what to monitor\"}}\n\nJSON:",
                task_header(EMERGENCY),
                input.symptoms,
                input.vitals_json(),
            );
            let obj = ctx.invoke_json(EMERGENCY, CompletionRequest::text(prompt)).await?;

            let protocol = EmergencyProtocol {
                level: parse_level(str_field(&obj, "emergency_level")),
                immediate_actions: list_field(&obj, "immediate_actions"),
                call_for_help: str_field(&obj, "call_for_help").unwrap_or_default(),
                monitoring: str_field(&obj, "monitoring").unwrap_or_default(),
                fallback: false,
            };

            ctx.step_complete(
                state,
                EMERGENCY,
                "Emergency Protocol Ready",
                json!({ "emergency_level": protocol.level }),
            );

            let summary = format!(
                "Emergency protocol ({:?}): {}",
                protocol.level,
                protocol.immediate_actions.join("; ")
            );
            Ok(StatePatch {
                emergency_guidance: Some(EmergencyGuidance::Protocol(protocol)),
                ..StatePatch::new()
            }
            .with_message(summary.clone())
            .with_tool_call(ToolCallRecord::new(
                EMERGENCY,
                truncate(&input.symptoms, 100),
                truncate(&summary, 200),
            )))
        })
    }

    fn fallback(
        &self,
        state: &WorkflowState,
        error: &ClinflowError,
        ctx: &CapabilityContext,
    ) -> StatePatch {
        ctx.step_fallback(state, EMERGENCY, "Emergency Protocol (Fallback)", error);
        let protocol = EmergencyProtocol {
            level: EmergencyLevel::Critical,
            immediate_actions: vec![
                "Call emergency services immediately".into(),
                "Monitor airway, breathing, circulation".into(),
            ],
            call_for_help: "Call the local emergency number now".into(),
            monitoring: "Stay with patient, reassess vitals every 5 minutes".into(),
            fallback: true,
        };
        StatePatch {
            emergency_guidance: Some(EmergencyGuidance::Protocol(protocol)),
            ..StatePatch::new()
        }
        .with_message("Emergency protocol unavailable; call emergency services immediately")
        .with_tool_call(ToolCallRecord::new(
            EMERGENCY,
            truncate(&state.input().symptoms, 100),
            "fallback: CRITICAL",
        ))
    }
}
