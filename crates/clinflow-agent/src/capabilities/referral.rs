use futures::future::BoxFuture;
use serde_json::json;

use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::state::{ReferralDecision, ReferralUrgency, StatePatch, WorkflowState};
use clinflow_core::types::{CompletionRequest, ToolCallRecord};

use super::fields::{bool_field, str_field};
use super::{image_context, task_header, Capability, CapabilityContext, REFERRAL};

/// Whether the patient needs a specialist, which one, and how soon.
pub struct ReferralDecisionCapability;

fn parse_urgency(raw: Option<String>) -> ReferralUrgency {
    match raw.as_deref().map(str::to_ascii_uppercase).as_deref() {
        Some("IMMEDIATE") | Some("EMERGENCY") => ReferralUrgency::Immediate,
        Some("URGENT") => ReferralUrgency::Urgent,
        _ => ReferralUrgency::Routine,
    }
}

fn urgency_label(urgency: ReferralUrgency) -> &'static str {
    match urgency {
        ReferralUrgency::Routine => "ROUTINE",
        ReferralUrgency::Urgent => "URGENT",
        ReferralUrgency::Immediate => "IMMEDIATE",
    }
}

pub(crate) fn referral_reasoning(needed: bool, referral_type: &str, urgency: ReferralUrgency) -> String {
    if needed {
        format!("{} referral to {} recommended.", urgency_label(urgency), referral_type)
    } else {
        "No referral needed. Manageable at primary care level.".to_string()
    }
}

impl ReferralDecisionCapability {
    pub(crate) fn prompt(state: &WorkflowState) -> String {
        let assessment = state
            .clinical_assessment
            .as_ref()
            .and_then(|a| serde_json::to_string(a).ok())
            .unwrap_or_else(|| "{}".into());
        let mut screening = image_context(state);
        if !screening.is_empty() {
            screening.push_str(
                "\nIf malignant or low confidence, URGENT dermatology/oncology referral is needed.",
            );
        }
        format!(
            "{}\nASSESSMENT: {}, FACILITIES: General Hospital{}\n\n\
             Return JSON only: {{\"referral_needed\": true, \"referral_type\": \"specialty\", \
             \"referral_urgency\": \"IMMEDIATE|URGENT|ROUTINE\"}}\n\nJSON:",
            task_header(REFERRAL),
            assessment,
            screening,
        )
    }

    /// Shared with the combined risk and referral step.
    pub(crate) async fn decide(state: &WorkflowState, ctx: &CapabilityContext) -> Result<StatePatch> {
        let obj = ctx
            .invoke_json(REFERRAL, CompletionRequest::text(Self::prompt(state)))
            .await?;
        let needed = bool_field(&obj, "referral_needed")
            .ok_or_else(|| ClinflowError::LlmParse("referral_needed missing".into()))?;
        let referral_type = str_field(&obj, "referral_type").unwrap_or_else(|| "General".into());
        let urgency = parse_urgency(str_field(&obj, "referral_urgency"));
        let reasoning = referral_reasoning(needed, &referral_type, urgency);

        let input_summary = format!(
            "Referral decision for triage: {}",
            state.triage().map(|t| t.as_str()).unwrap_or("UNKNOWN")
        );
        let output_summary = format!("Needed: {}, Type: {}", needed, referral_type);
        Ok(StatePatch {
            referral_decision: Some(ReferralDecision {
                needed,
                referral_type,
                urgency,
                reasoning,
                fallback: false,
            }),
            ..StatePatch::new()
        }
        .with_message(format!("Referral: {}", if needed { "Required" } else { "Not needed" }))
        .with_tool_call(ToolCallRecord::new(REFERRAL, input_summary, output_summary)))
    }

    pub(crate) fn fallback_patch(state: &WorkflowState) -> StatePatch {
        let urgency = ReferralUrgency::Routine;
        StatePatch {
            referral_decision: Some(ReferralDecision {
                needed: true,
                referral_type: "General".into(),
                urgency,
                reasoning: referral_reasoning(true, "General", urgency),
                fallback: true,
            }),
            ..StatePatch::new()
        }
        .with_message("Referral decision failed; referring by default")
        .with_tool_call(ToolCallRecord {
            fallback: true,
            ..ToolCallRecord::new(REFERRAL, state.encounter_id(), "fallback: Needed: true, Type: General")
        })
    }
}

impl Capability for ReferralDecisionCapability {
    fn name(&self) -> &str {
        REFERRAL
    }

    fn description(&self) -> &str {
        "Referral decision, type, urgency"
    }

    fn use_when(&self) -> &str {
        "When beyond primary care scope or red flags present"
    }

    fn is_complete(&self, state: &WorkflowState) -> bool {
        state.referral_decision.is_some()
    }

    fn execute<'a>(
        &'a self,
        state: &'a WorkflowState,
        ctx: &'a CapabilityContext,
    ) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            ctx.step_start(
                state,
                REFERRAL,
                "Checking if Specialist is Needed",
                "Deciding urgency and type of specialist referral",
            );
            let patch = Self::decide(state, ctx).await?;
            if let Some(decision) = &patch.referral_decision {
                ctx.step_complete(
                    state,
                    REFERRAL,
                    "Referral Decision Made",
                    json!({
                        "referral_needed": decision.needed,
                        "referral_type": decision.referral_type,
                        "referral_urgency": decision.urgency,
                    }),
                );
            }
            Ok(patch)
        })
    }

    fn fallback(
        &self,
        state: &WorkflowState,
        error: &ClinflowError,
        ctx: &CapabilityContext,
    ) -> StatePatch {
        ctx.step_fallback(state, REFERRAL, "Referral Decision (Fallback)", error);
        Self::fallback_patch(state)
    }
}
