use futures::future::BoxFuture;
use serde_json::json;

use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::state::{RiskAssessment, RiskLevel, StatePatch, WorkflowState};
use clinflow_core::types::{CompletionRequest, ToolCallRecord};

use super::fields::{list_field, str_field};
use super::{image_context, task_header, Capability, CapabilityContext, RISK};

/// Risk level, contributing factors and chronic conditions.
pub struct RiskAssessmentCapability;

fn parse_level(raw: Option<String>) -> RiskLevel {
    match raw.as_deref().map(str::to_ascii_uppercase).as_deref() {
        Some("HIGH") => RiskLevel::High,
        Some("LOW") => RiskLevel::Low,
        _ => RiskLevel::Moderate,
    }
}

impl RiskAssessmentCapability {
    pub(crate) fn prompt(state: &WorkflowState) -> String {
        let input = state.input();
        let assessment = state
            .clinical_assessment
            .as_ref()
            .and_then(|a| serde_json::to_string(a).ok())
            .unwrap_or_else(|| "{}".into());
        let mut screening = image_context(state);
        if !screening.is_empty() {
            screening.push_str("\nConsider this in your risk assessment, especially for malignancy risk factors.");
        }
        format!(
            "{}\nPATIENT: Context: {}\nVitals: {}, ASSESSMENT: {}, HISTORY: {}{}\n\n\
             Return JSON only: {{\"risk_level\": \"HIGH|MODERATE|LOW\", \"risk_factors\": [\"factor1\"], \
             \"chronic_conditions\": [\"condition1\"], \"recommendations\": [\"rec1\"]}}\n\nJSON:",
            task_header(RISK),
            input.patient_context,
            input.vitals_json(),
            assessment,
            input.medical_history.as_deref().unwrap_or("None provided"),
            screening,
        )
    }

    /// Shared with the combined risk and referral step.
    pub(crate) async fn assess(state: &WorkflowState, ctx: &CapabilityContext) -> Result<StatePatch> {
        let obj = ctx
            .invoke_json(RISK, CompletionRequest::text(Self::prompt(state)))
            .await?;
        let risk = RiskAssessment {
            level: parse_level(str_field(&obj, "risk_level")),
            risk_factors: list_field(&obj, "risk_factors"),
            chronic_conditions: list_field(&obj, "chronic_conditions"),
            recommendations: list_field(&obj, "recommendations"),
            fallback: false,
        };
        let summary = format!("Risk level: {:?}", risk.level);
        Ok(StatePatch {
            risk_assessment: Some(risk),
            ..StatePatch::new()
        }
        .with_message(format!("Risk assessment: {}", summary))
        .with_tool_call(ToolCallRecord::new(RISK, state.encounter_id(), summary)))
    }

    pub(crate) fn fallback_patch(state: &WorkflowState) -> StatePatch {
        StatePatch {
            risk_assessment: Some(RiskAssessment {
                level: RiskLevel::Moderate,
                risk_factors: vec!["Assessment error".into()],
                chronic_conditions: Vec::new(),
                recommendations: vec!["Manual risk review required".into()],
                fallback: true,
            }),
            ..StatePatch::new()
        }
        .with_message("Risk assessment failed; defaulting to MODERATE risk")
        .with_tool_call(ToolCallRecord {
            fallback: true,
            ..ToolCallRecord::new(RISK, state.encounter_id(), "fallback: MODERATE")
        })
    }
}

impl Capability for RiskAssessmentCapability {
    fn name(&self) -> &str {
        RISK
    }

    fn description(&self) -> &str {
        "Risk level, factors, chronic conditions"
    }

    fn use_when(&self) -> &str {
        "Patients with chronic conditions or risk factors"
    }

    fn is_complete(&self, state: &WorkflowState) -> bool {
        state.risk_assessment.is_some()
    }

    fn execute<'a>(
        &'a self,
        state: &'a WorkflowState,
        ctx: &'a CapabilityContext,
    ) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            ctx.step_start(
                state,
                RISK,
                "Calculating Health Risk Level",
                "Evaluating cardiovascular, readmission, and fall risks",
            );
            let patch = Self::assess(state, ctx).await?;
            let level = patch.risk_assessment.as_ref().map(|r| r.level);
            ctx.step_complete(state, RISK, "Health Risk Calculated", json!({ "risk_level": level }));
            Ok(patch)
        })
    }

    fn fallback(
        &self,
        state: &WorkflowState,
        error: &ClinflowError,
        ctx: &CapabilityContext,
    ) -> StatePatch {
        ctx.step_fallback(state, RISK, "Risk Assessment (Fallback)", error);
        Self::fallback_patch(state)
    }
}
