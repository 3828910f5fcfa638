use futures::future::BoxFuture;
use serde_json::json;
use tracing::warn;

use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::state::{ClinicalAssessment, StatePatch, WorkflowState};
use clinflow_core::types::{CompletionRequest, Severity, ToolCallRecord};

use super::fields::{join_first, list_field, str_field};
use super::{task_header, truncate, Capability, CapabilityContext, ASSESSMENT};

/// Triage, differential diagnosis, red flags and investigations.
pub struct ClinicalAssessmentCapability;

impl ClinicalAssessmentCapability {
    fn prompt(state: &WorkflowState) -> String {
        let input = state.input();
        format!(
            "{}\nPATIENT: {}, SYMPTOMS: {}, VITALS: {}, HISTORY: {}\n\n\
             Return JSON only: {{\"triage_level\": \"EMERGENCY|URGENT|ROUTINE\", \
             \"differential_diagnoses\": [\"dx1\",\"dx2\"], \"red_flags\": [\"flag1\"], \
             \"recommended_investigations\": [\"test1\"]}}\n\nJSON:",
            task_header(ASSESSMENT),
            input.patient_context,
            input.symptoms,
            input.vitals_json(),
            input.medical_history.as_deref().unwrap_or("None provided"),
        )
    }

    fn summarize(triage: Severity, diagnoses: &[String], red_flags: &[String]) -> String {
        let mut parts = Vec::new();
        if !diagnoses.is_empty() {
            parts.push(format!("Differential diagnoses include {}", join_first(diagnoses, 3)));
        }
        if !red_flags.is_empty() {
            parts.push(format!("Red flags: {}", join_first(red_flags, 3)));
        }
        if parts.is_empty() {
            format!("{} triage.", triage)
        } else {
            format!("{} triage. {}.", triage, parts.join(". "))
        }
    }
}

impl Capability for ClinicalAssessmentCapability {
    fn name(&self) -> &str {
        ASSESSMENT
    }

    fn description(&self) -> &str {
        "Triage, differential diagnosis, red flags, investigations"
    }

    fn use_when(&self) -> &str {
        "Start of workflow"
    }

    fn is_complete(&self, state: &WorkflowState) -> bool {
        state.clinical_assessment.is_some()
    }

    fn is_eligible(&self, _state: &WorkflowState) -> bool {
        true
    }

    fn execute<'a>(
        &'a self,
        state: &'a WorkflowState,
        ctx: &'a CapabilityContext,
    ) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            ctx.step_start(
                state,
                ASSESSMENT,
                "Checking Symptoms & Vitals",
                "AI reviewing symptoms, vitals, and identifying red flags",
            );

            let obj = ctx
                .invoke_json(ASSESSMENT, CompletionRequest::text(Self::prompt(state)))
                .await?;

            let raw = str_field(&obj, "triage_level")
                .ok_or_else(|| ClinflowError::LlmParse("triage_level missing".into()))?;
            let triage = raw.parse::<Severity>().unwrap_or_else(|_| {
                warn!(run_id = %state.run_id(), triage = %raw, "Unrecognised triage level, treating as URGENT");
                Severity::Urgent
            });
            let differential_diagnoses = list_field(&obj, "differential_diagnoses");
            let red_flags = list_field(&obj, "red_flags");
            let reasoning = Self::summarize(triage, &differential_diagnoses, &red_flags);

            ctx.step_complete(
                state,
                ASSESSMENT,
                "Symptoms & Vitals Checked",
                json!({ "triage_level": triage, "red_flags": red_flags }),
            );

            let assessment = ClinicalAssessment {
                triage,
                differential_diagnoses,
                red_flags,
                recommended_investigations: list_field(&obj, "recommended_investigations"),
                reasoning: reasoning.clone(),
                fallback: false,
            };
            Ok(StatePatch {
                clinical_assessment: Some(assessment),
                ..StatePatch::new()
            }
            .with_message(format!("Clinical assessment: {}", reasoning))
            .with_tool_call(ToolCallRecord::new(
                ASSESSMENT,
                truncate(&state.input().symptoms, 100),
                format!("triage: {}", triage),
            )))
        })
    }

    fn fallback(
        &self,
        state: &WorkflowState,
        error: &ClinflowError,
        ctx: &CapabilityContext,
    ) -> StatePatch {
        ctx.step_fallback(state, ASSESSMENT, "Symptoms Checked (Fallback)", error);
        StatePatch {
            clinical_assessment: Some(ClinicalAssessment {
                triage: Severity::Urgent,
                differential_diagnoses: Vec::new(),
                red_flags: vec!["Tool failure - manual assessment required".into()],
                recommended_investigations: Vec::new(),
                reasoning: format!("Assessment unavailable: {}", error),
                fallback: true,
            }),
            ..StatePatch::new()
        }
        .with_message("Clinical assessment failed; defaulting to URGENT triage")
        .with_tool_call(ToolCallRecord::new(
            ASSESSMENT,
            truncate(&state.input().symptoms, 100),
            "fallback: URGENT",
        ))
    }
}
