use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::state::{Medication, StatePatch, TreatmentPlan, WorkflowState};
use clinflow_core::types::{CompletionRequest, ToolCallRecord};

use super::fields::{list_field, str_field};
use super::{image_context, task_header, Capability, CapabilityContext, TREATMENT};

/// Medications and care plan goals for the leading diagnosis.
pub struct TreatmentPlanCapability;

/// Medications arrive either as objects or as bare names.
fn medications(obj: &Map<String, Value>) -> Vec<Medication> {
    let Some(Value::Array(items)) = obj.get("medications") else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Object(m) => Some(Medication {
                name: str_field(m, "name")?,
                dose: str_field(m, "dose").unwrap_or_default(),
                frequency: str_field(m, "frequency").unwrap_or_default(),
            }),
            Value::String(name) if !name.trim().is_empty() => Some(Medication {
                name: name.trim().to_string(),
                dose: String::new(),
                frequency: String::new(),
            }),
            _ => None,
        })
        .collect()
}

impl TreatmentPlanCapability {
    fn prompt(state: &WorkflowState) -> String {
        let diagnosis = state
            .clinical_assessment
            .as_ref()
            .and_then(|a| a.differential_diagnoses.first())
            .map(String::as_str)
            .unwrap_or("Unknown");
        let mut lesion = image_context(state);
        if !lesion.is_empty() {
            lesion.push_str(
                "\nInclude appropriate follow-up schedule and self-monitoring education in care plan goals.",
            );
        }
        format!(
            "{}\nDIAGNOSIS: {}, PATIENT: {}{}\n\n\
             Return JSON only: {{\"medications\": [{{\"name\": \"drug\", \"dose\": \"amt\", \
             \"frequency\": \"freq\"}}], \"care_plan_goals\": [\"goal1\", \"goal2\"], \
             \"patient_education\": \"advice\"}}\n\nJSON:",
            task_header(TREATMENT),
            diagnosis,
            state.input().patient_context,
            lesion,
        )
    }
}

impl Capability for TreatmentPlanCapability {
    fn name(&self) -> &str {
        TREATMENT
    }

    fn description(&self) -> &str {
        "Medications and care plan goals"
    }

    fn use_when(&self) -> &str {
        "After diagnosis established"
    }

    fn is_complete(&self, state: &WorkflowState) -> bool {
        state.treatment_plan.is_some()
    }

    fn execute<'a>(
        &'a self,
        state: &'a WorkflowState,
        ctx: &'a CapabilityContext,
    ) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            ctx.step_start(
                state,
                TREATMENT,
                "Building Treatment Plan",
                "Creating medications, care goals, and patient education",
            );
            let obj = ctx
                .invoke_json(TREATMENT, CompletionRequest::text(Self::prompt(state)))
                .await?;

            let plan = TreatmentPlan {
                medications: medications(&obj),
                care_plan_goals: list_field(&obj, "care_plan_goals"),
                patient_education: str_field(&obj, "patient_education"),
                fallback: false,
            };
            ctx.step_complete(
                state,
                TREATMENT,
                "Treatment Plan Ready",
                json!({
                    "medications_count": plan.medications.len(),
                    "goals_count": plan.care_plan_goals.len(),
                }),
            );

            let summary = format!(
                "{} medications, {} goals",
                plan.medications.len(),
                plan.care_plan_goals.len()
            );
            Ok(StatePatch {
                treatment_plan: Some(plan),
                ..StatePatch::new()
            }
            .with_message(format!("Treatment plan: {}", summary))
            .with_tool_call(ToolCallRecord::new(TREATMENT, state.encounter_id(), summary)))
        })
    }

    fn fallback(
        &self,
        state: &WorkflowState,
        error: &ClinflowError,
        ctx: &CapabilityContext,
    ) -> StatePatch {
        ctx.step_fallback(state, TREATMENT, "Treatment Plan (Fallback)", error);
        StatePatch {
            treatment_plan: Some(TreatmentPlan {
                medications: Vec::new(),
                care_plan_goals: vec!["Manual treatment planning required".into()],
                patient_education: None,
                fallback: true,
            }),
            ..StatePatch::new()
        }
        .with_message("Treatment planning failed; manual planning required")
        .with_tool_call(ToolCallRecord::new(TREATMENT, state.encounter_id(), "fallback"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capabilities::test_support::{assessed, context};
    use clinflow_core::types::Severity;
    use clinflow_test_utils::{replies, routine_encounter, ScriptedBackend};

    #[tokio::test]
    async fn test_plan_uses_leading_diagnosis() {
        let backend =
            Arc::new(ScriptedBackend::new().reply(&task_header(TREATMENT), replies::TREATMENT));
        let ctx = context(backend.clone());
        let state = assessed(routine_encounter(), Severity::Routine);

        let plan = TreatmentPlanCapability
            .execute(&state, &ctx)
            .await
            .unwrap()
            .treatment_plan
            .unwrap();
        assert_eq!(plan.medications[0].name, "Paracetamol");
        assert_eq!(plan.care_plan_goals.len(), 2);
        assert!(backend.requests()[0].prompt.contains("DIAGNOSIS: Viral URTI"));
    }

    #[test]
    fn test_string_medications_accepted() {
        let obj = json!({"medications": ["Ibuprofen", {"dose": "no name"}, 3]});
        let meds = medications(obj.as_object().unwrap());
        assert_eq!(meds.len(), 1);
        assert_eq!(meds[0].name, "Ibuprofen");
    }

    #[test]
    fn test_unknown_diagnosis_without_assessment() {
        let state = WorkflowState::new(routine_encounter()).unwrap();
        assert!(TreatmentPlanCapability::prompt(&state).contains("DIAGNOSIS: Unknown"));
    }
}
