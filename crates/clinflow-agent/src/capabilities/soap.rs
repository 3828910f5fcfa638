use futures::future::BoxFuture;
use serde_json::json;

use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::state::{SoapNote, StatePatch, WorkflowState};
use clinflow_core::types::{CompletionRequest, ToolCallRecord};

use super::fields::{join_first, str_field};
use super::{task_header, Capability, CapabilityContext, DOCUMENTATION};

const NOT_DOCUMENTED: &str = "Not documented";

/// Structured SOAP note for the encounter record.
pub struct SoapNoteCapability;

impl SoapNoteCapability {
    fn prompt(state: &WorkflowState) -> String {
        let input = state.input();
        let assessment = match &state.clinical_assessment {
            Some(a) => {
                let mut summary = format!("Triage: {}", a.triage);
                if !a.differential_diagnoses.is_empty() {
                    summary.push_str(&format!(", Diagnoses: {}", join_first(&a.differential_diagnoses, 2)));
                }
                if !a.red_flags.is_empty() {
                    summary.push_str(&format!(", Red flags: {}", join_first(&a.red_flags, 2)));
                }
                summary
            }
            None => "Triage: ROUTINE".to_string(),
        };
        let treatment = match &state.treatment_plan {
            Some(plan) if !plan.medications.is_empty() => {
                format!("{} medications prescribed", plan.medications.len())
            }
            _ => "Not yet available".to_string(),
        };
        format!(
            "{}\nGenerate a structured SOAP note for this encounter.\n\n\
             ENCOUNTER INFORMATION:\nPatient: {}\nSymptoms: {}\nVitals: {}\nFollow-up: {}\n\n\
             CLINICAL ASSESSMENT:\n{}\n\n\
             TREATMENT:\n{}\n\n\
             Create a complete SOAP note with these 4 sections.\n\
             Return ONLY this JSON format:\n\
             {{\"subjective\": \"patient complaints and history\", \
             \"objective\": \"vital signs and exam findings\", \
             \"assessment\": \"clinical impression and diagnoses\", \
             \"plan\": \"treatment and follow-up plan\"}}\n\nJSON:",
            task_header(DOCUMENTATION),
            input.patient_context,
            input.symptoms,
            input.vitals_json(),
            state.follow_up_plan(),
            assessment,
            treatment,
        )
    }
}

impl Capability for SoapNoteCapability {
    fn name(&self) -> &str {
        DOCUMENTATION
    }

    fn description(&self) -> &str {
        "Structured SOAP note for documentation"
    }

    fn use_when(&self) -> &str {
        "End of workflow"
    }

    fn is_complete(&self, state: &WorkflowState) -> bool {
        state.soap_note.is_some()
    }

    fn execute<'a>(
        &'a self,
        state: &'a WorkflowState,
        ctx: &'a CapabilityContext,
    ) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            ctx.step_start(
                state,
                DOCUMENTATION,
                "Writing Clinical Notes",
                "Generating SOAP documentation for medical records",
            );
            let obj = ctx
                .invoke_json(DOCUMENTATION, CompletionRequest::text(Self::prompt(state)))
                .await?;

            let sections: Vec<Option<String>> = ["subjective", "objective", "assessment", "plan"]
                .iter()
                .map(|key| str_field(&obj, key))
                .collect();
            if sections.iter().all(Option::is_none) {
                return Err(ClinflowError::LlmParse("no SOAP sections in reply".into()));
            }
            let mut sections = sections
                .into_iter()
                .map(|s| s.unwrap_or_else(|| NOT_DOCUMENTED.to_string()));
            let note = SoapNote {
                subjective: sections.next().unwrap_or_default(),
                objective: sections.next().unwrap_or_default(),
                assessment: sections.next().unwrap_or_default(),
                plan: sections.next().unwrap_or_default(),
                fallback: false,
            };

            ctx.step_complete(state, DOCUMENTATION, "Clinical Notes Written", json!({}));
            let size = note.subjective.len() + note.objective.len() + note.assessment.len() + note.plan.len();
            Ok(StatePatch {
                soap_note: Some(note),
                ..StatePatch::new()
            }
            .with_message("SOAP note generated successfully")
            .with_tool_call(ToolCallRecord::new(
                DOCUMENTATION,
                format!("Documenting encounter {}", state.encounter_id()),
                format!("SOAP note: {} characters", size),
            )))
        })
    }

    fn fallback(
        &self,
        state: &WorkflowState,
        error: &ClinflowError,
        ctx: &CapabilityContext,
    ) -> StatePatch {
        ctx.step_fallback(state, DOCUMENTATION, "Clinical Notes (Fallback)", error);
        StatePatch {
            soap_note: Some(SoapNote {
                subjective: "Error".into(),
                objective: error.to_string(),
                assessment: "Manual documentation required".into(),
                plan: "Complete documentation manually".into(),
                fallback: true,
            }),
            ..StatePatch::new()
        }
        .with_message("WARNING: SOAP note generation failed; manual documentation needed")
        .with_tool_call(ToolCallRecord::new(
            DOCUMENTATION,
            format!("Documenting encounter {}", state.encounter_id()),
            "fallback",
        ))
    }
}
