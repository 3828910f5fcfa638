//! Run data container.
//!
//! A `WorkflowState` holds the immutable encounter inputs, one output slot per
//! capability, the orchestrator's control fields, and three append-only logs.
//! Capabilities never touch it directly: they return a `StatePatch`, which the
//! runtime folds in with [`WorkflowState::apply`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ClinflowError, Result};
use crate::types::{
    Decision, ImageKind, NextStep, ReasoningEntry, RunId, Severity, ToolCallRecord,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalSign {
    pub value: serde_json::Value,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRef {
    pub path: String,
    #[serde(default)]
    pub kind: ImageKind,
}

/// Encounter data assembled by the surrounding application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncounterInput {
    pub encounter_id: String,
    #[serde(default)]
    pub patient_id: String,
    #[serde(default)]
    pub patient_context: String,
    pub symptoms: String,
    #[serde(default)]
    pub vitals: BTreeMap<String, VitalSign>,
    #[serde(default)]
    pub medical_history: Option<String>,
    #[serde(default)]
    pub image: Option<ImageRef>,
}

impl EncounterInput {
    pub fn validate(&self) -> Result<()> {
        if self.encounter_id.trim().is_empty() {
            return Err(ClinflowError::InvalidInput("encounter_id is empty".into()));
        }
        if self.symptoms.trim().is_empty() {
            return Err(ClinflowError::InvalidInput("symptoms are empty".into()));
        }
        if let Some(image) = &self.image {
            if image.path.trim().is_empty() {
                return Err(ClinflowError::InvalidInput("image path is empty".into()));
            }
        }
        Ok(())
    }

    /// Vitals as a compact JSON object for prompts.
    pub fn vitals_json(&self) -> String {
        serde_json::to_string(&self.vitals).unwrap_or_else(|_| "{}".to_string())
    }
}

// ── Capability outputs ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClinicalAssessment {
    pub triage: Severity,
    #[serde(default)]
    pub differential_diagnoses: Vec<String>,
    #[serde(default)]
    pub red_flags: Vec<String>,
    #[serde(default)]
    pub recommended_investigations: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EmergencyLevel {
    Critical,
    Severe,
    Moderate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyProtocol {
    pub level: EmergencyLevel,
    #[serde(default)]
    pub immediate_actions: Vec<String>,
    #[serde(default)]
    pub call_for_help: String,
    #[serde(default)]
    pub monitoring: String,
    #[serde(default)]
    pub fallback: bool,
}

/// Human decision that replaced the emergency protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub decision: Decision,
    pub justification: String,
    pub timestamp: DateTime<Utc>,
    pub original_severity: Severity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmergencyGuidance {
    Protocol(EmergencyProtocol),
    Override(OverrideRecord),
}

impl EmergencyGuidance {
    pub fn override_record(&self) -> Option<&OverrideRecord> {
        match self {
            EmergencyGuidance::Override(record) => Some(record),
            EmergencyGuidance::Protocol(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    #[serde(default)]
    pub risk_factors: Vec<String>,
    #[serde(default)]
    pub chronic_conditions: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReferralUrgency {
    Routine,
    Urgent,
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralDecision {
    pub needed: bool,
    #[serde(default)]
    pub referral_type: String,
    pub urgency: ReferralUrgency,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Medication {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dose: String,
    #[serde(default)]
    pub frequency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreatmentPlan {
    #[serde(default)]
    pub medications: Vec<Medication>,
    #[serde(default)]
    pub care_plan_goals: Vec<String>,
    #[serde(default)]
    pub patient_education: Option<String>,
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoapNote {
    pub subjective: String,
    pub objective: String,
    pub assessment: String,
    pub plan: String,
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LesionClass {
    Benign,
    Malignant,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAnalysis {
    pub classification: LesionClass,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub monitoring_recommendation: String,
    pub requires_referral: bool,
    pub urgent: bool,
    #[serde(default)]
    pub fallback: bool,
}

// ── Patch ───────────────────────────────────────────────────────

/// Output of one capability invocation.
///
/// Output slots are last-write-wins; `messages` and `tool_calls` append.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub clinical_assessment: Option<ClinicalAssessment>,
    pub emergency_guidance: Option<EmergencyGuidance>,
    pub risk_assessment: Option<RiskAssessment>,
    pub referral_decision: Option<ReferralDecision>,
    pub treatment_plan: Option<TreatmentPlan>,
    pub soap_note: Option<SoapNote>,
    pub image_analysis: Option<ImageAnalysis>,
    pub messages: Vec<String>,
    pub tool_calls: Vec<ToolCallRecord>,
}

impl StatePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    pub fn with_tool_call(mut self, record: ToolCallRecord) -> Self {
        self.tool_calls.push(record);
        self
    }

    /// Combine two patches, `other` winning on output slots.
    pub fn merge(mut self, other: StatePatch) -> StatePatch {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            clinical_assessment,
            emergency_guidance,
            risk_assessment,
            referral_decision,
            treatment_plan,
            soap_note,
            image_analysis
        );
        self.messages.extend(other.messages);
        self.tool_calls.extend(other.tool_calls);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clinical_assessment.is_none()
            && self.emergency_guidance.is_none()
            && self.risk_assessment.is_none()
            && self.referral_decision.is_none()
            && self.treatment_plan.is_none()
            && self.soap_note.is_none()
            && self.image_analysis.is_none()
            && self.messages.is_empty()
            && self.tool_calls.is_empty()
    }
}

// ── State ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    run_id: RunId,
    input: EncounterInput,

    pub clinical_assessment: Option<ClinicalAssessment>,
    pub emergency_guidance: Option<EmergencyGuidance>,
    pub risk_assessment: Option<RiskAssessment>,
    pub referral_decision: Option<ReferralDecision>,
    pub treatment_plan: Option<TreatmentPlan>,
    pub soap_note: Option<SoapNote>,
    pub image_analysis: Option<ImageAnalysis>,

    pub next_step: NextStep,
    pub complete: bool,
    pub emergency: bool,
    pub referral_needed: bool,
    pub awaiting_confirmation: bool,

    pub messages: Vec<String>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub reasoning: Vec<ReasoningEntry>,
}

impl WorkflowState {
    /// Validate the encounter and create a fresh run for it.
    pub fn new(input: EncounterInput) -> Result<Self> {
        input.validate()?;
        let run_id = RunId::for_encounter(&input.encounter_id);
        Ok(Self::with_run_id(run_id, input))
    }

    pub(crate) fn with_run_id(run_id: RunId, input: EncounterInput) -> Self {
        Self {
            run_id,
            input,
            clinical_assessment: None,
            emergency_guidance: None,
            risk_assessment: None,
            referral_decision: None,
            treatment_plan: None,
            soap_note: None,
            image_analysis: None,
            next_step: NextStep::default(),
            complete: false,
            emergency: false,
            referral_needed: false,
            awaiting_confirmation: false,
            messages: Vec::new(),
            tool_calls: Vec::new(),
            reasoning: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.run_id.as_str().is_empty() {
            return Err(ClinflowError::InvalidInput("run_id is empty".into()));
        }
        self.input.validate()
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn input(&self) -> &EncounterInput {
        &self.input
    }

    pub fn encounter_id(&self) -> &str {
        &self.input.encounter_id
    }

    pub fn has_image(&self) -> bool {
        self.input.image.is_some()
    }

    pub fn triage(&self) -> Option<Severity> {
        self.clinical_assessment.as_ref().map(|a| a.triage)
    }

    /// Whether a human has replaced the emergency protocol.
    pub fn has_override(&self) -> bool {
        self.emergency_guidance
            .as_ref()
            .and_then(EmergencyGuidance::override_record)
            .is_some()
    }

    /// Fold a capability patch into the state.
    ///
    /// Terminal states are frozen; the patch is dropped with a warning.
    pub fn apply(&mut self, patch: StatePatch) {
        if self.complete {
            warn!(run_id = %self.run_id, "Ignoring patch on completed run");
            return;
        }
        macro_rules! put {
            ($($field:ident),*) => {
                $(if patch.$field.is_some() { self.$field = patch.$field; })*
            };
        }
        put!(
            clinical_assessment,
            emergency_guidance,
            risk_assessment,
            referral_decision,
            treatment_plan,
            soap_note,
            image_analysis
        );
        self.messages.extend(patch.messages);
        self.tool_calls.extend(patch.tool_calls);
    }

    /// Capability names in invocation order, from the tool-call log.
    pub fn capability_history(&self) -> Vec<&str> {
        self.tool_calls.iter().map(|c| c.capability.as_str()).collect()
    }

    pub fn follow_up_plan(&self) -> &'static str {
        if self.referral_needed {
            "Follow up after specialist consultation"
        } else {
            "Follow up in 1-2 weeks or if symptoms worsen"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> EncounterInput {
        EncounterInput {
            encounter_id: "enc-1".into(),
            patient_id: "pat-1".into(),
            patient_context: "Age: 40, Gender: female".into(),
            symptoms: "headache".into(),
            ..Default::default()
        }
    }

    fn assessment(triage: Severity) -> ClinicalAssessment {
        ClinicalAssessment {
            triage,
            differential_diagnoses: vec!["Tension headache".into()],
            red_flags: vec![],
            recommended_investigations: vec![],
            reasoning: String::new(),
            fallback: false,
        }
    }

    #[test]
    fn test_new_rejects_empty_symptoms() {
        let mut bad = input();
        bad.symptoms = "   ".into();
        assert!(matches!(
            WorkflowState::new(bad),
            Err(ClinflowError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_new_derives_run_id_from_encounter() {
        let input = input();
        let encounter = input.encounter_id.clone();
        let a = WorkflowState::new(input.clone()).unwrap();
        let b = WorkflowState::new(input).unwrap();
        assert!(a.run_id().as_str().starts_with(&format!("{}-", encounter)));
        assert_ne!(a.run_id(), b.run_id());
        assert!(a.tool_calls.is_empty() && !a.complete);
    }

    #[test]
    fn test_apply_appends_logs() {
        let mut state = WorkflowState::new(input()).unwrap();
        state.apply(
            StatePatch::new()
                .with_message("one")
                .with_tool_call(ToolCallRecord::new("clinical_assessment", "in", "out")),
        );
        state.apply(StatePatch::new().with_message("two"));
        assert_eq!(state.messages, vec!["one", "two"]);
        assert_eq!(state.capability_history(), vec!["clinical_assessment"]);
    }

    #[test]
    fn test_apply_ignored_after_completion() {
        let mut state = WorkflowState::new(input()).unwrap();
        state.complete = true;
        let patch = StatePatch {
            clinical_assessment: Some(assessment(Severity::Routine)),
            ..Default::default()
        };
        state.apply(patch.with_message("late"));
        assert!(state.clinical_assessment.is_none());
        assert!(state.messages.is_empty());
    }

    #[test]
    fn test_merge_keeps_both_outputs() {
        let a = StatePatch {
            clinical_assessment: Some(assessment(Severity::Urgent)),
            ..Default::default()
        }
        .with_message("a");
        let b = StatePatch::new().with_message("b");
        let merged = a.merge(b);
        assert!(merged.clinical_assessment.is_some());
        assert_eq!(merged.messages, vec!["a", "b"]);
    }

    #[test]
    fn test_follow_up_plan() {
        let mut state = WorkflowState::new(input()).unwrap();
        assert_eq!(state.follow_up_plan(), "Follow up in 1-2 weeks or if symptoms worsen");
        state.referral_needed = true;
        assert_eq!(state.follow_up_plan(), "Follow up after specialist consultation");
    }

    #[test]
    fn test_state_serde_round_trip() {
        let mut state = WorkflowState::new(input()).unwrap();
        state.clinical_assessment = Some(assessment(Severity::Emergency));
        let json = serde_json::to_string(&state).unwrap();
        let back: WorkflowState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
