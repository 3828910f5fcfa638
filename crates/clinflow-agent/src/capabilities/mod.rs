//! Clinical capabilities.
//!
//! Each capability is one model-backed analysis step. It reads what it needs
//! from the `WorkflowState`, calls the model through the bounded retry policy,
//! recovers a structured answer, and returns a `StatePatch` writing only its
//! own output slot. Every capability also has a deterministic, safety-biased
//! `fallback` so a failed step never aborts the run.

pub mod assessment;
pub mod emergency;
mod fields;
pub mod image;
pub mod referral;
pub mod risk;
pub mod risk_referral;
pub mod soap;
pub mod treatment;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::warn;

use clinflow_core::config::{AppConfig, ModelConfig};
use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::event::ProgressBus;
use clinflow_core::state::{StatePatch, WorkflowState};
use clinflow_core::traits::ModelBackend;
use clinflow_core::types::{CapabilityDescriptor, CompletionRequest, ProgressEvent};
use clinflow_llm::{OutputRecoveryParser, RetryPolicy};

pub use assessment::ClinicalAssessmentCapability;
pub use emergency::EmergencyProtocolCapability;
pub use image::ImageAnalysisCapability;
pub use referral::ReferralDecisionCapability;
pub use risk::RiskAssessmentCapability;
pub use risk_referral::RiskReferralCapability;
pub use soap::SoapNoteCapability;
pub use treatment::TreatmentPlanCapability;

pub const ASSESSMENT: &str = "clinical_assessment";
pub const EMERGENCY: &str = "emergency_protocol";
pub const RISK: &str = "risk_assessment";
pub const REFERRAL: &str = "referral_decision";
pub const TREATMENT: &str = "treatment_plan";
pub const DOCUMENTATION: &str = "soap_note";
pub const IMAGE_ANALYSIS: &str = "image_analysis";
pub const RISK_REFERRAL: &str = "risk_referral";

/// First line of every prompt, naming the task it asks for.
pub fn task_header(task: &str) -> String {
    format!("### Task: {}", task)
}

/// One analysis step of a clinical run.
pub trait Capability: Send + Sync + 'static {
    /// Unique name, also used as the routing vocabulary.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Guidance for the routing model.
    fn use_when(&self) -> &str;

    /// Whether this step's output is already present. Pure.
    fn is_complete(&self, state: &WorkflowState) -> bool;

    /// Whether prerequisites are met. Defaults to "assessment exists".
    fn is_eligible(&self, state: &WorkflowState) -> bool {
        state.clinical_assessment.is_some()
    }

    /// Run the step. Errors are handed to [`fallback`](Self::fallback) by the executor.
    fn execute<'a>(
        &'a self,
        state: &'a WorkflowState,
        ctx: &'a CapabilityContext,
    ) -> BoxFuture<'a, Result<StatePatch>>;

    /// Deterministic, safety-biased output used when `execute` fails.
    fn fallback(
        &self,
        state: &WorkflowState,
        error: &ClinflowError,
        ctx: &CapabilityContext,
    ) -> StatePatch;

    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            use_when: self.use_when().to_string(),
        }
    }
}

/// Shared services handed to every capability call.
pub struct CapabilityContext {
    pub backend: Arc<dyn ModelBackend>,
    pub model: ModelConfig,
    pub vision_model: ModelConfig,
    pub retry: RetryPolicy,
    pub parser: OutputRecoveryParser,
    pub progress: Arc<ProgressBus>,
}

impl CapabilityContext {
    pub fn new(config: &AppConfig, backend: Arc<dyn ModelBackend>, progress: Arc<ProgressBus>) -> Self {
        Self {
            backend,
            model: config.model.clone(),
            vision_model: config.vision_model().clone(),
            retry: RetryPolicy::from_config(&config.retry),
            parser: OutputRecoveryParser::new(),
            progress,
        }
    }

    /// Call the text model with retry and recover a non-empty object.
    pub async fn invoke_json(
        &self,
        capability: &str,
        request: CompletionRequest,
    ) -> Result<Map<String, Value>> {
        self.invoke_with(capability, &self.model, request).await
    }

    /// Same as [`invoke_json`](Self::invoke_json) against the vision model.
    pub async fn invoke_vision_json(
        &self,
        capability: &str,
        request: CompletionRequest,
    ) -> Result<Map<String, Value>> {
        self.invoke_with(capability, &self.vision_model, request).await
    }

    async fn invoke_with(
        &self,
        capability: &str,
        model: &ModelConfig,
        request: CompletionRequest,
    ) -> Result<Map<String, Value>> {
        let this = self;
        let request = &request;
        self.retry
            .invoke(capability, move || async move {
                let text = this.backend.complete(model, request.clone()).await?;
                this.parser.parse_object(&text)
            })
            .await
    }

    pub fn emit(&self, state: &WorkflowState, event: ProgressEvent) {
        self.progress.emit(state.run_id(), event);
    }

    pub(crate) fn step_start(&self, state: &WorkflowState, capability: &str, label: &str, description: &str) {
        self.emit(
            state,
            ProgressEvent::StepStart {
                capability: capability.to_string(),
                label: label.to_string(),
                description: description.to_string(),
            },
        );
    }

    pub(crate) fn step_complete(&self, state: &WorkflowState, capability: &str, label: &str, detail: Value) {
        self.emit(
            state,
            ProgressEvent::StepComplete {
                capability: capability.to_string(),
                label: label.to_string(),
                detail,
            },
        );
    }

    /// Log and announce that `capability` fell back.
    pub(crate) fn step_fallback(
        &self,
        state: &WorkflowState,
        capability: &str,
        label: &str,
        error: &ClinflowError,
    ) {
        warn!(
            run_id = %state.run_id(),
            capability,
            error = %error,
            "Capability failed, using fallback"
        );
        self.emit(
            state,
            ProgressEvent::StepFallback {
                capability: capability.to_string(),
                label: label.to_string(),
                error: error.to_string(),
            },
        );
    }
}

/// Prompt context describing a finished image analysis, if any.
pub(crate) fn image_context(state: &WorkflowState) -> String {
    match &state.image_analysis {
        Some(analysis) => format!(
            "\n\nIMAGE ANALYSIS: {:?} (confidence: {:.2})\nFindings: {}\nRecommendation: {}",
            analysis.classification,
            analysis.confidence,
            analysis.reasoning,
            analysis.monitoring_recommendation
        ),
        None => String::new(),
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}


#[cfg(test)]
mod tests {
    use super::*;
    use clinflow_core::types::Severity;
    use clinflow_test_utils::{routine_encounter, FailingBackend};

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 4), "abcd...");
    }

    #[test]
    fn test_every_fallback_completes_its_step() {
        let ctx = test_support::context(Arc::new(FailingBackend::new()));
        let error = ClinflowError::LlmRequest("connection refused".into());

        let registry = crate::registry::CapabilityRegistry::with_clinical_defaults();
        for capability in registry.list() {
            let mut state = test_support::assessed(routine_encounter(), Severity::Urgent);
            if capability.name() == ASSESSMENT {
                state.clinical_assessment = None;
            }
            let patch = capability.fallback(&state, &error, &ctx);
            assert!(!patch.tool_calls.is_empty(), "{} fallback logged no call", capability.name());
            state.apply(patch);
            assert!(
                capability.is_complete(&state),
                "{} fallback left the step incomplete",
                capability.name()
            );
        }
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_the_error() {
        let backend = Arc::new(FailingBackend::new());
        let ctx = test_support::context(backend.clone());
        let err = ctx
            .invoke_json(RISK, CompletionRequest::text("prompt"))
            .await
            .unwrap_err();
        assert!(matches!(err, ClinflowError::LlmRequest(_)));
        assert_eq!(backend.calls() as u32, ctx.retry.max_attempts());
    }
}
