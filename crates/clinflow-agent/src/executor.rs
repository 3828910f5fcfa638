use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tracing::{debug, error};

use clinflow_core::error::ClinflowError;
use clinflow_core::state::{StatePatch, WorkflowState};

use crate::capabilities::{Capability, CapabilityContext};

/// Result of invoking one capability.
///
/// `fell_back` and `elapsed_ms` are also stamped onto the patch's tool-call
/// records, so they survive in the run's final state.
#[derive(Debug)]
pub struct StepOutcome {
    pub capability: String,
    pub patch: StatePatch,
    /// Whether the patch came from the capability's fallback.
    pub fell_back: bool,
    pub elapsed_ms: u64,
}

/// Runs capabilities so that a failure, or a panic, always ends in a fallback patch.
pub struct Executor {
    ctx: Arc<CapabilityContext>,
}

impl Executor {
    pub fn new(ctx: Arc<CapabilityContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &CapabilityContext {
        &self.ctx
    }

    pub async fn invoke(&self, capability: &dyn Capability, state: &WorkflowState) -> StepOutcome {
        let start = Instant::now();
        let name = capability.name().to_string();

        let result = AssertUnwindSafe(capability.execute(state, &self.ctx))
            .catch_unwind()
            .await;

        let (mut patch, fell_back) = match result {
            Ok(Ok(patch)) => (patch, false),
            Ok(Err(e)) => (capability.fallback(state, &e, &self.ctx), true),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(run_id = %state.run_id(), capability = %name, %message, "Capability panicked");
                let e = ClinflowError::CapabilityFailed {
                    capability: name.clone(),
                    message,
                };
                (capability.fallback(state, &e, &self.ctx), true)
            }
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        for call in patch.tool_calls.iter_mut() {
            call.elapsed_ms = elapsed_ms;
            call.fallback |= fell_back;
        }
        debug!(
            run_id = %state.run_id(),
            capability = %name,
            fell_back,
            elapsed_ms,
            "Capability finished"
        );
        StepOutcome {
            capability: name,
            patch,
            fell_back,
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::future::BoxFuture;

    use super::*;
    use crate::capabilities::test_support::{assessed, context};
    use crate::capabilities::{task_header, RiskAssessmentCapability, ASSESSMENT, EMERGENCY, RISK};
    use crate::registry::CapabilityRegistry;
    use clinflow_core::error::Result;
    use clinflow_core::types::{ProgressEvent, Severity};
    use clinflow_test_utils::{
        replies, routine_encounter, skin_encounter, FailingBackend, ScriptedBackend,
    };

    struct PanickingCapability;

    impl Capability for PanickingCapability {
        fn name(&self) -> &str {
            "panicking"
        }
        fn description(&self) -> &str {
            "always panics"
        }
        fn use_when(&self) -> &str {
            "never"
        }
        fn is_complete(&self, state: &WorkflowState) -> bool {
            state.messages.iter().any(|m| m == "recovered")
        }
        fn execute<'a>(
            &'a self,
            _state: &'a WorkflowState,
            _ctx: &'a CapabilityContext,
        ) -> BoxFuture<'a, Result<StatePatch>> {
            Box::pin(async { panic!("boom") })
        }
        fn fallback(
            &self,
            _state: &WorkflowState,
            error: &ClinflowError,
            _ctx: &CapabilityContext,
        ) -> StatePatch {
            assert!(error.to_string().contains("boom"));
            StatePatch::new().with_message("recovered")
        }
    }

    #[tokio::test]
    async fn test_success_is_not_a_fallback() {
        let executor = Executor::new(Arc::new(context(Arc::new(
            ScriptedBackend::new().reply(&task_header(RISK), replies::RISK),
        ))));
        let state = assessed(routine_encounter(), Severity::Routine);
        let outcome = executor.invoke(&RiskAssessmentCapability, &state).await;
        assert!(!outcome.fell_back);
        assert!(outcome.patch.risk_assessment.is_some());
    }

    #[tokio::test]
    async fn test_error_routes_to_fallback() {
        let executor = Executor::new(Arc::new(context(Arc::new(FailingBackend::new()))));
        let state = assessed(routine_encounter(), Severity::Routine);
        let outcome = executor.invoke(&RiskAssessmentCapability, &state).await;
        assert!(outcome.fell_back);
        assert!(outcome.patch.risk_assessment.unwrap().fallback);
    }

    #[tokio::test]
    async fn test_panic_routes_to_fallback() {
        let executor = Executor::new(Arc::new(context(Arc::new(FailingBackend::new()))));
        let mut state = assessed(routine_encounter(), Severity::Routine);
        let outcome = executor.invoke(&PanickingCapability, &state).await;
        assert!(outcome.fell_back);
        state.apply(outcome.patch);
        assert!(PanickingCapability.is_complete(&state));
    }

    #[tokio::test]
    async fn test_dead_backend_every_step_falls_back_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        let missing_image = dir.path().join("missing.jpg");
        let executor = Executor::new(Arc::new(context(Arc::new(FailingBackend::new()))));
        let registry = CapabilityRegistry::with_clinical_defaults();

        for capability in registry.list() {
            let name = capability.name();
            let mut state = assessed(skin_encounter(&missing_image), Severity::Urgent);
            match name {
                ASSESSMENT => state.clinical_assessment = None,
                EMERGENCY => state.emergency = true,
                _ => {}
            }
            let progress = &executor.context().progress;
            let mut rx = progress.open(state.run_id());

            let outcome = executor.invoke(capability.as_ref(), &state).await;
            assert!(outcome.fell_back, "{} did not fall back", name);
            assert!(
                outcome.patch.tool_calls.iter().all(|c| c.fallback),
                "{} tool calls not flagged as fallback",
                name
            );
            state.apply(outcome.patch);
            assert!(capability.is_complete(&state), "{} left incomplete", name);

            let mut fallbacks = Vec::new();
            while let Ok(event) = rx.try_recv() {
                if let ProgressEvent::StepFallback { capability, .. } = event {
                    fallbacks.push(capability);
                }
            }
            assert_eq!(fallbacks, vec![name.to_string()], "{} fallback events", name);
            progress.close(state.run_id());
        }
    }
}
