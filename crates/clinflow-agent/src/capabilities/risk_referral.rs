use futures::future::BoxFuture;
use serde_json::json;

use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::state::{StatePatch, WorkflowState};

use super::referral::ReferralDecisionCapability;
use super::risk::RiskAssessmentCapability;
use super::{Capability, CapabilityContext, REFERRAL, RISK, RISK_REFERRAL};

/// Risk evaluation and referral decision as a single step.
///
/// Both halves read the same input state and run one after the other. A half
/// that fails falls back on its own; if both fail the whole step errors and
/// the executor applies the combined fallback.
pub struct RiskReferralCapability;

impl Capability for RiskReferralCapability {
    fn name(&self) -> &str {
        RISK_REFERRAL
    }

    fn description(&self) -> &str {
        "Risk assessment and referral decision together"
    }

    fn use_when(&self) -> &str {
        "When both risk and referral assessments are still needed"
    }

    fn is_complete(&self, state: &WorkflowState) -> bool {
        state.risk_assessment.is_some() && state.referral_decision.is_some()
    }

    fn is_eligible(&self, state: &WorkflowState) -> bool {
        state.clinical_assessment.is_some()
            && state.risk_assessment.is_none()
            && state.referral_decision.is_none()
    }

    fn execute<'a>(
        &'a self,
        state: &'a WorkflowState,
        ctx: &'a CapabilityContext,
    ) -> BoxFuture<'a, Result<StatePatch>> {
        Box::pin(async move {
            ctx.step_start(
                state,
                RISK_REFERRAL,
                "Running Risk & Referral Check Together",
                "Assessing health risk and specialist referral need",
            );

            let risk = RiskAssessmentCapability::assess(state, ctx).await;
            let referral = ReferralDecisionCapability::decide(state, ctx).await;
            let (risk, referral) = match (risk, referral) {
                (Err(_), Err(e)) => return Err(e),
                (risk, referral) => (
                    risk.unwrap_or_else(|e| {
                        ctx.step_fallback(state, RISK, "Risk Assessment (Fallback)", &e);
                        RiskAssessmentCapability::fallback_patch(state)
                    }),
                    referral.unwrap_or_else(|e| {
                        ctx.step_fallback(state, REFERRAL, "Referral Decision (Fallback)", &e);
                        ReferralDecisionCapability::fallback_patch(state)
                    }),
                ),
            };
            let merged = risk
                .merge(referral)
                .with_message("Risk and referral run sequentially under one step");

            ctx.step_complete(
                state,
                RISK_REFERRAL,
                "Risk & Referral Check Complete",
                json!({
                    "risk_level": merged.risk_assessment.as_ref().map(|r| r.level),
                    "referral_needed": merged.referral_decision.as_ref().map(|r| r.needed),
                }),
            );
            Ok(merged)
        })
    }

    fn fallback(
        &self,
        state: &WorkflowState,
        error: &ClinflowError,
        ctx: &CapabilityContext,
    ) -> StatePatch {
        ctx.step_fallback(state, RISK_REFERRAL, "Risk & Referral (Fallback)", error);
        RiskAssessmentCapability::fallback_patch(state)
            .merge(ReferralDecisionCapability::fallback_patch(state))
    }
}
