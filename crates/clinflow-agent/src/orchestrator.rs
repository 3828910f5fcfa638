//! Routing state machine.
//!
//! The orchestrator runs between every capability step and picks the next one.
//! Deterministic safety guardrails are checked first, in strict priority order;
//! only when none applies is the model asked to choose among the eligible
//! steps, and its answer is validated before use. If the model cannot be
//! reached, a fixed ladder takes over.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use clinflow_core::state::{LesionClass, WorkflowState};
use clinflow_core::types::{
    CompletionRequest, NextStep, ProgressEvent, ReasoningEntry, RoutingPhase, Severity,
};

use crate::capabilities::{
    task_header, Capability, CapabilityContext, ASSESSMENT, DOCUMENTATION, EMERGENCY,
    IMAGE_ANALYSIS, REFERRAL, RISK, RISK_REFERRAL, TREATMENT,
};
use crate::registry::CapabilityRegistry;

/// Header of the routing prompt, distinct from every capability prompt.
pub const ROUTE_TASK: &str = "route";

/// Preferred substitutes for an invalid model answer, before `end`.
const DEFAULT_ORDER: [&str; 3] = [RISK, TREATMENT, DOCUMENTATION];

/// Used when the model cannot be reached at all.
const FALLBACK_LADDER: [&str; 6] = [IMAGE_ANALYSIS, RISK_REFERRAL, RISK, REFERRAL, TREATMENT, DOCUMENTATION];

/// One routing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub phase: RoutingPhase,
    pub next_step: NextStep,
    pub reasoning: String,
    /// Raise the run's emergency flag.
    pub set_emergency: bool,
    /// Mark the run complete.
    pub complete: bool,
}

impl RoutingDecision {
    fn to(phase: RoutingPhase, capability: &str, reasoning: impl Into<String>) -> Self {
        Self {
            phase,
            next_step: NextStep::capability(capability),
            reasoning: reasoning.into(),
            set_emergency: false,
            complete: false,
        }
    }

    fn end(phase: RoutingPhase, reasoning: impl Into<String>) -> Self {
        Self {
            phase,
            next_step: NextStep::End,
            reasoning: reasoning.into(),
            set_emergency: false,
            complete: true,
        }
    }

    /// Stand-in for a step the registry cannot serve: documentation while the
    /// note is still missing, otherwise close the run.
    pub fn unavailable(missing: &str, state: &WorkflowState, registry: &CapabilityRegistry) -> Self {
        if missing != DOCUMENTATION && state.soap_note.is_none() && registry.contains(DOCUMENTATION) {
            Self::to(
                RoutingPhase::ValidationOverride,
                DOCUMENTATION,
                format!("Capability {} is not registered, documenting instead", missing),
            )
        } else {
            Self::end(
                RoutingPhase::ValidationOverride,
                format!("Capability {} is not registered, closing run", missing),
            )
        }
    }

    /// Close a run that exceeded its transition budget.
    pub fn transition_limit(limit: usize) -> Self {
        Self::end(
            RoutingPhase::TransitionLimit,
            format!("Transition limit of {} reached, closing run", limit),
        )
    }
}

pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    ctx: Arc<CapabilityContext>,
}

impl Orchestrator {
    pub fn new(registry: Arc<CapabilityRegistry>, ctx: Arc<CapabilityContext>) -> Self {
        Self { registry, ctx }
    }

    /// Capabilities the model may choose from right now.
    pub fn eligible(&self, state: &WorkflowState) -> Vec<Arc<dyn Capability>> {
        self.registry
            .list()
            .iter()
            .filter(|c| !c.is_complete(state) && c.is_eligible(state))
            .cloned()
            .collect()
    }

    /// Choose the next step for `state`. Never fails.
    pub async fn decide(&self, state: &WorkflowState) -> RoutingDecision {
        let Some(assessment) = &state.clinical_assessment else {
            return RoutingDecision::to(
                RoutingPhase::AssessmentFirst,
                ASSESSMENT,
                "Safety guardrail: clinical assessment must come first before any other step",
            );
        };

        if assessment.triage == Severity::HIGHEST && state.emergency_guidance.is_none() {
            warn!(run_id = %state.run_id(), "EMERGENCY triage, forcing emergency protocol");
            let mut decision = RoutingDecision::to(
                RoutingPhase::EmergencyGuardrail,
                EMERGENCY,
                "Safety guardrail: EMERGENCY triage detected, must activate emergency protocol immediately",
            );
            decision.set_emergency = true;
            return decision;
        }

        if state.has_image() && state.image_analysis.is_none() {
            info!(run_id = %state.run_id(), "Image attached and not yet analysed");
            return RoutingDecision::to(
                RoutingPhase::ImageGuardrail,
                IMAGE_ANALYSIS,
                "Safety guardrail: image provided, must be analysed before proceeding",
            );
        }

        if state.treatment_plan.is_some()
            && state.soap_note.is_some()
            && (!state.has_image() || state.image_analysis.is_some())
        {
            return RoutingDecision::end(
                RoutingPhase::Completion,
                "All essential clinical steps complete, workflow finished",
            );
        }

        self.model_route(state).await
    }

    async fn model_route(&self, state: &WorkflowState) -> RoutingDecision {
        let eligible = self.eligible(state);
        let names: Vec<&str> = eligible.iter().map(|c| c.name()).collect();
        let prompt = self.routing_prompt(state, &eligible);

        let reply = match self
            .ctx
            .backend
            .complete(&self.ctx.model, CompletionRequest::text(prompt))
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!(run_id = %state.run_id(), error = %e, "Routing model unavailable, using fallback ladder");
                return fallback_ladder(state, &self.registry);
            }
        };

        let parsed = self.ctx.parser.parse(&reply);
        let answer = parsed
            .get("next_action")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_ascii_lowercase());
        let model_reasoning = parsed
            .get("reasoning")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| "Model routing decision".to_string());

        let chosen = match answer.as_deref() {
            Some(NextStep::END) => NextStep::End,
            Some(name) if names.contains(&name) => NextStep::capability(name),
            other => {
                warn!(
                    run_id = %state.run_id(),
                    answer = ?other,
                    "Routing answer not in eligible set, substituting default"
                );
                let next = DEFAULT_ORDER
                    .iter()
                    .find(|name| names.contains(name))
                    .map(|name| NextStep::capability(*name))
                    .unwrap_or(NextStep::End);
                return self.guard_end(
                    state,
                    RoutingDecision {
                        phase: RoutingPhase::ValidationOverride,
                        reasoning: format!(
                            "Validation override: '{}' was the next available step in sequence.",
                            next
                        ),
                        complete: next.is_end(),
                        next_step: next,
                        set_emergency: false,
                    },
                );
            }
        };

        debug!(run_id = %state.run_id(), next = %chosen, "Model routing decision");
        let decision = RoutingDecision {
            phase: RoutingPhase::ModelRouting,
            complete: chosen.is_end(),
            next_step: chosen,
            reasoning: model_reasoning,
            set_emergency: false,
        };
        self.guard_end(state, decision)
    }

    /// An `end` without documentation becomes documentation.
    fn guard_end(&self, state: &WorkflowState, decision: RoutingDecision) -> RoutingDecision {
        if decision.next_step.is_end() && state.soap_note.is_none() {
            warn!(run_id = %state.run_id(), "Cannot end without SOAP note, forcing documentation");
            return RoutingDecision::to(
                RoutingPhase::ValidationOverride,
                DOCUMENTATION,
                "Validation override: SOAP note required before workflow completion",
            );
        }
        decision
    }

    fn routing_prompt(&self, state: &WorkflowState, eligible: &[Arc<dyn Capability>]) -> String {
        let input = state.input();
        let completed: Vec<String> = self
            .registry
            .list()
            .iter()
            .filter(|c| c.is_complete(state) && c.name() != RISK_REFERRAL)
            .map(|c| match c.name() {
                ASSESSMENT => state
                    .clinical_assessment
                    .as_ref()
                    .map(|a| {
                        format!(
                            "{}: triage={}, diagnoses={:?}",
                            ASSESSMENT, a.triage, a.differential_diagnoses
                        )
                    })
                    .unwrap_or_default(),
                IMAGE_ANALYSIS => state
                    .image_analysis
                    .as_ref()
                    .map(|i| format!("{}: {:?} ({:.2})", IMAGE_ANALYSIS, i.classification, i.confidence))
                    .unwrap_or_default(),
                name => format!("{}: complete", name),
            })
            .collect();

        let eligible: Vec<&str> = eligible.iter().map(|c| c.name()).collect();
        let mut available: Vec<String> = self
            .registry
            .describe_all()
            .into_iter()
            .filter(|d| eligible.contains(&d.name.as_str()))
            .map(|d| format!("- {}: {} (Use when: {})", d.name, d.description, d.use_when))
            .collect();
        available.push(format!("- {}: All necessary steps complete, workflow finished", NextStep::END));

        let image = match &input.image {
            Some(image) => format!("Yes ({})", image.kind),
            None => "No".to_string(),
        };
        let completed = if completed.is_empty() {
            "None yet".to_string()
        } else {
            completed.join("\n")
        };

        format!(
            "{}\nYou are a clinical workflow orchestrator for a community health worker.\n\n\
             Patient: {}\nSymptoms: {}\nVitals: {}\nMedical History: {}\nImage available: {}\n\n\
             Steps completed:\n{}\n{}\n\
             Available next steps:\n{}\n\n\
             Based on the clinical context and routing guidance above, which SINGLE step should be called next? \
             Choose ONLY ONE from the 'Available next steps' list. Do NOT choose steps that are already completed.\n\
             Return JSON only: {{\"next_action\": \"<step_name>\", \"reasoning\": \"<brief clinical reasoning>\"}}\nJSON:",
            task_header(ROUTE_TASK),
            input.patient_context,
            input.symptoms,
            input.vitals_json(),
            input.medical_history.as_deref().unwrap_or("None provided"),
            image,
            completed,
            routing_guidance(state),
            available.join("\n"),
        )
    }

    /// Write `decision` into the control fields and the reasoning trace.
    pub fn record(&self, state: &mut WorkflowState, decision: &RoutingDecision) {
        info!(
            run_id = %state.run_id(),
            phase = ?decision.phase,
            next = %decision.next_step,
            "Orchestrator decision"
        );
        state.next_step = decision.next_step.clone();
        if decision.set_emergency {
            state.emergency = true;
        }
        if let Some(referral) = &state.referral_decision {
            state.referral_needed = referral.needed;
        }
        state.reasoning.push(ReasoningEntry {
            phase: decision.phase,
            next_step: decision.next_step.clone(),
            reasoning: decision.reasoning.clone(),
            timestamp: Utc::now(),
        });
        state.messages.push(format!("Orchestrator: {}", decision.reasoning));
        self.ctx.emit(
            state,
            ProgressEvent::Reasoning {
                phase: decision.phase,
                next_step: decision.next_step.clone(),
                reasoning: decision.reasoning.clone(),
            },
        );
        if decision.complete {
            state.complete = true;
        }
    }
}

/// Deterministic routing used when the model cannot be reached.
pub fn fallback_ladder(state: &WorkflowState, registry: &CapabilityRegistry) -> RoutingDecision {
    for name in FALLBACK_LADDER {
        let Ok(capability) = registry.get(name) else {
            continue;
        };
        if !capability.is_complete(state) && capability.is_eligible(state) {
            return RoutingDecision::to(
                RoutingPhase::FallbackLadder,
                name,
                format!("Fallback: {} needed", name),
            );
        }
    }
    RoutingDecision::end(RoutingPhase::FallbackLadder, "Fallback: all steps complete")
}

fn routing_guidance(state: &WorkflowState) -> String {
    let Some(image) = &state.image_analysis else {
        return String::new();
    };
    let mut guidance = String::from("\nROUTING GUIDANCE based on image analysis:\n");
    if image.classification != LesionClass::Benign || image.confidence < 0.7 {
        guidance.push_str(&format!(
            "- Image analysis shows {:?} ({:.2}), URGENT case\n\
             - Priority sequence: {} -> {} (URGENT) -> {} -> {}\n\
             - Referral decision should prioritize dermatology/oncology urgency\n",
            image.classification, image.confidence, RISK, REFERRAL, TREATMENT, DOCUMENTATION
        ));
    } else {
        guidance.push_str(&format!(
            "- Image analysis shows {:?} ({:.2}), routine monitoring\n\
             - Standard sequence: {} -> {} -> {}\n",
            image.classification, image.confidence, RISK, TREATMENT, DOCUMENTATION
        ));
    }
    guidance
}
