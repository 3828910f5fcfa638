use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use clinflow_core::config::{AppConfig, WorkflowConfig};
use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::event::ProgressBus;
use clinflow_core::state::{EncounterInput, WorkflowState};
use clinflow_core::traits::{Checkpointer, ModelBackend};
use clinflow_core::types::{
    CheckpointPosition, Decision, NextStep, ProgressEvent, ResumeRequest, RunId,
};

use super::gate;
use crate::capabilities::{CapabilityContext, EMERGENCY};
use crate::checkpoint::{restore, snapshot, SqliteCheckpointer};
use crate::executor::Executor;
use crate::orchestrator::{Orchestrator, RoutingDecision};
use crate::registry::CapabilityRegistry;

/// Checkpoint step name while a claimed pause is being resumed.
const RESUME_STEP: &str = "resume";

/// How a call into the graph ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed(WorkflowState),
    /// Paused before the emergency protocol; resume with a decision.
    Interrupted(WorkflowState),
}

impl RunOutcome {
    pub fn state(&self) -> &WorkflowState {
        match self {
            RunOutcome::Completed(state) | RunOutcome::Interrupted(state) => state,
        }
    }

    pub fn into_state(self) -> WorkflowState {
        match self {
            RunOutcome::Completed(state) | RunOutcome::Interrupted(state) => state,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunOutcome::Interrupted(_))
    }
}

/// Drives a run: orchestrator, capability, orchestrator, ... until `end` or the gate.
pub struct ClinicalGraph {
    workflow: WorkflowConfig,
    registry: Arc<CapabilityRegistry>,
    orchestrator: Orchestrator,
    executor: Executor,
    checkpointer: Arc<dyn Checkpointer>,
    progress: Arc<ProgressBus>,
}

impl ClinicalGraph {
    pub fn new(
        config: &AppConfig,
        backend: Arc<dyn ModelBackend>,
        registry: Arc<CapabilityRegistry>,
        checkpointer: Arc<dyn Checkpointer>,
        progress: Arc<ProgressBus>,
    ) -> Self {
        let ctx = Arc::new(CapabilityContext::new(config, backend, progress.clone()));
        Self {
            workflow: config.workflow.clone(),
            orchestrator: Orchestrator::new(registry.clone(), ctx.clone()),
            executor: Executor::new(ctx),
            registry,
            checkpointer,
            progress,
        }
    }

    /// Graph with the clinical capabilities, the configured backend and a SQLite store.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let backend: Arc<dyn ModelBackend> = Arc::from(clinflow_llm::create_client(&config.model)?);
        let checkpointer = Arc::new(SqliteCheckpointer::open(&config.checkpoint_path())?);
        let progress = Arc::new(ProgressBus::new(config.workflow.progress_capacity));
        Ok(Self::new(
            config,
            backend,
            Arc::new(CapabilityRegistry::with_clinical_defaults()),
            checkpointer,
            progress,
        ))
    }

    pub fn progress(&self) -> &Arc<ProgressBus> {
        &self.progress
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Validate `input` and run a fresh workflow for it.
    pub async fn start(&self, input: EncounterInput) -> Result<RunOutcome> {
        self.run(WorkflowState::new(input)?).await
    }

    pub async fn run(&self, state: WorkflowState) -> Result<RunOutcome> {
        state.validate()?;
        info!(run_id = %state.run_id(), encounter_id = %state.encounter_id(), "Starting clinical run");
        self.progress.emit(
            state.run_id(),
            ProgressEvent::RunStarted {
                run_id: state.run_id().clone(),
                encounter_id: state.encounter_id().to_string(),
            },
        );
        self.save(&state, CheckpointPosition::Running { last_step: "start".into() });
        self.drive(state).await
    }

    /// Continue a run paused at the confirmation gate.
    ///
    /// The pause is claimed in the checkpoint store before any work is done,
    /// so a run can be resumed at most once per pause; a losing or late
    /// caller gets `NotAwaitingConfirmation`.
    pub async fn resume(&self, request: ResumeRequest) -> Result<RunOutcome> {
        let entry = self
            .checkpointer
            .get(&request.run_id)?
            .ok_or_else(|| ClinflowError::CheckpointNotFound(request.run_id.to_string()))?;
        if entry.position != CheckpointPosition::AwaitingConfirmation {
            return Err(ClinflowError::NotAwaitingConfirmation {
                run_id: request.run_id.to_string(),
                position: entry.position.to_string(),
            });
        }
        let claimed = self.checkpointer.transition(
            &request.run_id,
            &CheckpointPosition::AwaitingConfirmation,
            &CheckpointPosition::Running { last_step: RESUME_STEP.into() },
        )?;
        if !claimed {
            return Err(ClinflowError::NotAwaitingConfirmation {
                run_id: request.run_id.to_string(),
                position: "claimed by another resume".into(),
            });
        }
        let mut state = restore(&entry)?;

        info!(run_id = %state.run_id(), decision = %request.decision, "Resuming run");
        self.progress.emit(
            state.run_id(),
            ProgressEvent::RunResumed {
                run_id: state.run_id().clone(),
                decision: request.decision,
            },
        );
        gate::apply_decision(&mut state, &request);

        if request.decision == Decision::Approve {
            match self.registry.get(EMERGENCY) {
                Ok(capability) => {
                    let outcome = self.executor.invoke(capability.as_ref(), &state).await;
                    state.apply(outcome.patch);
                }
                Err(e) => warn!(run_id = %state.run_id(), error = %e, "Approved step is not registered"),
            }
        }
        self.save(&state, CheckpointPosition::Running { last_step: EMERGENCY.into() });
        self.drive(state).await
    }

    async fn drive(&self, mut state: WorkflowState) -> Result<RunOutcome> {
        let mut redirect: Option<RoutingDecision> = None;
        loop {
            let decision = if let Some(decision) = redirect.take() {
                decision
            } else if state.reasoning.len() >= self.workflow.max_transitions {
                warn!(
                    run_id = %state.run_id(),
                    limit = self.workflow.max_transitions,
                    "Transition limit reached"
                );
                RoutingDecision::transition_limit(self.workflow.max_transitions)
            } else {
                self.orchestrator.decide(&state).await
            };
            self.orchestrator.record(&mut state, &decision);

            let name = match &state.next_step {
                NextStep::End => return Ok(self.finish(state)),
                NextStep::Capability(name) => name.clone(),
            };

            if gate::requires_confirmation(&name) && self.registry.contains(&name) {
                return self.interrupt(state);
            }

            let capability = match self.registry.get(&name) {
                Ok(capability) => capability,
                Err(e) => {
                    warn!(run_id = %state.run_id(), error = %e, "Routed to an unregistered capability");
                    redirect = Some(RoutingDecision::unavailable(&name, &state, &self.registry));
                    continue;
                }
            };
            let outcome = self.executor.invoke(capability.as_ref(), &state).await;
            state.apply(outcome.patch);
            self.save(&state, CheckpointPosition::Running { last_step: name });
        }
    }

    fn interrupt(&self, mut state: WorkflowState) -> Result<RunOutcome> {
        gate::pause(&mut state);
        self.checkpointer
            .put(&snapshot(&state, CheckpointPosition::AwaitingConfirmation)?)?;
        warn!(run_id = %state.run_id(), "Run paused for emergency confirmation");
        self.progress.emit(
            state.run_id(),
            ProgressEvent::Interrupted {
                run_id: state.run_id().clone(),
                severity: state.triage(),
                red_flags: state
                    .clinical_assessment
                    .as_ref()
                    .map(|a| a.red_flags.clone())
                    .unwrap_or_default(),
            },
        );
        Ok(RunOutcome::Interrupted(state))
    }

    fn finish(&self, mut state: WorkflowState) -> RunOutcome {
        state.complete = true;
        self.save(&state, CheckpointPosition::Completed);
        info!(
            run_id = %state.run_id(),
            steps = state.tool_calls.len(),
            "Clinical run complete"
        );
        self.progress.emit(
            state.run_id(),
            ProgressEvent::RunComplete {
                run_id: state.run_id().clone(),
                steps: state.tool_calls.len(),
            },
        );
        RunOutcome::Completed(state)
    }

    /// Best-effort checkpoint; only the interrupt write is fatal.
    fn save(&self, state: &WorkflowState, position: CheckpointPosition) {
        let result = snapshot(state, position).and_then(|entry| self.checkpointer.put(&entry));
        if let Err(e) = result {
            warn!(run_id = %state.run_id(), error = %e, "Failed to write checkpoint");
        }
    }

    /// Run `state` on a background task, streaming progress to the returned receiver.
    pub fn spawn(
        self: &Arc<Self>,
        state: WorkflowState,
    ) -> (
        broadcast::Receiver<ProgressEvent>,
        JoinHandle<Result<RunOutcome>>,
    ) {
        let run_id = state.run_id().clone();
        let rx = self.progress.open(&run_id);
        let graph = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let outcome = graph.run(state).await;
            graph.progress.close(&run_id);
            outcome
        });
        (rx, handle)
    }

    /// Resume on a background task, streaming progress to the returned receiver.
    pub fn spawn_resume(
        self: &Arc<Self>,
        request: ResumeRequest,
    ) -> (
        broadcast::Receiver<ProgressEvent>,
        JoinHandle<Result<RunOutcome>>,
    ) {
        let run_id: RunId = request.run_id.clone();
        let rx = self.progress.open(&run_id);
        let graph = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let outcome = graph.resume(request).await;
            graph.progress.close(&run_id);
            outcome
        });
        (rx, handle)
    }
}
