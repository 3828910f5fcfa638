use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use clinflow_agent::capabilities::{
    task_header, SoapNoteCapability, ASSESSMENT, DOCUMENTATION, EMERGENCY, IMAGE_ANALYSIS, REFERRAL, RISK,
    RISK_REFERRAL, TREATMENT,
};
use clinflow_agent::orchestrator::ROUTE_TASK;
use clinflow_agent::{CapabilityRegistry, ClinicalGraph, MemoryCheckpointer, SqliteCheckpointer};
use clinflow_agent::checkpoint::restore;
use clinflow_core::config::{AppConfig, ModelConfig};
use clinflow_core::error::{ClinflowError, Result};
use clinflow_core::event::ProgressBus;
use clinflow_core::state::{EmergencyGuidance, LesionClass};
use clinflow_core::traits::{Checkpointer, ModelBackend};
use clinflow_core::types::{
    CheckpointPosition, CompletionRequest, Decision, ProgressEvent, ResumeRequest, RoutingPhase, RunId, Severity,
};
use clinflow_test_utils::{
    emergency_encounter, replies, routine_encounter, skin_encounter, test_config,
    write_test_image, FailingBackend, ScriptedBackend,
};

fn graph_with(
    config: &AppConfig,
    backend: Arc<dyn ModelBackend>,
    checkpointer: Arc<dyn Checkpointer>,
) -> ClinicalGraph {
    ClinicalGraph::new(
        config,
        backend,
        Arc::new(CapabilityRegistry::with_clinical_defaults()),
        checkpointer,
        Arc::new(ProgressBus::default()),
    )
}

fn graph(backend: Arc<dyn ModelBackend>, checkpointer: Arc<dyn Checkpointer>) -> ClinicalGraph {
    graph_with(&test_config(), backend, checkpointer)
}

/// Every capability answers well; routing walks risk+referral, treatment, documentation.
fn full_script(assessment: String) -> ScriptedBackend {
    ScriptedBackend::new()
        .reply(&task_header(ASSESSMENT), assessment)
        .reply(&task_header(EMERGENCY), replies::EMERGENCY)
        .reply(&task_header(RISK), replies::RISK)
        .reply(&task_header(REFERRAL), replies::REFERRAL_CARDIOLOGY)
        .reply(&task_header(TREATMENT), replies::TREATMENT)
        .reply(&task_header(DOCUMENTATION), replies::SOAP)
        .reply(&task_header(IMAGE_ANALYSIS), replies::SKIN_MALIGNANT)
        .reply(&task_header(ROUTE_TASK), replies::route(RISK_REFERRAL))
        .reply(&task_header(ROUTE_TASK), replies::route(TREATMENT))
        .reply(&task_header(ROUTE_TASK), replies::route(DOCUMENTATION))
}

/// Delays every call so that concurrent resumes overlap inside the model step.
struct SlowBackend(Arc<ScriptedBackend>);

impl ModelBackend for SlowBackend {
    fn complete(
        &self,
        config: &ModelConfig,
        request: CompletionRequest,
    ) -> BoxFuture<'_, Result<String>> {
        let reply = self.0.complete(config, request);
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            reply.await
        })
    }
}

fn resume(run_id: &RunId, decision: Decision, justification: &str) -> ResumeRequest {
    ResumeRequest {
        run_id: run_id.clone(),
        decision,
        justification: justification.to_string(),
    }
}

#[tokio::test]
async fn test_emergency_pauses_before_protocol() {
    let backend = Arc::new(full_script(replies::assessment("EMERGENCY")));
    let store = Arc::new(MemoryCheckpointer::new());
    let graph = graph(backend.clone(), store.clone());

    let outcome = graph.start(emergency_encounter()).await.unwrap();
    assert!(outcome.is_interrupted());

    let state = outcome.state();
    assert_eq!(state.triage(), Some(Severity::HIGHEST));
    assert!(state.emergency);
    assert!(state.awaiting_confirmation);
    assert!(!state.complete);
    assert_eq!(state.capability_history(), vec![ASSESSMENT]);
    assert_eq!(backend.calls_matching(&task_header(EMERGENCY)), 0);
    assert!(state
        .messages
        .last()
        .unwrap()
        .starts_with("EMERGENCY DETECTED: paused for confirmation"));

    let entry = store.get(state.run_id()).unwrap().unwrap();
    assert_eq!(entry.position, CheckpointPosition::AwaitingConfirmation);
}

#[tokio::test]
async fn test_reject_downgrades_and_completes_without_protocol() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("checkpoints.db");
    let backend = Arc::new(full_script(replies::assessment("EMERGENCY")));

    let run_id = {
        let store = Arc::new(SqliteCheckpointer::open(&db).unwrap());
        let graph = graph(backend.clone(), store);
        let outcome = graph.start(emergency_encounter()).await.unwrap();
        assert!(outcome.is_interrupted());
        outcome.state().run_id().clone()
    };

    // A fresh graph over the same database stands in for a restarted process.
    let store = Arc::new(SqliteCheckpointer::open(&db).unwrap());
    let graph = graph(backend.clone(), store.clone());
    let outcome = graph
        .resume(resume(&run_id, Decision::Reject, "patient stable on reassessment"))
        .await
        .unwrap();

    assert!(!outcome.is_interrupted());
    let state = outcome.state();
    assert!(state.complete);
    assert!(!state.emergency);
    assert!(!state.awaiting_confirmation);
    assert_eq!(state.triage(), Some(Severity::Urgent));
    match &state.emergency_guidance {
        Some(EmergencyGuidance::Override(record)) => {
            assert_eq!(record.decision, Decision::Reject);
            assert_eq!(record.justification, "patient stable on reassessment");
            assert_eq!(record.original_severity, Severity::Emergency);
        }
        other => panic!("expected override record, got {:?}", other),
    }
    assert!(!state.capability_history().contains(&EMERGENCY));
    assert_eq!(backend.calls_matching(&task_header(EMERGENCY)), 0);
    assert!(state.soap_note.is_some());
    assert!(state.referral_needed);

    let entry = store.get(&run_id).unwrap().unwrap();
    assert_eq!(entry.position, CheckpointPosition::Completed);

    let again = graph
        .resume(resume(&run_id, Decision::Approve, "second try"))
        .await
        .unwrap_err();
    assert!(matches!(again, ClinflowError::NotAwaitingConfirmation { .. }));
}

#[tokio::test]
async fn test_approve_runs_protocol_then_continues() {
    let backend = Arc::new(full_script(replies::assessment("EMERGENCY")));
    let graph = graph(backend.clone(), Arc::new(MemoryCheckpointer::new()));

    let paused = graph.start(emergency_encounter()).await.unwrap();
    let run_id = paused.state().run_id().clone();
    let outcome = graph
        .resume(resume(&run_id, Decision::Approve, "confirmed"))
        .await
        .unwrap();

    let state = outcome.state();
    assert!(state.complete);
    assert_eq!(state.triage(), Some(Severity::Emergency));
    assert!(matches!(
        state.emergency_guidance,
        Some(EmergencyGuidance::Protocol(_))
    ));
    assert_eq!(backend.calls_matching(&task_header(EMERGENCY)), 1);
    assert_eq!(state.capability_history()[1], EMERGENCY);
}

#[tokio::test]
async fn test_routine_run_completes_without_image_step() {
    let backend = Arc::new(full_script(replies::ASSESSMENT_ROUTINE.to_string()));
    let graph = graph(backend, Arc::new(MemoryCheckpointer::new()));

    let outcome = graph.start(routine_encounter()).await.unwrap();
    let state = outcome.state();
    assert!(state.complete);
    assert!(!state.emergency);
    assert_eq!(state.triage(), Some(Severity::Routine));
    assert_eq!(
        state.capability_history(),
        vec![ASSESSMENT, RISK, REFERRAL, TREATMENT, DOCUMENTATION]
    );
    assert!(!state.capability_history().contains(&IMAGE_ANALYSIS));
    assert_eq!(
        state.reasoning.last().map(|r| r.phase),
        Some(RoutingPhase::Completion)
    );
    assert_eq!(state.follow_up_plan(), "Follow up after specialist consultation");
}

#[tokio::test]
async fn test_image_is_analysed_before_anything_else() {
    let dir = tempfile::tempdir().unwrap();
    let image = write_test_image(&dir);
    let backend = Arc::new(full_script(replies::ASSESSMENT_ROUTINE.to_string()));
    let graph = graph(backend.clone(), Arc::new(MemoryCheckpointer::new()));

    let outcome = graph.start(skin_encounter(&image)).await.unwrap();
    let state = outcome.state();
    assert!(state.complete);
    assert_eq!(state.capability_history()[1], IMAGE_ANALYSIS);
    assert_eq!(
        state.image_analysis.as_ref().map(|i| i.classification),
        Some(LesionClass::Malignant)
    );

    let risk_prompt = backend
        .requests()
        .into_iter()
        .find(|r| r.prompt.contains(&task_header(RISK)))
        .unwrap();
    assert!(risk_prompt.prompt.contains("IMAGE ANALYSIS: Malignant"));
}

#[tokio::test]
async fn test_dead_backend_degrades_but_completes() {
    let backend = Arc::new(FailingBackend::new());
    let graph = graph(backend.clone(), Arc::new(MemoryCheckpointer::new()));

    let outcome = graph.start(routine_encounter()).await.unwrap();
    let state = outcome.state();
    assert!(state.complete);
    assert_eq!(state.triage(), Some(Severity::Urgent));
    assert!(state.clinical_assessment.as_ref().unwrap().fallback);
    assert!(state.risk_assessment.as_ref().unwrap().fallback);
    assert!(state.referral_decision.as_ref().unwrap().needed);
    assert!(state.soap_note.as_ref().unwrap().fallback);
    assert!(state
        .reasoning
        .iter()
        .any(|r| r.phase == RoutingPhase::FallbackLadder));
}

#[tokio::test]
async fn test_invalid_input_creates_no_run() {
    let store = Arc::new(MemoryCheckpointer::new());
    let graph = graph(Arc::new(FailingBackend::new()), store);
    let mut input = routine_encounter();
    input.symptoms = "   ".into();
    let err = graph.start(input).await.unwrap_err();
    assert!(matches!(err, ClinflowError::InvalidInput(_)));
}

#[tokio::test]
async fn test_resume_unknown_run() {
    let graph = graph(Arc::new(FailingBackend::new()), Arc::new(MemoryCheckpointer::new()));
    let err = graph
        .resume(resume(&RunId::from("enc-x-00000000"), Decision::Approve, ""))
        .await
        .unwrap_err();
    assert!(matches!(err, ClinflowError::CheckpointNotFound(_)));
}

#[tokio::test]
async fn test_transition_limit_closes_run() {
    let mut config = test_config();
    config.workflow.max_transitions = 2;
    let backend = Arc::new(full_script(replies::ASSESSMENT_ROUTINE.to_string()));
    let graph = graph_with(&config, backend, Arc::new(MemoryCheckpointer::new()));

    let outcome = graph.start(routine_encounter()).await.unwrap();
    let state = outcome.state();
    assert!(state.complete);
    assert_eq!(state.reasoning.len(), 3);
    assert_eq!(
        state.reasoning.last().map(|r| r.phase),
        Some(RoutingPhase::TransitionLimit)
    );
}

#[tokio::test]
async fn test_spawned_run_streams_progress() {
    let backend = Arc::new(full_script(replies::ASSESSMENT_ROUTINE.to_string()));
    let graph = Arc::new(graph(backend, Arc::new(MemoryCheckpointer::new())));
    let state = clinflow_core::state::WorkflowState::new(routine_encounter()).unwrap();

    let (mut rx, handle) = graph.spawn(state);
    let mut events = Vec::new();
    while let Ok(event) = rx.recv().await {
        events.push(event);
    }
    let outcome = handle.await.unwrap().unwrap();
    assert!(outcome.state().complete);

    assert!(matches!(events.first(), Some(ProgressEvent::RunStarted { .. })));
    assert!(matches!(events.last(), Some(ProgressEvent::RunComplete { steps: 5, .. })));
    let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
    assert!(kinds.contains(&"step_start"));
    assert!(kinds.contains(&"step_complete"));
    assert_eq!(
        kinds.iter().filter(|k| **k == "reasoning").count(),
        outcome.state().reasoning.len()
    );
    assert!(!graph.progress().is_open(outcome.state().run_id()));
}

#[tokio::test]
async fn test_concurrent_resumes_only_one_wins() {
    let scripted = Arc::new(full_script(replies::assessment("EMERGENCY")));
    let store = Arc::new(MemoryCheckpointer::new());
    let graph = graph(Arc::new(SlowBackend(scripted.clone())), store.clone());

    let paused = graph.start(emergency_encounter()).await.unwrap();
    let run_id = paused.state().run_id().clone();

    let (approved, rejected) = tokio::join!(
        graph.resume(resume(&run_id, Decision::Approve, "confirmed")),
        graph.resume(resume(&run_id, Decision::Reject, "patient stable")),
    );
    let (winner, loser) = match (approved, rejected) {
        (Ok(winner), Err(loser)) | (Err(loser), Ok(winner)) => (winner, loser),
        other => panic!("expected exactly one resume to succeed, got {:?}", other),
    };
    assert!(matches!(loser, ClinflowError::NotAwaitingConfirmation { .. }));
    assert!(winner.state().complete);
    assert!(scripted.calls_matching(&task_header(EMERGENCY)) <= 1);

    let entry = store.get(&run_id).unwrap().unwrap();
    assert_eq!(entry.position, CheckpointPosition::Completed);
    let stored = restore(&entry).unwrap();
    assert_eq!(stored.emergency_guidance, winner.state().emergency_guidance);
    assert_eq!(stored.capability_history(), winner.state().capability_history());
}

#[tokio::test]
async fn test_unregistered_steps_route_to_documentation() {
    let mut registry = CapabilityRegistry::new();
    registry.register(SoapNoteCapability);
    let backend = Arc::new(full_script(replies::ASSESSMENT_ROUTINE.to_string()));
    let graph = ClinicalGraph::new(
        &test_config(),
        backend.clone(),
        Arc::new(registry),
        Arc::new(MemoryCheckpointer::new()),
        Arc::new(ProgressBus::default()),
    );

    let outcome = graph.start(routine_encounter()).await.unwrap();
    let state = outcome.state();
    assert!(state.complete);
    assert_eq!(state.capability_history(), vec![DOCUMENTATION]);
    assert!(state.soap_note.is_some());
    assert_eq!(backend.calls_matching(&task_header(ASSESSMENT)), 0);
    assert_eq!(
        state.reasoning.last().map(|r| r.phase),
        Some(RoutingPhase::ValidationOverride)
    );
}
